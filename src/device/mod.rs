//! # Device
//!
//! A lane-group executor on the host CPU. Each lane of a launch is an OS thread pinned to its own
//! core and raised to maximum priority; a launch returns only after every lane has finished, which
//! gives the host the synchronous launch-and-wait it needs between ring construction, probing and
//! reading back the cycle counter.
//!
//! Kernels are plain closures receiving a [`Lane`]. Memory is handed out as [`DeviceBuffer`]s,
//! which kernels address by raw pointer so the ring is a chain of real machine addresses.
mod buffer;
pub mod clock;
mod lane;

pub use buffer::{DeviceBuffer, ProbeScratch};
pub use lane::Lane;

use crate::error::DeviceError;
use lane::{GroupState, LaneAborted};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

/// Alignment of every device allocation
pub const ALLOCATION_ALIGN: usize = 4096;

pub struct Device {
    lane_group_size: usize,
    core_ids: Vec<core_affinity::CoreId>,
    clock_hz: f64,
    /// Set after the first pin/priority failure so later launches only log at debug level
    setup_warned: AtomicBool,
}

impl Device {
    /// Bring up a device for groups of up to `lane_group_size` lanes, one lane per CPU core
    pub fn new(lane_group_size: usize) -> Result<Self, DeviceError> {
        match core_affinity::get_core_ids() {
            Some(core_ids) if !core_ids.is_empty() => Self::with_cores(lane_group_size, core_ids),
            _ => {
                warn!("Couldn't enumerate CPU cores, lanes will run unpinned");
                let cpus = thread::available_parallelism().map_or(1, |n| n.get());
                Self::build(lane_group_size, Vec::new(), cpus)
            }
        }
    }

    /// Like `new`, but lanes are placed on `core_ids` only
    pub fn with_cores(
        lane_group_size: usize,
        core_ids: Vec<core_affinity::CoreId>,
    ) -> Result<Self, DeviceError> {
        if core_ids.is_empty() {
            return Err(DeviceError::NoDevice("no CPU cores to place lanes on".to_string()));
        }
        let cores = core_ids.len();
        Self::build(lane_group_size, core_ids, cores)
    }

    fn build(
        requested: usize,
        core_ids: Vec<core_affinity::CoreId>,
        cores: usize,
    ) -> Result<Self, DeviceError> {
        if requested == 0 {
            return Err(DeviceError::NoDevice(
                "a lane group needs at least one lane".to_string(),
            ));
        }

        // a lane sharing its core gets descheduled inside the timed window
        let lane_group_size = requested.min(cores);
        if lane_group_size < requested {
            warn!(
                "{} lanes requested but only {} cores available, running a group of {} lanes",
                requested, cores, lane_group_size
            );
        }

        let clock_hz = clock::estimate_frequency_hz(Duration::from_millis(20));
        if clock_hz <= 0.0 {
            return Err(DeviceError::NoDevice(format!(
                "cycle counter '{}' is not advancing",
                clock::counter_name()
            )));
        }
        debug!(
            "Cycle counter '{}' runs at ~{:.3} GHz",
            clock::counter_name(),
            clock_hz / 1e9
        );
        if !clock::counts_core_cycles() {
            warn!(
                "Cycle counter is {}, cycles/load is reported in counter units",
                clock::counter_name()
            );
        }

        Ok(Device {
            lane_group_size,
            core_ids,
            clock_hz,
            setup_warned: AtomicBool::new(false),
        })
    }

    pub fn lane_group_size(&self) -> usize {
        self.lane_group_size
    }

    /// Estimated rate of the cycle counter
    pub fn clock_hz(&self) -> f64 {
        self.clock_hz
    }

    pub fn description(&self) -> String {
        format!(
            "host lane group ({} lanes over {} cores, {} counter @ {:.3} GHz)",
            self.lane_group_size,
            self.core_ids.len(),
            clock::counter_name(),
            self.clock_hz / 1e9
        )
    }

    /// Cache-line (page) aligned, zeroed allocation
    pub fn allocate(&self, bytes: usize) -> Result<DeviceBuffer, DeviceError> {
        let buffer = DeviceBuffer::allocate(bytes, ALLOCATION_ALIGN)?;
        info!("Allocating {}", crate::format_size(bytes as f32));
        Ok(buffer)
    }

    /// Release a buffer. Dropping it has the same effect.
    pub fn free(&self, buffer: DeviceBuffer) {
        drop(buffer);
    }

    /// Run `kernel` on `global_lanes` lanes and wait for all of them. The first
    /// `min(global_lanes, lane_group_size)` lanes form the group; the rest are out of range.
    ///
    /// Lanes are held at a start latch until all of them exist, so a failed spawn cancels the
    /// launch before any kernel runs. A panicking lane aborts the group barrier, releasing the
    /// lanes blocked on it, and is reported as `LanePanicked`.
    pub fn launch<K>(&self, global_lanes: usize, kernel: K) -> Result<(), DeviceError>
    where
        K: Fn(&Lane) + Sync,
    {
        let group = GroupState::new(global_lanes.min(self.lane_group_size));
        let kernel = &kernel;
        let group = &group;

        thread::scope(|s| -> Result<(), DeviceError> {
            let mut handles = Vec::with_capacity(global_lanes);
            for id in 0..global_lanes {
                let core = self.core_for(id);
                let spawned = thread::Builder::new()
                    .name(format!("lane-{id}"))
                    .spawn_scoped(s, move || -> bool {
                        if !group.wait_start() {
                            return true;
                        }
                        self.prepare_lane_thread(id, core);
                        let lane = Lane::new(id, group);
                        match panic::catch_unwind(AssertUnwindSafe(|| kernel(&lane))) {
                            Ok(()) => true,
                            Err(payload) => {
                                group.abort();
                                // lanes unwound by the abort are not the failing lane
                                payload.is::<LaneAborted>()
                            }
                        }
                    });
                match spawned {
                    Ok(handle) => handles.push((id, handle)),
                    Err(source) => {
                        group.release(false);
                        return Err(DeviceError::Launch { lane: id, source });
                    }
                }
            }
            group.release(true);

            let mut failed = None;
            for (id, handle) in handles {
                let clean = handle.join().unwrap_or(false);
                if !clean && failed.is_none() {
                    failed = Some(id);
                }
            }
            match failed {
                Some(id) => Err(DeviceError::LanePanicked(id)),
                None => Ok(()),
            }
        })
    }

    fn core_for(&self, lane: usize) -> Option<core_affinity::CoreId> {
        if self.core_ids.is_empty() {
            None
        } else {
            Some(self.core_ids[lane % self.core_ids.len()])
        }
    }

    fn prepare_lane_thread(&self, lane: usize, core: Option<core_affinity::CoreId>) {
        if let Some(core) = core {
            if !core_affinity::set_for_current(core) {
                self.setup_failed(format!(
                    "Couldn't pin lane {} to CPU core {} (NOTE: this is expected on macOS)",
                    lane, core.id
                ));
            }
        }

        if thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
            .is_err()
        {
            self.setup_failed(format!("Couldn't set lane {lane} to maximum thread priority"));
        }
    }

    fn setup_failed(&self, msg: String) {
        if self.setup_warned.swap(true, Ordering::Relaxed) {
            debug!("{msg}");
        } else {
            warn!("{msg} (further lane setup failures are logged at debug level)");
        }
    }
}

/// Device over `lanes` core ids, so test groups keep their size on hosts with fewer cores
#[cfg(test)]
pub(crate) fn test_device(lanes: usize) -> Device {
    let cores = (0..lanes).map(|id| core_affinity::CoreId { id }).collect();
    Device::with_cores(lanes, cores).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::Reduction;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    #[test]
    fn empty_group_is_not_a_device() {
        assert!(matches!(Device::new(0), Err(DeviceError::NoDevice(_))));
        assert!(matches!(
            Device::with_cores(4, Vec::new()),
            Err(DeviceError::NoDevice(_))
        ));
    }

    #[test]
    fn group_is_capped_at_the_core_count() {
        let cores = vec![core_affinity::CoreId { id: 0 }, core_affinity::CoreId { id: 1 }];
        let device = Device::with_cores(16, cores).unwrap();
        assert_eq!(device.lane_group_size(), 2);

        let host_cores = core_affinity::get_core_ids()
            .filter(|ids| !ids.is_empty())
            .map_or_else(
                || thread::available_parallelism().map_or(1, |n| n.get()),
                |ids| ids.len(),
            );
        let device = Device::new(1024).unwrap();
        assert!(device.lane_group_size() <= host_cores);
        assert!(device.lane_group_size() >= 1);
    }

    #[test]
    fn allocations_are_aligned_and_freed() {
        let device = test_device(1);
        let buffer = device.allocate(3 * 128).unwrap();
        assert_eq!(buffer.len(), 384);
        assert_eq!(buffer.as_ptr() as usize % ALLOCATION_ALIGN, 0);
        device.free(buffer);
    }

    #[test]
    fn launch_runs_every_lane_once() {
        let device = test_device(4);
        let ran = AtomicUsize::new(0);
        device
            .launch(4, |lane| {
                assert!(lane.in_group());
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn lanes_beyond_the_group_return_early() {
        let device = test_device(2);
        let writes = Mutex::new(Vec::new());
        device
            .launch(5, |lane| {
                if !lane.in_group() {
                    return;
                }
                writes.lock().unwrap().push(lane.id());
            })
            .unwrap();
        let mut writes = writes.into_inner().unwrap();
        writes.sort();
        assert_eq!(writes, vec![0, 1]);
    }

    #[test]
    fn barrier_orders_writes_before_reads() {
        let device = test_device(4);
        let slots: Vec<AtomicU64> = (0..4).map(|_| AtomicU64::new(0)).collect();
        let seen = AtomicU64::new(0);
        device
            .launch(4, |lane| {
                slots[lane.id()].store(lane.id() as u64 + 1, Ordering::Relaxed);
                lane.barrier();
                let neighbour = (lane.id() + 1) % 4;
                seen.fetch_add(slots[neighbour].load(Ordering::Relaxed), Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1 + 2 + 3 + 4);
    }

    #[test]
    fn group_reduction_lands_on_lane_zero() {
        let device = test_device(4);
        let deltas = [120u64, 95, 150, 95];
        let min = AtomicU64::new(0);
        let sum = AtomicU64::new(0);
        device
            .launch(4, |lane| {
                let m = lane.reduce(deltas[lane.id()], Reduction::Min);
                let s = lane.reduce(deltas[lane.id()], Reduction::Sum);
                if lane.id() == 0 {
                    min.store(m, Ordering::SeqCst);
                    sum.store(s, Ordering::SeqCst);
                }
            })
            .unwrap();
        assert_eq!(min.load(Ordering::SeqCst), 95);
        assert_eq!(sum.load(Ordering::SeqCst), 460);
    }

    #[test]
    fn panicking_lane_is_reported() {
        let device = test_device(1);
        let err = device.launch(1, |_| panic!("boom")).unwrap_err();
        assert!(matches!(err, DeviceError::LanePanicked(0)));
    }

    #[test]
    fn panic_releases_lanes_blocked_on_the_barrier() {
        let device = test_device(2);
        let err = device
            .launch(2, |lane| {
                if lane.id() == 1 {
                    panic!("lane 1 fails before the barrier");
                }
                lane.barrier();
            })
            .unwrap_err();
        assert!(matches!(err, DeviceError::LanePanicked(1)));
    }

    #[test]
    fn panic_inside_a_reduction_is_reported() {
        let device = test_device(4);
        let err = device
            .launch(4, |lane| {
                if lane.id() == 3 {
                    panic!("lane 3 never joins the reduction");
                }
                lane.reduce(lane.id() as u64, Reduction::Min);
            })
            .unwrap_err();
        assert!(matches!(err, DeviceError::LanePanicked(3)));
    }

    #[test]
    fn device_is_reusable_after_a_failed_launch() {
        let device = test_device(2);
        assert!(device.launch(2, |_| panic!("first launch fails")).is_err());
        let ran = AtomicUsize::new(0);
        device
            .launch(2, |lane| {
                lane.barrier();
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
