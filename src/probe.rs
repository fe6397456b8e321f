//! # Latency prober
//!
//! A [`Probe`] is the kernel-side strategy run by every lane of a launch. Each lane measures a cycle
//! delta, the group reduces the deltas, and lane 0 folds the group value into the run's
//! [`ProbeScratch`] cycle counter. Two strategies exist: [`PointerChase`] for load-to-use latency
//! over the ring and [`ArithmeticLatency`] for a dependent floating-point chain.
use crate::config::{ProbeMode, SweepConfig, SyncMode};
use crate::device::{Device, DeviceBuffer, Lane, ProbeScratch};
use crate::reduce::Reduction;
use crate::ring::RingParams;
use std::hint::black_box;
use std::sync::atomic::Ordering;

/// Where a probe launch finds its ring
#[derive(Debug, Clone, Copy)]
pub struct ProbeTarget {
    base: usize,
    pub ring_length: usize,
}

impl ProbeTarget {
    /// `buffer` must already hold a ring of `ring_length` links for every lane of the group
    pub fn new(buffer: &DeviceBuffer, ring_length: usize) -> Self {
        ProbeTarget {
            base: buffer.as_ptr() as usize,
            ring_length,
        }
    }

    /// First link of a lane's chain
    fn head(&self, lane: usize) -> *const usize {
        (self.base + RingParams::lane_offset(lane)) as *const usize
    }
}

pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a ring has to be built before launching
    fn needs_ring(&self) -> bool;

    /// How lane deltas, and repeated launches, are combined
    fn reduction(&self) -> Reduction;

    /// Timed operations each lane performs in one launch
    fn ops_per_lane(&self, ring_length: usize) -> u64;

    /// Measure on one lane, returning its elapsed cycles
    fn measure(&self, lane: &Lane, target: &ProbeTarget, scratch: &ProbeScratch) -> u64;

    /// Kernel entry point
    fn run(&self, lane: &Lane, target: &ProbeTarget, scratch: &ProbeScratch) {
        if !lane.in_group() {
            return;
        }

        let delta = self.measure(lane, target, scratch);
        let reduction = self.reduction();
        let group_value = lane.reduce(delta, reduction);

        if lane.id() == 0 {
            // same fold as the group reduction, so a sum saturates instead of wrapping
            let _ = scratch
                .cycles_cell()
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                    Some(reduction.combine(current, group_value))
                });
        }
    }
}

/// Launch `probe` once over the device's lane group and wait for it
pub fn launch_probe(
    device: &Device,
    probe: &dyn Probe,
    target: &ProbeTarget,
    scratch: &ProbeScratch,
) -> Result<(), crate::DeviceError> {
    device.launch(device.lane_group_size(), |lane| probe.run(lane, target, scratch))
}

/// Pick the strategy for the configured mode
pub fn probe_for(config: &SweepConfig) -> Box<dyn Probe> {
    match config.mode {
        ProbeMode::MemoryLatency => Box::new(PointerChase {
            inner_iterations: config.inner_iterations,
            sync: config.sync,
        }),
        ProbeMode::InstructionLatency => Box::new(ArithmeticLatency {
            inner_iterations: config.inner_iterations,
        }),
    }
}

#[inline(always)]
unsafe fn load_link(p: *const usize) -> *const usize {
    unsafe { std::ptr::read_volatile(p) as *const usize }
}

/// Follow the chain `steps` times. Every address comes out of the previous load, so the loads
/// cannot overlap.
#[inline(never)]
unsafe fn chase(mut p: *const usize, steps: u64) -> *const usize {
    unsafe {
        for _ in 0..steps / 8 {
            // Unroll 8x to reduce loop overhead relative to memory latency
            p = load_link(p);
            p = load_link(p);
            p = load_link(p);
            p = load_link(p);
            p = load_link(p);
            p = load_link(p);
            p = load_link(p);
            p = load_link(p);
        }
        for _ in 0..steps % 8 {
            p = load_link(p);
        }
    }
    p
}

/// Dependent-load latency around the ring
#[derive(Debug, Clone, Copy)]
pub struct PointerChase {
    /// Full ring traversals in the timed phase
    pub inner_iterations: u64,
    pub sync: SyncMode,
}

impl Probe for PointerChase {
    fn name(&self) -> &'static str {
        "pointer-chase"
    }

    fn needs_ring(&self) -> bool {
        true
    }

    fn reduction(&self) -> Reduction {
        Reduction::Min
    }

    fn ops_per_lane(&self, ring_length: usize) -> u64 {
        ring_length as u64 * self.inner_iterations
    }

    fn measure(&self, lane: &Lane, target: &ProbeTarget, scratch: &ProbeScratch) -> u64 {
        let head = target.head(lane.id());

        // Warmup: one full cycle to pull the working set into cache and TLB
        let p0 = unsafe { chase(head, target.ring_length as u64) };

        let steps = self.ops_per_lane(target.ring_length);
        let t0 = lane.cycles();
        let p1 = match self.sync {
            SyncMode::Disjoint => unsafe { chase(head, steps) },
            SyncMode::Lockstep => {
                let mut p = head;
                for _ in 0..steps {
                    p = unsafe { load_link(p) };
                    lane.barrier();
                }
                p
            }
        };
        let elapsed = lane.cycles().wrapping_sub(t0);

        // Prevent dead code elimination
        let dummy = unsafe { (*(p0 as *const u8)).wrapping_add(*(p1 as *const u8)) };
        scratch.write_dummy(dummy);

        elapsed
    }
}

/// Floating-point operations in one iteration of the arithmetic chain
pub const OPS_PER_ITERATION: u64 = 5;

/// Latency of a dependent floating-point chain, no memory traffic
#[derive(Debug, Clone, Copy)]
pub struct ArithmeticLatency {
    pub inner_iterations: u64,
}

impl Probe for ArithmeticLatency {
    fn name(&self) -> &'static str {
        "arithmetic"
    }

    fn needs_ring(&self) -> bool {
        false
    }

    fn reduction(&self) -> Reduction {
        Reduction::Sum
    }

    fn ops_per_lane(&self, _ring_length: usize) -> u64 {
        self.inner_iterations * OPS_PER_ITERATION
    }

    fn measure(&self, lane: &Lane, _target: &ProbeTarget, scratch: &ProbeScratch) -> u64 {
        let t0 = lane.cycles();

        let mut a = black_box(0.9999f32);
        for _ in 0..self.inner_iterations {
            a += 0.99991;
            a *= 0.9991;
            a += a * 0.999991;
            a = a.sqrt();
            a /= 0.999991;
            a = black_box(a);
        }

        let elapsed = lane.cycles().wrapping_sub(t0);
        scratch.write_dummy(a as u8);
        elapsed
    }
}
