//! Per-lane execution context handed to kernels.
use super::clock;
use crate::reduce::{Reduction, first_offset};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Unwind payload raised in lanes blocked on a barrier when the launch is aborted
pub(crate) struct LaneAborted;

#[derive(Debug, Default)]
struct LaunchSync {
    /// `None` until the host releases (`Some(true)`) or cancels (`Some(false)`) the launch
    started: Option<bool>,
    aborted: bool,
    arrived: usize,
    generation: u64,
}

/// State shared by the lanes of one group for the duration of one launch
pub(crate) struct GroupState {
    size: usize,
    sync: Mutex<LaunchSync>,
    wake: Condvar,
    /// One exchange slot per lane, used by the shuffle-down reduction
    slots: Vec<AtomicU64>,
}

impl GroupState {
    pub(crate) fn new(size: usize) -> Self {
        GroupState {
            size,
            sync: Mutex::new(LaunchSync::default()),
            wake: Condvar::new(),
            slots: (0..size).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LaunchSync> {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the start latch. With `run == false` every waiting lane leaves without running.
    pub(crate) fn release(&self, run: bool) {
        self.lock().started = Some(run);
        self.wake.notify_all();
    }

    /// Fail every current and future barrier wait of this launch
    pub(crate) fn abort(&self) {
        self.lock().aborted = true;
        self.wake.notify_all();
    }

    /// Block until the host releases the launch; false if it was cancelled or aborted
    pub(crate) fn wait_start(&self) -> bool {
        let mut sync = self.lock();
        while sync.started.is_none() && !sync.aborted {
            sync = self.wake.wait(sync).unwrap_or_else(PoisonError::into_inner);
        }
        sync.started == Some(true) && !sync.aborted
    }

    /// Generation barrier over the group; `Err` once the launch is aborted
    fn barrier(&self) -> Result<(), LaneAborted> {
        let mut sync = self.lock();
        if sync.aborted {
            return Err(LaneAborted);
        }

        let generation = sync.generation;
        sync.arrived += 1;
        if sync.arrived >= self.size {
            sync.arrived = 0;
            sync.generation += 1;
            self.wake.notify_all();
            return Ok(());
        }

        while sync.generation == generation && !sync.aborted {
            sync = self.wake.wait(sync).unwrap_or_else(PoisonError::into_inner);
        }
        if sync.generation == generation {
            Err(LaneAborted)
        } else {
            Ok(())
        }
    }
}

/// A lane of a launched kernel. Lanes with `id() >= group_size()` are outside the group: they
/// must return without touching memory and must never call `barrier` or `reduce`.
pub struct Lane<'g> {
    id: usize,
    group: &'g GroupState,
}

impl<'g> Lane<'g> {
    pub(crate) fn new(id: usize, group: &'g GroupState) -> Self {
        Lane { id, group }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn group_size(&self) -> usize {
        self.group.size
    }

    pub fn in_group(&self) -> bool {
        self.id < self.group.size
    }

    /// Block until every lane of the group has arrived. If another lane of the launch failed,
    /// this unwinds the calling lane instead of waiting forever.
    #[inline]
    pub fn barrier(&self) {
        if let Err(aborted) = self.group.barrier() {
            std::panic::resume_unwind(Box::new(aborted));
        }
    }

    /// Device cycle counter
    #[inline(always)]
    pub fn cycles(&self) -> u64 {
        clock::read_cycles()
    }

    /// Collective reduction over the group. Every lane of the group must call this; the
    /// returned value is the group result on lane 0 and a partial result elsewhere.
    pub fn reduce(&self, value: u64, reduction: Reduction) -> u64 {
        let slots = &self.group.slots;
        let size = self.group.size;
        slots[self.id].store(value, Ordering::Relaxed);

        let mut acc = value;
        let mut offset = first_offset(size);
        while offset > 0 {
            // publish previous round
            self.barrier();
            let other = (self.id + offset < size)
                .then(|| slots[self.id + offset].load(Ordering::Relaxed));
            // everyone has read before anyone overwrites
            self.barrier();
            if let Some(other) = other {
                acc = reduction.combine(acc, other);
                slots[self.id].store(acc, Ordering::Relaxed);
            }
            offset /= 2;
        }
        acc
    }
}
