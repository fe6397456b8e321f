//! Device cycle counter.
//!
//! On x86_64 this is the time-stamp counter read between `lfence`s so earlier loads have retired
//! before the stamp is taken. On aarch64 it is the virtual counter behind an `isb`. Anything else
//! counts nanoseconds of a monotonic clock.
//!
//! Only the TSC counts (nominal-frequency) core cycles. `cntvct_el0` ticks at the generic timer
//! rate, typically tens of MHz, so one tick spans many loads and results are in timer ticks.
use std::time::{Duration, Instant};

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_cycles() -> u64 {
    use std::arch::x86_64::{_mm_lfence, _rdtsc};
    unsafe {
        _mm_lfence();
        let tsc = _rdtsc();
        _mm_lfence();
        tsc
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn read_cycles() -> u64 {
    let cnt: u64;
    unsafe {
        std::arch::asm!("isb", "mrs {}, cntvct_el0", out(reg) cnt, options(nostack, nomem));
    }
    cnt
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn read_cycles() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Human readable name of the counter backing `read_cycles`, including its unit
pub fn counter_name() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "rdtsc"
    } else if cfg!(target_arch = "aarch64") {
        "cntvct_el0 (fixed-rate timer ticks, not core cycles)"
    } else {
        "monotonic ns (not core cycles)"
    }
}

/// Whether one `read_cycles` unit is one core clock cycle
pub fn counts_core_cycles() -> bool {
    cfg!(target_arch = "x86_64")
}

/// Estimate the counter rate by sampling it across a short sleep
pub fn estimate_frequency_hz(window: Duration) -> f64 {
    let wall = Instant::now();
    let c0 = read_cycles();
    std::thread::sleep(window);
    let c1 = read_cycles();
    let elapsed = wall.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        c1.wrapping_sub(c0) as f64 / elapsed
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotonic() {
        let a = read_cycles();
        let mut x = 0u64;
        for i in 0..10_000u64 {
            x = std::hint::black_box(x.wrapping_add(i));
        }
        let b = read_cycles();
        assert!(b >= a);
    }

    #[test]
    fn counter_name_states_when_units_are_not_cycles() {
        if counts_core_cycles() {
            assert_eq!(counter_name(), "rdtsc");
        } else {
            assert!(counter_name().contains("not core cycles"));
        }
        assert_eq!(counts_core_cycles(), cfg!(target_arch = "x86_64"));
    }

    #[test]
    fn frequency_is_positive() {
        assert!(estimate_frequency_hz(Duration::from_millis(5)) > 0.0);
    }
}
