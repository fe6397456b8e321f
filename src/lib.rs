//! Pointer-chasing memory-latency microbenchmark.
//!
//! A ring of pointers is written into a device buffer one link per cache line, then a small lane
//! group walks it with dependent loads while counting cycles. Sweeping the working-set size exposes
//! the cache, TLB and DRAM latency curve of the device.
pub mod config;
pub mod device;
pub mod error;
pub mod probe;
pub mod profiler;
pub mod reduce;
pub mod ring;
pub mod sink;
pub mod sweep;

pub use error::{ConfigError, DeviceError, Error, Result};

pub const KIB: usize = 1024;
pub const MIB: usize = KIB * KIB;
pub const GIB: usize = KIB * KIB * KIB;

/// Bytes taken by one link of the ring inside a cache line
pub const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// Convert number of bytes to formatted string
pub fn format_size(bytes: f32) -> String {
    const GB: f32 = 1024.0 * 1024.0 * 1024.0;
    const MB: f32 = 1024.0 * 1024.0;
    const KB: f32 = 1024.0;

    if bytes >= GB {
        format!("{:.2} GiB", bytes / GB)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes / MB)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes / KB)
    } else {
        format!("{:.2} B", bytes)
    }
}

/// Convert number of bytes to formatted string for fixed-width integer string
pub fn format_size_fixed_int(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;

    if bytes >= GB {
        format!("{:>4} GiB", bytes / GB)
    } else if bytes >= MB {
        format!("{:>4} MiB", bytes / MB)
    } else if bytes >= KB {
        format!("{:>4} KiB", bytes / KB)
    } else {
        format!("{:>4} B", bytes)
    }
}
