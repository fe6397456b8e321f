//! # Sweep configuration
//!
//! Compile-time defaults for the latency sweep, optionally overridden through `LAT_*` environment
//! variables. The binary takes no command line arguments; everything it needs lives here.
use crate::error::ConfigError;
use crate::{GIB, POINTER_SIZE};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const CACHE_LINE_LENGTH: usize = 128;
pub const STRIDE_START: usize = 5;
pub const STRIDE_END: usize = 5;
pub const ALLOCATION_START: usize = 512;
pub const ALLOCATION_END: usize = 4 * GIB;
pub const NINNER_ITERS: u64 = 10;
pub const NOUTER_ITERS: u64 = 1;
pub const SIMD_SIZE: usize = 16;
pub const OUTPUT_PATH: &str = "lat.csv";

/// Which quantity the probe kernel measures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Dependent loads around a pointer ring
    MemoryLatency,
    /// Dependent floating-point operations, no memory traffic
    InstructionLatency,
}

impl FromStr for ProbeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" | "load" => Ok(ProbeMode::MemoryLatency),
            "instruction" | "inst" | "alu" => Ok(ProbeMode::InstructionLatency),
            other => Err(format!("unknown probe mode '{other}'")),
        }
    }
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeMode::MemoryLatency => write!(f, "memory-load latency"),
            ProbeMode::InstructionLatency => write!(f, "instruction latency"),
        }
    }
}

/// Lane synchronization inside the ring builder and the timed chase.
///
/// `Disjoint` lanes walk separate pointer-sized slots of each line and never wait on each other.
/// `Lockstep` lanes hit a group barrier after every chain step, so the measured quantity includes
/// the barrier cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Disjoint,
    Lockstep,
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disjoint" | "none" => Ok(SyncMode::Disjoint),
            "lockstep" | "barrier" => Ok(SyncMode::Lockstep),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Disjoint => write!(f, "disjoint (no barrier)"),
            SyncMode::Lockstep => write!(f, "lockstep (barrier per step)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    /// Ring granularity in bytes
    pub cache_line_size: usize,
    pub stride_start: usize,
    pub stride_end: usize,
    /// First working-set size, doubled until it exceeds `allocation_end`
    pub allocation_start: usize,
    pub allocation_end: usize,
    /// Full ring traversals per timed phase
    pub inner_iterations: u64,
    /// Probe launches per sweep point
    pub outer_iterations: u64,
    pub lane_group_size: usize,
    pub mode: ProbeMode,
    pub sync: SyncMode,
    pub output_path: PathBuf,
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            cache_line_size: CACHE_LINE_LENGTH,
            stride_start: STRIDE_START,
            stride_end: STRIDE_END,
            allocation_start: ALLOCATION_START,
            allocation_end: ALLOCATION_END,
            inner_iterations: NINNER_ITERS,
            outer_iterations: NOUTER_ITERS,
            lane_group_size: SIMD_SIZE,
            mode: ProbeMode::MemoryLatency,
            sync: SyncMode::Disjoint,
            output_path: PathBuf::from(OUTPUT_PATH),
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Parse {
                key: key.to_string(),
                value: value.clone(),
                reason: e.to_string(),
            }),
    }
}

impl SweepConfig {
    /// Defaults overlaid with any `LAT_*` variables present in the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each `LAT_*` key, then validated
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = SweepConfig::default();

        if let Some(v) = parse_var(&lookup, "LAT_CACHE_LINE")? {
            cfg.cache_line_size = v;
        }
        if let Some(v) = parse_var(&lookup, "LAT_STRIDE_START")? {
            cfg.stride_start = v;
        }
        if let Some(v) = parse_var(&lookup, "LAT_STRIDE_END")? {
            cfg.stride_end = v;
        }
        if let Some(v) = parse_var(&lookup, "LAT_ALLOCATION_START")? {
            cfg.allocation_start = v;
        }
        if let Some(v) = parse_var(&lookup, "LAT_ALLOCATION_END")? {
            cfg.allocation_end = v;
        }
        if let Some(v) = parse_var(&lookup, "LAT_INNER_ITERS")? {
            cfg.inner_iterations = v;
        }
        if let Some(v) = parse_var(&lookup, "LAT_OUTER_ITERS")? {
            cfg.outer_iterations = v;
        }
        if let Some(v) = parse_var(&lookup, "LAT_LANES")? {
            cfg.lane_group_size = v;
        }
        if let Some(v) = parse_var(&lookup, "LAT_MODE")? {
            cfg.mode = v;
        }
        if let Some(v) = parse_var(&lookup, "LAT_SYNC")? {
            cfg.sync = v;
        }
        if let Some(v) = lookup("LAT_OUTPUT") {
            cfg.output_path = PathBuf::from(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !self.cache_line_size.is_power_of_two() || self.cache_line_size < POINTER_SIZE {
            return invalid(format!(
                "cache line size {} must be a power of two of at least {} bytes",
                self.cache_line_size, POINTER_SIZE
            ));
        }
        if self.lane_group_size == 0 {
            return invalid("lane group size must be at least 1".to_string());
        }
        if self.lane_group_size * POINTER_SIZE > self.cache_line_size {
            return invalid(format!(
                "{} lanes of {} byte pointers do not fit in a {} byte cache line",
                self.lane_group_size, POINTER_SIZE, self.cache_line_size
            ));
        }
        if self.inner_iterations == 0 || self.outer_iterations == 0 {
            return invalid("inner and outer iteration counts must be at least 1".to_string());
        }
        if self.stride_start == 0 || self.stride_start > self.stride_end {
            return invalid(format!(
                "stride range [{}, {}] must be non-empty and start at 1 or more",
                self.stride_start, self.stride_end
            ));
        }
        if self.allocation_start == 0 || self.allocation_start % self.cache_line_size != 0 {
            return invalid(format!(
                "allocation start {} must be a positive multiple of the {} byte cache line",
                self.allocation_start, self.cache_line_size
            ));
        }
        if self.allocation_start > self.allocation_end {
            return invalid(format!(
                "allocation range [{}, {}] is empty",
                self.allocation_start, self.allocation_end
            ));
        }
        Ok(())
    }

    /// Outer sweep dimension
    pub fn strides(&self) -> impl Iterator<Item = usize> + use<> {
        self.stride_start..=self.stride_end
    }

    /// Inner sweep dimension: geometric doubling from `allocation_start` up to `allocation_end`
    pub fn allocation_sizes(&self) -> impl Iterator<Item = usize> + use<> {
        let end = self.allocation_end;
        std::iter::successors(Some(self.allocation_start), |size| size.checked_mul(2))
            .take_while(move |size| *size <= end)
    }

    /// Largest working set actually visited, which is what the device buffer has to hold
    pub fn largest_allocation(&self) -> usize {
        self.allocation_sizes().last().unwrap_or(self.allocation_start)
    }
}
