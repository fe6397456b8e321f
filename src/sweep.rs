//! # Sweep
//!
//! Walks the configured (stride, allocation size) grid strictly in order. For each point the ring is
//! rebuilt in the one shared buffer, the cycle counter is reset to the reduction's sentinel, the
//! probe is launched `outer_iterations` times and the accumulated cycles are normalized into cycles
//! per load. Any failure aborts the whole sweep.
use crate::config::SweepConfig;
use crate::device::{Device, DeviceBuffer, ProbeScratch};
use crate::error::{ConfigError, Result};
use crate::format_size_fixed_int;
use crate::probe::{Probe, ProbeTarget, launch_probe, probe_for};
use crate::profiler::Profiler;
use crate::ring::{RingParams, make_ring};
use crate::sink::RecordSink;
use log::{debug, info, warn};
use std::fmt;

const PROBE_LABEL: &str = "probe";
const RING_LABEL: &str = "ring";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPoint {
    pub stride: usize,
    pub allocation_size: usize,
    pub ring_length: usize,
}

/// One measured point as handed to the output sink
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultRecord {
    pub stride: usize,
    pub allocation_size: usize,
    pub cycles_per_load: f64,
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{:.4}",
            self.stride, self.allocation_size, self.cycles_per_load
        )
    }
}

/// Normalize elapsed cycles into cycles per timed operation
pub fn cycles_per_op(total_cycles: u64, outer_iterations: u64, ops_per_lane: u64, lanes: u64) -> f64 {
    let ops = outer_iterations as f64 * ops_per_lane as f64 * lanes as f64;
    if ops == 0.0 {
        return 0.0;
    }
    total_cycles as f64 / ops
}

/// `total / (outer * ring_length * inner * lanes)`
pub fn cycles_per_load(
    total_cycles: u64,
    outer_iterations: u64,
    ring_length: usize,
    inner_iterations: u64,
    lanes: u64,
) -> f64 {
    cycles_per_op(
        total_cycles,
        outer_iterations,
        ring_length as u64 * inner_iterations,
        lanes,
    )
}

/// Raw outcome of one sweep point, before it is reduced to a record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub point: SweepPoint,
    pub cycles: u64,
    pub loads: f64,
    pub wall_secs: f64,
    pub cycles_per_load: f64,
}

impl Measurement {
    pub fn record(&self) -> ResultRecord {
        ResultRecord {
            stride: self.point.stride,
            allocation_size: self.point.allocation_size,
            cycles_per_load: self.cycles_per_load,
        }
    }
}

pub struct Sweep<'d> {
    config: SweepConfig,
    device: &'d Device,
    probe: Box<dyn Probe>,
    buffer: DeviceBuffer,
    scratch: ProbeScratch,
    profiler: Profiler,
}

impl<'d> Sweep<'d> {
    /// Validate `config` and allocate the buffer for the largest working set once.
    ///
    /// A device that had to shrink its group to fit the host's cores runs the sweep with the
    /// smaller group. Instruction mode never builds a ring and only gets a single line.
    pub fn new(mut config: SweepConfig, device: &'d Device) -> Result<Self> {
        if device.lane_group_size() < config.lane_group_size {
            info!(
                "Device runs groups of {} lanes, sweeping with {} instead of {}",
                device.lane_group_size(),
                device.lane_group_size(),
                config.lane_group_size
            );
            config.lane_group_size = device.lane_group_size();
        }
        config.validate()?;
        if device.lane_group_size() != config.lane_group_size {
            return Err(ConfigError::Invalid(format!(
                "device runs groups of {} lanes but the sweep is configured for {}",
                device.lane_group_size(),
                config.lane_group_size
            ))
            .into());
        }
        let probe = probe_for(&config);
        let bytes = if probe.needs_ring() {
            config.largest_allocation()
        } else {
            config.cache_line_size
        };
        let buffer = device.allocate(bytes)?;

        info!(
            "Measuring {} with {} lanes ({} probe, sync {})",
            config.mode,
            device.lane_group_size(),
            probe.name(),
            config.sync
        );

        Ok(Sweep {
            config,
            device,
            probe,
            buffer,
            scratch: ProbeScratch::new(),
            profiler: Profiler::new(),
        })
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// All points in sweep order: stride outer, doubling allocation size inner. Without a ring
    /// there is nothing to sweep, so instruction mode is a single point over one line.
    pub fn points(&self) -> Vec<SweepPoint> {
        let line = self.config.cache_line_size;
        if !self.probe.needs_ring() {
            return vec![SweepPoint {
                stride: self.config.stride_start,
                allocation_size: line,
                ring_length: 1,
            }];
        }
        self.config
            .strides()
            .flat_map(|stride| {
                self.config
                    .allocation_sizes()
                    .map(move |allocation_size| SweepPoint {
                        stride,
                        allocation_size,
                        ring_length: allocation_size / line,
                    })
            })
            .collect()
    }

    /// Build, probe and normalize a single point
    pub fn run_point(&mut self, point: SweepPoint) -> Result<Measurement> {
        let params = RingParams::new(point.allocation_size, point.stride, self.config.cache_line_size);

        if self.probe.needs_ring() {
            if params.is_degenerate() {
                warn!(
                    "Stride {} shares a factor with {} cache lines, the chain covers only part of {}",
                    point.stride,
                    point.ring_length,
                    format_size_fixed_int(point.allocation_size as u64).trim()
                );
            }
            self.profiler.start();
            make_ring(self.device, &params, &self.buffer, self.config.sync)?;
            self.profiler.stop(RING_LABEL);
        }

        let reduction = self.probe.reduction();
        self.scratch.reset(reduction.identity());

        let target = ProbeTarget::new(&self.buffer, point.ring_length);
        self.profiler.start();
        for _ in 0..self.config.outer_iterations {
            launch_probe(self.device, self.probe.as_ref(), &target, &self.scratch)?;
        }
        let wall = self.profiler.stop(PROBE_LABEL);

        let cycles = self.scratch.cycles();
        debug!("Elapsed Clock Cycles {cycles}");

        let outer = reduction.counted_outer(self.config.outer_iterations);
        let lanes = reduction.counted_lanes(self.device.lane_group_size());
        let ops_per_lane = self.probe.ops_per_lane(point.ring_length);
        let cycles_per_load = cycles_per_op(cycles, outer, ops_per_lane, lanes);
        let loads = outer as f64 * ops_per_lane as f64 * lanes as f64;

        let wall_secs = wall.as_secs_f64();
        if wall_secs > 0.0 {
            // cross-check against the wall clock (includes launch overhead, so only an upper bound)
            let loads_per_sec = loads / wall_secs;
            debug!(
                "Loads = {loads} over {wall_secs:.9}s, wall-clock estimate {:.4} cycles/load",
                self.device.clock_hz() / loads_per_sec
            );
        }

        info!(
            "{} stride {:>3} | {:>10} cache lines | {:>10.4} cycles/load",
            format_size_fixed_int(point.allocation_size as u64),
            point.stride,
            point.ring_length,
            cycles_per_load
        );

        Ok(Measurement {
            point,
            cycles,
            loads,
            wall_secs,
            cycles_per_load,
        })
    }

    /// Run every point in order, handing each result to `sink`
    pub fn run(&mut self, sink: &mut dyn RecordSink) -> Result<Vec<Measurement>> {
        let points = self.points();
        info!("Sweeping {} points", points.len());

        let mut measurements = Vec::with_capacity(points.len());
        for point in points {
            let measurement = self.run_point(point)?;
            sink.record(&measurement.record())?;
            measurements.push(measurement);
        }

        for entry in self.profiler.entries() {
            debug!(
                "Profile '{}': {} calls, {:.6}s total",
                entry.label,
                entry.calls,
                entry.total.as_secs_f64()
            );
        }
        Ok(measurements)
    }
}
