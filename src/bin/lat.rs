//! Memory-load latency sweep via pointer chasing
//!
//! Builds a ring of pointers at cache-line granularity in one buffer and times a small lane group
//! chasing it, for every working-set size from `LAT_ALLOCATION_START` doubling up to
//! `LAT_ALLOCATION_END`. Results are appended to `lat.csv` (or `LAT_OUTPUT`) as
//! `stride,allocation_size,cycles_per_load`.

use lat_probe_rs::config::SweepConfig;
use lat_probe_rs::device::Device;
use lat_probe_rs::sink::{CsvSink, spawn_writer};
use lat_probe_rs::sweep::Sweep;
use lat_probe_rs::{Error, MIB};
use log::{error, info};
use std::process::ExitCode;

// use faster/smaller `mimalloc` allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Records buffered between the measuring thread and the CSV writer
const WRITER_QUEUE_DEPTH: usize = 64;

fn run(config: SweepConfig, device: &Device) -> Result<usize, Error> {
    let mut sink = spawn_writer(CsvSink::append(&config.output_path)?, WRITER_QUEUE_DEPTH)?;
    let mut sweep = Sweep::new(config, device)?;
    let measured = match sweep.run(&mut sink) {
        Ok(measurements) => measurements.len(),
        // the writer's own error says why it stopped
        Err(Error::WriterClosed) => return sink.finish().and(Err(Error::WriterClosed)),
        Err(e) => return Err(e),
    };
    let written = sink.finish()?;
    info!("Measured {measured} points, wrote {written} records");
    Ok(written)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match SweepConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let device = match Device::new(config.lane_group_size) {
        Ok(device) => device,
        Err(e) => {
            error!("Device initialization failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("Memory Latency Measurement");
    println!("==========================");
    println!("Running on {}", device.description());
    println!(
        "Allocating {} MiB, {} byte lines, strides {}..={}, {} inner x {} outer iterations\n",
        config.largest_allocation() / MIB,
        config.cache_line_size,
        config.stride_start,
        config.stride_end,
        config.inner_iterations,
        config.outer_iterations
    );

    match run(config, &device) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Sweep aborted: {e}");
            ExitCode::FAILURE
        }
    }
}
