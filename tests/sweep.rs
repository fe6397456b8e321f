use lat_probe_rs::config::SweepConfig;
use lat_probe_rs::device::Device;
use lat_probe_rs::sink::{CsvSink, MemorySink, spawn_writer};
use lat_probe_rs::sweep::{Sweep, SweepPoint};
use lat_probe_rs::{KIB, MIB};

/// Device over `lanes` core ids, so the group keeps its size on small hosts
fn fixed_device(lanes: usize) -> Device {
    let cores = (0..lanes).map(|id| core_affinity::CoreId { id }).collect();
    Device::with_cores(lanes, cores).unwrap()
}

#[test]
fn sweep_writes_one_csv_line_per_point() {
    let path = std::env::temp_dir().join(format!("lat-e2e-{}.csv", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let config = SweepConfig {
        allocation_start: 512,
        allocation_end: 16 * KIB,
        inner_iterations: 4,
        lane_group_size: 4,
        output_path: path.clone(),
        ..SweepConfig::default()
    };
    let device = fixed_device(config.lane_group_size);

    let mut sink = spawn_writer(CsvSink::append(&config.output_path).unwrap(), 4).unwrap();
    let mut sweep = Sweep::new(config, &device).unwrap();
    let measurements = sweep.run(&mut sink).unwrap();
    assert_eq!(sink.finish().unwrap(), measurements.len());

    let contents = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 6);
    for (line, size) in lines.iter().zip([512, 1024, 2048, 4096, 8192, 16384]) {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], "5");
        assert_eq!(fields[1], size.to_string());
        let decimals = fields[2].split('.').nth(1).unwrap();
        assert_eq!(decimals.len(), 4);
        assert!(fields[2].parse::<f64>().unwrap() > 0.0);
    }
}

#[test]
fn dram_sized_working_set_is_not_faster_than_l1() {
    let config = SweepConfig {
        allocation_start: 512,
        allocation_end: 256 * MIB,
        inner_iterations: 1,
        lane_group_size: 1,
        ..SweepConfig::default()
    };
    let device = fixed_device(1);
    let mut sweep = Sweep::new(config, &device).unwrap();

    // prime with a few repetitions of the small point and keep the best one
    let small = SweepPoint {
        stride: 5,
        allocation_size: 4 * KIB,
        ring_length: 4 * KIB / 128,
    };
    let l1 = (0..5)
        .map(|_| sweep.run_point(small).unwrap().cycles_per_load)
        .fold(f64::INFINITY, f64::min);

    let large = SweepPoint {
        stride: 5,
        allocation_size: 256 * MIB,
        ring_length: 256 * MIB / 128,
    };
    let dram = sweep.run_point(large).unwrap().cycles_per_load;

    assert!(
        dram >= l1 * 0.9,
        "256 MiB chase at {dram:.2} cycles/load beat 4 KiB at {l1:.2}"
    );
}

#[test]
fn sweep_records_match_sink_contents() {
    let config = SweepConfig {
        allocation_start: 1024,
        allocation_end: 4 * KIB,
        lane_group_size: 2,
        ..SweepConfig::default()
    };
    let device = fixed_device(2);
    let mut sweep = Sweep::new(config, &device).unwrap();
    let mut sink = MemorySink::default();
    let measurements = sweep.run(&mut sink).unwrap();

    let sizes: Vec<usize> = sink.records.iter().map(|r| r.allocation_size).collect();
    assert_eq!(sizes, vec![1024, 2048, 4096]);
    assert!(measurements.iter().all(|m| m.point.ring_length * 128 == m.point.allocation_size));
}

#[test]
fn device_group_larger_than_configured_is_rejected() {
    let device = fixed_device(4);
    let config = SweepConfig {
        allocation_end: 4 * KIB,
        lane_group_size: 2,
        ..SweepConfig::default()
    };
    assert!(Sweep::new(config, &device).is_err());
}

#[test]
fn oversubscribed_group_runs_on_available_cores() {
    let config = SweepConfig {
        allocation_end: 2 * KIB,
        inner_iterations: 1,
        lane_group_size: 16,
        ..SweepConfig::default()
    };
    let device = Device::new(config.lane_group_size).unwrap();
    let cores = core_affinity::get_core_ids().map_or(0, |ids| ids.len());
    if cores > 0 {
        assert!(device.lane_group_size() <= cores);
    }

    let mut sweep = Sweep::new(config, &device).unwrap();
    assert_eq!(sweep.config().lane_group_size, device.lane_group_size());
    let mut sink = MemorySink::default();
    assert_eq!(sweep.run(&mut sink).unwrap().len(), 3);
}
