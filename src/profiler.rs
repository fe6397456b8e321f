//! Host-side wall-clock profiling of labelled regions.
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEntry {
    pub label: String,
    pub total: Duration,
    pub calls: u64,
}

#[derive(Debug, Default)]
pub struct Profiler {
    entries: Vec<ProfileEntry>,
    started: Option<Instant>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Close the region opened by `start`, charge it to `label` and return its length.
    /// Without a matching `start` nothing is recorded.
    pub fn stop(&mut self, label: &str) -> Duration {
        let Some(started) = self.started.take() else {
            return Duration::ZERO;
        };
        let elapsed = started.elapsed();

        match self.entries.iter_mut().find(|e| e.label == label) {
            Some(entry) => {
                entry.total += elapsed;
                entry.calls += 1;
            }
            None => self.entries.push(ProfileEntry {
                label: label.to_string(),
                total: elapsed,
                calls: 1,
            }),
        }
        elapsed
    }

    pub fn entry(&self, label: &str) -> Option<&ProfileEntry> {
        self.entries.iter().find(|e| e.label == label)
    }

    pub fn entries(&self) -> &[ProfileEntry] {
        &self.entries
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_accumulate_per_label() {
        let mut profiler = Profiler::new();
        profiler.start();
        std::thread::sleep(Duration::from_millis(2));
        let first = profiler.stop("probe");
        profiler.start();
        let second = profiler.stop("probe");
        profiler.start();
        profiler.stop("ring");

        let probe = profiler.entry("probe").unwrap();
        assert_eq!(probe.calls, 2);
        assert_eq!(probe.total, first + second);
        assert!(first >= Duration::from_millis(2));
        assert_eq!(profiler.entries().len(), 2);
    }

    #[test]
    fn stop_without_start_records_nothing() {
        let mut profiler = Profiler::new();
        assert_eq!(profiler.stop("probe"), Duration::ZERO);
        assert!(profiler.entries().is_empty());

        profiler.start();
        profiler.stop("probe");
        profiler.reset();
        assert!(profiler.entry("probe").is_none());
    }
}
