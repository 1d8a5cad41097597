//! Timing sinks.
//!
//! The orchestration code never writes benchmark records itself; it is handed
//! a [`TimingSink`] and reports `(description, milliseconds)` pairs to it.
//! [`CsvLog`] produces the `platform,description,time_ms` benchmark log,
//! [`MemorySink`] collects records for inspection, and [`NullSink`] drops them.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use crate::error::{Error, Result};

pub const CSV_HEADER: &str = "platform,description,time_ms";

pub trait TimingSink {
    fn record(&mut self, description: &str, ms: f64);

    /// Record the wall-clock time elapsed since `start`.
    fn record_since(&mut self, description: &str, start: Instant) {
        self.record(description, start.elapsed().as_secs_f64() * 1000.0);
    }
}

impl<T: TimingSink + ?Sized> TimingSink for &mut T {
    fn record(&mut self, description: &str, ms: f64) {
        (**self).record(description, ms);
    }
}

impl<T: TimingSink + ?Sized> TimingSink for Box<T> {
    fn record(&mut self, description: &str, ms: f64) {
        (**self).record(description, ms);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TimingSink for NullSink {
    fn record(&mut self, _description: &str, _ms: f64) {}
}

#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub records: Vec<(String, f64)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All values recorded under `description`, in arrival order.
    pub fn values(&self, description: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|(d, _)| d == description)
            .map(|(_, ms)| *ms)
            .collect()
    }

    pub fn count(&self, description: &str) -> usize {
        self.records.iter().filter(|(d, _)| d == description).count()
    }
}

impl TimingSink for MemorySink {
    fn record(&mut self, description: &str, ms: f64) {
        self.records.push((description.to_string(), ms));
    }
}

/// Append-only CSV benchmark log.
pub struct CsvLog<W: Write> {
    platform: String,
    out: W,
}

impl CsvLog<BufWriter<File>> {
    /// Open (or create) `path` for appending and write the header line.
    pub fn create(path: &Path, platform: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        CsvLog::new(BufWriter::new(file), platform).map_err(|e| Error::io(path, e))
    }
}

impl<W: Write> CsvLog<W> {
    pub fn new(mut out: W, platform: &str) -> std::io::Result<Self> {
        writeln!(out, "{}", CSV_HEADER)?;
        Ok(Self {
            platform: platform.to_string(),
            out,
        })
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> TimingSink for CsvLog<W> {
    fn record(&mut self, description: &str, ms: f64) {
        tracing::debug!(description, ms, "timing");
        if let Err(err) = writeln!(self.out, "{},{},{:.4}", self.platform, description, ms) {
            tracing::warn!(%err, description, "failed to append benchmark record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_log_writes_header_then_records() {
        let mut log = CsvLog::new(Vec::new(), "wgpu-vulkan").unwrap();
        log.record("kernel compile time", 12.5);
        log.record("kernel exec time", 0.25);
        let text = String::from_utf8(log.into_inner()).unwrap();
        insta::assert_snapshot!(text.trim_end(), @r"
        platform,description,time_ms
        wgpu-vulkan,kernel compile time,12.5000
        wgpu-vulkan,kernel exec time,0.2500
        ");
    }

    #[test]
    fn csv_log_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.csv");
        {
            let mut log = CsvLog::create(&path, "cpu").unwrap();
            log.record("grid load time", 1.0);
        }
        {
            let mut log = CsvLog::create(&path, "cpu").unwrap();
            log.record("grid load time", 2.0);
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().filter(|l| *l == CSV_HEADER).count(), 2);
        assert_eq!(text.lines().filter(|l| l.starts_with("cpu,grid load time,")).count(), 2);
    }

    #[test]
    fn memory_sink_filters_by_description() {
        let mut sink = MemorySink::new();
        sink.record("kernel exec time", 1.0);
        sink.record("total exec time", 3.0);
        sink.record("kernel exec time", 2.0);
        assert_eq!(sink.values("kernel exec time"), vec![1.0, 2.0]);
        assert_eq!(sink.count("total exec time"), 1);
        assert_eq!(sink.count("missing"), 0);
    }

    #[test]
    fn record_since_is_non_negative() {
        let mut sink = MemorySink::new();
        sink.record_since("phase", Instant::now());
        assert!(sink.values("phase")[0] >= 0.0);
    }

    #[test]
    fn sinks_work_through_mutable_references() {
        fn report(sink: &mut dyn TimingSink) {
            sink.record("x", 1.0);
        }
        let mut sink = MemorySink::new();
        report(&mut sink);
        let mut null = NullSink;
        report(&mut null);
        assert_eq!(sink.count("x"), 1);
    }
}
