//! # Result sinks
//!
//! One `stride,allocation_size,cycles_per_load` line per sweep point. The measuring thread hands
//! records to a [`QueuedSink`], which passes them over a bounded SPSC queue to a writer thread that
//! owns the real sink, so file I/O never lands between two probe launches.
use crate::error::{Error, Result};
use crate::sweep::ResultRecord;
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Append-only consumer of sweep results
pub trait RecordSink {
    fn record(&mut self, record: &ResultRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// CSV lines without a header, e.g. `5,512,120.0000`
pub struct CsvSink<W: Write = File> {
    writer: csv::Writer<W>,
}

impl CsvSink<File> {
    /// Open `path` for appending, creating it if needed
    pub fn append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Appending results to {}", path.display());
        Ok(Self::from_writer(file))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn from_writer(inner: W) -> Self {
        CsvSink {
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(inner),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))
    }
}

impl<W: Write> RecordSink for CsvSink<W> {
    fn record(&mut self, record: &ResultRecord) -> Result<()> {
        self.writer.write_record([
            record.stride.to_string(),
            record.allocation_size.to_string(),
            format!("{:.4}", record.cycles_per_load),
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Collects records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<ResultRecord>,
}

impl RecordSink for MemorySink {
    fn record(&mut self, record: &ResultRecord) -> Result<()> {
        self.records.push(*record);
        Ok(())
    }
}

/// Producer end of the writer-thread queue
pub struct QueuedSink {
    producer: rtrb::Producer<ResultRecord>,
    handle: thread::JoinHandle<Result<usize>>,
}

/// Move `sink` onto a named writer thread fed through a queue of `capacity` records
pub fn spawn_writer<S>(mut sink: S, capacity: usize) -> Result<QueuedSink>
where
    S: RecordSink + Send + 'static,
{
    let (producer, mut consumer) = rtrb::RingBuffer::<ResultRecord>::new(capacity.max(1));

    let handle = thread::Builder::new()
        .name("lat-writer".to_string())
        .spawn(move || -> Result<usize> {
            let mut written = 0;
            loop {
                match consumer.pop() {
                    Ok(record) => {
                        sink.record(&record)?;
                        written += 1;
                    }
                    Err(_) if consumer.is_abandoned() => {
                        // producer gone, drain whatever it pushed last
                        while let Ok(record) = consumer.pop() {
                            sink.record(&record)?;
                            written += 1;
                        }
                        break;
                    }
                    Err(_) => thread::sleep(Duration::from_micros(200)),
                }
            }
            sink.flush()?;
            debug!("Writer thread stored {written} records");
            Ok(written)
        })?;

    Ok(QueuedSink { producer, handle })
}

impl QueuedSink {
    /// Close the queue, wait for the writer to drain it and return how many records it stored
    pub fn finish(self) -> Result<usize> {
        let QueuedSink { producer, handle } = self;
        drop(producer);
        handle.join().map_err(|_| Error::WriterClosed)?
    }
}

impl QueuedSink {
    /// The writer only exits early when its sink failed; `finish` returns that error
    fn writer_alive(&self) -> Result<()> {
        if self.producer.is_abandoned() || self.handle.is_finished() {
            Err(Error::WriterClosed)
        } else {
            Ok(())
        }
    }
}

impl RecordSink for QueuedSink {
    fn record(&mut self, record: &ResultRecord) -> Result<()> {
        self.writer_alive()?;
        let mut pending = *record;
        loop {
            match self.producer.push(pending) {
                Ok(()) => return Ok(()),
                Err(rtrb::PushError::Full(back)) => {
                    self.writer_alive()?;
                    pending = back;
                    thread::yield_now();
                }
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.writer_alive()
    }
}
