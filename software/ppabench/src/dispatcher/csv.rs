//! A plain-text CSV data target that streams every tick of a run to disk.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Sender, channel};
use std::thread::{JoinHandle, spawn};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bench::context::BenchCtx;

use super::{Dispatcher, csv_header, csv_row};

/// Writes one row per tick to `<op_dir>/<op_name>.csv`,
/// with a timestamp and wall-clock time ahead of the channel values.
///
/// Writes to disk on a separate thread to avoid delaying the poll loop.
#[derive(Serialize, Deserialize, Debug)]
pub struct CsvDispatcher {
    /// Number of rows between flushes to disk; 0 flushes only at the end of the run
    flush_every: usize,

    #[serde(skip)]
    worker: Option<WorkerHandle>,
}

impl Default for CsvDispatcher {
    fn default() -> Self {
        Self::new(1)
    }
}

impl CsvDispatcher {
    pub fn new(flush_every: usize) -> Self {
        Self {
            flush_every,
            worker: None,
        }
    }

    /// Path of the file written for a given op
    pub fn path(ctx: &BenchCtx) -> PathBuf {
        ctx.op_dir.join(format!("{}.csv", ctx.op_name))
    }
}

#[typetag::serde]
impl Dispatcher for CsvDispatcher {
    fn init(&mut self, ctx: &BenchCtx, channel_names: &[String]) -> Result<(), String> {
        // Shut down any existing worker
        self.terminate()?;

        let header = csv_header(channel_names);
        let filepath = Self::path(ctx);
        info!("Writing run data to {filepath:?}");

        self.worker = Some(WorkerHandle::new(&filepath, &header, self.flush_every)?);

        Ok(())
    }

    fn consume(
        &mut self,
        time: SystemTime,
        timestamp: i64,
        channel_values: Vec<f64>,
    ) -> Result<(), String> {
        match &self.worker {
            Some(worker) => worker
                .tx
                .send((time, timestamp, channel_values))
                .map_err(|_| "CSV writer thread exited early".to_owned()),
            None => Err("Dispatcher must be initialized before consuming data".to_owned()),
        }
    }

    fn terminate(&mut self) -> Result<(), String> {
        match self.worker.take() {
            Some(worker) => worker.join(),
            None => Ok(()),
        }
    }
}

type Row = (SystemTime, i64, Vec<f64>);

#[derive(Debug)]
struct WorkerHandle {
    tx: Sender<Row>,
    thread: JoinHandle<Result<(), String>>,
}

impl WorkerHandle {
    fn new(path: &Path, header: &str, flush_every: usize) -> Result<Self, String> {
        let (tx, rx) = channel::<Row>();

        let file = File::create(path).map_err(|e| format!("Failed to create {path:?}: {e}"))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(header.as_bytes())
            .map_err(|e| format!("Failed to write CSV header: {e}"))?;

        let thread = spawn(move || {
            // Single-line buffer that grows to the longest line seen
            let mut stringbuf = String::new();
            let mut rows: usize = 0;

            // Runs until the sender is dropped
            for (time, timestamp, channel_values) in rx.iter() {
                csv_row(&mut stringbuf, (time, timestamp, &channel_values));
                writer
                    .write_all(stringbuf.as_bytes())
                    .map_err(|e| format!("Failed to write CSV row: {e}"))?;

                rows += 1;
                if flush_every > 0 && rows % flush_every == 0 {
                    writer
                        .flush()
                        .map_err(|e| format!("Failed to flush CSV file: {e}"))?;
                }
            }

            writer
                .flush()
                .map_err(|e| format!("Failed to flush CSV file: {e}"))
        });

        Ok(Self { tx, thread })
    }

    /// Close the channel and wait for the writer to finish
    fn join(self) -> Result<(), String> {
        drop(self.tx);
        self.thread
            .join()
            .map_err(|_| "CSV writer thread panicked".to_owned())?
    }
}
