//! Dispatchers send each tick's data to an outside consumer while a run is in progress

use std::time::SystemTime;

use chrono::{DateTime, Utc};

mod csv;
pub use csv::CsvDispatcher;

use crate::bench::context::BenchCtx;

/// A data pipeline plugin that receives data from the poll loop
/// one row at a time.
#[typetag::serde(tag = "type")]
pub trait Dispatcher: Send + Sync {
    /// Set up the dispatcher at the start of a run
    fn init(&mut self, ctx: &BenchCtx, channel_names: &[String]) -> Result<(), String>;

    /// Ingest a row of data
    fn consume(
        &mut self,
        time: SystemTime,
        timestamp: i64,
        channel_values: Vec<f64>,
    ) -> Result<(), String>;

    /// Shut down the dispatcher and reset internal state for the next run
    fn terminate(&mut self) -> Result<(), String>;
}

/// Generate header strings including the time indices given some channel names
pub fn header_columns(channel_names: &[String]) -> Vec<String> {
    let mut out = vec!["timestamp".to_owned(), "time".to_owned()];
    out.extend(channel_names.iter().cloned());
    out
}

/// Generate CSV header row given some channel names
pub fn csv_header(channel_names: &[String]) -> String {
    let mut header_string = header_columns(channel_names).join(",");
    header_string.push('\n');
    header_string
}

/// ISO-8601 UTC timestamp with nanoseconds and Z-suffix
pub fn fmt_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Format one CSV row into a reusable buffer
pub fn csv_row(stringbuf: &mut String, vals: (SystemTime, i64, &[f64])) {
    stringbuf.clear();
    let (time, timestamp, channel_values) = vals;

    let t_iso8601 = fmt_time(time);
    stringbuf.push_str(&format!("{timestamp},{t_iso8601}"));
    for c in channel_values {
        stringbuf.push_str(&format!(",{c}"));
    }
    stringbuf.push('\n');
}
