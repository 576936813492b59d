//! Information about the current operation
//! that may be used by the bench's appendages.

use std::default::Default;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use serde::{Deserialize, Serialize};

/// Criteria for ending a run from outside the poll loop
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub enum Termination {
    /// Stop once this much time has passed since the start of the loop
    Timeout(Duration),

    /// Stop once this many samples have been recorded
    Samples(usize),
}

impl Termination {
    /// Check whether this criterion is satisfied
    pub fn is_met(&self, elapsed: Duration, samples: usize) -> bool {
        match self {
            Termination::Timeout(limit) => elapsed >= *limit,
            Termination::Samples(limit) => samples >= *limit,
        }
    }
}

/// Operation context
#[derive(Serialize, Deserialize, Clone, Debug)]
#[non_exhaustive]
pub struct BenchCtx {
    /// A name for this op, which will be used as the name of the log file
    /// and of the file/table/etc of each data dispatcher
    /// and must be compatible with that use.
    pub op_name: String,

    /// A directory to place outputs.
    pub op_dir: PathBuf,

    /// Criteria for ending an otherwise open-ended run.
    /// The run ends when any of them is met.
    pub termination_criteria: Vec<Termination>,
}

impl Default for BenchCtx {
    fn default() -> Self {
        // Use current time with seconds as op name and use working directory as op dir,
        // replacing characters in the name that would be invalid on Windows.
        let op_name = DateTime::<Utc>::from(SystemTime::now())
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            .replace(":", "");
        Self {
            op_name,
            op_dir: std::fs::canonicalize("./").unwrap_or_default(),
            termination_criteria: Vec::new(),
        }
    }
}

impl BenchCtx {
    pub fn new(op_name: &str, op_dir: PathBuf) -> Self {
        Self {
            op_name: op_name.to_owned(),
            op_dir,
            termination_criteria: Vec::new(),
        }
    }

    /// Check whether any termination criterion is satisfied
    pub fn should_terminate(&self, elapsed: Duration, samples: usize) -> bool {
        self.termination_criteria
            .iter()
            .any(|t| t.is_met(elapsed, samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_op_name_is_filename_safe() {
        let ctx = BenchCtx::default();
        assert!(!ctx.op_name.contains(':'));
        assert!(ctx.op_name.ends_with('Z'));
    }

    #[test]
    fn any_criterion_terminates() {
        let mut ctx = BenchCtx::new("t", PathBuf::from("."));
        assert!(!ctx.should_terminate(Duration::from_secs(100), 100));

        ctx.termination_criteria = vec![
            Termination::Timeout(Duration::from_secs(5)),
            Termination::Samples(10),
        ];
        assert!(!ctx.should_terminate(Duration::from_secs(1), 3));
        assert!(ctx.should_terminate(Duration::from_secs(5), 3));
        assert!(ctx.should_terminate(Duration::from_secs(1), 10));
    }
}
