use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ramp::Setpoint;

/// Which branch of the poll loop is active
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Measurements are displayed but nothing is recorded or commanded
    #[default]
    Idle,

    /// Drawing current along the ramp while watching the voltage
    SinkTest,

    /// Sourcing a fixed voltage and current limit while logging the current
    SupplyTest,
}

impl Mode {
    /// Numeric code used when the mode is dispatched as a channel value
    pub fn code(&self) -> f64 {
        match self {
            Mode::Idle => 0.0,
            Mode::SinkTest => 1.0,
            Mode::SupplyTest => 2.0,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Idle => "idle",
            Mode::SinkTest => "sink",
            Mode::SupplyTest => "supply",
        };
        f.write_str(s)
    }
}

/// One recorded measurement.
///
/// For a sink test, `x` is drawn current in A and `y` is terminal voltage in V.
/// For a supply test, `x` is elapsed time in s and `y` is output current in A.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
}

impl Sample {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// What happened on one tick of the poll loop
#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// No run is active
    Idle,

    /// A run is active; carries the setpoint written this tick, if any
    Running(Option<Setpoint>),

    /// Measured voltage fell below the safety threshold; output is off
    SafetyCutoff { voltage: f64, threshold: f64 },

    /// The ramp or run duration was exhausted; output is off
    Completed,

    /// A device error ended the run; output disable was attempted
    /// and the device was reopened
    Aborted(String),
}

impl TickOutcome {
    /// Whether the run is over after this tick
    pub fn is_final(&self) -> bool {
        !matches!(self, TickOutcome::Running(_))
    }
}
