//! Control program for sweep and supply tests on programmable power supplies and electronic loads.

pub mod bench;
pub mod chart;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod export;
pub mod logging;
pub mod ramp;

pub use bench::context::{BenchCtx, Termination};
pub use bench::{Bench, BenchError, Mode, Sample, TickOutcome};
pub use config::BenchConfig;
pub use device::{ConfigKey, ConfigValue, Device, DeviceError, DriverSpec, Reading};
pub use dispatcher::{CsvDispatcher, Dispatcher};
pub use ramp::{Ramp, RampConfig, Setpoint};
