//! Poll loop that runs sink and supply tests against a single device

pub mod context;
mod run_state;

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::chart::Chart;
use crate::device::{self, ConfigKey, Device, DeviceError, DeviceInfo, DriverSpec, Reading};
use crate::dispatcher::Dispatcher;
use crate::export;
use crate::ramp::{Ramp, RampConfig, Setpoint};
use context::BenchCtx;
pub use run_state::{Mode, Sample, TickOutcome};

/// Opens a fresh device session from a driver spec
pub type Connector = dyn Fn(&DriverSpec) -> Result<Box<dyn Device>, DeviceError> + Send;

/// Names of the channels sent to dispatchers on every tick
pub const CHANNEL_NAMES: [&str; 4] = ["mode", "voltage", "current", "setpoint"];

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("unable to reopen device `{spec}`: {source}")]
    Reconnect {
        spec: String,
        #[source]
        source: DeviceError,
    },

    #[error("run aborted: {0}")]
    Aborted(String),

    #[error("no ramp is configured")]
    NoRamp,

    #[error("a {0} run is already active")]
    Busy(Mode),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("dispatcher failed: {0}")]
    Dispatch(String),

    #[error("export failed: {0}")]
    Export(#[from] csv::Error),
}

/// The bench owns the device session and the state of the current run.
///
/// Each [Bench::tick] reads the device, records a sample if a run is active,
/// and either commands the next setpoint or ends the run. Device errors end the
/// run and replace the session with a freshly opened one.
pub struct Bench {
    spec: DriverSpec,
    connector: Box<Connector>,
    device: Option<Box<dyn Device>>,

    ramp: Ramp,
    safe_voltage: f64,

    mode: Mode,
    last_mode: Mode,
    step: usize,
    run_start: Option<Instant>,

    samples: Vec<Sample>,
    reading: Option<Reading>,
    setpoint: Option<Setpoint>,
    chart: Chart,
}

impl Bench {
    /// Open the device named by `spec` through the driver registry
    pub fn open(spec: DriverSpec) -> Result<Self, BenchError> {
        Self::with_connector(spec, Box::new(device::open))
    }

    /// Open a device using a custom connector, which is also used
    /// to reopen the device after a communication failure
    pub fn with_connector(spec: DriverSpec, connector: Box<Connector>) -> Result<Self, BenchError> {
        let device = connector(&spec)?;
        let mut bench = Self {
            spec,
            connector,
            device: Some(device),

            ramp: Ramp::default(),
            safe_voltage: 0.0,

            mode: Mode::Idle,
            last_mode: Mode::Idle,
            step: 0,
            run_start: None,

            samples: Vec::new(),
            reading: None,
            setpoint: None,
            chart: Chart::default(),
        };

        // Start de-energized
        bench.set_output(false)?;

        Ok(bench)
    }

    pub fn spec(&self) -> &DriverSpec {
        &self.spec
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Mode of the most recently started run, which decides the export format
    pub fn last_mode(&self) -> Mode {
        self.last_mode
    }

    pub fn ramp(&self) -> &Ramp {
        &self.ramp
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Latest measurement, if the device has been read yet
    pub fn reading(&self) -> Option<Reading> {
        self.reading
    }

    pub fn chart(&self) -> &Chart {
        &self.chart
    }

    pub fn safe_voltage(&self) -> f64 {
        self.safe_voltage
    }

    /// Set the voltage below which a sink test is cut off
    pub fn set_safe_voltage(&mut self, volts: f64) {
        self.safe_voltage = volts;
    }

    /// Regenerate the ramp. Returns `false` and keeps the previous ramp
    /// if the configuration is degenerate.
    pub fn update_ramp(&mut self, cfg: &RampConfig) -> bool {
        let updated = self.ramp.update(cfg);
        if updated && self.mode == Mode::Idle {
            self.chart = Chart::ramp_preview(&self.ramp);
        }
        updated
    }

    /// Start drawing current along the ramp
    pub fn start_sink(&mut self) -> Result<(), BenchError> {
        self.ensure_idle()?;
        let end = self
            .ramp
            .points()
            .last()
            .map(|p| p.value)
            .ok_or(BenchError::NoRamp)?;

        self.reset_run(Chart::sink_run(end));
        if let Err(e) = self.set_output(true) {
            return Err(BenchError::Aborted(self.abort(e)?));
        }
        self.begin_run(Mode::SinkTest);

        info!(
            "Started sink test with {} setpoints and {} V cutoff",
            self.ramp.len(),
            self.safe_voltage
        );
        Ok(())
    }

    /// Start sourcing a fixed voltage with a current limit.
    /// The expected run time, if known, sets the span of the chart.
    pub fn start_supply(
        &mut self,
        voltage: f64,
        current_limit: f64,
        duration_s: Option<f64>,
    ) -> Result<(), BenchError> {
        self.ensure_idle()?;
        for (name, v) in [("voltage", voltage), ("current limit", current_limit)] {
            if !v.is_finite() || v < 0.0 {
                return Err(BenchError::InvalidSetting(format!(
                    "supply {name} must be a non-negative number, got {v}"
                )));
            }
        }

        self.reset_run(Chart::supply_run(duration_s.unwrap_or(1.0), current_limit));
        if let Err(e) = self.energize_supply(voltage, current_limit) {
            return Err(BenchError::Aborted(self.abort(e)?));
        }
        self.begin_run(Mode::SupplyTest);

        info!("Started supply test at {voltage} V, {current_limit} A limit");
        Ok(())
    }

    /// End the active run, if any, and switch the output off
    pub fn stop(&mut self) -> Result<(), BenchError> {
        if self.mode == Mode::Idle {
            return Ok(());
        }

        info!("Stopping {} test", self.mode);
        if let Err(e) = self.finish() {
            return Err(BenchError::Aborted(self.abort(e)?));
        }
        Ok(())
    }

    /// Run one cycle of the poll loop
    pub fn tick(&mut self) -> Result<TickOutcome, BenchError> {
        match self.poll() {
            Ok(outcome) => Ok(outcome),
            Err(e) => Ok(TickOutcome::Aborted(self.abort(e)?)),
        }
    }

    /// Identity and current settings of the device
    pub fn describe(&mut self) -> Result<DeviceInfo, BenchError> {
        Ok(self.device()?.describe()?)
    }

    /// Write the samples of the last run as a two-column CSV
    pub fn export_csv(&self, path: &Path) -> Result<(), BenchError> {
        export::save_csv(path, self.last_mode, &self.samples)?;
        info!("Wrote {} samples to {path:?}", self.samples.len());
        Ok(())
    }

    /// Channel values sent to dispatchers, ordered as [CHANNEL_NAMES]
    pub fn channel_values(&self) -> Vec<f64> {
        let (voltage, current) = self
            .reading
            .map(|r| (r.voltage, r.current))
            .unwrap_or((f64::NAN, f64::NAN));
        let setpoint = self.setpoint.map(|s| s.value).unwrap_or(f64::NAN);
        vec![self.mode.code(), voltage, current, setpoint]
    }

    /// Tick on a fixed period until the active run ends or a termination criterion is met,
    /// sending each tick's values to the dispatchers.
    ///
    /// Returns immediately with [TickOutcome::Idle] if no run is active.
    pub fn run(
        &mut self,
        period: Duration,
        ctx: &BenchCtx,
        dispatchers: &mut [Box<dyn Dispatcher>],
    ) -> Result<TickOutcome, BenchError> {
        let channel_names: Vec<String> = CHANNEL_NAMES.iter().map(|&s| s.to_owned()).collect();
        for dispatcher in dispatchers.iter_mut() {
            dispatcher
                .init(ctx, &channel_names)
                .map_err(BenchError::Dispatch)?;
        }

        let mut outcome = self.poll_loop(period, ctx, dispatchers);

        for dispatcher in dispatchers.iter_mut() {
            if let Err(e) = dispatcher.terminate() {
                error!("Failed to shut down dispatcher: {e}");
                if outcome.is_ok() {
                    outcome = Err(BenchError::Dispatch(e));
                }
            }
        }

        outcome
    }

    fn poll_loop(
        &mut self,
        period: Duration,
        ctx: &BenchCtx,
        dispatchers: &mut [Box<dyn Dispatcher>],
    ) -> Result<TickOutcome, BenchError> {
        info!("Entering poll loop with {} ms period", period.as_millis());
        let start = Instant::now();
        let mut target_time = Duration::ZERO;

        loop {
            let time = SystemTime::now();
            let timestamp = target_time.as_nanos() as i64;

            let outcome = self.tick()?;

            let channel_values = self.channel_values();
            for dispatcher in dispatchers.iter_mut() {
                if let Err(e) = dispatcher.consume(time, timestamp, channel_values.clone()) {
                    if let Err(stop_err) = self.stop() {
                        error!("Failed to stop after dispatcher error: {stop_err}");
                    }
                    return Err(BenchError::Dispatch(e));
                }
            }

            if outcome.is_final() {
                info!("Poll loop finished: {outcome:?}");
                return Ok(outcome);
            }

            if ctx.should_terminate(start.elapsed(), self.samples.len()) {
                info!("Termination criteria met");
                self.stop()?;
                return Ok(TickOutcome::Completed);
            }

            // Sleep to the next target time rather than for a fixed duration
            // so that time spent on device I/O does not accumulate
            target_time += period;
            let now = start.elapsed();
            if target_time > now {
                thread::sleep(target_time - now);
            }
        }
    }

    fn poll(&mut self) -> Result<TickOutcome, DeviceError> {
        let reading = self.device()?.measure()?;
        self.reading = Some(reading);

        match self.mode {
            Mode::Idle => {
                debug!("{reading}");
                Ok(TickOutcome::Idle)
            }
            Mode::SinkTest => self.poll_sink(reading),
            Mode::SupplyTest => self.poll_supply(reading),
        }
    }

    fn poll_sink(&mut self, reading: Reading) -> Result<TickOutcome, DeviceError> {
        let amps = reading.current.abs();
        info!("I: {amps} A, U: {} V", reading.voltage);

        self.samples.push(Sample::new(amps, reading.voltage));
        let milliamps = (amps * 1000.0).floor();
        self.chart.push(
            (milliamps, (reading.voltage * 1000.0).floor()),
            format!("{milliamps} mA"),
        );

        // A reading that can't be compared is treated as a breach
        if reading.voltage.is_nan() || reading.voltage < self.safe_voltage {
            warn!(
                "Voltage {} V is below the {} V cutoff",
                reading.voltage, self.safe_voltage
            );
            self.finish()?;
            return Ok(TickOutcome::SafetyCutoff {
                voltage: reading.voltage,
                threshold: self.safe_voltage,
            });
        }

        let Some(setpoint) = self.ramp.get(self.step).copied() else {
            info!("Ramp complete after {} setpoints", self.step);
            self.finish()?;
            return Ok(TickOutcome::Completed);
        };
        self.step += 1;

        debug!("Drawing {} A", setpoint.value);
        self.device()?
            .set_f64(ConfigKey::CurrentLimit, setpoint.value)?;
        self.setpoint = Some(setpoint);

        Ok(TickOutcome::Running(Some(setpoint)))
    }

    fn poll_supply(&mut self, reading: Reading) -> Result<TickOutcome, DeviceError> {
        let elapsed_s = self
            .run_start
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default();
        let amps = reading.current.abs();
        info!("t: {elapsed_s:.3} s, I: {amps} A, U: {} V", reading.voltage);

        self.samples.push(Sample::new(elapsed_s, amps));
        self.chart.push(
            (elapsed_s, (amps * 1000.0).floor()),
            format!("{elapsed_s:.1} s"),
        );

        Ok(TickOutcome::Running(None))
    }

    fn device(&mut self) -> Result<&mut dyn Device, DeviceError> {
        match self.device.as_deref_mut() {
            Some(device) => Ok(device),
            None => Err(DeviceError::Fault("no open device session".to_owned())),
        }
    }

    /// Zero both targets, then switch the output
    fn set_output(&mut self, enabled: bool) -> Result<(), DeviceError> {
        debug!("Setting output enabled: {enabled}");
        let device = self.device()?;
        device.set_f64(ConfigKey::VoltageTarget, 0.0)?;
        device.set_f64(ConfigKey::CurrentLimit, 0.0)?;
        device.set_enabled(enabled)
    }

    fn energize_supply(&mut self, voltage: f64, current_limit: f64) -> Result<(), DeviceError> {
        self.set_output(true)?;
        let device = self.device()?;
        device.set_f64(ConfigKey::VoltageTarget, voltage)?;
        device.set_f64(ConfigKey::CurrentLimit, current_limit)
    }

    fn ensure_idle(&self) -> Result<(), BenchError> {
        match self.mode {
            Mode::Idle => Ok(()),
            mode => Err(BenchError::Busy(mode)),
        }
    }

    /// Clear the previous run's data
    fn reset_run(&mut self, chart: Chart) {
        self.samples.clear();
        self.step = 0;
        self.setpoint = None;
        self.chart = chart;
    }

    fn begin_run(&mut self, mode: Mode) {
        self.mode = mode;
        self.last_mode = mode;
        self.run_start = Some(Instant::now());
    }

    /// Go idle and switch the output off
    fn finish(&mut self) -> Result<(), DeviceError> {
        self.mode = Mode::Idle;
        self.run_start = None;
        self.set_output(false)
    }

    /// End the run after a device error and replace the device session,
    /// returning a description of the error
    fn abort(&mut self, err: DeviceError) -> Result<String, BenchError> {
        error!("Device error during {} mode: {err}", self.mode);
        self.mode = Mode::Idle;
        self.run_start = None;

        if let Err(e) = self.set_output(false) {
            warn!("Unable to switch output off after device error: {e}");
        }
        self.reconnect()?;

        Ok(err.to_string())
    }

    /// Drop the device session and open a new one
    fn reconnect(&mut self) -> Result<(), BenchError> {
        info!("Reopening device `{}`", self.spec);

        // Release the port before opening it again
        self.device = None;

        let reconnect_err = |source| BenchError::Reconnect {
            spec: self.spec.to_string(),
            source,
        };
        let device = (self.connector)(&self.spec).map_err(reconnect_err)?;
        self.device = Some(device);

        self.set_output(false).map_err(|source| BenchError::Reconnect {
            spec: self.spec.to_string(),
            source,
        })?;
        Ok(())
    }
}
