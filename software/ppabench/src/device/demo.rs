//! Software-defined stand-in for a real instrument.
//!
//! Models a battery with internal resistance on the sink side
//! and a resistive load on the supply side, so that both test modes
//! can be run end to end without hardware.

use tracing::warn;

use super::{ConfigKey, ConfigValue, Device, DeviceError, DriverSpec};

pub const DRIVER_NAME: &str = "demo";

/// Simulated instrument.
///
/// With a nonzero voltage target the output sources into `load_ohm`, limited by the
/// current limit. With a zero voltage target the output sinks the current limit from
/// a battery of `open_circuit_v` behind `internal_ohm`, and reports the current as negative.
#[derive(Clone, Debug, PartialEq)]
pub struct DemoLoad {
    // Model
    open_circuit_v: f64,
    internal_ohm: f64,
    load_ohm: f64,

    // Commanded state
    voltage_target: f64,
    current_limit: f64,
    enabled: bool,

    /// Fail every operation after this many have succeeded
    fail_after: Option<u64>,
    ops: u64,
}

impl Default for DemoLoad {
    fn default() -> Self {
        Self::new(12.0, 0.1, 10.0)
    }
}

impl DemoLoad {
    pub fn new(open_circuit_v: f64, internal_ohm: f64, load_ohm: f64) -> Self {
        Self {
            open_circuit_v,
            internal_ohm,
            load_ohm,

            voltage_target: 0.0,
            current_limit: 0.0,
            enabled: false,

            fail_after: None,
            ops: 0,
        }
    }

    /// Simulate a communication failure on every operation after the first `n`
    pub fn fail_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Terminal voltage and current for the commanded state
    pub fn operating_point(&self) -> (f64, f64) {
        if !self.enabled {
            return (self.open_circuit_v, 0.0);
        }

        if self.voltage_target > 0.0 {
            // Sourcing into the load
            let amps = if self.load_ohm > 0.0 {
                (self.voltage_target / self.load_ohm).min(self.current_limit)
            } else {
                self.current_limit
            };
            let amps = amps.max(0.0);
            (amps * self.load_ohm, amps)
        } else {
            // Sinking from the battery; the battery can't push more than its short-circuit current
            let short_circuit = if self.internal_ohm > 0.0 {
                self.open_circuit_v / self.internal_ohm
            } else {
                f64::INFINITY
            };
            let amps = self.current_limit.clamp(0.0, short_circuit);
            let volts = (self.open_circuit_v - amps * self.internal_ohm).max(0.0);
            (volts, -amps)
        }
    }

    fn count_op(&mut self) -> Result<(), DeviceError> {
        self.ops += 1;
        match self.fail_after {
            Some(n) if self.ops > n => {
                warn!("Simulated communication failure");
                Err(DeviceError::Fault(
                    "simulated communication failure".to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }
}

impl Device for DemoLoad {
    fn driver(&self) -> &'static str {
        DRIVER_NAME
    }

    fn identify(&mut self) -> Result<String, DeviceError> {
        self.count_op()?;
        Ok(format!(
            "ppabench,demo,{}V/{}ohm/{}ohm",
            self.open_circuit_v, self.internal_ohm, self.load_ohm
        ))
    }

    fn config_get(&mut self, key: ConfigKey) -> Result<ConfigValue, DeviceError> {
        self.count_op()?;
        let (volts, amps) = self.operating_point();
        let value = match key {
            ConfigKey::Voltage => ConfigValue::Float(volts),
            ConfigKey::Current => ConfigValue::Float(amps),
            ConfigKey::VoltageTarget => ConfigValue::Float(self.voltage_target),
            ConfigKey::CurrentLimit => ConfigValue::Float(self.current_limit),
            ConfigKey::Enabled => ConfigValue::Bool(self.enabled),
        };
        Ok(value)
    }

    fn config_set(&mut self, key: ConfigKey, value: ConfigValue) -> Result<(), DeviceError> {
        self.count_op()?;
        match (key, value) {
            (ConfigKey::VoltageTarget, ConfigValue::Float(v)) => self.voltage_target = v,
            (ConfigKey::CurrentLimit, ConfigValue::Float(a)) => self.current_limit = a,
            (ConfigKey::Enabled, ConfigValue::Bool(b)) => self.enabled = b,
            (key, _) => {
                return Err(DeviceError::Unsupported {
                    key,
                    action: "set to that value",
                });
            }
        }
        Ok(())
    }
}

/// Open a simulated instrument from options
/// `voltage` (V), `resistance` (internal ohms), `load` (ohms), and `fail_after` (operations)
pub fn open(spec: &DriverSpec) -> Result<Box<dyn Device>, DeviceError> {
    let default = DemoLoad::default();
    let mut demo = DemoLoad::new(
        spec.parse_option("voltage", default.open_circuit_v)?,
        spec.parse_option("resistance", default.internal_ohm)?,
        spec.parse_option("load", default.load_ohm)?,
    );

    if spec.option("fail_after").is_some() {
        demo = demo.fail_after(spec.parse_option("fail_after", 0_u64)?);
    }

    if demo.open_circuit_v < 0.0 || demo.internal_ohm < 0.0 || demo.load_ohm < 0.0 {
        return Err(spec.error("demo model parameters must be non-negative"));
    }

    Ok(Box::new(demo))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_output_reads_open_circuit() {
        let mut demo = DemoLoad::new(12.0, 0.5, 10.0);
        demo.set_f64(ConfigKey::CurrentLimit, 2.0).unwrap();

        let reading = demo.measure().unwrap();
        assert_eq!(reading.voltage, 12.0);
        assert_eq!(reading.current, 0.0);
    }

    #[test]
    fn sinking_sags_terminal_voltage() {
        let mut demo = DemoLoad::new(12.0, 0.5, 10.0);
        demo.set_enabled(true).unwrap();
        demo.set_f64(ConfigKey::CurrentLimit, 2.0).unwrap();

        let reading = demo.measure().unwrap();
        assert_eq!(reading.voltage, 11.0);
        assert_eq!(reading.current, -2.0);

        // Can't draw past the short-circuit current
        demo.set_f64(ConfigKey::CurrentLimit, 100.0).unwrap();
        let reading = demo.measure().unwrap();
        assert_eq!(reading.voltage, 0.0);
        assert_eq!(reading.current, -24.0);
    }

    #[test]
    fn sourcing_respects_current_limit() {
        let mut demo = DemoLoad::new(12.0, 0.5, 10.0);
        demo.set_enabled(true).unwrap();
        demo.set_f64(ConfigKey::VoltageTarget, 5.0).unwrap();
        demo.set_f64(ConfigKey::CurrentLimit, 1.0).unwrap();

        let reading = demo.measure().unwrap();
        assert_eq!(reading.voltage, 5.0);
        assert_eq!(reading.current, 0.5);

        // Current limited, so the voltage folds back
        demo.set_f64(ConfigKey::CurrentLimit, 0.2).unwrap();
        let reading = demo.measure().unwrap();
        assert_eq!(reading.voltage, 2.0);
        assert_eq!(reading.current, 0.2);
    }

    #[test]
    fn injected_failures() {
        let mut demo = DemoLoad::default().fail_after(2);
        assert!(demo.set_enabled(false).is_ok());
        assert!(demo.get_f64(ConfigKey::Voltage).is_ok());
        assert!(matches!(
            demo.get_f64(ConfigKey::Voltage),
            Err(DeviceError::Fault(_))
        ));
    }

    #[test]
    fn open_from_spec() {
        let spec: DriverSpec = "demo:voltage=5:resistance=1:load=2".parse().unwrap();
        let mut dev = open(&spec).unwrap();
        assert_eq!(dev.driver(), "demo");
        assert_eq!(dev.get_f64(ConfigKey::Voltage).unwrap(), 5.0);

        let info = dev.describe().unwrap();
        assert_eq!(info.config[&ConfigKey::Enabled], ConfigValue::Bool(false));
        assert_eq!(info.channels, vec!["V", "I"]);

        let spec: DriverSpec = "demo:load=-1".parse().unwrap();
        assert!(open(&spec).is_err());
    }
}
