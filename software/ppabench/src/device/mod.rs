//! Devices are the programmable supplies and loads under control of the bench.
//!
//! Drivers are looked up by name from a driver spec string such as
//! `scpi-pps:conn=/dev/ttyUSB0:serialcomm=9600/8n1`, and produce an object-safe
//! [Device] that exposes a small set of typed config keys.
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub mod demo;
pub use demo::DemoLoad;

pub mod scpi_pps;
pub use scpi_pps::{ScpiPps, SerialComm};

/// Failure while opening or talking to a device
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port failed: {0}")]
    Serial(#[from] serialport::Error),

    #[error("unexpected response to `{command}`: `{response}`")]
    Response { command: String, response: String },

    #[error("config key `{key}` cannot be {action}")]
    Unsupported { key: ConfigKey, action: &'static str },

    #[error("unknown driver `{0}`")]
    UnknownDriver(String),

    #[error("malformed driver spec `{spec}`: {reason}")]
    Spec { spec: String, reason: String },

    #[error("device fault: {0}")]
    Fault(String),
}

/// Config keys shared by all drivers
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    /// Commanded current; the drawn current in sink mode
    CurrentLimit,
    /// Commanded output voltage
    VoltageTarget,
    /// Measured current
    Current,
    /// Measured voltage
    Voltage,
    /// Output state
    Enabled,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 5] = [
        ConfigKey::CurrentLimit,
        ConfigKey::VoltageTarget,
        ConfigKey::Current,
        ConfigKey::Voltage,
        ConfigKey::Enabled,
    ];

    pub fn identifier(&self) -> &'static str {
        match self {
            ConfigKey::CurrentLimit => "current_limit",
            ConfigKey::VoltageTarget => "voltage_target",
            ConfigKey::Current => "current",
            ConfigKey::Voltage => "voltage",
            ConfigKey::Enabled => "enabled",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ConfigKey::CurrentLimit => "Current limit",
            ConfigKey::VoltageTarget => "Voltage target",
            ConfigKey::Current => "Current",
            ConfigKey::Voltage => "Voltage",
            ConfigKey::Enabled => "Output enabled",
        }
    }

    /// Measurement keys are read-only
    pub fn is_settable(&self) -> bool {
        !matches!(self, ConfigKey::Current | ConfigKey::Voltage)
    }
}

impl Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Value of a config key
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum ConfigValue {
    Float(f64),
    Bool(bool),
}

impl Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// One measurement of both channels
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct Reading {
    pub voltage: f64,
    pub current: f64,
}

impl Reading {
    /// Voltage formatted for display, e.g. `12.5V`
    pub fn voltage_text(&self) -> String {
        format!("{}V", self.voltage)
    }

    /// Current formatted for display, e.g. `0.25A`
    pub fn current_text(&self) -> String {
        format!("{}A", self.current)
    }
}

impl Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.voltage_text(), self.current_text())
    }
}

/// Identity and current configuration of an open device
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    pub driver: String,
    pub identity: String,
    pub channels: Vec<String>,
    pub config: BTreeMap<ConfigKey, ConfigValue>,
}

/// Object-safe handle to an open supply or load.
///
/// Drivers only need to implement the raw config accessors;
/// the typed helpers are built on top of them.
pub trait Device: Send + Debug {
    /// Name of the driver that opened this device
    fn driver(&self) -> &'static str;

    /// Vendor identity string
    fn identify(&mut self) -> Result<String, DeviceError>;

    /// Read a config key
    fn config_get(&mut self, key: ConfigKey) -> Result<ConfigValue, DeviceError>;

    /// Write a config key
    fn config_set(&mut self, key: ConfigKey, value: ConfigValue) -> Result<(), DeviceError>;

    /// Names of the measurement channels
    fn channels(&self) -> Vec<String> {
        vec!["V".to_owned(), "I".to_owned()]
    }

    /// Read a numeric config key
    fn get_f64(&mut self, key: ConfigKey) -> Result<f64, DeviceError> {
        match self.config_get(key)? {
            ConfigValue::Float(v) => Ok(v),
            ConfigValue::Bool(_) => Err(DeviceError::Unsupported {
                key,
                action: "read as a number",
            }),
        }
    }

    /// Write a numeric config key
    fn set_f64(&mut self, key: ConfigKey, value: f64) -> Result<(), DeviceError> {
        self.config_set(key, ConfigValue::Float(value))
    }

    /// Switch the output on or off
    fn set_enabled(&mut self, enabled: bool) -> Result<(), DeviceError> {
        self.config_set(ConfigKey::Enabled, ConfigValue::Bool(enabled))
    }

    /// Read voltage and current
    fn measure(&mut self) -> Result<Reading, DeviceError> {
        let current = self.get_f64(ConfigKey::Current)?;
        let voltage = self.get_f64(ConfigKey::Voltage)?;
        Ok(Reading { voltage, current })
    }

    /// Collect identity, channels, and every readable config value
    fn describe(&mut self) -> Result<DeviceInfo, DeviceError> {
        let identity = self.identify()?;
        let mut config = BTreeMap::new();
        for key in ConfigKey::ALL {
            config.insert(key, self.config_get(key)?);
        }

        Ok(DeviceInfo {
            driver: self.driver().to_owned(),
            identity,
            channels: self.channels(),
            config,
        })
    }
}

/// Driver name plus `key=value` connection options, written as
/// `driver:key=value:key=value`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct DriverSpec {
    pub driver: String,
    pub options: BTreeMap<String, String>,
}

impl DriverSpec {
    pub fn new(driver: &str) -> Self {
        Self {
            driver: driver.to_owned(),
            options: BTreeMap::new(),
        }
    }

    /// Add an option, replacing any previous value
    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Parse an option, falling back to a default if it is absent
    pub fn parse_option<T: FromStr>(&self, key: &str, default: T) -> Result<T, DeviceError> {
        match self.option(key) {
            None => Ok(default),
            Some(s) => s.trim().parse::<T>().map_err(|_| self.error(format!(
                "unable to parse option `{key}={s}`"
            ))),
        }
    }

    /// Error describing a problem with this spec
    pub fn error(&self, reason: impl Into<String>) -> DeviceError {
        DeviceError::Spec {
            spec: self.to_string(),
            reason: reason.into(),
        }
    }
}

impl FromStr for DriverSpec {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| DeviceError::Spec {
            spec: s.to_owned(),
            reason: reason.to_owned(),
        };

        let mut parts = s.trim().split(':');
        let driver = parts.next().unwrap_or_default().trim();
        if driver.is_empty() {
            return Err(err("missing driver name"));
        }

        let mut options = BTreeMap::new();
        for pair in parts {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| err(&format!("expected `key=value`, found `{pair}`")))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(err(&format!("empty option name in `{pair}`")));
            }
            if options.insert(key.to_owned(), value.trim().to_owned()).is_some() {
                return Err(err(&format!("duplicate option `{key}`")));
            }
        }

        Ok(Self {
            driver: driver.to_owned(),
            options,
        })
    }
}

impl TryFrom<String> for DriverSpec {
    type Error = DeviceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DriverSpec> for String {
    fn from(value: DriverSpec) -> Self {
        value.to_string()
    }
}

impl Display for DriverSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.driver)?;
        for (k, v) in self.options.iter() {
            write!(f, ":{k}={v}")?;
        }
        Ok(())
    }
}

/// Function that opens a device from a driver spec
pub type OpenFn = fn(&DriverSpec) -> Result<Box<dyn Device>, DeviceError>;

/// An entry in the driver registry
pub struct Driver {
    pub name: &'static str,
    pub long_name: &'static str,
    pub open: OpenFn,
}

/// Drivers available by name
pub static DRIVERS: Lazy<BTreeMap<&'static str, Driver>> = Lazy::new(|| {
    BTreeMap::from([
        (
            scpi_pps::DRIVER_NAME,
            Driver {
                name: scpi_pps::DRIVER_NAME,
                long_name: "SCPI programmable power supply or electronic load",
                open: scpi_pps::open,
            },
        ),
        (
            demo::DRIVER_NAME,
            Driver {
                name: demo::DRIVER_NAME,
                long_name: "Simulated battery and resistive load",
                open: demo::open,
            },
        ),
    ])
});

/// Open the device named by a driver spec
pub fn open(spec: &DriverSpec) -> Result<Box<dyn Device>, DeviceError> {
    let driver = DRIVERS
        .get(spec.driver.as_str())
        .ok_or_else(|| DeviceError::UnknownDriver(spec.driver.clone()))?;
    let device = (driver.open)(spec)?;
    info!("Opened `{}` device using {}", spec, driver.long_name);
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_driver_spec() {
        let spec: DriverSpec = "scpi-pps:conn=/dev/ttyUSB0:serialcomm=9600/8n1"
            .parse()
            .unwrap();
        assert_eq!(spec.driver, "scpi-pps");
        assert_eq!(spec.option("conn"), Some("/dev/ttyUSB0"));
        assert_eq!(spec.option("serialcomm"), Some("9600/8n1"));
        assert_eq!(spec.option("missing"), None);

        let bare: DriverSpec = "demo".parse().unwrap();
        assert!(bare.options.is_empty());
    }

    #[test]
    fn reject_malformed_driver_spec() {
        assert!("".parse::<DriverSpec>().is_err());
        assert!(":conn=x".parse::<DriverSpec>().is_err());
        assert!("demo:voltage".parse::<DriverSpec>().is_err());
        assert!("demo:=3".parse::<DriverSpec>().is_err());
        assert!("demo:voltage=3:voltage=4".parse::<DriverSpec>().is_err());
    }

    #[test]
    fn driver_spec_display_parses_back() {
        let spec = DriverSpec::new("demo")
            .with_option("voltage", "5")
            .with_option("load", "2.5");
        let text = spec.to_string();
        assert_eq!(text, "demo:load=2.5:voltage=5");
        assert_eq!(text.parse::<DriverSpec>().unwrap(), spec);

        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, "\"demo:load=2.5:voltage=5\"");
    }

    #[test]
    fn parse_option_with_default() {
        let spec: DriverSpec = "demo:voltage=5.5:load=abc".parse().unwrap();
        assert_eq!(spec.parse_option("voltage", 1.0).unwrap(), 5.5);
        assert_eq!(spec.parse_option("resistance", 0.25).unwrap(), 0.25);
        assert!(spec.parse_option("load", 1.0_f64).is_err());
    }

    #[test]
    fn config_key_identifiers() {
        // Display and serde agree on the identifier
        for key in ConfigKey::ALL {
            assert_eq!(key.to_string(), key.identifier());
            assert_eq!(
                serde_json::to_string(&key).unwrap(),
                format!("\"{}\"", key.identifier())
            );
        }
        assert!(!ConfigKey::Voltage.is_settable());
        assert!(ConfigKey::CurrentLimit.is_settable());
    }

    #[test]
    fn unknown_driver() {
        let spec: DriverSpec = "nonexistent".parse().unwrap();
        assert!(matches!(open(&spec), Err(DeviceError::UnknownDriver(_))));
    }

    #[test]
    fn registry_lists_drivers() {
        assert!(DRIVERS.contains_key("scpi-pps"));
        assert!(DRIVERS.contains_key("demo"));
    }
}
