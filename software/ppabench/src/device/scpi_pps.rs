//! Programmable supplies and loads that speak SCPI over a serial port or raw TCP socket

use std::fmt::{self, Debug};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::str::FromStr;
use std::time::Duration;

use serialport::{DataBits, Parity, StopBits};
use tracing::trace;

use super::{ConfigKey, ConfigValue, Device, DeviceError, DriverSpec};

pub const DRIVER_NAME: &str = "scpi-pps";

/// Line settings used when no `serialcomm` option is given
pub const DEFAULT_SERIALCOMM: &str = "9600/8n1";

/// Read timeout for a single response
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Serial line settings written as `<baud>/<data bits><parity><stop bits>`, e.g. `9600/8n1`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerialComm {
    pub baud: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialComm {
    fn default() -> Self {
        Self {
            baud: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl FromStr for SerialComm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (baud, framing) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("expected `<baud>/<framing>`, found `{s}`"))?;
        let baud = baud
            .parse::<u32>()
            .map_err(|_| format!("invalid baud rate `{baud}`"))?;

        let framing: Vec<char> = framing.to_lowercase().chars().collect();
        let [data, parity, stop] = framing[..] else {
            return Err(format!("expected framing like `8n1`, found `{s}`"));
        };

        let data_bits = match data {
            '5' => DataBits::Five,
            '6' => DataBits::Six,
            '7' => DataBits::Seven,
            '8' => DataBits::Eight,
            x => return Err(format!("invalid data bits `{x}`")),
        };
        let parity = match parity {
            'n' => Parity::None,
            'e' => Parity::Even,
            'o' => Parity::Odd,
            x => return Err(format!("invalid parity `{x}`")),
        };
        let stop_bits = match stop {
            '1' => StopBits::One,
            '2' => StopBits::Two,
            x => return Err(format!("invalid stop bits `{x}`")),
        };

        Ok(Self {
            baud,
            data_bits,
            parity,
            stop_bits,
        })
    }
}

/// SCPI command set for a single-channel supply or load
/// over any byte stream.
pub struct ScpiPps<T> {
    conn: String,
    port: T,
    rx: Vec<u8>,
}

impl<T> Debug for ScpiPps<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScpiPps").field("conn", &self.conn).finish()
    }
}

impl<T: Read + Write> ScpiPps<T> {
    pub fn new(conn: &str, port: T) -> Self {
        Self {
            conn: conn.to_owned(),
            port,
            rx: Vec::with_capacity(64),
        }
    }

    /// Borrow the underlying transport
    pub fn get_ref(&self) -> &T {
        &self.port
    }

    /// Send one command line
    pub fn send(&mut self, cmd: &str) -> Result<(), DeviceError> {
        trace!(conn = %self.conn, "-> {cmd}");
        self.port.write_all(cmd.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()?;
        Ok(())
    }

    /// Send a command and wait for one response line
    pub fn query(&mut self, cmd: &str) -> Result<String, DeviceError> {
        self.send(cmd)?;
        let resp = self.read_line()?;
        trace!(conn = %self.conn, "<- {resp}");
        Ok(resp)
    }

    fn query_f64(&mut self, cmd: &str) -> Result<f64, DeviceError> {
        let resp = self.query(cmd)?;
        // `f64::from_str` accepts "NaN" and "inf", which no instrument means as a reading
        match resp.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(DeviceError::Response {
                command: cmd.to_owned(),
                response: resp,
            }),
        }
    }

    fn query_bool(&mut self, cmd: &str) -> Result<bool, DeviceError> {
        let resp = self.query(cmd)?;
        match resp.to_uppercase().as_str() {
            "1" | "ON" => Ok(true),
            "0" | "OFF" => Ok(false),
            _ => Err(DeviceError::Response {
                command: cmd.to_owned(),
                response: resp,
            }),
        }
    }

    /// Read up to the next line feed, keeping any bytes after it for the next response
    fn read_line(&mut self) -> Result<String, DeviceError> {
        loop {
            if let Some(end) = self.rx.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.rx.drain(..=end).collect();
                return Ok(String::from_utf8_lossy(&line).trim().to_owned());
            }

            let mut chunk = [0_u8; 64];
            let n = self.port.read(&mut chunk)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "device closed the connection",
                )
                .into());
            }
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }
}

impl<T: Read + Write + Send> Device for ScpiPps<T> {
    fn driver(&self) -> &'static str {
        DRIVER_NAME
    }

    fn identify(&mut self) -> Result<String, DeviceError> {
        self.query("*IDN?")
    }

    fn config_get(&mut self, key: ConfigKey) -> Result<ConfigValue, DeviceError> {
        let value = match key {
            ConfigKey::Voltage => ConfigValue::Float(self.query_f64("MEAS:VOLT?")?),
            ConfigKey::Current => ConfigValue::Float(self.query_f64("MEAS:CURR?")?),
            ConfigKey::VoltageTarget => ConfigValue::Float(self.query_f64("VOLT?")?),
            ConfigKey::CurrentLimit => ConfigValue::Float(self.query_f64("CURR?")?),
            ConfigKey::Enabled => ConfigValue::Bool(self.query_bool("OUTP?")?),
        };
        Ok(value)
    }

    fn config_set(&mut self, key: ConfigKey, value: ConfigValue) -> Result<(), DeviceError> {
        let cmd = match (key, value) {
            (ConfigKey::VoltageTarget, ConfigValue::Float(v)) => format!("VOLT {v:.4}"),
            (ConfigKey::CurrentLimit, ConfigValue::Float(a)) => format!("CURR {a:.4}"),
            (ConfigKey::Enabled, ConfigValue::Bool(true)) => "OUTP ON".to_owned(),
            (ConfigKey::Enabled, ConfigValue::Bool(false)) => "OUTP OFF".to_owned(),
            (k, _) if !k.is_settable() => {
                return Err(DeviceError::Unsupported {
                    key,
                    action: "set",
                });
            }
            _ => {
                return Err(DeviceError::Unsupported {
                    key,
                    action: "set to a value of that type",
                });
            }
        };
        self.send(&cmd)
    }
}

/// Open a supply from `conn=<serial path>` or `conn=tcp-raw/<host>/<port>`
pub fn open(spec: &DriverSpec) -> Result<Box<dyn Device>, DeviceError> {
    let conn = spec
        .option("conn")
        .ok_or_else(|| spec.error("missing `conn` option"))?;

    if let Some(addr) = conn.strip_prefix("tcp-raw/") {
        let (host, port) = addr
            .rsplit_once('/')
            .ok_or_else(|| spec.error("expected `tcp-raw/<host>/<port>`"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| spec.error(format!("invalid TCP port `{port}`")))?;

        let stream = TcpStream::connect((host, port))?;
        stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
        stream.set_nodelay(true)?;
        return Ok(Box::new(ScpiPps::new(conn, stream)));
    }

    let comm: SerialComm = spec
        .option("serialcomm")
        .unwrap_or(DEFAULT_SERIALCOMM)
        .parse()
        .map_err(|e: String| spec.error(e))?;
    let port = serialport::new(conn, comm.baud)
        .data_bits(comm.data_bits)
        .parity(comm.parity)
        .stop_bits(comm.stop_bits)
        .timeout(RESPONSE_TIMEOUT)
        .open()?;

    Ok(Box::new(ScpiPps::new(conn, port)))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use super::*;

    /// In-memory transport that replays canned responses
    #[derive(Default)]
    struct MockPort {
        written: Vec<u8>,
        responses: VecDeque<u8>,
    }

    impl MockPort {
        fn with_responses(lines: &[&str]) -> Self {
            let mut port = Self::default();
            for line in lines {
                port.responses.extend(line.as_bytes());
                port.responses.extend(b"\r\n");
            }
            port
        }

        fn sent(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.written)
                .lines()
                .map(str::to_owned)
                .collect()
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // Hand out a few bytes at a time to exercise reassembly
            let n = buf.len().min(self.responses.len()).min(5);
            for b in buf.iter_mut().take(n) {
                *b = self.responses.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn measure_queries_both_channels() {
        let port = MockPort::with_responses(&["-0.2500", "11.875"]);
        let mut pps = ScpiPps::new("mock", port);

        let reading = pps.measure().unwrap();
        assert_eq!(reading.current, -0.25);
        assert_eq!(reading.voltage, 11.875);
        assert_eq!(pps.get_ref().sent(), vec!["MEAS:CURR?", "MEAS:VOLT?"]);
    }

    #[test]
    fn setpoints_and_output() {
        let mut pps = ScpiPps::new("mock", MockPort::default());

        pps.set_f64(ConfigKey::CurrentLimit, 1.5).unwrap();
        pps.set_f64(ConfigKey::VoltageTarget, 0.0).unwrap();
        pps.set_enabled(true).unwrap();
        pps.set_enabled(false).unwrap();

        assert_eq!(
            pps.get_ref().sent(),
            vec!["CURR 1.5000", "VOLT 0.0000", "OUTP ON", "OUTP OFF"]
        );
    }

    #[test]
    fn measurements_are_read_only() {
        let mut pps = ScpiPps::new("mock", MockPort::default());
        let err = pps.set_f64(ConfigKey::Voltage, 1.0).unwrap_err();
        assert!(matches!(err, DeviceError::Unsupported { .. }));

        let err = pps
            .config_set(ConfigKey::Enabled, ConfigValue::Float(1.0))
            .unwrap_err();
        assert!(matches!(err, DeviceError::Unsupported { .. }));
        assert!(pps.get_ref().sent().is_empty());
    }

    #[test]
    fn output_state_and_identity() {
        let port = MockPort::with_responses(&["ACME,PPS-3005,0001,1.2", "ON", "0"]);
        let mut pps = ScpiPps::new("mock", port);

        assert_eq!(pps.identify().unwrap(), "ACME,PPS-3005,0001,1.2");
        assert_eq!(
            pps.config_get(ConfigKey::Enabled).unwrap(),
            ConfigValue::Bool(true)
        );
        assert_eq!(
            pps.config_get(ConfigKey::Enabled).unwrap(),
            ConfigValue::Bool(false)
        );
    }

    #[test]
    fn garbage_response_is_an_error() {
        let port = MockPort::with_responses(&["ERR -113"]);
        let mut pps = ScpiPps::new("mock", port);

        match pps.get_f64(ConfigKey::Voltage) {
            Err(DeviceError::Response { command, response }) => {
                assert_eq!(command, "MEAS:VOLT?");
                assert_eq!(response, "ERR -113");
            }
            x => panic!("Expected a response error, got {x:?}"),
        }
    }

    #[test]
    fn non_finite_response_is_an_error() {
        let port = MockPort::with_responses(&["NAN", "inf", "12.0"]);
        let mut pps = ScpiPps::new("mock", port);

        for expected in ["NAN", "inf"] {
            match pps.get_f64(ConfigKey::Voltage) {
                Err(DeviceError::Response { response, .. }) => assert_eq!(response, expected),
                x => panic!("Expected a response error, got {x:?}"),
            }
        }
        assert_eq!(pps.get_f64(ConfigKey::Voltage).unwrap(), 12.0);
    }

    #[test]
    fn closed_connection_is_an_error() {
        let mut pps = ScpiPps::new("mock", MockPort::default());
        assert!(matches!(
            pps.get_f64(ConfigKey::Current),
            Err(DeviceError::Io(_))
        ));
    }

    #[test]
    fn parse_serialcomm() {
        assert_eq!(
            "9600/8n1".parse::<SerialComm>().unwrap(),
            SerialComm::default()
        );

        let comm: SerialComm = "115200/7E2".parse().unwrap();
        assert_eq!(comm.baud, 115200);
        assert_eq!(comm.data_bits, DataBits::Seven);
        assert_eq!(comm.parity, Parity::Even);
        assert_eq!(comm.stop_bits, StopBits::Two);

        assert!("9600".parse::<SerialComm>().is_err());
        assert!("9600/8n".parse::<SerialComm>().is_err());
        assert!("fast/8n1".parse::<SerialComm>().is_err());
        assert!("9600/9n1".parse::<SerialComm>().is_err());
    }

    #[test]
    fn open_requires_conn() {
        let spec: DriverSpec = "scpi-pps:serialcomm=9600/8n1".parse().unwrap();
        assert!(matches!(open(&spec), Err(DeviceError::Spec { .. })));

        let spec: DriverSpec = "scpi-pps:conn=tcp-raw/localhost/notaport".parse().unwrap();
        assert!(matches!(open(&spec), Err(DeviceError::Spec { .. })));
    }
}
