//! THP sensor poller
//!
//! The sensor answers the ASCII command `p\r\n` with free-form text holding
//! one JSON object shaped like
//!
//! ```text
//! {"Sensors": [{"ID": "THP-1", "Temperature": 22.5, "Humidity": 40.0, "Pressure": 1011.0}]}
//! ```
//!
//! The object usually arrives split over several reads. Bytes are
//! accumulated, decoded lossily and parsed from the first `{` until a
//! complete object appears or the deadline passes. A failed read is always
//! reported as an error; no placeholder values are ever returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SensorConfig;
use crate::protocol::{
    ConnectionParameters, Exhausted, PortOpener, Probe, ProbeVerdict, Transport, TransportError,
};
use crate::session::{Device, TransactionError};

/// Command requesting one measurement
pub const READ_COMMAND: &[u8] = b"p\r\n";

/// One measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Sensor id as reported (numbers are converted to text)
    pub id: Option<String>,
    /// Temperature in °C
    pub temperature: Option<f64>,
    /// Relative humidity in %
    pub humidity: Option<f64>,
    /// Pressure in hPa
    pub pressure: Option<f64>,
    /// When the reading was parsed
    pub captured_at: DateTime<Utc>,
}

/// Sensor read errors
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("Sensor not connected")]
    NotConnected,

    #[error("No response within {}ms", .waited.as_millis())]
    Timeout { waited: Duration },

    #[error("Unusable sensor response ({reason}): {raw:?}")]
    Parse { reason: String, raw: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl TransactionError for SensorError {
    fn not_connected() -> Self {
        SensorError::NotConnected
    }

    fn is_transport_failure(&self) -> bool {
        matches!(self, SensorError::Transport(_))
    }
}

/// State of the text accumulated so far
#[derive(Debug)]
enum Extract {
    /// No `{` yet, or the object is still incomplete
    Pending,
    /// A complete JSON object
    Document(Value),
    /// Text after the first `{` cannot become valid JSON
    Malformed(String),
}

fn extract_document(text: &str) -> Extract {
    let Some(start) = text.find('{') else {
        return Extract::Pending;
    };
    let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Extract::Document(value),
        Some(Err(e)) if e.is_eof() => Extract::Pending,
        Some(Err(e)) => Extract::Malformed(e.to_string()),
        None => Extract::Pending,
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Build a reading from a parsed document
///
/// Missing or non-numeric fields become `None`; only a missing or empty
/// `Sensors` array is an error.
fn reading_from(document: &Value) -> Result<SensorReading, String> {
    let first = document
        .get("Sensors")
        .and_then(Value::as_array)
        .and_then(|sensors| sensors.first())
        .ok_or_else(|| "missing or empty Sensors array".to_string())?;

    Ok(SensorReading {
        id: first.get("ID").and_then(id_text),
        temperature: first.get("Temperature").and_then(Value::as_f64),
        humidity: first.get("Humidity").and_then(Value::as_f64),
        pressure: first.get("Pressure").and_then(Value::as_f64),
        captured_at: Utc::now(),
    })
}

/// Parse accumulated sensor text into a reading
pub fn parse_reading(text: &str) -> Result<SensorReading, SensorError> {
    match extract_document(text) {
        Extract::Document(document) => reading_from(&document).map_err(|reason| SensorError::Parse {
            reason,
            raw: text.to_string(),
        }),
        Extract::Malformed(reason) => Err(SensorError::Parse {
            reason,
            raw: text.to_string(),
        }),
        Extract::Pending => Err(SensorError::Parse {
            reason: "incomplete JSON object".to_string(),
            raw: text.to_string(),
        }),
    }
}

/// Polls one THP sensor over an open transport
#[derive(Debug, Clone)]
pub struct SensorPoller {
    config: SensorConfig,
}

impl SensorPoller {
    /// Create a poller
    pub fn new(config: SensorConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Send the read command and collect the answer until it holds a
    /// complete (or hopeless) object or `timeout` elapses
    fn request(&self, transport: &mut Transport, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        transport.flush()?;
        transport.send(READ_COMMAND)?;
        transport.receive_until(timeout, |buf| {
            !matches!(extract_document(&String::from_utf8_lossy(buf)), Extract::Pending)
        })
    }

    fn interpret(&self, port: &str, raw: &[u8], timeout: Duration) -> Result<SensorReading, SensorError> {
        if raw.is_empty() {
            return Err(SensorError::Timeout { waited: timeout });
        }
        let reading = parse_reading(&String::from_utf8_lossy(raw))?;
        debug!(
            port,
            id = ?reading.id,
            temperature = ?reading.temperature,
            humidity = ?reading.humidity,
            pressure = ?reading.pressure,
            "sensor reading"
        );
        Ok(reading)
    }

    /// Request one reading and wait up to `timeout` for it
    pub fn read(&self, transport: &mut Transport, timeout: Duration) -> Result<SensorReading, SensorError> {
        let raw = self.request(transport, timeout)?;
        self.interpret(&transport.params().port, &raw, timeout)
    }

    /// One discovery attempt: let the board settle, then require a temperature
    ///
    /// Anything short of that is rejected with the text as received.
    pub fn probe_attempt(&self, transport: &mut Transport) -> Result<ProbeVerdict<SensorReading>, TransportError> {
        transport.pause(self.config.open_settle())?;
        let timeout = self.config.discovery_timeout();
        let raw = self.request(transport, timeout)?;
        Ok(match self.interpret(&transport.params().port, &raw, timeout) {
            Ok(reading) if reading.temperature.is_some() => ProbeVerdict::Accept(reading),
            _ => ProbeVerdict::Reject { raw },
        })
    }

    /// Ports to try, in order
    pub fn candidates(
        &self,
        params: Option<&ConnectionParameters>,
        opener: &dyn PortOpener,
    ) -> Vec<ConnectionParameters> {
        if let Some(params) = params {
            return vec![params.clone()];
        }
        let ports = if self.config.ports.is_empty() {
            opener.available_ports()
        } else {
            self.config.ports.clone()
        };
        ports
            .into_iter()
            .map(|port| ConnectionParameters::new(port, self.config.baud_rate))
            .collect()
    }

    fn port_probe(&self, candidates: Vec<ConnectionParameters>) -> Probe<SensorReading> {
        let poller = self.clone();
        Probe::new(
            "sensor",
            candidates,
            self.config.direction,
            self.config.timing.clone(),
            Exhausted::NoPort,
            move |transport| poller.probe_attempt(transport),
        )
    }

    /// First of `ports` whose sensor reports a temperature
    ///
    /// Every port opened along the way is closed again, including the
    /// selected one.
    pub fn discover_port(&self, opener: &dyn PortOpener, ports: &[String]) -> Option<String> {
        let candidates = ports
            .iter()
            .map(|port| ConnectionParameters::new(port.clone(), self.config.baud_rate))
            .collect();
        match self.port_probe(candidates).run(opener, &CancellationToken::new()) {
            Ok(success) => {
                info!(port = %success.params.port, "sensor found");
                success.transport.close();
                Some(success.params.port)
            }
            Err(e) => {
                debug!(error = %e, "sensor discovery failed");
                None
            }
        }
    }
}

impl Device for SensorPoller {
    type Evidence = SensorReading;

    fn kind(&self) -> &'static str {
        "sensor"
    }

    fn probe(&self, params: Option<&ConnectionParameters>, opener: &dyn PortOpener) -> Probe<SensorReading> {
        self.port_probe(self.candidates(params, opener))
    }
}
