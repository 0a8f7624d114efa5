//! Motor driver
//!
//! Builds the write-multiple-registers move command for the rotary actuator
//! and classifies its acknowledgement. The block written on every move is
//! 32 bytes (16 registers) starting at 0x0058:
//!
//! | offset | size | content                               |
//! |--------|------|---------------------------------------|
//! | 0      | 8    | flags `00 00 00 00 00 00 00 01`       |
//! | 8      | 4    | target angle, signed big-endian       |
//! | 12     | 4    | speed, signed big-endian              |
//! | 16     | 8    | calibration words                     |
//! | 24     | 4    | current limit, signed big-endian      |
//! | 28     | 4    | trailing flags `00 00 00 01`          |

use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MotorConfig;
use crate::protocol::frame::crc_matches;
use crate::protocol::{
    format_hex, AcceptancePolicy, AckPattern, ConnectionParameters, Exhausted, Frame, FrameError,
    FunctionCode, PortOpener, Probe, ProbeVerdict, Transport, TransportError,
};
use crate::session::{Device, TransactionError};

const LEADING_FLAGS: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 1];
const TRAILING_FLAGS: [u8; 4] = [0, 0, 0, 1];

/// An accepted acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckInfo {
    /// Bytes as received
    pub raw: Vec<u8>,
    /// Rule that accepted them
    pub pattern: AckPattern,
    /// Trailing CRC check, `None` when the reply is too short to carry one
    pub crc_ok: Option<bool>,
}

impl fmt::Display for AckInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let crc = match self.crc_ok {
            Some(true) => "crc ok",
            Some(false) => "crc mismatch",
            None => "no crc",
        };
        write!(f, "[{}] {} ({})", format_hex(&self.raw), self.pattern, crc)
    }
}

/// Motor command errors
#[derive(Error, Debug)]
pub enum MotorError {
    #[error("Motor not connected")]
    NotConnected,

    #[error("No acknowledgement within {}ms", .waited.as_millis())]
    Timeout { waited: std::time::Duration },

    #[error("Reply rejected as acknowledgement: [{}]", format_hex(.raw))]
    NoAck { raw: Vec<u8> },

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl TransactionError for MotorError {
    fn not_connected() -> Self {
        MotorError::NotConnected
    }

    fn is_transport_failure(&self) -> bool {
        matches!(self, MotorError::Transport(_))
    }
}

/// Drives one motor controller over an open transport
#[derive(Debug, Clone)]
pub struct MotorDriver {
    config: MotorConfig,
    policy: AcceptancePolicy,
}

impl MotorDriver {
    /// Driver using the built-in quirks table
    pub fn new(config: MotorConfig) -> Self {
        let policy = AcceptancePolicy::new(config.slave_id, FunctionCode::WriteMultipleRegisters.code());
        Self { config, policy }
    }

    /// Replace the acceptance policy used for move acknowledgements
    pub fn with_policy(mut self, policy: AcceptancePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &MotorConfig {
        &self.config
    }

    /// Register block written for a move to `angle`
    ///
    /// The angle is written as-is; range checking is the caller's job.
    pub fn move_payload(&self, angle: i32) -> Vec<u8> {
        let mut word = [0u8; 4];
        let mut payload = Vec::with_capacity(32);
        payload.extend_from_slice(&LEADING_FLAGS);
        BigEndian::write_i32(&mut word, angle);
        payload.extend_from_slice(&word);
        BigEndian::write_i32(&mut word, self.config.speed);
        payload.extend_from_slice(&word);
        payload.extend_from_slice(&self.config.calibration);
        BigEndian::write_i32(&mut word, self.config.current);
        payload.extend_from_slice(&word);
        payload.extend_from_slice(&TRAILING_FLAGS);
        payload
    }

    /// Complete move request
    pub fn move_frame(&self, angle: i32) -> Result<Frame, FrameError> {
        let payload = self.move_payload(angle);
        let registers = (payload.len() / 2) as u16;
        Frame::write_multiple_registers(self.config.slave_id, self.config.start_address, registers, payload)
    }

    /// Request sent while probing for the controller
    pub fn probe_frame(&self) -> Frame {
        Frame::read_holding_registers(
            self.config.slave_id,
            self.config.start_address,
            self.config.probe_register_count,
        )
    }

    /// Flush, settle, send `request`, then collect the reply
    ///
    /// Reading stops at `expected_len` bytes or at the deadline. Quirk
    /// replies are shorter than an echo, so they run to the deadline and
    /// keep whatever trails the matched prefix.
    fn exchange(
        &self,
        transport: &mut Transport,
        request: &[u8],
        deadline: std::time::Duration,
        expected_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        transport.flush()?;
        transport.pause(self.config.settle())?;
        transport.send(request)?;
        transport.receive(deadline, Some(expected_len))
    }

    /// Command a move and wait for its acknowledgement
    pub fn move_to(&self, transport: &mut Transport, angle: i32) -> Result<AckInfo, MotorError> {
        let request = self.move_frame(angle)?.to_bytes();
        let raw = self.exchange(
            transport,
            &request,
            self.config.ack_timeout(),
            self.config.ack_len,
        )?;

        match self.policy.classify(&raw) {
            Some(pattern) => {
                let crc_ok = crc_matches(&raw);
                debug!(angle, ack = %format_hex(&raw), %pattern, ?crc_ok, "move acknowledged");
                Ok(AckInfo { raw, pattern, crc_ok })
            }
            None if raw.is_empty() => {
                warn!(angle, "no acknowledgement");
                Err(MotorError::Timeout {
                    waited: self.config.ack_timeout(),
                })
            }
            None => {
                warn!(angle, reply = %format_hex(&raw), "acknowledgement rejected");
                Err(MotorError::NoAck { raw })
            }
        }
    }

    /// One probe attempt on an open transport
    pub fn probe_attempt(&self, transport: &mut Transport) -> Result<ProbeVerdict<AckInfo>, TransportError> {
        let frame = self.probe_frame();
        let policy = self.policy.for_function(FunctionCode::ReadHoldingRegisters.code());
        let raw = self.exchange(
            transport,
            &frame.to_bytes(),
            self.config.probe_timeout(),
            frame.expected_reply_len(),
        )?;

        Ok(match policy.classify(&raw) {
            Some(pattern) => ProbeVerdict::Accept(AckInfo {
                crc_ok: crc_matches(&raw),
                raw,
                pattern,
            }),
            None => ProbeVerdict::Reject { raw },
        })
    }

    /// Link parameters to try, in order
    ///
    /// Explicit parameters are verified alone. Otherwise every configured
    /// baud rate is tried on the configured port, or on each available port.
    pub fn candidates(
        &self,
        params: Option<&ConnectionParameters>,
        opener: &dyn PortOpener,
    ) -> Vec<ConnectionParameters> {
        if let Some(params) = params {
            return vec![params.clone()];
        }
        let ports = match &self.config.port {
            Some(port) => vec![port.clone()],
            None => opener.available_ports(),
        };
        ports
            .iter()
            .flat_map(|port| {
                self.config
                    .baud_rates
                    .iter()
                    .map(move |baud| ConnectionParameters::new(port.clone(), *baud))
            })
            .collect()
    }
}

impl Device for MotorDriver {
    type Evidence = AckInfo;

    fn kind(&self) -> &'static str {
        "motor"
    }

    fn probe(&self, params: Option<&ConnectionParameters>, opener: &dyn PortOpener) -> Probe<AckInfo> {
        let candidates = self.candidates(params, opener);
        let exhausted = if candidates.is_empty() {
            Exhausted::NoPort
        } else {
            Exhausted::NoDevice
        };
        let driver = self.clone();
        Probe::new(
            "motor",
            candidates,
            self.config.direction,
            self.config.timing.clone(),
            exhausted,
            move |transport| driver.probe_attempt(transport),
        )
    }
}
