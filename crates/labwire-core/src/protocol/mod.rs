//! Serial Protocol Communication
//!
//! Implements the instrument link layer: Modbus-style request frames with
//! CRC16, half-duplex RS-485 transport, the acknowledgement acceptance policy,
//! and the background prober that discovers working link parameters.

pub mod acceptance;
mod connection;
mod error;
pub mod frame;
pub mod probe;
pub mod serial;
pub mod transport;

pub use acceptance::{AcceptancePolicy, AckPattern, Quirk, VENDOR_QUIRKS};
pub use connection::{BaudRate, ConnectionParameters, DirectionPolicy};
pub use error::{FrameError, ProtocolError, TransportError};
pub use frame::{
    append_crc, crc16, encode_read_holding_registers, encode_write_multiple_registers, Frame,
    FunctionCode,
};
pub use probe::{Exhausted, Probe, ProbeHandle, ProbeSuccess, ProbeVerdict, Prober};
pub use serial::{list_ports, PortInfo, PortOpener, SerialOpener};
pub use transport::{DirectionControl, SerialChannel, SerialLink, Transport};

/// Fixed baud rate of the THP sensor
pub const SENSOR_BAUD_RATE: BaudRate = BaudRate::B9600;

/// Deadline for a probe response at one candidate, in milliseconds
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 500;

/// Deadline for a motor acknowledgement, in milliseconds
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 500;

/// Deadline for a sensor read, in milliseconds
pub const DEFAULT_SENSOR_TIMEOUT_MS: u64 = 1000;

/// Polling slice used while accumulating received bytes, in milliseconds
pub const DEFAULT_POLL_SLICE_MS: u64 = 10;

/// Format raw bytes as space separated hex for logs and error messages
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
