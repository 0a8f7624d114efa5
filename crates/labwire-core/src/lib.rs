//! # LabWire Core Library
//!
//! Communication layer for serial lab instruments.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Modbus-style request frames with CRC16 for the motor controller
//! - Half-duplex RS-485 transport with deadline-bounded receive
//! - A tolerant acknowledgement policy covering vendor quirks
//! - Background discovery of working port and baud rate combinations
//! - JSON polling of the THP (temperature/humidity/pressure) sensor
//!
//! ## Supported Instruments
//!
//! - Rotary actuator speaking write-multiple-registers over RS-485
//! - THP sensor answering `p\r\n` with a JSON document over RS-232
//!
//! ## Example
//!
//! ```rust,ignore
//! use labwire_core::prelude::*;
//!
//! let motor = MotorSession::serial(MotorDriver::new(MotorConfig::default()));
//! let link = motor.connect(None).await?;
//! println!("motor on {}", link.params);
//!
//! let ack = motor.move_to(2250).await?;
//! println!("ack {}", ack);
//! motor.disconnect();
//! ```

pub mod config;
pub mod motor;
pub mod protocol;
pub mod sensor;
pub mod session;
pub mod sim;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{InstrumentConfig, LinkTiming, MotorConfig, SensorConfig};
    pub use crate::motor::{AckInfo, MotorDriver, MotorError};
    pub use crate::protocol::{
        list_ports, AcceptancePolicy, AckPattern, BaudRate, ConnectionParameters, DirectionPolicy,
        PortOpener, ProtocolError, SerialOpener, TransportError,
    };
    pub use crate::sensor::{SensorError, SensorPoller, SensorReading};
    pub use crate::session::{
        ConnectHandle, DeviceSession, MotorSession, SensorSession, SessionState,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
