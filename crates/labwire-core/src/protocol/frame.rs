//! Frame encoding/decoding
//!
//! Implements the Modbus-RTU style frames used by the motor controller.
//!
//! Request format:
//! - 1 byte: Slave id
//! - 1 byte: Function code
//! - 2 bytes: Start address (big-endian)
//! - 2 bytes: Register count (big-endian)
//! - write only: 1 byte payload length followed by the payload
//! - 2 bytes: CRC16 of every preceding byte (little-endian)
//!
//! Responses are only ever inspected for their first two bytes. Field
//! firmware answers with partial or non-standard replies, so the CRC of a
//! reply is checked for diagnostics and never required.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use crc::{Crc, CRC_16_MODBUS};

use super::FrameError;

/// CRC-16/MODBUS: init 0xFFFF, reflected polynomial 0xA001
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the Modbus CRC16 of `bytes`
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC_MODBUS.checksum(bytes)
}

/// Append the CRC16 of `frame` to it, low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let mut crc_bytes = [0u8; 2];
    LittleEndian::write_u16(&mut crc_bytes, crc16(frame));
    frame.extend_from_slice(&crc_bytes);
}

/// Function codes the motor controller understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read holding registers (used for probing)
    ReadHoldingRegisters = 0x03,
    /// Write multiple registers (used for moves)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Wire value of the function code
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// A request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Addressed device
    pub slave_id: u8,
    /// Requested operation
    pub function: FunctionCode,
    /// First register
    pub start_address: u16,
    /// Number of registers read or written
    pub register_count: u16,
    /// Register data (write requests only)
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a read holding registers request
    pub fn read_holding_registers(slave_id: u8, start_address: u16, count: u16) -> Self {
        Self {
            slave_id,
            function: FunctionCode::ReadHoldingRegisters,
            start_address,
            register_count: count,
            payload: Vec::new(),
        }
    }

    /// Build a write multiple registers request
    ///
    /// The byte-count field is always derived from `payload`, so it can never
    /// disagree with the data that follows it.
    pub fn write_multiple_registers(
        slave_id: u8,
        start_address: u16,
        register_count: u16,
        payload: Vec<u8>,
    ) -> Result<Self, FrameError> {
        if payload.len() > u8::MAX as usize {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            slave_id,
            function: FunctionCode::WriteMultipleRegisters,
            start_address,
            register_count,
            payload,
        })
    }

    /// Encode the frame to raw bytes, CRC included
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.push(self.slave_id);
        bytes.push(self.function.code());

        let mut word = [0u8; 2];
        BigEndian::write_u16(&mut word, self.start_address);
        bytes.extend_from_slice(&word);
        BigEndian::write_u16(&mut word, self.register_count);
        bytes.extend_from_slice(&word);

        if self.function == FunctionCode::WriteMultipleRegisters {
            bytes.push(self.payload.len() as u8);
            bytes.extend_from_slice(&self.payload);
        }

        append_crc(&mut bytes);
        bytes
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        match self.function {
            FunctionCode::ReadHoldingRegisters => 8,
            FunctionCode::WriteMultipleRegisters => 9 + self.payload.len(),
        }
    }

    /// Length of the reply a compliant device sends to this request
    pub fn expected_reply_len(&self) -> usize {
        match self.function {
            // id, fn, byte count, data, crc
            FunctionCode::ReadHoldingRegisters => 5 + 2 * self.register_count as usize,
            // id, fn, address, count, crc
            FunctionCode::WriteMultipleRegisters => 8,
        }
    }
}

/// Encode a read holding registers request
pub fn encode_read_holding_registers(slave_id: u8, start_address: u16, count: u16) -> Vec<u8> {
    Frame::read_holding_registers(slave_id, start_address, count).to_bytes()
}

/// Encode a write multiple registers request
pub fn encode_write_multiple_registers(
    slave_id: u8,
    start_address: u16,
    register_count: u16,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    Frame::write_multiple_registers(slave_id, start_address, register_count, payload.to_vec())
        .map(|frame| frame.to_bytes())
}

/// Slave id and function code at the start of a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Answering device
    pub slave_id: u8,
    /// Function code echoed (or exception code)
    pub function: u8,
}

impl ResponseHeader {
    /// Read the header of a reply, if at least two bytes arrived
    pub fn peek(response: &[u8]) -> Option<Self> {
        match response {
            [slave_id, function, ..] => Some(Self {
                slave_id: *slave_id,
                function: *function,
            }),
            _ => None,
        }
    }
}

/// Check the trailing CRC of a reply
///
/// Returns `None` when the reply is too short to carry a CRC over any data.
pub fn crc_matches(response: &[u8]) -> Option<bool> {
    if response.len() < 4 {
        return None;
    }
    let (body, crc) = response.split_at(response.len() - 2);
    Some(LittleEndian::read_u16(crc) == crc16(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Bitwise reference: shift right, XOR 0xA001 when the low bit was set
    fn reference_crc16(bytes: &[u8]) -> u16 {
        let mut crc: u16 = 0xFFFF;
        for &b in bytes {
            crc ^= b as u16;
            for _ in 0..8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xA001;
                } else {
                    crc >>= 1;
                }
            }
        }
        crc
    }

    #[test]
    fn test_crc16_known_vectors() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc16_matches_bitwise_reference() {
        let samples: [&[u8]; 4] = [
            &[],
            &[0x01],
            &[0x01, 0x10, 0x00, 0x58, 0x00, 0x10, 0x20],
            &[0xde, 0xad, 0xbe, 0xef, 0x7e, 0x25],
        ];
        for sample in samples {
            assert_eq!(crc16(sample), reference_crc16(sample));
        }
    }

    #[test]
    fn test_read_holding_registers_layout() {
        let bytes = encode_read_holding_registers(1, 0x0058, 2);
        assert_eq!(&bytes[..6], &[0x01, 0x03, 0x00, 0x58, 0x00, 0x02]);
        assert_eq!(bytes.len(), 8);
        let crc = crc16(&bytes[..6]);
        assert_eq!(bytes[6], (crc & 0xff) as u8);
        assert_eq!(bytes[7], (crc >> 8) as u8);
    }

    #[test]
    fn test_write_multiple_registers_layout() {
        let payload: Vec<u8> = (0u8..32).collect();
        let bytes = encode_write_multiple_registers(1, 0x0058, 16, &payload).unwrap();
        assert_eq!(&bytes[..7], &[0x01, 0x10, 0x00, 0x58, 0x00, 0x10, 32]);
        assert_eq!(&bytes[7..39], payload.as_slice());
        assert_eq!(bytes.len(), 7 + 32 + 2);
        assert_eq!(crc_matches(&bytes), Some(true));
    }

    #[test]
    fn test_crc_roundtrip_and_bit_flips() {
        let payload = vec![0x00, 0x00, 0x08, 0xCA, 0x12, 0x34];
        let frame = Frame::write_multiple_registers(1, 0x0058, 3, payload)
            .unwrap()
            .to_bytes();
        let body = &frame[..frame.len() - 2];
        assert_eq!(LittleEndian::read_u16(&frame[frame.len() - 2..]), crc16(body));

        // Every single-bit flip in the payload area must change the CRC
        for byte in 7..body.len() {
            for bit in 0..8 {
                let mut corrupted = body.to_vec();
                corrupted[byte] ^= 1 << bit;
                assert_ne!(crc16(&corrupted), crc16(body), "byte {} bit {}", byte, bit);
            }
        }
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; 256];
        assert_eq!(
            Frame::write_multiple_registers(1, 0, 128, payload),
            Err(FrameError::PayloadTooLarge(256))
        );
    }

    #[test]
    fn test_expected_reply_len() {
        assert_eq!(Frame::read_holding_registers(1, 0x58, 2).expected_reply_len(), 9);
        let write = Frame::write_multiple_registers(1, 0x58, 1, vec![0, 1]).unwrap();
        assert_eq!(write.expected_reply_len(), 8);
        assert_eq!(write.encoded_size(), write.to_bytes().len());
    }

    #[test]
    fn test_response_header_peek() {
        assert_eq!(ResponseHeader::peek(&[0x01]), None);
        assert_eq!(
            ResponseHeader::peek(&[0x01, 0x10, 0x00]),
            Some(ResponseHeader {
                slave_id: 1,
                function: 0x10
            })
        );
    }

    #[test]
    fn test_crc_matches_short_and_corrupt() {
        assert_eq!(crc_matches(&[0x7e, 0x25]), None);
        let mut reply = vec![0x01, 0x10, 0x00, 0x58, 0x00, 0x10];
        append_crc(&mut reply);
        assert_eq!(crc_matches(&reply), Some(true));
        reply[2] ^= 0x01;
        assert_eq!(crc_matches(&reply), Some(false));
    }
}
