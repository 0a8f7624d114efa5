//! Acknowledgement acceptance
//!
//! Decides whether a reply counts as an acknowledgement. A reply is accepted
//! when it echoes the expected slave id and function code, or when it starts
//! with one of the vendor byte sequences in [`VENDOR_QUIRKS`].
//!
//! The quirk sequences were recorded from working hardware. Whether they are
//! genuine acknowledgements or artifacts of a mis-synchronised baud rate has
//! not been verified; they are accepted because rejecting them makes working
//! actuators look unreachable.

use std::borrow::Cow;
use std::fmt;

use super::format_hex;
use super::frame::ResponseHeader;

/// A vendor-specific reply prefix accepted as an acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quirk {
    /// Bytes the reply must start with
    pub prefix: Cow<'static, [u8]>,
    /// What the sequence is believed to be
    pub meaning: Cow<'static, str>,
}

impl Quirk {
    /// Create a quirk from owned data (for patterns discovered at runtime)
    pub fn new(prefix: impl Into<Vec<u8>>, meaning: impl Into<String>) -> Self {
        Self {
            prefix: Cow::Owned(prefix.into()),
            meaning: Cow::Owned(meaning.into()),
        }
    }

    /// Does `response` start with this quirk's prefix?
    pub fn matches(&self, response: &[u8]) -> bool {
        !self.prefix.is_empty() && response.starts_with(&self.prefix)
    }
}

impl fmt::Display for Quirk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", format_hex(&self.prefix), self.meaning)
    }
}

/// Known non-standard replies from the motor controller firmware
pub const VENDOR_QUIRKS: &[Quirk] = &[
    Quirk {
        prefix: Cow::Borrowed(&[0x7e, 0x25]),
        meaning: Cow::Borrowed("controller status banner sent instead of an echo"),
    },
    Quirk {
        prefix: Cow::Borrowed(&[0x01, 0x90, 0x04, 0x4d, 0xc3]),
        meaning: Cow::Borrowed(
            "exception 0x04 to write-multiple-registers, sent although the move executes",
        ),
    },
];

/// Which rule accepted a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckPattern {
    /// The reply echoed the expected slave id and function code
    Standard { slave_id: u8, function: u8 },
    /// The reply started with a known vendor sequence
    Literal(Quirk),
}

impl fmt::Display for AckPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckPattern::Standard { slave_id, function } => {
                write!(f, "standard echo (slave {}, function {:#04x})", slave_id, function)
            }
            AckPattern::Literal(quirk) => write!(f, "vendor quirk {}", quirk),
        }
    }
}

/// The standard rule plus a quirks table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptancePolicy {
    slave_id: u8,
    function: u8,
    quirks: Vec<Quirk>,
}

impl AcceptancePolicy {
    /// Policy for the given slave/function, with the built-in quirks table
    pub fn new(slave_id: u8, function: u8) -> Self {
        Self {
            slave_id,
            function,
            quirks: VENDOR_QUIRKS.to_vec(),
        }
    }

    /// Policy accepting only standard echoes
    pub fn strict(slave_id: u8, function: u8) -> Self {
        Self {
            slave_id,
            function,
            quirks: Vec::new(),
        }
    }

    /// Extend the quirks table
    pub fn with_quirk(mut self, quirk: Quirk) -> Self {
        self.quirks.push(quirk);
        self
    }

    /// The same table, for a different function code
    pub fn for_function(&self, function: u8) -> Self {
        Self {
            function,
            ..self.clone()
        }
    }

    /// Quirks currently recognised
    pub fn quirks(&self) -> &[Quirk] {
        &self.quirks
    }

    /// Classify a reply; `None` means it is not an acknowledgement
    pub fn classify(&self, response: &[u8]) -> Option<AckPattern> {
        let header = ResponseHeader::peek(response);
        if header.is_some_and(|h| h.slave_id == self.slave_id && h.function == self.function) {
            return Some(AckPattern::Standard {
                slave_id: self.slave_id,
                function: self.function,
            });
        }
        self.quirks
            .iter()
            .find(|q| q.matches(response))
            .cloned()
            .map(AckPattern::Literal)
    }

    /// Is `response` an acknowledgement?
    pub fn accepts(&self, response: &[u8]) -> bool {
        self.classify(response).is_some()
    }
}

/// Check a reply against the standard rule and the built-in quirks table
pub fn accepts(response: &[u8], expected_slave_id: u8, expected_function: u8) -> bool {
    AcceptancePolicy::new(expected_slave_id, expected_function).accepts(response)
}
