// Outer EAP-TEAP framing: flags/version byte, length fields, fragment reassembly.

use thiserror::Error;

/// EAP method type assigned to TEAP.
pub const EAP_TYPE_TEAP: u8 = 55;

/// Highest TEAP version this implementation speaks.
pub const TEAP_VERSION: u8 = 1;

/// Lowest TEAP version this implementation accepts.
pub const TEAP_MIN_VERSION: u8 = 1;

/// Bit-flags carried in the first octet after the EAP type.
pub mod flags {
    /// Four-byte total message length follows.
    pub const LENGTH_INCLUDED: u8 = 0x80;
    /// More fragments follow this one.
    pub const MORE_FRAGMENTS: u8 = 0x40;
    /// TEAP/Start indicator.
    pub const START: u8 = 0x20;
    /// Four-byte big-endian Outer-TLV-Length field follows.
    pub const OUTER_TLV_LENGTH: u8 = 0x10;
    /// Low three bits carry the protocol version.
    pub const VERSION_MASK: u8 = 0x07;
}

/// Outer framing error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the declared framing requires.
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Declared Outer-TLV-Length exceeds the remaining message bytes.
    #[error("outer tlv length {declared} exceeds remaining {available} bytes")]
    OuterTlvOverrun { declared: usize, available: usize },

    /// Outer-TLV-Length flag set with a zero-length field.
    #[error("outer tlv length flag set but declared length is zero")]
    EmptyOuterTlvs,

    /// Fragment data exceeded the length declared in the first fragment.
    #[error("reassembled {received} bytes exceeds declared message length {declared}")]
    FragmentOverflow { declared: usize, received: usize },

    /// Final fragment did not complete the declared message length.
    #[error("reassembled {received} bytes, declared message length {declared}")]
    FragmentUnderrun { declared: usize, received: usize },
}

/// One parsed outer TEAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeapFrame<'a> {
    pub flags: u8,
    /// Total message length from the L field, when present.
    pub message_length: Option<u32>,
    /// TLS record bytes (possibly one fragment of a larger flight).
    pub tls_data: &'a [u8],
    /// Trailing outer TLVs, empty unless the O flag was set.
    pub outer_tlvs: &'a [u8],
}

impl<'a> TeapFrame<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, WireError> {
        if buf.is_empty() {
            return Err(WireError::BufferTooShort {
                expected: 1,
                actual: 0,
            });
        }

        let frame_flags = buf[0];
        let mut offset = 1;

        let message_length = if frame_flags & flags::LENGTH_INCLUDED != 0 {
            if buf.len() < offset + 4 {
                return Err(WireError::BufferTooShort {
                    expected: offset + 4,
                    actual: buf.len(),
                });
            }
            let len = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap());
            offset += 4;
            Some(len)
        } else {
            None
        };

        let outer_len = if frame_flags & flags::OUTER_TLV_LENGTH != 0 {
            if buf.len() < offset + 4 {
                return Err(WireError::BufferTooShort {
                    expected: offset + 4,
                    actual: buf.len(),
                });
            }
            let len = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if len == 0 {
                return Err(WireError::EmptyOuterTlvs);
            }
            len
        } else {
            0
        };

        let remaining = buf.len() - offset;
        if outer_len > remaining {
            return Err(WireError::OuterTlvOverrun {
                declared: outer_len,
                available: remaining,
            });
        }

        let tls_end = buf.len() - outer_len;
        Ok(Self {
            flags: frame_flags,
            message_length,
            tls_data: &buf[offset..tls_end],
            outer_tlvs: &buf[tls_end..],
        })
    }

    pub fn version(&self) -> u8 {
        self.flags & flags::VERSION_MASK
    }

    pub fn is_start(&self) -> bool {
        self.flags & flags::START != 0
    }

    pub fn has_more_fragments(&self) -> bool {
        self.flags & flags::MORE_FRAGMENTS != 0
    }
}

/// Builds an unfragmented outer message.
pub fn build_frame(version: u8, start: bool, tls_data: &[u8], outer_tlvs: &[u8]) -> Vec<u8> {
    let mut frame_flags = version & flags::VERSION_MASK;
    if start {
        frame_flags |= flags::START;
    }
    if !outer_tlvs.is_empty() {
        frame_flags |= flags::OUTER_TLV_LENGTH;
    }

    let mut out = Vec::with_capacity(1 + 4 + tls_data.len() + outer_tlvs.len());
    out.push(frame_flags);
    if !outer_tlvs.is_empty() {
        out.extend_from_slice(&(outer_tlvs.len() as u32).to_be_bytes());
    }
    out.extend_from_slice(tls_data);
    out.extend_from_slice(outer_tlvs);
    out
}

/// Builds an empty acknowledgement frame for a received fragment.
pub fn build_fragment_ack(version: u8) -> Vec<u8> {
    vec![version & flags::VERSION_MASK]
}

/// Reassembles fragmented TLS flights.
///
/// Feed every inbound frame through [`Reassembler::push`]; `None` means a
/// fragment was buffered and an ack frame should be sent, `Some` carries
/// the complete TLS data.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    declared: Option<usize>,
    active: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: &TeapFrame<'_>) -> Result<Option<Vec<u8>>, WireError> {
        if !self.active && !frame.has_more_fragments() {
            // Common case: unfragmented message.
            return Ok(Some(frame.tls_data.to_vec()));
        }

        if !self.active {
            self.active = true;
            self.declared = frame.message_length.map(|len| len as usize);
        }
        self.buf.extend_from_slice(frame.tls_data);

        if let Some(declared) = self.declared {
            if self.buf.len() > declared {
                let received = self.buf.len();
                self.reset();
                return Err(WireError::FragmentOverflow { declared, received });
            }
        }

        if frame.has_more_fragments() {
            return Ok(None);
        }

        if let Some(declared) = self.declared {
            if self.buf.len() != declared {
                let received = self.buf.len();
                self.reset();
                return Err(WireError::FragmentUnderrun { declared, received });
            }
        }

        let assembled = std::mem::take(&mut self.buf);
        self.reset();
        Ok(Some(assembled))
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.declared = None;
        self.active = false;
    }
}
