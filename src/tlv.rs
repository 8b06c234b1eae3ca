// TEAP TLV wire format: header codec, cursor, and Phase-2 payload parsing.

use thiserror::Error;
use tracing::debug;

/// Mandatory bit in the TLV type field.
pub const TLV_MANDATORY: u16 = 0x8000;

/// Reserved bit in the TLV type field; masked off on parse.
pub const TLV_RESERVED: u16 = 0x4000;

/// Mask extracting the 14-bit TLV type.
pub const TLV_TYPE_MASK: u16 = 0x3FFF;

const TLV_HEADER_LEN: usize = 4;

/// Fixed Crypto-Binding TLV body length (RFC 7170 section 4.2.13).
pub const CRYPTO_BINDING_BODY_LEN: usize = 76;

/// Error TLV code: tunnel and inner method binding compromised.
pub const ERROR_TUNNEL_COMPROMISE: u32 = 2001;

/// Error TLV code: TLV combination not permitted in this state.
pub const ERROR_UNEXPECTED_TLVS_EXCHANGED: u32 = 2002;

/// TLV type identifiers (RFC 7170 section 4.2).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvType {
    AuthorityId = 1,
    IdentityType = 2,
    Result = 3,
    Nak = 4,
    Error = 5,
    ChannelBinding = 6,
    VendorSpecific = 7,
    RequestAction = 8,
    EapPayload = 9,
    IntermediateResult = 10,
    Pac = 11,
    CryptoBinding = 12,
    BasicPasswordAuthReq = 13,
    BasicPasswordAuthResp = 14,
    Pkcs7 = 15,
    Pkcs10 = 16,
    TrustedServerRoot = 17,
}

impl TlvType {
    fn from_raw(value: u16) -> Option<Self> {
        match value {
            1 => Some(TlvType::AuthorityId),
            2 => Some(TlvType::IdentityType),
            3 => Some(TlvType::Result),
            4 => Some(TlvType::Nak),
            5 => Some(TlvType::Error),
            6 => Some(TlvType::ChannelBinding),
            7 => Some(TlvType::VendorSpecific),
            8 => Some(TlvType::RequestAction),
            9 => Some(TlvType::EapPayload),
            10 => Some(TlvType::IntermediateResult),
            11 => Some(TlvType::Pac),
            12 => Some(TlvType::CryptoBinding),
            13 => Some(TlvType::BasicPasswordAuthReq),
            14 => Some(TlvType::BasicPasswordAuthResp),
            15 => Some(TlvType::Pkcs7),
            16 => Some(TlvType::Pkcs10),
            17 => Some(TlvType::TrustedServerRoot),
            _ => None,
        }
    }
}

/// TLV-level error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    /// Fewer than four header bytes remain.
    #[error("tlv header truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Declared value length exceeds the remaining buffer.
    #[error("tlv type {tlv_type} declares {declared} value bytes, only {available} remain")]
    ValueOverrun {
        tlv_type: u16,
        declared: usize,
        available: usize,
    },

    /// A second instance of a TLV that must appear at most once.
    #[error("duplicate tlv type {tlv_type}")]
    Duplicate { tlv_type: u16 },

    /// Value shorter than the type's fixed minimum.
    #[error("tlv type {tlv_type} too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        tlv_type: u16,
        expected: usize,
        actual: usize,
    },

    /// Fixed-size TLV body with the wrong length.
    #[error("tlv type {tlv_type} has invalid length {len}")]
    InvalidLength { tlv_type: u16, len: usize },
}

/// Parsed TLV view borrowing into the message buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    /// 14-bit type identifier.
    pub tlv_type: u16,
    /// Mandatory (M) bit.
    pub mandatory: bool,
    /// Value bytes.
    pub value: &'a [u8],
}

impl<'a> Tlv<'a> {
    /// Returns the enum variant when the type is known.
    pub fn kind(&self) -> Option<TlvType> {
        TlvType::from_raw(self.tlv_type)
    }
}

/// Parses a single TLV from the front of `buf`, returning it and the bytes consumed.
pub fn parse_one(buf: &[u8]) -> Result<(Tlv<'_>, usize), TlvError> {
    if buf.len() < TLV_HEADER_LEN {
        return Err(TlvError::Truncated {
            expected: TLV_HEADER_LEN,
            actual: buf.len(),
        });
    }

    let type_field = u16::from_be_bytes([buf[0], buf[1]]);
    let tlv_type = type_field & TLV_TYPE_MASK;
    let mandatory = type_field & TLV_MANDATORY != 0;
    let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;

    let available = buf.len() - TLV_HEADER_LEN;
    if declared > available {
        return Err(TlvError::ValueOverrun {
            tlv_type,
            declared,
            available,
        });
    }

    let value = &buf[TLV_HEADER_LEN..TLV_HEADER_LEN + declared];
    Ok((
        Tlv {
            tlv_type,
            mandatory,
            value,
        },
        TLV_HEADER_LEN + declared,
    ))
}

/// Cursor over a sequence of TLVs.
pub struct TlvCursor<'a> {
    buf: &'a [u8],
    offset: usize,
    finished: bool,
}

impl<'a> TlvCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            finished: false,
        }
    }

    /// Total bytes consumed so far.
    pub fn consumed_len(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for TlvCursor<'a> {
    type Item = Result<Tlv<'a>, TlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.offset >= self.buf.len() {
            self.finished = true;
            return None;
        }
        match parse_one(&self.buf[self.offset..]) {
            Ok((tlv, consumed)) => {
                self.offset += consumed;
                Some(Ok(tlv))
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Appends a TLV header; `type_field` carries the mandatory bit when wanted.
pub fn put_tlv_header(out: &mut Vec<u8>, type_field: u16, len: u16) {
    out.extend_from_slice(&type_field.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
}

/// Appends a complete TLV.
pub fn put_tlv(out: &mut Vec<u8>, tlv_type: TlvType, mandatory: bool, value: &[u8]) {
    let mut type_field = tlv_type as u16;
    if mandatory {
        type_field |= TLV_MANDATORY;
    }
    put_tlv_header(out, type_field, value.len() as u16);
    out.extend_from_slice(value);
}

/// Result / Intermediate-Result status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
}

impl Status {
    /// Decodes a wire status. Values outside {1, 2} coerce to Failure.
    pub fn from_wire(value: u16) -> Self {
        match value {
            1 => Status::Success,
            2 => Status::Failure,
            other => {
                debug!(status = other, "out-of-range result status, forcing failure");
                Status::Failure
            }
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            Status::Success => 1,
            Status::Failure => 2,
        }
    }
}

/// Appends a Result or Intermediate-Result TLV.
pub fn put_result(out: &mut Vec<u8>, intermediate: bool, status: Status) {
    let kind = if intermediate {
        TlvType::IntermediateResult
    } else {
        TlvType::Result
    };
    put_tlv(out, kind, true, &status.to_wire().to_be_bytes());
}

/// Appends an Error TLV with the given error code.
pub fn put_error(out: &mut Vec<u8>, code: u32) {
    put_tlv(out, TlvType::Error, true, &code.to_be_bytes());
}

/// Appends a NAK TLV rejecting `nak_type`.
pub fn put_nak(out: &mut Vec<u8>, vendor_id: u32, nak_type: u16) {
    let mut value = Vec::with_capacity(6);
    value.extend_from_slice(&vendor_id.to_be_bytes());
    value.extend_from_slice(&nak_type.to_be_bytes());
    put_tlv(out, TlvType::Nak, true, &value);
}

/// Appends an Identity-Type TLV.
pub fn put_identity_type(out: &mut Vec<u8>, identity_type: u16) {
    put_tlv(out, TlvType::IdentityType, true, &identity_type.to_be_bytes());
}

/// Appends an EAP-Payload TLV wrapping a full inner EAP packet.
pub fn put_eap_payload(out: &mut Vec<u8>, packet: &[u8]) {
    put_tlv(out, TlvType::EapPayload, true, packet);
}

/// Request-Action TLV actions.
pub const ACTION_PROCESS_TLV: u8 = 1;
pub const ACTION_NEGOTIATE_EAP: u8 = 2;

/// Parsed Request-Action TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestAction {
    pub status: u8,
    pub action: u8,
}

/// Appends a Request-Action TLV, optionally followed by nested TLVs.
pub fn put_request_action(out: &mut Vec<u8>, status: u8, action: u8, nested: &[u8]) {
    let mut value = Vec::with_capacity(2 + nested.len());
    value.push(status);
    value.push(action);
    value.extend_from_slice(nested);
    put_tlv(out, TlvType::RequestAction, true, &value);
}

/// NAK TLV payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nak {
    pub vendor_id: u32,
    pub nak_type: u16,
}

/// Compound MAC flag values in the Crypto-Binding TLV.
pub const CMAC_EMSK: u8 = 1;
pub const CMAC_MSK: u8 = 2;
pub const CMAC_EMSK_AND_MSK: u8 = 3;

/// Crypto-Binding sub-types.
pub const CB_SUBTYPE_REQUEST: u8 = 0;
pub const CB_SUBTYPE_RESPONSE: u8 = 1;

/// Crypto-Binding TLV body.
///
/// Constructed once per crypto-binding round and discarded after
/// validation. The two MAC fields are zeroed when the TLV is fed into
/// compound-MAC computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoBinding {
    pub reserved: u8,
    pub version: u8,
    pub received_version: u8,
    pub flags: u8,
    pub subtype: u8,
    pub nonce: [u8; 32],
    pub emsk_compound_mac: [u8; 20],
    pub msk_compound_mac: [u8; 20],
}

impl CryptoBinding {
    /// Parses the fixed 76-byte body.
    pub fn parse(value: &[u8]) -> Result<Self, TlvError> {
        if value.len() != CRYPTO_BINDING_BODY_LEN {
            return Err(TlvError::InvalidLength {
                tlv_type: TlvType::CryptoBinding as u16,
                len: value.len(),
            });
        }
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&value[4..36]);
        let mut emsk_compound_mac = [0u8; 20];
        emsk_compound_mac.copy_from_slice(&value[36..56]);
        let mut msk_compound_mac = [0u8; 20];
        msk_compound_mac.copy_from_slice(&value[56..76]);
        Ok(Self {
            reserved: value[0],
            version: value[1],
            received_version: value[2],
            flags: value[3] >> 4,
            subtype: value[3] & 0x0F,
            nonce,
            emsk_compound_mac,
            msk_compound_mac,
        })
    }

    /// Encodes the fixed body.
    pub fn encode_body(&self) -> [u8; CRYPTO_BINDING_BODY_LEN] {
        let mut body = [0u8; CRYPTO_BINDING_BODY_LEN];
        body[0] = self.reserved;
        body[1] = self.version;
        body[2] = self.received_version;
        body[3] = (self.flags << 4) | (self.subtype & 0x0F);
        body[4..36].copy_from_slice(&self.nonce);
        body[36..56].copy_from_slice(&self.emsk_compound_mac);
        body[56..76].copy_from_slice(&self.msk_compound_mac);
        body
    }

    /// Encodes header plus body as sent on the wire.
    pub fn to_tlv_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TLV_HEADER_LEN + CRYPTO_BINDING_BODY_LEN);
        put_tlv_header(
            &mut out,
            TlvType::CryptoBinding as u16 | TLV_MANDATORY,
            CRYPTO_BINDING_BODY_LEN as u16,
        );
        out.extend_from_slice(&self.encode_body());
        out
    }
}

/// Parsed Phase-2 message contents.
///
/// Borrows into the decrypted buffer; at most one instance of each
/// tracked TLV is accepted, a second occurrence aborts parsing.
#[derive(Debug, Default)]
pub struct Phase2Payload<'a> {
    pub result: Option<Status>,
    pub intermediate_result: Option<Status>,
    pub crypto_binding: Option<CryptoBinding>,
    pub eap_payload: Option<&'a [u8]>,
    pub pac: Option<&'a [u8]>,
    pub basic_auth_req: Option<&'a [u8]>,
    pub basic_auth_resp: Option<&'a [u8]>,
    pub request_action: Option<RequestAction>,
    pub request_action_tlvs: Option<&'a [u8]>,
    pub identity_type: Option<u16>,
    pub authority_id: Option<&'a [u8]>,
    pub nak: Option<Nak>,
    pub error_code: Option<u32>,
    /// Unrecognized mandatory TLV types; the caller answers with a NAK.
    pub unknown_mandatory: Vec<u16>,
}

fn check_len(tlv: &Tlv<'_>, min: usize) -> Result<(), TlvError> {
    if tlv.value.len() < min {
        return Err(TlvError::TooShort {
            tlv_type: tlv.tlv_type,
            expected: min,
            actual: tlv.value.len(),
        });
    }
    Ok(())
}

fn duplicate<T>(slot: &Option<T>, tlv_type: u16) -> Result<(), TlvError> {
    if slot.is_some() {
        return Err(TlvError::Duplicate { tlv_type });
    }
    Ok(())
}

/// Parses the TLVs of one decrypted Phase-2 message into an accumulator.
pub fn parse_phase2(buf: &[u8]) -> Result<Phase2Payload<'_>, TlvError> {
    let mut out = Phase2Payload::default();

    for item in TlvCursor::new(buf) {
        let tlv = item?;
        match tlv.kind() {
            Some(TlvType::Result) => {
                duplicate(&out.result, tlv.tlv_type)?;
                check_len(&tlv, 2)?;
                let status = u16::from_be_bytes([tlv.value[0], tlv.value[1]]);
                out.result = Some(Status::from_wire(status));
            }
            Some(TlvType::IntermediateResult) => {
                duplicate(&out.intermediate_result, tlv.tlv_type)?;
                check_len(&tlv, 2)?;
                let status = u16::from_be_bytes([tlv.value[0], tlv.value[1]]);
                out.intermediate_result = Some(Status::from_wire(status));
            }
            Some(TlvType::CryptoBinding) => {
                duplicate(&out.crypto_binding, tlv.tlv_type)?;
                out.crypto_binding = Some(CryptoBinding::parse(tlv.value)?);
            }
            Some(TlvType::EapPayload) => {
                duplicate(&out.eap_payload, tlv.tlv_type)?;
                out.eap_payload = Some(tlv.value);
            }
            Some(TlvType::Pac) => {
                duplicate(&out.pac, tlv.tlv_type)?;
                out.pac = Some(tlv.value);
            }
            Some(TlvType::BasicPasswordAuthReq) => {
                duplicate(&out.basic_auth_req, tlv.tlv_type)?;
                out.basic_auth_req = Some(tlv.value);
            }
            Some(TlvType::BasicPasswordAuthResp) => {
                duplicate(&out.basic_auth_resp, tlv.tlv_type)?;
                out.basic_auth_resp = Some(tlv.value);
            }
            Some(TlvType::RequestAction) => {
                duplicate(&out.request_action, tlv.tlv_type)?;
                check_len(&tlv, 2)?;
                out.request_action = Some(RequestAction {
                    status: tlv.value[0],
                    action: tlv.value[1],
                });
                if tlv.value.len() > 2 {
                    out.request_action_tlvs = Some(&tlv.value[2..]);
                }
            }
            Some(TlvType::IdentityType) => {
                check_len(&tlv, 2)?;
                out.identity_type = Some(u16::from_be_bytes([tlv.value[0], tlv.value[1]]));
            }
            Some(TlvType::AuthorityId) => {
                out.authority_id = Some(tlv.value);
            }
            Some(TlvType::Nak) => {
                check_len(&tlv, 6)?;
                out.nak = Some(Nak {
                    vendor_id: u32::from_be_bytes([
                        tlv.value[0],
                        tlv.value[1],
                        tlv.value[2],
                        tlv.value[3],
                    ]),
                    nak_type: u16::from_be_bytes([tlv.value[4], tlv.value[5]]),
                });
            }
            Some(TlvType::Error) => {
                check_len(&tlv, 4)?;
                out.error_code = Some(u32::from_be_bytes([
                    tlv.value[0],
                    tlv.value[1],
                    tlv.value[2],
                    tlv.value[3],
                ]));
            }
            Some(other) => {
                debug!(tlv_type = tlv.tlv_type, "ignoring unhandled tlv {other:?}");
            }
            None => {
                if tlv.mandatory {
                    out.unknown_mandatory.push(tlv.tlv_type);
                } else {
                    debug!(tlv_type = tlv.tlv_type, "skipping unknown optional tlv");
                }
            }
        }
    }

    Ok(out)
}
