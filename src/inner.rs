// Inner EAP method seam and the minimal RFC 3748 packet codec the core needs.

use thiserror::Error;

pub const EAP_CODE_REQUEST: u8 = 1;
pub const EAP_CODE_RESPONSE: u8 = 2;
pub const EAP_CODE_SUCCESS: u8 = 3;
pub const EAP_CODE_FAILURE: u8 = 4;

pub const EAP_TYPE_IDENTITY: u8 = 1;
pub const EAP_TYPE_NAK: u8 = 3;
pub const EAP_TYPE_AKA: u8 = 23;
pub const EAP_TYPE_MSCHAPV2: u8 = 26;
pub const EAP_TYPE_AKA_PRIME: u8 = 50;
pub const EAP_TYPE_PWD: u8 = 52;
pub const EAP_TYPE_EKE: u8 = 53;

/// Inner methods acceptable while provisioning over an unauthenticated
/// tunnel: mutual authentication, key generation, and dictionary-attack
/// resistance are all required. Membership is deliberate, not inferred.
pub const ANON_PROVISIONING_INNER_TYPES: &[u8] = &[EAP_TYPE_MSCHAPV2, EAP_TYPE_PWD, EAP_TYPE_EKE];

const EAP_HEADER_LEN: usize = 4;

/// Inner-method error.
#[derive(Debug, Error)]
pub enum InnerError {
    /// Inner EAP packet framing violation.
    #[error("inner eap packet malformed: {0}")]
    Malformed(&'static str),

    /// The concrete method failed internally.
    #[error("inner method error: {0}")]
    Method(String),
}

/// Borrowed view of one inner EAP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EapPacket<'a> {
    pub code: u8,
    pub identifier: u8,
    /// Method type; absent for Success/Failure packets.
    pub eap_type: Option<u8>,
    pub type_data: &'a [u8],
}

impl<'a> EapPacket<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, InnerError> {
        if buf.len() < EAP_HEADER_LEN {
            return Err(InnerError::Malformed("header truncated"));
        }
        let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if declared < EAP_HEADER_LEN || declared > buf.len() {
            return Err(InnerError::Malformed("bad length field"));
        }
        let (eap_type, type_data) = if declared > EAP_HEADER_LEN {
            (Some(buf[4]), &buf[5..declared])
        } else {
            (None, &buf[declared..declared])
        };
        Ok(Self {
            code: buf[0],
            identifier: buf[1],
            eap_type,
            type_data,
        })
    }
}

/// Builds a full EAP packet.
pub fn build_packet(code: u8, identifier: u8, eap_type: u8, type_data: &[u8]) -> Vec<u8> {
    let total = EAP_HEADER_LEN + 1 + type_data.len();
    let mut out = Vec::with_capacity(total);
    out.push(code);
    out.push(identifier);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.push(eap_type);
    out.extend_from_slice(type_data);
    out
}

/// Builds an EAP Identity request.
pub fn build_identity_request(identifier: u8) -> Vec<u8> {
    build_packet(EAP_CODE_REQUEST, identifier, EAP_TYPE_IDENTITY, &[])
}

/// Builds an EAP Identity response carrying `identity`.
pub fn build_identity_response(identifier: u8, identity: &[u8]) -> Vec<u8> {
    build_packet(EAP_CODE_RESPONSE, identifier, EAP_TYPE_IDENTITY, identity)
}

/// Builds a legacy Nak response listing the types we would accept.
pub fn build_nak_response(identifier: u8, preferred: &[u8]) -> Vec<u8> {
    build_packet(EAP_CODE_RESPONSE, identifier, EAP_TYPE_NAK, preferred)
}

/// One step of a peer-side inner method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InnerStep {
    /// Response packet to tunnel back to the server.
    Response(Vec<u8>),
    /// The method is waiting on an external round trip (SIM card,
    /// external process); re-invoke later with the same request.
    Pending,
}

/// Peer-side inner EAP method.
///
/// One instance per session; the TEAP peer feeds it decrypted EAP-Payload
/// requests and collects MSK/EMSK once the method completes.
pub trait InnerEapMethod {
    fn method_type(&self) -> u8;

    fn process(&mut self, request: &EapPacket<'_>) -> Result<InnerStep, InnerError>;

    fn is_key_available(&self) -> bool;

    /// Inner MSK once available.
    fn key(&self) -> Option<Vec<u8>>;

    /// Inner EMSK, when the method exports one.
    fn emsk(&self) -> Option<Vec<u8>>;
}

/// Verdict of a server-side inner method step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodDecision {
    /// Another request to tunnel to the peer.
    Continue(Vec<u8>),
    Success,
    Failure,
}

/// Server-side inner EAP method driver.
pub trait InnerAuthenticator {
    fn method_type(&self) -> u8;

    /// Produces the first method request after the identity exchange.
    fn initiate(&mut self, identifier: u8, identity: &[u8]) -> Result<Vec<u8>, InnerError>;

    fn process(&mut self, response: &EapPacket<'_>) -> Result<MethodDecision, InnerError>;

    fn key(&self) -> Option<Vec<u8>>;

    fn emsk(&self) -> Option<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip() {
        let wire = build_packet(EAP_CODE_REQUEST, 7, EAP_TYPE_MSCHAPV2, b"challenge");
        let packet = EapPacket::parse(&wire).expect("parse");
        assert_eq!(packet.code, EAP_CODE_REQUEST);
        assert_eq!(packet.identifier, 7);
        assert_eq!(packet.eap_type, Some(EAP_TYPE_MSCHAPV2));
        assert_eq!(packet.type_data, b"challenge");
    }

    #[test]
    fn identity_response_carries_name() {
        let wire = build_identity_response(3, b"alice");
        let packet = EapPacket::parse(&wire).expect("parse");
        assert_eq!(packet.eap_type, Some(EAP_TYPE_IDENTITY));
        assert_eq!(packet.type_data, b"alice");
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(EapPacket::parse(&[1, 2, 0]).is_err());
    }

    #[test]
    fn length_field_validated() {
        // Declared length larger than buffer.
        let wire = [EAP_CODE_REQUEST, 1, 0x00, 0x20, EAP_TYPE_IDENTITY];
        assert!(EapPacket::parse(&wire).is_err());
        // Declared length below header size.
        let wire = [EAP_CODE_REQUEST, 1, 0x00, 0x02, EAP_TYPE_IDENTITY];
        assert!(EapPacket::parse(&wire).is_err());
    }

    #[test]
    fn success_packet_has_no_type() {
        let wire = [EAP_CODE_SUCCESS, 9, 0x00, 0x04];
        let packet = EapPacket::parse(&wire).expect("parse");
        assert_eq!(packet.eap_type, None);
        assert!(packet.type_data.is_empty());
    }

    #[test]
    fn nak_lists_preferred_types() {
        let wire = build_nak_response(2, &[EAP_TYPE_MSCHAPV2, EAP_TYPE_PWD]);
        let packet = EapPacket::parse(&wire).expect("parse");
        assert_eq!(packet.eap_type, Some(EAP_TYPE_NAK));
        assert_eq!(packet.type_data, &[EAP_TYPE_MSCHAPV2, EAP_TYPE_PWD]);
    }
}
