// External TLS engine seam: the interface the TEAP core drives the tunnel through.

use thiserror::Error;

/// Length of the resumption master secret a session-ticket callback returns
/// (the PAC-Key doubles as the TLS master secret on abbreviated handshakes).
pub const TICKET_MASTER_SECRET_LEN: usize = 48;

/// TLS engine error as seen by the TEAP core.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Handshake processing failed; the session cannot continue.
    #[error("tls handshake failed: {0}")]
    Handshake(String),

    /// Operation requires an established tunnel.
    #[error("tls tunnel not established")]
    NotEstablished,

    /// Keying-material export failed.
    #[error("tls key export failed: {0}")]
    Export(String),

    /// Record encryption or decryption failed.
    #[error("tls record protection failed: {0}")]
    Record(String),

    /// Session ticket could not be attached.
    #[error("tls session ticket rejected: {0}")]
    Ticket(String),
}

/// Callback invoked by the engine when the peer presents a session ticket
/// (a PAC-Opaque). Returns the resumption master secret on acceptance,
/// `None` to fall back to a full handshake.
pub type SessionTicketCallback =
    Box<dyn FnMut(&[u8]) -> Option<[u8; TICKET_MASTER_SECRET_LEN]>>;

/// The TLS engine collaborator.
///
/// The TEAP core never looks inside records or the handshake; it pumps
/// opaque bytes through this interface and consumes four facts: whether the
/// tunnel is up, which cipher suite was negotiated, exported key material,
/// and whether the handshake was an abbreviated (resumed) one.
pub trait TlsTunnel {
    fn is_established(&self) -> bool;

    /// Feeds inbound handshake bytes, returning the outbound flight
    /// (possibly empty once the handshake completes).
    fn handshake(&mut self, incoming: &[u8]) -> Result<Vec<u8>, TunnelError>;

    /// RFC 5705-style keying-material export.
    fn export_key(&self, label: &str, context: &[u8], len: usize) -> Result<Vec<u8>, TunnelError>;

    /// Negotiated cipher suite code.
    fn cipher_suite(&self) -> Result<u16, TunnelError>;

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TunnelError>;

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, TunnelError>;

    /// Peer side: attaches a PAC-Opaque as the session ticket for the next
    /// handshake.
    fn set_session_ticket(&mut self, ticket: &[u8]) -> Result<(), TunnelError>;

    /// Server side: installs the ticket unwrap callback.
    fn set_session_ticket_callback(&mut self, cb: SessionTicketCallback);

    /// Whether the established tunnel came from an abbreviated handshake.
    fn resumed(&self) -> bool;

    /// Whether the peer authenticated with a verified client certificate.
    fn client_certificate_verified(&self) -> bool {
        false
    }
}
