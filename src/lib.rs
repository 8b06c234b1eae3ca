// Teaport: EAP-TEAP (RFC 7170) protocol core for a wireless supplicant stack.

pub mod config;

pub mod wire;

pub mod tlv;

pub mod crypto;

pub mod pac;

pub mod tunnel;

pub mod inner;

pub mod peer;

pub mod server;

#[cfg(test)]
mod exchange_tests;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{Config, ConfigError, IdentityPolicy, PeerConfig, ProvisioningMode, ServerConfig};

pub use wire::{TeapFrame, WireError, EAP_TYPE_TEAP, TEAP_MIN_VERSION, TEAP_VERSION};

pub use tlv::{
    CryptoBinding, Nak, Phase2Payload, RequestAction, Status, Tlv, TlvCursor, TlvError, TlvType,
};

pub use crypto::{
    binding::{compute_compound_mac, verify_compound_mac, COMPOUND_MAC_LEN},
    keys::{
        KeyState, CMK_LEN, EMSK_LEN, MSK_LEN, SESSION_KEY_SEED_LEN, SIMCK_LEN, TLS_EXPORTER_LABEL,
    },
    prf::{is_anon_provisioning_suite, MacAlgorithm, PrfError},
};

pub use pac::{
    opaque::{OpaqueError, PacOpaquePlain, WRAP_KEY_LEN},
    persist::PersistError,
    PacEntry, PacError, PacKey, PacStore, PAC_KEY_LEN, PAC_TYPE_TUNNEL,
};

pub use tunnel::{SessionTicketCallback, TlsTunnel, TunnelError, TICKET_MASTER_SECRET_LEN};

pub use inner::{
    EapPacket, InnerAuthenticator, InnerEapMethod, InnerError, InnerStep, MethodDecision,
};

pub use peer::{PeerError, PeerOutput, PeerState, SessionStatus, TeapPeer};

pub use server::{PasswordVerifier, ServerError, ServerOutput, ServerState, TeapServer};
