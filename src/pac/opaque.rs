// PAC-Opaque: server-sealed credential blob wrapped with AES key wrap (RFC 3394).

use aes_kw::KekAes256;
use thiserror::Error;
use zeroize::Zeroize;

use super::{PacKey, PAC_KEY_LEN};

// Plaintext entry identifiers inside the opaque blob.
const OPAQUE_TYPE_PAD: u8 = 0;
const OPAQUE_TYPE_KEY: u8 = 1;
const OPAQUE_TYPE_LIFETIME: u8 = 2;
const OPAQUE_TYPE_IDENTITY: u8 = 3;

/// Length of the key used to wrap PAC-Opaque blobs.
pub const WRAP_KEY_LEN: usize = 32;

/// PAC-Opaque seal/open error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpaqueError {
    /// AES key wrap failed.
    #[error("pac-opaque wrap failed")]
    Wrap,

    /// Integrity check failed or the blob is not ours.
    #[error("pac-opaque unwrap failed")]
    Unwrap,

    /// Plaintext entry framing ran past the end of the blob.
    #[error("pac-opaque plaintext malformed")]
    Malformed,

    /// No PAC-Key entry in the unwrapped plaintext.
    #[error("pac-opaque carries no pac key")]
    MissingKey,
}

/// Decoded PAC-Opaque contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacOpaquePlain {
    pub pac_key: PacKey,
    /// Expiry as epoch seconds.
    pub lifetime: u32,
    pub identity: Option<Vec<u8>>,
}

/// Seals the plaintext under the server's wrap key.
///
/// Entries are `{id:u8, len:u8, value}` framed and padded with zero bytes
/// to the 8-byte multiple AES-KW requires.
pub fn seal(plain: &PacOpaquePlain, wrap_key: &[u8; WRAP_KEY_LEN]) -> Result<Vec<u8>, OpaqueError> {
    let mut buf = Vec::with_capacity(2 + PAC_KEY_LEN + 6 + 32);
    buf.push(OPAQUE_TYPE_KEY);
    buf.push(PAC_KEY_LEN as u8);
    buf.extend_from_slice(plain.pac_key.as_bytes());
    buf.push(OPAQUE_TYPE_LIFETIME);
    buf.push(4);
    buf.extend_from_slice(&plain.lifetime.to_be_bytes());
    if let Some(identity) = &plain.identity {
        let len = identity.len().min(u8::MAX as usize);
        buf.push(OPAQUE_TYPE_IDENTITY);
        buf.push(len as u8);
        buf.extend_from_slice(&identity[..len]);
    }
    while buf.len() % 8 != 0 {
        buf.push(OPAQUE_TYPE_PAD);
    }

    let kek = KekAes256::new(&(*wrap_key).into());
    let mut sealed = vec![0u8; buf.len() + 8];
    let result = kek.wrap(&buf, &mut sealed).map_err(|_| OpaqueError::Wrap);
    buf.zeroize();
    result?;
    Ok(sealed)
}

/// Unwraps and decodes a PAC-Opaque blob.
pub fn open(blob: &[u8], wrap_key: &[u8; WRAP_KEY_LEN]) -> Result<PacOpaquePlain, OpaqueError> {
    if blob.len() < 16 || blob.len() % 8 != 0 {
        return Err(OpaqueError::Unwrap);
    }
    let kek = KekAes256::new(&(*wrap_key).into());
    let mut plain = vec![0u8; blob.len() - 8];
    if kek.unwrap(blob, &mut plain).is_err() {
        plain.zeroize();
        return Err(OpaqueError::Unwrap);
    }

    let decoded = decode_plain(&plain);
    plain.zeroize();
    decoded
}

fn decode_plain(plain: &[u8]) -> Result<PacOpaquePlain, OpaqueError> {
    let mut pac_key = None;
    let mut lifetime = 0u32;
    let mut identity = None;

    let mut offset = 0;
    while offset < plain.len() {
        let id = plain[offset];
        if id == OPAQUE_TYPE_PAD {
            // Padding runs to the end of the blob.
            break;
        }
        if offset + 2 > plain.len() {
            return Err(OpaqueError::Malformed);
        }
        let len = plain[offset + 1] as usize;
        let start = offset + 2;
        if len > plain.len() - start {
            return Err(OpaqueError::Malformed);
        }
        let value = &plain[start..start + len];
        match id {
            OPAQUE_TYPE_KEY if len == PAC_KEY_LEN => {
                let mut key = [0u8; PAC_KEY_LEN];
                key.copy_from_slice(value);
                pac_key = Some(PacKey(key));
            }
            OPAQUE_TYPE_KEY => return Err(OpaqueError::Malformed),
            OPAQUE_TYPE_LIFETIME if len == 4 => {
                lifetime = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            }
            OPAQUE_TYPE_IDENTITY => identity = Some(value.to_vec()),
            _ => {}
        }
        offset = start + len;
    }

    Ok(PacOpaquePlain {
        pac_key: pac_key.ok_or(OpaqueError::MissingKey)?,
        lifetime,
        identity,
    })
}
