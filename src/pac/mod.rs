// PAC store and PAC TLV attribute codec.

use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub mod opaque;
pub mod persist;

/// Fixed PAC-Key length.
pub const PAC_KEY_LEN: usize = 48;

/// PAC-Type value for a Tunnel PAC.
pub const PAC_TYPE_TUNNEL: u16 = 1;

// PAC TLV sub-attribute identifiers.
pub const PAC_ATTR_KEY: u16 = 1;
pub const PAC_ATTR_OPAQUE: u16 = 2;
pub const PAC_ATTR_LIFETIME: u16 = 3;
pub const PAC_ATTR_A_ID: u16 = 4;
pub const PAC_ATTR_I_ID: u16 = 5;
pub const PAC_ATTR_A_ID_INFO: u16 = 7;
pub const PAC_ATTR_ACKNOWLEDGEMENT: u16 = 8;
pub const PAC_ATTR_INFO: u16 = 9;
pub const PAC_ATTR_TYPE: u16 = 10;

/// PAC-level error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacError {
    /// An entry cannot be indexed without an Authority-ID.
    #[error("pac entry lacks an authority id")]
    MissingAId,

    /// Attribute framing ran past the end of the buffer.
    #[error("pac attribute {attr} declares {declared} bytes, only {available} remain")]
    AttrOverrun {
        attr: u16,
        declared: usize,
        available: usize,
    },

    /// Attribute header truncated.
    #[error("pac attribute header truncated ({remaining} bytes remain)")]
    AttrTruncated { remaining: usize },

    /// A required attribute was absent.
    #[error("pac tlv missing {0} attribute")]
    MissingAttr(&'static str),

    /// PAC-Key attribute with the wrong length.
    #[error("pac key must be {PAC_KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),
}

/// PAC-Key with guaranteed wipe on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PacKey(pub [u8; PAC_KEY_LEN]);

impl PacKey {
    pub fn random() -> Self {
        use rand::RngCore;
        let mut key = [0u8; PAC_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; PAC_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for PacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacKey(..)")
    }
}

/// One Protected Access Credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacEntry {
    pub pac_type: u16,
    pub pac_key: PacKey,
    pub pac_opaque: Vec<u8>,
    pub pac_info: Vec<u8>,
    pub a_id: Vec<u8>,
    pub i_id: Vec<u8>,
    pub a_id_info: Vec<u8>,
}

/// Insertion-ordered PAC container, most recently added first.
///
/// Identity key is `(pac_type, a_id)`; adding an entry with an existing key
/// replaces the old one. The list silently truncates to `max_len` — eviction
/// of old credentials is not an error.
#[derive(Debug)]
pub struct PacStore {
    entries: Vec<PacEntry>,
    max_len: usize,
}

impl PacStore {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_len,
        }
    }

    pub fn with_entries(max_len: usize, entries: Vec<PacEntry>) -> Self {
        let mut store = Self { entries, max_len };
        store.truncate(max_len);
        store
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry matching `(pac_type, a_id)` byte-exactly.
    pub fn find(&self, a_id: &[u8], pac_type: u16) -> Option<&PacEntry> {
        self.entries
            .iter()
            .find(|entry| entry.pac_type == pac_type && entry.a_id == a_id)
    }

    /// Inserts `entry` at the front, replacing any entry with the same
    /// `(pac_type, a_id)`; the list is then truncated to the configured cap.
    pub fn add_or_replace(&mut self, entry: PacEntry) -> Result<(), PacError> {
        if entry.a_id.is_empty() {
            return Err(PacError::MissingAId);
        }
        self.entries
            .retain(|existing| !(existing.pac_type == entry.pac_type && existing.a_id == entry.a_id));
        self.entries.insert(0, entry);
        self.truncate(self.max_len);
        Ok(())
    }

    /// Keeps the first `max_len` entries; returns how many were dropped.
    pub fn truncate(&mut self, max_len: usize) -> usize {
        let before = self.entries.len();
        self.entries.truncate(max_len);
        before - self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PacEntry> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> Vec<PacEntry> {
        self.entries
    }
}

fn put_attr(out: &mut Vec<u8>, attr: u16, value: &[u8]) {
    out.extend_from_slice(&attr.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

struct AttrCursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> AttrCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }
}

impl<'a> Iterator for AttrCursor<'a> {
    type Item = Result<(u16, &'a [u8]), PacError>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.buf.len() - self.offset;
        if remaining == 0 {
            return None;
        }
        if remaining < 4 {
            self.offset = self.buf.len();
            return Some(Err(PacError::AttrTruncated { remaining }));
        }
        let attr = u16::from_be_bytes([self.buf[self.offset], self.buf[self.offset + 1]]);
        let declared =
            u16::from_be_bytes([self.buf[self.offset + 2], self.buf[self.offset + 3]]) as usize;
        let start = self.offset + 4;
        if declared > self.buf.len() - start {
            let available = self.buf.len() - start;
            self.offset = self.buf.len();
            return Some(Err(PacError::AttrOverrun {
                attr,
                declared,
                available,
            }));
        }
        self.offset = start + declared;
        Some(Ok((attr, &self.buf[start..start + declared])))
    }
}

/// Builds the PAC-Info attribute value.
pub fn encode_pac_info(
    a_id: &[u8],
    a_id_info: &[u8],
    i_id: &[u8],
    lifetime: u32,
    pac_type: u16,
) -> Vec<u8> {
    let mut info = Vec::new();
    put_attr(&mut info, PAC_ATTR_A_ID, a_id);
    put_attr(&mut info, PAC_ATTR_A_ID_INFO, a_id_info);
    if !i_id.is_empty() {
        put_attr(&mut info, PAC_ATTR_I_ID, i_id);
    }
    put_attr(&mut info, PAC_ATTR_LIFETIME, &lifetime.to_be_bytes());
    put_attr(&mut info, PAC_ATTR_TYPE, &pac_type.to_be_bytes());
    info
}

/// Builds a full PAC TLV value carrying a provisioned credential.
pub fn encode_pac_tlv(entry: &PacEntry) -> Vec<u8> {
    let mut value = Vec::new();
    put_attr(&mut value, PAC_ATTR_KEY, entry.pac_key.as_bytes());
    put_attr(&mut value, PAC_ATTR_OPAQUE, &entry.pac_opaque);
    put_attr(&mut value, PAC_ATTR_INFO, &entry.pac_info);
    value
}

/// Parses a provisioning PAC TLV value into an entry.
///
/// The Authority-ID and companion fields come from the nested PAC-Info.
pub fn parse_pac_tlv(value: &[u8]) -> Result<PacEntry, PacError> {
    let mut pac_key = None;
    let mut pac_opaque = None;
    let mut pac_info = None;

    for item in AttrCursor::new(value) {
        let (attr, data) = item?;
        match attr {
            PAC_ATTR_KEY => {
                if data.len() != PAC_KEY_LEN {
                    return Err(PacError::BadKeyLength(data.len()));
                }
                let mut key = [0u8; PAC_KEY_LEN];
                key.copy_from_slice(data);
                pac_key = Some(PacKey(key));
            }
            PAC_ATTR_OPAQUE => pac_opaque = Some(data.to_vec()),
            PAC_ATTR_INFO => pac_info = Some(data.to_vec()),
            _ => {}
        }
    }

    let pac_key = pac_key.ok_or(PacError::MissingAttr("PAC-Key"))?;
    let pac_opaque = pac_opaque.ok_or(PacError::MissingAttr("PAC-Opaque"))?;
    let pac_info = pac_info.ok_or(PacError::MissingAttr("PAC-Info"))?;

    let mut a_id = Vec::new();
    let mut i_id = Vec::new();
    let mut a_id_info = Vec::new();
    let mut pac_type = PAC_TYPE_TUNNEL;
    for item in AttrCursor::new(&pac_info) {
        let (attr, data) = item?;
        match attr {
            PAC_ATTR_A_ID => a_id = data.to_vec(),
            PAC_ATTR_I_ID => i_id = data.to_vec(),
            PAC_ATTR_A_ID_INFO => a_id_info = data.to_vec(),
            PAC_ATTR_TYPE if data.len() >= 2 => {
                pac_type = u16::from_be_bytes([data[0], data[1]]);
            }
            _ => {}
        }
    }
    if a_id.is_empty() {
        return Err(PacError::MissingAId);
    }

    Ok(PacEntry {
        pac_type,
        pac_key,
        pac_opaque,
        pac_info,
        a_id,
        i_id,
        a_id_info,
    })
}

/// Builds a PAC TLV value requesting provisioning of `pac_type`.
pub fn encode_pac_request(pac_type: u16) -> Vec<u8> {
    let mut value = Vec::new();
    put_attr(&mut value, PAC_ATTR_TYPE, &pac_type.to_be_bytes());
    value
}

/// Extracts the requested PAC-Type from a request PAC TLV value.
pub fn parse_pac_request(value: &[u8]) -> Option<u16> {
    for item in AttrCursor::new(value) {
        match item {
            Ok((PAC_ATTR_TYPE, data)) if data.len() >= 2 => {
                return Some(u16::from_be_bytes([data[0], data[1]]));
            }
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

/// Builds a PAC TLV value acknowledging receipt of a provisioned PAC.
pub fn encode_pac_ack(success: bool) -> Vec<u8> {
    let status: u16 = if success { 1 } else { 2 };
    let mut value = Vec::new();
    put_attr(&mut value, PAC_ATTR_ACKNOWLEDGEMENT, &status.to_be_bytes());
    value
}

/// Extracts the acknowledgement status from a PAC TLV value.
pub fn parse_pac_ack(value: &[u8]) -> Option<bool> {
    for item in AttrCursor::new(value) {
        match item {
            Ok((PAC_ATTR_ACKNOWLEDGEMENT, data)) if data.len() >= 2 => {
                return Some(u16::from_be_bytes([data[0], data[1]]) == 1);
            }
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}
