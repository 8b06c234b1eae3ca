// PAC list persistence: fixed binary layout and key=value text format.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::warn;

use super::{PacEntry, PacKey, PAC_KEY_LEN};

const BINARY_MAGIC: &[u8; 4] = b"TPAC";
const BINARY_VERSION: u16 = 1;

/// Persistence error.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to access pac file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bad pac file magic")]
    BadMagic,

    #[error("unsupported pac file version {0}")]
    UnsupportedVersion(u16),

    #[error("pac file truncated at offset {0}")]
    Truncated(usize),

    #[error("invalid hex in pac file line {0}")]
    BadHex(usize),

    #[error("pac entry missing '{0}' field")]
    MissingField(&'static str),
}

fn put_field(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn read_field<'a>(buf: &'a [u8], offset: &mut usize) -> Result<&'a [u8], PersistError> {
    if buf.len() - *offset < 2 {
        return Err(PersistError::Truncated(*offset));
    }
    let len = u16::from_be_bytes([buf[*offset], buf[*offset + 1]]) as usize;
    *offset += 2;
    if len > buf.len() - *offset {
        return Err(PersistError::Truncated(*offset));
    }
    let value = &buf[*offset..*offset + len];
    *offset += len;
    Ok(value)
}

/// Encodes a PAC list in the binary layout: magic, version, count, entries.
pub fn encode_binary(entries: &[PacEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(BINARY_MAGIC);
    out.extend_from_slice(&BINARY_VERSION.to_be_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.pac_type.to_be_bytes());
        out.extend_from_slice(entry.pac_key.as_bytes());
        put_field(&mut out, &entry.pac_opaque);
        put_field(&mut out, &entry.pac_info);
        put_field(&mut out, &entry.a_id);
        put_field(&mut out, &entry.i_id);
        put_field(&mut out, &entry.a_id_info);
    }
    out
}

/// Decodes the binary layout produced by [`encode_binary`].
pub fn decode_binary(buf: &[u8]) -> Result<Vec<PacEntry>, PersistError> {
    if buf.len() < 8 {
        return Err(PersistError::Truncated(buf.len()));
    }
    if &buf[..4] != BINARY_MAGIC {
        return Err(PersistError::BadMagic);
    }
    let version = u16::from_be_bytes([buf[4], buf[5]]);
    if version != BINARY_VERSION {
        return Err(PersistError::UnsupportedVersion(version));
    }
    let count = u16::from_be_bytes([buf[6], buf[7]]) as usize;

    let mut offset = 8;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.len() - offset < 2 + PAC_KEY_LEN {
            return Err(PersistError::Truncated(offset));
        }
        let pac_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        offset += 2;
        let mut key = [0u8; PAC_KEY_LEN];
        key.copy_from_slice(&buf[offset..offset + PAC_KEY_LEN]);
        offset += PAC_KEY_LEN;

        let pac_opaque = read_field(buf, &mut offset)?.to_vec();
        let pac_info = read_field(buf, &mut offset)?.to_vec();
        let a_id = read_field(buf, &mut offset)?.to_vec();
        let i_id = read_field(buf, &mut offset)?.to_vec();
        let a_id_info = read_field(buf, &mut offset)?.to_vec();

        entries.push(PacEntry {
            pac_type,
            pac_key: PacKey(key),
            pac_opaque,
            pac_info,
            a_id,
            i_id,
            a_id_info,
        });
    }
    Ok(entries)
}

/// Encodes a PAC list in the human-readable text format.
pub fn encode_text(entries: &[PacEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str("START\n");
        out.push_str(&format!("type={}\n", entry.pac_type));
        out.push_str(&format!("key={}\n", hex::encode(entry.pac_key.as_bytes())));
        out.push_str(&format!("opaque={}\n", hex::encode(&entry.pac_opaque)));
        out.push_str(&format!("info={}\n", hex::encode(&entry.pac_info)));
        out.push_str(&format!("a-id={}\n", hex::encode(&entry.a_id)));
        out.push_str(&format!("i-id={}\n", hex::encode(&entry.i_id)));
        out.push_str(&format!("a-id-info={}\n", hex::encode(&entry.a_id_info)));
        out.push_str("END\n");
    }
    out
}

/// Decodes the text format; unknown keys are skipped with a warning.
pub fn decode_text(input: &str) -> Result<Vec<PacEntry>, PersistError> {
    let mut entries = Vec::new();

    let mut pac_type: Option<u16> = None;
    let mut key: Option<[u8; PAC_KEY_LEN]> = None;
    let mut opaque = Vec::new();
    let mut info = Vec::new();
    let mut a_id = Vec::new();
    let mut i_id = Vec::new();
    let mut a_id_info = Vec::new();
    let mut in_entry = false;

    for (lineno, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "START" {
            in_entry = true;
            pac_type = None;
            key = None;
            opaque.clear();
            info.clear();
            a_id.clear();
            i_id.clear();
            a_id_info.clear();
            continue;
        }
        if line == "END" {
            let pac_type = pac_type.ok_or(PersistError::MissingField("type"))?;
            let key = key.ok_or(PersistError::MissingField("key"))?;
            entries.push(PacEntry {
                pac_type,
                pac_key: PacKey(key),
                pac_opaque: std::mem::take(&mut opaque),
                pac_info: std::mem::take(&mut info),
                a_id: std::mem::take(&mut a_id),
                i_id: std::mem::take(&mut i_id),
                a_id_info: std::mem::take(&mut a_id_info),
            });
            in_entry = false;
            continue;
        }
        if !in_entry {
            continue;
        }
        let Some((field, value)) = line.split_once('=') else {
            warn!(line = lineno + 1, "skipping malformed pac file line");
            continue;
        };
        let unhex = |value: &str| hex::decode(value).map_err(|_| PersistError::BadHex(lineno + 1));
        match field {
            "type" => {
                pac_type = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| PersistError::BadHex(lineno + 1))?,
                )
            }
            "key" => {
                let bytes = unhex(value)?;
                if bytes.len() != PAC_KEY_LEN {
                    return Err(PersistError::BadHex(lineno + 1));
                }
                let mut fixed = [0u8; PAC_KEY_LEN];
                fixed.copy_from_slice(&bytes);
                key = Some(fixed);
            }
            "opaque" => opaque = unhex(value)?,
            "info" => info = unhex(value)?,
            "a-id" => a_id = unhex(value)?,
            "i-id" => i_id = unhex(value)?,
            "a-id-info" => a_id_info = unhex(value)?,
            other => warn!(field = other, "skipping unknown pac file field"),
        }
    }

    Ok(entries)
}

/// Loads a binary PAC file from disk.
pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<Vec<PacEntry>, PersistError> {
    let path_ref = path.as_ref();
    let contents = fs::read(path_ref).map_err(|source| PersistError::Io {
        path: path_ref.to_path_buf(),
        source,
    })?;
    decode_binary(&contents)
}

/// Saves a binary PAC file to disk.
pub fn save_binary<P: AsRef<Path>>(path: P, entries: &[PacEntry]) -> Result<(), PersistError> {
    let path_ref = path.as_ref();
    fs::write(path_ref, encode_binary(entries)).map_err(|source| PersistError::Io {
        path: path_ref.to_path_buf(),
        source,
    })
}
