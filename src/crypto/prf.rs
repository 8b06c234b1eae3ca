// Cipher-suite MAC classification and the TLS P_hash PRF.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384};
use thiserror::Error;

/// PRF selection error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrfError {
    /// Negotiated cipher suite is in none of the classification tables.
    /// Fatal: no compound MAC can be computed for this session.
    #[error("unsupported tls cipher suite {0:#06x}")]
    UnsupportedCipherSuite(u16),
}

// Suites whose PRF/MAC hash is SHA-1 (pre-TLS-1.2 PRF suites).
const SHA1_SUITES: &[u16] = &[
    0x002F, // TLS_RSA_WITH_AES_128_CBC_SHA
    0x0034, // TLS_DH_anon_WITH_AES_128_CBC_SHA
    0x0035, // TLS_RSA_WITH_AES_256_CBC_SHA
    0x003A, // TLS_DH_anon_WITH_AES_256_CBC_SHA
    0xC009, // TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA
    0xC00A, // TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA
    0xC013, // TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA
    0xC014, // TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA
];

const SHA256_SUITES: &[u16] = &[
    0x003C, // TLS_RSA_WITH_AES_128_CBC_SHA256
    0x003D, // TLS_RSA_WITH_AES_256_CBC_SHA256
    0x006C, // TLS_DH_anon_WITH_AES_128_CBC_SHA256
    0x006D, // TLS_DH_anon_WITH_AES_256_CBC_SHA256
    0x009C, // TLS_RSA_WITH_AES_128_GCM_SHA256
    0x00A6, // TLS_DH_anon_WITH_AES_128_GCM_SHA256
    0x1301, // TLS_AES_128_GCM_SHA256
    0x1303, // TLS_CHACHA20_POLY1305_SHA256
    0xC023, // TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256
    0xC027, // TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256
    0xC02B, // TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
    0xC02F, // TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
];

const SHA384_SUITES: &[u16] = &[
    0x009D, // TLS_RSA_WITH_AES_256_GCM_SHA384
    0x00A7, // TLS_DH_anon_WITH_AES_256_GCM_SHA384
    0x1302, // TLS_AES_256_GCM_SHA384
    0xC024, // TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA384
    0xC028, // TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA384
    0xC02C, // TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
    0xC030, // TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
];

// Anonymous DH suites acceptable while provisioning without server
// authentication. Everything else is rejected in that mode.
const DH_ANON_SUITES: &[u16] = &[0x0034, 0x003A, 0x006C, 0x006D, 0x00A6, 0x00A7];

/// Hash underlying the PRF and compound MAC for a negotiated suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    Sha1,
    Sha256,
    Sha384,
}

impl MacAlgorithm {
    /// Classifies a TLS cipher suite by its MAC hash.
    pub fn classify(cipher_suite: u16) -> Result<Self, PrfError> {
        if SHA1_SUITES.contains(&cipher_suite) {
            Ok(MacAlgorithm::Sha1)
        } else if SHA256_SUITES.contains(&cipher_suite) {
            Ok(MacAlgorithm::Sha256)
        } else if SHA384_SUITES.contains(&cipher_suite) {
            Ok(MacAlgorithm::Sha384)
        } else {
            Err(PrfError::UnsupportedCipherSuite(cipher_suite))
        }
    }

    /// Native HMAC output length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            MacAlgorithm::Sha1 => 20,
            MacAlgorithm::Sha256 => 32,
            MacAlgorithm::Sha384 => 48,
        }
    }
}

/// Returns whether `cipher_suite` is in the anonymous-provisioning allow-list.
pub fn is_anon_provisioning_suite(cipher_suite: u16) -> bool {
    DH_ANON_SUITES.contains(&cipher_suite)
}

fn p_hash<M>(secret: &[u8], label_seed: &[u8], out: &mut [u8])
where
    M: Mac + KeyInit,
{
    let mut a_i = {
        let mut mac = <M as Mac>::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(label_seed);
        mac.finalize().into_bytes()
    };

    let mut written = 0;
    while written < out.len() {
        let mut mac = <M as Mac>::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(&a_i);
        mac.update(label_seed);
        let block = mac.finalize().into_bytes();
        let take = block.len().min(out.len() - written);
        out[written..written + take].copy_from_slice(&block[..take]);
        written += take;

        let mut mac = <M as Mac>::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(&a_i);
        a_i = mac.finalize().into_bytes();
    }
}

/// TLS 1.2 PRF (RFC 5246 section 5) instantiated with the given hash.
pub fn prf(alg: MacAlgorithm, secret: &[u8], label: &str, seed: &[u8], out: &mut [u8]) {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label.as_bytes());
    label_seed.extend_from_slice(seed);
    match alg {
        MacAlgorithm::Sha1 => p_hash::<Hmac<Sha1>>(secret, &label_seed, out),
        MacAlgorithm::Sha256 => p_hash::<Hmac<Sha256>>(secret, &label_seed, out),
        MacAlgorithm::Sha384 => p_hash::<Hmac<Sha384>>(secret, &label_seed, out),
    }
}

/// One-shot HMAC with the suite-selected hash.
pub fn hmac(alg: MacAlgorithm, key: &[u8], data: &[u8]) -> Vec<u8> {
    fn digest<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = <M as Mac>::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
    match alg {
        MacAlgorithm::Sha1 => digest::<Hmac<Sha1>>(key, data),
        MacAlgorithm::Sha256 => digest::<Hmac<Sha256>>(key, data),
        MacAlgorithm::Sha384 => digest::<Hmac<Sha384>>(key, data),
    }
}
