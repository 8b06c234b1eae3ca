// Compound MAC construction and verification for Crypto-Binding TLVs.

use subtle::ConstantTimeEq;

use super::keys::CMK_LEN;
use super::prf::{self, MacAlgorithm};
use crate::tlv::CryptoBinding;
use crate::wire::EAP_TYPE_TEAP;

/// Wire length of each Compound MAC field.
pub const COMPOUND_MAC_LEN: usize = 20;

/// Computes a Compound MAC over a Crypto-Binding TLV.
///
/// The MAC covers the full TLV (header plus body) with both MAC fields
/// zeroed, one octet of EAP type, then the server's and the peer's outer
/// TLVs from the first exchange, byte-for-byte as originally sent.
///
/// The first `min(native_len, 20)` HMAC bytes fill the fixed field; RFC
/// 7170 does not define the truncation rule, this matches the reference.
pub fn compute_compound_mac(
    alg: MacAlgorithm,
    binding: &CryptoBinding,
    server_outer_tlvs: &[u8],
    peer_outer_tlvs: &[u8],
    cmk: &[u8; CMK_LEN],
) -> [u8; COMPOUND_MAC_LEN] {
    let mut zeroed = binding.clone();
    zeroed.emsk_compound_mac = [0u8; COMPOUND_MAC_LEN];
    zeroed.msk_compound_mac = [0u8; COMPOUND_MAC_LEN];

    let mut scratch = zeroed.to_tlv_bytes();
    scratch.push(EAP_TYPE_TEAP);
    scratch.extend_from_slice(server_outer_tlvs);
    scratch.extend_from_slice(peer_outer_tlvs);

    let digest = prf::hmac(alg, cmk, &scratch);
    let mut mac = [0u8; COMPOUND_MAC_LEN];
    let take = digest.len().min(COMPOUND_MAC_LEN);
    mac[..take].copy_from_slice(&digest[..take]);
    mac
}

/// Constant-time comparison of a received Compound MAC against the
/// locally computed value.
pub fn verify_compound_mac(
    alg: MacAlgorithm,
    binding: &CryptoBinding,
    server_outer_tlvs: &[u8],
    peer_outer_tlvs: &[u8],
    cmk: &[u8; CMK_LEN],
    received: &[u8; COMPOUND_MAC_LEN],
) -> bool {
    let expected = compute_compound_mac(alg, binding, server_outer_tlvs, peer_outer_tlvs, cmk);
    expected.as_slice().ct_eq(received.as_slice()).into()
}
