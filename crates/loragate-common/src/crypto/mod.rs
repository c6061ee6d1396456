//! Crypto primitives
//!
//! Pure functions over byte slices; no shared state. Asymmetric pieces
//! live in their own modules: [`ecdh`] (secp160r1, LoRa adoption),
//! [`identity`] (P-256 ECDSA, device identity), [`cbc`] (AES-128-CBC with
//! the protocol's custom padding).

pub mod cbc;
pub mod ecdh;
pub mod identity;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// HMAC-SHA-256 tag over `data`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length, so new_from_slice cannot fail.
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC verification.
///
/// Differences are XOR-accumulated across all 32 bytes before the single
/// comparison against zero, so the comparison time does not depend on
/// where the first mismatching byte sits.
pub fn verify_hmac(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    if tag.len() != 32 {
        return false;
    }
    let computed = hmac_sha256(key, data);
    let mut diff = 0u8;
    for (a, b) in computed.iter().zip(tag.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// HKDF-SHA-256: Extract followed by a single-block Expand.
///
/// The output is exactly one 32-byte block (`T(1) = HMAC(PRK, info ||
/// 0x01)`). Callers needing more material must re-derive with a different
/// `info`.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .expect("32 bytes is one SHA-256 block of HKDF output");
    okm
}

/// Fill `buf` from the OS CSPRNG.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Fresh random array from the OS CSPRNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Standard base64 (with padding), as the server protocol uses for
/// nonces, MACs and key material.
pub fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode standard base64; `None` on malformed input.
pub fn b64_decode(s: &str) -> Option<Vec<u8>> {
    BASE64.decode(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_vector() {
        let digest = sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case1() {
        let key = [0x0b; 20];
        let tag = hmac_sha256(&key, b"Hi There");
        assert_eq!(
            hex::encode(tag),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
    }

    #[test]
    fn test_verify_hmac_detects_any_flipped_bit() {
        let key = b"0123456789abcdef";
        let data = b"telemetry;3872;60;false";
        let tag = hmac_sha256(key, data);

        assert!(verify_hmac(key, data, &tag));

        for i in 0..tag.len() {
            let mut bad = tag;
            bad[i] ^= 0x01;
            assert!(!verify_hmac(key, data, &bad), "flip at byte {} accepted", i);
        }
    }

    #[test]
    fn test_verify_hmac_rejects_wrong_length_tag() {
        let key = b"key";
        let tag = hmac_sha256(key, b"data");
        assert!(!verify_hmac(key, b"data", &tag[..31]));
    }

    #[test]
    fn test_hkdf_sha256_rfc5869_case1() {
        // RFC 5869 test case 1, truncated to the single block this
        // protocol uses.
        let ikm = [0x0b; 22];
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let okm = hkdf_sha256(&ikm, &salt, &info);
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf"
        );
    }

    #[test]
    fn test_base64_roundtrip() {
        let data = random_array::<12>();
        let encoded = b64_encode(&data);
        assert_eq!(b64_decode(&encoded).unwrap(), data);
        assert!(b64_decode("not!!base64").is_none());
    }
}
