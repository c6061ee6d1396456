//! Encrypted payload handling for DATA / COMMAND frames
//!
//! The CBC IV is `node_id[0..4] ‖ counter_le(4) ‖ nonce(8)`; the HMAC is
//! keyed with the 16-byte session key and covers every frame byte before
//! the tag. Sealing stamps the counter the caller passed — by contract
//! that is the sender's current tx counter, post-incremented after the
//! emission attempt regardless of radio success.

use bytes::BufMut;
use uuid::Uuid;

use super::frames::SecureFrame;
use super::{
    challenge_frame_size, secure_header_size, FrameType, HMAC_SIZE, MAX_FRAME_LEN, NONCE_SIZE,
    SESSION_KEY_SIZE,
};
use crate::crypto::{cbc, hmac_sha256, random_array};
use crate::error::{CryptoError, FrameError};

/// Build the AES-CBC IV for a DATA / COMMAND frame.
pub fn build_iv(node_id: &Uuid, counter: u32, nonce: &[u8; NONCE_SIZE]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&node_id.as_bytes()[..4]);
    iv[4..8].copy_from_slice(&counter.to_le_bytes());
    iv[8..].copy_from_slice(nonce);
    iv
}

/// Seal a plaintext into a complete DATA or COMMAND wire frame with a
/// fresh nonce.
pub fn seal_message(
    frame_type: FrameType,
    node_id: &Uuid,
    session_key: &[u8; SESSION_KEY_SIZE],
    counter: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    debug_assert!(matches!(frame_type, FrameType::Data | FrameType::Command));

    let padded_len = (plaintext.len() + 16) / 16 * 16;
    if secure_header_size() + padded_len + HMAC_SIZE > MAX_FRAME_LEN || plaintext.len() > u8::MAX as usize
    {
        return Err(CryptoError::PlaintextTooLong(plaintext.len()));
    }

    let nonce = random_array::<NONCE_SIZE>();
    let iv = build_iv(node_id, counter, &nonce);
    let ciphertext = cbc::encrypt(session_key, &iv, plaintext);

    let mut frame = Vec::with_capacity(secure_header_size() + ciphertext.len() + HMAC_SIZE);
    frame.put_u8(frame_type.to_u8());
    frame.put_slice(node_id.as_bytes());
    frame.put_u32_le(counter);
    frame.put_slice(&nonce);
    frame.put_u8(plaintext.len() as u8);
    frame.put_slice(&ciphertext);

    let hmac = hmac_sha256(session_key, &frame);
    frame.put_slice(&hmac);
    Ok(frame)
}

/// Decrypt a verified DATA / COMMAND frame and truncate to the original
/// length. The caller must have checked the HMAC and the counter first.
pub fn open_message(
    frame: &SecureFrame,
    session_key: &[u8; SESSION_KEY_SIZE],
) -> Result<Vec<u8>, FrameError> {
    let iv = build_iv(&frame.node_id, frame.counter, &frame.nonce);
    cbc::decrypt(session_key, &iv, &frame.ciphertext, frame.orig_len as usize)
}

/// Build a complete CHALLENGE or CHALLENGE_RSP wire frame carrying the
/// sender's counters, HMAC'd with the session key.
pub fn seal_challenge(
    frame_type: FrameType,
    node_id: &Uuid,
    session_key: &[u8; SESSION_KEY_SIZE],
    sender_tx: u32,
    sender_rx: u32,
    nonce: &[u8; NONCE_SIZE],
) -> Vec<u8> {
    debug_assert!(matches!(
        frame_type,
        FrameType::Challenge | FrameType::ChallengeResponse
    ));

    let mut frame = Vec::with_capacity(challenge_frame_size());
    frame.put_u8(frame_type.to_u8());
    frame.put_slice(node_id.as_bytes());
    frame.put_u32_le(sender_tx);
    frame.put_u32_le(sender_rx);
    frame.put_slice(nonce);

    let hmac = hmac_sha256(session_key, &frame);
    frame.put_slice(&hmac);
    frame
}

/// Verify the HMAC of a raw CHALLENGE / DATA style frame: the tag is the
/// trailing 32 bytes, the covered region everything before it.
pub fn verify_frame_hmac(raw: &[u8], session_key: &[u8; SESSION_KEY_SIZE]) -> bool {
    if raw.len() <= HMAC_SIZE {
        return false;
    }
    let split = raw.len() - HMAC_SIZE;
    crate::crypto::verify_hmac(session_key, &raw[..split], &raw[split..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;

    const KEY: [u8; 16] = *b"super secret key";

    fn node_id() -> Uuid {
        Uuid::from_bytes([
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x75, 0xa0, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let plaintext = b"telemetry;3872;60;false";
        let raw = seal_message(FrameType::Data, &node_id(), &KEY, 5, plaintext).unwrap();

        assert!(verify_frame_hmac(&raw, &KEY));

        let frame = match Frame::parse(&raw).unwrap() {
            Frame::Data(f) => f,
            other => panic!("unexpected frame: {:?}", other),
        };
        assert_eq!(frame.counter, 5);
        assert_eq!(frame.orig_len as usize, plaintext.len());
        // Counter is stamped little-endian right after the node id.
        assert_eq!(&raw[17..21], &[0x05, 0x00, 0x00, 0x00]);

        let opened = open_message(&frame, &KEY).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_iv_layout() {
        let nonce = [0x11; 8];
        let iv = build_iv(&node_id(), 5, &nonce);
        assert_eq!(&iv[..4], &node_id().as_bytes()[..4]);
        assert_eq!(&iv[4..8], &[0x05, 0x00, 0x00, 0x00]);
        assert_eq!(&iv[8..], &nonce);
    }

    #[test]
    fn test_hmac_covers_every_preceding_byte() {
        let raw = seal_message(FrameType::Data, &node_id(), &KEY, 1, b"ping").unwrap();
        let covered = raw.len() - HMAC_SIZE;

        for i in 0..covered {
            let mut tampered = raw.clone();
            tampered[i] ^= 0x01;
            assert!(
                !verify_frame_hmac(&tampered, &KEY),
                "flip at byte {} accepted",
                i
            );
        }
    }

    #[test]
    fn test_seal_rejects_oversized_plaintext() {
        let long = vec![0x41u8; 192];
        assert!(matches!(
            seal_message(FrameType::Command, &node_id(), &KEY, 0, &long),
            Err(CryptoError::PlaintextTooLong(192))
        ));

        // The largest payload that still fits a 255-byte frame.
        let max = vec![0x41u8; 191];
        let raw = seal_message(FrameType::Command, &node_id(), &KEY, 0, &max).unwrap();
        assert_eq!(raw.len(), 254);
    }

    #[test]
    fn test_challenge_roundtrip() {
        let nonce = [0x42; 8];
        let raw = seal_challenge(FrameType::ChallengeResponse, &node_id(), &KEY, 9, 4, &nonce);
        assert_eq!(raw.len(), challenge_frame_size());
        assert!(verify_frame_hmac(&raw, &KEY));

        match Frame::parse(&raw).unwrap() {
            Frame::ChallengeResponse(c) => {
                assert_eq!(c.sender_tx, 9);
                assert_eq!(c.sender_rx, 4);
                assert_eq!(c.nonce, nonce);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let raw = seal_message(FrameType::Data, &node_id(), &KEY, 3, b"data").unwrap();
        assert!(!verify_frame_hmac(&raw, b"another 16b key!"));
    }
}
