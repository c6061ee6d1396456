//! Frame layouts and parsing
//!
//! ```text
//! DISCOVERY      0x03  type(1) ‖ node_id(16)
//! DISCOVERY_ACK  0x04  type(1) ‖ node_id(16)
//! ADOPT_REQ      0x01  type(1) ‖ node_id(16) ‖ node_pubkey(40)
//! ADOPT_RSP      0x02  type(1) ‖ node_id(16) ‖ status(1) ‖ hub_pubkey(40)
//! CHALLENGE      0x05  type(1) ‖ node_id(16) ‖ sender_tx(4) ‖ sender_rx(4) ‖ nonce(8) ‖ hmac(32)
//! CHALLENGE_RSP  0x06  same layout as CHALLENGE
//! DATA           0x10  type(1) ‖ node_id(16) ‖ counter(4) ‖ nonce(8) ‖ orig_len(1) ‖ ciphertext(16·k) ‖ hmac(32)
//! COMMAND        0x20  same layout as DATA
//! ```
//!
//! Integers are little-endian. For CHALLENGE and DATA layouts the HMAC
//! covers every byte of the frame before the 32-byte HMAC field itself;
//! receivers verify it against the raw frame slice, keyed with the
//! node's session key.

use bytes::{Buf, BufMut};
use uuid::Uuid;

use super::{
    adopt_request_size, adopt_response_size, challenge_frame_size, discovery_frame_size,
    min_secure_frame_size, secure_header_size, FrameType, ECC_PUBLIC_KEY_SIZE, HMAC_SIZE,
    MAX_FRAME_LEN, NONCE_SIZE,
};
use crate::error::FrameError;

/// CHALLENGE / CHALLENGE_RSP body: the sender's counters and a nonce the
/// responder must echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeFrame {
    pub node_id: Uuid,
    pub sender_tx: u32,
    pub sender_rx: u32,
    pub nonce: [u8; NONCE_SIZE],
    pub hmac: [u8; HMAC_SIZE],
}

/// DATA / COMMAND body: an encrypted payload with its replay counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureFrame {
    pub node_id: Uuid,
    pub counter: u32,
    pub nonce: [u8; NONCE_SIZE],
    pub orig_len: u8,
    pub ciphertext: Vec<u8>,
    pub hmac: [u8; HMAC_SIZE],
}

/// A parsed LoRa frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Discovery { node_id: Uuid },
    DiscoveryAck { node_id: Uuid },
    AdoptRequest { node_id: Uuid, node_public_key: [u8; ECC_PUBLIC_KEY_SIZE] },
    AdoptResponse { node_id: Uuid, status: u8, hub_public_key: [u8; ECC_PUBLIC_KEY_SIZE] },
    Challenge(ChallengeFrame),
    ChallengeResponse(ChallengeFrame),
    Data(SecureFrame),
    Command(SecureFrame),
}

impl Frame {
    /// Parse a raw frame
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::TooShort { len: 0, min: 1 });
        }
        if data.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLong(data.len()));
        }

        let frame_type =
            FrameType::from_u8(data[0]).ok_or(FrameError::UnknownType(data[0]))?;

        match frame_type {
            FrameType::Discovery => {
                let node_id = parse_node_id(data, discovery_frame_size())?;
                Ok(Self::Discovery { node_id })
            }
            FrameType::DiscoveryAck => {
                let node_id = parse_node_id(data, discovery_frame_size())?;
                Ok(Self::DiscoveryAck { node_id })
            }
            FrameType::AdoptRequest => {
                let node_id = parse_node_id(data, adopt_request_size())?;
                let mut node_public_key = [0u8; ECC_PUBLIC_KEY_SIZE];
                node_public_key.copy_from_slice(&data[17..17 + ECC_PUBLIC_KEY_SIZE]);
                Ok(Self::AdoptRequest {
                    node_id,
                    node_public_key,
                })
            }
            FrameType::AdoptResponse => {
                let node_id = parse_node_id(data, adopt_response_size())?;
                let status = data[17];
                let mut hub_public_key = [0u8; ECC_PUBLIC_KEY_SIZE];
                hub_public_key.copy_from_slice(&data[18..18 + ECC_PUBLIC_KEY_SIZE]);
                Ok(Self::AdoptResponse {
                    node_id,
                    status,
                    hub_public_key,
                })
            }
            FrameType::Challenge => Ok(Self::Challenge(parse_challenge(data)?)),
            FrameType::ChallengeResponse => {
                Ok(Self::ChallengeResponse(parse_challenge(data)?))
            }
            FrameType::Data => Ok(Self::Data(parse_secure(data)?)),
            FrameType::Command => Ok(Self::Command(parse_secure(data)?)),
        }
    }

    /// Wire type of this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Discovery { .. } => FrameType::Discovery,
            Self::DiscoveryAck { .. } => FrameType::DiscoveryAck,
            Self::AdoptRequest { .. } => FrameType::AdoptRequest,
            Self::AdoptResponse { .. } => FrameType::AdoptResponse,
            Self::Challenge(_) => FrameType::Challenge,
            Self::ChallengeResponse(_) => FrameType::ChallengeResponse,
            Self::Data(_) => FrameType::Data,
            Self::Command(_) => FrameType::Command,
        }
    }

    /// Node serial id carried by this frame
    pub fn node_id(&self) -> Uuid {
        match self {
            Self::Discovery { node_id }
            | Self::DiscoveryAck { node_id }
            | Self::AdoptRequest { node_id, .. }
            | Self::AdoptResponse { node_id, .. } => *node_id,
            Self::Challenge(c) | Self::ChallengeResponse(c) => c.node_id,
            Self::Data(s) | Self::Command(s) => s.node_id,
        }
    }
}

fn parse_node_id(data: &[u8], min: usize) -> Result<Uuid, FrameError> {
    if data.len() < min {
        return Err(FrameError::TooShort {
            len: data.len(),
            min,
        });
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&data[1..17]);
    Ok(Uuid::from_bytes(id))
}

fn parse_challenge(data: &[u8]) -> Result<ChallengeFrame, FrameError> {
    let node_id = parse_node_id(data, challenge_frame_size())?;

    let mut buf = &data[17..];
    let sender_tx = buf.get_u32_le();
    let sender_rx = buf.get_u32_le();

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&data[25..25 + NONCE_SIZE]);
    let mut hmac = [0u8; HMAC_SIZE];
    hmac.copy_from_slice(&data[33..33 + HMAC_SIZE]);

    Ok(ChallengeFrame {
        node_id,
        sender_tx,
        sender_rx,
        nonce,
        hmac,
    })
}

fn parse_secure(data: &[u8]) -> Result<SecureFrame, FrameError> {
    let node_id = parse_node_id(data, min_secure_frame_size())?;

    let mut buf = &data[17..];
    let counter = buf.get_u32_le();

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&data[21..21 + NONCE_SIZE]);
    let orig_len = data[29];

    let cipher_end = data.len() - HMAC_SIZE;
    let ciphertext = data[secure_header_size()..cipher_end].to_vec();
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(FrameError::UnalignedCiphertext(ciphertext.len()));
    }

    let mut hmac = [0u8; HMAC_SIZE];
    hmac.copy_from_slice(&data[cipher_end..]);

    Ok(SecureFrame {
        node_id,
        counter,
        nonce,
        orig_len,
        ciphertext,
        hmac,
    })
}

/// Build a DISCOVERY frame (node side; kept for tests and symmetry).
pub fn build_discovery(node_id: &Uuid) -> Vec<u8> {
    build_id_only(FrameType::Discovery, node_id)
}

/// Build a DISCOVERY_ACK frame (unencrypted).
pub fn build_discovery_ack(node_id: &Uuid) -> Vec<u8> {
    build_id_only(FrameType::DiscoveryAck, node_id)
}

fn build_id_only(frame_type: FrameType, node_id: &Uuid) -> Vec<u8> {
    let mut buf = Vec::with_capacity(discovery_frame_size());
    buf.put_u8(frame_type.to_u8());
    buf.put_slice(node_id.as_bytes());
    buf
}

/// Build an ADOPT_REQ frame (node side; kept for tests and symmetry).
pub fn build_adopt_request(node_id: &Uuid, node_public_key: &[u8; ECC_PUBLIC_KEY_SIZE]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(adopt_request_size());
    buf.put_u8(FrameType::AdoptRequest.to_u8());
    buf.put_slice(node_id.as_bytes());
    buf.put_slice(node_public_key);
    buf
}

/// Build an ADOPT_RSP frame.
pub fn build_adopt_response(
    node_id: &Uuid,
    status: u8,
    hub_public_key: &[u8; ECC_PUBLIC_KEY_SIZE],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(adopt_response_size());
    buf.put_u8(FrameType::AdoptResponse.to_u8());
    buf.put_slice(node_id.as_bytes());
    buf.put_u8(status);
    buf.put_slice(hub_public_key);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id() -> Uuid {
        Uuid::from_bytes([
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x75, 0xa0, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ])
    }

    #[test]
    fn test_discovery_roundtrip() {
        let bytes = build_discovery(&node_id());
        assert_eq!(bytes.len(), 17);
        assert_eq!(bytes[0], 0x03);

        let frame = Frame::parse(&bytes).unwrap();
        assert_eq!(frame, Frame::Discovery { node_id: node_id() });
        assert_eq!(frame.node_id(), node_id());
    }

    #[test]
    fn test_adopt_request_roundtrip() {
        let pubkey = [0x5a; 40];
        let bytes = build_adopt_request(&node_id(), &pubkey);
        assert_eq!(bytes.len(), 57);

        match Frame::parse(&bytes).unwrap() {
            Frame::AdoptRequest {
                node_id: id,
                node_public_key,
            } => {
                assert_eq!(id, node_id());
                assert_eq!(node_public_key, pubkey);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_adopt_response_layout() {
        let pubkey = [0xc3; 40];
        let bytes = build_adopt_response(&node_id(), 0x01, &pubkey);
        assert_eq!(bytes.len(), 58);
        assert_eq!(bytes[0], 0x02);
        assert_eq!(bytes[17], 0x01);
        assert_eq!(&bytes[18..], &pubkey);
    }

    #[test]
    fn test_challenge_parses_le_counters() {
        let mut bytes = vec![0x05];
        bytes.extend_from_slice(node_id().as_bytes());
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[0xaa; 8]);
        bytes.extend_from_slice(&[0xbb; 32]);

        match Frame::parse(&bytes).unwrap() {
            Frame::Challenge(c) => {
                assert_eq!(c.sender_tx, 7);
                assert_eq!(c.sender_rx, 3);
                assert_eq!(c.nonce, [0xaa; 8]);
                assert_eq!(c.hmac, [0xbb; 32]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_short_frames() {
        let err = Frame::parse(&[0x03, 0x00, 0x01]).unwrap_err();
        assert_eq!(err, FrameError::TooShort { len: 3, min: 17 });

        // A challenge one byte short of its fixed size.
        let mut bytes = vec![0x05];
        bytes.extend_from_slice(&[0u8; 63]);
        assert!(matches!(
            Frame::parse(&bytes).unwrap_err(),
            FrameError::TooShort { .. }
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let err = Frame::parse(&[0x7f, 0x00]).unwrap_err();
        assert_eq!(err, FrameError::UnknownType(0x7f));
    }

    #[test]
    fn test_parse_rejects_unaligned_ciphertext() {
        // Header + 17-byte "ciphertext" + HMAC.
        let mut bytes = vec![0x10];
        bytes.extend_from_slice(node_id().as_bytes());
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(&[0x00; 8]);
        bytes.push(10);
        bytes.extend_from_slice(&[0x11; 17]);
        bytes.extend_from_slice(&[0x22; 32]);

        assert_eq!(
            Frame::parse(&bytes).unwrap_err(),
            FrameError::UnalignedCiphertext(17)
        );
    }

    #[test]
    fn test_parse_rejects_oversize_frame() {
        let bytes = vec![0x10; 300];
        assert_eq!(Frame::parse(&bytes).unwrap_err(), FrameError::TooLong(300));
    }
}
