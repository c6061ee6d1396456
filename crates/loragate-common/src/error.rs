//! Error types for the protocol core
//!
//! Three of the four failure kinds the hub distinguishes get their own
//! type here (malformed input, authentication failure, replay/duplicate).
//! Fatal bootstrap failures are surfaced by the daemon with `anyhow` and
//! halt the process before the loop starts.

use thiserror::Error;

/// Malformed or insufficient input. Frames carrying these are dropped
/// after a warning log and never surfaced further.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {len} bytes (need at least {min})")]
    TooShort { len: usize, min: usize },

    #[error("frame too long: {0} bytes (max 255)")]
    TooLong(usize),

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("ciphertext length {0} is not a multiple of the AES block size")]
    UnalignedCiphertext(usize),

    #[error("original length {orig} exceeds ciphertext length {cipher}")]
    BadOriginalLength { orig: usize, cipher: usize },
}

/// Crypto primitive failure. Callers never observe partial output.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed")]
    KeyGeneration,

    #[error("peer public key is not a valid curve point")]
    InvalidPublicKey,

    #[error("invalid PEM key material")]
    InvalidPem,

    #[error("signing failed")]
    SigningFailed,

    #[error("plaintext too long for a single frame: {0} bytes")]
    PlaintextTooLong(usize),
}

/// Authentication failure on an otherwise well-formed message. The
/// offending message is dropped; session and registry state stay as they
/// were.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("MAC mismatch")]
    MacMismatch,

    #[error("signature verification failed")]
    BadSignature,

    #[error("no session key established")]
    NoSessionKey,

    #[error("timestamp drift {drift}s exceeds limit {limit}s")]
    TimeDrift { drift: i64, limit: i64 },

    #[error("out-of-order sequence {seq} (last accepted {last})")]
    OutOfOrderSeq { seq: u32, last: u32 },

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("malformed field: {0}")]
    MalformedField(&'static str),
}
