//! Loragate Common Library
//!
//! Shared functionality for the loragate hub daemon:
//! - Crypto primitives (SHA-256/HMAC/HKDF, AES-128-CBC, secp160r1 ECDH,
//!   P-256 device identity)
//! - LoRa wire protocol (binary frames, encrypted payload seal/open)
//! - Node registry (adopted + discovered tables, replay defense)
//! - Secure server channel (MAC-authenticated framed JSON messages)

pub mod crypto;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;

pub use error::{AuthError, CryptoError, FrameError};
pub use protocol::{Frame, FrameType};
pub use registry::NodeRegistry;
pub use session::SecureChannel;
