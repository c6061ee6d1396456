//! AES-128-CBC with the LoRa protocol's padding scheme
//!
//! Padding appends a 0x80 marker and zero-fills to the next 16-byte
//! boundary. This is NOT PKCS#7: the original plaintext length travels
//! out-of-band in the packet header, and decryption strips padding by
//! truncating to that length, never by inspecting trailing bytes.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::FrameError;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Pad with 0x80 then zeros up to the next 16-byte boundary.
fn pad(plaintext: &[u8]) -> Vec<u8> {
    let padded_len = (plaintext.len() + BLOCK_SIZE) / BLOCK_SIZE * BLOCK_SIZE;
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(plaintext);
    padded.push(0x80);
    padded.resize(padded_len, 0x00);
    padded
}

/// Encrypt `plaintext` under `key`/`iv`, padding to whole blocks.
///
/// The returned ciphertext is always at least one block, even for empty
/// input.
pub fn encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let padded = pad(plaintext);

    let mut ciphertext = Vec::with_capacity(padded.len());
    let mut chain = *iv;
    for chunk in padded.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        for (i, (p, c)) in chunk.iter().zip(chain.iter()).enumerate() {
            block[i] = p ^ c;
        }
        let mut ga = GenericArray::clone_from_slice(&block);
        cipher.encrypt_block(&mut ga);
        chain.copy_from_slice(&ga);
        ciphertext.extend_from_slice(&ga);
    }

    ciphertext
}

/// Decrypt `ciphertext` and truncate to `orig_len`.
///
/// The ciphertext must be a whole number of blocks and `orig_len` must
/// not exceed it; both violations are malformed-input errors.
pub fn decrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    ciphertext: &[u8],
    orig_len: usize,
) -> Result<Vec<u8>, FrameError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(FrameError::UnalignedCiphertext(ciphertext.len()));
    }
    if orig_len > ciphertext.len() {
        return Err(FrameError::BadOriginalLength {
            orig: orig_len,
            cipher: ciphertext.len(),
        });
    }

    let cipher = Aes128::new(GenericArray::from_slice(key));

    let mut plaintext = Vec::with_capacity(ciphertext.len());
    let mut chain = *iv;
    for chunk in ciphertext.chunks(BLOCK_SIZE) {
        let mut ga = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut ga);
        for (i, c) in chain.iter().enumerate() {
            plaintext.push(ga[i] ^ c);
        }
        chain.copy_from_slice(chunk);
    }

    plaintext.truncate(orig_len);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = *b"0123456789abcdef";
    const IV: [u8; 16] = [0x42; 16];

    #[test]
    fn test_roundtrip_all_lengths() {
        for len in 0..=127 {
            let plaintext: Vec<u8> = (0..len as u8).collect();
            let ciphertext = encrypt(&KEY, &IV, &plaintext);

            assert_eq!(ciphertext.len() % BLOCK_SIZE, 0, "len {}", len);
            assert!(!ciphertext.is_empty(), "len {}", len);

            let decrypted = decrypt(&KEY, &IV, &ciphertext, len).unwrap();
            assert_eq!(decrypted, plaintext, "len {}", len);
        }
    }

    #[test]
    fn test_padding_marker_layout() {
        // 22 bytes pads to 32: marker at offset 22, zeros after.
        let padded = pad(&[0xaa; 22]);
        assert_eq!(padded.len(), 32);
        assert_eq!(padded[22], 0x80);
        assert!(padded[23..].iter().all(|&b| b == 0));

        // A block-aligned plaintext still grows by a full block.
        let padded = pad(&[0xaa; 16]);
        assert_eq!(padded.len(), 32);
        assert_eq!(padded[16], 0x80);
    }

    #[test]
    fn test_ciphertext_depends_on_iv() {
        let a = encrypt(&KEY, &IV, b"same plaintext");
        let b = encrypt(&KEY, &[0x43; 16], b"same plaintext");
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_rejects_unaligned_input() {
        let err = decrypt(&KEY, &IV, &[0u8; 17], 4).unwrap_err();
        assert_eq!(err, FrameError::UnalignedCiphertext(17));

        let err = decrypt(&KEY, &IV, &[], 0).unwrap_err();
        assert_eq!(err, FrameError::UnalignedCiphertext(0));
    }

    #[test]
    fn test_decrypt_rejects_oversized_orig_len() {
        let ciphertext = encrypt(&KEY, &IV, b"short");
        let err = decrypt(&KEY, &IV, &ciphertext, 64).unwrap_err();
        assert_eq!(
            err,
            FrameError::BadOriginalLength {
                orig: 64,
                cipher: 16
            }
        );
    }
}
