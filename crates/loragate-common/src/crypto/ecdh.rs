//! secp160r1 ECDH for LoRa adoption
//!
//! The adoption handshake is fixed to a 160-bit curve with 40-byte
//! uncompressed public keys (x ‖ y), 21-byte private scalars and 20-byte
//! shared secrets. No registry crate ships this curve, so the affine
//! group arithmetic lives here on top of `num-bigint`. Key generation and
//! the shared-secret computation each take a few milliseconds; the loop
//! accepts that stall during adoption.

use std::sync::OnceLock;

use num_bigint::BigUint;
use num_traits::Zero;

use crate::crypto::random_bytes;
use crate::error::CryptoError;

/// Uncompressed public key: x ‖ y, 20 bytes each, big-endian.
pub const PUBLIC_KEY_SIZE: usize = 40;
/// Private scalar, big-endian (the group order is 161 bits).
pub const PRIVATE_KEY_SIZE: usize = 21;
/// Shared secret: the x-coordinate of the ECDH product point.
pub const SHARED_SECRET_SIZE: usize = 20;
/// Symmetric session key derived from a shared secret by XOR-fold.
pub const SESSION_KEY_SIZE: usize = 16;

/// secp160r1 domain parameters (SEC 2).
struct Curve {
    p: BigUint,
    a: BigUint,
    b: BigUint,
    gx: BigUint,
    gy: BigUint,
    n: BigUint,
}

fn curve() -> &'static Curve {
    static CURVE: OnceLock<Curve> = OnceLock::new();
    CURVE.get_or_init(|| {
        let p = biguint("ffffffffffffffffffffffffffffffff7fffffff");
        let a = &p - 3u8;
        Curve {
            a,
            b: biguint("1c97befc54bd7a8b65acf89f81d4d4adc565fa45"),
            gx: biguint("4a96b5688ef573284664698968c38bb913cbfc82"),
            gy: biguint("23a628553168947d59dccc912042351377ac5fb3"),
            n: biguint("0100000000000000000001f4c8f927aed3ca752257"),
            p,
        }
    })
}

fn biguint(hex_str: &str) -> BigUint {
    BigUint::parse_bytes(hex_str.as_bytes(), 16).expect("valid curve constant")
}

/// Affine point; `None` is the point at infinity.
type Point = Option<(BigUint, BigUint)>;

fn mod_sub(a: &BigUint, b: &BigUint, p: &BigUint) -> BigUint {
    ((a + p) - b) % p
}

fn mod_inv(x: &BigUint, p: &BigUint) -> BigUint {
    // p is prime, so x^(p-2) is the inverse of x (Fermat).
    x.modpow(&(p - 2u8), p)
}

fn point_add(lhs: &Point, rhs: &Point) -> Point {
    let c = curve();
    let (x1, y1) = match lhs {
        Some(p) => p,
        None => return rhs.clone(),
    };
    let (x2, y2) = match rhs {
        Some(p) => p,
        None => return lhs.clone(),
    };

    let lambda = if x1 == x2 {
        if (y1 + y2) % &c.p == BigUint::zero() {
            return None;
        }
        // Tangent slope: (3*x1^2 + a) / (2*y1)
        let num = (x1 * x1 * 3u8 + &c.a) % &c.p;
        let den = (y1 * 2u8) % &c.p;
        (num * mod_inv(&den, &c.p)) % &c.p
    } else {
        // Chord slope: (y2 - y1) / (x2 - x1)
        let num = mod_sub(y2, y1, &c.p);
        let den = mod_sub(x2, x1, &c.p);
        (num * mod_inv(&den, &c.p)) % &c.p
    };

    let x3 = mod_sub(&mod_sub(&(&lambda * &lambda % &c.p), x1, &c.p), x2, &c.p);
    let y3 = mod_sub(&(&lambda * mod_sub(x1, &x3, &c.p) % &c.p), y1, &c.p);
    Some((x3, y3))
}

fn scalar_mul(k: &BigUint, point: &Point) -> Point {
    let mut result: Point = None;
    if k.is_zero() {
        return result;
    }
    for i in (0..k.bits()).rev() {
        result = point_add(&result, &result.clone());
        if k.bit(i) {
            result = point_add(&result, point);
        }
    }
    result
}

fn on_curve(x: &BigUint, y: &BigUint) -> bool {
    let c = curve();
    if x >= &c.p || y >= &c.p {
        return false;
    }
    let lhs = (y * y) % &c.p;
    let rhs = (x * x % &c.p * x + &c.a * x + &c.b) % &c.p;
    lhs == rhs
}

fn to_fixed_be(v: &BigUint, len: usize) -> Vec<u8> {
    let bytes = v.to_bytes_be();
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

/// A secp160r1 key pair in the wire encoding used on the LoRa link.
#[derive(Clone)]
pub struct KeyPair {
    pub private: [u8; PRIVATE_KEY_SIZE],
    pub public: [u8; PUBLIC_KEY_SIZE],
}

/// Generate a fresh key pair from the OS CSPRNG.
pub fn make_keypair() -> Result<KeyPair, CryptoError> {
    let c = curve();
    loop {
        let mut raw = [0u8; PRIVATE_KEY_SIZE];
        random_bytes(&mut raw);
        // The order is 161 bits; mask the top byte down so roughly every
        // other draw lands in range.
        raw[0] &= 0x01;

        let d = BigUint::from_bytes_be(&raw);
        if d.is_zero() || d >= c.n {
            continue;
        }

        let public = scalar_mul(&d, &Some((c.gx.clone(), c.gy.clone())))
            .ok_or(CryptoError::KeyGeneration)?;

        let mut out = KeyPair {
            private: raw,
            public: [0u8; PUBLIC_KEY_SIZE],
        };
        out.public[..20].copy_from_slice(&to_fixed_be(&public.0, 20));
        out.public[20..].copy_from_slice(&to_fixed_be(&public.1, 20));
        return Ok(out);
    }
}

/// ECDH: x-coordinate of `my_private * their_public`.
pub fn shared_secret(
    their_public: &[u8; PUBLIC_KEY_SIZE],
    my_private: &[u8; PRIVATE_KEY_SIZE],
) -> Result<[u8; SHARED_SECRET_SIZE], CryptoError> {
    let x = BigUint::from_bytes_be(&their_public[..20]);
    let y = BigUint::from_bytes_be(&their_public[20..]);
    if !on_curve(&x, &y) {
        return Err(CryptoError::InvalidPublicKey);
    }

    let d = BigUint::from_bytes_be(my_private);
    let product = scalar_mul(&d, &Some((x, y))).ok_or(CryptoError::InvalidPublicKey)?;

    let mut secret = [0u8; SHARED_SECRET_SIZE];
    secret.copy_from_slice(&to_fixed_be(&product.0, SHARED_SECRET_SIZE));
    Ok(secret)
}

/// Fold a 20-byte shared secret down to the 16-byte LoRa session key.
///
/// `sk[i] = secret[i] XOR secret[(i+4) mod 20]` — protocol-mandated, both
/// ends of the link must reproduce it exactly.
pub fn derive_session_key(secret: &[u8; SHARED_SECRET_SIZE]) -> [u8; SESSION_KEY_SIZE] {
    let mut key = [0u8; SESSION_KEY_SIZE];
    for (i, slot) in key.iter_mut().enumerate() {
        *slot = secret[i] ^ secret[(i + 4) % SHARED_SECRET_SIZE];
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_is_on_curve() {
        let c = curve();
        assert!(on_curve(&c.gx, &c.gy));
    }

    #[test]
    fn test_generator_has_expected_order() {
        let c = curve();
        let g: Point = Some((c.gx.clone(), c.gy.clone()));
        assert!(scalar_mul(&c.n, &g).is_none());
    }

    #[test]
    fn test_keypair_public_is_on_curve() {
        let pair = make_keypair().unwrap();
        let x = BigUint::from_bytes_be(&pair.public[..20]);
        let y = BigUint::from_bytes_be(&pair.public[20..]);
        assert!(on_curve(&x, &y));
    }

    #[test]
    fn test_shared_secret_agreement() {
        let alice = make_keypair().unwrap();
        let bob = make_keypair().unwrap();

        let s1 = shared_secret(&bob.public, &alice.private).unwrap();
        let s2 = shared_secret(&alice.public, &bob.private).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_shared_secret_rejects_bogus_public_key() {
        let pair = make_keypair().unwrap();
        let mut bogus = pair.public;
        bogus[5] ^= 0xff;
        assert!(shared_secret(&bogus, &pair.private).is_err());
    }

    #[test]
    fn test_session_key_xor_fold_vector() {
        let mut secret = [0u8; SHARED_SECRET_SIZE];
        for (i, b) in secret.iter_mut().enumerate() {
            *b = i as u8;
        }
        let key = derive_session_key(&secret);
        assert_eq!(
            key,
            [4, 4, 4, 4, 12, 12, 12, 12, 4, 4, 4, 4, 28, 28, 28, 28]
        );
    }
}
