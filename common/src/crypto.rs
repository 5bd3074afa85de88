//! Abstractions of the cryptographic primitives the engine composes.
//!
//! The engine never implements a primitive itself; it receives trait objects
//! for whatever it needs at construction time, bundled in [`Implementation`].

use crate::Error;
use alloc::vec::Vec;
use skm_wire::keymaster::EcCurve;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Parsed key material, as produced by a context's key-blob parser and
/// consumed by the per-algorithm factories. The engine treats the contents as
/// opaque.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub enum KeyMaterial {
    /// Raw AES key bytes.
    Aes(Vec<u8>),
    /// Raw 3-DES key bytes (24 bytes, parity bits ignored).
    TripleDes(Vec<u8>),
    /// Raw HMAC key bytes.
    Hmac(Vec<u8>),
    /// PKCS#8 DER-encoded RSA private key.
    Rsa(Vec<u8>),
    /// EC private key material for the given curve (SEC-1 scalar for NIST
    /// curves, raw 32 bytes for curve 25519).
    Ec(#[zeroize(skip)] EcCurve, Vec<u8>),
}

impl core::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Key bytes deliberately omitted.
        match self {
            KeyMaterial::Aes(_) => write!(f, "KeyMaterial::Aes(...)"),
            KeyMaterial::TripleDes(_) => write!(f, "KeyMaterial::TripleDes(...)"),
            KeyMaterial::Hmac(_) => write!(f, "KeyMaterial::Hmac(...)"),
            KeyMaterial::Rsa(_) => write!(f, "KeyMaterial::Rsa(...)"),
            KeyMaterial::Ec(curve, _) => write!(f, "KeyMaterial::Ec({:?}, ...)", curve),
        }
    }
}

/// Combined collection of trait implementations that must be provided.
pub struct Implementation<'a> {
    /// Random number generator.
    pub rng: &'a mut dyn Rng,

    /// A constant-time equality implementation.
    pub compare: &'a dyn ConstTimeEq,

    /// HMAC-SHA256 implementation.
    pub hmac: &'a dyn Hmac,

    /// HKDF implementation.
    pub hkdf: &'a dyn Hkdf,

    /// AES-GCM implementation.
    pub aes_gcm: &'a dyn AesGcm,

    /// EC implementation (ECDSA P-256, X25519, Ed25519).
    pub ec: &'a dyn Ec,
}

/// Abstraction of a random number generator that is cryptographically secure
/// and which accepts additional entropy to be mixed in.
pub trait Rng {
    /// Add entropy to the generator's pool.
    fn add_entropy(&mut self, data: &[u8]);
    /// Generate random data.
    fn fill_bytes(&mut self, dest: &mut [u8]);
    /// Return a random `u64` value.
    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }
}

/// Abstraction of constant-time comparisons, for use in cryptographic contexts
/// where timing attacks need to be avoided.
pub trait ConstTimeEq {
    /// Indicate whether arguments are the same.
    fn eq(&self, left: &[u8], right: &[u8]) -> bool;
    /// Indicate whether arguments are different.
    fn ne(&self, left: &[u8], right: &[u8]) -> bool {
        !self.eq(left, right)
    }
}

/// Abstraction of one-shot HMAC-SHA256.
pub trait Hmac {
    /// Compute the HMAC-SHA256 tag over `data` with the given raw `key`.
    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Abstraction of HKDF key derivation with HMAC-SHA256.
pub trait Hkdf {
    fn hkdf(&self, salt: &[u8], ikm: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>, Error>;
}

/// Abstraction of AES-GCM encryption as used by COSE_Encrypt construction.
pub trait AesGcm {
    /// Encrypt `plaintext` with the given key, nonce and additional data,
    /// returning ciphertext with the tag appended.
    fn encrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error>;
}

/// Abstraction of the elliptic-curve functionality used for CSR construction.
pub trait Ec {
    /// Generate an X25519 keypair, returning `(private, public)` raw bytes.
    fn generate_x25519_keypair(&self, rng: &mut dyn Rng)
        -> Result<([u8; 32], [u8; 32]), Error>;

    /// Compute the raw X25519 shared secret between `priv_key` and `peer_public`.
    fn x25519_agree(&self, priv_key: &[u8], peer_public: &[u8]) -> Result<Vec<u8>, Error>;

    /// ECDSA-sign `msg` with a raw P-256 private scalar, returning the
    /// 64-byte `r || s` form used by COSE.
    fn ecdsa_p256_sign(&self, priv_key: &[u8], msg: &[u8]) -> Result<Vec<u8>, Error>;

    /// Sign `msg` with a raw Ed25519 private key.
    fn ed25519_sign(&self, _priv_key: &[u8], _msg: &[u8]) -> Result<Vec<u8>, Error> {
        crate::unimpl!();
    }

    /// Verify an Ed25519 signature.
    fn ed25519_verify(&self, _pub_key: &[u8], _msg: &[u8], _sig: &[u8]) -> Result<bool, Error> {
        crate::unimpl!();
    }
}
