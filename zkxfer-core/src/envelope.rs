//! Public-key envelopes for invitations and verification receipts.
//!
//! ```text
//! ephemeral_pubkey (33, compressed SEC1) || ciphertext || tag (16)
//! ```
//!
//! 1. ECDH on secp256k1 between a fresh ephemeral key and the recipient key
//! 2. HKDF-SHA256 over the shared secret yields a 32-byte key and a 12-byte nonce
//! 3. ChaCha20-Poly1305 seals the plaintext
//!
//! Every envelope uses a fresh ephemeral key, so the derived nonce is never reused.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use k256::{ecdh::EphemeralSecret, elliptic_curve::sec1::ToEncodedPoint};
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use thiserror::Error;

pub use k256::{PublicKey, SecretKey};

const HKDF_INFO: &[u8] = b"zkxfer-envelope-v1";

pub const EPHEMERAL_KEY_LEN: usize = 33;
pub const TAG_LEN: usize = 16;
/// Bytes an envelope adds to its plaintext.
pub const ENVELOPE_OVERHEAD: usize = EPHEMERAL_KEY_LEN + TAG_LEN;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("envelope is {len} bytes, shorter than its {ENVELOPE_OVERHEAD}-byte overhead")]
    Truncated { len: usize },

    #[error("invalid ephemeral public key")]
    InvalidEphemeralKey,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Encryption,

    /// Wrong key or corrupted envelope.
    #[error("decryption failed")]
    Decryption,
}

/// Encrypt `plaintext` so only the holder of `recipient`'s secret key can read it.
pub fn seal<R: RngCore + CryptoRng>(
    recipient: &PublicKey,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, EnvelopeError> {
    let ephemeral = EphemeralSecret::random(rng);
    let shared = ephemeral.diffie_hellman(recipient);
    let (cipher, nonce) = derive_cipher(shared.raw_secret_bytes().as_slice())?;

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| EnvelopeError::Encryption)?;

    let mut sealed = Vec::with_capacity(EPHEMERAL_KEY_LEN + ciphertext.len());
    sealed.extend_from_slice(ephemeral.public_key().to_encoded_point(true).as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn open(secret: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if sealed.len() < ENVELOPE_OVERHEAD {
        return Err(EnvelopeError::Truncated { len: sealed.len() });
    }
    let (ephemeral, ciphertext) = sealed.split_at(EPHEMERAL_KEY_LEN);
    let ephemeral =
        PublicKey::from_sec1_bytes(ephemeral).map_err(|_| EnvelopeError::InvalidEphemeralKey)?;

    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
    let (cipher, nonce) = derive_cipher(shared.raw_secret_bytes().as_slice())?;
    cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|_| EnvelopeError::Decryption)
}

fn derive_cipher(shared_secret: &[u8]) -> Result<(ChaCha20Poly1305, Nonce), EnvelopeError> {
    let mut okm = [0u8; KEY_LEN + NONCE_LEN];
    Hkdf::<Sha256>::new(None, shared_secret)
        .expand(HKDF_INFO, &mut okm)
        .map_err(|_| EnvelopeError::KeyDerivation)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm[..KEY_LEN]));
    Ok((cipher, *Nonce::from_slice(&okm[KEY_LEN..])))
}
