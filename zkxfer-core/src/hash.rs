//! Compression hash adapter.
//!
//! The external hash consumes `personalization (32, two's complement) || left
//! (32) || right (32)`. Personalization `-1` is reserved for commitments;
//! `0..depth` selects the Merkle height counted up from the leaves.

use std::sync::Arc;

use blake3::Hasher;
use ethers_core::types::H256;
use zkxfer_common::{digest_word, encode_i256, WORD_BYTES};

use crate::oracle::OracleError;

/// Personalization reserved for commitment derivation.
pub const COMMITMENT_PERSONALIZATION: i64 = -1;

/// Byte length of a framed compression input.
pub const COMPRESSION_INPUT_BYTES: usize = 3 * WORD_BYTES;

const BLAKE3_DOMAIN: &[u8] = b"zkxfer_compression_v1";

/// Two-to-one compression primitive consumed by the accumulator and the engine.
pub trait CompressionHash: Send + Sync {
    fn compress_raw(
        &self,
        input: &[u8; COMPRESSION_INPUT_BYTES],
    ) -> Result<[u8; WORD_BYTES], OracleError>;
}

impl<T: CompressionHash + ?Sized> CompressionHash for Arc<T> {
    fn compress_raw(
        &self,
        input: &[u8; COMPRESSION_INPUT_BYTES],
    ) -> Result<[u8; WORD_BYTES], OracleError> {
        (**self).compress_raw(input)
    }
}

/// Domain-separated BLAKE3 over the framed input.
#[derive(Clone, Copy, Debug, Default)]
pub struct Blake3Compression;

impl CompressionHash for Blake3Compression {
    fn compress_raw(
        &self,
        input: &[u8; COMPRESSION_INPUT_BYTES],
    ) -> Result<[u8; WORD_BYTES], OracleError> {
        let mut hasher = Hasher::new();
        hasher.update(BLAKE3_DOMAIN);
        hasher.update(input);
        Ok(*hasher.finalize().as_bytes())
    }
}

/// Frames digests for a [`CompressionHash`].
#[derive(Clone, Debug, Default)]
pub struct Compressor<H> {
    hash: H,
}

impl<H: CompressionHash> Compressor<H> {
    pub fn new(hash: H) -> Self {
        Self { hash }
    }

    pub fn inner(&self) -> &H {
        &self.hash
    }

    pub fn compress(&self, left: &H256, right: &H256, personalization: i64) -> Result<H256, OracleError> {
        let mut input = [0u8; COMPRESSION_INPUT_BYTES];
        input[..WORD_BYTES].copy_from_slice(&encode_i256(personalization));
        input[WORD_BYTES..2 * WORD_BYTES].copy_from_slice(&digest_word(left));
        input[2 * WORD_BYTES..].copy_from_slice(&digest_word(right));
        self.hash.compress_raw(&input).map(H256)
    }

    /// `compress(left, right, -1)`.
    pub fn commitment(&self, left: &H256, right: &H256) -> Result<H256, OracleError> {
        self.compress(left, right, COMMITMENT_PERSONALIZATION)
    }

    /// Merkle node at `height` above the leaves (0 = parent of two leaves).
    pub fn merkle_node(&self, left: &H256, right: &H256, height: usize) -> Result<H256, OracleError> {
        self.compress(left, right, height as i64)
    }

    /// Left fold of `items` under the commitment personalization.
    pub fn accumulate(&self, items: &[H256]) -> Result<H256, OracleError> {
        let (first, rest) = items
            .split_first()
            .ok_or_else(|| OracleError::Malformed("cannot accumulate an empty sequence".into()))?;
        rest.iter()
            .try_fold(*first, |acc, item| self.commitment(&acc, item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingHash {
        seen: Mutex<Vec<[u8; COMPRESSION_INPUT_BYTES]>>,
    }

    impl CompressionHash for CapturingHash {
        fn compress_raw(
            &self,
            input: &[u8; COMPRESSION_INPUT_BYTES],
        ) -> Result<[u8; WORD_BYTES], OracleError> {
            self.seen.lock().expect("capture lock").push(*input);
            Ok([0x42; WORD_BYTES])
        }
    }

    #[test]
    fn personalization_precedes_operands() {
        let compressor = Compressor::new(CapturingHash::default());
        compressor
            .compress(&H256::repeat_byte(1), &H256::repeat_byte(2), -1)
            .unwrap();
        compressor
            .merkle_node(&H256::repeat_byte(3), &H256::repeat_byte(4), 5)
            .unwrap();

        let seen = compressor.inner().seen.lock().unwrap();
        assert_eq!(&seen[0][..32], &[0xff; 32]);
        assert_eq!(&seen[0][32..64], &[1; 32]);
        assert_eq!(&seen[0][64..], &[2; 32]);
        assert_eq!(seen[1][31], 5);
        assert!(seen[1][..31].iter().all(|b| *b == 0));
    }

    #[test]
    fn blake3_separates_personalizations() {
        let compressor = Compressor::new(Blake3Compression);
        let a = H256::repeat_byte(9);
        let commitment = compressor.commitment(&a, &a).unwrap();
        let node = compressor.merkle_node(&a, &a, 0).unwrap();
        assert_ne!(commitment, node);
        assert_eq!(commitment, compressor.compress(&a, &a, -1).unwrap());
    }

    #[test]
    fn accumulate_folds_left() {
        let compressor = Compressor::new(Blake3Compression);
        let (a, b, c) = (H256::repeat_byte(1), H256::repeat_byte(2), H256::repeat_byte(3));
        let expected = compressor
            .commitment(&compressor.commitment(&a, &b).unwrap(), &c)
            .unwrap();
        assert_eq!(compressor.accumulate(&[a, b, c]).unwrap(), expected);
        assert_eq!(compressor.accumulate(&[a]).unwrap(), a);
        assert!(compressor.accumulate(&[]).is_err());
    }
}
