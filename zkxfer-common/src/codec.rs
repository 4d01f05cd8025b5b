//! Canonical byte codec.
//!
//! Every integer is a 32-byte big-endian word, signed integers use two's
//! complement, identities are left-padded to a word when hashed. The frame
//! layout produced by [`ProofRequest::frame`] is the wire contract with the
//! proof oracle: a single byte out of place invalidates every proof.

use ethers_core::types::{Address, H256, U256};
use thiserror::Error;

use crate::{types::StageTag, IDENTITY_BYTES, WORD_BYTES};

/// A single 32-byte codec word.
pub type Word = [u8; WORD_BYTES];

/// Errors decoding codec words or frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes than the layout requires.
    #[error("frame truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    /// Stage tag outside the known enumeration.
    #[error("unknown stage tag {0}")]
    UnknownStage(U256),

    /// Declared input length is not a whole number of words.
    #[error("input length {0} is not a multiple of {WORD_BYTES}")]
    MisalignedInputs(U256),

    /// Word does not hold a sign-extended 64-bit value.
    #[error("word does not fit a 64-bit signed integer")]
    IntegerOverflow,
}

/// Encode an unsigned 256-bit integer as a big-endian word.
pub fn encode_u256(value: U256) -> Word {
    let mut out = [0u8; WORD_BYTES];
    value.to_big_endian(&mut out);
    out
}

pub fn encode_u64_word(value: u64) -> Word {
    encode_u256(U256::from(value))
}

/// Encode a signed integer as a 32-byte two's-complement big-endian word.
pub fn encode_i256(value: i64) -> Word {
    let fill = if value < 0 { 0xff } else { 0x00 };
    let mut out = [fill; WORD_BYTES];
    out[WORD_BYTES - 8..].copy_from_slice(&value.to_be_bytes());
    out
}

pub fn decode_u256(word: &Word) -> U256 {
    U256::from_big_endian(word)
}

/// Inverse of [`encode_i256`]; rejects words that are not sign extensions of an `i64`.
pub fn decode_i256(word: &Word) -> Result<i64, CodecError> {
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&word[WORD_BYTES - 8..]);
    let value = i64::from_be_bytes(tail);
    let fill = if value < 0 { 0xff } else { 0x00 };
    if word[..WORD_BYTES - 8].iter().any(|b| *b != fill) {
        return Err(CodecError::IntegerOverflow);
    }
    Ok(value)
}

/// Hash-input form of an identity: the 20 address bytes left-padded with zeros.
pub fn address_digest(identity: &Address) -> H256 {
    let mut out = [0u8; WORD_BYTES];
    out[WORD_BYTES - IDENTITY_BYTES..].copy_from_slice(identity.as_bytes());
    H256(out)
}

/// Raw 20-byte form of an identity.
pub fn identity_raw(identity: &Address) -> [u8; IDENTITY_BYTES] {
    identity.to_fixed_bytes()
}

pub fn digest_word(digest: &H256) -> Word {
    digest.to_fixed_bytes()
}

pub fn bool_word(flag: bool) -> Word {
    encode_u64_word(flag as u64)
}

/// A proof-verification request before framing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofRequest {
    pub stage: StageTag,
    pub fixed_inputs: Vec<Word>,
    pub proof: Vec<u8>,
}

impl ProofRequest {
    pub fn new(stage: StageTag, proof: impl Into<Vec<u8>>) -> Self {
        Self {
            stage,
            fixed_inputs: Vec::new(),
            proof: proof.into(),
        }
    }

    /// Append a raw word to the fixed inputs.
    pub fn word(mut self, word: Word) -> Self {
        self.fixed_inputs.push(word);
        self
    }

    pub fn digest(self, digest: &H256) -> Self {
        self.word(digest_word(digest))
    }

    pub fn uint(self, value: U256) -> Self {
        self.word(encode_u256(value))
    }

    pub fn index(self, value: u64) -> Self {
        self.word(encode_u64_word(value))
    }

    pub fn words(mut self, words: impl IntoIterator<Item = Word>) -> Self {
        self.fixed_inputs.extend(words);
        self
    }

    /// Byte length of the fixed inputs, excluding the proof.
    pub fn input_length(&self) -> usize {
        self.fixed_inputs.len() * WORD_BYTES
    }

    /// Serialize to `stage_tag || input_length || fixed_inputs || proof`.
    pub fn frame(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 * WORD_BYTES + self.input_length() + self.proof.len());
        buf.extend_from_slice(&encode_u256(self.stage.as_u256()));
        buf.extend_from_slice(&encode_u64_word(self.input_length() as u64));
        for word in &self.fixed_inputs {
            buf.extend_from_slice(word);
        }
        buf.extend_from_slice(&self.proof);
        buf
    }
}

/// Decode a frame produced by [`ProofRequest::frame`].
pub fn parse_frame(bytes: &[u8]) -> Result<ProofRequest, CodecError> {
    let header = 2 * WORD_BYTES;
    if bytes.len() < header {
        return Err(CodecError::Truncated {
            needed: header,
            got: bytes.len(),
        });
    }

    let stage_raw = decode_u256(&read_word(bytes, 0));
    let stage = StageTag::try_from(stage_raw)?;

    let length_raw = decode_u256(&read_word(bytes, WORD_BYTES));
    if length_raw > U256::from(bytes.len() - header) {
        return Err(CodecError::Truncated {
            needed: header.saturating_add(length_raw.low_u64() as usize),
            got: bytes.len(),
        });
    }
    let input_length = length_raw.as_usize();
    if input_length % WORD_BYTES != 0 {
        return Err(CodecError::MisalignedInputs(length_raw));
    }

    let fixed_inputs = (0..input_length / WORD_BYTES)
        .map(|i| read_word(bytes, header + i * WORD_BYTES))
        .collect();

    Ok(ProofRequest {
        stage,
        fixed_inputs,
        proof: bytes[header + input_length..].to_vec(),
    })
}

fn read_word(bytes: &[u8], offset: usize) -> Word {
    let mut word = [0u8; WORD_BYTES];
    word.copy_from_slice(&bytes[offset..offset + WORD_BYTES]);
    word
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn u256_is_big_endian() {
        let word = encode_u64_word(0x0102);
        assert_eq!(word[30], 0x01);
        assert_eq!(word[31], 0x02);
        assert!(word[..30].iter().all(|b| *b == 0));
    }

    #[test]
    fn negative_one_is_all_ones() {
        assert_eq!(encode_i256(-1), [0xff; 32]);
        assert_eq!(encode_i256(0), [0u8; 32]);
        assert_eq!(encode_i256(31)[31], 31);
    }

    #[test]
    fn decode_i256_rejects_wide_values() {
        let mut word = [0u8; 32];
        word[0] = 1;
        assert_eq!(decode_i256(&word), Err(CodecError::IntegerOverflow));
    }

    #[test]
    fn address_digest_is_left_padded() {
        let identity = Address::repeat_byte(0xab);
        let digest = address_digest(&identity);
        assert!(digest.as_bytes()[..12].iter().all(|b| *b == 0));
        assert_eq!(&digest.as_bytes()[12..], identity.as_bytes());
        assert_eq!(identity_raw(&identity), [0xab; 20]);
    }

    #[test]
    fn frame_layout_matches_wire_contract() {
        let request = ProofRequest::new(StageTag::Preparation, vec![0xaa, 0xbb, 0xcc])
            .digest(&H256::repeat_byte(0x11))
            .index(7);
        let frame = request.frame();

        assert_eq!(frame.len(), 32 + 32 + 64 + 3);
        assert_eq!(frame[31], 1, "stage tag");
        assert_eq!(decode_u256(&read_word(&frame, 32)), U256::from(64u64));
        assert_eq!(&frame[64..96], &[0x11; 32]);
        assert_eq!(frame[127], 7);
        assert_eq!(&frame[128..], &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn input_length_excludes_proof() {
        let request = ProofRequest::new(StageTag::Transfer, vec![0u8; 200]).index(1);
        assert_eq!(request.input_length(), 32);
    }

    #[test]
    fn parse_frame_rejects_unknown_stage() {
        let mut frame = ProofRequest::new(StageTag::PreTransfer, vec![]).frame();
        frame[31] = 9;
        assert!(matches!(parse_frame(&frame), Err(CodecError::UnknownStage(_))));
    }

    #[test]
    fn parse_frame_rejects_truncated_inputs() {
        let mut frame = ProofRequest::new(StageTag::PreTransfer, vec![])
            .index(1)
            .index(2)
            .frame();
        frame.truncate(64 + 40);
        assert!(matches!(parse_frame(&frame), Err(CodecError::Truncated { .. })));
        assert!(matches!(parse_frame(&[0u8; 10]), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn parse_frame_rejects_misaligned_length() {
        let mut frame = ProofRequest::new(StageTag::PreTransfer, vec![0u8; 64]).frame();
        frame[63] = 5;
        assert!(matches!(parse_frame(&frame), Err(CodecError::MisalignedInputs(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn i256_words_decode_to_the_same_value(value in any::<i64>()) {
            prop_assert_eq!(decode_i256(&encode_i256(value)).unwrap(), value);
        }

        #[test]
        fn parsed_frames_keep_inputs_and_proof(
            words in proptest::collection::vec(any::<[u8; 32]>(), 0..6),
            proof in proptest::collection::vec(any::<u8>(), 0..96),
        ) {
            let request = ProofRequest::new(StageTag::Transfer, proof).words(words);
            let parsed = parse_frame(&request.frame()).unwrap();
            prop_assert_eq!(parsed, request);
        }
    }
}
