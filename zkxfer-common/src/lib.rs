//! zkxfer-common
//!
//! Shared primitives for the zkxfer transfer protocol.
//!
//! # Protocol Surface
//!
//! A sender commits to a secret transfer plan, proves knowledge of it in a
//! pre-transfer, collects friend verifications anchored in an append-only
//! Merkle accumulator, proves each friend's verification against a historical
//! accumulator root, and finally proves an aggregate condition to release funds.
//!
//! This crate holds the pieces every other crate agrees on byte-for-byte:
//!
//! - Domain types (`Digest`, `Identity`, `U256`) and the compatibility constants
//! - The canonical word codec (big-endian integers, padded addresses)
//! - Proof-oracle request framing:
//!
//! ```text
//! stage_tag (32) || input_length (32) || fixed_inputs (input_length) || proof (..)
//! ```
//!
//! `input_length` counts the fixed inputs only; the proof bytes trail the frame.

pub mod codec;
pub mod types;

pub use codec::{
    address_digest, bool_word, decode_i256, decode_u256, digest_word, encode_i256, encode_u256,
    encode_u64_word, identity_raw, parse_frame, CodecError, ProofRequest, Word,
};
pub use types::{FriendBitmap, StageTag};

pub use ethers_core::types::{Address as Identity, H256 as Digest, U256};

/// Maximum number of friends a single commitment can name.
pub const MAX_FRIENDS: usize = 16;

/// Depth of the verification Merkle accumulator (level 0 is the root).
pub const MERKLE_DEPTH: usize = 32;

/// Depth of the client-side friend tree; `1 << FRIENDS_MERKLE_DEPTH == MAX_FRIENDS`.
pub const FRIENDS_MERKLE_DEPTH: usize = 4;

/// Width of a codec word and of every digest.
pub const WORD_BYTES: usize = 32;

/// Width of a raw identity.
pub const IDENTITY_BYTES: usize = 20;

/// Hex helpers for opaque byte payloads (proofs, receipts, invitations).
pub mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    /// Encode bytes as a `0x`-prefixed lowercase hex string.
    pub fn to_hex(bytes: impl AsRef<[u8]>) -> String {
        format!("0x{}", hex::encode(bytes))
    }

    /// Decode a hex string, with or without the `0x` prefix.
    pub fn from_hex(value: &str) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(value.strip_prefix("0x").unwrap_or(value))
    }

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_hex(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        from_hex(&value).map_err(de::Error::custom)
    }

    /// Same encoding for a list of payloads.
    pub mod vec {
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_seq(items.iter().map(super::to_hex))
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let values = Vec::<String>::deserialize(deserializer)?;
            values
                .iter()
                .map(|v| super::from_hex(v).map_err(de::Error::custom))
                .collect()
        }
    }
}
