//! Protocol enumerations and fixed-size records shared across crates.

use std::fmt;

use ethers_core::types::U256;
use serde::{Deserialize, Serialize};

use crate::{
    codec::{bool_word, CodecError, Word},
    MAX_FRIENDS,
};

/// Proof stage carried in the first word of every oracle frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTag {
    PreTransfer = 0,
    Preparation = 1,
    Transfer = 2,
}

impl StageTag {
    pub const ALL: [StageTag; 3] = [StageTag::PreTransfer, StageTag::Preparation, StageTag::Transfer];

    pub fn as_u64(self) -> u64 {
        self as u64
    }

    pub fn as_u256(self) -> U256 {
        U256::from(self.as_u64())
    }
}

impl fmt::Display for StageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageTag::PreTransfer => "PRETRANSFER",
            StageTag::Preparation => "PREPARATION",
            StageTag::Transfer => "TRANSFER",
        };
        f.write_str(name)
    }
}

impl TryFrom<u64> for StageTag {
    type Error = CodecError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StageTag::PreTransfer),
            1 => Ok(StageTag::Preparation),
            2 => Ok(StageTag::Transfer),
            other => Err(CodecError::UnknownStage(U256::from(other))),
        }
    }
}

impl TryFrom<U256> for StageTag {
    type Error = CodecError;

    fn try_from(value: U256) -> Result<Self, Self::Error> {
        if value > U256::from(u64::MAX) {
            return Err(CodecError::UnknownStage(value));
        }
        StageTag::try_from(value.as_u64())
    }
}

/// Per-friend verification flags of a pre-transfer, one slot per friend index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendBitmap {
    bits: [bool; MAX_FRIENDS],
}

impl FriendBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a slot. Returns `false` when the slot is out of range or already set.
    pub fn set(&mut self, slot: usize) -> bool {
        match self.bits.get_mut(slot) {
            Some(bit) if !*bit => {
                *bit = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_set(&self, slot: usize) -> bool {
        self.bits.get(slot).copied().unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Indices of set slots, ascending.
    pub fn indices(&self) -> Vec<usize> {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.then_some(i))
            .collect()
    }

    pub fn as_slice(&self) -> &[bool; MAX_FRIENDS] {
        &self.bits
    }

    /// One word per slot (`0` or `1`), in slot order.
    pub fn to_words(&self) -> Vec<Word> {
        self.bits.iter().map(|b| bool_word(*b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_tags_are_stable() {
        assert_eq!(StageTag::PreTransfer.as_u64(), 0);
        assert_eq!(StageTag::Preparation.as_u64(), 1);
        assert_eq!(StageTag::Transfer.as_u64(), 2);
        assert!(StageTag::try_from(3u64).is_err());
        assert!(StageTag::try_from(U256::MAX).is_err());
        assert_eq!(StageTag::try_from(U256::from(2u64)).unwrap(), StageTag::Transfer);
    }

    #[test]
    fn bitmap_set_is_single_shot() {
        let mut bitmap = FriendBitmap::new();
        assert!(bitmap.set(3));
        assert!(!bitmap.set(3));
        assert!(!bitmap.set(MAX_FRIENDS));
        assert!(bitmap.is_set(3));
        assert!(!bitmap.is_set(MAX_FRIENDS + 4));
        assert_eq!(bitmap.count(), 1);
        assert_eq!(bitmap.indices(), vec![3]);
    }

    #[test]
    fn bitmap_words_follow_slot_order() {
        let mut bitmap = FriendBitmap::new();
        bitmap.set(0);
        bitmap.set(15);
        let words = bitmap.to_words();
        assert_eq!(words.len(), MAX_FRIENDS);
        assert_eq!(words[0][31], 1);
        assert_eq!(words[1], [0u8; 32]);
        assert_eq!(words[15][31], 1);
    }
}
