//! Append-only sparse Merkle accumulator.
//!
//! Level `0` is the root and level `D` holds the leaves. Each level is a
//! growable sequence of populated digests; any index past the populated
//! range reads as that level's null digest, the root of an empty subtree:
//!
//! ```text
//! null[D] = 0x00..00
//! null[l] = compress(null[l+1], null[l+1], D-1-l)
//! ```
//!
//! Appends touch exactly one node per level, so update and proof cost are
//! `O(D)` regardless of how many leaves exist.

use ethers_core::types::H256;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use zkxfer_common::MERKLE_DEPTH;

use crate::{
    hash::{CompressionHash, Compressor},
    oracle::OracleError,
};

/// Accumulator of the protocol's fixed depth.
pub type VerificationTree = MerkleAccumulator<MERKLE_DEPTH>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccumulatorError {
    /// Query on a leaf that has not been appended.
    #[error("leaf index {index} out of range (populated leaves: {len})")]
    OutOfRange { index: u64, len: u64 },

    /// Write that would leave a gap in a level.
    #[error("non-contiguous write at level {level}, index {index} (level length {len})")]
    NonContiguousWrite { level: usize, index: u64, len: u64 },

    #[error("level {level} exceeds tree depth {depth}")]
    LevelOutOfBounds { level: usize, depth: usize },

    #[error("accumulator is full ({capacity} leaves)")]
    Full { capacity: u64 },

    /// Staged append no longer matches the tree it was computed against.
    #[error("staged append for leaf {staged} does not match next leaf {next}")]
    StaleStage { staged: u64, next: u64 },

    #[error(transparent)]
    Hash(#[from] OracleError),
}

/// Node writes computed for one append, not yet applied.
#[derive(Clone, Debug)]
pub struct StagedAppend {
    leaf_index: u64,
    leaf: H256,
    /// `(level, index, digest)` from the leaves' parents up to the root.
    writes: Vec<(usize, u64, H256)>,
}

impl StagedAppend {
    pub fn leaf_index(&self) -> u64 {
        self.leaf_index
    }

    /// Root the tree will have once this append is committed.
    pub fn root(&self) -> H256 {
        self.writes
            .last()
            .map(|(_, _, digest)| *digest)
            .unwrap_or(self.leaf)
    }
}

#[derive(Clone, Debug)]
pub struct MerkleAccumulator<const D: usize = MERKLE_DEPTH> {
    /// `null_digests[l]` is the digest of an empty subtree rooted at level `l`.
    null_digests: Vec<H256>,
    /// `levels[l]` holds the populated digests of level `l`; `levels[D]` are the leaves.
    levels: Vec<Vec<H256>>,
}

impl<const D: usize> MerkleAccumulator<D> {
    pub fn new<H: CompressionHash>(compressor: &Compressor<H>) -> Result<Self, AccumulatorError> {
        let mut null_digests = vec![H256::zero(); D + 1];
        for level in (0..D).rev() {
            let below = null_digests[level + 1];
            null_digests[level] = compressor.merkle_node(&below, &below, D - 1 - level)?;
        }

        Ok(Self {
            null_digests,
            levels: vec![Vec::new(); D + 1],
        })
    }

    pub fn depth(&self) -> usize {
        D
    }

    /// Maximum number of leaves.
    pub fn capacity(&self) -> u64 {
        1u64.checked_shl(D as u32).unwrap_or(u64::MAX)
    }

    pub fn leaf_count(&self) -> u64 {
        self.levels[D].len() as u64
    }

    pub fn null_digest(&self, level: usize) -> Option<H256> {
        self.null_digests.get(level).copied()
    }

    pub fn null_digests(&self) -> &[H256] {
        &self.null_digests
    }

    pub fn leaf_digest(&self, index: u64) -> H256 {
        self.stored(D, index).unwrap_or(self.null_digests[D])
    }

    pub fn node_digest(&self, level: usize, index: u64) -> Result<H256, AccumulatorError> {
        if level > D {
            return Err(AccumulatorError::LevelOutOfBounds { level, depth: D });
        }
        Ok(self.stored(level, index).unwrap_or(self.null_digests[level]))
    }

    pub fn current_root(&self) -> H256 {
        self.stored(0, 0).unwrap_or(self.null_digests[0])
    }

    /// Compute every node write for appending `leaf` without touching the tree.
    pub fn stage_append<H: CompressionHash>(
        &self,
        leaf: H256,
        compressor: &Compressor<H>,
    ) -> Result<StagedAppend, AccumulatorError> {
        let leaf_index = self.leaf_count();
        if leaf_index >= self.capacity() {
            return Err(AccumulatorError::Full {
                capacity: self.capacity(),
            });
        }

        let mut writes = Vec::with_capacity(D);
        let mut current = leaf;
        let mut index = leaf_index;
        for height in 0..D {
            let level = D - height;
            let sibling = self.node_digest(level, index ^ 1)?;
            let (lhs, rhs) = if index & 1 == 0 {
                (current, sibling)
            } else {
                (sibling, current)
            };
            current = compressor.merkle_node(&lhs, &rhs, height)?;
            index >>= 1;
            writes.push((level - 1, index, current));
        }

        Ok(StagedAppend {
            leaf_index,
            leaf,
            writes,
        })
    }

    /// Apply a staged append. Either every write lands or none does.
    pub fn commit(&mut self, staged: StagedAppend) -> Result<H256, AccumulatorError> {
        let next = self.leaf_count();
        if staged.leaf_index != next {
            return Err(AccumulatorError::StaleStage {
                staged: staged.leaf_index,
                next,
            });
        }
        for (level, index, _) in &staged.writes {
            self.check_write(*level, *index)?;
        }

        self.levels[D].push(staged.leaf);
        for (level, index, digest) in &staged.writes {
            self.write(*level, *index, *digest);
        }

        let root = self.current_root();
        tracing::debug!(leaf_index = staged.leaf_index, ?root, "accumulator updated");
        Ok(root)
    }

    /// Stage and commit in one step; returns `(leaf_index, new_root)`.
    pub fn append<H: CompressionHash>(
        &mut self,
        leaf: H256,
        compressor: &Compressor<H>,
    ) -> Result<(u64, H256), AccumulatorError> {
        let staged = self.stage_append(leaf, compressor)?;
        let index = staged.leaf_index;
        let root = self.commit(staged)?;
        Ok((index, root))
    }

    /// Sibling path from a populated leaf up to the current root.
    pub fn inclusion_proof(&self, leaf_index: u64) -> Result<InclusionProof<D>, AccumulatorError> {
        let len = self.leaf_count();
        if leaf_index >= len {
            return Err(AccumulatorError::OutOfRange {
                index: leaf_index,
                len,
            });
        }

        let mut directions = [0u8; D];
        let mut path = [H256::zero(); D];
        for i in 0..D {
            let level_index = leaf_index >> i;
            directions[i] = (level_index & 1) as u8;
            path[i] = self.node_digest(D - i, level_index ^ 1)?;
        }

        Ok(InclusionProof {
            leaf_index,
            root: self.current_root(),
            directions,
            path,
            leaf: self.leaf_digest(leaf_index),
        })
    }

    fn stored(&self, level: usize, index: u64) -> Option<H256> {
        let index = usize::try_from(index).ok()?;
        self.levels.get(level)?.get(index).copied()
    }

    fn check_write(&self, level: usize, index: u64) -> Result<(), AccumulatorError> {
        let len = self.levels[level].len() as u64;
        if index > len {
            return Err(AccumulatorError::NonContiguousWrite { level, index, len });
        }
        Ok(())
    }

    fn write(&mut self, level: usize, index: u64, digest: H256) {
        let nodes = &mut self.levels[level];
        match usize::try_from(index) {
            Ok(i) if i < nodes.len() => nodes[i] = digest,
            _ => nodes.push(digest),
        }
    }
}

/// Membership proof for one leaf.
///
/// `directions[i] == 0` means the node at height `i` is a left child and its
/// sibling `path[i]` sits to the right; `1` is the mirror case.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof<const D: usize = MERKLE_DEPTH> {
    pub leaf_index: u64,
    pub root: H256,
    #[serde(with = "fixed_array")]
    pub directions: [u8; D],
    #[serde(with = "fixed_array")]
    pub path: [H256; D],
    pub leaf: H256,
}

impl<const D: usize> InclusionProof<D> {
    /// Walk the path from the leaf to the top.
    pub fn compute_root<H: CompressionHash>(
        &self,
        compressor: &Compressor<H>,
    ) -> Result<H256, OracleError> {
        let mut current = self.leaf;
        for (height, (direction, sibling)) in self.directions.iter().zip(self.path.iter()).enumerate() {
            current = if *direction == 0 {
                compressor.merkle_node(&current, sibling, height)?
            } else {
                compressor.merkle_node(sibling, &current, height)?
            };
        }
        Ok(current)
    }

    pub fn verify<H: CompressionHash>(&self, compressor: &Compressor<H>) -> Result<bool, OracleError> {
        Ok(self.compute_root(compressor)? == self.root)
    }
}

/// Serde for `[T; N]` with a const-generic `N`, encoded as a sequence.
mod fixed_array {
    use super::*;

    pub fn serialize<S, T, const N: usize>(items: &[T; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        serializer.collect_seq(items.iter())
    }

    pub fn deserialize<'de, D, T, const N: usize>(deserializer: D) -> Result<[T; N], D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        let items = Vec::<T>::deserialize(deserializer)?;
        let len = items.len();
        items
            .try_into()
            .map_err(|_| de::Error::invalid_length(len, &format!("{N} elements").as_str()))
    }
}
