//! Append-only registries for commits, pre-transfers and verifications.

use std::collections::HashSet;

use ethers_core::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use zkxfer_common::{FriendBitmap, MAX_FRIENDS};

use crate::{
    accumulator::{InclusionProof, VerificationTree},
    error::{ProtocolError, RecordKind},
    hash::{CompressionHash, Compressor},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub owner: Address,
    pub commitment_root: H256,
    pub limit: U256,
    pub nonce: H256,
}

/// Commit log plus the set of finalized (invalidated or transferred) indices.
#[derive(Clone, Debug, Default)]
pub struct CommitRegistry {
    records: Vec<CommitRecord>,
    used: HashSet<u64>,
}

impl CommitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&mut self, commitment_root: H256, limit: U256, nonce: H256, owner: Address) -> u64 {
        self.records.push(CommitRecord {
            owner,
            commitment_root,
            limit,
            nonce,
        });
        self.records.len() as u64 - 1
    }

    /// Record at `index`, used or not.
    pub fn get(&self, index: u64) -> Result<&CommitRecord, ProtocolError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.records.get(i))
            .ok_or(ProtocolError::InvalidIndex {
                kind: RecordKind::Commit,
                index,
            })
    }

    pub fn get_unused(&self, index: u64) -> Result<&CommitRecord, ProtocolError> {
        let record = self.get(index)?;
        if self.used.contains(&index) {
            return Err(ProtocolError::InvalidIndex {
                kind: RecordKind::Commit,
                index,
            });
        }
        Ok(record)
    }

    pub fn is_used(&self, index: u64) -> bool {
        self.used.contains(&index)
    }

    pub fn invalidate(&mut self, index: u64, caller: Address) -> Result<(), ProtocolError> {
        let owner = self.get_unused(index)?.owner;
        if caller != owner {
            return Err(ProtocolError::PermissionDenied { caller, owner });
        }
        self.used.insert(index);
        Ok(())
    }

    /// Finalize an unused commit.
    pub fn mark_used(&mut self, index: u64) -> Result<(), ProtocolError> {
        self.get_unused(index)?;
        self.used.insert(index);
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreTransferRecord {
    pub commit_index: u64,
    pub owner: Address,
    pub verified: FriendBitmap,
    /// Engine sequence marker at creation.
    pub created_at: u64,
    /// Set once the transfer has been settled.
    #[serde(default)]
    pub consumed: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PreTransferRegistry {
    records: Vec<PreTransferRecord>,
}

impl PreTransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, commit_index: u64, owner: Address, created_at: u64) -> u64 {
        self.records.push(PreTransferRecord {
            commit_index,
            owner,
            verified: FriendBitmap::new(),
            created_at,
            consumed: false,
        });
        self.records.len() as u64 - 1
    }

    pub fn get(&self, index: u64) -> Result<&PreTransferRecord, ProtocolError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.records.get(i))
            .ok_or(ProtocolError::InvalidIndex {
                kind: RecordKind::PreTransfer,
                index,
            })
    }

    /// A pre-transfer that has not been consumed by a transfer.
    pub fn get_open(&self, index: u64) -> Result<&PreTransferRecord, ProtocolError> {
        let record = self.get(index)?;
        if record.consumed {
            return Err(ProtocolError::InvalidIndex {
                kind: RecordKind::PreTransfer,
                index,
            });
        }
        Ok(record)
    }

    pub fn mark_friend_verified(&mut self, index: u64, friend_index: u64) -> Result<(), ProtocolError> {
        let record = self.get_mut(index)?;
        let accepted = usize::try_from(friend_index)
            .ok()
            .filter(|slot| *slot < MAX_FRIENDS)
            .map(|slot| record.verified.set(slot))
            .unwrap_or(false);
        if !accepted {
            return Err(ProtocolError::InvalidFriendIndex {
                index: friend_index,
            });
        }
        Ok(())
    }

    pub fn consume(&mut self, index: u64) -> Result<(), ProtocolError> {
        self.get_open(index)?;
        self.get_mut(index)?.consumed = true;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn get_mut(&mut self, index: u64) -> Result<&mut PreTransferRecord, ProtocolError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.records.get_mut(i))
            .ok_or(ProtocolError::InvalidIndex {
                kind: RecordKind::PreTransfer,
                index,
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub owner: Address,
    pub verification_digest: H256,
    pub pre_transfer_commitment: H256,
    pub nonce: H256,
}

/// Verification log, the accumulator over its digests, and every root the
/// accumulator has had.
#[derive(Clone, Debug)]
pub struct VerificationRegistry {
    records: Vec<VerificationRecord>,
    tree: VerificationTree,
    root_history: Vec<H256>,
    known_roots: HashSet<H256>,
}

impl VerificationRegistry {
    pub fn new<H: CompressionHash>(compressor: &Compressor<H>) -> Result<Self, ProtocolError> {
        Ok(Self {
            records: Vec::new(),
            tree: VerificationTree::new(compressor)?,
            root_history: Vec::new(),
            known_roots: HashSet::new(),
        })
    }

    /// Append a record, update the accumulator and record the new root.
    /// Returns `(index, new_root)`; on error nothing changes.
    pub fn append<H: CompressionHash>(
        &mut self,
        record: VerificationRecord,
        compressor: &Compressor<H>,
    ) -> Result<(u64, H256), ProtocolError> {
        let staged = self.tree.stage_append(record.verification_digest, compressor)?;
        let index = staged.leaf_index();
        let root = self.tree.commit(staged)?;

        self.records.push(record);
        self.root_history.push(root);
        self.known_roots.insert(root);
        Ok((index, root))
    }

    pub fn get(&self, index: u64) -> Result<&VerificationRecord, ProtocolError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.records.get(i))
            .ok_or(ProtocolError::InvalidIndex {
                kind: RecordKind::Verification,
                index,
            })
    }

    pub fn current_root(&self) -> H256 {
        self.tree.current_root()
    }

    /// Roots in append order; one entry per verification.
    pub fn root_history(&self) -> &[H256] {
        &self.root_history
    }

    pub fn is_known_root(&self, root: &H256) -> bool {
        self.known_roots.contains(root)
    }

    pub fn inclusion_proof(&self, index: u64) -> Result<InclusionProof, ProtocolError> {
        Ok(self.tree.inclusion_proof(index)?)
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
