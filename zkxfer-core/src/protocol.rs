//! Protocol state machine.
//!
//! The engine is single-writer: every mutating operation takes `&mut self`
//! and hosts serialize access around it. Each operation validates, consults
//! its oracles, and only then mutates registries, so a rejected operation has
//! no effect.

use ethers_core::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zkxfer_common::{address_digest, hex_bytes, ProofRequest, StageTag, MAX_FRIENDS};

use crate::{
    accumulator::InclusionProof,
    error::ProtocolError,
    hash::{CompressionHash, Compressor},
    oracle::{ProofOracle, SettlementOracle},
    registry::{
        CommitRecord, CommitRegistry, PreTransferRecord, PreTransferRegistry, VerificationRecord,
        VerificationRegistry,
    },
};

/// Notification emitted for external observers, in call order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    CommitCreated {
        index: u64,
        notes: String,
    },
    Invalidated {
        index: u64,
    },
    PreTransferCreated {
        commit_index: u64,
        pre_transfer_index: u64,
    },
    InvitationIssued {
        #[serde(with = "hex_bytes")]
        payload: Vec<u8>,
    },
    VerificationCreated {
        index: u64,
        #[serde(with = "hex_bytes")]
        receipt: Vec<u8>,
    },
    TransferSettled {
        amount: U256,
    },
}

/// A notification with its position in the log and the operation that emitted it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedNotification {
    pub cursor: u64,
    pub sequence: u64,
    #[serde(flatten)]
    pub notification: Notification,
}

pub struct ProtocolEngine<P, S, H> {
    proof_oracle: P,
    settlement: S,
    compressor: Compressor<H>,
    commits: CommitRegistry,
    pre_transfers: PreTransferRegistry,
    verifications: VerificationRegistry,
    notifications: Vec<LoggedNotification>,
    sequence: u64,
}

impl<P, S, H> ProtocolEngine<P, S, H>
where
    P: ProofOracle,
    S: SettlementOracle,
    H: CompressionHash,
{
    pub fn new(proof_oracle: P, settlement: S, hash: H) -> Result<Self, ProtocolError> {
        let compressor = Compressor::new(hash);
        let verifications = VerificationRegistry::new(&compressor)?;
        Ok(Self {
            proof_oracle,
            settlement,
            compressor,
            commits: CommitRegistry::new(),
            pre_transfers: PreTransferRegistry::new(),
            verifications,
            notifications: Vec::new(),
            sequence: 0,
        })
    }

    // === Mutating operations ===

    pub fn commit(
        &mut self,
        commitment_root: H256,
        limit: U256,
        nonce: H256,
        owner: Address,
        notes: impl Into<String>,
    ) -> u64 {
        let at = self.advance();
        let index = self.commits.commit(commitment_root, limit, nonce, owner);
        info!(index, ?owner, %limit, "commit created");
        self.emit(at, Notification::CommitCreated {
            index,
            notes: notes.into(),
        });
        index
    }

    /// Voluntary withdrawal of an unused commit by its owner.
    pub fn invalidate(&mut self, commit_index: u64, caller: Address) -> Result<(), ProtocolError> {
        self.commits.invalidate(commit_index, caller).inspect_err(|err| {
            warn!(commit_index, ?caller, %err, "invalidate rejected");
        })?;
        let at = self.advance();
        info!(commit_index, "commit invalidated");
        self.emit(at, Notification::Invalidated {
            index: commit_index,
        });
        Ok(())
    }

    pub fn pre_transfer(
        &mut self,
        commit_index: u64,
        commitment_root_t: H256,
        proof: &[u8],
        invitations: [Vec<u8>; MAX_FRIENDS],
        caller: Address,
    ) -> Result<u64, ProtocolError> {
        let commit = self.commits.get_unused(commit_index)?;
        let request = ProofRequest::new(StageTag::PreTransfer, proof)
            .digest(&commit.commitment_root)
            .digest(&commitment_root_t)
            .digest(&address_digest(&caller))
            .digest(&commit.nonce);
        self.check_proof(&request)?;

        let at = self.advance();
        let pre_transfer_index = self.pre_transfers.create(commit_index, caller, at);
        info!(commit_index, pre_transfer_index, ?caller, "pre-transfer created");
        self.emit(at, Notification::PreTransferCreated {
            commit_index,
            pre_transfer_index,
        });
        for payload in invitations {
            self.emit(at, Notification::InvitationIssued { payload });
        }
        Ok(pre_transfer_index)
    }

    /// A friend's co-signoff. The digest must equal
    /// `compress(compress(pre_transfer_commitment, address(caller), -1), nonce, -1)`.
    pub fn verification(
        &mut self,
        verification_digest: H256,
        pre_transfer_commitment: H256,
        nonce: H256,
        receipt: Vec<u8>,
        caller: Address,
    ) -> Result<u64, ProtocolError> {
        let t = self
            .compressor
            .commitment(&pre_transfer_commitment, &address_digest(&caller))?;
        let expected = self.compressor.commitment(&t, &nonce)?;
        if expected != verification_digest {
            warn!(?caller, "verification digest mismatch");
            return Err(ProtocolError::VerificationMismatch);
        }

        let record = VerificationRecord {
            owner: caller,
            verification_digest,
            pre_transfer_commitment,
            nonce,
        };
        let (index, root) = self.verifications.append(record, &self.compressor)?;
        let at = self.advance();
        info!(index, ?root, ?caller, "verification accumulated");
        self.emit(at, Notification::VerificationCreated { index, receipt });
        Ok(index)
    }

    /// Bind one friend's accumulated verification to a pre-transfer. Any root
    /// the accumulator has ever had is accepted.
    pub fn preparation(
        &mut self,
        pre_transfer_index: u64,
        friend_index: u64,
        verification_root: H256,
        proof: &[u8],
        caller: Address,
    ) -> Result<(), ProtocolError> {
        let pre_transfer = self.pre_transfers.get_open(pre_transfer_index)?;
        if pre_transfer.owner != caller {
            return Err(ProtocolError::PermissionDenied {
                caller,
                owner: pre_transfer.owner,
            });
        }
        let slot_free = usize::try_from(friend_index)
            .map(|slot| slot < MAX_FRIENDS && !pre_transfer.verified.is_set(slot))
            .unwrap_or(false);
        if !slot_free {
            return Err(ProtocolError::InvalidFriendIndex {
                index: friend_index,
            });
        }
        if !self.verifications.is_known_root(&verification_root) {
            return Err(ProtocolError::UnknownVerificationRoot(verification_root));
        }
        let commit = self.commits.get_unused(pre_transfer.commit_index)?;

        let request = ProofRequest::new(StageTag::Preparation, proof)
            .digest(&commit.commitment_root)
            .index(friend_index)
            .digest(&commit.nonce)
            .index(pre_transfer_index)
            .digest(&verification_root);
        self.check_proof(&request)?;

        self.pre_transfers
            .mark_friend_verified(pre_transfer_index, friend_index)?;
        self.advance();
        info!(pre_transfer_index, friend_index, "friend verification prepared");
        Ok(())
    }

    /// Prove the aggregate friend condition and release funds.
    pub fn transfer(
        &mut self,
        pre_transfer_index: u64,
        proof: &[u8],
        caller: Address,
    ) -> Result<U256, ProtocolError> {
        let pre_transfer = self.pre_transfers.get_open(pre_transfer_index)?;
        if pre_transfer.owner != caller {
            return Err(ProtocolError::PermissionDenied {
                caller,
                owner: pre_transfer.owner,
            });
        }
        let commit_index = pre_transfer.commit_index;
        let commit = self.commits.get_unused(commit_index)?;

        let request = ProofRequest::new(StageTag::Transfer, proof)
            .digest(&commit.commitment_root)
            .words(pre_transfer.verified.to_words());
        self.check_proof(&request)?;

        let amount = self
            .settlement
            .settle(commit.owner, commit.limit)
            .map_err(ProtocolError::Settlement)?;

        self.commits.mark_used(commit_index)?;
        self.pre_transfers.consume(pre_transfer_index)?;
        let at = self.advance();
        info!(pre_transfer_index, commit_index, %amount, recipient = ?caller, "transfer settled");
        self.emit(at, Notification::TransferSettled { amount });
        Ok(amount)
    }

    /// Liveness heartbeat; only advances the sequence marker.
    pub fn dummy(&mut self) -> u64 {
        let at = self.advance();
        debug!(sequence = at, "heartbeat");
        at
    }

    // === Queries ===

    pub fn commit_record(&self, index: u64) -> Result<&CommitRecord, ProtocolError> {
        self.commits.get(index)
    }

    pub fn commit_is_used(&self, index: u64) -> bool {
        self.commits.is_used(index)
    }

    pub fn pre_transfer_record(&self, index: u64) -> Result<&PreTransferRecord, ProtocolError> {
        self.pre_transfers.get(index)
    }

    pub fn verified_friends(&self, pre_transfer_index: u64) -> Result<Vec<usize>, ProtocolError> {
        Ok(self.pre_transfers.get(pre_transfer_index)?.verified.indices())
    }

    pub fn verification_record(&self, index: u64) -> Result<&VerificationRecord, ProtocolError> {
        self.verifications.get(index)
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.len()
    }

    pub fn pre_transfer_count(&self) -> u64 {
        self.pre_transfers.len()
    }

    pub fn verification_count(&self) -> u64 {
        self.verifications.len()
    }

    pub fn current_root(&self) -> H256 {
        self.verifications.current_root()
    }

    pub fn root_history(&self) -> &[H256] {
        self.verifications.root_history()
    }

    pub fn is_known_root(&self, root: &H256) -> bool {
        self.verifications.is_known_root(root)
    }

    /// Inclusion proof for a verification against the current root.
    pub fn inclusion_proof(&self, verification_index: u64) -> Result<InclusionProof, ProtocolError> {
        self.verifications.inclusion_proof(verification_index)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn notifications_since(&self, cursor: u64) -> &[LoggedNotification] {
        let start = usize::try_from(cursor)
            .unwrap_or(usize::MAX)
            .min(self.notifications.len());
        &self.notifications[start..]
    }

    pub fn compressor(&self) -> &Compressor<H> {
        &self.compressor
    }

    pub fn settlement(&self) -> &S {
        &self.settlement
    }

    // === Internals ===

    fn check_proof(&self, request: &ProofRequest) -> Result<(), ProtocolError> {
        let frame = request.frame();
        let accepted = self.proof_oracle.verify(&frame)?;
        if !accepted {
            warn!(stage = %request.stage, "proof rejected by oracle");
            return Err(ProtocolError::InvalidProof {
                stage: request.stage,
            });
        }
        debug!(stage = %request.stage, input_length = request.input_length(), "proof accepted");
        Ok(())
    }

    fn advance(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn emit(&mut self, sequence: u64, notification: Notification) {
        let cursor = self.notifications.len() as u64;
        info!(cursor, sequence, ?notification, "notification emitted");
        self.notifications.push(LoggedNotification {
            cursor,
            sequence,
            notification,
        });
    }
}
