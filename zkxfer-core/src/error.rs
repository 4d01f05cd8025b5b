//! Error types for protocol operations.
//!
//! Every error is operation-fatal: the operation that returned it had no effect.

use std::fmt;

use ethers_core::types::{Address, H256};
use thiserror::Error;
use zkxfer_common::StageTag;

use crate::{accumulator::AccumulatorError, oracle::OracleError};

/// Which registry an index refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Commit,
    PreTransfer,
    Verification,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::Commit => "commit",
            RecordKind::PreTransfer => "pre-transfer",
            RecordKind::Verification => "verification",
        })
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Index out of range, or its referent is already finalized.
    #[error("invalid {kind} index {index}")]
    InvalidIndex { kind: RecordKind, index: u64 },

    #[error("permission denied: caller {caller:?} is not owner {owner:?}")]
    PermissionDenied { caller: Address, owner: Address },

    /// The proof oracle rejected the proof.
    #[error("invalid {stage} proof")]
    InvalidProof { stage: StageTag },

    /// Verification digest does not match its recomputation.
    #[error("verification digest mismatch")]
    VerificationMismatch,

    #[error("unknown verification root {0:?}")]
    UnknownVerificationRoot(H256),

    /// Friend index out of range or already verified.
    #[error("invalid friend index {index}")]
    InvalidFriendIndex { index: u64 },

    /// Accumulator query on an unpopulated leaf.
    #[error("verification index {index} out of range (populated: {len})")]
    OutOfRange { index: u64, len: u64 },

    /// Proof or hash oracle failure.
    #[error("oracle failure: {0}")]
    Oracle(#[from] OracleError),

    #[error("settlement failed: {0}")]
    Settlement(OracleError),

    /// Accumulator invariant violated.
    #[error("accumulator error: {0}")]
    Accumulator(AccumulatorError),
}

impl ProtocolError {
    /// Machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidIndex { .. } => "INVALID_INDEX",
            ProtocolError::PermissionDenied { .. } => "PERMISSION_DENIED",
            ProtocolError::InvalidProof { .. } => "INVALID_PROOF",
            ProtocolError::VerificationMismatch => "VERIFICATION_MISMATCH",
            ProtocolError::UnknownVerificationRoot(_) => "UNKNOWN_VERIFICATION_ROOT",
            ProtocolError::InvalidFriendIndex { .. } => "INVALID_FRIEND_INDEX",
            ProtocolError::OutOfRange { .. } => "OUT_OF_RANGE",
            ProtocolError::Oracle(_) => "ORACLE_ERROR",
            ProtocolError::Settlement(_) => "SETTLEMENT_ERROR",
            ProtocolError::Accumulator(_) => "ACCUMULATOR_ERROR",
        }
    }

    /// HTTP status code suggestion.
    pub fn suggested_status_code(&self) -> u16 {
        match self {
            ProtocolError::InvalidIndex { .. } => 404,
            ProtocolError::PermissionDenied { .. } => 403,
            ProtocolError::InvalidProof { .. } => 422,
            ProtocolError::VerificationMismatch => 422,
            ProtocolError::UnknownVerificationRoot(_) => 422,
            ProtocolError::InvalidFriendIndex { .. } => 409,
            ProtocolError::OutOfRange { .. } => 404,
            ProtocolError::Oracle(_) => 502,
            ProtocolError::Settlement(_) => 502,
            ProtocolError::Accumulator(_) => 500,
        }
    }
}

impl From<AccumulatorError> for ProtocolError {
    fn from(err: AccumulatorError) -> Self {
        match err {
            AccumulatorError::OutOfRange { index, len } => ProtocolError::OutOfRange { index, len },
            AccumulatorError::Hash(inner) => ProtocolError::Oracle(inner),
            other => ProtocolError::Accumulator(other),
        }
    }
}
