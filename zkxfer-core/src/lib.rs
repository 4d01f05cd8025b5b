//! zkxfer-core
//!
//! Protocol state machine and verification accumulator for privacy-preserving,
//! friend-backed transfers.
//!
//! # Protocol Phases
//!
//! ```text
//! commit ──► pre_transfer ──► preparation[i] (≤ MAX_FRIENDS) ──► transfer
//!    │                              ▲
//!    └──► invalidate                │ proves against any historical root
//!                                   │
//!              verification ──► accumulator append ──► root history
//! ```
//!
//! Per commit index the states are `Committed → {Invalidated | PreTransferred →
//! Transferred}`. `Invalidated` and `Transferred` are terminal.
//!
//! # External Capabilities
//!
//! The engine never proves, hashes or moves funds on its own. It consumes three
//! injected capabilities:
//!
//! - [`CompressionHash`]: two-to-one hash framed as `personalization || left || right`
//! - [`ProofOracle`]: verifies a framed proof request (see `zkxfer_common::ProofRequest`)
//! - [`SettlementOracle`]: releases up to `limit` from a payer
//!
//! Every operation either completes fully or leaves no trace: oracle calls happen
//! before any registry mutation, and accumulator updates are staged and then
//! committed in one step.

pub mod accumulator;
pub mod client;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod oracle;
pub mod protocol;
pub mod registry;

pub use accumulator::{AccumulatorError, InclusionProof, MerkleAccumulator, StagedAppend, VerificationTree};
pub use client::{ClientError, ExtendedFriends, FriendSet, FriendTree, OpenedInvitation, OpenedReceipt};
pub use envelope::{EnvelopeError, PublicKey, SecretKey};
pub use error::{ProtocolError, RecordKind};
pub use hash::{Blake3Compression, CompressionHash, Compressor, COMMITMENT_PERSONALIZATION};
pub use oracle::{InMemoryLedger, OracleError, ProofOracle, SettlementOracle, SkipProofOracle};
pub use protocol::{LoggedNotification, Notification, ProtocolEngine};
pub use registry::{
    CommitRecord, CommitRegistry, PreTransferRecord, PreTransferRegistry, VerificationRecord,
    VerificationRegistry,
};

pub use zkxfer_common::{
    Digest, FriendBitmap, Identity, StageTag, U256, FRIENDS_MERKLE_DEPTH, MAX_FRIENDS, MERKLE_DEPTH,
};
