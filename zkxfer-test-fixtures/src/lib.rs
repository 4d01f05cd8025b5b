//! Test fixtures shared by the zkxfer crates.
//!
//! Everything here is deterministic: identities are fixed byte patterns,
//! nonces come from a seeded ChaCha stream, and the stub oracles answer from
//! a script rather than from a real proof system.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use ethers_core::types::{Address, H256, U256};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use zkxfer_common::{parse_frame, ProofRequest, StageTag, MAX_FRIENDS};
use zkxfer_core::{
    client::{self, nonce_from_rng},
    Blake3Compression, CompressionHash, Compressor, InMemoryLedger, OracleError, ProofOracle,
    ProtocolEngine, PublicKey, SecretKey, SettlementOracle,
};

/// Opaque proof bytes; the stub oracles never look inside.
pub const SAMPLE_PROOF: &[u8] = &[0x5a; 64];

pub fn sender() -> Address {
    Address::repeat_byte(0x11)
}

pub fn new_owner() -> Address {
    Address::repeat_byte(0x22)
}

pub fn stranger() -> Address {
    Address::repeat_byte(0xee)
}

/// Friend number `n`, distinct from the other sample identities for `n < 0x10`.
pub fn friend(n: u8) -> Address {
    Address::repeat_byte(0x30 + n)
}

/// Invitation payloads `[slot]` for every slot.
pub fn sample_invitations() -> [Vec<u8>; MAX_FRIENDS] {
    std::array::from_fn(|slot| vec![0xc0, slot as u8])
}

/// Deterministic nonce stream.
pub fn nonce(seed: u64) -> H256 {
    nonce_from_rng(&mut ChaCha20Rng::seed_from_u64(seed))
}

/// Deterministic secp256k1 key pair for sealing invitations and receipts.
pub fn keypair(seed: u64) -> (SecretKey, PublicKey) {
    let secret = SecretKey::random(&mut ChaCha20Rng::seed_from_u64(seed));
    let public = secret.public_key();
    (secret, public)
}

// ============================================================================
// Proof oracle
// ============================================================================

#[derive(Debug, Default)]
struct Script {
    verdicts: HashMap<StageTag, bool>,
    failure: Option<OracleError>,
    frames: Vec<Vec<u8>>,
}

/// Proof oracle that records every frame and answers per stage.
///
/// Accepts everything until told otherwise. Clones share state, so a test can
/// keep a handle after moving one into an engine.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProofOracle {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProofOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, stage: StageTag) {
        self.lock().verdicts.insert(stage, false);
    }

    pub fn accept(&self, stage: StageTag) {
        self.lock().verdicts.insert(stage, true);
    }

    /// Make every subsequent call fail with `error`.
    pub fn fail_with(&self, error: OracleError) {
        self.lock().failure = Some(error);
    }

    pub fn recover(&self) {
        self.lock().failure = None;
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.lock().frames.clone()
    }

    /// Recorded frames decoded back into requests.
    pub fn requests(&self) -> Vec<ProofRequest> {
        self.lock()
            .frames
            .iter()
            .map(|frame| parse_frame(frame).expect("engine produced an unparseable frame"))
            .collect()
    }

    pub fn last_request(&self) -> Option<ProofRequest> {
        self.requests().pop()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("proof script poisoned")
    }
}

impl ProofOracle for ScriptedProofOracle {
    fn verify(&self, frame: &[u8]) -> Result<bool, OracleError> {
        let mut script = self.lock();
        script.frames.push(frame.to_vec());
        if let Some(error) = &script.failure {
            return Err(error.clone());
        }
        let stage = parse_frame(frame).map_err(|e| OracleError::Malformed(e.to_string()))?.stage;
        Ok(script.verdicts.get(&stage).copied().unwrap_or(true))
    }
}

// ============================================================================
// Hash and settlement stubs
// ============================================================================

/// BLAKE3 compression that can be armed to fail after a number of calls.
#[derive(Clone, Debug, Default)]
pub struct FailingHash {
    remaining: Arc<Mutex<Option<usize>>>,
}

impl FailingHash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `calls` more compressions, then fail every call.
    pub fn arm(&self, calls: usize) {
        *self.remaining.lock().expect("hash budget poisoned") = Some(calls);
    }

    pub fn disarm(&self) {
        *self.remaining.lock().expect("hash budget poisoned") = None;
    }
}

impl CompressionHash for FailingHash {
    fn compress_raw(&self, input: &[u8; 96]) -> Result<[u8; 32], OracleError> {
        let mut remaining = self.remaining.lock().expect("hash budget poisoned");
        match remaining.as_mut() {
            Some(0) => return Err(OracleError::Unavailable("compression budget exhausted".into())),
            Some(n) => *n -= 1,
            None => {}
        }
        Blake3Compression.compress_raw(input)
    }
}

/// Settlement oracle that is always down.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingSettlement;

impl SettlementOracle for FailingSettlement {
    fn settle(&self, _payer: Address, _limit: U256) -> Result<U256, OracleError> {
        Err(OracleError::Unavailable("settlement backend offline".into()))
    }
}

// ============================================================================
// Reference Merkle root
// ============================================================================

/// Root of a depth-`depth` tree over `leaves`, padded with zero leaves, computed
/// top-down by direct recursion. Empty subtrees are hashed the same way,
/// memoized per level so large depths stay cheap.
pub fn reference_root<H: CompressionHash>(
    leaves: &[H256],
    depth: usize,
    compressor: &Compressor<H>,
) -> Result<H256, OracleError> {
    let mut empty = vec![None; depth + 1];
    reference_node(leaves, depth, 0, 0, compressor, &mut empty)
}

fn reference_node<H: CompressionHash>(
    leaves: &[H256],
    depth: usize,
    level: usize,
    index: u64,
    compressor: &Compressor<H>,
    empty: &mut [Option<H256>],
) -> Result<H256, OracleError> {
    if level == depth {
        return Ok(leaves.get(index as usize).copied().unwrap_or_default());
    }
    let first_leaf = index << (depth - level);
    if first_leaf >= leaves.len() as u64 {
        if let Some(digest) = empty[level] {
            return Ok(digest);
        }
    }
    let left = reference_node(leaves, depth, level + 1, 2 * index, compressor, empty)?;
    let right = reference_node(leaves, depth, level + 1, 2 * index + 1, compressor, empty)?;
    let digest = compressor.merkle_node(&left, &right, depth - 1 - level)?;
    if first_leaf >= leaves.len() as u64 {
        empty[level] = Some(digest);
    }
    Ok(digest)
}

// ============================================================================
// Scenario
// ============================================================================

pub type ScenarioEngine<H = Blake3Compression> =
    ProtocolEngine<ScriptedProofOracle, Arc<InMemoryLedger>, H>;

/// Inputs a friend submits for one verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerificationInputs {
    pub verification_digest: H256,
    pub pre_transfer_commitment: H256,
    pub nonce: H256,
}

impl VerificationInputs {
    /// Valid inputs for `friend` verifying `pre_transfer_index`.
    pub fn for_friend<H: CompressionHash>(
        compressor: &Compressor<H>,
        pre_transfer_index: u64,
        friend: &Address,
        seed: u64,
    ) -> Result<Self, client::ClientError> {
        let nonce1 = nonce(seed);
        let nonce2 = nonce(seed.wrapping_add(1));
        let pre_transfer_commitment =
            client::pre_transfer_commitment(compressor, pre_transfer_index, &nonce1)?;
        let verification_digest =
            client::verification_digest(compressor, &pre_transfer_commitment, friend, &nonce2)?;
        Ok(Self {
            verification_digest,
            pre_transfer_commitment,
            nonce: nonce2,
        })
    }
}

/// An engine wired to a scripted oracle and an in-memory ledger, with handles
/// kept for inspection.
pub struct Scenario<H: CompressionHash = Blake3Compression> {
    pub engine: ScenarioEngine<H>,
    pub oracle: ScriptedProofOracle,
    pub ledger: Arc<InMemoryLedger>,
}

impl Scenario<Blake3Compression> {
    pub fn new() -> Self {
        Self::with_hash(Blake3Compression)
    }
}

impl Default for Scenario<Blake3Compression> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: CompressionHash> Scenario<H> {
    pub fn with_hash(hash: H) -> Self {
        let oracle = ScriptedProofOracle::new();
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = ProtocolEngine::new(oracle.clone(), Arc::clone(&ledger), hash)
            .expect("engine construction");
        Self {
            engine,
            oracle,
            ledger,
        }
    }

    /// Escrow `escrow` for the sender and commit `limit` from them.
    pub fn funded_commit(&mut self, escrow: u64, limit: u64) -> u64 {
        self.ledger
            .deposit(sender(), U256::from(escrow))
            .expect("deposit");
        self.engine.commit(
            H256::repeat_byte(0xc1),
            U256::from(limit),
            nonce(1),
            sender(),
            "scenario",
        )
    }

    /// Pre-transfer of `commit_index` to [`new_owner`].
    pub fn pre_transfer(&mut self, commit_index: u64) -> u64 {
        self.engine
            .pre_transfer(
                commit_index,
                H256::repeat_byte(0xc2),
                SAMPLE_PROOF,
                sample_invitations(),
                new_owner(),
            )
            .expect("pre-transfer")
    }

    /// Submit a valid verification from `friend`; returns the root it produced.
    pub fn verify_as(&mut self, pre_transfer_index: u64, friend: Address, seed: u64) -> H256 {
        let inputs = VerificationInputs::for_friend(
            self.engine.compressor(),
            pre_transfer_index,
            &friend,
            seed,
        )
        .expect("verification inputs");
        self.engine
            .verification(
                inputs.verification_digest,
                inputs.pre_transfer_commitment,
                inputs.nonce,
                b"receipt".to_vec(),
                friend,
            )
            .expect("verification");
        self.engine.current_root()
    }
}
