//! Proof and settlement capabilities consumed by the engine.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use ethers_core::types::{Address, U256};
use thiserror::Error;

/// Failure of an external capability. Always fatal to the enclosing operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// The capability could not be reached or did not answer.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    /// The capability answered with something that does not parse.
    #[error("malformed oracle exchange: {0}")]
    Malformed(String),

    /// The capability refused to act (e.g. settlement with nothing escrowed).
    #[error("oracle rejected the call: {0}")]
    Rejected(String),
}

/// Verifies a framed proof request.
///
/// `Ok(false)` is a rejection of the proof; `Err` means the oracle itself failed.
pub trait ProofOracle: Send + Sync {
    fn verify(&self, frame: &[u8]) -> Result<bool, OracleError>;
}

impl<T: ProofOracle + ?Sized> ProofOracle for Arc<T> {
    fn verify(&self, frame: &[u8]) -> Result<bool, OracleError> {
        (**self).verify(frame)
    }
}

/// Accepts every proof. Testing only; must be selected explicitly.
#[derive(Debug)]
pub struct SkipProofOracle {
    _explicit: (),
}

impl SkipProofOracle {
    pub fn enabled() -> Self {
        tracing::warn!("proof verification is DISABLED: every proof will be accepted");
        Self { _explicit: () }
    }
}

impl ProofOracle for SkipProofOracle {
    fn verify(&self, frame: &[u8]) -> Result<bool, OracleError> {
        tracing::debug!(frame_len = frame.len(), "skipping proof verification");
        Ok(true)
    }
}

/// Releases funds for a completed transfer.
pub trait SettlementOracle: Send + Sync {
    /// Release up to `limit` from `payer`; returns the amount actually released.
    fn settle(&self, payer: Address, limit: U256) -> Result<U256, OracleError>;
}

impl<T: SettlementOracle + ?Sized> SettlementOracle for Arc<T> {
    fn settle(&self, payer: Address, limit: U256) -> Result<U256, OracleError> {
        (**self).settle(payer, limit)
    }
}

/// Escrow ledger: deposits accumulate per identity, settlement releases
/// `min(balance, limit)`.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    balances: Mutex<HashMap<Address, U256>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` to the escrow of `identity`; returns the new balance.
    pub fn deposit(&self, identity: Address, amount: U256) -> Result<U256, OracleError> {
        let mut balances = self.balances.lock().expect("ledger poisoned");
        let balance = balances.entry(identity).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| OracleError::Rejected("escrow balance overflow".into()))?;
        Ok(*balance)
    }

    pub fn balance_of(&self, identity: &Address) -> U256 {
        self.balances
            .lock()
            .expect("ledger poisoned")
            .get(identity)
            .copied()
            .unwrap_or_default()
    }
}

impl SettlementOracle for InMemoryLedger {
    fn settle(&self, payer: Address, limit: U256) -> Result<U256, OracleError> {
        let mut balances = self.balances.lock().expect("ledger poisoned");
        let balance = balances.entry(payer).or_default();
        let amount = (*balance).min(limit);
        *balance -= amount;
        tracing::info!(?payer, %limit, %amount, "settled transfer from escrow");
        Ok(amount)
    }
}
