//! Remote proof verification over HTTP.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use zkxfer_common::hex_bytes;
use zkxfer_core::{OracleError, ProofOracle};

/// Body POSTed to the verifier.
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyRequest {
    #[serde(with = "hex_bytes")]
    pub frame: Vec<u8>,
}

/// Verifier answer.
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
}

/// Proof oracle backed by an external verifier service.
///
/// Blocking: call it from a blocking context (the engine runs inside
/// `spawn_blocking`), never directly on an async worker.
#[derive(Debug)]
pub struct HttpProofOracle {
    client: Client,
    url: String,
}

impl HttpProofOracle {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build proof oracle HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl ProofOracle for HttpProofOracle {
    fn verify(&self, frame: &[u8]) -> Result<bool, OracleError> {
        let request = VerifyRequest {
            frame: frame.to_vec(),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .map_err(|err| OracleError::Unavailable(format!("proof oracle request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Unavailable(format!("proof oracle answered {status}")));
        }

        let body: VerifyResponse = response
            .json()
            .map_err(|err| OracleError::Malformed(format!("proof oracle response: {err}")))?;
        tracing::debug!(frame_len = frame.len(), valid = body.valid, "remote proof verdict");
        Ok(body.valid)
    }
}
