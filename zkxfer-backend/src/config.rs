//! Service configuration.

use std::{
    env,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use anyhow::{bail, Context, Result};

// Environment variables
pub const BIND_ADDR_ENV: &str = "ZKXFER_BIND_ADDR";
pub const PORT_ENV: &str = "PORT";
pub const SKIP_PROOFS_ENV: &str = "ZKXFER_SKIP_PROOFS";
pub const PROOF_ORACLE_URL_ENV: &str = "ZKXFER_PROOF_ORACLE_URL";
pub const PROOF_ORACLE_TIMEOUT_ENV: &str = "ZKXFER_PROOF_ORACLE_TIMEOUT_SECS";

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3040;
pub const DEFAULT_ORACLE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOG_FILTER: &str = "zkxfer_backend=debug,zkxfer_core=info,tower_http=debug";

/// How proofs get checked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProofMode {
    /// Accept every proof. Only selected by `ZKXFER_SKIP_PROOFS=true`.
    Skip,
    /// POST frames to an external verifier.
    Remote { url: String, timeout: Duration },
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub proof_mode: ProofMode,
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr = lookup(BIND_ADDR_ENV)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .with_context(|| format!("{BIND_ADDR_ENV} must be an IP address"))?;

        let port = match lookup(PORT_ENV) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("{PORT_ENV} must be a port number, got {raw:?}"))?,
            None => DEFAULT_PORT,
        };

        let skip_proofs = match lookup(SKIP_PROOFS_ENV) {
            Some(raw) => parse_flag(&raw).with_context(|| format!("invalid {SKIP_PROOFS_ENV}"))?,
            None => false,
        };

        let proof_mode = if skip_proofs {
            ProofMode::Skip
        } else {
            let url = lookup(PROOF_ORACLE_URL_ENV).with_context(|| {
                format!("{PROOF_ORACLE_URL_ENV} must be set unless {SKIP_PROOFS_ENV}=true")
            })?;
            let timeout_secs: u64 = match lookup(PROOF_ORACLE_TIMEOUT_ENV) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("{PROOF_ORACLE_TIMEOUT_ENV} must be whole seconds"))?,
                None => DEFAULT_ORACLE_TIMEOUT_SECS,
            };
            ProofMode::Remote {
                url,
                timeout: Duration::from_secs(timeout_secs),
            }
        };

        Ok(Self {
            bind_addr,
            port,
            proof_mode,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn skip_proofs(&self) -> bool {
        self.proof_mode == ProofMode::Skip
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("expected a boolean, got {other:?}"),
    }
}
