use std::{
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers_core::types::{Address, H256, U256};
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use zkxfer_common::{decode_u256, hex_bytes, parse_frame};
use zkxfer_core::{
    client::{self, FriendSet},
    Blake3Compression, Compressor, InclusionProof, SecretKey,
};

const DEFAULT_BACKEND: &str = "http://127.0.0.1:3040";
const DEMO_LIMIT: u64 = 100;
const DEMO_ESCROW: u64 = 1_000;
const DEMO_PROOF: &str = "0x00";

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive commit → pre-transfer → verification → preparation → transfer against a backend.
    Demo(DemoArgs),
    /// Decode a hex proof-oracle frame and print its layout.
    DecodeFrame(DecodeFrameArgs),
}

#[derive(Args)]
struct DemoArgs {
    /// Base URL of a backend running with ZKXFER_SKIP_PROOFS=true.
    #[arg(long, default_value = DEFAULT_BACKEND)]
    backend: String,
    /// Start `zkxfer-backend` with proof checking skipped and stop it afterwards.
    #[arg(long)]
    spawn_backend: bool,
    /// Run the spawned backend in release mode.
    #[arg(long)]
    release: bool,
}

#[derive(Args)]
struct DecodeFrameArgs {
    /// Frame bytes as hex, with or without `0x`.
    frame: String,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    match args.command {
        Commands::Demo(opts) => run_demo(opts),
        Commands::DecodeFrame(opts) => decode_frame(&opts.frame),
    }
}

fn run_demo(args: DemoArgs) -> Result<()> {
    let mut child = if args.spawn_backend {
        println!("🚀 Starting zkxfer-backend with proof checking skipped");
        Some(spawn_backend(&workspace_root(), args.release, &args.backend)?)
    } else {
        None
    };

    let result = (|| -> Result<()> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        let api = Backend {
            client: &client,
            base: args.backend.trim_end_matches('/'),
        };
        wait_for_backend(&api)?;
        demo_flow(&api)
    })();

    if let Some(child) = child.as_mut() {
        child.kill().ok();
        child.wait().ok();
    }
    result
}

fn demo_flow(api: &Backend<'_>) -> Result<()> {
    let info: Value = api.get("/info")?;
    ensure!(
        info["skip_proofs"].as_bool().unwrap_or(false),
        "the demo submits placeholder proofs; start the backend with ZKXFER_SKIP_PROOFS=true"
    );

    let c = Compressor::new(Blake3Compression);
    let sender = Address::repeat_byte(0x11);
    let new_owner = Address::repeat_byte(0x22);
    let friends = FriendSet::new((1..=3).map(|n| Address::repeat_byte(0x30 + n)))?;

    println!("🧮 Building commitment for {} friends", friends.len());
    let passphrase = client::passphrase_word("demo passphrase")?;
    let threshold = U256::one();
    let commit_nonce = client::random_nonce();
    let extended = friends.extend(&passphrase, threshold, &commit_nonce);
    let friends_root = extended.merkle_root(&c)?;
    let commitment_root =
        client::commit_root(&c, &friends_root, &passphrase, threshold, &commit_nonce)?;
    let commitment_root_t =
        client::commit_root_t(&c, &friends_root, &passphrase, threshold, &new_owner)?;

    let balance: Value = api.post(
        "/ledger/deposit",
        &json!({ "identity": sender, "amount": U256::from(DEMO_ESCROW) }),
    )?;
    println!("💰 Escrowed {} for {sender:?}", balance["balance"]);

    let commit: Value = api.post(
        "/commit",
        &json!({
            "commitment_root": commitment_root,
            "limit": U256::from(DEMO_LIMIT),
            "nonce": commit_nonce,
            "owner": sender,
            "notes": "xtask demo",
        }),
    )?;
    let commit_index = index_field(&commit, "commit_index")?;
    println!("📌 Commit {commit_index} created (limit {DEMO_LIMIT})");

    let mut rng = rand::thread_rng();
    let friend_keys: Vec<SecretKey> = friends
        .friends()
        .iter()
        .map(|_| SecretKey::random(&mut rng))
        .collect();
    let owner_key = SecretKey::random(&mut rng);
    let sealed = friends
        .friends()
        .iter()
        .zip(&friend_keys)
        .map(|(f, key)| {
            client::invitation(&key.public_key(), f, "xtask demo: please vouch", &mut rng)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let invitations = client::padded_invitations(sealed, &mut rng)?;

    let pre_transfer_body = json!({
        "commit_index": commit_index,
        "commitment_root_t": commitment_root_t,
        "proof": DEMO_PROOF,
        "invitations": invitations.iter().map(hex_bytes::to_hex).collect::<Vec<_>>(),
        "caller": new_owner,
    });
    let pre_transfer: Value = api.post("/pre-transfer", &pre_transfer_body)?;
    let pt = index_field(&pre_transfer, "pre_transfer_index")?;
    println!("📨 Pre-transfer {pt} created with {} sealed invitations", invitations.len());

    let friend = friends.friends()[0];
    let invitation = logged_payloads(api, "invitation_issued", "payload")?
        .iter()
        .find_map(|payload| client::try_open_invitation(&friend_keys[0], payload))
        .ok_or_else(|| anyhow!("no invitation opens with the first friend's key"))?;
    ensure!(invitation.friend == friend, "invitation names {:?}", invitation.friend);
    println!("📬 Friend {friend:?} opened invitation: {:?}", invitation.note);

    let nonce1 = client::random_nonce();
    let nonce2 = client::random_nonce();
    let ptc = client::pre_transfer_commitment(&c, pt, &nonce1)?;
    let digest = client::verification_digest(&c, &ptc, &friend, &nonce2)?;
    let receipt = client::receipt(&owner_key.public_key(), pt, &nonce1, &mut rng)?;
    let verification: Value = api.post(
        "/verification",
        &json!({
            "verification_digest": digest,
            "pre_transfer_commitment": ptc,
            "nonce": nonce2,
            "receipt": hex_bytes::to_hex(&receipt),
            "caller": friend,
        }),
    )?;
    let verification_index = index_field(&verification, "verification_index")?;
    let root: H256 = serde_json::from_value(verification["root"].clone())
        .context("verification response root")?;
    println!("🤝 Friend {friend:?} verified as leaf {verification_index}");

    let opened = logged_payloads(api, "verification_created", "receipt")?
        .iter()
        .find_map(|payload| client::try_open_receipt(&owner_key, payload))
        .ok_or_else(|| anyhow!("no receipt opens with the new owner's key"))?;
    ensure!(
        client::pre_transfer_commitment(&c, opened.pre_transfer_index, &opened.nonce)? == ptc,
        "receipt does not rebuild the pre-transfer commitment"
    );
    println!("🧾 Receipt for pre-transfer {} opened by the new owner", opened.pre_transfer_index);

    let proof: InclusionProof = api.get(&format!("/verifications/{verification_index}/proof"))?;
    ensure!(proof.root == root, "inclusion proof root does not match verification root");
    ensure!(proof.verify(&c)?, "inclusion proof does not hash to its root");
    println!("🌳 Inclusion proof checks out against {root:?}");

    let slot = extended.resolve_slot(0)?;
    let _: Value = api.post(
        "/preparation",
        &json!({
            "pre_transfer_index": pt,
            "friend_index": slot,
            "verification_root": root,
            "proof": DEMO_PROOF,
            "caller": new_owner,
        }),
    )?;
    println!("🧷 Friend slot {slot} prepared");

    let transfer: Value = api.post(
        "/transfer",
        &json!({ "pre_transfer_index": pt, "proof": DEMO_PROOF, "caller": new_owner }),
    )?;
    println!("✅ Transfer settled: {}", transfer["amount"]);

    let replay = api.post_raw("/pre-transfer", &pre_transfer_body)?;
    ensure!(
        replay.status().as_u16() == 404,
        "reusing a settled commit should fail, got {}",
        replay.status()
    );
    println!("🔒 Commit {commit_index} is spent; replay rejected");

    let balance: Value = api.get(&format!("/ledger/{sender:?}"))?;
    println!("\nDone! Remaining escrow for sender: {}", balance["balance"]);
    Ok(())
}

fn decode_frame(raw: &str) -> Result<()> {
    let bytes = hex_bytes::from_hex(raw.trim()).context("frame is not valid hex")?;
    let request = parse_frame(&bytes)?;
    println!("stage:        {} ({})", request.stage, request.stage.as_u64());
    println!("input_length: {}", request.input_length());
    for (i, word) in request.fixed_inputs.iter().enumerate() {
        println!("input[{i:>2}]:    {} ({})", hex_bytes::to_hex(word), decode_u256(word));
    }
    println!("proof:        {} bytes", request.proof.len());
    Ok(())
}

struct Backend<'a> {
    client: &'a Client,
    base: &'a str,
}

impl Backend<'_> {
    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .with_context(|| format!("failed to call GET {path}"))?;
        decode(response, path)
    }

    fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        decode(self.post_raw(path, body)?, path)
    }

    fn post_raw(&self, path: &str, body: &Value) -> Result<Response> {
        self.client
            .post(format!("{}{path}", self.base))
            .json(body)
            .send()
            .with_context(|| format!("failed to call POST {path}"))
    }
}

fn decode<T: DeserializeOwned>(response: Response, path: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body: Value = response.json().unwrap_or(Value::Null);
        bail!(
            "{path} failed with {status}: {} ({})",
            body["error"].as_str().unwrap_or("no message"),
            body["error_code"].as_str().unwrap_or("UNKNOWN")
        );
    }
    response
        .json()
        .with_context(|| format!("failed to decode {path} response"))
}

/// Hex payloads of every logged notification of `kind`.
fn logged_payloads(api: &Backend<'_>, kind: &str, field: &str) -> Result<Vec<Vec<u8>>> {
    let log: Value = api.get("/notifications")?;
    log["notifications"]
        .as_array()
        .ok_or_else(|| anyhow!("notification log is not a list"))?
        .iter()
        .filter(|n| n["kind"] == kind)
        .map(|n| {
            let raw = n[field]
                .as_str()
                .ok_or_else(|| anyhow!("{kind} notification missing {field}"))?;
            hex_bytes::from_hex(raw).with_context(|| format!("{kind} {field} is not hex"))
        })
        .collect()
}

fn index_field(body: &Value, field: &str) -> Result<u64> {
    body[field]
        .as_u64()
        .ok_or_else(|| anyhow!("response missing {field}"))
}

fn spawn_backend(workspace_root: &Path, release: bool, backend: &str) -> Result<Child> {
    let port = backend
        .rsplit(':')
        .next()
        .and_then(|p| p.trim_end_matches('/').parse::<u16>().ok())
        .ok_or_else(|| anyhow!("cannot read a port from {backend}"))?;

    let mut cmd = Command::new("cargo");
    cmd.current_dir(workspace_root);
    cmd.arg("run").arg("-p").arg("zkxfer-backend");
    if release {
        cmd.arg("--release");
    }
    cmd.env("ZKXFER_SKIP_PROOFS", "true")
        .env("ZKXFER_BIND_ADDR", "127.0.0.1")
        .env("PORT", port.to_string())
        .env("RUST_LOG", "info")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    cmd.spawn().context("failed to start zkxfer-backend process")
}

fn wait_for_backend(api: &Backend<'_>) -> Result<()> {
    for _ in 0..120 {
        match api.client.get(format!("{}/health", api.base)).send() {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => thread::sleep(Duration::from_millis(500)),
        }
    }
    Err(anyhow!("backend at {} did not become ready within timeout", api.base))
}

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("xtask should live inside the workspace root")
        .to_path_buf()
}
