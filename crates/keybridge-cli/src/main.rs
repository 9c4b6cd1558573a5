#![warn(missing_docs)]

//! keybridge: sign a message with a sandboxed threshold key manager.
//!
//! Spawns the `keybridge-worker` sandbox, logs in as `<verifier-id>` with the
//! identity token from `KEYBRIDGE_ID_TOKEN`, signs `<message>` and prints the
//! signature and public key as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use keybridge_client::CoreKitClient;
use keybridge_config::{BridgeOverrides, ClientSettings, KeybridgeConfig, StorageSettings};
use keybridge_core::process::{find_worker_binary, spawn_worker};
use keybridge_core::types::{CoreKitOptions, InitParams, JwtLoginParams, KeyType, Network};
use keybridge_core::{BridgeConfig, FileStorage, HostBridge, MemoryStorage, Storage};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: keybridge <verifier-id> <message>";

const ID_TOKEN_ENV: &str = "KEYBRIDGE_ID_TOKEN";

const VERIFIER_ENV: &str = "KEYBRIDGE_VERIFIER";

const WORKER_GRACE: Duration = Duration::from_secs(5);

/// Build BridgeConfig from config overrides.
fn build_bridge_config(overrides: &BridgeOverrides) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    if let Some(secs) = overrides.call_timeout_secs {
        config.call_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = overrides.storage_timeout_secs {
        config.storage_timeout = Duration::from_secs(secs);
    }
    if let Some(mb) = overrides.max_message_size_mb {
        config.max_message_size = mb * 1024 * 1024;
    }
    config
}

/// Build engine options from the `[client]` section.
fn build_options(settings: &ClientSettings) -> Result<CoreKitOptions> {
    let client_id = settings
        .client_id
        .clone()
        .context("client.client_id is required")?;
    let network = match settings.network.as_deref() {
        None | Some("devnet") => Network::Devnet,
        Some("mainnet") => Network::Mainnet,
        Some(other) => anyhow::bail!("unsupported network '{}'", other),
    };
    let key_type = match settings.key_type.as_deref() {
        None | Some("ed25519") => KeyType::Ed25519,
        Some("secp256k1") => KeyType::Secp256k1,
        Some(other) => anyhow::bail!("unsupported key type '{}'", other),
    };
    Ok(CoreKitOptions {
        client_id,
        network,
        key_type,
        manual_sync: settings.manual_sync.unwrap_or(false),
        ..CoreKitOptions::default()
    })
}

/// Open the storage backend for one user.
async fn open_storage(settings: &StorageSettings, namespace: &str) -> Result<Arc<dyn Storage>> {
    match settings.backend.as_str() {
        "file" => {
            let dir = settings
                .dir
                .as_ref()
                .context("storage: file backend requires 'dir'")?;
            let storage = FileStorage::open(dir, namespace)
                .await
                .with_context(|| format!("failed to open storage in {}", dir.display()))?;
            Ok(Arc::new(storage))
        }
        _ => Ok(Arc::new(MemoryStorage::new())),
    }
}

/// File storage namespace for a user: unsupported characters become `_`.
fn storage_namespace(verifier_id: &str) -> String {
    verifier_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(64)
        .collect()
}

/// Locate the config file.
///
/// Search order:
/// 1. `KEYBRIDGE_CONFIG` environment variable
/// 2. `./keybridge.toml` in the current directory
/// 3. None (defaults apply)
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KEYBRIDGE_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("keybridge.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

/// Positional arguments: `<verifier-id> <message>`.
fn parse_args(args: &[String]) -> Result<(&str, &str)> {
    match args {
        [_, verifier_id, message] if !verifier_id.is_empty() => {
            Ok((verifier_id.as_str(), message.as_str()))
        }
        _ => anyhow::bail!(USAGE),
    }
}

/// init → login → sign → logout; returns the JSON report.
async fn run_session(client: &CoreKitClient, jwt: JwtLoginParams, message: &str) -> Result<serde_json::Value> {
    let verifier_id = jwt.verifier_id.clone();
    client
        .init(InitParams::default())
        .await
        .context("init failed")?;
    client.login_with_jwt(jwt).await.context("login failed")?;
    tracing::info!(status = %client.status(), "logged in");

    let signature = client
        .sign(message.as_bytes().to_vec(), false)
        .await
        .context("sign failed")?;
    let pub_key = client.pub_key()?;

    client.logout().await.context("logout failed")?;
    Ok(serde_json::json!({
        "verifierId": verifier_id,
        "pubKey": hex::encode(pub_key.as_bytes()),
        "signature": hex::encode(signature.as_bytes()),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version / -V before anything else
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("keybridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (verifier_id, message) = parse_args(&args)?;
    let id_token = std::env::var(ID_TOKEN_ENV)
        .with_context(|| format!("{} must hold the identity token", ID_TOKEN_ENV))?;
    let verifier = std::env::var(VERIFIER_ENV).unwrap_or_else(|_| "keybridge".to_string());

    let config = match find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            KeybridgeConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => {
            tracing::info!("no config file found, using defaults");
            KeybridgeConfig::from_toml("")?
        }
    };

    let bridge_config = build_bridge_config(&config.bridge);
    let options = build_options(&config.client)?;
    let storage = open_storage(&config.storage, &storage_namespace(verifier_id)).await?;

    let binary = find_worker_binary(config.worker.path.as_deref())?;
    let (link, worker) = spawn_worker(&binary, &bridge_config)
        .await
        .context("failed to start sandbox worker")?;
    tracing::info!(pid = worker.id(), "sandbox worker started");

    let (host, _) = HostBridge::start(link, bridge_config);
    let outcome = async {
        host.wait_ready().await.context("sandbox worker never became ready")?;
        let client = CoreKitClient::new(host.clone(), options, storage)?;
        let jwt = JwtLoginParams {
            verifier,
            verifier_id: verifier_id.to_string(),
            id_token,
        };
        run_session(&client, jwt, message).await
    }
    .await;

    if let Err(e) = worker.shutdown(WORKER_GRACE).await {
        tracing::warn!(error = %e, "failed to stop sandbox worker");
    }

    let report = outcome?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
