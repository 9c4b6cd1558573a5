//! keybridge sandbox worker: isolated child process hosting engine instances.
//!
//! Spawned by [`keybridge_core::process::spawn_worker`] in the host process.
//! The first frame on stdin is a `configure` signal; after that the process
//! serves the sandbox side of the bridge over length-delimited JSON frames on
//! stdin/stdout until the host closes stdin.
//!
//! **Security**: this process runs with a clean environment. It never sees
//! host credentials and has no durable storage of its own; every engine write
//! is relayed to the host.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use keybridge_core::frame::read_message;
use keybridge_core::transport::spawn_stream_link;
use keybridge_core::{BridgeConfig, Envelope, SandboxBridge, Signal};
use keybridge_engine_ref::RefCoreKitFactory;
use tokio::io::{self, BufReader};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    // stderr only; stdout carries frames
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let first: Envelope = read_message(&mut stdin)
        .await
        .context("failed to read initial message from host")?
        .context("host closed stdin before sending configure")?;

    let config = match Signal::from_envelope(&first) {
        Ok(Signal::Configure {
            storage_timeout_ms,
            max_message_size,
        }) => BridgeConfig {
            storage_timeout: Duration::from_millis(storage_timeout_ms),
            max_message_size,
            ..BridgeConfig::default()
        },
        Ok(other) => anyhow::bail!("expected configure signal, got '{}'", other.action()),
        Err(e) => anyhow::bail!("expected configure signal: {e}"),
    };

    let (link, _io) = spawn_stream_link(stdin, io::stdout(), config.max_message_size);
    let (bridge, done) = SandboxBridge::start(link, Arc::new(RefCoreKitFactory), config);
    done.await.context("sandbox dispatch loop panicked")?;
    tracing::debug!(instances = bridge.registry().len(), "worker exiting");
    Ok(())
}
