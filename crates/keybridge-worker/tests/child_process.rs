//! The worker binary driven as a real child process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use keybridge_client::CoreKitClient;
use keybridge_core::process::spawn_worker;
use keybridge_core::types::{CoreKitOptions, CoreKitStatus, InitParams, JwtLoginParams};
use keybridge_core::{BridgeConfig, HostBridge, MemoryStorage, Storage};
use serial_test::serial;

fn worker_bin() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_keybridge-worker"))
}

fn config() -> BridgeConfig {
    BridgeConfig {
        call_timeout: Duration::from_secs(10),
        ..BridgeConfig::default()
    }
}

#[tokio::test]
#[serial]
async fn session_over_stdio() {
    let config = config();
    let (link, worker) = spawn_worker(worker_bin(), &config).await.unwrap();
    assert!(worker.id().is_some());
    let (host, _) = HostBridge::start(link, config);
    host.wait_ready().await.unwrap();

    let storage = Arc::new(MemoryStorage::new());
    let options = CoreKitOptions {
        client_id: "worker-test".into(),
        ..CoreKitOptions::default()
    };
    let client = CoreKitClient::new(host.clone(), options, storage.clone()).unwrap();
    client.init(InitParams::default()).await.unwrap();
    client
        .login_with_jwt(JwtLoginParams {
            verifier: "google".into(),
            verifier_id: "ivan".into(),
            id_token: "header.ivan.signature".into(),
        })
        .await
        .unwrap();
    assert_eq!(client.status(), CoreKitStatus::LoggedIn);

    // The worker has no storage of its own.
    assert!(storage
        .get_item("keybridge:metadata:google:ivan")
        .await
        .unwrap()
        .is_some());

    let signature = client.sign(b"over the wire".to_vec(), false).await.unwrap();
    assert_eq!(signature.len(), 64);

    client.logout().await.unwrap();
    assert_eq!(client.status(), CoreKitStatus::NotInitialized);

    let status = worker.shutdown(Duration::from_secs(5)).await.unwrap();
    assert!(status.is_some(), "worker should exit within the grace period");
}

#[tokio::test]
#[serial]
async fn host_sees_worker_exit() {
    let config = config();
    let (link, worker) = spawn_worker(worker_bin(), &config).await.unwrap();
    let (host, loop_done) = HostBridge::start(link, config);
    host.wait_ready().await.unwrap();

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), loop_done)
        .await
        .expect("host loop ends once the worker is gone")
        .unwrap();
    assert!(host.is_closed());
}
