//! Host and sandbox bridges wired together in one process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use keybridge_core::codec::Binary;
use keybridge_core::frame::DEFAULT_MAX_MESSAGE_SIZE;
use keybridge_core::transport::{duplex, spawn_stream_link};
use keybridge_core::types::{
    CoreKitOptions, CoreKitState, CoreKitStatus, CreateFactorParams, EnableMfaParams, InitParams,
    JwtLoginParams,
};
use keybridge_core::{
    BridgeConfig, CoreKit, CoreKitFactory, CoreKitRequest, EngineError, HostBridge, Link,
    MemoryStorage, SandboxBridge, Storage,
};

/// Engine that keeps a visit counter in its storage.
struct Notebook {
    storage: Arc<dyn Storage>,
    status: std::sync::Mutex<CoreKitStatus>,
    writes: Mutex<u32>,
}

impl Notebook {
    fn set_status(&self, status: CoreKitStatus) {
        *self.status.lock().unwrap() = status;
    }
}

#[async_trait]
impl CoreKit for Notebook {
    fn status(&self) -> CoreKitStatus {
        *self.status.lock().unwrap()
    }

    fn state(&self) -> CoreKitState {
        CoreKitState::default()
    }

    async fn init(&self, _params: InitParams) -> Result<Value, EngineError> {
        let mut writes = self.writes.lock().await;
        let visits: u32 = self
            .storage
            .get_item("visits")
            .await?
            .map(|v| v.parse().unwrap_or(0))
            .unwrap_or(0);
        self.storage
            .set_item("visits", &(visits + 1).to_string())
            .await?;
        *writes += 1;
        self.set_status(CoreKitStatus::Initialized);
        Ok(json!(visits + 1))
    }

    async fn login_with_jwt(&self, _params: JwtLoginParams) -> Result<Value, EngineError> {
        Err(EngineError::InvalidState {
            operation: "login_with_jwt".into(),
            status: self.status().to_string(),
        })
    }

    async fn input_factor_key(&self, _factor_key: &str) -> Result<Value, EngineError> {
        Ok(Value::Null)
    }

    async fn create_factor(&self, _params: CreateFactorParams) -> Result<Value, EngineError> {
        Ok(Value::Null)
    }

    async fn delete_factor(&self, _pub: &str, _key: Option<&str>) -> Result<Value, EngineError> {
        Ok(Value::Null)
    }

    async fn enable_mfa(&self, _p: EnableMfaParams, _r: bool) -> Result<Value, EngineError> {
        Ok(Value::Null)
    }

    async fn commit_changes(&self) -> Result<Value, EngineError> {
        Ok(Value::Null)
    }

    async fn sign(&self, data: &Binary, _hashed: bool) -> Result<Value, EngineError> {
        let mut reversed = data.as_bytes().to_vec();
        reversed.reverse();
        Ok(serde_json::to_value(Binary::new(reversed)).unwrap())
    }

    async fn logout(&self) -> Result<Value, EngineError> {
        self.set_status(CoreKitStatus::NotInitialized);
        Ok(Value::Null)
    }
}

struct NotebookFactory;

impl CoreKitFactory for NotebookFactory {
    fn create(
        &self,
        _options: CoreKitOptions,
        storage: Arc<dyn Storage>,
    ) -> Result<Arc<dyn CoreKit>, EngineError> {
        Ok(Arc::new(Notebook {
            storage,
            status: std::sync::Mutex::new(CoreKitStatus::NotInitialized),
            writes: Mutex::new(0),
        }))
    }
}

fn config() -> BridgeConfig {
    BridgeConfig {
        call_timeout: Duration::from_secs(5),
        storage_timeout: Duration::from_secs(5),
        ..BridgeConfig::default()
    }
}

fn connect_with(host_link: Link, sandbox_link: Link) -> (Arc<HostBridge>, Arc<SandboxBridge>) {
    let (sandbox, _) = SandboxBridge::start(sandbox_link, Arc::new(NotebookFactory), config());
    let (host, _) = HostBridge::start(host_link, config());
    (host, sandbox)
}

fn connect() -> (Arc<HostBridge>, Arc<SandboxBridge>) {
    let (host_link, sandbox_link) = duplex();
    connect_with(host_link, sandbox_link)
}

fn options() -> CoreKitOptions {
    CoreKitOptions {
        client_id: "test-app".into(),
        ..CoreKitOptions::default()
    }
}

#[tokio::test]
async fn storage_lives_on_the_host() {
    let (host, _sandbox) = connect();
    host.wait_ready().await.unwrap();

    let store = Arc::new(MemoryStorage::new());
    let (id, reply) = host.create_instance(&options(), store.clone()).await.unwrap();
    assert_eq!(reply.status, CoreKitStatus::NotInitialized);

    let reply = host
        .call(&id, CoreKitRequest::Init { params: InitParams::default() })
        .await
        .unwrap();
    assert_eq!(reply.result, json!(1));
    assert_eq!(reply.status, CoreKitStatus::Initialized);
    assert_eq!(store.get_item("visits").await.unwrap().as_deref(), Some("1"));

    let reply = host
        .call(&id, CoreKitRequest::Init { params: InitParams::default() })
        .await
        .unwrap();
    assert_eq!(reply.result, json!(2));
}

#[tokio::test]
async fn instances_have_separate_storage() {
    let (host, sandbox) = connect();
    let a_store = Arc::new(MemoryStorage::new());
    let b_store = Arc::new(MemoryStorage::new());
    let (a, _) = host.create_instance(&options(), a_store.clone()).await.unwrap();
    let (b, _) = host.create_instance(&options(), b_store.clone()).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(sandbox.registry().len(), 2);

    host.call(&a, CoreKitRequest::Init { params: InitParams::default() })
        .await
        .unwrap();
    assert_eq!(a_store.len(), 1);
    assert!(b_store.is_empty());
}

#[tokio::test]
async fn binary_survives_the_round_trip() {
    let (host, _sandbox) = connect();
    let (id, _) = host
        .create_instance(&options(), Arc::new(MemoryStorage::new()))
        .await
        .unwrap();

    let reply = host
        .call(
            &id,
            CoreKitRequest::Sign {
                data: Binary::new(vec![1, 2, 3, 255]),
                hashed: false,
            },
        )
        .await
        .unwrap();
    let signed: Binary = serde_json::from_value(reply.result).unwrap();
    assert_eq!(signed.as_bytes(), &[255, 3, 2, 1]);
}

#[tokio::test]
async fn engine_errors_reach_the_host_with_their_code() {
    let (host, _sandbox) = connect();
    let (id, _) = host
        .create_instance(&options(), Arc::new(MemoryStorage::new()))
        .await
        .unwrap();

    let err = host
        .call(
            &id,
            CoreKitRequest::LoginWithJwt {
                jwt: JwtLoginParams {
                    verifier: "v".into(),
                    verifier_id: "u".into(),
                    id_token: "t".into(),
                },
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
    assert_eq!(host.pending_calls(), 0);
}

#[tokio::test]
async fn unsupported_extended_operation() {
    let (host, _sandbox) = connect();
    let (id, _) = host
        .create_instance(&options(), Arc::new(MemoryStorage::new()))
        .await
        .unwrap();
    let err = host
        .call(&id, CoreKitRequest::GetKeyDetails {})
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNSUPPORTED");
}

#[tokio::test]
async fn logout_tears_down_both_sides() {
    let (host, sandbox) = connect();
    let (id, _) = host
        .create_instance(&options(), Arc::new(MemoryStorage::new()))
        .await
        .unwrap();
    assert_eq!(host.storage().len(), 1);

    host.call(&id, CoreKitRequest::Logout {}).await.unwrap();
    assert!(sandbox.registry().is_empty());
    assert!(host.storage().is_empty());

    let err = host
        .call(&id, CoreKitRequest::Init { params: InitParams::default() })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INSTANCE_NOT_FOUND");
    assert_eq!(err.to_string(), format!("instance not found: {id}"));
}

#[tokio::test]
async fn create_as_is_idempotent() {
    let (host, sandbox) = connect();
    let store = Arc::new(MemoryStorage::new());
    let first = host
        .create_instance_as("wallet".into(), &options(), store.clone())
        .await
        .unwrap();
    let second = host
        .create_instance_as("wallet".into(), &options(), store)
        .await
        .unwrap();
    assert_eq!(first.result, json!("wallet"));
    assert_eq!(second.result, json!("wallet"));
    assert_eq!(sandbox.registry().len(), 1);
}

#[tokio::test]
async fn concurrent_calls_resolve_independently() {
    let (host, _sandbox) = connect();
    let (id, _) = host
        .create_instance(&options(), Arc::new(MemoryStorage::new()))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for n in 0..32u8 {
        let host = host.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            let reply = host
                .call(
                    &id,
                    CoreKitRequest::Sign {
                        data: Binary::new(vec![n, 0]),
                        hashed: false,
                    },
                )
                .await
                .unwrap();
            let signed: Binary = serde_json::from_value(reply.result).unwrap();
            (n, signed.into_vec())
        }));
    }
    for task in tasks {
        let (n, bytes) = task.await.unwrap();
        assert_eq!(bytes, vec![0, n]);
    }
    assert_eq!(host.pending_calls(), 0);
}

#[tokio::test]
async fn works_over_framed_streams() {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (left_r, left_w) = tokio::io::split(left);
    let (right_r, right_w) = tokio::io::split(right);
    let (host_link, _) = spawn_stream_link(left_r, left_w, DEFAULT_MAX_MESSAGE_SIZE);
    let (sandbox_link, _) = spawn_stream_link(right_r, right_w, DEFAULT_MAX_MESSAGE_SIZE);
    let (host, _sandbox) = connect_with(host_link, sandbox_link);

    host.wait_ready().await.unwrap();
    let store = Arc::new(MemoryStorage::new());
    let (id, _) = host.create_instance(&options(), store.clone()).await.unwrap();
    let reply = host
        .call(&id, CoreKitRequest::Init { params: InitParams::default() })
        .await
        .unwrap();
    assert_eq!(reply.status, CoreKitStatus::Initialized);
    assert_eq!(store.get_item("visits").await.unwrap().as_deref(), Some("1"));
}
