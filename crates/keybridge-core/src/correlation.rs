//! Correlation of asynchronous responses with the calls that caused them.
//!
//! A [`CorrelationTable`] turns a one-way send into an awaitable call: the
//! caller registers a [`CallKey`] before sending, gets a [`PendingCall`], and
//! the dispatch loop later resolves or rejects that key when the matching
//! response arrives. Matching is by content, never by arrival order.
//!
//! Every entry is consumed at most once. Resolving, rejecting, timing out and
//! dropping the [`PendingCall`] all remove it, so a late or duplicated
//! response finds nothing and is logged and dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use keybridge_error::BridgeError;

use crate::envelope::CallKey;

type Completion = oneshot::Sender<Result<Value, BridgeError>>;
type CancelHook = Box<dyn Fn(&CallKey) + Send + Sync>;

#[derive(Default)]
struct Entries {
    pending: HashMap<CallKey, Completion>,
    closed: bool,
}

struct Inner {
    entries: Mutex<Entries>,
    on_cancel: Option<CancelHook>,
}

/// Map from pending call keys to their completions.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct CorrelationTable {
    inner: Arc<Inner>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("pending", &self.len())
            .finish()
    }
}

impl CorrelationTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Entries::default()),
                on_cancel: None,
            }),
        }
    }

    /// An empty table that calls `hook` whenever a pending call is abandoned
    /// (timed out or dropped) while its entry was still live.
    pub fn with_cancel_hook(hook: impl Fn(&CallKey) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Entries::default()),
                on_cancel: Some(Box::new(hook)),
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `key` and return the call awaiting it.
    ///
    /// Fails with [`BridgeError::DuplicateCorrelation`] if `key` is still
    /// pending, and with [`BridgeError::TransportClosed`] after
    /// [`fail_all`](Self::fail_all).
    pub fn register(&self, key: CallKey) -> Result<PendingCall, BridgeError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut entries = self.entries();
            if entries.closed {
                return Err(BridgeError::TransportClosed);
            }
            if entries.pending.contains_key(&key) {
                return Err(BridgeError::DuplicateCorrelation {
                    correlation_id: key.correlation_id.to_string(),
                    action: key.action,
                });
            }
            entries.pending.insert(key.clone(), tx);
        }
        Ok(PendingCall {
            key,
            rx,
            table: self.clone(),
            done: false,
        })
    }

    /// Complete the call for `key` successfully.
    ///
    /// Returns `false` (and logs) if no such call is pending.
    pub fn resolve(&self, key: &CallKey, value: Value) -> bool {
        self.complete(key, Ok(value))
    }

    /// Complete the call for `key` with an error.
    ///
    /// Returns `false` (and logs) if no such call is pending.
    pub fn reject(&self, key: &CallKey, error: BridgeError) -> bool {
        self.complete(key, Err(error))
    }

    fn complete(&self, key: &CallKey, outcome: Result<Value, BridgeError>) -> bool {
        let completion = self.entries().pending.remove(key);
        match completion {
            Some(tx) => {
                // The receiver may have been dropped a moment ago; nothing to do then.
                let _ = tx.send(outcome);
                true
            }
            None => {
                tracing::warn!(
                    correlation_id = %key.correlation_id,
                    action = %key.action,
                    "no pending call for response, dropping"
                );
                false
            }
        }
    }

    /// Reject every pending call and refuse new registrations.
    ///
    /// Returns the number of calls rejected.
    pub fn fail_all(&self, make_error: impl Fn(&CallKey) -> BridgeError) -> usize {
        let drained: Vec<(CallKey, Completion)> = {
            let mut entries = self.entries();
            entries.closed = true;
            entries.pending.drain().collect()
        };
        let count = drained.len();
        for (key, tx) in drained {
            let _ = tx.send(Err(make_error(&key)));
        }
        if count > 0 {
            tracing::debug!(count, "failed all pending calls");
        }
        count
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        self.entries().pending.len()
    }

    /// Whether no call is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is pending.
    pub fn contains(&self, key: &CallKey) -> bool {
        self.entries().pending.contains_key(key)
    }

    /// Whether [`fail_all`](Self::fail_all) has run.
    pub fn is_closed(&self) -> bool {
        self.entries().closed
    }

    fn abandon(&self, key: &CallKey) {
        let removed = self.entries().pending.remove(key).is_some();
        if removed {
            tracing::debug!(
                correlation_id = %key.correlation_id,
                action = %key.action,
                "pending call abandoned"
            );
            if let Some(hook) = &self.inner.on_cancel {
                hook(key);
            }
        }
    }
}

/// A registered call awaiting its response.
///
/// Dropping it before completion cancels the call: the entry is removed and
/// the table's cancel hook runs.
#[must_use = "dropping a pending call cancels it"]
pub struct PendingCall {
    key: CallKey,
    rx: oneshot::Receiver<Result<Value, BridgeError>>,
    table: CorrelationTable,
    done: bool,
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall").field("key", &self.key).finish()
    }
}

impl PendingCall {
    /// The key this call is registered under.
    pub fn key(&self) -> &CallKey {
        &self.key
    }

    /// Wait for the response without a deadline.
    pub async fn wait(mut self) -> Result<Value, BridgeError> {
        let outcome = (&mut self.rx).await;
        self.done = true;
        outcome.unwrap_or(Err(BridgeError::TransportClosed))
    }

    /// Wait for the response for at most `timeout`.
    ///
    /// On expiry the entry is removed, the cancel hook runs, and
    /// [`BridgeError::Timeout`] is returned.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<Value, BridgeError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(outcome) => {
                self.done = true;
                outcome.unwrap_or(Err(BridgeError::TransportClosed))
            }
            Err(_elapsed) => {
                tracing::warn!(
                    correlation_id = %self.key.correlation_id,
                    action = %self.key.action,
                    timeout_ms = timeout.as_millis() as u64,
                    "call timed out"
                );
                Err(BridgeError::Timeout {
                    action: self.key.action.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.done {
            self.table.abandon(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CorrelationId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(id: &str, action: &str) -> CallKey {
        CallKey::new(CorrelationId::from(id), action)
    }

    #[test]
    fn duplicate_live_key_fails_loudly() {
        let table = CorrelationTable::new();
        let _first = table.register(key("c1", "sign")).unwrap();
        let err = table.register(key("c1", "sign")).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_CORRELATION");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn same_id_different_action_is_a_different_key() {
        let table = CorrelationTable::new();
        let _a = table.register(key("c1", "getItem")).unwrap();
        let _b = table.register(key("c1", "setItem")).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn resolves_at_most_once() {
        let table = CorrelationTable::new();
        let call = table.register(key("c1", "init")).unwrap();

        assert!(table.resolve(&key("c1", "init"), serde_json::json!(1)));
        assert!(!table.resolve(&key("c1", "init"), serde_json::json!(2)));
        assert!(!table.reject(&key("c1", "init"), BridgeError::TransportClosed));

        assert_eq!(call.wait().await.unwrap(), serde_json::json!(1));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let table = CorrelationTable::new();
        let calls: Vec<_> = (0..10)
            .map(|i| table.register(key(&format!("c{i}"), "sign")).unwrap())
            .collect();

        for i in (0..10).rev() {
            assert!(table.resolve(&key(&format!("c{i}"), "sign"), serde_json::json!(i)));
        }

        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.wait().await.unwrap(), serde_json::json!(i));
        }
    }

    #[tokio::test]
    async fn reject_delivers_error() {
        let table = CorrelationTable::new();
        let call = table.register(key("c1", "sign")).unwrap();
        table.reject(
            &key("c1", "sign"),
            BridgeError::InstanceNotFound("i".into()),
        );
        assert_eq!(call.wait().await.unwrap_err().code(), "INSTANCE_NOT_FOUND");
    }

    #[test]
    fn unknown_key_is_a_logged_no_op() {
        let table = CorrelationTable::new();
        assert!(!table.resolve(&key("ghost", "init"), serde_json::Value::Null));
        assert!(table.is_empty());
    }

    #[test]
    fn dropping_pending_call_removes_entry_and_runs_hook() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let seen = cancelled.clone();
        let table = CorrelationTable::with_cancel_hook(move |k| {
            assert_eq!(k.action, "sign");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let call = table.register(key("c1", "sign")).unwrap();
        drop(call);

        assert!(table.is_empty());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        // Key is reusable once its entry is gone
        let _again = table.register(key("c1", "sign")).unwrap();
    }

    #[tokio::test]
    async fn completed_call_does_not_run_hook() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let seen = cancelled.clone();
        let table = CorrelationTable::with_cancel_hook(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let call = table.register(key("c1", "sign")).unwrap();
        table.resolve(&key("c1", "sign"), serde_json::json!(true));
        call.wait().await.unwrap();
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_runs_hook() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let seen = cancelled.clone();
        let table = CorrelationTable::with_cancel_hook(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let call = table.register(key("c1", "sign")).unwrap();
        let err = call.wait_timeout(Duration::from_millis(50)).await.unwrap_err();

        assert_eq!(err.code(), "TIMEOUT");
        assert!(err.retryable());
        assert!(table.is_empty());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        // A late response is dropped
        assert!(!table.resolve(&key("c1", "sign"), serde_json::json!(1)));
    }

    #[tokio::test]
    async fn fail_all_rejects_everything_and_closes() {
        let table = CorrelationTable::new();
        let a = table.register(key("a", "init")).unwrap();
        let b = table.register(key("b", "sign")).unwrap();

        assert_eq!(table.fail_all(|_| BridgeError::TransportClosed), 2);
        assert_eq!(a.wait().await.unwrap_err().code(), "TRANSPORT_CLOSED");
        assert_eq!(b.wait().await.unwrap_err().code(), "TRANSPORT_CLOSED");

        assert!(table.is_closed());
        assert_eq!(
            table.register(key("c", "init")).unwrap_err().code(),
            "TRANSPORT_CLOSED"
        );
    }
}
