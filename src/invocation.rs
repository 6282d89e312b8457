//! Sub-capability invocation bookkeeping.
//!
//! When a device triggers another device's capability and expects a reply,
//! it registers a pending invocation keyed by correlation id (`src`). The
//! matching response resolves that slot, which is the sole signal that wakes
//! the waiter. Each slot is a one-shot channel with explicit
//! presence/absence; there is no sentinel value that could collide with a
//! legitimate falsy response.
//!
//! Cancellation is global and blunt: one flag resolves every current and
//! future wait with an empty result. After a fixed grace period the flag
//! clears and later invocations behave normally again.

use crate::protocol::ParameterMap;
use chrono::Utc;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{sleep, Duration};

/// How long the global cancellation flag stays set before clearing.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Table of outstanding sub-capability invocations for one device.
pub struct InvocationTable {
    device_name: String,
    uri: String,
    pending: Mutex<HashMap<String, oneshot::Sender<ParameterMap>>>,
    seq: AtomicU32,
    cancel: watch::Sender<bool>,
}

impl InvocationTable {
    pub fn new(device_name: impl Into<String>, uri: impl Into<String>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            device_name: device_name.into(),
            uri: uri.into(),
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU32::new(0),
            cancel,
        }
    }

    /// Correlation id for a fresh invocation: device identity, target
    /// capability and timestamp, plus a sequence number so concurrently
    /// outstanding invocations from this device never collide.
    pub fn next_correlation_id(&self, capability: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        format!(
            "{}-{}-{}-{}",
            self.uri,
            capability,
            Utc::now().timestamp_millis(),
            seq
        )
    }

    /// Registers a pending slot for `src` and returns the receiving end.
    pub async fn register(&self, src: &str) -> oneshot::Receiver<ParameterMap> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(src.to_string(), tx);
        rx
    }

    /// Stores a response's parameters into the pending slot for `src`,
    /// waking its waiter. A response for an id that is not pending is
    /// dropped silently (correlation miss).
    pub async fn resolve(&self, src: &str, parameters: ParameterMap) -> bool {
        match self.pending.lock().await.remove(src) {
            Some(slot) => {
                info!(
                    "[{}] Got response from sub-capability for {}",
                    self.device_name, src
                );
                // The waiter may have given up already; that is fine.
                let _ = slot.send(parameters);
                true
            }
            None => {
                debug!(
                    "[{}] {}",
                    self.device_name,
                    crate::error::VcapError::CorrelationMiss(src.to_string())
                );
                false
            }
        }
    }

    /// Blocks until the slot for `src` is resolved or global cancellation
    /// fires, whichever comes first. Cancellation (or a torn-down table)
    /// yields an empty result. The pending entry is removed on every path.
    pub async fn wait(&self, src: &str, rx: oneshot::Receiver<ParameterMap>) -> ParameterMap {
        let mut cancel = self.cancel.subscribe();
        if *cancel.borrow() {
            self.remove(src).await;
            return ParameterMap::new();
        }
        tokio::select! {
            result = rx => match result {
                Ok(parameters) => parameters,
                // Sender dropped: the table was cleared during shutdown.
                Err(_) => ParameterMap::new(),
            },
            _ = async { let _ = cancel.wait_for(|cancelled| *cancelled).await; } => {
                debug!(
                    "[{}] Wait for {} resolved by cancellation",
                    self.device_name, src
                );
                self.remove(src).await;
                ParameterMap::new()
            }
        }
    }

    /// Sets the process-wide cancellation flag, resolving every current and
    /// future wait with an empty result, then clears it after the grace
    /// period so later invocations behave normally.
    pub async fn cancel_pending(&self) {
        info!("[{}] Cancelling pending sub-capability waits", self.device_name);
        // send_replace updates the flag even while no wait is subscribed, so
        // invocations started during the grace period still resolve empty.
        self.cancel.send_replace(true);
        sleep(CANCEL_GRACE).await;
        self.cancel.send_replace(false);
    }

    /// Drops every pending slot, resolving all waiters empty. Used during
    /// shutdown.
    pub async fn cancel_all(&self) {
        self.pending.lock().await.clear();
    }

    pub(crate) async fn remove(&self, src: &str) {
        self.pending.lock().await.remove(src);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn params(key: &str, value: serde_json::Value) -> ParameterMap {
        let mut map = ParameterMap::new();
        map.insert(key.to_string(), value);
        map
    }

    #[tokio::test]
    async fn correlation_ids_are_unique_for_concurrent_invocations() {
        let table = InvocationTable::new("Dev", "dev-1");
        let a = table.next_correlation_id("cap");
        let b = table.next_correlation_id("cap");
        assert_ne!(a, b);
        assert!(a.starts_with("dev-1-cap-"));
    }

    #[tokio::test]
    async fn resolve_wakes_waiter_with_response_parameters() {
        let table = Arc::new(InvocationTable::new("Dev", "dev-1"));
        let src = table.next_correlation_id("cap");
        let rx = table.register(&src).await;

        let resolver = table.clone();
        let resolver_src = src.clone();
        tokio::spawn(async move {
            resolver
                .resolve(&resolver_src, params("answer", json!(7)))
                .await;
        });

        let result = table.wait(&src, rx).await;
        assert_eq!(result.get("answer"), Some(&json!(7)));
        assert_eq!(table.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_correlation_id_is_dropped_silently() {
        let table = InvocationTable::new("Dev", "dev-1");
        assert!(!table.resolve("nobody-waiting", ParameterMap::new()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_resolves_wait_empty_and_removes_entry() {
        let table = Arc::new(InvocationTable::new("Dev", "dev-1"));
        let src = table.next_correlation_id("cap");
        let rx = table.register(&src).await;

        let canceller = table.clone();
        let waiter_src = src.clone();
        let waiter = tokio::spawn({
            let table = table.clone();
            async move { table.wait(&waiter_src, rx).await }
        });
        tokio::spawn(async move { canceller.cancel_pending().await });

        let result = waiter.await.unwrap();
        assert!(result.is_empty());
        assert_eq!(table.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_flag_clears_after_grace_period() {
        let table = Arc::new(InvocationTable::new("Dev", "dev-1"));
        table.cancel_pending().await;

        // After the grace period new invocations wait normally again.
        let src = table.next_correlation_id("cap");
        let rx = table.register(&src).await;
        let resolver = table.clone();
        let resolver_src = src.clone();
        tokio::spawn(async move {
            resolver.resolve(&resolver_src, params("ok", json!(true))).await;
        });
        let result = table.wait(&src, rx).await;
        assert_eq!(result.get("ok"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn cancel_all_resolves_waiters_empty() {
        let table = Arc::new(InvocationTable::new("Dev", "dev-1"));
        let src = table.next_correlation_id("cap");
        let rx = table.register(&src).await;

        table.cancel_all().await;
        let result = table.wait(&src, rx).await;
        assert!(result.is_empty());
    }
}
