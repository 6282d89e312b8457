//! Periodic re-invocation of capabilities ("streaming").
//!
//! A trigger carrying `streaming = r > 0` converts into a timer that
//! re-dispatches a stored copy of the command every `1/r` seconds until it
//! is replaced or cancelled. At most one timer is active per capability
//! name; a new rate for the same name replaces the previous timer.

use crate::protocol::Command;
use log::{info, warn};
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};

/// Registry of active periodic invocations, keyed by capability name.
pub struct StreamTable {
    device_name: String,
    queue_tx: mpsc::Sender<Command>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl StreamTable {
    pub fn new(device_name: impl Into<String>, queue_tx: mpsc::Sender<Command>) -> Self {
        Self {
            device_name: device_name.into(),
            queue_tx,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts (or replaces) the periodic invocation for the command's
    /// capability. The stored copy has its `streaming` field removed so each
    /// tick takes the one-shot path through the dispatcher.
    pub async fn start(&self, mut command: Command) {
        let rate = match command.streaming.take() {
            Some(rate) if rate > 0.0 && rate.is_finite() => rate,
            other => {
                warn!(
                    "[{}] Ignoring streaming registration with rate {:?} for {}",
                    self.device_name, other, command.capability
                );
                return;
            }
        };
        let period = Duration::from_secs_f64(1.0 / rate);
        let capability = command.capability.clone();
        let queue_tx = self.queue_tx.clone();
        let device_name = self.device_name.clone();

        let handle = tokio::spawn(async move {
            // First tick fires one period from now, not immediately.
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if queue_tx.send(command.clone()).await.is_err() {
                    warn!(
                        "[{}] Dispatch queue closed, streaming {} ends",
                        device_name, command.capability
                    );
                    break;
                }
            }
        });

        let mut timers = self.timers.lock().await;
        if let Some(previous) = timers.insert(capability.clone(), handle) {
            previous.abort();
        }
        info!(
            "[{}] Streaming {} at {} Hz",
            self.device_name, capability, rate
        );
    }

    /// Stops the periodic invocation for `capability` if one exists.
    /// Returns whether a timer was actually running; stopping a capability
    /// with no timer is a no-op, not a failure.
    pub async fn stop(&self, capability: &str) -> bool {
        match self.timers.lock().await.remove(capability) {
            Some(handle) => {
                handle.abort();
                info!("[{}] Streaming ended for {}", self.device_name, capability);
                true
            }
            None => false,
        }
    }

    /// Cancels every active timer. Used during shutdown.
    pub async fn stop_all(&self) {
        let mut timers = self.timers.lock().await;
        for (capability, handle) in timers.drain() {
            handle.abort();
            info!("[{}] Streaming ended for {}", self.device_name, capability);
        }
    }

    pub async fn active_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ParameterMap;

    fn stream_trigger(capability: &str, rate: f64) -> Command {
        Command::trigger(capability, ParameterMap::new())
            .with_src(format!("ctl-{capability}-0-0"))
            .with_streaming(rate)
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_redispatch_command_without_streaming_field() {
        let (tx, mut rx) = mpsc::channel(32);
        let table = StreamTable::new("Dev", tx);

        table.start(stream_trigger("cap_read", 4.0)).await;

        for _ in 0..3 {
            let cmd = rx.recv().await.unwrap();
            assert_eq!(cmd.capability, "cap_read");
            assert!(cmd.streaming.is_none());
            assert_eq!(cmd.src.as_deref(), Some("ctl-cap_read-0-0"));
        }
        assert_eq!(table.active_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_timer_instead_of_duplicating() {
        let (tx, mut rx) = mpsc::channel(32);
        let table = StreamTable::new("Dev", tx);

        table.start(stream_trigger("cap_read", 2.0)).await;
        table.start(stream_trigger("cap_read", 2.0)).await;
        assert_eq!(table.active_count().await, 1);

        // Two full periods at 2 Hz: exactly two ticks, not four.
        tokio::time::advance(Duration::from_millis(1001)).await;
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        let mut ticks = 0;
        while rx.try_recv().is_ok() {
            ticks += 1;
        }
        assert_eq!(ticks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_timer_is_a_noop() {
        let (tx, _rx) = mpsc::channel(32);
        let table = StreamTable::new("Dev", tx);

        assert!(!table.stop("never_started").await);

        table.start(stream_trigger("cap_read", 10.0)).await;
        assert!(table.stop("cap_read").await);
        assert!(!table.stop("cap_read").await);
        assert_eq!(table.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_cancels_every_timer() {
        let (tx, _rx) = mpsc::channel(32);
        let table = StreamTable::new("Dev", tx);

        table.start(stream_trigger("cap_a", 1.0)).await;
        table.start(stream_trigger("cap_b", 1.0)).await;
        assert_eq!(table.active_count().await, 2);

        table.stop_all().await;
        assert_eq!(table.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_finite_rate_is_ignored() {
        let (tx, _rx) = mpsc::channel(32);
        let table = StreamTable::new("Dev", tx);

        table.start(stream_trigger("cap_read", f64::INFINITY)).await;
        assert_eq!(table.active_count().await, 0);
    }
}
