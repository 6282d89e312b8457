//! Command dispatch for one device.
//!
//! The runtime drains the device's command queue and spawns one concurrent
//! handler task per queued trigger. Completed handlers are reaped as they
//! finish; no ordering is guaranteed between distinct commands. Failures are
//! contained at the handler boundary and converted into `error` responses —
//! the loop itself never dies because of a handler.

use crate::capability::CapabilityRegistry;
use crate::device::DeviceContext;
use crate::error::VcapError;
use crate::protocol::{sanitize_error, Command};
use crate::streaming::StreamTable;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;

/// Depth of the command queue between the transport and the dispatcher.
pub(crate) const QUEUE_DEPTH: usize = 32;

#[derive(Clone)]
pub struct CapabilityRuntime {
    ctx: Arc<DeviceContext>,
    registry: Arc<CapabilityRegistry>,
    streams: Arc<StreamTable>,
}

impl CapabilityRuntime {
    pub fn new(
        ctx: Arc<DeviceContext>,
        registry: Arc<CapabilityRegistry>,
        streams: Arc<StreamTable>,
    ) -> Self {
        Self {
            ctx,
            registry,
            streams,
        }
    }

    /// Runs until `shutdown` fires or the queue closes. Each queued command
    /// gets its own handler task with an owned copy of the command; handlers
    /// run concurrently with each other and with this loop.
    pub async fn dispatch_loop(self, mut queue: mpsc::Receiver<Command>, shutdown: Arc<Notify>) {
        let mut active: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                // Shutdown wins over queued work: a killed device must not
                // dispatch commands that are still waiting in the queue.
                biased;
                _ = shutdown.notified() => break,
                command = queue.recv() => match command {
                    Some(command) => {
                        let runtime = self.clone();
                        active.spawn(async move { runtime.handle_trigger(command).await });
                    }
                    None => break,
                },
                Some(finished) = active.join_next(), if !active.is_empty() => {
                    // A panicking handler only costs its own task.
                    if let Err(e) = finished {
                        warn!("[{}] Handler task failed: {}", self.ctx.name(), e);
                    }
                }
            }
        }
        active.shutdown().await;
        debug!("[{}] Dispatch loop stopped", self.ctx.name());
    }

    /// Executes one trigger: resolve the capability, run it, send the
    /// response envelope (success or error) back over the transport.
    pub(crate) async fn handle_trigger(&self, command: Command) {
        info!(
            "[{}] Invoking capability {}",
            self.ctx.name(),
            command.capability
        );

        let mut response = Command::response_to(&command);

        if let Some(rate) = command.streaming {
            if rate > 0.0 {
                self.streams.start(command).await;
                return;
            }
            // Any non-positive rate stops an active timer; only rate == 0
            // falls through to a one-shot run.
            self.streams.stop(&command.capability).await;
            if rate < 0.0 {
                return;
            }
        }

        let parameters = command.parameters.clone().unwrap_or_default();
        match self.registry.get(&command.capability) {
            None => {
                let err = VcapError::CapabilityNotFound(command.capability.clone());
                warn!("[{}] {}", self.ctx.name(), err);
                response.error = Some(sanitize_error(&err.to_string()));
            }
            Some(handler) => match handler.invoke(parameters, self.ctx.clone()).await {
                Ok(result) => {
                    info!(
                        "[{}] Capability successful: {}",
                        self.ctx.name(),
                        command.capability
                    );
                    response.parameters = Some(result);
                }
                Err(e) => {
                    let err = VcapError::HandlerFailure {
                        capability: command.capability.clone(),
                        message: e.to_string(),
                    };
                    warn!("[{}] {}", self.ctx.name(), err);
                    response.error = Some(sanitize_error(&err.to_string()));
                }
            },
        }

        if let Err(e) = self.ctx.transport().send_command(&response).await {
            warn!(
                "[{}] Failed to send response for {}: {}",
                self.ctx.name(),
                command.capability,
                e
            );
        }
    }
}
