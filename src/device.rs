//! Device assembly and lifecycle.
//!
//! A [`Device`] ties the framed transport, the capability registry, the
//! dispatcher and the sub-capability invocation table together. It serves
//! exactly one peer connection at a time: bind, accept, route frames until
//! the peer disconnects or a `kill` is exchanged, then release everything so
//! a new connection can be served.

use crate::capability::{Capability, CapabilityRegistry};
use crate::config::Settings;
use crate::error::VcapResult;
use crate::invocation::InvocationTable;
use crate::protocol::{Command, CommandType, ParameterMap, WireFrame};
use crate::runtime::{CapabilityRuntime, QUEUE_DEPTH};
use crate::streaming::StreamTable;
use crate::transport::{ConnectionState, FramedTransport, TransportListener};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Notify};
use tokio::time::Duration;
use uuid::Uuid;

/// Callback for [`DeviceContext::invoke_async`]; runs on the waiter task,
/// never on the original caller.
pub type InvokeCallback = Box<dyn FnOnce(ParameterMap) -> BoxFuture<'static, ()> + Send>;

/// Hands capabilities access to the device's transport and invocation
/// table so they can trigger sub-capabilities on other devices.
pub struct DeviceContext {
    name: String,
    transport: Arc<FramedTransport>,
    invocations: Arc<InvocationTable>,
}

impl DeviceContext {
    pub(crate) fn new(
        name: String,
        transport: Arc<FramedTransport>,
        invocations: Arc<InvocationTable>,
    ) -> Self {
        Self {
            name,
            transport,
            invocations,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn transport(&self) -> &FramedTransport {
        &self.transport
    }

    /// Triggers a sub-capability and blocks the calling task until its
    /// response arrives or global cancellation fires. Cancellation yields an
    /// empty map. There is no timeout on this path; see
    /// [`DeviceContext::invoke_sync_timeout`].
    pub async fn invoke_sync(
        &self,
        capability: &str,
        parameters: ParameterMap,
    ) -> VcapResult<ParameterMap> {
        let src = self.invocations.next_correlation_id(capability);
        let rx = self.invocations.register(&src).await;
        info!("[{}] Triggering sub-capability: {}", self.name, capability);

        let trigger = Command::trigger(capability, parameters).with_src(src.clone());
        if let Err(e) = self.transport.send_command(&trigger).await {
            self.invocations.remove(&src).await;
            return Err(e);
        }
        Ok(self.invocations.wait(&src, rx).await)
    }

    /// [`DeviceContext::invoke_sync`] with a per-invocation deadline; a
    /// strict improvement over global cancellation that leaves the wire
    /// protocol unchanged. Returns `None` when the deadline expires, with
    /// the pending entry cleaned up.
    pub async fn invoke_sync_timeout(
        &self,
        capability: &str,
        parameters: ParameterMap,
        deadline: Duration,
    ) -> VcapResult<Option<ParameterMap>> {
        let src = self.invocations.next_correlation_id(capability);
        let rx = self.invocations.register(&src).await;
        info!("[{}] Triggering sub-capability: {}", self.name, capability);

        let trigger = Command::trigger(capability, parameters).with_src(src.clone());
        if let Err(e) = self.transport.send_command(&trigger).await {
            self.invocations.remove(&src).await;
            return Err(e);
        }
        match tokio::time::timeout(deadline, self.invocations.wait(&src, rx)).await {
            Ok(result) => Ok(Some(result)),
            Err(_) => {
                warn!(
                    "[{}] Sub-capability {} timed out after {:?}",
                    self.name, capability, deadline
                );
                self.invocations.remove(&src).await;
                Ok(None)
            }
        }
    }

    /// Triggers a sub-capability without blocking the caller: a spawned
    /// waiter awaits the response (or cancellation) and then runs
    /// `callback` with the result on its own task.
    pub async fn invoke_async(
        &self,
        capability: &str,
        parameters: ParameterMap,
        callback: InvokeCallback,
    ) -> VcapResult<()> {
        let src = self.invocations.next_correlation_id(capability);
        let rx = self.invocations.register(&src).await;
        info!("[{}] Triggering sub-capability: {}", self.name, capability);

        let trigger = Command::trigger(capability, parameters).with_src(src.clone());
        if let Err(e) = self.transport.send_command(&trigger).await {
            self.invocations.remove(&src).await;
            return Err(e);
        }

        let invocations = self.invocations.clone();
        tokio::spawn(async move {
            let result = invocations.wait(&src, rx).await;
            callback(result).await;
        });
        Ok(())
    }

    /// Cancels every pending sub-capability wait in this device. Blunt and
    /// global: it cannot target a single invocation.
    pub async fn cancel_pending(&self) {
        self.invocations.cancel_pending().await;
    }
}

/// One virtual capability device.
#[derive(Clone)]
pub struct Device {
    name: String,
    settings: Settings,
    registry: Arc<CapabilityRegistry>,
    running: Arc<AtomicBool>,
    kill_notify: Arc<Notify>,
    streams: Arc<StdMutex<Option<Arc<StreamTable>>>>,
}

pub struct DeviceBuilder {
    name: String,
    registry: CapabilityRegistry,
}

impl DeviceBuilder {
    /// Registers a capability handler under its wire name.
    pub fn capability(mut self, name: impl Into<String>, handler: Arc<dyn Capability>) -> Self {
        self.registry.register(name, handler);
        self
    }

    pub fn build(self, settings: Settings) -> Device {
        Device {
            name: self.name,
            settings,
            registry: Arc::new(self.registry),
            running: Arc::new(AtomicBool::new(false)),
            kill_notify: Arc::new(Notify::new()),
            streams: Arc::new(StdMutex::new(None)),
        }
    }
}

impl Device {
    pub fn builder(name: impl Into<String>) -> DeviceBuilder {
        DeviceBuilder {
            name: name.into(),
            registry: CapabilityRegistry::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Supervisor-side kill: cancels periodic invocations and flips the
    /// running flag. The transport's own teardown is separate (and
    /// idempotent); the serve loop winds down without closing the socket.
    pub async fn kill(&self) {
        info!("[{}] Shutting down", self.name);
        self.running.store(false, Ordering::SeqCst);
        let streams = match self.streams.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(streams) = streams {
            streams.stop_all().await;
        }
        self.kill_notify.notify_one();
    }

    /// Binds the configured port and serves the one peer connection.
    pub async fn serve(&self) -> VcapResult<()> {
        let listener = TransportListener::bind(self.settings.port).await?;
        self.serve_on(listener).await
    }

    /// Accepts one peer on an already-bound listener and runs the device
    /// until the peer disconnects, a `kill` is exchanged, or the supervisor
    /// calls [`Device::kill`].
    pub async fn serve_on(&self, listener: TransportListener) -> VcapResult<()> {
        let transport = Arc::new(listener.accept().await?);
        let uri = format!("{}-{}", self.name, Uuid::new_v4().simple());
        let invocations = Arc::new(InvocationTable::new(self.name.clone(), uri));
        let ctx = Arc::new(DeviceContext::new(
            self.name.clone(),
            transport.clone(),
            invocations.clone(),
        ));

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let streams = Arc::new(StreamTable::new(self.name.clone(), queue_tx.clone()));
        match self.streams.lock() {
            Ok(mut guard) => *guard = Some(streams.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(streams.clone()),
        }

        let runtime = CapabilityRuntime::new(ctx, self.registry.clone(), streams.clone());
        let shutdown = Arc::new(Notify::new());
        let dispatch = tokio::spawn(runtime.dispatch_loop(queue_rx, shutdown.clone()));

        transport.set_state(ConnectionState::Running);
        self.running.store(true, Ordering::SeqCst);
        info!("[{}] Device running, peer {}", self.name, transport.peer());

        // Receiving a kill (or losing the peer) closes the transport; a
        // supervisor kill leaves it to the caller.
        let mut close_transport = false;
        loop {
            tokio::select! {
                _ = self.kill_notify.notified() => {
                    info!("[{}] Kill requested by supervisor", self.name);
                    break;
                }
                frame = transport.recv_frame() => match frame {
                    Ok(WireFrame::Kill) => {
                        info!("[{}] Received kill signal from peer", self.name);
                        close_transport = true;
                        break;
                    }
                    Ok(WireFrame::Json(bytes)) => {
                        self.route_frame(&bytes, &queue_tx, &invocations).await;
                    }
                    Err(e) => {
                        warn!("[{}] {}", self.name, e);
                        close_transport = true;
                        break;
                    }
                }
            }
        }

        // Stop dispatching queued commands, then cancel timers and pending
        // waits before the transport goes away.
        shutdown.notify_one();
        streams.stop_all().await;
        invocations.cancel_all().await;
        self.running.store(false, Ordering::SeqCst);
        if close_transport {
            transport.kill().await;
        }
        let _ = dispatch.await;
        match self.streams.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        info!("[{}] Device stopped", self.name);
        Ok(())
    }

    /// Routes one received JSON frame: triggers join the dispatch queue,
    /// responses go straight to the correlation resolver, anything else is
    /// logged and skipped.
    async fn route_frame(
        &self,
        bytes: &[u8],
        queue_tx: &mpsc::Sender<Command>,
        invocations: &InvocationTable,
    ) {
        let command = match Command::from_slice(bytes) {
            Ok(command) => command,
            Err(e) => {
                warn!("[{}] {}", self.name, e);
                return;
            }
        };
        match command.kind {
            CommandType::Trigger => {
                debug!(
                    "[{}] Queueing trigger for {}",
                    self.name, command.capability
                );
                if queue_tx.send(command).await.is_err() {
                    warn!("[{}] Dispatch queue closed, dropping trigger", self.name);
                }
            }
            CommandType::Response => match command.src.as_deref() {
                Some(src) => {
                    let parameters = command.parameters.clone().unwrap_or_default();
                    invocations.resolve(src, parameters).await;
                }
                None => {
                    warn!(
                        "[{}] Response without correlation id, dropping",
                        self.name
                    );
                }
            },
        }
    }
}
