//! Per-entry forwarder lifecycle
//!
//! One listener per fleet entry, relaying accepted connections to the
//! entry's upstream endpoint. Start resolves "port already bound" by
//! stopping the stale owner and retrying exactly once.

use crate::error::{FleetError, Result};
use crate::registry::{FleetRegistry, RunningForwarder};
use crate::relay::RelayMode;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pause after stopping our own stale instance before rebinding
const SAME_ID_RETRY_PAUSE: Duration = Duration::from_millis(300);
/// Pause after stopping a conflicting owner before rebinding
const CONFLICT_RETRY_PAUSE: Duration = Duration::from_millis(500);
/// Pause between stop and start during a restart, letting the OS
/// release the port
const RESTART_PAUSE: Duration = Duration::from_millis(200);
/// Deadline for an accept loop to exit after shutdown is signalled
const HALT_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts, stops and restarts forwarder listeners, keeping the registry
/// in sync with what is actually bound.
pub struct Forwarder {
    registry: Arc<FleetRegistry>,
    mode: RelayMode,
    bind_addr: String,
}

impl Forwarder {
    pub fn new(registry: Arc<FleetRegistry>, mode: RelayMode) -> Self {
        Self {
            registry,
            mode,
            bind_addr: "0.0.0.0".to_string(),
        }
    }

    /// Override the listener bind address (tests bind loopback)
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    pub fn registry(&self) -> &Arc<FleetRegistry> {
        &self.registry
    }

    /// Bind a listener for the entry and register it. A bind conflict is
    /// recovered once: either our own stale instance or the registered
    /// owner of the port is stopped, then the bind is retried with
    /// recovery disabled.
    pub async fn start(&self, entry_id: u64, port: u16, upstream: &str) -> Result<()> {
        self.start_inner(entry_id, port, upstream, true).await
    }

    async fn start_inner(&self, entry_id: u64, port: u16, upstream: &str, recover: bool) -> Result<()> {
        let addr = format!("{}:{}", self.bind_addr, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if !recover {
                    return Err(FleetError::PortUnavailable(port));
                }

                if self.registry.is_running(entry_id).await {
                    warn!(entry_id, port, "Forwarder already registered, stopping old instance");
                    self.stop(entry_id).await;
                    tokio::time::sleep(SAME_ID_RETRY_PAUSE).await;
                    return Box::pin(self.start_inner(entry_id, port, upstream, false)).await;
                }

                match self.registry.port_owner(port, entry_id).await {
                    Some(owner) => {
                        warn!(entry_id, port, owner, "Port held by conflicting forwarder, stopping it");
                        self.stop(owner).await;
                        tokio::time::sleep(CONFLICT_RETRY_PAUSE).await;
                        return Box::pin(self.start_inner(entry_id, port, upstream, false)).await;
                    }
                    None => {
                        return Err(FleetError::PortUnavailable(port));
                    }
                }
            }
            Err(e) => {
                return Err(FleetError::Connect { addr, source: e });
            }
        };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mode = self.mode;
        let upstream_owned = upstream.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                debug!(port, peer = %peer, "Client connection accepted");
                                let upstream = upstream_owned.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = mode.handle_client(stream, &upstream).await {
                                        debug!(port, error = %e, "Relay session ended");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(port, error = %e, "Failed to accept connection");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let previous = self
            .registry
            .register(
                entry_id,
                RunningForwarder {
                    port,
                    upstream: upstream.to_string(),
                    shutdown: shutdown_tx,
                    task,
                },
            )
            .await;
        if let Some(previous) = previous {
            halt(previous).await;
        }

        info!(entry_id, port, upstream, "Forwarder started");
        Ok(())
    }

    /// Stop the entry's forwarder. A no-op when nothing is registered.
    pub async fn stop(&self, entry_id: u64) {
        if let Some(forwarder) = self.registry.remove(entry_id).await {
            let port = forwarder.port;
            halt(forwarder).await;
            info!(entry_id, port, "Forwarder stopped");
        }
    }

    /// Stop, wait for the OS to release the port, then start with the
    /// new upstream. A failed start leaves the entry unregistered.
    pub async fn restart(&self, entry_id: u64, port: u16, upstream: &str) -> Result<()> {
        self.stop(entry_id).await;
        tokio::time::sleep(RESTART_PAUSE).await;
        self.start(entry_id, port, upstream).await
    }

    pub async fn is_running(&self, entry_id: u64) -> bool {
        self.registry.is_running(entry_id).await
    }

    /// Stop every registered forwarder, in any order, tolerating
    /// individual failures
    pub async fn stop_all(&self) {
        let drained = self.registry.drain().await;
        join_all(drained.into_iter().map(|(entry_id, forwarder)| async move {
            let port = forwarder.port;
            halt(forwarder).await;
            info!(entry_id, port, "Forwarder stopped");
        }))
        .await;
    }
}

/// Signal an accept loop to exit and wait for it, bounded
async fn halt(forwarder: RunningForwarder) {
    let _ = forwarder.shutdown.send(true);
    if tokio::time::timeout(HALT_TIMEOUT, forwarder.task).await.is_err() {
        warn!(port = forwarder.port, "Accept loop did not exit in time");
    }
}
