//! Reconciliation between the configuration store and the running server.
//!
//! # Responsibilities
//! - Start the first server instance
//! - Turn every burst of store changes into one snapshot rebuild
//! - Pick between an in-place snapshot swap and a graceful restart
//! - Hand unchanged sockets to the new instance and drain the old one
//! - Report failures without disturbing the serving instance

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;

use crate::config::ProxyConfig;
use crate::http::{DrainOutcome, Server, ServerSettings};
use crate::net::{BoundListener, ListenerError};
use crate::observability::metrics;
use crate::routing::{BuildContext, RoutingSnapshot, SnapshotError};
use crate::store::{ConfigStore, ListenerKey, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read topology: {0}")]
    Store(#[from] StoreError),

    #[error("failed to build routing snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("failed to bind listener {key}: {source}")]
    Bind {
        key: ListenerKey,
        #[source]
        source: ListenerError,
    },
}

impl ReconcileError {
    fn metric_label(&self) -> &'static str {
        match self {
            ReconcileError::Store(_) => "store_error",
            ReconcileError::Snapshot(_) => "build_error",
            ReconcileError::Bind { .. } => "bind_failure",
        }
    }
}

/// What a successful reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The serving instance now uses the new snapshot.
    Swapped { version: u64 },
    /// A new instance took over; the previous one is draining.
    Restarted { version: u64, instance: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub coalesce_window: Duration,
    pub drain_timeout: Duration,
    pub max_connections: usize,
    pub server: ServerSettings,
}

impl SupervisorSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            coalesce_window: config.supervisor.coalesce_window(),
            drain_timeout: config.supervisor.drain_timeout(),
            max_connections: config.listener.max_connections,
            server: ServerSettings {
                tls_handshake_timeout: Duration::from_secs(config.listener.tls_handshake_timeout_secs),
            },
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// Owns the serving instance and keeps it in line with the store.
pub struct Supervisor {
    store: Arc<dyn ConfigStore>,
    ctx: BuildContext,
    settings: SupervisorSettings,
    current: watch::Sender<Option<Arc<Server>>>,
    draining: JoinSet<DrainOutcome>,
    errors: Option<mpsc::UnboundedSender<ReconcileError>>,
    last_version: u64,
    last_instance: u64,
}

impl Supervisor {
    pub fn new(store: Arc<dyn ConfigStore>, ctx: BuildContext, settings: SupervisorSettings) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            store,
            ctx,
            settings,
            current,
            draining: JoinSet::new(),
            errors: None,
            last_version: 0,
            last_instance: 0,
        }
    }

    /// Forward every failed reconciliation to `errors`.
    pub fn with_error_channel(mut self, errors: mpsc::UnboundedSender<ReconcileError>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Observe the serving instance as it is replaced.
    pub fn watch_current(&self) -> watch::Receiver<Option<Arc<Server>>> {
        self.current.subscribe()
    }

    pub fn current(&self) -> Option<Arc<Server>> {
        self.current.borrow().clone()
    }

    /// Number of replaced instances still draining.
    pub fn draining_count(&self) -> usize {
        self.draining.len()
    }

    /// Build and start the first instance.
    pub async fn start(&mut self) -> Result<Arc<Server>, ReconcileError> {
        let snapshot = self.build_snapshot()?;
        let mut listeners = Vec::with_capacity(snapshot.listener_keys().len());
        for key in snapshot.listener_keys() {
            listeners.push(self.bind(key).await?);
        }
        Ok(self.launch(snapshot, listeners))
    }

    /// Bring the serving instance in line with the current topology.
    pub async fn reconcile(&mut self) -> Result<ReconcileOutcome, ReconcileError> {
        self.reap_drained();

        let Some(current) = self.current() else {
            let server = self.start().await?;
            return Ok(ReconcileOutcome::Restarted {
                version: server.snapshot().version(),
                instance: server.id(),
            });
        };

        let snapshot = self.build_snapshot()?;
        let version = snapshot.version();
        let owned = current.listener_keys();
        let wanted = snapshot.listener_keys().clone();

        if owned == wanted {
            current.swap_snapshot(snapshot);
            return Ok(ReconcileOutcome::Swapped { version });
        }

        // Bind first: a failure here must leave the current instance untouched.
        let mut listeners = Vec::with_capacity(wanted.len());
        for key in wanted.difference(&owned) {
            listeners.push(self.bind(key).await?);
        }

        let kept: BTreeSet<ListenerKey> = wanted.intersection(&owned).cloned().collect();
        listeners.extend(current.release(&kept).await);

        let server = self.launch(snapshot, listeners);

        let deadline = self.settings.drain_timeout;
        let added = wanted.difference(&owned).count();
        let removed = owned.difference(&wanted).count();
        tracing::info!(
            old_instance = current.id(),
            new_instance = server.id(),
            kept = kept.len(),
            added,
            removed,
            "Listener set changed, restarted server instance"
        );
        self.draining.spawn(async move { current.drain(deadline).await });

        Ok(ReconcileOutcome::Restarted {
            version,
            instance: server.id(),
        })
    }

    /// Start, then follow the change feed until `shutdown` fires.
    ///
    /// Only a failure of the first start is returned.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ReconcileError> {
        // Subscribe before reading the topology so nothing slips between.
        let mut feed = self.store.subscribe();
        self.start().await?;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                change = feed.next() => {
                    let Some(change) = change else {
                        tracing::warn!("Change feed closed, waiting for shutdown");
                        let _ = shutdown.recv().await;
                        break;
                    };
                    tracing::debug!(
                        seq = change.seq,
                        kind = ?change.kind,
                        entity = %change.entity,
                        id = %change.id,
                        "Configuration change"
                    );

                    let window = tokio::time::sleep(self.settings.coalesce_window);
                    tokio::pin!(window);
                    let mut coalesced = 1u64;
                    loop {
                        tokio::select! {
                            _ = &mut window => break,
                            next = feed.next() => match next {
                                Some(_) => coalesced += 1,
                                None => break,
                            },
                        }
                    }

                    self.reconcile_and_report(coalesced).await;
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Drain the serving instance and wait for every draining one.
    pub async fn stop(&mut self) {
        if let Some(current) = self.current.send_replace(None) {
            let outcome = current.drain(self.settings.drain_timeout).await;
            tracing::info!(instance = current.id(), outcome = ?outcome, "Supervisor stopped serving");
        }
        while let Some(result) = self.draining.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Drain task failed");
            }
        }
    }

    async fn reconcile_and_report(&mut self, coalesced: u64) {
        match self.reconcile().await {
            Ok(outcome) => {
                let label = match outcome {
                    ReconcileOutcome::Swapped { .. } => "swapped",
                    ReconcileOutcome::Restarted { .. } => "restarted",
                };
                metrics::record_reconciliation(label);
                tracing::info!(outcome = ?outcome, coalesced, "Reconciliation complete");
            }
            Err(e) => {
                metrics::record_reconciliation(e.metric_label());
                tracing::error!(error = %e, coalesced, "Reconciliation failed, keeping current configuration");
                if let Some(errors) = &self.errors {
                    let _ = errors.send(e);
                }
            }
        }
    }

    fn build_snapshot(&mut self) -> Result<Arc<RoutingSnapshot>, ReconcileError> {
        let topology = self.store.topology()?;
        let version = self.last_version + 1;
        let snapshot = RoutingSnapshot::build(&topology, &self.ctx, version)?;
        self.last_version = version;
        Ok(Arc::new(snapshot))
    }

    async fn bind(&self, key: &ListenerKey) -> Result<BoundListener, ReconcileError> {
        BoundListener::bind(key.clone(), self.settings.max_connections)
            .await
            .map_err(|source| {
                metrics::record_bind_failure();
                tracing::error!(listener = %key, error = %source, "Failed to bind listener");
                ReconcileError::Bind {
                    key: key.clone(),
                    source,
                }
            })
    }

    fn launch(&mut self, snapshot: Arc<RoutingSnapshot>, listeners: Vec<BoundListener>) -> Arc<Server> {
        self.last_instance += 1;
        let server = Arc::new(Server::new(self.last_instance, snapshot, self.settings.server));
        server.start(listeners);
        self.current.send_replace(Some(Arc::clone(&server)));
        server
    }

    fn reap_drained(&mut self) {
        while let Some(result) = self.draining.try_join_next() {
            match result {
                Ok(outcome) => tracing::debug!(outcome = ?outcome, "Drain finished"),
                Err(e) => tracing::error!(error = %e, "Drain task failed"),
            }
        }
    }
}
