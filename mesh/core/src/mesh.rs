// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle orchestration of the mesh: the tunnel, the registry store, and
//! the convergence loop brought up and torn down as one unit.
//!
//! `up` runs the ordered startup and then blocks on the bootstrap gate
//! until the mesh is safely joinable. `detach` stops only the control plane
//! so a daemon restart never interrupts overlay traffic. `destroy` is the
//! full reverse teardown and the cleanup path after a partial `up`; there
//! is no rollback inside `up` itself.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::Context;
use crate::convergence::Convergence;
use crate::error::{MeshError, MeshResult};
use crate::heartbeat::{own_machine_record, HeartbeatHandle, HeartbeatWriter};
use crate::machines::MachineWriter;
use crate::store_health::StoreHealth;
use crate::store_runtime::StoreRuntime;
use crate::wireguard::Tunnel;

/// Passes of the bootstrap gate required before the mesh counts as synced.
const BOOTSTRAP_CONSECUTIVE_PASSES: u32 = 2;

/// Lifecycle phase of the mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Bootstrapping,
    Running,
    Stopping,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Phase::Stopped => "stopped",
            Phase::Starting => "starting",
            Phase::Bootstrapping => "bootstrapping",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
        };
        f.write_str(phase)
    }
}

/// Which components a previous `up` actually started. `destroy` only tears
/// down what was started; components that never came up are not stopped.
#[derive(Default)]
struct Started {
    tunnel: bool,
    store: bool,
    convergence: bool,
}

pub struct Mesh {
    context: Arc<Context>,
    tunnel: Arc<dyn Tunnel>,
    store: Arc<dyn StoreRuntime>,
    convergence: Option<Arc<dyn Convergence>>,
    store_health: Option<Arc<dyn StoreHealth>>,
    registry: Option<Arc<dyn MachineWriter>>,
    phase: Mutex<Phase>,
    started: Mutex<Started>,
    heartbeat: tokio::sync::Mutex<Option<HeartbeatHandle>>,
}

impl Mesh {
    /// Composes a mesh from the persisted identity, configuration, and the
    /// platform adapters: the store client, machine repository, store
    /// health checker, and the convergence loop are built and wired here.
    pub fn build(
        identity: &mesh_config::MachineIdentity,
        parameters: mesh_config::Parameters,
        registry: &prometheus::Registry,
        tunnel: Arc<dyn Tunnel>,
        prober: Option<Arc<dyn crate::wireguard::HandshakeProber>>,
        store: Arc<dyn StoreRuntime>,
    ) -> MeshResult<Self> {
        let context = Arc::new(Context::new(
            identity.keypair.public(),
            identity.name.clone(),
            parameters,
            crate::metrics::initialise_metrics(registry),
        ));
        let store_client = Arc::new(crate::store_client::StoreClient::new(context.clone())?);
        let machines = Arc::new(crate::machines::MachineRepository::new(store_client));
        let convergence = Arc::new(crate::convergence::ConvergenceLoop::new(
            context.clone(),
            machines.clone(),
            Arc::new(crate::planner::FullMeshPlanner),
            tunnel.clone(),
            prober,
        ));
        let store_health = Arc::new(crate::store_health::StoreHealthClient::new(context.clone())?);
        Ok(Mesh::new(
            context,
            tunnel,
            store,
            Some(convergence),
            Some(store_health),
            Some(machines),
        ))
    }

    /// The write handle for this machine's registry row, when configured.
    /// Outer surfaces (CLI, RPC) use it for machine CRUD.
    pub fn registry(&self) -> Option<Arc<dyn MachineWriter>> {
        self.registry.clone()
    }

    pub(crate) fn new(
        context: Arc<Context>,
        tunnel: Arc<dyn Tunnel>,
        store: Arc<dyn StoreRuntime>,
        convergence: Option<Arc<dyn Convergence>>,
        store_health: Option<Arc<dyn StoreHealth>>,
        registry: Option<Arc<dyn MachineWriter>>,
    ) -> Self {
        Self {
            context,
            tunnel,
            store,
            convergence,
            store_health,
            registry,
            phase: Mutex::new(Phase::Stopped),
            started: Mutex::new(Started::default()),
            heartbeat: tokio::sync::Mutex::new(None),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Moves to `to`, panicking when the current phase is not one of
    /// `allowed`: an illegal transition is a bug in the caller, not an
    /// operational condition.
    fn advance(&self, allowed: &[Phase], to: Phase) {
        let mut phase = self.phase.lock();
        assert!(
            allowed.contains(&*phase),
            "illegal mesh phase transition {} -> {}",
            *phase,
            to
        );
        info!(from = %phase, to = %to, "mesh phase transition");
        *phase = to;
    }

    /// Ordered startup: tunnel, store runtime, self-registration and
    /// heartbeat, convergence, then the bootstrap gate. A failing step
    /// leaves earlier components running; `destroy` is the cleanup path.
    pub async fn up(&self, cancel: CancellationToken) -> MeshResult<()> {
        self.advance(&[Phase::Stopped], Phase::Starting);

        if let Err(e) = self.tunnel.up().await {
            self.advance(&[Phase::Starting], Phase::Stopped);
            return Err(e);
        }
        self.started.lock().tunnel = true;

        if let Err(e) = self.store.start().await {
            self.advance(&[Phase::Starting], Phase::Stopped);
            return Err(e);
        }
        self.started.lock().store = true;

        if let Some(registry) = &self.registry {
            // Peers only learn about this machine from its row; a failed
            // registration is retried by the heartbeat.
            if let Err(e) = self.register_self(registry).await {
                warn!(error = %e, "failed to register this machine, heartbeat will retry");
            }
            let heartbeat =
                HeartbeatWriter::new(self.context.clone(), registry.clone()).start();
            *self.heartbeat.lock().await = Some(heartbeat);
        }

        if let Some(convergence) = &self.convergence {
            if let Err(e) = convergence.start().await {
                self.advance(&[Phase::Starting], Phase::Stopped);
                return Err(e);
            }
            self.started.lock().convergence = true;
        }

        self.advance(&[Phase::Starting], Phase::Bootstrapping);
        match self.bootstrap_gate(&cancel).await {
            Ok(()) => {
                self.advance(&[Phase::Bootstrapping], Phase::Running);
                info!("mesh is up");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Writes this machine's row and purges stale rows that still publish
    /// one of its endpoints under an old identity.
    async fn register_self(&self, registry: &Arc<dyn MachineWriter>) -> MeshResult<()> {
        let record = own_machine_record(&self.context);
        let current_version = registry
            .get(&record.id)
            .await?
            .map(|row| row.version)
            .unwrap_or(0);
        registry.upsert(&record, current_version).await?;
        for endpoint in &self.context.parameters.advertise_endpoints {
            let purged = registry
                .delete_by_endpoint_except_id(endpoint, &record.id)
                .await?;
            if purged > 0 {
                info!(%endpoint, purged, "purged stale machines sharing an endpoint");
            }
        }
        Ok(())
    }

    /// Waits until the mesh is safely joinable.
    ///
    /// The gate passes immediately when there is nothing to check, passes
    /// once no reachable peers exist (nothing to sync against), and
    /// otherwise requires the store to report gap-free replication on
    /// consecutive polls. Parent cancellation propagates verbatim, never as
    /// a timeout.
    async fn bootstrap_gate(&self, cancel: &CancellationToken) -> MeshResult<()> {
        if self.convergence.is_none() && self.store_health.is_none() {
            return Ok(());
        }

        let started = Instant::now();
        let timeout = self.context.parameters.bootstrap_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(MeshError::Cancelled),
            result = tokio::time::timeout(timeout, self.poll_gate()) => match result {
                Ok(result) => result,
                Err(_) => Err(MeshError::BootstrapTimeout(started.elapsed())),
            },
        }
    }

    async fn poll_gate(&self) -> MeshResult<()> {
        let mut poll = tokio::time::interval(self.context.parameters.bootstrap_poll_interval);
        let mut consecutive_passes = 0;
        loop {
            poll.tick().await;
            self.context.metrics.node_metrics.bootstrap_gate_polls.inc();

            if let Some(convergence) = &self.convergence {
                let summary = convergence.summary();
                if !summary.initialized {
                    continue;
                }
                if !summary.has_reachable_peers() {
                    // Single node, or nobody alive: nothing to sync against.
                    return Ok(());
                }
            }

            let Some(store_health) = &self.store_health else {
                return Err(MeshError::InvalidConfig(
                    "reachable peers exist but no store health checker is configured"
                        .to_string(),
                ));
            };
            match store_health.healthy().await {
                Ok(true) => {
                    consecutive_passes += 1;
                    if consecutive_passes >= BOOTSTRAP_CONSECUTIVE_PASSES {
                        return Ok(());
                    }
                }
                Ok(false) => consecutive_passes = 0,
                Err(e) => {
                    warn!(error = %e, "store health poll failed");
                    consecutive_passes = 0;
                }
            }
        }
    }

    /// Stops the control plane only. The tunnel and the store keep running,
    /// so overlay traffic survives a daemon restart.
    pub async fn detach(&self) -> MeshResult<()> {
        self.advance(&[Phase::Running, Phase::Bootstrapping], Phase::Stopping);

        if let Some(heartbeat) = self.heartbeat.lock().await.take() {
            heartbeat.stop().await;
        }
        if let Some(convergence) = &self.convergence {
            convergence.stop().await;
        }
        self.started.lock().convergence = false;

        self.advance(&[Phase::Stopping], Phase::Stopped);
        info!("mesh detached, tunnel left running");
        Ok(())
    }

    /// Reverse teardown of every component a previous `up` started.
    /// Continues through errors and returns the first one; the end state is
    /// always `Stopped`. Safe after a partial `up`.
    pub async fn destroy(&self) -> MeshResult<()> {
        {
            let mut phase = self.phase.lock();
            info!(from = %phase, "destroying mesh");
            *phase = Phase::Stopping;
        }

        let mut first_error = None;

        if let Some(heartbeat) = self.heartbeat.lock().await.take() {
            heartbeat.stop().await;
        }

        if self.started.lock().convergence {
            if let Some(convergence) = &self.convergence {
                convergence.stop().await;
            }
            self.started.lock().convergence = false;
        }

        if self.started.lock().store {
            if let Err(e) = self.store.stop().await {
                warn!(error = %e, "store runtime failed to stop");
                first_error.get_or_insert(e);
            }
            self.started.lock().store = false;
        }

        if self.started.lock().tunnel {
            if let Err(e) = self.tunnel.down().await {
                warn!(error = %e, "tunnel failed to come down");
                first_error.get_or_insert(e);
            }
            self.started.lock().tunnel = false;
        }

        self.advance(&[Phase::Stopping], Phase::Stopped);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
