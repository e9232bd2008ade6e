// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! Control plane of a WireGuard-based overlay mesh.
//!
//! Every machine runs this crate's [`Mesh`] orchestrator: it brings up the
//! tunnel, starts the distributed registry store, and runs a convergence
//! loop that keeps the tunnel's peer list matched to the registry's
//! `machines` table, probing handshakes and rotating candidate endpoints
//! for peers that stay silent. Platform specifics (the tunnel adapters, the
//! store daemon, outer CLI/RPC surfaces) live behind the capability traits
//! exported here.

mod broker;
mod context;
mod convergence;
mod error;
mod heartbeat;
mod machines;
mod mesh;
mod metrics;
mod peer_state;
mod planner;
mod record;
mod store_client;
mod store_health;
mod store_runtime;
mod wireguard;

pub use broker::{BrokerSubscription, SubscriptionBroker};
pub use convergence::{apply_event, Convergence, ConvergenceLoop, HealthSummary};
pub use error::{MeshError, MeshResult};
pub use machines::{
    MachineRepository, MachineSource, MachineWriter, MACHINES_SCHEMA,
};
pub use mesh::{Mesh, Phase};
pub use peer_state::{PeerHealth, PeerState};
pub use planner::{FullMeshPlanner, MeshPlanner};
pub use record::{MachineEvent, MachineRecord};
pub use store_client::{
    ExecResult, Statement, StoreChange, StoreChangeKind, StoreClient, Subscription,
};
pub use store_health::{
    classify_phase, expected_members, HealthPhase, StoreHealth, StoreHealthClient,
    StoreHealthSnapshot,
};
pub use store_runtime::StoreRuntime;
pub use wireguard::{HandshakeProber, Tunnel};
