// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! Capability seams for the tunnel backend.
//!
//! Platform adapters (kernel netlink, userspace netstack, container-hosted)
//! live outside this crate and implement these traits. The convergence loop
//! and the orchestrator only ever see the capability set, which keeps them
//! testable against in-memory fakes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use mesh_config::MachinePublicKey;
use tokio::time::Instant;

use crate::error::MeshResult;
use crate::record::MachineRecord;

/// Lifecycle and peer-set control of the local tunnel interface.
///
/// `set_peers` replaces the full peer list; the first endpoint of each
/// record is the one the backend dials. Writes are serialized by the
/// convergence loop, so implementations do not need internal ordering.
#[async_trait]
pub trait Tunnel: Send + Sync + 'static {
    async fn up(&self) -> MeshResult<()>;

    async fn set_peers(&self, peers: Vec<MachineRecord>) -> MeshResult<()>;

    async fn down(&self) -> MeshResult<()>;
}

/// Read side of the tunnel: the latest handshake per configured peer.
///
/// `None` means the peer has never completed a handshake. Kept separate
/// from [`Tunnel`] so the convergence loop can run event-only when no
/// prober is configured.
#[async_trait]
pub trait HandshakeProber: Send + Sync + 'static {
    async fn peer_handshakes(&self) -> MeshResult<BTreeMap<MachinePublicKey, Option<Instant>>>;
}
