// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::error::MeshResult;

/// Lifecycle of the registry store daemon backing this machine.
///
/// The daemon itself (its config rendering, supervision, packaging) lives
/// outside this crate; the orchestrator only needs to start it before the
/// convergence loop subscribes and stop it during teardown. Both operations
/// are idempotent.
#[async_trait]
pub trait StoreRuntime: Send + Sync + 'static {
    async fn start(&self) -> MeshResult<()>;

    async fn stop(&self) -> MeshResult<()>;
}
