// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! Point-in-time classification of the store's replication state.

use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::context::Context;
use crate::error::{MeshError, MeshResult};

/// The gap checker consulted by the bootstrap gate: true when the store's
/// replication currently satisfies the configured thresholds.
#[async_trait]
pub trait StoreHealth: Send + Sync + 'static {
    async fn healthy(&self) -> MeshResult<bool>;
}

/// Process-level health of the store, as observed from this machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthPhase {
    /// The health endpoint did not answer.
    Unreachable,
    /// Fewer cluster members than expected have been seen.
    Forming,
    /// Members are all present but replication is still catching up.
    Syncing,
    Ready,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StoreHealthSnapshot {
    #[serde(default)]
    pub gaps: u64,
    #[serde(default)]
    pub members: u64,
    #[serde(default)]
    pub p99_lag: f64,
    #[serde(default)]
    pub queue_size: u64,
    /// Whether the configured thresholds held at observation time.
    #[serde(skip)]
    pub thresholds_met: bool,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    response: StoreHealthSnapshot,
}

/// Classifies the store's phase from an observation (or its absence).
pub fn classify_phase(
    snapshot: Option<&StoreHealthSnapshot>,
    expected_members: u64,
) -> HealthPhase {
    match snapshot {
        None => HealthPhase::Unreachable,
        Some(snapshot) if snapshot.members < expected_members => HealthPhase::Forming,
        Some(snapshot)
            if !snapshot.thresholds_met || snapshot.gaps > 0 || snapshot.queue_size > 0 =>
        {
            HealthPhase::Syncing
        }
        Some(_) => HealthPhase::Ready,
    }
}

/// How many cluster members this machine expects to see: itself plus its
/// bootstrap peers, or every registered machine, whichever is larger.
pub fn expected_members(bootstrap_peers: usize, machine_rows: usize) -> u64 {
    1.max(bootstrap_peers + 1).max(machine_rows) as u64
}

/// Client for the store's `/v1/health` endpoint.
pub struct StoreHealthClient {
    context: Arc<Context>,
    http: reqwest::Client,
    api_base: Url,
}

impl StoreHealthClient {
    pub(crate) fn new(context: Arc<Context>) -> MeshResult<Self> {
        let api_base = Url::parse(&context.parameters.store_api_addr)
            .map_err(|e| MeshError::InvalidConfig(format!("store_api_addr: {e}")))?;
        Ok(Self {
            context,
            http: reqwest::Client::new(),
            api_base,
        })
    }

    fn health_url(&self) -> MeshResult<Url> {
        let mut url = self
            .api_base
            .join("v1/health")
            .map_err(|e| MeshError::InvalidConfig(format!("store url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("gaps", &self.context.parameters.store_max_gaps.to_string())
            .append_pair(
                "queue_size",
                &self.context.parameters.store_max_queue_size.to_string(),
            );
        Ok(url)
    }

    /// Observes the current replication state. `None` when the endpoint is
    /// unreachable.
    pub async fn snapshot(&self) -> Option<StoreHealthSnapshot> {
        let url = self.health_url().ok()?;
        let response = self.http.get(url).send().await.ok()?;
        let thresholds_met = response.status() == StatusCode::OK;
        let body: HealthBody = response.json().await.ok()?;
        let mut snapshot = body.response;
        snapshot.thresholds_met = thresholds_met;
        Some(snapshot)
    }

    /// Classifies the store against the expected member count.
    pub async fn phase(&self, expected_members: u64) -> HealthPhase {
        classify_phase(self.snapshot().await.as_ref(), expected_members)
    }
}

#[async_trait]
impl StoreHealth for StoreHealthClient {
    async fn healthy(&self) -> MeshResult<bool> {
        let url = self.health_url()?;
        let response = self.http.get(url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::SERVICE_UNAVAILABLE => Ok(false),
            status => Err(MeshError::Store(format!(
                "health endpoint returned {status}"
            ))),
        }
    }
}
