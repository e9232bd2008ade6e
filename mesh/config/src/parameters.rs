// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::Endpoint;

/// Operational configuration of a mesh daemon.
///
/// All fields tolerate differing values across machines; nothing here has to
/// agree cluster-wide for the mesh to converge.
///
/// NOTE: default values should make sense, so most operators should not need
/// to specify any field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// Base URL of the registry store's HTTP API.
    #[serde(default = "Parameters::default_store_api_addr")]
    pub store_api_addr: String,

    /// Endpoints this machine publishes in its registry row, most preferred
    /// first.
    #[serde(default)]
    pub advertise_endpoints: Vec<Endpoint>,

    /// Gossip addresses of the machines used to join the cluster. Only
    /// consulted for the expected-member count of the health surface.
    #[serde(default)]
    pub bootstrap_peers: Vec<Endpoint>,

    /// How long a single endpoint is given to produce a handshake before the
    /// convergence loop rotates to the next candidate.
    #[serde(default = "Parameters::default_endpoint_timeout")]
    pub endpoint_timeout: Duration,

    /// Maximum age of a tunnel handshake for a peer to count as alive.
    /// Derived from the keepalive and handshake-timeout arithmetic of the
    /// tunnel protocol.
    #[serde(default = "Parameters::default_alive_freshness")]
    pub alive_freshness: Duration,

    /// Interval between handshake probes of the tunnel backend.
    #[serde(default = "Parameters::default_probe_interval")]
    pub probe_interval: Duration,

    /// Interval between polls of the bootstrap gate.
    #[serde(default = "Parameters::default_bootstrap_poll_interval")]
    pub bootstrap_poll_interval: Duration,

    /// How long `Up` waits for the bootstrap gate before giving up.
    #[serde(default = "Parameters::default_bootstrap_timeout")]
    pub bootstrap_timeout: Duration,

    /// Interval between refreshes of this machine's own registry row.
    #[serde(default = "Parameters::default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Replication gaps tolerated before the store counts as unhealthy.
    #[serde(default)]
    pub store_max_gaps: u64,

    /// Pending apply-queue length tolerated before the store counts as
    /// unhealthy.
    #[serde(default = "Parameters::default_store_max_queue_size")]
    pub store_max_queue_size: u64,

    /// The data directory. Holds the persisted identity; must be provided
    /// for the daemon to boot.
    pub data_dir: Option<PathBuf>,
}

impl Parameters {
    pub fn default_store_api_addr() -> String {
        "http://127.0.0.1:8787".to_string()
    }

    pub fn default_endpoint_timeout() -> Duration {
        Duration::from_secs(15)
    }

    pub fn default_alive_freshness() -> Duration {
        Duration::from_secs(275)
    }

    pub fn default_probe_interval() -> Duration {
        Duration::from_secs(1)
    }

    pub fn default_bootstrap_poll_interval() -> Duration {
        Duration::from_secs(2)
    }

    pub fn default_bootstrap_timeout() -> Duration {
        Duration::from_secs(60)
    }

    pub fn default_heartbeat_interval() -> Duration {
        Duration::from_secs(300)
    }

    pub fn default_store_max_queue_size() -> u64 {
        100
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            store_api_addr: Parameters::default_store_api_addr(),
            advertise_endpoints: vec![],
            bootstrap_peers: vec![],
            endpoint_timeout: Parameters::default_endpoint_timeout(),
            alive_freshness: Parameters::default_alive_freshness(),
            probe_interval: Parameters::default_probe_interval(),
            bootstrap_poll_interval: Parameters::default_bootstrap_poll_interval(),
            bootstrap_timeout: Parameters::default_bootstrap_timeout(),
            heartbeat_interval: Parameters::default_heartbeat_interval(),
            store_max_gaps: 0,
            store_max_queue_size: Parameters::default_store_max_queue_size(),
            data_dir: None,
        }
    }
}
