// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

pub(crate) struct Metrics {
    pub node_metrics: NodeMetrics,
}

pub(crate) struct NodeMetrics {
    /// Peers known to the convergence loop, labelled by health class.
    pub peers_by_health: IntGaugeVec,
    /// Total peers in the current plan.
    pub planned_peers: IntGauge,
    pub reconcile_total: IntCounter,
    pub reconcile_failures: IntCounter,
    pub probe_failures: IntCounter,
    pub endpoint_rotations: IntCounter,
    /// Resubscription attempts, labelled by outcome.
    pub resubscribe_attempts: IntCounterVec,
    pub bootstrap_gate_polls: IntCounter,
    pub heartbeat_failures: IntCounter,
}

impl NodeMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            peers_by_health: register_int_gauge_vec_with_registry!(
                "mesh_peers_by_health",
                "Peers known to the convergence loop by health class",
                &["health"],
                registry
            )
            .unwrap(),
            planned_peers: register_int_gauge_with_registry!(
                "mesh_planned_peers",
                "Peers in the current mesh plan",
                registry
            )
            .unwrap(),
            reconcile_total: register_int_counter_with_registry!(
                "mesh_reconcile_total",
                "Peer-set writes issued to the tunnel backend",
                registry
            )
            .unwrap(),
            reconcile_failures: register_int_counter_with_registry!(
                "mesh_reconcile_failures",
                "Peer-set writes that failed",
                registry
            )
            .unwrap(),
            probe_failures: register_int_counter_with_registry!(
                "mesh_probe_failures",
                "Handshake probes that failed",
                registry
            )
            .unwrap(),
            endpoint_rotations: register_int_counter_with_registry!(
                "mesh_endpoint_rotations",
                "Endpoint rotations performed after handshake timeouts",
                registry
            )
            .unwrap(),
            resubscribe_attempts: register_int_counter_vec_with_registry!(
                "mesh_resubscribe_attempts",
                "Subscription resume attempts by outcome",
                &["outcome"],
                registry
            )
            .unwrap(),
            bootstrap_gate_polls: register_int_counter_with_registry!(
                "mesh_bootstrap_gate_polls",
                "Bootstrap gate poll iterations",
                registry
            )
            .unwrap(),
            heartbeat_failures: register_int_counter_with_registry!(
                "mesh_heartbeat_failures",
                "Heartbeat row refreshes that failed",
                registry
            )
            .unwrap(),
        }
    }
}

pub(crate) fn initialise_metrics(registry: &Registry) -> Arc<Metrics> {
    Arc::new(Metrics {
        node_metrics: NodeMetrics::new(registry),
    })
}

#[cfg(test)]
pub(crate) fn test_metrics() -> Arc<Metrics> {
    initialise_metrics(&Registry::new())
}
