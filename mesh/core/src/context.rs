// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use mesh_config::{MachinePublicKey, Parameters};

#[cfg(test)]
use crate::metrics::test_metrics;
use crate::metrics::Metrics;

/// Context carries the configuration and metrics shared by every component
/// of the daemon.
#[derive(Clone)]
pub(crate) struct Context {
    /// Public key of this machine; the registry id it owns.
    pub own_key: MachinePublicKey,
    /// Human label published in the registry row.
    pub own_name: String,
    pub parameters: Parameters,
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub(crate) fn new(
        own_key: MachinePublicKey,
        own_name: String,
        parameters: Parameters,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            own_key,
            own_name,
            parameters,
            metrics,
        }
    }

    /// Creates a test context with a fresh random identity.
    #[cfg(test)]
    pub(crate) fn new_for_test() -> (Self, mesh_config::MachineKeyPair) {
        let keypair = mesh_config::MachineKeyPair::generate(&mut rand::thread_rng());
        let context = Context::new(
            keypair.public(),
            "test-machine".to_string(),
            Parameters::default(),
            test_metrics(),
        );
        (context, keypair)
    }

    #[cfg(test)]
    pub(crate) fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }
}
