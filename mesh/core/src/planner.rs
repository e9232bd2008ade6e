// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

use mesh_config::MachinePublicKey;

use crate::record::MachineRecord;

/// Produces the desired peer set for one machine from the full machine set.
///
/// Planners are pure: the same inputs always yield the same plan, and the
/// input records are never mutated. Alternate topologies (partial mesh,
/// hub-and-spoke) implement the same contract.
pub trait MeshPlanner: Send + Sync + 'static {
    fn plan(&self, own_key: &MachinePublicKey, all: &[MachineRecord]) -> Vec<MachineRecord>;
}

/// The default planner: every machine peers with every other machine.
///
/// Each planned peer's endpoints are a stably-sorted copy with private and
/// link-local addresses ahead of public ones, so candidates on the local
/// segment are attempted first.
#[derive(Clone, Copy, Debug, Default)]
pub struct FullMeshPlanner;

impl MeshPlanner for FullMeshPlanner {
    fn plan(&self, own_key: &MachinePublicKey, all: &[MachineRecord]) -> Vec<MachineRecord> {
        all.iter()
            .filter(|record| record.public_key != *own_key)
            .map(|record| {
                let mut peer = record.clone();
                if peer.endpoints.len() > 1 {
                    peer.endpoints.sort_by(|a, b| a.compare_for_planning(b));
                }
                peer
            })
            .collect()
    }
}
