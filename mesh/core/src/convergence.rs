// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! The convergence loop keeps the local tunnel's peer list matched to the
//! registry.
//!
//! It subscribes to the `machines` table, plans the desired peer set from
//! the machine records, and applies the plan to the tunnel backend. When a
//! handshake prober is configured it also ticks once a second to classify
//! each peer's health and rotate silent peers through their candidate
//! endpoints.
//!
//! The loop owns its peer states exclusively; only the health summary is
//! shared, behind a mutex, for the bootstrap gate and status surfaces. Apply
//! and probe failures are logged and the loop keeps going; it exits only on
//! cancellation or when the subscription exhausts its retry budget.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use mesh_config::MachinePublicKey;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{MeshError, MeshResult};
use crate::machines::MachineSource;
use crate::peer_state::{PeerHealth, PeerState};
use crate::planner::MeshPlanner;
use crate::record::{MachineEvent, MachineRecord};
use crate::wireguard::{HandshakeProber, Tunnel};

/// Observable output of the convergence loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthSummary {
    /// True once the loop has produced its first complete classification.
    pub initialized: bool,
    pub total: usize,
    pub new: usize,
    pub alive: usize,
    pub suspect: usize,
}

impl HealthSummary {
    /// A peer counts as reachable until the loop has given up on it.
    pub fn has_reachable_peers(&self) -> bool {
        self.alive + self.new > 0
    }
}

/// The capability the orchestrator composes: start and stop the loop, and
/// observe its health summary.
#[async_trait]
pub trait Convergence: Send + Sync + 'static {
    async fn start(&self) -> MeshResult<()>;

    async fn stop(&self);

    fn summary(&self) -> HealthSummary;
}

pub struct ConvergenceLoop {
    context: Arc<Context>,
    source: Arc<dyn MachineSource>,
    planner: Arc<dyn MeshPlanner>,
    tunnel: Arc<dyn Tunnel>,
    prober: Option<Arc<dyn HandshakeProber>>,
    summary: Arc<Mutex<HealthSummary>>,
    running: Mutex<Option<RunningLoop>>,
}

struct RunningLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConvergenceLoop {
    pub(crate) fn new(
        context: Arc<Context>,
        source: Arc<dyn MachineSource>,
        planner: Arc<dyn MeshPlanner>,
        tunnel: Arc<dyn Tunnel>,
        prober: Option<Arc<dyn HandshakeProber>>,
    ) -> Self {
        Self {
            context,
            source,
            planner,
            tunnel,
            prober,
            summary: Arc::new(Mutex::new(HealthSummary::default())),
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Convergence for ConvergenceLoop {
    /// Subscribes, reconciles once, and spawns the loop task. A failure of
    /// the subscription or of the initial reconcile aborts the start; the
    /// caller decides what to roll back.
    async fn start(&self) -> MeshResult<()> {
        if self.running.lock().is_some() {
            return Err(MeshError::InvalidConfig(
                "convergence loop already running".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        let (records, changes) = self.source.subscribe(cancel.child_token()).await?;
        info!(machines = records.len(), "convergence subscription established");

        let mut task = LoopTask {
            context: self.context.clone(),
            source: self.source.clone(),
            planner: self.planner.clone(),
            tunnel: self.tunnel.clone(),
            prober: self.prober.clone(),
            summary: self.summary.clone(),
            records,
            changes,
            peer_states: BTreeMap::new(),
        };

        task.reconcile(None).await?;

        if task.prober.is_some() {
            // An initial probe makes the summary valid before the first
            // ticker fires; the bootstrap gate depends on that.
            task.probe().await;
        } else {
            task.publish_event_only_summary();
        }

        let handle = tokio::spawn(task.run(cancel.child_token()));
        *self.running.lock() = Some(RunningLoop {
            cancel,
            task: handle,
        });
        Ok(())
    }

    async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
        }
        debug!("convergence loop stopped");
    }

    fn summary(&self) -> HealthSummary {
        *self.summary.lock()
    }
}

/// Saved rotation fields, restored when the reconcile that should have
/// applied the rotation fails.
struct RotationSnapshot {
    endpoint_index: usize,
    endpoints_attempted: usize,
}

struct LoopTask {
    context: Arc<Context>,
    source: Arc<dyn MachineSource>,
    planner: Arc<dyn MeshPlanner>,
    tunnel: Arc<dyn Tunnel>,
    prober: Option<Arc<dyn HandshakeProber>>,
    summary: Arc<Mutex<HealthSummary>>,
    records: Vec<MachineRecord>,
    changes: mpsc::Receiver<MachineEvent>,
    peer_states: BTreeMap<MachinePublicKey, PeerState>,
}

impl LoopTask {
    async fn run(mut self, cancel: CancellationToken) {
        if self.prober.is_some() {
            self.event_plus_probe_loop(cancel).await;
        } else {
            self.event_only_loop(cancel).await;
        }
        debug!("convergence loop exited");
    }

    async fn event_only_loop(&mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = self.changes.recv() => {
                    let Some(event) = event else {
                        warn!("machine subscription closed, convergence loop exiting");
                        return;
                    };
                    self.handle_event(event).await;
                    self.publish_event_only_summary();
                }
            }
        }
    }

    async fn event_plus_probe_loop(&mut self, cancel: CancellationToken) {
        let mut probe_tick = tokio::time::interval(self.context.parameters.probe_interval);
        probe_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = self.changes.recv() => {
                    let Some(event) = event else {
                        warn!("machine subscription closed, convergence loop exiting");
                        return;
                    };
                    self.handle_event(event).await;
                }
                _ = probe_tick.tick() => self.probe().await,
            }
        }
    }

    /// Folds one change into the cached machine set and re-applies the plan.
    /// Apply failures are logged; the loop does not exit for them.
    async fn handle_event(&mut self, event: MachineEvent) {
        match event {
            MachineEvent::Resync => {
                // The stream reconnected; the cache may have missed changes.
                match self.source.list().await {
                    Ok(records) => {
                        info!(machines = records.len(), "resynced machine set");
                        self.records = records;
                    }
                    Err(e) => {
                        warn!(error = %e, "resync list failed, keeping cached machine set");
                    }
                }
            }
            event => apply_event(&mut self.records, event),
        }
        if let Err(e) = self.reconcile(None).await {
            warn!(error = %e, "failed to apply peers after change event");
        }
    }

    /// One probe step: read handshakes, rotate silent peers, reclassify,
    /// publish the summary, and apply any rotations to the tunnel.
    async fn probe(&mut self) {
        let Some(prober) = self.prober.clone() else {
            return;
        };
        let handshakes = match prober.peer_handshakes().await {
            Ok(handshakes) => handshakes,
            Err(e) => {
                // Initialization latches forward only on success.
                self.context.metrics.node_metrics.probe_failures.inc();
                warn!(error = %e, "handshake probe failed");
                return;
            }
        };

        let now = Instant::now();
        let parameters = &self.context.parameters;
        let planned = self.planner.plan(&self.context.own_key, &self.records);
        let planned_keys: BTreeSet<MachinePublicKey> =
            planned.iter().map(|p| p.public_key).collect();

        let mut rotated: Vec<(MachinePublicKey, RotationSnapshot)> = Vec::new();
        for peer in &planned {
            let state = self
                .peer_states
                .entry(peer.public_key)
                .or_insert_with(|| PeerState::new(peer.endpoints.len(), now));
            state.endpoint_count = peer.endpoints.len();
            if state.endpoint_count > 0 && state.endpoint_index >= state.endpoint_count {
                // The record shrank under us; restart from the front.
                state.endpoint_index = 0;
            }
            if let Some(Some(handshake)) = handshakes.get(&peer.public_key) {
                state.last_handshake = Some(*handshake);
            }
            if state.should_rotate(now, parameters.alive_freshness, parameters.endpoint_timeout) {
                let snapshot = RotationSnapshot {
                    endpoint_index: state.endpoint_index,
                    endpoints_attempted: state.endpoints_attempted,
                };
                state.next_endpoint();
                debug!(
                    peer = %peer.public_key,
                    endpoint_index = state.endpoint_index,
                    "rotating peer endpoint"
                );
                rotated.push((peer.public_key, snapshot));
            }
        }

        self.peer_states.retain(|key, _| planned_keys.contains(key));

        let mut summary = HealthSummary {
            initialized: true,
            total: self.peer_states.len(),
            ..Default::default()
        };
        for state in self.peer_states.values_mut() {
            state.classify(now, parameters.alive_freshness, parameters.endpoint_timeout);
            match state.health {
                PeerHealth::New => summary.new += 1,
                PeerHealth::Alive => summary.alive += 1,
                PeerHealth::Suspect => summary.suspect += 1,
            }
        }
        self.publish_summary(summary);

        if rotated.is_empty() {
            return;
        }
        self.context
            .metrics
            .node_metrics
            .endpoint_rotations
            .inc_by(rotated.len() as u64);
        let rotations: BTreeMap<MachinePublicKey, usize> = rotated
            .iter()
            .filter_map(|(key, _)| {
                self.peer_states
                    .get(key)
                    .map(|state| (*key, state.endpoint_index))
            })
            .collect();
        match self.reconcile(Some(&rotations)).await {
            Ok(()) => {
                for (key, _) in &rotated {
                    if let Some(state) = self.peer_states.get_mut(key) {
                        state.endpoint_set_at = Some(now);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to apply rotated endpoints, reverting rotation");
                for (key, snapshot) in rotated {
                    if let Some(state) = self.peer_states.get_mut(&key) {
                        state.endpoint_index = snapshot.endpoint_index;
                        state.endpoints_attempted = snapshot.endpoints_attempted;
                    }
                }
            }
        }
    }

    /// Re-plans and writes the peer set to the tunnel. A rotated peer gets a
    /// copy of its endpoints with the active one swapped into position 0;
    /// records in the cache are never mutated.
    async fn reconcile(
        &self,
        rotations: Option<&BTreeMap<MachinePublicKey, usize>>,
    ) -> MeshResult<()> {
        let mut planned = self.planner.plan(&self.context.own_key, &self.records);
        if let Some(rotations) = rotations {
            for peer in &mut planned {
                if let Some(&active) = rotations.get(&peer.public_key) {
                    if active > 0 && active < peer.endpoints.len() {
                        peer.endpoints.swap(0, active);
                    }
                }
            }
        }

        let metrics = &self.context.metrics.node_metrics;
        metrics.planned_peers.set(planned.len() as i64);
        metrics.reconcile_total.inc();
        self.tunnel.set_peers(planned).await.inspect_err(|_| {
            metrics.reconcile_failures.inc();
        })
    }

    /// Without a prober there is nothing to classify: every planned peer
    /// counts as new, and the summary is valid as soon as the first apply
    /// has succeeded.
    fn publish_event_only_summary(&self) {
        let planned = self.planner.plan(&self.context.own_key, &self.records);
        self.publish_summary(HealthSummary {
            initialized: true,
            total: planned.len(),
            new: planned.len(),
            alive: 0,
            suspect: 0,
        });
    }

    fn publish_summary(&self, summary: HealthSummary) {
        let metrics = &self.context.metrics.node_metrics;
        metrics
            .peers_by_health
            .with_label_values(&["new"])
            .set(summary.new as i64);
        metrics
            .peers_by_health
            .with_label_values(&["alive"])
            .set(summary.alive as i64);
        metrics
            .peers_by_health
            .with_label_values(&["suspect"])
            .set(summary.suspect as i64);
        *self.summary.lock() = summary;
    }
}

/// Folds one change event into a machine set keyed by id. `Removed` is
/// idempotent on missing ids. `Resync` is a stream marker, not a fold input;
/// passing one here is a programming error.
pub fn apply_event(records: &mut Vec<MachineRecord>, event: MachineEvent) {
    match event {
        MachineEvent::Added(record) | MachineEvent::Updated(record) => {
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
        }
        MachineEvent::Removed(id) => records.retain(|r| r.id != id),
        MachineEvent::Resync => panic!("resync events must be handled by the subscription consumer"),
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    /// Records every peer set written to it, and can be told to fail.
    struct FakeTunnel {
        writes: Mutex<Vec<Vec<MachineRecord>>>,
        fail_writes: Mutex<bool>,
    }

    impl FakeTunnel {
        fn new() -> Self {
            Self {
                writes: Mutex::new(vec![]),
                fail_writes: Mutex::new(false),
            }
        }

        fn writes(&self) -> Vec<Vec<MachineRecord>> {
            self.writes.lock().clone()
        }

        fn last_write(&self) -> Vec<MachineRecord> {
            self.writes.lock().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl Tunnel for FakeTunnel {
        async fn up(&self) -> MeshResult<()> {
            Ok(())
        }

        async fn set_peers(&self, peers: Vec<MachineRecord>) -> MeshResult<()> {
            if *self.fail_writes.lock() {
                return Err(MeshError::Tunnel("injected".to_string()));
            }
            self.writes.lock().push(peers);
            Ok(())
        }

        async fn down(&self) -> MeshResult<()> {
            Ok(())
        }
    }

    struct FakeProber {
        handshakes: Mutex<HashMap<MachinePublicKey, Option<Instant>>>,
    }

    impl FakeProber {
        fn new() -> Self {
            Self {
                handshakes: Mutex::new(HashMap::new()),
            }
        }

        fn set_handshake(&self, key: MachinePublicKey, at: Instant) {
            self.handshakes.lock().insert(key, Some(at));
        }
    }

    #[async_trait]
    impl HandshakeProber for FakeProber {
        async fn peer_handshakes(
            &self,
        ) -> MeshResult<BTreeMap<MachinePublicKey, Option<Instant>>> {
            Ok(self.handshakes.lock().clone().into_iter().collect())
        }
    }

    /// Serves a fixed snapshot and an externally-fed event channel.
    struct FakeSource {
        records: Mutex<Vec<MachineRecord>>,
        events: Mutex<Option<mpsc::Receiver<MachineEvent>>>,
    }

    impl FakeSource {
        fn new(records: Vec<MachineRecord>) -> (Arc<Self>, mpsc::Sender<MachineEvent>) {
            let (tx, rx) = mpsc::channel(16);
            (
                Arc::new(Self {
                    records: Mutex::new(records),
                    events: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl MachineSource for FakeSource {
        async fn subscribe(
            &self,
            _cancel: CancellationToken,
        ) -> MeshResult<(Vec<MachineRecord>, mpsc::Receiver<MachineEvent>)> {
            let rx = self
                .events
                .lock()
                .take()
                .expect("fake source supports one subscription");
            Ok((self.records.lock().clone(), rx))
        }

        async fn list(&self) -> MeshResult<Vec<MachineRecord>> {
            Ok(self.records.lock().clone())
        }
    }

    struct Fixture {
        convergence: ConvergenceLoop,
        tunnel: Arc<FakeTunnel>,
        prober: Arc<FakeProber>,
        events: mpsc::Sender<MachineEvent>,
        source: Arc<FakeSource>,
    }

    fn fixture(records: Vec<MachineRecord>, with_prober: bool) -> Fixture {
        let own = MachineRecord::new_for_test("self", &[]);
        let (context, _) = Context::new_for_test();
        let context = Arc::new(Context::new(
            own.public_key,
            own.name.clone(),
            context.parameters.clone(),
            crate::metrics::test_metrics(),
        ));
        let mut all = vec![own.clone()];
        all.extend(records);
        let (source, events) = FakeSource::new(all);
        let tunnel = Arc::new(FakeTunnel::new());
        let prober = Arc::new(FakeProber::new());
        let convergence = ConvergenceLoop::new(
            context,
            source.clone(),
            Arc::new(crate::planner::FullMeshPlanner),
            tunnel.clone(),
            with_prober.then(|| prober.clone() as Arc<dyn HandshakeProber>),
        );
        Fixture {
            convergence,
            tunnel,
            prober,
            events,
            source,
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn empty_registry_initializes_with_no_peers() {
        let fx = fixture(vec![], true);
        fx.convergence.start().await.unwrap();

        let summary = fx.convergence.summary();
        assert!(summary.initialized);
        assert_eq!(summary.total, 0);
        assert!(!summary.has_reachable_peers());
        assert_eq!(fx.tunnel.writes().len(), 1);
        assert!(fx.tunnel.last_write().is_empty());
        fx.convergence.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn two_node_converge_marks_peer_alive() {
        let peer = MachineRecord::new_for_test("peer", &["198.51.100.2:51820"]);
        let fx = fixture(vec![peer.clone()], true);
        fx.prober
            .set_handshake(peer.public_key, Instant::now() - Duration::from_secs(30));

        fx.convergence.start().await.unwrap();

        let summary = fx.convergence.summary();
        assert!(summary.initialized);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.alive, 1);

        let written = fx.tunnel.last_write();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].public_key, peer.public_key);
        assert_eq!(written[0].endpoints[0].to_string(), "198.51.100.2:51820");
        fx.convergence.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn rotates_through_endpoints_until_suspect() {
        let peer = MachineRecord::new_for_test(
            "peer",
            &["10.0.0.2:51820", "1.2.3.4:51820", "5.6.7.8:51820"],
        );
        let fx = fixture(vec![peer.clone()], true);
        fx.convergence.start().await.unwrap();

        let first = |peers: &[MachineRecord]| peers[0].endpoints[0].to_string();
        assert_eq!(first(&fx.tunnel.last_write()), "10.0.0.2:51820");

        // After one endpoint timeout the second candidate is active.
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(first(&fx.tunnel.last_write()), "1.2.3.4:51820");
        assert_eq!(fx.convergence.summary().new, 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(first(&fx.tunnel.last_write()), "5.6.7.8:51820");

        // Wrapped back to the first; every candidate has been tried.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(first(&fx.tunnel.last_write()), "10.0.0.2:51820");
        let summary = fx.convergence.summary();
        assert_eq!(summary.suspect, 1);
        assert_eq!(summary.new, 0);
        fx.convergence.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn endpoint_multiset_is_preserved_across_rotation() {
        let peer = MachineRecord::new_for_test(
            "peer",
            &["10.0.0.2:51820", "1.2.3.4:51820", "5.6.7.8:51820"],
        );
        let fx = fixture(vec![peer.clone()], true);
        fx.convergence.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;
        let mut written: Vec<String> = fx.tunnel.last_write()[0]
            .endpoints
            .iter()
            .map(|e| e.to_string())
            .collect();
        written.sort();
        let mut expected = vec![
            "1.2.3.4:51820".to_string(),
            "10.0.0.2:51820".to_string(),
            "5.6.7.8:51820".to_string(),
        ];
        expected.sort();
        assert_eq!(written, expected);
        // The source record is untouched by rotation.
        assert_eq!(
            fx.source.list().await.unwrap()[1].endpoints[0].to_string(),
            "10.0.0.2:51820"
        );
        fx.convergence.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn change_events_replan_the_mesh() {
        let fx = fixture(vec![], true);
        fx.convergence.start().await.unwrap();
        assert!(fx.tunnel.last_write().is_empty());

        let peer = MachineRecord::new_for_test("late-joiner", &["198.51.100.9:51820"]);
        fx.events
            .send(MachineEvent::Added(peer.clone()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.tunnel.last_write().len(), 1);

        fx.events
            .send(MachineEvent::Removed(peer.id.clone()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fx.tunnel.last_write().is_empty());
        fx.convergence.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn event_only_loop_reports_peers_as_new() {
        let peer = MachineRecord::new_for_test("peer", &["198.51.100.2:51820"]);
        let fx = fixture(vec![peer], false);
        fx.convergence.start().await.unwrap();

        let summary = fx.convergence.summary();
        assert!(summary.initialized);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.new, 1);
        assert!(summary.has_reachable_peers());

        // No probe ticks in event-only mode: nothing else gets written
        // without a change event.
        let writes_before = fx.tunnel.writes().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.tunnel.writes().len(), writes_before);
        fx.convergence.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failed_rotation_reverts_state() {
        let peer =
            MachineRecord::new_for_test("peer", &["10.0.0.2:51820", "1.2.3.4:51820"]);
        let fx = fixture(vec![peer.clone()], true);
        fx.convergence.start().await.unwrap();

        *fx.tunnel.fail_writes.lock() = true;
        tokio::time::sleep(Duration::from_secs(16)).await;
        *fx.tunnel.fail_writes.lock() = false;

        // The rotation that failed to apply was rolled back, so the next
        // successful write still starts from the first endpoint.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            fx.tunnel.last_write()[0].endpoints[0].to_string(),
            "1.2.3.4:51820"
        );
        fx.convergence.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn start_fails_when_initial_apply_fails() {
        let peer = MachineRecord::new_for_test("peer", &["198.51.100.2:51820"]);
        let fx = fixture(vec![peer], true);
        *fx.tunnel.fail_writes.lock() = true;
        assert!(fx.convergence.start().await.is_err());
        assert!(!fx.convergence.summary().initialized);
    }

    #[test]
    fn apply_event_folds_by_id() {
        let a = MachineRecord::new_for_test("a", &["10.0.0.2:51820"]);
        let b = MachineRecord::new_for_test("b", &["10.0.0.3:51820"]);
        let mut records = vec![a.clone()];

        // Added: append if new, replace if present.
        apply_event(&mut records, MachineEvent::Added(b.clone()));
        assert_eq!(records.len(), 2);
        let mut a_renamed = a.clone();
        a_renamed.name = "a2".to_string();
        apply_event(&mut records, MachineEvent::Added(a_renamed.clone()));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "a2");

        // Updated: replace if present, append otherwise.
        let c = MachineRecord::new_for_test("c", &[]);
        apply_event(&mut records, MachineEvent::Updated(c.clone()));
        assert_eq!(records.len(), 3);

        // Removed drops by id and is idempotent on missing ids.
        apply_event(&mut records, MachineEvent::Removed(b.id.clone()));
        assert_eq!(records.len(), 2);
        apply_event(&mut records, MachineEvent::Removed(b.id.clone()));
        assert_eq!(records.len(), 2);
    }

    #[test]
    #[should_panic(expected = "resync")]
    fn apply_event_panics_on_resync() {
        let mut records = vec![];
        apply_event(&mut records, MachineEvent::Resync);
    }

    #[test]
    fn reachability_predicate() {
        let mut summary = HealthSummary::default();
        assert!(!summary.has_reachable_peers());
        summary.new = 1;
        assert!(summary.has_reachable_peers());
        summary.new = 0;
        summary.alive = 2;
        assert!(summary.has_reachable_peers());
        summary.alive = 0;
        summary.suspect = 5;
        assert!(!summary.has_reachable_peers());
    }
}
