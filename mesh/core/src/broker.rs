// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of one machines subscription to multiple in-process consumers.
//!
//! The broker owns at most one upstream subscription. Each subscriber gets
//! the cached snapshot, a replay of recent changes, and the live stream.
//! Delivery is non-blocking: a slow subscriber loses events without holding
//! anyone else up. When the last subscriber goes away the upstream is torn
//! down after a short grace; the next subscribe re-establishes it. If the
//! upstream closes underneath us the broker rebuilds it with a fresh
//! snapshot and an empty replay buffer; consumers see the stream continue
//! and must reconcile against the store if they care about the gap.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MeshResult;
use crate::machines::MachineSource;
use crate::record::{MachineEvent, MachineRecord};

/// Recent changes kept for late joiners; oldest dropped when full.
const REPLAY_BUFFER_SIZE: usize = 256;
/// Per-subscriber channel depth; overflow drops events for that subscriber.
const SUBSCRIBER_CHANNEL_SIZE: usize = 128;
/// How long the upstream survives without any subscriber.
const IDLE_STOP_GRACE: Duration = Duration::from_secs(5);
/// Cadence of the idle check inside the pump task.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Rebuild backoff when the upstream subscription closes.
const REBUILD_INITIAL_DELAY: Duration = Duration::from_secs(1);
const REBUILD_MAX_DELAY: Duration = Duration::from_secs(15);

pub struct SubscriptionBroker {
    source: Arc<dyn MachineSource>,
    cancel: CancellationToken,
    topic: Arc<Mutex<Topic>>,
    establish: tokio::sync::Mutex<()>,
}

/// Shared state of the single machines topic. The mutex is held only for
/// O(1) bookkeeping; never across an await point.
struct Topic {
    snapshot: Vec<MachineRecord>,
    replay: VecDeque<MachineEvent>,
    subscribers: HashMap<u64, mpsc::Sender<MachineEvent>>,
    next_subscriber_id: u64,
    upstream: Option<CancellationToken>,
    idle_since: Option<Instant>,
}

/// A consumer's view of the topic. Dropping it unsubscribes; the handle
/// holds only the topic state, never the broker itself.
pub struct BrokerSubscription {
    pub snapshot: Vec<MachineRecord>,
    pub events: mpsc::Receiver<MachineEvent>,
    id: u64,
    topic: Arc<Mutex<Topic>>,
}

impl Drop for BrokerSubscription {
    fn drop(&mut self) {
        let mut topic = self.topic.lock();
        topic.subscribers.remove(&self.id);
        if topic.subscribers.is_empty() {
            topic.idle_since = Some(Instant::now());
        }
    }
}

impl SubscriptionBroker {
    pub fn new(source: Arc<dyn MachineSource>, cancel: CancellationToken) -> Self {
        Self {
            source,
            cancel,
            topic: Arc::new(Mutex::new(Topic {
                snapshot: vec![],
                replay: VecDeque::new(),
                subscribers: HashMap::new(),
                next_subscriber_id: 1,
                upstream: None,
                idle_since: None,
            })),
            establish: tokio::sync::Mutex::new(()),
        }
    }

    /// Subscribes to the machines topic: the latest cached snapshot, a
    /// replay of recent changes, then live changes.
    pub async fn subscribe(&self) -> MeshResult<BrokerSubscription> {
        loop {
            self.ensure_upstream().await?;
            let mut topic = self.topic.lock();
            if topic.upstream.is_none() {
                // The idle check tore the upstream down between establish
                // and registration; take it from the top.
                continue;
            }
            return Ok(self.register(&mut topic));
        }
    }

    fn register(&self, topic: &mut Topic) -> BrokerSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_SIZE);
        let id = topic.next_subscriber_id;
        topic.next_subscriber_id += 1;
        for event in &topic.replay {
            // Replay can exceed the channel depth; the drop policy applies
            // to it the same as to live events.
            if tx.try_send(event.clone()).is_err() {
                break;
            }
        }
        topic.subscribers.insert(id, tx);
        topic.idle_since = None;
        BrokerSubscription {
            snapshot: topic.snapshot.clone(),
            events: rx,
            id,
            topic: self.topic.clone(),
        }
    }

    /// Establishes the upstream subscription if it is not already running.
    async fn ensure_upstream(&self) -> MeshResult<()> {
        let _guard = self.establish.lock().await;
        if self.topic.lock().upstream.is_some() {
            return Ok(());
        }

        let upstream_cancel = self.cancel.child_token();
        let (snapshot, changes) = self.source.subscribe(upstream_cancel.child_token()).await?;
        info!(machines = snapshot.len(), "broker upstream established");

        {
            let mut topic = self.topic.lock();
            topic.snapshot = snapshot;
            topic.replay.clear();
            topic.upstream = Some(upstream_cancel.clone());
        }
        tokio::spawn(pump(
            self.source.clone(),
            self.topic.clone(),
            upstream_cancel,
            changes,
        ));
        Ok(())
    }
}

/// Moves changes from the upstream subscription into the topic, rebuilding
/// the upstream when it closes and stopping once the topic has been idle
/// for the grace period.
async fn pump(
    source: Arc<dyn MachineSource>,
    topic: Arc<Mutex<Topic>>,
    cancel: CancellationToken,
    mut changes: mpsc::Receiver<MachineEvent>,
) {
    let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);
    idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                topic.lock().upstream = None;
                return;
            }
            _ = idle_check.tick() => {
                let mut topic_guard = topic.lock();
                if let Some(idle_since) = topic_guard.idle_since {
                    if topic_guard.subscribers.is_empty()
                        && idle_since.elapsed() >= IDLE_STOP_GRACE
                    {
                        debug!("no subscribers left, stopping broker upstream");
                        topic_guard.upstream = None;
                        topic_guard.replay.clear();
                        drop(topic_guard);
                        cancel.cancel();
                        return;
                    }
                }
            }
            event = changes.recv() => {
                match event {
                    Some(event) => publish(&topic, event),
                    None => {
                        // Upstream exhausted its retry budget. Rebuild with
                        // a fresh snapshot; subscribers are not retransmitted
                        // anything they missed.
                        match rebuild(&source, &topic, &cancel).await {
                            Some(new_changes) => changes = new_changes,
                            None => return,
                        }
                    }
                }
            }
        }
    }
}

fn publish(topic: &Arc<Mutex<Topic>>, event: MachineEvent) {
    let mut topic = topic.lock();
    if topic.replay.len() >= REPLAY_BUFFER_SIZE {
        topic.replay.pop_front();
    }
    topic.replay.push_back(event.clone());

    let mut closed: Vec<u64> = Vec::new();
    for (id, tx) in &topic.subscribers {
        match tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Slow consumer: the event is dropped for this subscriber
                // only.
            }
            Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
        }
    }
    for id in closed {
        topic.subscribers.remove(&id);
    }
    if topic.subscribers.is_empty() && topic.idle_since.is_none() {
        topic.idle_since = Some(Instant::now());
    }
}

/// Re-establishes the upstream after it closed, retrying with backoff until
/// it succeeds or the broker is cancelled. Returns the new change stream.
async fn rebuild(
    source: &Arc<dyn MachineSource>,
    topic: &Arc<Mutex<Topic>>,
    cancel: &CancellationToken,
) -> Option<mpsc::Receiver<MachineEvent>> {
    let mut delay = REBUILD_INITIAL_DELAY;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                topic.lock().upstream = None;
                return None;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        match source.subscribe(cancel.child_token()).await {
            Ok((snapshot, changes)) => {
                info!(machines = snapshot.len(), "broker upstream rebuilt");
                let mut topic = topic.lock();
                topic.snapshot = snapshot;
                topic.replay.clear();
                return Some(changes);
            }
            Err(e) => {
                warn!(error = %e, "failed to rebuild broker upstream");
                delay = (delay * 2).min(REBUILD_MAX_DELAY);
            }
        }
    }
}
