// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! Periodic refresh of this machine's own registry row.
//!
//! Other machines read `updated_at` as an advisory liveness hint, so the
//! writer touches the row even when nothing else changed. Configuration
//! changes (a new advertised endpoint, a rename) are written through the
//! normal optimistic-concurrency path; a conflict simply waits for the next
//! tick with a fresh read.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::Context;
use crate::machines::MachineWriter;
use crate::record::MachineRecord;

/// The row this machine wants the registry to carry for it.
pub(crate) fn own_machine_record(context: &Context) -> MachineRecord {
    MachineRecord::new(
        context.own_key,
        context.own_name.clone(),
        context.parameters.advertise_endpoints.clone(),
        BTreeMap::new(),
    )
}

// Handle to stop the heartbeat loop.
pub(crate) struct HeartbeatHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
        }
    }
}

pub(crate) struct HeartbeatWriter {
    context: Arc<Context>,
    writer: Arc<dyn MachineWriter>,
}

impl HeartbeatWriter {
    pub(crate) fn new(context: Arc<Context>, writer: Arc<dyn MachineWriter>) -> Self {
        Self { context, writer }
    }

    pub(crate) fn start(self) -> HeartbeatHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.child_token()));
        HeartbeatHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.context.parameters.heartbeat_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => self.beat().await,
            }
        }
    }

    async fn beat(&self) {
        let metrics = &self.context.metrics.node_metrics;
        let mut desired = own_machine_record(&self.context);
        let result = match self.writer.get(&desired.id).await {
            Ok(Some(current)) => {
                // Labels are written by operators, not by the daemon; keep
                // whatever the row carries.
                desired.labels = current.labels.clone();
                if current.same_desired_state(&desired) {
                    self.writer.touch(&desired.id).await
                } else {
                    self.writer.upsert(&desired, current.version).await.map(|_| ())
                }
            }
            Ok(None) => self.writer.upsert(&desired, 0).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(machine = %desired.id, "heartbeat written"),
            Err(e) => {
                metrics.heartbeat_failures.inc();
                warn!(machine = %desired.id, error = %e, "heartbeat failed");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use async_trait::async_trait;
    use mesh_config::{Endpoint, Parameters};
    use parking_lot::Mutex;

    use super::*;
    use crate::error::{MeshError, MeshResult};

    #[derive(Default)]
    struct FakeWriter {
        row: Mutex<Option<MachineRecord>>,
        touches: Mutex<u64>,
        upserts: Mutex<u64>,
        conflict: Mutex<bool>,
    }

    #[async_trait]
    impl MachineWriter for FakeWriter {
        async fn get(&self, _id: &str) -> MeshResult<Option<MachineRecord>> {
            Ok(self.row.lock().clone())
        }

        async fn upsert(
            &self,
            record: &MachineRecord,
            expected_version: u64,
        ) -> MeshResult<u64> {
            if *self.conflict.lock() {
                return Err(MeshError::Conflict("injected".to_string()));
            }
            *self.upserts.lock() += 1;
            let mut stored = record.clone();
            stored.version = expected_version + 1;
            let version = stored.version;
            *self.row.lock() = Some(stored);
            Ok(version)
        }

        async fn touch(&self, _id: &str) -> MeshResult<()> {
            *self.touches.lock() += 1;
            Ok(())
        }

        async fn delete_by_endpoint_except_id(
            &self,
            _endpoint: &Endpoint,
            _id: &str,
        ) -> MeshResult<u64> {
            Ok(0)
        }
    }

    fn context_with_interval(seconds: u64) -> Arc<Context> {
        let (context, _) = Context::new_for_test();
        let parameters = Parameters {
            heartbeat_interval: Duration::from_secs(seconds),
            ..context.parameters.clone()
        };
        Arc::new(context.with_parameters(parameters))
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn registers_then_touches() {
        let context = context_with_interval(10);
        let writer = Arc::new(FakeWriter::default());
        let handle = HeartbeatWriter::new(context, writer.clone()).start();

        // First tick fires immediately: no row yet, so it registers.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*writer.upserts.lock(), 1);

        // Later ticks find an unchanged row and only touch it.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(*writer.upserts.lock(), 1);
        assert!(*writer.touches.lock() >= 2);

        handle.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn rewrites_when_the_row_drifts() {
        let context = context_with_interval(10);
        let writer = Arc::new(FakeWriter::default());
        let mut stale = own_machine_record(&context);
        stale.name = "previous-name".to_string();
        stale.version = 3;
        *writer.row.lock() = Some(stale);

        let handle = HeartbeatWriter::new(context, writer.clone()).start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*writer.upserts.lock(), 1);
        assert_eq!(writer.row.lock().as_ref().unwrap().version, 4);
        handle.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn conflict_waits_for_the_next_tick() {
        let context = context_with_interval(10);
        let writer = Arc::new(FakeWriter::default());
        *writer.conflict.lock() = true;

        let handle = HeartbeatWriter::new(context, writer.clone()).start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*writer.upserts.lock(), 0);

        *writer.conflict.lock() = false;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(*writer.upserts.lock(), 1);
        handle.stop().await;
    }
}
