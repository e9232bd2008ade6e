// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed repository over the `machines` registry table.
//!
//! Reads decode raw value rows into [`MachineRecord`]s; a decode failure
//! fails the whole call rather than returning partial results. Writes go
//! through optimistic concurrency on the per-row `version` counter.
//!
//! The subscription maps raw store changes to [`MachineEvent`]s. Deletes do
//! not replay the removed row's columns, so the mapper keeps a `rowid → id`
//! index fed by earlier inserts and updates; a delete whose rowid was never
//! seen cannot be resolved and is dropped with a warning.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use mesh_config::Endpoint;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::record::{MachineEvent, MachineRecord};
use crate::store_client::{Statement, StoreChange, StoreChangeKind, StoreClient};

/// Depth of the machine-event channel handed to subscribers.
const MACHINE_EVENT_CHANNEL_SIZE: usize = 64;

/// Schema of the `machines` table, applied on startup.
pub const MACHINES_SCHEMA: &str = include_str!("machines.sql");

const SELECT_COLUMNS: &str =
    "id, name, public_key, endpoints, overlay_ip, labels, updated_at, version";

/// The slice of the repository the convergence loop consumes: the current
/// machine set and an ordered change feed over it.
#[async_trait::async_trait]
pub trait MachineSource: Send + Sync + 'static {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> MeshResult<(Vec<MachineRecord>, mpsc::Receiver<MachineEvent>)>;

    async fn list(&self) -> MeshResult<Vec<MachineRecord>>;
}

/// The write side of the repository, as consumed by self-registration and
/// the heartbeat writer.
#[async_trait::async_trait]
pub trait MachineWriter: Send + Sync + 'static {
    async fn get(&self, id: &str) -> MeshResult<Option<MachineRecord>>;

    async fn upsert(&self, record: &MachineRecord, expected_version: u64) -> MeshResult<u64>;

    async fn touch(&self, id: &str) -> MeshResult<()>;

    async fn delete_by_endpoint_except_id(&self, endpoint: &Endpoint, id: &str)
        -> MeshResult<u64>;
}

pub struct MachineRepository {
    store: Arc<StoreClient>,
}

#[async_trait::async_trait]
impl MachineWriter for MachineRepository {
    async fn get(&self, id: &str) -> MeshResult<Option<MachineRecord>> {
        MachineRepository::get(self, id).await
    }

    async fn upsert(&self, record: &MachineRecord, expected_version: u64) -> MeshResult<u64> {
        MachineRepository::upsert(self, record, expected_version).await
    }

    async fn touch(&self, id: &str) -> MeshResult<()> {
        MachineRepository::touch(self, id).await
    }

    async fn delete_by_endpoint_except_id(
        &self,
        endpoint: &Endpoint,
        id: &str,
    ) -> MeshResult<u64> {
        MachineRepository::delete_by_endpoint_except_id(self, endpoint, id).await
    }
}

#[async_trait::async_trait]
impl MachineSource for MachineRepository {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> MeshResult<(Vec<MachineRecord>, mpsc::Receiver<MachineEvent>)> {
        MachineRepository::subscribe(self, cancel).await
    }

    async fn list(&self) -> MeshResult<Vec<MachineRecord>> {
        MachineRepository::list(self).await
    }
}

impl MachineRepository {
    pub(crate) fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    /// Applies the embedded table schema. Idempotent.
    pub async fn apply_schema(&self) -> MeshResult<()> {
        self.store
            .exec(vec![Statement::new(MACHINES_SCHEMA, vec![])])
            .await?;
        Ok(())
    }

    pub async fn list(&self) -> MeshResult<Vec<MachineRecord>> {
        let rows = self
            .store
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM machines ORDER BY id"),
                vec![],
            )
            .await?;
        rows.iter().map(|row| MachineRecord::from_row(row)).collect()
    }

    pub async fn get(&self, id: &str) -> MeshResult<Option<MachineRecord>> {
        let rows = self
            .store
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM machines WHERE id = ?"),
                vec![Value::from(id)],
            )
            .await?;
        rows.first().map(|row| MachineRecord::from_row(row)).transpose()
    }

    /// Writes the record with optimistic concurrency.
    ///
    /// With `expected_version > 0` the write only goes through when the
    /// current row carries exactly that version; otherwise it fails with
    /// [`MeshError::Conflict`] and the row is left untouched. A write that
    /// would not change the row's desired state is a no-op. Returns the
    /// version now stored.
    pub async fn upsert(
        &self,
        record: &MachineRecord,
        expected_version: u64,
    ) -> MeshResult<u64> {
        let current = self.get(&record.id).await?;
        let next_version = match decide_upsert(current.as_ref(), record, expected_version)? {
            UpsertDecision::NoOp(version) => {
                debug!(machine = %record.id, version, "upsert is a no-op");
                return Ok(version);
            }
            UpsertDecision::Write(version) => version,
        };

        let mut row = record.clone();
        row.version = next_version;
        row.updated_at = Utc::now();
        self.store
            .exec(vec![Statement::new(
                format!(
                    "INSERT INTO machines ({SELECT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT (id) DO UPDATE SET \
                     name = excluded.name, public_key = excluded.public_key, \
                     endpoints = excluded.endpoints, overlay_ip = excluded.overlay_ip, \
                     labels = excluded.labels, updated_at = excluded.updated_at, \
                     version = excluded.version"
                ),
                row.to_row_params()?,
            )])
            .await?;
        Ok(next_version)
    }

    /// Refreshes the advisory `updated_at` of a row without bumping its
    /// version. Used by the heartbeat for an otherwise unchanged row.
    pub async fn touch(&self, id: &str) -> MeshResult<()> {
        self.store
            .exec(vec![Statement::new(
                "UPDATE machines SET updated_at = ? WHERE id = ?",
                vec![
                    Value::from(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)),
                    Value::from(id),
                ],
            )])
            .await?;
        Ok(())
    }

    /// Removes rows matching the target, which may be a machine id or a
    /// published endpoint. Returns the number of rows removed.
    pub async fn delete(&self, target: &str) -> MeshResult<u64> {
        let results = self
            .store
            .exec(vec![Statement::new(
                "DELETE FROM machines WHERE id = ? OR endpoints LIKE ?",
                vec![Value::from(target), Value::from(endpoint_pattern(target))],
            )])
            .await?;
        Ok(results.iter().map(|r| r.rows_affected).sum())
    }

    /// Purges rows that publish the given endpoint under a different id.
    /// Used when a node re-registers an endpoint after losing its identity.
    pub async fn delete_by_endpoint_except_id(
        &self,
        endpoint: &Endpoint,
        id: &str,
    ) -> MeshResult<u64> {
        let results = self
            .store
            .exec(vec![Statement::new(
                "DELETE FROM machines WHERE id != ? AND endpoints LIKE ?",
                vec![
                    Value::from(id),
                    Value::from(endpoint_pattern(&endpoint.to_string())),
                ],
            )])
            .await?;
        Ok(results.iter().map(|r| r.rows_affected).sum())
    }

    /// Subscribes to the table: returns the decoded snapshot and a channel
    /// of ordered [`MachineEvent`]s. The channel closes when the underlying
    /// subscription exhausts its retry budget or `cancel` fires.
    pub async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> MeshResult<(Vec<MachineRecord>, mpsc::Receiver<MachineEvent>)> {
        let subscription = self
            .store
            .subscribe(
                &format!("SELECT {SELECT_COLUMNS} FROM machines"),
                vec![],
                cancel,
            )
            .await?;

        let snapshot: Vec<MachineRecord> = subscription
            .snapshot
            .iter()
            .map(|row| MachineRecord::from_row(row))
            .collect::<MeshResult<_>>()?;

        let (tx, rx) = mpsc::channel(MACHINE_EVENT_CHANNEL_SIZE);
        tokio::spawn(map_events(subscription.id, subscription.changes, tx));
        Ok((snapshot, rx))
    }
}

enum UpsertDecision {
    NoOp(u64),
    Write(u64),
}

fn decide_upsert(
    current: Option<&MachineRecord>,
    incoming: &MachineRecord,
    expected_version: u64,
) -> MeshResult<UpsertDecision> {
    match current {
        None if expected_version > 0 => Err(MeshError::Conflict(format!(
            "machine {} does not exist, expected version {expected_version}",
            incoming.id
        ))),
        None => Ok(UpsertDecision::Write(1)),
        Some(current) => {
            if expected_version > 0 && current.version != expected_version {
                return Err(MeshError::Conflict(format!(
                    "machine {} is at version {}, expected {expected_version}",
                    incoming.id, current.version
                )));
            }
            if current.same_desired_state(incoming) {
                Ok(UpsertDecision::NoOp(current.version))
            } else {
                Ok(UpsertDecision::Write(current.version + 1))
            }
        }
    }
}

/// LIKE pattern matching one endpoint inside the JSON-encoded array.
fn endpoint_pattern(endpoint: &str) -> String {
    format!("%\"{endpoint}\"%")
}

/// Maps raw store changes to typed machine events, resolving deletes via a
/// rowid index. Exits when either side of the pipe goes away.
async fn map_events(
    subscription_id: String,
    mut changes: mpsc::Receiver<StoreChange>,
    tx: mpsc::Sender<MachineEvent>,
) {
    let mut rowid_index: HashMap<i64, String> = HashMap::new();
    while let Some(change) = changes.recv().await {
        let event = match change.kind {
            StoreChangeKind::Insert | StoreChangeKind::Update => {
                let record = match MachineRecord::from_row(&change.values) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(
                            subscription = %subscription_id,
                            change_id = change.change_id,
                            error = %e,
                            "undecodable machine change, closing subscription"
                        );
                        return;
                    }
                };
                rowid_index.insert(change.rowid, record.id.clone());
                if change.kind == StoreChangeKind::Insert {
                    MachineEvent::Added(record)
                } else {
                    MachineEvent::Updated(record)
                }
            }
            StoreChangeKind::Delete => match rowid_index.remove(&change.rowid) {
                Some(id) => MachineEvent::Removed(id),
                None => {
                    // Snapshots do not carry rowids, so a delete that
                    // precedes any insert or update of the same row cannot
                    // be resolved to a machine id.
                    warn!(
                        subscription = %subscription_id,
                        rowid = change.rowid,
                        change_id = change.change_id,
                        "delete for unknown rowid, skipping"
                    );
                    continue;
                }
            },
            StoreChangeKind::Resync => MachineEvent::Resync,
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn change(kind: StoreChangeKind, rowid: i64, values: Vec<Value>, change_id: u64) -> StoreChange {
        StoreChange {
            kind,
            rowid,
            values,
            change_id,
        }
    }

    async fn run_mapper(changes: Vec<StoreChange>) -> Vec<MachineEvent> {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (tx, mut rx) = mpsc::channel(16);
        for c in changes {
            raw_tx.send(c).await.unwrap();
        }
        drop(raw_tx);
        map_events("sub-test".to_string(), raw_rx, tx).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn maps_inserts_updates_and_resolved_deletes() {
        let record = MachineRecord::new_for_test("alpha", &["10.0.0.2:51820"]);
        let row = record.to_row_params().unwrap();
        let events = run_mapper(vec![
            change(StoreChangeKind::Insert, 7, row.clone(), 1),
            change(StoreChangeKind::Update, 7, row.clone(), 2),
            change(StoreChangeKind::Delete, 7, vec![], 3),
        ])
        .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], MachineEvent::Added(r) if r.id == record.id));
        assert!(matches!(&events[1], MachineEvent::Updated(r) if r.id == record.id));
        assert!(matches!(&events[2], MachineEvent::Removed(id) if *id == record.id));
    }

    #[tokio::test]
    async fn delete_for_unknown_rowid_is_skipped() {
        let record = MachineRecord::new_for_test("alpha", &[]);
        let row = record.to_row_params().unwrap();
        let events = run_mapper(vec![
            change(StoreChangeKind::Delete, 99, vec![], 1),
            change(StoreChangeKind::Insert, 1, row, 2),
        ])
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], MachineEvent::Added(_)));
    }

    #[tokio::test]
    async fn resync_passes_through() {
        let events = run_mapper(vec![change(StoreChangeKind::Resync, 0, vec![], 5)]).await;
        assert_eq!(events, vec![MachineEvent::Resync]);
    }

    #[tokio::test]
    async fn undecodable_change_closes_the_stream() {
        let record = MachineRecord::new_for_test("alpha", &[]);
        let row = record.to_row_params().unwrap();
        let events = run_mapper(vec![
            change(StoreChangeKind::Insert, 1, vec![Value::from(1)], 1),
            change(StoreChangeKind::Insert, 2, row, 2),
        ])
        .await;
        // The mapper stops at the bad change; nothing after it is delivered.
        assert!(events.is_empty());
    }

    #[test]
    fn upsert_conflicts() {
        let record = MachineRecord::new_for_test("alpha", &["10.0.0.2:51820"]);

        // Absent row with an expectation.
        assert!(matches!(
            decide_upsert(None, &record, 3),
            Err(MeshError::Conflict(_))
        ));

        // Version mismatch leaves the row untouched.
        let mut current = record.clone();
        current.version = 4;
        assert!(matches!(
            decide_upsert(Some(&current), &record, 3),
            Err(MeshError::Conflict(_))
        ));
    }

    #[test]
    fn upsert_versions() {
        let record = MachineRecord::new_for_test("alpha", &["10.0.0.2:51820"]);

        // Insert path starts at version 1.
        assert!(matches!(
            decide_upsert(None, &record, 0),
            Ok(UpsertDecision::Write(1))
        ));

        // Identical desired state is a no-op, keeping the current version.
        let mut current = record.clone();
        current.version = 4;
        assert!(matches!(
            decide_upsert(Some(&current), &record, 4),
            Ok(UpsertDecision::NoOp(4))
        ));

        // A real change bumps the version.
        let mut incoming = record.clone();
        incoming.name = "renamed".to_string();
        assert!(matches!(
            decide_upsert(Some(&current), &incoming, 4),
            Ok(UpsertDecision::Write(5))
        ));

        // Without an expectation the write still bumps from current.
        assert!(matches!(
            decide_upsert(Some(&current), &incoming, 0),
            Ok(UpsertDecision::Write(5))
        ));
    }

    #[test]
    fn endpoint_patterns() {
        assert_eq!(endpoint_pattern("1.2.3.4:51820"), "%\"1.2.3.4:51820\"%");
    }
}
