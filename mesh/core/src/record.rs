// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! The registry row describing one mesh participant, and the change events
//! delivered on a `machines` subscription.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, SecondsFormat, Utc};
use mesh_config::{Endpoint, MachinePublicKey};
use serde_json::Value;

use crate::error::{MeshError, MeshResult};

/// One row of the `machines` table.
///
/// Invariants: `id` is the hex encoding of `public_key`, `overlay_ip` is a
/// pure function of `public_key`, and each machine writes only its own row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineRecord {
    /// Hex-encoded public key; the registry primary key.
    pub id: String,
    /// Human label, best-effort.
    pub name: String,
    pub public_key: MachinePublicKey,
    /// Ordered candidate endpoints, first preferred.
    pub endpoints: Vec<Endpoint>,
    pub overlay_ip: Ipv4Addr,
    pub labels: BTreeMap<String, String>,
    /// Advisory only; refreshed by the owner's heartbeat.
    pub updated_at: DateTime<Utc>,
    /// Monotonic per-row counter used for optimistic concurrency.
    pub version: u64,
}

impl MachineRecord {
    pub fn new(
        public_key: MachinePublicKey,
        name: String,
        endpoints: Vec<Endpoint>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: public_key.to_hex(),
            name,
            public_key,
            endpoints,
            overlay_ip: public_key.overlay_ip(),
            labels,
            updated_at: Utc::now(),
            version: 0,
        }
    }

    /// Checks the derived-field invariants of a row read from the registry.
    pub fn validate(&self) -> MeshResult<()> {
        if self.id != self.public_key.to_hex() {
            return Err(MeshError::Decode(format!(
                "row id {} does not match public key {}",
                self.id, self.public_key
            )));
        }
        if self.overlay_ip != self.public_key.overlay_ip() {
            return Err(MeshError::Decode(format!(
                "overlay ip {} is not derived from public key {}",
                self.overlay_ip, self.public_key
            )));
        }
        Ok(())
    }

    /// True when the rows describe the same desired state, ignoring the
    /// advisory `updated_at` and the concurrency `version`.
    pub fn same_desired_state(&self, other: &MachineRecord) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.public_key == other.public_key
            && self.endpoints == other.endpoints
            && self.overlay_ip == other.overlay_ip
            && self.labels == other.labels
    }

    /// Encodes the row into statement parameters, in schema column order.
    pub fn to_row_params(&self) -> MeshResult<Vec<Value>> {
        let endpoints = serde_json::to_string(&self.endpoints)
            .map_err(|e| MeshError::Decode(e.to_string()))?;
        let labels =
            serde_json::to_string(&self.labels).map_err(|e| MeshError::Decode(e.to_string()))?;
        Ok(vec![
            Value::from(self.id.clone()),
            Value::from(self.name.clone()),
            Value::from(self.public_key.to_hex()),
            Value::from(endpoints),
            Value::from(self.overlay_ip.to_string()),
            Value::from(labels),
            Value::from(
                self.updated_at
                    .to_rfc3339_opts(SecondsFormat::Nanos, true),
            ),
            Value::from(self.version),
        ])
    }

    /// Decodes a raw value row in schema column order. The `version` column
    /// may be absent on rows written before it existed.
    pub fn from_row(values: &[Value]) -> MeshResult<Self> {
        if values.len() < 7 {
            return Err(MeshError::Decode(format!(
                "machines row has {} columns, expected at least 7",
                values.len()
            )));
        }
        let id = decode_string(&values[0], "id")?;
        let name = decode_string(&values[1], "name")?;
        let public_key = MachinePublicKey::from_hex(&decode_string(&values[2], "public_key")?)
            .map_err(|e| MeshError::Decode(format!("public_key: {e}")))?;
        let endpoints: Vec<Endpoint> =
            serde_json::from_str(&non_empty_or(&decode_string(&values[3], "endpoints")?, "[]"))
                .map_err(|e| MeshError::Decode(format!("endpoints: {e}")))?;
        let overlay_ip = decode_string(&values[4], "overlay_ip")?
            .parse()
            .map_err(|e| MeshError::Decode(format!("overlay_ip: {e}")))?;
        let labels: BTreeMap<String, String> =
            serde_json::from_str(&non_empty_or(&decode_string(&values[5], "labels")?, "{}"))
                .map_err(|e| MeshError::Decode(format!("labels: {e}")))?;
        let updated_at = decode_timestamp(&values[6])?;
        let version = match values.get(7) {
            Some(value) => decode_u64(value, "version")?,
            None => 0,
        };
        Ok(Self {
            id,
            name,
            public_key,
            endpoints,
            overlay_ip,
            labels,
            updated_at,
            version,
        })
    }
}

/// A change delivered on a `machines` subscription.
///
/// `Removed` carries only the machine id: deletes do not replay the old
/// row's columns. `Resync` is synthetic and means the stream reconnected;
/// consumers must rebuild from a fresh snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MachineEvent {
    Added(MachineRecord),
    Updated(MachineRecord),
    Removed(String),
    Resync,
}

fn decode_string(value: &Value, column: &str) -> MeshResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        other => Err(MeshError::Decode(format!(
            "column {column}: expected string, got {other}"
        ))),
    }
}

fn decode_u64(value: &Value, column: &str) -> MeshResult<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f as u64))
            .ok_or_else(|| MeshError::Decode(format!("column {column}: bad number {n}"))),
        Value::String(s) => s
            .parse()
            .map_err(|e| MeshError::Decode(format!("column {column}: {e}"))),
        Value::Null => Ok(0),
        other => Err(MeshError::Decode(format!(
            "column {column}: expected integer, got {other}"
        ))),
    }
}

fn decode_timestamp(value: &Value) -> MeshResult<DateTime<Utc>> {
    let raw = decode_string(value, "updated_at")?;
    if raw.is_empty() {
        return Ok(DateTime::UNIX_EPOCH);
    }
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| MeshError::Decode(format!("updated_at: {e}")))
}

fn non_empty_or(s: &str, fallback: &str) -> String {
    if s.is_empty() {
        fallback.to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
impl MachineRecord {
    /// Builds a record with a fresh random identity and the given endpoints.
    pub(crate) fn new_for_test(name: &str, endpoints: &[&str]) -> Self {
        let keypair = mesh_config::MachineKeyPair::generate(&mut rand::thread_rng());
        MachineRecord::new(
            keypair.public(),
            name.to_string(),
            endpoints.iter().map(|e| e.parse().unwrap()).collect(),
            BTreeMap::new(),
        )
    }
}
