// Copyright The Uncloud Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The embedded relational store of §6: "a small embedded relational
//! database stores per-container rows keyed by container ID... No schema is
//! imposed on callers beyond: each managed container must have a
//! corresponding row inserted on creation and deleted on removal."
//!
//! Persistence of the machine database is listed in §1 as an external
//! collaborator ("assumed to exist"); this module is this implementation's
//! choice of what that collaborator is, since the corpus' own durable-store
//! crate is backed by a standalone Postgres server and is a poor fit for
//! "embedded". `rusqlite`'s bundled SQLite gives single-file, no-server
//! persistence instead.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;
use tokio::task;

use crate::info::{Container, ContainerRecord, MachineInfo, ServiceSpec};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("stored row contained invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Join(#[from] task::JoinError),
}

/// A snapshot of the container inventory plus a channel that fires whenever
/// it changes, matching §4.2's reconciler input: "a subscription yielding
/// (a) an initial snapshot S₀... and (b) a change notification channel."
pub struct Subscription {
    pub snapshot: Vec<ContainerRecord>,
    pub changes: broadcast::Receiver<()>,
}

/// Read/write access to cluster membership and container inventory.
/// Implementations must make every mutation visible to [`Store::subscribe`]
/// subscribers created before the mutation.
#[async_trait]
pub trait Store: Send + Sync {
    async fn machines(&self) -> Result<Vec<MachineInfo>, StoreError>;

    /// Resolves a machine by exact ID or exact name. Returns `Ok(None)` if
    /// no machine matches either.
    async fn machine(&self, id_or_name: &str) -> Result<Option<MachineInfo>, StoreError>;

    async fn upsert_machine(&self, info: MachineInfo) -> Result<(), StoreError>;

    async fn remove_machine(&self, id: &str) -> Result<(), StoreError>;

    async fn containers(&self) -> Result<Vec<ContainerRecord>, StoreError>;

    async fn upsert_container(&self, record: ContainerRecord) -> Result<(), StoreError>;

    async fn remove_container(&self, container_id: &str) -> Result<(), StoreError>;

    /// Subscribes to container-inventory changes. The returned snapshot is
    /// consistent as of some point no earlier than the call to `subscribe`;
    /// every mutation after that point is guaranteed to fire on `changes`.
    async fn subscribe(&self) -> Result<Subscription, StoreError>;
}

/// A `rusqlite`-backed [`Store`]. `rusqlite::Connection` is `!Sync`, so all
/// access is serialized through a [`Mutex`] and run on the blocking thread
/// pool via [`tokio::task::spawn_blocking`] — this store is not on any hot
/// path (the Director never touches it directly; only the MachineMapper and
/// the reconciler's periodic refresh do).
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<()>,
}

impl SqliteStore {
    /// Opens (creating if absent) a SQLite database at `path` and ensures
    /// its schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        let (changes, _) = broadcast::channel(16);
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        })
    }

    /// Opens a private in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        let (changes, _) = broadcast::channel(16);
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS machines (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL UNIQUE,
                network_address TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS containers (
                id                  TEXT PRIMARY KEY,
                machine_id          TEXT NOT NULL,
                service_id          TEXT NOT NULL,
                service_name        TEXT NOT NULL,
                running             INTEGER NOT NULL,
                health_known        INTEGER NOT NULL,
                healthy             INTEGER NOT NULL,
                network_address     TEXT,
                created_unix_nanos  INTEGER NOT NULL,
                labels              TEXT NOT NULL,
                spec                TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS containers_machine_id ON containers(machine_id);
            ",
        )?;
        Ok(())
    }

    fn notify(&self) {
        // No receivers is a legitimate, common state (nobody has
        // subscribed yet); the send error carries no information we need.
        let _ = self.changes.send(());
    }
}

fn row_to_machine(row: &rusqlite::Row<'_>) -> rusqlite::Result<MachineInfo> {
    let addr: String = row.get("network_address")?;
    Ok(MachineInfo {
        id: row.get("id")?,
        name: row.get("name")?,
        network_address: addr.parse().unwrap_or(std::net::Ipv6Addr::UNSPECIFIED),
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContainerRecord> {
    let labels_json: String = row.get("labels")?;
    let labels: BTreeMap<String, String> =
        serde_json::from_str(&labels_json).unwrap_or_default();
    let spec_json: String = row.get("spec")?;
    let spec = ServiceSpec(serde_json::from_str(&spec_json).unwrap_or(serde_json::Value::Null));
    let addr: Option<String> = row.get("network_address")?;
    Ok(ContainerRecord {
        machine_id: row.get("machine_id")?,
        container: Container {
            id: row.get("id")?,
            service_id: row.get("service_id")?,
            service_name: row.get("service_name")?,
            running: row.get::<_, i64>("running")? != 0,
            health_known: row.get::<_, i64>("health_known")? != 0,
            healthy: row.get::<_, i64>("healthy")? != 0,
            network_address: addr.and_then(|a| a.parse().ok()),
            created_unix_nanos: row.get("created_unix_nanos")?,
            labels,
            spec,
        },
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn machines(&self) -> Result<Vec<MachineInfo>, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT id, name, network_address FROM machines")?;
            let rows = stmt
                .query_map([], row_to_machine)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    async fn machine(&self, id_or_name: &str) -> Result<Option<MachineInfo>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let id_or_name = id_or_name.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT id, name, network_address FROM machines WHERE id = ?1 OR name = ?1",
                params![id_or_name],
                row_to_machine,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await?
    }

    async fn upsert_machine(&self, info: MachineInfo) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO machines (id, name, network_address) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, network_address = excluded.network_address",
                params![info.id, info.name, info.network_address.to_string()],
            )?;
            Ok::<_, StoreError>(())
        })
        .await??;
        Ok(())
    }

    async fn remove_machine(&self, id: &str) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute("DELETE FROM machines WHERE id = ?1", params![id])?;
            Ok::<_, StoreError>(())
        })
        .await??;
        Ok(())
    }

    async fn containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, machine_id, service_id, service_name, running, health_known,
                        healthy, network_address, created_unix_nanos, labels, spec
                 FROM containers",
            )?;
            let rows = stmt
                .query_map([], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    async fn upsert_container(&self, record: ContainerRecord) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let labels = serde_json::to_string(&record.container.labels)?;
        let spec = serde_json::to_string(&record.container.spec.0)?;
        let c = record.container;
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO containers (id, machine_id, service_id, service_name, running,
                    health_known, healthy, network_address, created_unix_nanos, labels, spec)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    machine_id = excluded.machine_id,
                    service_id = excluded.service_id,
                    service_name = excluded.service_name,
                    running = excluded.running,
                    health_known = excluded.health_known,
                    healthy = excluded.healthy,
                    network_address = excluded.network_address,
                    created_unix_nanos = excluded.created_unix_nanos,
                    labels = excluded.labels,
                    spec = excluded.spec",
                params![
                    c.id,
                    record.machine_id,
                    c.service_id,
                    c.service_name,
                    c.running as i64,
                    c.health_known as i64,
                    c.healthy as i64,
                    c.network_address.map(|a| a.to_string()),
                    c.created_unix_nanos,
                    labels,
                    spec,
                ],
            )?;
            Ok::<_, StoreError>(())
        })
        .await??;
        self.notify();
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let container_id = container_id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute("DELETE FROM containers WHERE id = ?1", params![container_id])?;
            Ok::<_, StoreError>(())
        })
        .await??;
        self.notify();
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        // Subscribing to the broadcast channel before reading the snapshot
        // would be ideal for a perfectly race-free guarantee, but `changes`
        // is a level-triggered "something changed" signal, not a queue of
        // deltas, so a mutation landing between the snapshot read and the
        // subscribe call is still observed (as a spurious extra wakeup at
        // worst, never a missed one).
        let receiver = self.changes.subscribe();
        let snapshot = self.containers().await?;
        Ok(Subscription {
            snapshot,
            changes: receiver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn sample_machine(id: &str) -> MachineInfo {
        MachineInfo {
            id: id.to_string(),
            name: format!("{id}-name"),
            network_address: Ipv6Addr::LOCALHOST,
        }
    }

    fn sample_container(id: &str, machine_id: &str) -> ContainerRecord {
        ContainerRecord {
            machine_id: machine_id.to_string(),
            container: Container {
                id: id.to_string(),
                service_id: "svc".to_string(),
                service_name: "web".to_string(),
                running: true,
                health_known: false,
                healthy: false,
                network_address: None,
                created_unix_nanos: 0,
                labels: BTreeMap::new(),
                spec: ServiceSpec(serde_json::Value::Null),
            },
        }
    }

    #[tokio::test]
    async fn upsert_and_resolve_machine_by_id_or_name() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_machine(sample_machine("m1")).await.unwrap();
        assert_eq!(store.machine("m1").await.unwrap().unwrap().id, "m1");
        assert_eq!(store.machine("m1-name").await.unwrap().unwrap().id, "m1");
        assert!(store.machine("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_container_is_idempotent_and_notifies() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut sub = store.subscribe().await.unwrap();
        store
            .upsert_container(sample_container("c1", "m1"))
            .await
            .unwrap();
        sub.changes.recv().await.unwrap();

        store
            .upsert_container(sample_container("c1", "m1"))
            .await
            .unwrap();
        let containers = store.containers().await.unwrap();
        assert_eq!(containers.len(), 1);
    }

    #[tokio::test]
    async fn remove_container_deletes_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_container(sample_container("c1", "m1"))
            .await
            .unwrap();
        store.remove_container("c1").await.unwrap();
        assert!(store.containers().await.unwrap().is_empty());
    }
}
