// SPDX-License-Identifier: MIT
//! Diagram persistence.
//!
//! Sessions are the in-memory authority; the store is a write-behind copy of
//! the cell map and its update vector. `save` must be idempotent for equal
//! vectors — the hub may retry.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::diagram::{self, Cell, CellMap};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking session persistence indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// What a session loads at creation: cells plus the vector they were saved at.
#[derive(Debug, Clone)]
pub struct DiagramRecord {
    pub cells: CellMap,
    pub update_vector: u64,
}

/// Load/save seam between sessions and the platform's storage.
#[async_trait]
pub trait DiagramStore: Send + Sync {
    /// `None` means the diagram has never been saved — a session starts it
    /// empty at vector zero.
    async fn load(&self, diagram_id: Uuid) -> Result<Option<DiagramRecord>>;

    /// Persist a point-in-time snapshot. Idempotent for equal vectors.
    async fn save(&self, diagram_id: Uuid, cells: &CellMap, update_vector: u64) -> Result<()>;
}

// ─── SQLite store ────────────────────────────────────────────────────────────

/// SQLite-backed store (WAL mode, crash-safe). One row per diagram; cells are
/// stored as the snapshot-ordered JSON array so reloads rebuild the same
/// insertion order.
pub struct SqliteDiagramStore {
    pool: SqlitePool,
}

impl SqliteDiagramStore {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("collabd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS diagrams (
                id            TEXT PRIMARY KEY,
                cells         TEXT NOT NULL,
                update_vector INTEGER NOT NULL,
                updated_at    TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .context("failed to run diagrams migration")?;
        Ok(())
    }
}

#[async_trait]
impl DiagramStore for SqliteDiagramStore {
    async fn load(&self, diagram_id: Uuid) -> Result<Option<DiagramRecord>> {
        let row: Option<(String, i64)> = with_timeout(async {
            sqlx::query_as("SELECT cells, update_vector FROM diagrams WHERE id = ?")
                .bind(diagram_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context("failed to load diagram")
        })
        .await?;

        let Some((cells_json, vector)) = row else {
            return Ok(None);
        };
        let cells: Vec<Cell> =
            serde_json::from_str(&cells_json).context("stored cells are not valid JSON")?;
        Ok(Some(DiagramRecord {
            cells: diagram::from_snapshot(cells),
            update_vector: vector as u64,
        }))
    }

    async fn save(&self, diagram_id: Uuid, cells: &CellMap, update_vector: u64) -> Result<()> {
        let cells_json = serde_json::to_string(&diagram::snapshot(cells))?;
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO diagrams (id, cells, update_vector, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    cells = excluded.cells,
                    update_vector = excluded.update_vector,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(diagram_id.to_string())
            .bind(&cells_json)
            .bind(update_vector as i64)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .context("failed to save diagram")?;
            Ok(())
        })
        .await
    }
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// HashMap-backed store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryDiagramStore {
    inner: RwLock<HashMap<Uuid, (Vec<Cell>, u64)>>,
}

impl MemoryDiagramStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a diagram directly, bypassing a session. Test helper.
    pub async fn put(&self, diagram_id: Uuid, cells: Vec<Cell>, update_vector: u64) {
        self.inner
            .write()
            .await
            .insert(diagram_id, (cells, update_vector));
    }
}

#[async_trait]
impl DiagramStore for MemoryDiagramStore {
    async fn load(&self, diagram_id: Uuid) -> Result<Option<DiagramRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .get(&diagram_id)
            .map(|(cells, vector)| DiagramRecord {
                cells: diagram::from_snapshot(cells.clone()),
                update_vector: *vector,
            }))
    }

    async fn save(&self, diagram_id: Uuid, cells: &CellMap, update_vector: u64) -> Result<()> {
        self.inner
            .write()
            .await
            .insert(diagram_id, (diagram::snapshot(cells), update_vector));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cell(id: &str, body: serde_json::Value) -> Cell {
        Cell::from_op_data(id, &body).unwrap()
    }

    #[tokio::test]
    async fn sqlite_round_trips_cells_and_vector() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDiagramStore::new(dir.path()).await.unwrap();
        let id = Uuid::new_v4();

        assert!(store.load(id).await.unwrap().is_none());

        let mut cells = CellMap::new();
        for c in [cell("b", json!({ "x": 1 })), cell("a", json!({ "x": 2 }))] {
            cells.insert(c.id.clone(), c);
        }
        store.save(id, &cells, 7).await.unwrap();

        let record = store.load(id).await.unwrap().unwrap();
        assert_eq!(record.update_vector, 7);
        let ids: Vec<&str> = record.cells.keys().map(String::as_str).collect();
        // Insertion order survives the round trip.
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn sqlite_save_is_idempotent_for_equal_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDiagramStore::new(dir.path()).await.unwrap();
        let id = Uuid::new_v4();

        let mut cells = CellMap::new();
        cells.insert("c1".into(), cell("c1", json!({ "x": 1 })));
        store.save(id, &cells, 3).await.unwrap();
        store.save(id, &cells, 3).await.unwrap();

        let record = store.load(id).await.unwrap().unwrap();
        assert_eq!(record.update_vector, 3);
        assert_eq!(record.cells.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryDiagramStore::new();
        let id = Uuid::new_v4();
        let mut cells = CellMap::new();
        cells.insert("c1".into(), cell("c1", json!({ "k": true })));
        store.save(id, &cells, 1).await.unwrap();
        let record = store.load(id).await.unwrap().unwrap();
        assert_eq!(record.update_vector, 1);
        assert!(record.cells.contains_key("c1"));
    }
}
