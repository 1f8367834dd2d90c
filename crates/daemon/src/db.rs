//! Durable state store: tasks, asset nodes, and a small JSON key-value
//! surface for recovery. Read-after-write consistent for a given task id;
//! all writers funnel through the task manager.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use engine::graph::{AssetKind, AssetNode, NodeStatus};

pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                prompt TEXT NOT NULL,
                request_json TEXT NOT NULL,
                status TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                stage TEXT NOT NULL DEFAULT 'pending',
                message TEXT,
                error TEXT,
                failed_node_id TEXT,
                video_url TEXT,
                thumbnail_url TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS asset_nodes (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                scene_index INTEGER,
                group_index INTEGER,
                status TEXT NOT NULL,
                result_url TEXT,
                retries INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                superseded_by TEXT,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let value: Option<String> = conn
            .query_row("SELECT value_json FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    pub fn set_json(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value_json) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = ?2",
            params![key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    pub fn upsert_node(&self, task_id: &str, node: &AssetNode) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO asset_nodes
                (id, task_id, kind, scene_index, group_index, status, result_url,
                 retries, last_error, superseded_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                status = ?6, result_url = ?7, retries = ?8, last_error = ?9,
                superseded_by = ?10, updated_at = ?11",
            params![
                node.id,
                task_id,
                node.kind.as_str(),
                node.scene_index.map(|v| v as i64),
                node.group_index.map(|v| v as i64),
                serde_json::to_string(&node.status)?,
                node.result_url,
                node.retries as i64,
                node.last_error,
                node.superseded_by,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn list_nodes(&self, task_id: &str) -> Result<Vec<NodeRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, kind, scene_index, group_index, status, result_url,
                    retries, last_error, superseded_by
             FROM asset_nodes WHERE task_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                let kind_str: String = row.get(1)?;
                let status_str: String = row.get(4)?;
                Ok(NodeRow {
                    id: row.get(0)?,
                    kind: kind_str,
                    scene_index: row.get::<_, Option<i64>>(2)?.map(|v| v as usize),
                    group_index: row.get::<_, Option<i64>>(3)?.map(|v| v as usize),
                    status: status_str,
                    result_url: row.get(5)?,
                    retries: row.get::<_, i64>(6)? as u32,
                    last_error: row.get(7)?,
                    superseded_by: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Stored node state as read back from the store.
#[derive(Debug, Clone)]
pub struct NodeRow {
    pub id: String,
    pub kind: String,
    pub scene_index: Option<usize>,
    pub group_index: Option<usize>,
    pub status: String,
    pub result_url: Option<String>,
    pub retries: u32,
    pub last_error: Option<String>,
    pub superseded_by: Option<String>,
}

impl NodeRow {
    pub fn status(&self) -> Option<NodeStatus> {
        serde_json::from_str(&self.status).ok()
    }

    pub fn kind(&self) -> Option<AssetKind> {
        serde_json::from_str(&format!("\"{}\"", self.kind)).ok()
    }
}
