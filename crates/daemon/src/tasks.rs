//! Task lifecycle management.
//!
//! All task/node mutations funnel through the manager, which holds a per-task
//! async lock (single writer per task id) so progress events can never
//! interleave out of order. Percent is clamped non-decreasing until terminal.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use engine::graph::{AssetNode, NodeStatus};
use engine::script::TransitionKind;

use crate::db::Database;
use crate::events::{EventBus, ProgressEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    Generating,
    Composing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn stage(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Generating => "generating",
            TaskStatus::Composing => "composing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Incoming "prompt → video" request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRequest {
    pub prompt: String,
    pub duration_secs: u32,
    /// Caller-asserted identity; trusted as-is.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub character_consistency: bool,
    #[serde(default)]
    pub character_image_url: Option<String>,
    #[serde(default)]
    pub transition: Option<TransitionKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub owner: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub stage: String,
    pub message: Option<String>,
    pub error: Option<String>,
    pub failed_node_id: Option<String>,
    pub video_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct TaskManager {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    /// Per-task writer locks: the single-writer discipline.
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskManager {
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>) -> Self {
        TaskManager {
            db,
            bus,
            writers: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    fn writer(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.writers
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Cancellation token for a task; created on first use.
    pub fn cancel_token(&self, task_id: &str) -> CancellationToken {
        self.cancels
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Cooperative cancel: flags the token, the scheduler finishes the
    /// transition to Cancelled itself.
    pub fn request_cancel(&self, task_id: &str) {
        self.cancel_token(task_id).cancel();
    }

    pub fn create_task(&self, owner: &str, request: &VideoRequest) -> Result<Task> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (id, owner, prompt, request_json, status, progress, stage, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 'pending', ?6, ?6)",
            params![
                id,
                owner,
                request.prompt,
                serde_json::to_string(request)?,
                serde_json::to_string(&TaskStatus::Pending)?,
                now,
            ],
        )?;
        drop(conn);
        self.get_task(&id)?
            .ok_or_else(|| anyhow::anyhow!("task {} vanished after insert", id))
    }

    /// The original submission, as persisted at creation time.
    pub fn get_request(&self, task_id: &str) -> Result<Option<VideoRequest>> {
        let conn = self.db.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT request_json FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.db.conn.lock().unwrap();
        let task = conn
            .query_row(
                "SELECT id, owner, prompt, status, progress, stage, message, error,
                        failed_node_id, video_url, thumbnail_url, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![id],
                |row| {
                    let status_str: String = row.get(3)?;
                    let created_at_str: String = row.get(11)?;
                    let updated_at_str: String = row.get(12)?;
                    Ok((
                        Task {
                            id: row.get(0)?,
                            owner: row.get(1)?,
                            prompt: row.get(2)?,
                            status: serde_json::from_str(&status_str).map_err(|_| {
                                rusqlite::Error::InvalidColumnType(
                                    3,
                                    "TEXT".to_string(),
                                    rusqlite::types::Type::Text,
                                )
                            })?,
                            progress: row.get(4)?,
                            stage: row.get(5)?,
                            message: row.get(6)?,
                            error: row.get(7)?,
                            failed_node_id: row.get(8)?,
                            video_url: row.get(9)?,
                            thumbnail_url: row.get(10)?,
                            created_at: Utc::now(),
                            updated_at: Utc::now(),
                        },
                        created_at_str,
                        updated_at_str,
                    ))
                },
            )
            .optional()?;

        Ok(task.map(|(mut t, created, updated)| {
            if let Ok(dt) = DateTime::parse_from_rfc3339(&created) {
                t.created_at = dt.with_timezone(&Utc);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(&updated) {
                t.updated_at = dt.with_timezone(&Utc);
            }
            t
        }))
    }

    /// Move a task through the pipeline. Percent is clamped against the
    /// stored value so subscribers never observe a decrease; terminal states
    /// are final and further updates are ignored.
    pub async fn set_stage(
        &self,
        task_id: &str,
        status: TaskStatus,
        percent: f64,
        message: &str,
    ) -> Result<()> {
        let writer = self.writer(task_id);
        let _guard = writer.lock().await;

        let current = self
            .get_task(task_id)?
            .ok_or_else(|| anyhow::anyhow!("task {} not found", task_id))?;
        if current.status.is_terminal() {
            return Ok(());
        }
        let percent = percent.max(current.progress).min(100.0);
        let stage_changed = current.status != status;

        let now = Utc::now().to_rfc3339();
        {
            let conn = self.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE tasks SET status = ?1, progress = ?2, stage = ?3, message = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    serde_json::to_string(&status)?,
                    percent,
                    status.stage(),
                    message,
                    now,
                    task_id,
                ],
            )?;
        }

        if stage_changed {
            self.bus.publish(
                task_id,
                ProgressEvent::StageChanged {
                    task_id: task_id.to_string(),
                    stage: status.stage().to_string(),
                },
            );
        }
        self.bus.publish(
            task_id,
            ProgressEvent::TaskProgress {
                task_id: task_id.to_string(),
                percent,
                stage: status.stage().to_string(),
                message: message.to_string(),
            },
        );
        Ok(())
    }

    /// Persist a node state change and fan it out.
    pub async fn node_update(&self, task_id: &str, node: &AssetNode) -> Result<()> {
        let writer = self.writer(task_id);
        let _guard = writer.lock().await;
        self.db.upsert_node(task_id, node)?;
        self.bus.publish(
            task_id,
            ProgressEvent::NodeProgress {
                task_id: task_id.to_string(),
                node_id: node.id.clone(),
                kind: node.kind,
                status: node.status,
            },
        );
        Ok(())
    }

    pub async fn complete(&self, task_id: &str, video_url: &str, thumbnail_url: &str) -> Result<()> {
        let writer = self.writer(task_id);
        let _guard = writer.lock().await;

        let current = self
            .get_task(task_id)?
            .ok_or_else(|| anyhow::anyhow!("task {} not found", task_id))?;
        if current.status.is_terminal() {
            return Ok(());
        }

        // A cancel that landed during composition wins over the artifact.
        let cancel_requested = self
            .cancels
            .lock()
            .unwrap()
            .get(task_id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false);
        if cancel_requested {
            let now = Utc::now().to_rfc3339();
            {
                let conn = self.db.conn.lock().unwrap();
                conn.execute(
                    "UPDATE tasks SET status = ?1, stage = 'cancelled', error = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![
                        serde_json::to_string(&TaskStatus::Cancelled)?,
                        "cancelled by user",
                        now,
                        task_id,
                    ],
                )?;
            }
            self.bus.publish(
                task_id,
                ProgressEvent::Error {
                    task_id: task_id.to_string(),
                    message: "cancelled by user".to_string(),
                    node_id: None,
                },
            );
            self.release(task_id);
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        {
            let conn = self.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE tasks SET status = ?1, progress = 100, stage = 'completed',
                        video_url = ?2, thumbnail_url = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    serde_json::to_string(&TaskStatus::Completed)?,
                    video_url,
                    thumbnail_url,
                    now,
                    task_id,
                ],
            )?;
        }
        self.bus.publish(
            task_id,
            ProgressEvent::Completed {
                task_id: task_id.to_string(),
                video_url: video_url.to_string(),
                thumbnail_url: thumbnail_url.to_string(),
            },
        );
        self.release(task_id);
        Ok(())
    }

    /// Terminal failure (or cancellation/timeout). Emits exactly one error
    /// event carrying the originating node when there is one.
    pub async fn finish_with_error(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: &str,
        node_id: Option<&str>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        let writer = self.writer(task_id);
        let _guard = writer.lock().await;

        let current = self
            .get_task(task_id)?
            .ok_or_else(|| anyhow::anyhow!("task {} not found", task_id))?;
        if current.status.is_terminal() {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        {
            let conn = self.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE tasks SET status = ?1, stage = ?2, error = ?3, failed_node_id = ?4,
                        updated_at = ?5
                 WHERE id = ?6",
                params![
                    serde_json::to_string(&status)?,
                    status.stage(),
                    message,
                    node_id,
                    now,
                    task_id,
                ],
            )?;
        }
        self.bus.publish(
            task_id,
            ProgressEvent::Error {
                task_id: task_id.to_string(),
                message: message.to_string(),
                node_id: node_id.map(|s| s.to_string()),
            },
        );
        self.release(task_id);
        Ok(())
    }

    /// Drop the per-task channel, token, and writer lock once the terminal
    /// event is out. Subscribers drain whatever is buffered, then their
    /// stream closes.
    fn release(&self, task_id: &str) {
        self.bus.forget(task_id);
        self.cancels.lock().unwrap().remove(task_id);
        self.writers.lock().unwrap().remove(task_id);
    }

    /// Reopen a terminal task for a regeneration run. Clears the failure
    /// fields and hands out a fresh cancellation token; the new run ends with
    /// its own terminal event.
    pub async fn reopen(&self, task_id: &str) -> Result<()> {
        let writer = self.writer(task_id);
        let _guard = writer.lock().await;

        let current = self
            .get_task(task_id)?
            .ok_or_else(|| anyhow::anyhow!("task {} not found", task_id))?;
        if !current.status.is_terminal() {
            anyhow::bail!("task {} is still running", task_id);
        }

        let now = Utc::now().to_rfc3339();
        {
            let conn = self.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE tasks SET status = ?1, stage = 'pending', error = NULL,
                        failed_node_id = NULL, video_url = NULL, thumbnail_url = NULL,
                        updated_at = ?2
                 WHERE id = ?3",
                params![serde_json::to_string(&TaskStatus::Pending)?, now, task_id],
            )?;
        }
        self.cancels.lock().unwrap().remove(task_id);
        Ok(())
    }

    /// Crash recovery: tasks interrupted by a restart can never make further
    /// progress, so they are failed on boot. Their node rows are swept too,
    /// so a later regeneration rebuilds an all-terminal graph instead of one
    /// stuck mid-run.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let terminal: Vec<String> = [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled]
            .iter()
            .map(|s| serde_json::to_string(s))
            .collect::<Result<_, _>>()?;
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE tasks SET status = ?1, stage = 'failed', error = 'interrupted by restart', updated_at = ?2
             WHERE status NOT IN (?3, ?4, ?5)",
            params![
                serde_json::to_string(&TaskStatus::Failed)?,
                now,
                terminal[0],
                terminal[1],
                terminal[2],
            ],
        )?;

        let node_terminal: Vec<String> =
            [NodeStatus::Completed, NodeStatus::Failed, NodeStatus::Cancelled]
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<_, _>>()?;
        conn.execute(
            "UPDATE asset_nodes SET status = ?1, last_error = 'interrupted by restart', updated_at = ?2
             WHERE status NOT IN (?3, ?4, ?5)",
            params![
                serde_json::to_string(&NodeStatus::Failed)?,
                now,
                node_terminal[0],
                node_terminal[1],
                node_terminal[2],
            ],
        )?;
        Ok(count)
    }
}
