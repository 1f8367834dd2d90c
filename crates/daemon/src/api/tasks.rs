//! Task endpoints: submit, poll, SSE progress, cancel, regenerate.
//!
//! The SSE stream replays a snapshot built from the store before handing
//! over to live bus events, so late joiners see current state immediately.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{sse::Event, sse::KeepAlive, Json, Sse},
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tracing::warn;

use engine::graph::NodeStatus;
use engine::script::{ScriptBreakdown, SHORT_SCENE_SECS};

use super::ApiState;
use crate::events::ProgressEvent;
use crate::scheduler::rebuild_graph;
use crate::tasks::{Task, TaskStatus, VideoRequest};

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", post(create_task))
        .route("/:id/status", get(task_status))
        .route("/:id/events", get(task_events))
        .route("/:id/cancel", post(cancel_task))
        .route("/:id/nodes/:node_id/regenerate", post(regenerate_node))
        .with_state(state)
}

/// Wire shape of the progress channel. Internal events collapse onto three
/// message types for clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    ProgressUpdate {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_kind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_status: Option<NodeStatus>,
    },
    Completion {
        task_id: String,
        video_url: String,
        thumbnail_url: String,
    },
    Error {
        task_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },
}

impl WireEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, WireEvent::Completion { .. } | WireEvent::Error { .. })
    }
}

impl From<ProgressEvent> for WireEvent {
    fn from(event: ProgressEvent) -> Self {
        match event {
            ProgressEvent::StageChanged { task_id, stage } => WireEvent::ProgressUpdate {
                task_id,
                percent: None,
                stage: Some(stage),
                message: None,
                node_id: None,
                node_kind: None,
                node_status: None,
            },
            ProgressEvent::TaskProgress {
                task_id,
                percent,
                stage,
                message,
            } => WireEvent::ProgressUpdate {
                task_id,
                percent: Some(percent),
                stage: Some(stage),
                message: Some(message),
                node_id: None,
                node_kind: None,
                node_status: None,
            },
            ProgressEvent::NodeProgress {
                task_id,
                node_id,
                kind,
                status,
            } => WireEvent::ProgressUpdate {
                task_id,
                percent: None,
                stage: None,
                message: None,
                node_id: Some(node_id),
                node_kind: Some(kind.as_str().to_string()),
                node_status: Some(status),
            },
            ProgressEvent::Completed {
                task_id,
                video_url,
                thumbnail_url,
            } => WireEvent::Completion {
                task_id,
                video_url,
                thumbnail_url,
            },
            ProgressEvent::Error {
                task_id,
                message,
                node_id,
            } => WireEvent::Error {
                task_id,
                message,
                node_id,
            },
        }
    }
}

fn sse_event(wire: &WireEvent) -> Event {
    let json = serde_json::to_string(wire).unwrap_or_else(|_| "{}".to_string());
    Event::default().data(json)
}

/// Progress replayed from the broadcast buffer can predate the snapshot a
/// late joiner already saw; anything below the running floor is stale and
/// dropped so percent never decreases on the wire.
fn admits_percent(wire: &WireEvent, floor: &mut f64) -> bool {
    match wire {
        WireEvent::ProgressUpdate {
            percent: Some(p), ..
        } => {
            if *p < *floor {
                false
            } else {
                *floor = *p;
                true
            }
        }
        _ => true,
    }
}

async fn create_task(
    State(state): State<ApiState>,
    Json(request): Json<VideoRequest>,
) -> Result<(StatusCode, Json<Task>), StatusCode> {
    if request.prompt.trim().is_empty() || request.duration_secs < SHORT_SCENE_SECS {
        return Err(StatusCode::BAD_REQUEST);
    }

    let owner = request.owner.clone().unwrap_or_else(|| "local".to_string());
    let task = state
        .tasks
        .create_task(&owner, &request)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    tokio::spawn(state.scheduler.clone().run_task(task.id.clone(), request));
    Ok((StatusCode::ACCEPTED, Json(task)))
}

#[derive(Serialize)]
struct NodeView {
    id: String,
    kind: String,
    status: Option<NodeStatus>,
    scene_index: Option<usize>,
    group_index: Option<usize>,
    result_url: Option<String>,
    retries: u32,
    last_error: Option<String>,
    superseded_by: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    task: Task,
    nodes: Vec<NodeView>,
}

/// Polling fallback for clients that cannot hold an SSE connection open.
async fn task_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, StatusCode> {
    let task = state
        .tasks
        .get_task(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let nodes = state
        .db
        .list_nodes(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .into_iter()
        .map(|row| NodeView {
            status: row.status(),
            id: row.id,
            kind: row.kind,
            scene_index: row.scene_index,
            group_index: row.group_index,
            result_url: row.result_url,
            retries: row.retries,
            last_error: row.last_error,
            superseded_by: row.superseded_by,
        })
        .collect();
    Ok(Json(StatusResponse { task, nodes }))
}

async fn task_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let task = state
        .tasks
        .get_task(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    // Subscribe before reading the snapshot so no live event is missed.
    let rx = state.bus.subscribe(&id);
    let nodes = state
        .db
        .list_nodes(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut snapshot: Vec<WireEvent> = Vec::new();
    for row in &nodes {
        snapshot.push(WireEvent::ProgressUpdate {
            task_id: id.clone(),
            percent: None,
            stage: None,
            message: None,
            node_id: Some(row.id.clone()),
            node_kind: Some(row.kind.clone()),
            node_status: row.status(),
        });
    }
    snapshot.push(WireEvent::ProgressUpdate {
        task_id: id.clone(),
        percent: Some(task.progress),
        stage: Some(task.stage.clone()),
        message: task.message.clone(),
        node_id: None,
        node_kind: None,
        node_status: None,
    });
    match task.status {
        TaskStatus::Completed => snapshot.push(WireEvent::Completion {
            task_id: id.clone(),
            video_url: task.video_url.clone().unwrap_or_default(),
            thumbnail_url: task.thumbnail_url.clone().unwrap_or_default(),
        }),
        TaskStatus::Failed | TaskStatus::Cancelled => snapshot.push(WireEvent::Error {
            task_id: id.clone(),
            message: task
                .error
                .clone()
                .unwrap_or_else(|| "task did not complete".to_string()),
            node_id: task.failed_node_id.clone(),
        }),
        _ => {}
    }
    let already_terminal = snapshot.iter().any(WireEvent::is_terminal);

    let snapshot_stream =
        stream::iter(snapshot.into_iter().map(|wire| Ok(sse_event(&wire))));

    // Live events until the task's terminal event has gone out. The snapshot
    // percent is the floor for live progress.
    let live = stream::unfold(
        (rx, already_terminal, task.progress),
        |(mut rx, done, mut floor)| async move {
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let wire = WireEvent::from(event);
                        if !admits_percent(&wire, &mut floor) {
                            continue;
                        }
                        let terminal = wire.is_terminal();
                        return Some((Ok(sse_event(&wire)), (rx, terminal, floor)));
                    }
                    Err(_) => return None,
                }
            }
        },
    );

    Ok(Sse::new(snapshot_stream.chain(live)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

/// Cooperative cancel: flags the task's token and returns immediately; the
/// terminal Cancelled event arrives on the progress channel once the
/// scheduler has wound the run down.
async fn cancel_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, StatusCode> {
    let task = state
        .tasks
        .get_task(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    if !task.status.is_terminal() {
        state.tasks.request_cancel(&id);
    }
    Ok(Json(task))
}

/// Targeted regeneration on a settled task: the node and everything built on
/// it are superseded by fresh pending nodes, then the task re-runs just that
/// branch and recomposes.
async fn regenerate_node(
    State(state): State<ApiState>,
    Path((id, node_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Task>), StatusCode> {
    let task = state
        .tasks
        .get_task(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    if !task.status.is_terminal() {
        return Err(StatusCode::CONFLICT);
    }

    let breakdown = state
        .db
        .get_json(&format!("task:{}:breakdown", id))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::CONFLICT)?;
    let script: ScriptBreakdown =
        serde_json::from_value(breakdown).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let rows = state
        .db
        .list_nodes(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let mut graph =
        rebuild_graph(&script, &rows).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match graph.node(&node_id) {
        None => return Err(StatusCode::NOT_FOUND),
        Some(node) if node.superseded_by.is_some() => return Err(StatusCode::CONFLICT),
        Some(_) => {}
    }

    // Superseded dependents are already history; only live nodes fork.
    let mut branch: Vec<String> = std::iter::once(node_id.clone())
        .chain(
            graph
                .transitive_dependents(&node_id)
                .into_iter()
                .filter(|dep_id| {
                    graph
                        .node(dep_id)
                        .map(|n| n.superseded_by.is_none())
                        .unwrap_or(false)
                }),
        )
        .collect();
    // The resumed run must be able to recompose, so any other live node that
    // never produced a result re-runs alongside the requested branch.
    for node in graph.nodes() {
        if node.superseded_by.is_none()
            && !branch.contains(&node.id)
            && matches!(node.status, NodeStatus::Failed | NodeStatus::Cancelled)
        {
            branch.push(node.id.clone());
        }
    }
    let mut touched = branch.clone();
    for old_id in &branch {
        let new_id = graph
            .supersede(old_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        touched.push(new_id);
    }

    state.tasks.reopen(&id).await.map_err(|e| {
        warn!(task_id = %id, error = %e, "reopen for regeneration refused");
        StatusCode::CONFLICT
    })?;
    for touched_id in &touched {
        if let Some(node) = graph.node(touched_id) {
            state
                .tasks
                .node_update(&id, node)
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        }
    }

    // A user-supplied character reference must survive regeneration.
    let character_ref = state
        .tasks
        .get_request(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .and_then(|r| r.character_image_url);
    tokio::spawn(
        state
            .scheduler
            .clone()
            .resume_task(id.clone(), script, graph, character_ref),
    );

    let task = state
        .tasks
        .get_task(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(percent: Option<f64>) -> WireEvent {
        WireEvent::ProgressUpdate {
            task_id: "t".to_string(),
            percent,
            stage: None,
            message: None,
            node_id: None,
            node_kind: None,
            node_status: None,
        }
    }

    #[test]
    fn test_stale_progress_below_snapshot_is_dropped() {
        // Snapshot showed 40; buffered events from before it must not replay.
        let mut floor = 40.0;
        assert!(!admits_percent(&progress(Some(30.0)), &mut floor));
        assert!(admits_percent(&progress(Some(40.0)), &mut floor));
        assert!(admits_percent(&progress(Some(55.0)), &mut floor));
        assert!(!admits_percent(&progress(Some(50.0)), &mut floor));
        assert_eq!(floor, 55.0);
    }

    #[test]
    fn test_events_without_percent_always_pass() {
        let mut floor = 80.0;
        assert!(admits_percent(&progress(None), &mut floor));
        assert!(admits_percent(
            &WireEvent::Completion {
                task_id: "t".to_string(),
                video_url: "v".to_string(),
                thumbnail_url: "th".to_string(),
            },
            &mut floor
        ));
        assert_eq!(floor, 80.0);
    }
}
