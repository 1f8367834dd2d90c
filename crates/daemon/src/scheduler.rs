//! DAG scheduler: drives a task from prompt to final artifact.
//!
//! Ready nodes (all dependencies Completed) are dispatched to the capability
//! adapter under a semaphore bound. Transient failures retry with
//! exponential backoff; exhausted nodes fail and cascade to every transitive
//! dependent without running them. Cancellation is cooperative: in-flight
//! calls are not aborted, their results are discarded on return.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use engine::graph::{AssetGraph, AssetKind, AssetNode, NodeStatus};
use engine::planner::{plan, PlannerConfig};
use engine::script::ScriptBreakdown;

use crate::adapters::{AssetRef, CapabilityAdapter, GenerationError, GenerationParams};
use crate::composer::Composer;
use crate::config::Config;
use crate::db::{Database, NodeRow};
use crate::tasks::{TaskManager, TaskStatus, VideoRequest};

/// Progress band occupied by generation; planning sits below, composition above.
const GEN_BAND_START: f64 = 10.0;
const GEN_BAND_END: f64 = 85.0;

#[derive(Debug, PartialEq)]
enum ExecOutcome {
    Finished,
    Failed { node_id: String, message: String },
    Cancelled,
}

enum WorkerMsg {
    Started(String),
    Retrying {
        node_id: String,
        attempt: u32,
        error: String,
    },
}

pub struct Scheduler {
    config: Config,
    db: Arc<Database>,
    tasks: Arc<TaskManager>,
    adapter: Arc<dyn CapabilityAdapter>,
    composer: Arc<Composer>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        db: Arc<Database>,
        tasks: Arc<TaskManager>,
        adapter: Arc<dyn CapabilityAdapter>,
        composer: Arc<Composer>,
    ) -> Self {
        Scheduler {
            config,
            db,
            tasks,
            adapter,
            composer,
        }
    }

    /// Run one task end to end. Terminal state and its single terminal event
    /// are always emitted here, whatever happens inside.
    pub async fn run_task(self: Arc<Self>, task_id: String, request: VideoRequest) {
        let token = self.tasks.cancel_token(&task_id);
        let deadline = Duration::from_secs(self.config.task_deadline_secs);

        let outcome = tokio::time::timeout(deadline, self.drive(&task_id, &request, &token)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(%task_id, "task deadline exceeded");
                let _ = self
                    .tasks
                    .finish_with_error(&task_id, TaskStatus::Failed, "task deadline exceeded", None)
                    .await;
                return;
            }
        };

        if let Err(e) = result {
            let _ = self
                .tasks
                .finish_with_error(&task_id, TaskStatus::Failed, &format!("{:#}", e), None)
                .await;
        }
    }

    /// Resume a reopened task after targeted regeneration. Completed nodes
    /// stay completed; only superseding replacements and their dependents
    /// run, then the task recomposes.
    pub async fn resume_task(
        self: Arc<Self>,
        task_id: String,
        script: ScriptBreakdown,
        mut graph: AssetGraph,
        character_ref: Option<String>,
    ) {
        let token = self.tasks.cancel_token(&task_id);
        let deadline = Duration::from_secs(self.config.task_deadline_secs);

        let run = async {
            self.tasks
                .set_stage(
                    &task_id,
                    TaskStatus::Generating,
                    GEN_BAND_START,
                    "regenerating assets",
                )
                .await?;
            let outcome = self
                .execute_graph(&task_id, &mut graph, &token, character_ref)
                .await?;
            match outcome {
                ExecOutcome::Cancelled => {
                    self.tasks
                        .finish_with_error(
                            &task_id,
                            TaskStatus::Cancelled,
                            "cancelled by user",
                            None,
                        )
                        .await
                }
                ExecOutcome::Failed { node_id, message } => {
                    self.tasks
                        .finish_with_error(&task_id, TaskStatus::Failed, &message, Some(&node_id))
                        .await
                }
                ExecOutcome::Finished => {
                    self.tasks
                        .set_stage(
                            &task_id,
                            TaskStatus::Composing,
                            GEN_BAND_END,
                            "composing video",
                        )
                        .await?;
                    self.finish(&task_id, &script, &graph, &token).await
                }
            }
        };

        let result = match tokio::time::timeout(deadline, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%task_id, "task deadline exceeded");
                let _ = self
                    .tasks
                    .finish_with_error(&task_id, TaskStatus::Failed, "task deadline exceeded", None)
                    .await;
                return;
            }
        };
        if let Err(e) = result {
            let _ = self
                .tasks
                .finish_with_error(&task_id, TaskStatus::Failed, &format!("{:#}", e), None)
                .await;
        }
    }

    async fn drive(
        &self,
        task_id: &str,
        request: &VideoRequest,
        token: &CancellationToken,
    ) -> Result<()> {
        self.tasks
            .set_stage(task_id, TaskStatus::Planning, 2.0, "planning script")
            .await?;

        let planner_config = PlannerConfig {
            total_duration_secs: request.duration_secs,
            remainder_policy: self.config.remainder_policy,
            character_consistency: request.character_consistency,
            character_image_url: request.character_image_url.clone(),
            transition: request
                .transition
                .unwrap_or(engine::script::TransitionKind::Fade),
        };
        let script = plan(&request.prompt, &planner_config)?;
        self.db.set_json(
            &format!("task:{}:breakdown", task_id),
            &serde_json::to_value(&script)?,
        )?;

        let mut graph = AssetGraph::build(&script)?;
        for node in graph.nodes() {
            self.tasks.node_update(task_id, node).await?;
        }
        info!(
            task_id,
            scenes = script.scenes.len(),
            nodes = graph.node_count(),
            "graph built"
        );

        self.tasks
            .set_stage(task_id, TaskStatus::Generating, GEN_BAND_START, "generating assets")
            .await?;

        let outcome = self
            .execute_graph(
                task_id,
                &mut graph,
                token,
                request.character_image_url.clone(),
            )
            .await?;

        match outcome {
            ExecOutcome::Cancelled => {
                self.tasks
                    .finish_with_error(task_id, TaskStatus::Cancelled, "cancelled by user", None)
                    .await?;
                Ok(())
            }
            ExecOutcome::Failed { node_id, message } => {
                self.tasks
                    .finish_with_error(task_id, TaskStatus::Failed, &message, Some(&node_id))
                    .await?;
                Ok(())
            }
            ExecOutcome::Finished => {
                self.tasks
                    .set_stage(task_id, TaskStatus::Composing, GEN_BAND_END, "composing video")
                    .await?;
                self.finish(task_id, &script, &graph, token).await
            }
        }
    }

    async fn finish(
        &self,
        task_id: &str,
        script: &ScriptBreakdown,
        graph: &AssetGraph,
        token: &CancellationToken,
    ) -> Result<()> {
        if token.is_cancelled() {
            self.tasks
                .finish_with_error(task_id, TaskStatus::Cancelled, "cancelled by user", None)
                .await?;
            return Ok(());
        }

        let artifact = self.composer.compose(task_id, script, graph).await?;
        info!(
            task_id,
            total_secs = artifact.total_secs,
            "composition complete"
        );
        self.tasks
            .complete(task_id, &artifact.video_url, &artifact.thumbnail_url)
            .await?;
        Ok(())
    }

    /// Execute the generation DAG. Returns once every node is terminal or
    /// unreachable; completed work on independent branches survives sibling
    /// failures and cancellation.
    async fn execute_graph(
        &self,
        task_id: &str,
        graph: &mut AssetGraph,
        token: &CancellationToken,
        user_character_ref: Option<String>,
    ) -> Result<ExecOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut join_set: JoinSet<(String, Result<AssetRef, GenerationError>)> = JoinSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMsg>();

        let total_nodes = graph.node_count() as f64;
        let mut completed_nodes = 0.0;
        let mut first_failure: Option<(String, String)> = None;
        let mut cancelled = false;
        let mut in_flight: HashSet<String> = HashSet::new();

        loop {
            if !cancelled && token.is_cancelled() {
                cancelled = true;
                self.cancel_unstarted(task_id, graph, &in_flight).await?;
            }

            if !cancelled {
                for node_id in graph.ready_nodes() {
                    let reference = match graph.node(&node_id).map(|n| n.kind) {
                        Some(AssetKind::SceneImage) => {
                            self.character_reference(graph, &user_character_ref)
                        }
                        _ => None,
                    };
                    let params = match graph.node_mut(&node_id) {
                        Some(node) => {
                            node.status = NodeStatus::Ready;
                            GenerationParams {
                                kind: node.kind,
                                prompt: node.prompt.clone(),
                                duration_secs: node.duration_secs,
                                scene_index: node.scene_index,
                                reference_image_url: reference,
                            }
                        }
                        None => continue,
                    };
                    if let Some(node) = graph.node(&node_id) {
                        self.tasks.node_update(task_id, node).await?;
                    }

                    in_flight.insert(node_id.clone());
                    join_set.spawn(run_node(
                        node_id,
                        params,
                        self.adapter.clone(),
                        semaphore.clone(),
                        tx.clone(),
                        token.clone(),
                        self.config.max_retries,
                        self.config.retry_backoff_ms,
                    ));
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = token.cancelled(), if !cancelled => {
                    // handled at the top of the loop
                    continue;
                }
                Some(msg) = rx.recv() => {
                    self.apply_worker_msg(task_id, graph, msg).await?;
                }
                Some(joined) = join_set.join_next() => {
                    let (node_id, result) = joined?;
                    in_flight.remove(&node_id);
                    match result {
                        _ if cancelled => {
                            // Result discarded: the task was cancelled while this
                            // call was in flight. Nodes already cancelled while
                            // queued keep their state.
                            let live = graph
                                .node(&node_id)
                                .map(|n| !n.status.is_terminal())
                                .unwrap_or(false);
                            if live {
                                self.set_node_status(
                                    task_id,
                                    graph,
                                    &node_id,
                                    NodeStatus::Cancelled,
                                )
                                .await?;
                            }
                        }
                        Ok(asset) => {
                            completed_nodes += 1.0;
                            if let Some(node) = graph.node_mut(&node_id) {
                                node.status = NodeStatus::Completed;
                                node.result_url = Some(asset.url);
                            }
                            if let Some(node) = graph.node(&node_id) {
                                self.tasks.node_update(task_id, node).await?;
                                let percent = GEN_BAND_START
                                    + (GEN_BAND_END - GEN_BAND_START) * completed_nodes
                                        / total_nodes;
                                self.tasks
                                    .set_stage(
                                        task_id,
                                        TaskStatus::Generating,
                                        percent,
                                        &format!("{} ready", node.kind.as_str()),
                                    )
                                    .await?;
                            }
                        }
                        Err(e) => {
                            let message = e.to_string();
                            warn!(task_id, %node_id, error = %message, "node failed after retries");
                            if let Some(node) = graph.node_mut(&node_id) {
                                node.status = NodeStatus::Failed;
                                node.last_error = Some(message.clone());
                            }
                            if let Some(node) = graph.node(&node_id) {
                                self.tasks.node_update(task_id, node).await?;
                            }

                            if first_failure.is_none() {
                                first_failure = Some((node_id.clone(), message.clone()));
                            }
                            // Fail-fast per branch: dependents can never run.
                            for dependent_id in graph.transitive_dependents(&node_id) {
                                let needs_update = graph
                                    .node(&dependent_id)
                                    .map(|n| !n.status.is_terminal())
                                    .unwrap_or(false);
                                if needs_update {
                                    if let Some(node) = graph.node_mut(&dependent_id) {
                                        node.status = NodeStatus::Failed;
                                        node.last_error =
                                            Some(format!("dependency {} failed", node_id));
                                    }
                                    if let Some(node) = graph.node(&dependent_id) {
                                        self.tasks.node_update(task_id, node).await?;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        if cancelled {
            return Ok(ExecOutcome::Cancelled);
        }
        if let Some((node_id, message)) = first_failure {
            return Ok(ExecOutcome::Failed { node_id, message });
        }
        debug_assert!(graph.all_terminal() && !graph.any_failed());
        Ok(ExecOutcome::Finished)
    }

    /// Reference image for scene generation: a completed character node wins
    /// over a user-supplied URL.
    fn character_reference(
        &self,
        graph: &AssetGraph,
        user_character_ref: &Option<String>,
    ) -> Option<String> {
        graph
            .nodes()
            .find(|n| {
                n.kind == AssetKind::CharacterImage
                    && n.status == NodeStatus::Completed
                    && n.superseded_by.is_none()
            })
            .and_then(|n| n.result_url.clone())
            .or_else(|| user_character_ref.clone())
    }

    async fn apply_worker_msg(
        &self,
        task_id: &str,
        graph: &mut AssetGraph,
        msg: WorkerMsg,
    ) -> Result<()> {
        match msg {
            WorkerMsg::Started(node_id) => {
                // A cancelled node stays cancelled even if its worker's
                // status message arrives late.
                if graph
                    .node(&node_id)
                    .map(|n| n.status.is_terminal())
                    .unwrap_or(true)
                {
                    return Ok(());
                }
                self.set_node_status(task_id, graph, &node_id, NodeStatus::Running)
                    .await
            }
            WorkerMsg::Retrying {
                node_id,
                attempt,
                error,
            } => {
                if graph
                    .node(&node_id)
                    .map(|n| n.status.is_terminal())
                    .unwrap_or(true)
                {
                    return Ok(());
                }
                if let Some(node) = graph.node_mut(&node_id) {
                    node.status = NodeStatus::Retrying;
                    node.retries = attempt;
                    node.last_error = Some(error);
                }
                if let Some(node) = graph.node(&node_id) {
                    self.tasks.node_update(task_id, node).await?;
                }
                Ok(())
            }
        }
    }

    async fn set_node_status(
        &self,
        task_id: &str,
        graph: &mut AssetGraph,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<()> {
        if let Some(node) = graph.node_mut(node_id) {
            node.status = status;
        }
        if let Some(node) = graph.node(node_id) {
            self.tasks.node_update(task_id, node).await?;
        }
        Ok(())
    }

    /// Nodes that never started are cancelled immediately; running ones are
    /// left to finish and have their results discarded. A dispatched node
    /// still Ready is queued behind the semaphore, so it counts as unstarted:
    /// its worker returns without ever calling the adapter.
    async fn cancel_unstarted(
        &self,
        task_id: &str,
        graph: &mut AssetGraph,
        in_flight: &HashSet<String>,
    ) -> Result<()> {
        let to_cancel: Vec<String> = graph
            .nodes()
            .filter(|n| {
                !n.status.is_terminal()
                    && (!in_flight.contains(&n.id) || n.status == NodeStatus::Ready)
            })
            .map(|n| n.id.clone())
            .collect();
        for node_id in to_cancel {
            self.set_node_status(task_id, graph, &node_id, NodeStatus::Cancelled)
                .await?;
        }
        Ok(())
    }
}

/// One node's worker: waits for a concurrency permit, then calls the adapter
/// with retry + exponential backoff. The adapter call is the only suspension
/// point that touches the outside world.
#[allow(clippy::too_many_arguments)]
async fn run_node(
    node_id: String,
    params: GenerationParams,
    adapter: Arc<dyn CapabilityAdapter>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<WorkerMsg>,
    token: CancellationToken,
    max_retries: u32,
    backoff_ms: u64,
) -> (String, Result<AssetRef, GenerationError>) {
    let _permit = match semaphore.acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
            return (
                node_id,
                Err(GenerationError::InvalidResponse("scheduler shut down".to_string())),
            )
        }
    };
    // Cancelled while queued behind the semaphore: never reach the adapter.
    if token.is_cancelled() {
        return (node_id, Err(GenerationError::Cancelled));
    }
    let _ = tx.send(WorkerMsg::Started(node_id.clone()));

    let mut attempt = 0;
    loop {
        match adapter.generate(&params).await {
            Ok(asset) => return (node_id, Ok(asset)),
            Err(e) if attempt < max_retries && !token.is_cancelled() => {
                attempt += 1;
                let _ = tx.send(WorkerMsg::Retrying {
                    node_id: node_id.clone(),
                    attempt,
                    error: e.to_string(),
                });
                let delay = backoff_ms.saturating_mul(1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if token.is_cancelled() {
                    return (node_id, Err(GenerationError::Cancelled));
                }
            }
            Err(e) => return (node_id, Err(e)),
        }
    }
}

/// Rebuild an asset graph from stored node rows. Prompts and durations are
/// recovered from the breakdown; edges follow the same structural rules the
/// original build used, so superseded history keeps its wiring.
pub fn rebuild_graph(script: &ScriptBreakdown, rows: &[NodeRow]) -> Result<AssetGraph> {
    let mut graph = AssetGraph::new();
    for row in rows {
        let kind = row
            .kind()
            .ok_or_else(|| anyhow::anyhow!("unknown node kind {:?}", row.kind))?;
        let status = row
            .status()
            .ok_or_else(|| anyhow::anyhow!("unknown node status {:?}", row.status))?;
        let (prompt, duration_secs) = node_text(script, kind, row.scene_index, row.group_index)?;
        graph.add_node(AssetNode {
            id: row.id.clone(),
            kind,
            scene_index: row.scene_index,
            group_index: row.group_index,
            prompt,
            duration_secs,
            status,
            result_url: row.result_url.clone(),
            retries: row.retries,
            last_error: row.last_error.clone(),
            superseded_by: row.superseded_by.clone(),
        });
    }

    let ids: Vec<(String, AssetKind, Option<usize>)> = rows
        .iter()
        .filter_map(|r| Some((r.id.clone(), r.kind()?, r.scene_index)))
        .collect();
    let characters: Vec<&String> = ids
        .iter()
        .filter(|(_, kind, _)| *kind == AssetKind::CharacterImage)
        .map(|(id, _, _)| id)
        .collect();
    for (id, kind, scene_index) in &ids {
        match kind {
            AssetKind::SceneImage => {
                for character_id in &characters {
                    graph.add_edge(character_id, id)?;
                }
            }
            AssetKind::MotionVideo => {
                for (dep_id, dep_kind, dep_scene) in &ids {
                    if dep_scene == scene_index
                        && matches!(
                            dep_kind,
                            AssetKind::SceneImage | AssetKind::NarrationAudio
                        )
                    {
                        graph.add_edge(dep_id, id)?;
                    }
                }
            }
            _ => {}
        }
    }
    graph.validate()?;
    Ok(graph)
}

fn node_text(
    script: &ScriptBreakdown,
    kind: AssetKind,
    scene_index: Option<usize>,
    group_index: Option<usize>,
) -> Result<(String, Option<u32>)> {
    let scene = |idx: Option<usize>| {
        idx.and_then(|i| script.scene(i))
            .ok_or_else(|| anyhow::anyhow!("node references missing scene {:?}", idx))
    };
    match kind {
        AssetKind::CharacterImage => {
            let description = script
                .characters
                .first()
                .map(|c| c.description.clone())
                .unwrap_or_default();
            Ok((format!("character reference: {}", description), None))
        }
        AssetKind::SceneImage => {
            let s = scene(scene_index)?;
            Ok((s.visual_prompt.clone(), None))
        }
        AssetKind::NarrationAudio => {
            let s = scene(scene_index)?;
            Ok((s.narration.clone(), Some(s.duration_secs)))
        }
        AssetKind::MotionVideo => {
            let s = scene(scene_index)?;
            Ok((s.visual_prompt.clone(), Some(s.duration_secs)))
        }
        AssetKind::Music => {
            let group = group_index
                .and_then(|i| script.music_groups.get(i))
                .ok_or_else(|| {
                    anyhow::anyhow!("node references missing music group {:?}", group_index)
                })?;
            Ok((group.prompt.clone(), Some(group.target_duration_secs)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::Composer;
    use crate::events::EventBus;
    use crate::storage::LocalStorage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        kind: AssetKind,
        scene_index: Option<usize>,
        reference: Option<String>,
    }

    /// Scripted adapter: per-kind/scene failure budgets, call log, optional
    /// per-call delay and concurrency tracking.
    struct MockAdapter {
        calls: Mutex<Vec<Call>>,
        // (kind, scene_index, remaining failures)
        failures: Mutex<Vec<(AssetKind, Option<usize>, u32)>>,
        delay: Duration,
        current: Mutex<usize>,
        max_seen: Mutex<usize>,
        block: Option<Arc<tokio::sync::Notify>>,
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    impl MockAdapter {
        fn new() -> Self {
            MockAdapter {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                delay: Duration::from_millis(5),
                current: Mutex::new(0),
                max_seen: Mutex::new(0),
                block: None,
                gate: None,
            }
        }

        fn fail(self, kind: AssetKind, scene_index: Option<usize>, times: u32) -> Self {
            self.failures.lock().unwrap().push((kind, scene_index, times));
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn max_concurrency_seen(&self) -> usize {
            *self.max_seen.lock().unwrap()
        }
    }

    #[async_trait]
    impl CapabilityAdapter for MockAdapter {
        async fn generate(&self, params: &GenerationParams) -> Result<AssetRef, GenerationError> {
            {
                let mut current = self.current.lock().unwrap();
                *current += 1;
                let mut max_seen = self.max_seen.lock().unwrap();
                *max_seen = (*max_seen).max(*current);
            }
            self.calls.lock().unwrap().push(Call {
                kind: params.kind,
                scene_index: params.scene_index,
                reference: params.reference_image_url.clone(),
            });

            // Block motion generation for the cancellation test.
            if let (Some(notify), AssetKind::MotionVideo) = (&self.block, params.kind) {
                notify.notified().await;
            }
            // Block every call until released.
            if let Some(notify) = &self.gate {
                notify.notified().await;
            }
            tokio::time::sleep(self.delay).await;
            *self.current.lock().unwrap() -= 1;

            let should_fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures
                    .iter_mut()
                    .find(|(k, s, n)| *k == params.kind && *s == params.scene_index && *n > 0)
                {
                    Some(entry) => {
                        entry.2 -= 1;
                        true
                    }
                    None => false,
                }
            };
            if should_fail {
                return Err(GenerationError::Service {
                    status: 500,
                    message: "synthetic failure".to_string(),
                });
            }
            Ok(AssetRef {
                url: format!("/tmp/assets/{}.bin", uuid::Uuid::new_v4()),
                duration_secs: params.duration_secs.map(|d| d as f64),
            })
        }
    }

    fn test_config() -> Config {
        let mut config = Config::from_env();
        config.max_concurrency = 2;
        config.max_retries = 2;
        config.retry_backoff_ms = 1;
        config
    }

    fn scheduler_with(adapter: Arc<MockAdapter>) -> (Arc<Scheduler>, Arc<TaskManager>) {
        scheduler_with_config(adapter, test_config())
    }

    fn scheduler_with_config(
        adapter: Arc<MockAdapter>,
        config: Config,
    ) -> (Arc<Scheduler>, Arc<TaskManager>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let tasks = Arc::new(TaskManager::new(db.clone(), bus));
        let dir = std::env::temp_dir().join(format!("reelsmith-test-{}", uuid::Uuid::new_v4()));
        let storage = Arc::new(
            LocalStorage::new(dir.join("store"), "http://localhost/media".to_string()).unwrap(),
        );
        let composer = Arc::new(Composer::new(storage, dir, 0.2));
        (
            Arc::new(Scheduler::new(config, db, tasks.clone(), adapter, composer)),
            tasks,
        )
    }

    fn graph_for(total_secs: u32) -> (ScriptBreakdown, AssetGraph) {
        let script = plan(
            "A fox wakes at dawn. It crosses the valley. It reaches the sea.",
            &PlannerConfig {
                total_duration_secs: total_secs,
                ..PlannerConfig::default()
            },
        )
        .unwrap();
        let graph = AssetGraph::build(&script).unwrap();
        (script, graph)
    }

    fn make_task(tasks: &TaskManager) -> String {
        tasks
            .create_task(
                "test-user",
                &VideoRequest {
                    prompt: "test".to_string(),
                    duration_secs: 30,
                    owner: None,
                    character_consistency: false,
                    character_image_url: None,
                    transition: None,
                },
            )
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_all_nodes_complete() {
        let adapter = Arc::new(MockAdapter::new());
        let (scheduler, tasks) = scheduler_with(adapter.clone());
        let task_id = make_task(&tasks);
        let (_, mut graph) = graph_for(30);
        let token = CancellationToken::new();

        let outcome = scheduler
            .execute_graph(&task_id, &mut graph, &token, None)
            .await
            .unwrap();

        assert_eq!(outcome, ExecOutcome::Finished);
        assert!(graph.nodes().all(|n| n.status == NodeStatus::Completed));
        assert!(graph.nodes().all(|n| n.result_url.is_some()));
        assert_eq!(adapter.calls().len(), graph.node_count());
    }

    #[tokio::test]
    async fn test_concurrency_bound_respected() {
        let adapter = Arc::new(MockAdapter::new());
        let (scheduler, tasks) = scheduler_with(adapter.clone());
        let task_id = make_task(&tasks);
        let (_, mut graph) = graph_for(60);
        let token = CancellationToken::new();

        scheduler
            .execute_graph(&task_id, &mut graph, &token, None)
            .await
            .unwrap();

        assert!(
            adapter.max_concurrency_seen() <= 2,
            "saw {} concurrent calls",
            adapter.max_concurrency_seen()
        );
    }

    #[tokio::test]
    async fn test_motion_never_runs_before_its_inputs() {
        let adapter = Arc::new(MockAdapter::new());
        let (scheduler, tasks) = scheduler_with(adapter.clone());
        let task_id = make_task(&tasks);
        let (_, mut graph) = graph_for(30);
        let token = CancellationToken::new();

        scheduler
            .execute_graph(&task_id, &mut graph, &token, None)
            .await
            .unwrap();

        let calls = adapter.calls();
        for scene in 0..3 {
            let motion_pos = calls
                .iter()
                .position(|c| c.kind == AssetKind::MotionVideo && c.scene_index == Some(scene))
                .unwrap();
            let image_pos = calls
                .iter()
                .position(|c| c.kind == AssetKind::SceneImage && c.scene_index == Some(scene))
                .unwrap();
            let narration_pos = calls
                .iter()
                .position(|c| c.kind == AssetKind::NarrationAudio && c.scene_index == Some(scene))
                .unwrap();
            assert!(motion_pos > image_pos);
            assert!(motion_pos > narration_pos);
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let adapter = Arc::new(MockAdapter::new().fail(AssetKind::SceneImage, Some(0), 1));
        let (scheduler, tasks) = scheduler_with(adapter.clone());
        let task_id = make_task(&tasks);
        let (_, mut graph) = graph_for(10);
        let token = CancellationToken::new();

        let outcome = scheduler
            .execute_graph(&task_id, &mut graph, &token, None)
            .await
            .unwrap();

        assert_eq!(outcome, ExecOutcome::Finished);
        let image = graph
            .nodes()
            .find(|n| n.kind == AssetKind::SceneImage)
            .unwrap();
        assert_eq!(image.status, NodeStatus::Completed);
        assert_eq!(image.retries, 1);
        // one failed call + one successful retry
        let image_calls = adapter
            .calls()
            .iter()
            .filter(|c| c.kind == AssetKind::SceneImage)
            .count();
        assert_eq!(image_calls, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_cascade_to_dependents() {
        // Fails the initial attempt plus both retries.
        let adapter = Arc::new(MockAdapter::new().fail(AssetKind::SceneImage, Some(0), 3));
        let (scheduler, tasks) = scheduler_with(adapter.clone());
        let task_id = make_task(&tasks);
        let (_, mut graph) = graph_for(10);
        let token = CancellationToken::new();

        let outcome = scheduler
            .execute_graph(&task_id, &mut graph, &token, None)
            .await
            .unwrap();

        let image = graph
            .nodes()
            .find(|n| n.kind == AssetKind::SceneImage)
            .unwrap();
        match outcome {
            ExecOutcome::Failed { node_id, .. } => assert_eq!(node_id, image.id),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(image.status, NodeStatus::Failed);

        // The dependent motion node failed without ever being dispatched.
        let motion = graph
            .nodes()
            .find(|n| n.kind == AssetKind::MotionVideo)
            .unwrap();
        assert_eq!(motion.status, NodeStatus::Failed);
        assert!(adapter
            .calls()
            .iter()
            .all(|c| c.kind != AssetKind::MotionVideo));

        // Independent siblings still completed and keep their results.
        let narration = graph
            .nodes()
            .find(|n| n.kind == AssetKind::NarrationAudio)
            .unwrap();
        assert_eq!(narration.status, NodeStatus::Completed);
        assert!(narration.result_url.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_retains_completed_discards_running() {
        let notify = Arc::new(tokio::sync::Notify::new());
        let mut adapter = MockAdapter::new();
        adapter.block = Some(notify.clone());
        let adapter = Arc::new(adapter);

        let (scheduler, tasks) = scheduler_with(adapter.clone());
        let task_id = make_task(&tasks);
        let (_, mut graph) = graph_for(10);
        let token = CancellationToken::new();

        // Cancel once the motion node is in flight (its inputs are done),
        // then release the blocked adapter call.
        let cancel_token = token.clone();
        let release = notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_token.cancel();
            release.notify_waiters();
        });

        let outcome = scheduler
            .execute_graph(&task_id, &mut graph, &token, None)
            .await
            .unwrap();

        assert_eq!(outcome, ExecOutcome::Cancelled);
        let image = graph
            .nodes()
            .find(|n| n.kind == AssetKind::SceneImage)
            .unwrap();
        let narration = graph
            .nodes()
            .find(|n| n.kind == AssetKind::NarrationAudio)
            .unwrap();
        let motion = graph
            .nodes()
            .find(|n| n.kind == AssetKind::MotionVideo)
            .unwrap();

        // Completed work retained, the in-flight node's result discarded.
        assert_eq!(image.status, NodeStatus::Completed);
        assert!(image.result_url.is_some());
        assert_eq!(narration.status, NodeStatus::Completed);
        assert_eq!(motion.status, NodeStatus::Cancelled);
        assert!(motion.result_url.is_none());
    }

    #[tokio::test]
    async fn test_cancel_skips_queued_nodes() {
        let notify = Arc::new(tokio::sync::Notify::new());
        let mut adapter = MockAdapter::new();
        adapter.gate = Some(notify.clone());
        let adapter = Arc::new(adapter);

        let mut config = test_config();
        config.max_concurrency = 1;
        let (scheduler, tasks) = scheduler_with_config(adapter.clone(), config);
        let task_id = make_task(&tasks);
        let (_, mut graph) = graph_for(10);
        let token = CancellationToken::new();

        // One node is in flight, the rest wait on the semaphore. Cancel while
        // everything is held, then release the blocked call.
        let cancel_token = token.clone();
        let release = notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_token.cancel();
            release.notify_waiters();
        });

        let outcome = scheduler
            .execute_graph(&task_id, &mut graph, &token, None)
            .await
            .unwrap();

        assert_eq!(outcome, ExecOutcome::Cancelled);
        // Only the in-flight node ever reached the adapter; the queued ones
        // were cancelled without being dispatched.
        assert_eq!(
            adapter.calls().len(),
            1,
            "queued nodes were dispatched after cancellation"
        );
        // The in-flight node's result was discarded, so every node ends
        // Cancelled.
        assert!(graph.nodes().all(|n| n.status == NodeStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_rebuild_graph_round_trips_structure() {
        let db = Database::in_memory().unwrap();
        {
            // asset_nodes carries a foreign key to tasks
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO tasks (id, owner, prompt, request_json, status, created_at, updated_at)
                 VALUES ('t', 'u', 'p', '{}', '\"pending\"', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        }
        let (script, graph) = graph_for(10);
        for node in graph.nodes() {
            db.upsert_node("t", node).unwrap();
        }

        let rows = db.list_nodes("t").unwrap();
        let rebuilt = rebuild_graph(&script, &rows).unwrap();

        assert_eq!(rebuilt.node_count(), graph.node_count());
        let motion = rebuilt
            .nodes()
            .find(|n| n.kind == AssetKind::MotionVideo)
            .unwrap();
        let deps = rebuilt.dependencies(&motion.id);
        assert_eq!(deps.len(), 2);
        assert_eq!(motion.duration_secs, Some(10));
    }

    #[tokio::test]
    async fn test_resume_runs_only_superseding_branch() {
        let adapter = Arc::new(MockAdapter::new());
        let (scheduler, tasks) = scheduler_with(adapter.clone());
        let task_id = make_task(&tasks);
        let (_, mut graph) = graph_for(10);
        let token = CancellationToken::new();

        // First run completes everything.
        scheduler
            .execute_graph(&task_id, &mut graph, &token, None)
            .await
            .unwrap();
        let calls_before = adapter.calls().len();

        // Regenerate the scene image: it and the motion node are superseded.
        let image_id = graph
            .nodes()
            .find(|n| n.kind == AssetKind::SceneImage)
            .map(|n| n.id.clone())
            .unwrap();
        let dependents = graph.transitive_dependents(&image_id);
        graph.supersede(&image_id).unwrap();
        for id in dependents {
            graph.supersede(&id).unwrap();
        }

        let outcome = scheduler
            .execute_graph(&task_id, &mut graph, &token, None)
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Finished);

        // Only the two replacements ran; narration and music were untouched.
        assert_eq!(adapter.calls().len(), calls_before + 2);
        let live_image = graph
            .nodes()
            .find(|n| n.kind == AssetKind::SceneImage && n.superseded_by.is_none())
            .unwrap();
        assert_eq!(live_image.status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_regenerated_scene_image_keeps_user_reference() {
        let adapter = Arc::new(MockAdapter::new());
        let (scheduler, tasks) = scheduler_with(adapter.clone());
        let task_id = make_task(&tasks);
        let (_, mut graph) = graph_for(10);
        let token = CancellationToken::new();
        let user_ref = Some("http://example.com/ref.png".to_string());

        scheduler
            .execute_graph(&task_id, &mut graph, &token, user_ref.clone())
            .await
            .unwrap();

        // Regenerate the scene image branch as the regenerate endpoint would.
        let image_id = graph
            .nodes()
            .find(|n| n.kind == AssetKind::SceneImage)
            .map(|n| n.id.clone())
            .unwrap();
        let dependents = graph.transitive_dependents(&image_id);
        graph.supersede(&image_id).unwrap();
        for id in dependents {
            graph.supersede(&id).unwrap();
        }

        let outcome = scheduler
            .execute_graph(&task_id, &mut graph, &token, user_ref)
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Finished);

        // Both the original and the regenerated scene image carried the
        // user-supplied character reference.
        let image_calls: Vec<Call> = adapter
            .calls()
            .into_iter()
            .filter(|c| c.kind == AssetKind::SceneImage)
            .collect();
        assert_eq!(image_calls.len(), 2);
        assert!(image_calls
            .iter()
            .all(|c| c.reference.as_deref() == Some("http://example.com/ref.png")));
    }

    #[tokio::test]
    async fn test_character_reference_flows_into_scene_images() {
        let adapter = Arc::new(MockAdapter::new());
        let (scheduler, tasks) = scheduler_with(adapter.clone());
        let task_id = make_task(&tasks);

        let script = plan(
            "A knight rides north.",
            &PlannerConfig {
                total_duration_secs: 10,
                character_consistency: true,
                ..PlannerConfig::default()
            },
        )
        .unwrap();
        let mut graph = AssetGraph::build(&script).unwrap();
        let token = CancellationToken::new();

        let outcome = scheduler
            .execute_graph(&task_id, &mut graph, &token, None)
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Finished);

        // character image generated before any scene image
        let calls = adapter.calls();
        let character_pos = calls
            .iter()
            .position(|c| c.kind == AssetKind::CharacterImage)
            .unwrap();
        let image_pos = calls
            .iter()
            .position(|c| c.kind == AssetKind::SceneImage)
            .unwrap();
        assert!(character_pos < image_pos);
    }
}
