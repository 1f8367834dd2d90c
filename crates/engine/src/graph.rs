//! Asset dependency graph: one node per unit of generation work.
//!
//! Built from a script breakdown; the scheduler walks it with a ready-set.
//! Construction cannot produce a cycle, but the builder validates anyway
//! since a cyclic graph would wedge the scheduler.

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::script::ScriptBreakdown;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph contains a cycle at node {0}")]
    Cycle(String),
    #[error("node {0} not found in graph")]
    NodeNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    CharacterImage,
    SceneImage,
    NarrationAudio,
    Music,
    MotionVideo,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::CharacterImage => "character_image",
            AssetKind::SceneImage => "scene_image",
            AssetKind::NarrationAudio => "narration_audio",
            AssetKind::Music => "music",
            AssetKind::MotionVideo => "motion_video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetNode {
    pub id: String,
    pub kind: AssetKind,
    /// Scene this node belongs to; None for character and music nodes.
    pub scene_index: Option<usize>,
    /// Music group index; only set for Music nodes.
    pub group_index: Option<usize>,
    /// Generation prompt or narration text handed to the capability adapter.
    pub prompt: String,
    /// Target duration for time-based assets.
    pub duration_secs: Option<u32>,
    pub status: NodeStatus,
    pub result_url: Option<String>,
    pub retries: u32,
    pub last_error: Option<String>,
    /// Set when a regeneration created a replacement for this node.
    pub superseded_by: Option<String>,
}

impl AssetNode {
    fn new(kind: AssetKind, prompt: String) -> Self {
        AssetNode {
            id: Uuid::new_v4().to_string(),
            kind,
            scene_index: None,
            group_index: None,
            prompt,
            duration_secs: None,
            status: NodeStatus::Pending,
            result_url: None,
            retries: 0,
            last_error: None,
            superseded_by: None,
        }
    }
}

/// Directed graph of asset nodes with an id index for O(1) lookups.
pub struct AssetGraph {
    graph: DiGraph<AssetNode, ()>,
    index: HashMap<String, NodeIndex>,
}

impl AssetGraph {
    pub fn new() -> Self {
        AssetGraph {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Build the generation DAG from a script breakdown.
    ///
    /// Per scene: a scene_image and a narration_audio (no deps), and a
    /// motion_video depending on both. Per music group: a music node (no
    /// deps). A character_image without a user reference is a dependency of
    /// every scene_image.
    pub fn build(script: &ScriptBreakdown) -> Result<AssetGraph, GraphError> {
        let mut g = AssetGraph::new();

        // Character profiles without a reference image need a generated one.
        let mut character_node: Option<String> = None;
        for profile in &script.characters {
            if profile.reference_image_url.is_none() {
                let mut node = AssetNode::new(
                    AssetKind::CharacterImage,
                    format!("character reference: {}", profile.description),
                );
                node.duration_secs = None;
                character_node = Some(node.id.clone());
                g.add_node(node);
                break; // single lead character per current planner
            }
        }

        for scene in &script.scenes {
            let mut image = AssetNode::new(AssetKind::SceneImage, scene.visual_prompt.clone());
            image.scene_index = Some(scene.index);
            let image_id = image.id.clone();
            g.add_node(image);
            if let Some(ref char_id) = character_node {
                g.add_edge(char_id, &image_id)?;
            }

            let mut narration = AssetNode::new(AssetKind::NarrationAudio, scene.narration.clone());
            narration.scene_index = Some(scene.index);
            narration.duration_secs = Some(scene.duration_secs);
            let narration_id = narration.id.clone();
            g.add_node(narration);

            let mut motion = AssetNode::new(AssetKind::MotionVideo, scene.visual_prompt.clone());
            motion.scene_index = Some(scene.index);
            motion.duration_secs = Some(scene.duration_secs);
            let motion_id = motion.id.clone();
            g.add_node(motion);
            g.add_edge(&image_id, &motion_id)?;
            g.add_edge(&narration_id, &motion_id)?;
        }

        for (group_index, group) in script.music_groups.iter().enumerate() {
            let mut music = AssetNode::new(AssetKind::Music, group.prompt.clone());
            music.group_index = Some(group_index);
            music.duration_secs = Some(group.target_duration_secs);
            g.add_node(music);
        }

        g.validate()?;
        Ok(g)
    }

    pub fn add_node(&mut self, node: AssetNode) {
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(id, idx);
    }

    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let from_idx = self.node_index(from)?;
        let to_idx = self.node_index(to)?;
        self.graph.add_edge(from_idx, to_idx, ());
        Ok(())
    }

    fn node_index(&self, id: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))
    }

    /// Defensive acyclicity check; construction rules cannot produce a cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        if is_cyclic_directed(&self.graph) {
            let culprit = toposort(&self.graph, None)
                .err()
                .and_then(|c| self.graph.node_weight(c.node_id()))
                .map(|n| n.id.clone())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(GraphError::Cycle(culprit));
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&AssetNode> {
        self.index
            .get(id)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut AssetNode> {
        if let Some(&idx) = self.index.get(id) {
            self.graph.node_weight_mut(idx)
        } else {
            None
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &AssetNode> {
        self.graph.node_weights()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Ids of the direct dependencies of a node.
    pub fn dependencies(&self, id: &str) -> Vec<String> {
        match self.index.get(id) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, petgraph::Direction::Incoming)
                .filter_map(|n| self.graph.node_weight(n))
                .map(|n| n.id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Ids of every node reachable from `id` following dependency edges
    /// forward; these are the nodes that can never run once `id` fails.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = match self.index.get(id) {
            Some(&idx) => vec![idx],
            None => return out,
        };
        let mut seen = std::collections::HashSet::new();
        while let Some(idx) = stack.pop() {
            for next in self
                .graph
                .neighbors_directed(idx, petgraph::Direction::Outgoing)
            {
                if seen.insert(next) {
                    if let Some(node) = self.graph.node_weight(next) {
                        out.push(node.id.clone());
                    }
                    stack.push(next);
                }
            }
        }
        out
    }

    /// Nodes whose dependencies are all Completed and which have not been
    /// dispatched yet. Superseded nodes are history: never dispatched again,
    /// and ignored as dependencies (their replacement carries the edge).
    pub fn ready_nodes(&self) -> Vec<String> {
        self.graph
            .node_indices()
            .filter_map(|idx| {
                let node = self.graph.node_weight(idx)?;
                if node.status != NodeStatus::Pending || node.superseded_by.is_some() {
                    return None;
                }
                let deps_done = self
                    .graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|d| {
                                d.status == NodeStatus::Completed || d.superseded_by.is_some()
                            })
                            .unwrap_or(false)
                    });
                if deps_done {
                    Some(node.id.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Every live node is terminal; superseded history does not count.
    pub fn all_terminal(&self) -> bool {
        self.nodes()
            .filter(|n| n.superseded_by.is_none())
            .all(|n| n.status.is_terminal())
    }

    pub fn any_failed(&self) -> bool {
        self.nodes()
            .any(|n| n.superseded_by.is_none() && n.status == NodeStatus::Failed)
    }

    /// Completed node for a scene and kind, skipping superseded history.
    pub fn completed_for_scene(&self, scene_index: usize, kind: AssetKind) -> Option<&AssetNode> {
        self.nodes().find(|n| {
            n.scene_index == Some(scene_index)
                && n.kind == kind
                && n.status == NodeStatus::Completed
                && n.superseded_by.is_none()
        })
    }

    pub fn completed_for_group(&self, group_index: usize) -> Option<&AssetNode> {
        self.nodes().find(|n| {
            n.group_index == Some(group_index)
                && n.kind == AssetKind::Music
                && n.status == NodeStatus::Completed
                && n.superseded_by.is_none()
        })
    }

    /// Regeneration never mutates history: clone the node into a fresh
    /// Pending one, wire the same edges, and mark the original superseded.
    pub fn supersede(&mut self, id: &str) -> Result<String, GraphError> {
        let idx = self.node_index(id)?;
        let original = self
            .graph
            .node_weight(idx)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;

        let mut replacement = original.clone();
        replacement.id = Uuid::new_v4().to_string();
        replacement.status = NodeStatus::Pending;
        replacement.result_url = None;
        replacement.retries = 0;
        replacement.last_error = None;
        replacement.superseded_by = None;
        let new_id = replacement.id.clone();

        let deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .collect();
        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, petgraph::Direction::Outgoing)
            .collect();

        let new_idx = self.graph.add_node(replacement);
        self.index.insert(new_id.clone(), new_idx);
        for dep in deps {
            self.graph.add_edge(dep, new_idx, ());
        }
        for dependent in dependents {
            self.graph.add_edge(new_idx, dependent, ());
        }

        if let Some(node) = self.graph.node_weight_mut(idx) {
            node.superseded_by = Some(new_id.clone());
        }
        Ok(new_id)
    }
}

impl Default for AssetGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AssetGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetGraph")
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{plan, PlannerConfig};

    fn breakdown(total: u32, character: bool) -> ScriptBreakdown {
        let cfg = PlannerConfig {
            total_duration_secs: total,
            character_consistency: character,
            ..PlannerConfig::default()
        };
        plan(
            "A fox wakes at dawn. It crosses the valley. It reaches the sea.",
            &cfg,
        )
        .unwrap()
    }

    #[test]
    fn test_build_node_counts() {
        let script = breakdown(30, false);
        let g = AssetGraph::build(&script).unwrap();
        // 3 scenes x (image + narration + motion) + music groups
        let expected = 3 * 3 + script.music_groups.len();
        assert_eq!(g.node_count(), expected);
    }

    #[test]
    fn test_build_is_acyclic() {
        for total in [5, 15, 30, 60] {
            let script = breakdown(total, true);
            let g = AssetGraph::build(&script).unwrap();
            assert!(g.validate().is_ok());
        }
    }

    #[test]
    fn test_motion_depends_on_image_and_narration() {
        let script = breakdown(10, false);
        let g = AssetGraph::build(&script).unwrap();
        let motion = g
            .nodes()
            .find(|n| n.kind == AssetKind::MotionVideo)
            .unwrap();
        let deps: Vec<AssetKind> = g
            .dependencies(&motion.id)
            .iter()
            .map(|id| g.node(id).unwrap().kind)
            .collect();
        assert_eq!(deps.len(), 2);
        assert!(deps.contains(&AssetKind::SceneImage));
        assert!(deps.contains(&AssetKind::NarrationAudio));
    }

    #[test]
    fn test_character_image_feeds_every_scene_image() {
        let script = breakdown(30, true);
        let g = AssetGraph::build(&script).unwrap();
        let character = g
            .nodes()
            .find(|n| n.kind == AssetKind::CharacterImage)
            .unwrap();
        let dependents = g.transitive_dependents(&character.id);
        for node in g.nodes().filter(|n| n.kind == AssetKind::SceneImage) {
            assert!(dependents.contains(&node.id));
        }
    }

    #[test]
    fn test_user_reference_skips_character_node() {
        let cfg = PlannerConfig {
            total_duration_secs: 20,
            character_consistency: true,
            character_image_url: Some("http://example.com/ref.png".to_string()),
            ..PlannerConfig::default()
        };
        let script = plan("A knight rides north.", &cfg).unwrap();
        let g = AssetGraph::build(&script).unwrap();
        assert!(g.nodes().all(|n| n.kind != AssetKind::CharacterImage));
    }

    #[test]
    fn test_ready_nodes_respect_dependencies() {
        let script = breakdown(10, false);
        let mut g = AssetGraph::build(&script).unwrap();

        let ready: Vec<AssetKind> = g
            .ready_nodes()
            .iter()
            .map(|id| g.node(id).unwrap().kind)
            .collect();
        assert!(!ready.contains(&AssetKind::MotionVideo));

        // Complete image + narration; motion becomes ready.
        let ids: Vec<String> = g
            .nodes()
            .filter(|n| matches!(n.kind, AssetKind::SceneImage | AssetKind::NarrationAudio))
            .map(|n| n.id.clone())
            .collect();
        for id in ids {
            g.node_mut(&id).unwrap().status = NodeStatus::Completed;
        }
        let ready: Vec<AssetKind> = g
            .ready_nodes()
            .iter()
            .map(|id| g.node(id).unwrap().kind)
            .collect();
        assert!(ready.contains(&AssetKind::MotionVideo));
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = AssetGraph::new();
        let a = AssetNode::new(AssetKind::SceneImage, "a".to_string());
        let b = AssetNode::new(AssetKind::MotionVideo, "b".to_string());
        let (ida, idb) = (a.id.clone(), b.id.clone());
        g.add_node(a);
        g.add_node(b);
        g.add_edge(&ida, &idb).unwrap();
        g.add_edge(&idb, &ida).unwrap();
        assert!(matches!(g.validate(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_transitive_dependents_cascade_set() {
        let script = breakdown(10, true);
        let g = AssetGraph::build(&script).unwrap();
        let character = g
            .nodes()
            .find(|n| n.kind == AssetKind::CharacterImage)
            .unwrap();
        let dependents = g.transitive_dependents(&character.id);
        // character -> scene_image -> motion_video
        assert_eq!(dependents.len(), 2);
    }

    #[test]
    fn test_supersede_creates_replacement_preserving_edges() {
        let script = breakdown(10, false);
        let mut g = AssetGraph::build(&script).unwrap();
        let image_id = g
            .nodes()
            .find(|n| n.kind == AssetKind::SceneImage)
            .map(|n| n.id.clone())
            .unwrap();
        g.node_mut(&image_id).unwrap().status = NodeStatus::Failed;

        let new_id = g.supersede(&image_id).unwrap();

        let old = g.node(&image_id).unwrap();
        assert_eq!(old.status, NodeStatus::Failed);
        assert_eq!(old.superseded_by.as_deref(), Some(new_id.as_str()));

        let replacement = g.node(&new_id).unwrap();
        assert_eq!(replacement.status, NodeStatus::Pending);
        assert!(replacement.result_url.is_none());

        // Replacement still feeds the motion node.
        let dependents = g.transitive_dependents(&new_id);
        let motion = g
            .nodes()
            .find(|n| n.kind == AssetKind::MotionVideo)
            .unwrap();
        assert!(dependents.contains(&motion.id));
    }

    #[test]
    fn test_superseded_nodes_never_schedule_and_never_block() {
        let script = breakdown(10, false);
        let mut g = AssetGraph::build(&script).unwrap();
        let image_id = g
            .nodes()
            .find(|n| n.kind == AssetKind::SceneImage)
            .map(|n| n.id.clone())
            .unwrap();
        let narration_id = g
            .nodes()
            .find(|n| n.kind == AssetKind::NarrationAudio)
            .map(|n| n.id.clone())
            .unwrap();

        g.node_mut(&image_id).unwrap().status = NodeStatus::Failed;
        g.node_mut(&narration_id).unwrap().status = NodeStatus::Completed;
        let new_id = g.supersede(&image_id).unwrap();

        let ready = g.ready_nodes();
        assert!(ready.contains(&new_id));
        assert!(!ready.contains(&image_id));

        // Once the replacement completes, the motion node is unblocked even
        // though its old failed dependency is still in the graph.
        g.node_mut(&new_id).unwrap().status = NodeStatus::Completed;
        let ready: Vec<AssetKind> = g
            .ready_nodes()
            .iter()
            .map(|id| g.node(id).unwrap().kind)
            .collect();
        assert!(ready.contains(&AssetKind::MotionVideo));
    }
}
