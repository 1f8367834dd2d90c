use serde::{Deserialize, Serialize};

/// Scene lengths are quantized to these two values; motion synthesis only
/// supports fixed 5s/10s clips.
pub const SHORT_SCENE_SECS: u32 = 5;
pub const LONG_SCENE_SECS: u32 = 10;

/// Audio must land within this many seconds of its scene budget.
pub const DURATION_TOLERANCE_SECS: f64 = 0.2;

/// Overlap window consumed by a transition at each scene boundary.
pub const TRANSITION_SECS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Cut,
    Fade,
    Crossfade,
    SlideLeft,
    SlideRight,
}

impl TransitionKind {
    /// Name understood by ffmpeg's xfade filter.
    pub fn xfade_name(&self) -> &'static str {
        match self {
            TransitionKind::Cut => "fade", // zero-length fade, see overlap_secs
            TransitionKind::Fade => "fade",
            TransitionKind::Crossfade => "dissolve",
            TransitionKind::SlideLeft => "slideleft",
            TransitionKind::SlideRight => "slideright",
        }
    }

    /// Cuts consume no runtime; every other transition overlaps a fixed window.
    pub fn overlap_secs(&self) -> f64 {
        match self {
            TransitionKind::Cut => 0.0,
            _ => TRANSITION_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneState {
    Pending,
    Ready,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub index: usize,
    pub title: String,
    pub narration: String,
    pub visual_prompt: String,
    /// Hard constraint: 5 or 10 (Absorb remainder policy may stretch the
    /// final scene past the grid, see planner::RemainderPolicy).
    pub duration_secs: u32,
    pub transition: TransitionKind,
    pub state: SceneState,
    /// Mood tag used by the music grouping heuristic.
    pub mood: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicGroup {
    /// Contiguous scene indexes covered by one music track.
    pub scene_indexes: Vec<usize>,
    pub prompt: String,
    pub target_duration_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    pub description: String,
    /// User-supplied reference image; when absent a character_image node is
    /// generated and every scene image depends on it.
    pub reference_image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptBreakdown {
    pub scenes: Vec<Scene>,
    pub music_groups: Vec<MusicGroup>,
    pub characters: Vec<CharacterProfile>,
    pub total_duration_secs: u32,
}

impl ScriptBreakdown {
    pub fn scene(&self, index: usize) -> Option<&Scene> {
        self.scenes.get(index)
    }

    /// Sum of scene durations; equals total_duration_secs for the RoundUp
    /// remainder policy.
    pub fn planned_secs(&self) -> u32 {
        self.scenes.iter().map(|s| s.duration_secs).sum()
    }
}
