//! Composition planning: ordered clips, transition overlap accounting, and
//! music spans for the final assembly.
//!
//! Transitions overlap adjacent clips rather than extending the cut, so the
//! final runtime is the sum of scene durations minus the total overlap.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::script::{Scene, TransitionKind};

#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("scene {0} has no completed motion clip")]
    MissingClip(usize),
    #[error("music group {0} has no completed track")]
    MissingMusic(usize),
    #[error(
        "scene {scene_index} clip measures {measured_secs:.2}s, expected {expected_secs}s ± {tolerance_secs}s"
    )]
    ClipOutOfTolerance {
        scene_index: usize,
        measured_secs: f64,
        expected_secs: u32,
        tolerance_secs: f64,
    },
    #[error("no scenes to compose")]
    Empty,
}

/// One input clip, already generated and measured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipInput {
    pub scene_index: usize,
    pub path: String,
    pub measured_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicInput {
    pub group_index: usize,
    pub path: String,
    pub scene_indexes: Vec<usize>,
}

/// A clip placed on the output timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedClip {
    pub scene_index: usize,
    pub path: String,
    pub duration_secs: f64,
    /// Start position on the output timeline, overlap already applied.
    pub start_secs: f64,
}

/// Transition between clip i and clip i+1 of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionStep {
    pub kind: TransitionKind,
    /// xfade offset: where on the output timeline the transition begins.
    pub offset_secs: f64,
    pub overlap_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicSpan {
    pub group_index: usize,
    pub path: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionPlan {
    pub clips: Vec<PlacedClip>,
    pub transitions: Vec<TransitionStep>,
    pub music: Vec<MusicSpan>,
    pub total_secs: f64,
    /// Timestamp inside the first clip used for the thumbnail frame.
    pub thumbnail_at_secs: f64,
}

/// Build a composition plan from ordered scenes and their generated assets.
///
/// Validates that every scene has a clip within tolerance of its budget and
/// every music group has a track.
pub fn build_plan(
    scenes: &[Scene],
    clips: &[ClipInput],
    music: &[MusicInput],
    tolerance_secs: f64,
) -> Result<CompositionPlan, CompositionError> {
    if scenes.is_empty() {
        return Err(CompositionError::Empty);
    }

    let mut placed = Vec::with_capacity(scenes.len());
    let mut transitions = Vec::new();
    let mut cursor = 0.0_f64;

    for scene in scenes {
        let clip = clips
            .iter()
            .find(|c| c.scene_index == scene.index)
            .ok_or(CompositionError::MissingClip(scene.index))?;

        let expected = scene.duration_secs;
        if (clip.measured_secs - expected as f64).abs() > tolerance_secs {
            return Err(CompositionError::ClipOutOfTolerance {
                scene_index: scene.index,
                measured_secs: clip.measured_secs,
                expected_secs: expected,
                tolerance_secs,
            });
        }

        // Overlap with the previous clip eats into the cursor.
        if scene.index > 0 {
            let overlap = scene.transition.overlap_secs();
            cursor -= overlap;
            transitions.push(TransitionStep {
                kind: scene.transition,
                offset_secs: cursor,
                overlap_secs: overlap,
            });
        }

        placed.push(PlacedClip {
            scene_index: scene.index,
            path: clip.path.clone(),
            duration_secs: expected as f64,
            start_secs: cursor,
        });
        cursor += expected as f64;
    }

    let total_secs = cursor;

    let mut spans = Vec::with_capacity(music.len());
    for input in music {
        let first = *input
            .scene_indexes
            .first()
            .ok_or(CompositionError::MissingMusic(input.group_index))?;
        let last = input.scene_indexes.last().copied().unwrap_or(first);
        let start = placed
            .iter()
            .find(|c| c.scene_index == first)
            .map(|c| c.start_secs)
            .ok_or(CompositionError::MissingClip(first))?;
        let end = placed
            .iter()
            .find(|c| c.scene_index == last)
            .map(|c| c.start_secs + c.duration_secs)
            .ok_or(CompositionError::MissingClip(last))?;
        spans.push(MusicSpan {
            group_index: input.group_index,
            path: input.path.clone(),
            start_secs: start,
            end_secs: end.min(total_secs),
        });
    }

    Ok(CompositionPlan {
        thumbnail_at_secs: (placed[0].duration_secs / 2.0).min(2.0),
        clips: placed,
        transitions,
        music: spans,
        total_secs,
    })
}
