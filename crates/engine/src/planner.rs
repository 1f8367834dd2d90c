//! Scene Planner: turns a prompt request into a quantized script breakdown.
//!
//! Durations are split greedily into 10-second chunks with a trailing
//! 5-second chunk for any remainder. Adjacent scenes sharing a mood tag are
//! clustered into music groups; a group boundary never splits a scene.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::script::{
    CharacterProfile, MusicGroup, Scene, SceneState, ScriptBreakdown, TransitionKind,
    LONG_SCENE_SECS, SHORT_SCENE_SECS,
};

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("prompt is empty, cannot decompose into scenes")]
    EmptyPrompt,
    #[error("requested duration {0}s is below the minimum scene length")]
    DurationTooShort(u32),
}

/// What to do when the requested total is not a multiple of 5.
///
/// The source materials conflict on this; RoundUp keeps the 5/10 scene
/// invariant, Absorb keeps the exact requested length by letting the last
/// scene carry the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    RoundUp,
    Absorb,
}

impl Default for RemainderPolicy {
    fn default() -> Self {
        RemainderPolicy::RoundUp
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub total_duration_secs: u32,
    #[serde(default)]
    pub remainder_policy: RemainderPolicy,
    #[serde(default)]
    pub character_consistency: bool,
    /// User-supplied character reference; skips the character_image node.
    #[serde(default)]
    pub character_image_url: Option<String>,
    #[serde(default = "default_transition")]
    pub transition: TransitionKind,
}

fn default_transition() -> TransitionKind {
    TransitionKind::Fade
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            total_duration_secs: 30,
            remainder_policy: RemainderPolicy::default(),
            character_consistency: false,
            character_image_url: None,
            transition: TransitionKind::Fade,
        }
    }
}

/// Split a total duration into quantized scene chunks.
///
/// Prefers 10s chunks with a trailing 5s chunk. Under Absorb, a non-multiple
/// remainder is folded into the final chunk; under RoundUp the total is first
/// snapped up to the next multiple of 5.
pub fn quantize_durations(total_secs: u32, policy: RemainderPolicy) -> Vec<u32> {
    let (grid_total, extra) = match policy {
        RemainderPolicy::RoundUp => (total_secs.div_ceil(SHORT_SCENE_SECS) * SHORT_SCENE_SECS, 0),
        RemainderPolicy::Absorb => {
            let rem = total_secs % SHORT_SCENE_SECS;
            (total_secs - rem, rem)
        }
    };

    let mut chunks = Vec::new();
    let mut remaining = grid_total;
    while remaining >= LONG_SCENE_SECS {
        chunks.push(LONG_SCENE_SECS);
        remaining -= LONG_SCENE_SECS;
    }
    if remaining > 0 {
        chunks.push(remaining); // always SHORT_SCENE_SECS on the 5s grid
    }
    if extra > 0 {
        if let Some(last) = chunks.last_mut() {
            *last += extra;
        } else {
            chunks.push(extra);
        }
    }
    chunks
}

/// Plan a prompt into an ordered script breakdown.
pub fn plan(prompt: &str, config: &PlannerConfig) -> Result<ScriptBreakdown, PlanningError> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(PlanningError::EmptyPrompt);
    }
    if config.total_duration_secs < SHORT_SCENE_SECS {
        return Err(PlanningError::DurationTooShort(config.total_duration_secs));
    }

    let durations = quantize_durations(config.total_duration_secs, config.remainder_policy);
    let beats = split_beats(prompt, durations.len());

    let scenes: Vec<Scene> = durations
        .iter()
        .enumerate()
        .map(|(index, &duration_secs)| {
            let beat = &beats[index.min(beats.len() - 1)];
            Scene {
                index,
                title: format!("Scene {}", index + 1),
                narration: beat.clone(),
                visual_prompt: format!("{}. {}", prompt_summary(prompt), beat),
                duration_secs,
                transition: config.transition,
                state: SceneState::Pending,
                mood: mood_tag(beat),
            }
        })
        .collect();

    let music_groups = group_music(&scenes, prompt);

    let characters = if config.character_consistency {
        vec![CharacterProfile {
            name: "lead".to_string(),
            description: prompt_summary(prompt),
            reference_image_url: config.character_image_url.clone(),
        }]
    } else {
        Vec::new()
    };

    Ok(ScriptBreakdown {
        total_duration_secs: scenes.iter().map(|s| s.duration_secs).sum(),
        scenes,
        music_groups,
        characters,
    })
}

/// Split the prompt into one narration beat per scene.
///
/// Sentences are distributed round-robin-free: consecutive sentences are
/// merged so each scene gets a contiguous slice of the prompt.
fn split_beats(prompt: &str, scene_count: usize) -> Vec<String> {
    let sentences: Vec<&str> = prompt
        .split_terminator(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if sentences.is_empty() {
        return vec![prompt.to_string(); scene_count];
    }

    let per_scene = sentences.len().div_ceil(scene_count);
    let mut beats: Vec<String> = sentences
        .chunks(per_scene)
        .map(|chunk| chunk.join(". "))
        .collect();

    // Fewer sentences than scenes: reuse the last beat so every scene has
    // narration text.
    while beats.len() < scene_count {
        beats.push(beats.last().cloned().unwrap_or_else(|| prompt.to_string()));
    }
    beats.truncate(scene_count);
    beats
}

fn prompt_summary(prompt: &str) -> String {
    let words: Vec<&str> = prompt.split_whitespace().take(12).collect();
    words.join(" ")
}

const MOOD_KEYWORDS: &[(&str, &[&str])] = &[
    ("tense", &["storm", "chase", "danger", "dark", "fight", "escape"]),
    ("upbeat", &["celebrate", "party", "happy", "sunny", "win", "joy"]),
    ("calm", &["quiet", "peace", "gentle", "slow", "morning", "rest"]),
];

/// Cheap mood heuristic over the beat text; falls back to "neutral".
fn mood_tag(beat: &str) -> String {
    let lower = beat.to_lowercase();
    for (mood, keywords) in MOOD_KEYWORDS {
        if keywords.iter().any(|k| lower.contains(k)) {
            return (*mood).to_string();
        }
    }
    "neutral".to_string()
}

/// Cluster contiguous scenes with the same mood into music groups.
fn group_music(scenes: &[Scene], prompt: &str) -> Vec<MusicGroup> {
    let mut groups: Vec<MusicGroup> = Vec::new();
    for scene in scenes {
        match groups.last_mut() {
            Some(group)
                if group
                    .scene_indexes
                    .last()
                    .is_some_and(|&i| scenes[i].mood == scene.mood) =>
            {
                group.scene_indexes.push(scene.index);
                group.target_duration_secs += scene.duration_secs;
            }
            _ => groups.push(MusicGroup {
                scene_indexes: vec![scene.index],
                prompt: format!("{} background music, {}", scene.mood, prompt_summary(prompt)),
                target_duration_secs: scene.duration_secs,
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(total: u32) -> PlannerConfig {
        PlannerConfig {
            total_duration_secs: total,
            ..PlannerConfig::default()
        }
    }

    #[test]
    fn test_quantize_multiple_of_ten() {
        assert_eq!(
            quantize_durations(30, RemainderPolicy::RoundUp),
            vec![10, 10, 10]
        );
    }

    #[test]
    fn test_quantize_trailing_five() {
        assert_eq!(
            quantize_durations(25, RemainderPolicy::RoundUp),
            vec![10, 10, 5]
        );
        assert_eq!(quantize_durations(5, RemainderPolicy::RoundUp), vec![5]);
    }

    #[test]
    fn test_quantize_round_up_off_grid() {
        // 12 rounds up to 15
        assert_eq!(
            quantize_durations(12, RemainderPolicy::RoundUp),
            vec![10, 5]
        );
    }

    #[test]
    fn test_quantize_absorb_off_grid() {
        // last chunk absorbs the 2s remainder
        assert_eq!(quantize_durations(12, RemainderPolicy::Absorb), vec![12]);
        assert_eq!(
            quantize_durations(27, RemainderPolicy::Absorb),
            vec![10, 10, 7]
        );
    }

    #[test]
    fn test_plan_thirty_seconds_yields_three_scenes() {
        let breakdown = plan(
            "A fox wakes at dawn. It crosses the valley. It reaches the sea.",
            &config(30),
        )
        .unwrap();

        assert_eq!(breakdown.scenes.len(), 3);
        assert!(breakdown.scenes.iter().all(|s| s.duration_secs == 10));
        assert_eq!(breakdown.total_duration_secs, 30);
        assert_eq!(breakdown.planned_secs(), 30);
    }

    #[test]
    fn test_scene_durations_on_grid() {
        for total in [5, 10, 15, 20, 35, 60, 47] {
            let breakdown = plan("A day in the life of a lighthouse keeper.", &config(total)).unwrap();
            for scene in &breakdown.scenes {
                assert!(
                    scene.duration_secs == 5 || scene.duration_secs == 10,
                    "scene {} has off-grid duration {} for total {}",
                    scene.index,
                    scene.duration_secs,
                    total
                );
            }
        }
    }

    #[test]
    fn test_plan_empty_prompt_fails() {
        assert!(matches!(
            plan("   ", &config(30)),
            Err(PlanningError::EmptyPrompt)
        ));
    }

    #[test]
    fn test_plan_too_short_fails() {
        assert!(matches!(
            plan("A story", &config(3)),
            Err(PlanningError::DurationTooShort(3))
        ));
    }

    #[test]
    fn test_music_group_durations_sum_to_members() {
        let breakdown = plan(
            "The storm breaks over the cliffs. The chase begins in the dark. A quiet morning follows. Gentle peace returns.",
            &config(40),
        )
        .unwrap();

        for group in &breakdown.music_groups {
            let sum: u32 = group
                .scene_indexes
                .iter()
                .map(|&i| breakdown.scenes[i].duration_secs)
                .sum();
            assert_eq!(group.target_duration_secs, sum);
        }
    }

    #[test]
    fn test_music_groups_are_contiguous_and_cover_all_scenes() {
        let breakdown = plan(
            "The storm rages. Danger everywhere. Then a happy celebration. Sunny skies win the day.",
            &config(40),
        )
        .unwrap();

        let mut covered = Vec::new();
        for group in &breakdown.music_groups {
            for pair in group.scene_indexes.windows(2) {
                assert_eq!(pair[1], pair[0] + 1, "group indexes must be contiguous");
            }
            covered.extend_from_slice(&group.scene_indexes);
        }
        let expected: Vec<usize> = (0..breakdown.scenes.len()).collect();
        assert_eq!(covered, expected);
    }

    #[test]
    fn test_character_profile_declared_when_requested() {
        let mut cfg = config(20);
        cfg.character_consistency = true;
        let breakdown = plan("A knight rides north.", &cfg).unwrap();
        assert_eq!(breakdown.characters.len(), 1);
        assert!(breakdown.characters[0].reference_image_url.is_none());

        cfg.character_image_url = Some("http://example.com/ref.png".to_string());
        let breakdown = plan("A knight rides north.", &cfg).unwrap();
        assert_eq!(
            breakdown.characters[0].reference_image_url.as_deref(),
            Some("http://example.com/ref.png")
        );
    }
}
