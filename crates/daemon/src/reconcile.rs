//! Applies duration reconciliation: ffprobe measures, the engine decides,
//! ffmpeg adjusts. Narration gets one adjustment retry before the scene is
//! declared unreconcilable.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

use engine::reconcile::{music_adjustment, narration_adjustment, MusicFix, ReconciliationError};

use crate::media::FFmpegWrapper;

/// Bring narration audio within tolerance of its scene budget.
///
/// Returns the path of the reconciled file (the input itself when already in
/// tolerance).
pub async fn reconcile_narration(
    scene_index: usize,
    input: &Path,
    work_dir: &Path,
    target_secs: u32,
    tolerance_secs: f64,
) -> Result<PathBuf> {
    let mut current = input.to_path_buf();
    // Initial pass plus one retry; atempo rounding can leave a sliver.
    for attempt in 0..2 {
        let measured = FFmpegWrapper::probe_duration(&current).await?;
        match narration_adjustment(scene_index, measured, target_secs, tolerance_secs)? {
            None => return Ok(current),
            Some(adj) => {
                let out = work_dir.join(format!(
                    "narration-{}-adjusted-{}.wav",
                    scene_index, attempt
                ));
                info!(
                    scene_index,
                    measured, factor = adj.factor, "adjusting narration tempo"
                );
                FFmpegWrapper::adjust_tempo(&current, &out, adj.factor).await?;
                current = out;
            }
        }
    }

    let measured = FFmpegWrapper::probe_duration(&current).await?;
    if (measured - target_secs as f64).abs() <= tolerance_secs {
        Ok(current)
    } else {
        Err(ReconciliationError::NarrationUnadjustable {
            scene_index,
            measured_secs: measured,
            target_secs,
        }
        .into())
    }
}

/// Bring a music track to its group's target duration: loop-extend when
/// short, trim with a fade-out when long.
pub async fn reconcile_music(
    group_index: usize,
    input: &Path,
    work_dir: &Path,
    target_secs: u32,
    tolerance_secs: f64,
) -> Result<PathBuf> {
    let measured = FFmpegWrapper::probe_duration(input).await?;
    match music_adjustment(measured, target_secs, tolerance_secs)? {
        MusicFix::None => Ok(input.to_path_buf()),
        MusicFix::Loop { repeats } => {
            let out = work_dir.join(format!("music-{}-looped.wav", group_index));
            info!(group_index, measured, repeats, "loop-extending music");
            FFmpegWrapper::loop_to_duration(input, &out, repeats, target_secs as f64).await?;
            Ok(out)
        }
        MusicFix::TrimFade { fade_secs } => {
            let out = work_dir.join(format!("music-{}-trimmed.wav", group_index));
            info!(group_index, measured, "trimming music with fade");
            FFmpegWrapper::trim_with_fade(input, &out, target_secs as f64, fade_secs).await?;
            Ok(out)
        }
    }
}
