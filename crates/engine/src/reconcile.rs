//! Duration reconciliation decisions.
//!
//! Generated audio rarely lands exactly on the scene grid. Narration gets a
//! tempo adjustment rather than a regeneration; music gets loop-extension or
//! trim-with-fade. Motion video durations come fixed from the image-to-video
//! contract and are never touched.

use thiserror::Error;

/// atempo only behaves well in this range; outside it the audio artifacts.
const MIN_TEMPO: f64 = 0.5;
const MAX_TEMPO: f64 = 2.0;

/// Fade applied when trimming an over-long music track.
pub const MUSIC_FADE_SECS: f64 = 1.5;

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error(
        "narration for scene {scene_index} is {measured_secs:.2}s against a {target_secs}s budget, beyond adjustable range"
    )]
    NarrationUnadjustable {
        scene_index: usize,
        measured_secs: f64,
        target_secs: u32,
    },
    #[error("asset duration could not be measured: {0}")]
    Unmeasurable(String),
}

/// Tempo adjustment for narration audio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedAdjustment {
    /// Factor for ffmpeg atempo: >1 speeds up (shortens), <1 slows down.
    pub factor: f64,
}

/// Decide whether narration needs a tempo adjustment.
///
/// Returns None when already within tolerance. Errors when the required
/// factor falls outside what atempo can do cleanly.
pub fn narration_adjustment(
    scene_index: usize,
    measured_secs: f64,
    target_secs: u32,
    tolerance_secs: f64,
) -> Result<Option<SpeedAdjustment>, ReconciliationError> {
    if measured_secs <= 0.0 {
        return Err(ReconciliationError::Unmeasurable(format!(
            "scene {} narration measured {}s",
            scene_index, measured_secs
        )));
    }
    let target = target_secs as f64;
    if (measured_secs - target).abs() <= tolerance_secs {
        return Ok(None);
    }
    let factor = measured_secs / target;
    if !(MIN_TEMPO..=MAX_TEMPO).contains(&factor) {
        return Err(ReconciliationError::NarrationUnadjustable {
            scene_index,
            measured_secs,
            target_secs,
        });
    }
    Ok(Some(SpeedAdjustment { factor }))
}

/// How to bring a music track to its group's target duration.
#[derive(Debug, Clone, PartialEq)]
pub enum MusicFix {
    /// Already within tolerance.
    None,
    /// Track is short: loop whole copies then trim to target.
    Loop { repeats: u32 },
    /// Track is long: trim to target with a fade-out.
    TrimFade { fade_secs: f64 },
}

pub fn music_adjustment(
    measured_secs: f64,
    target_secs: u32,
    tolerance_secs: f64,
) -> Result<MusicFix, ReconciliationError> {
    if measured_secs <= 0.0 {
        return Err(ReconciliationError::Unmeasurable(format!(
            "music measured {}s",
            measured_secs
        )));
    }
    let target = target_secs as f64;
    if (measured_secs - target).abs() <= tolerance_secs {
        return Ok(MusicFix::None);
    }
    if measured_secs < target {
        let repeats = (target / measured_secs).ceil() as u32;
        Ok(MusicFix::Loop { repeats })
    } else {
        Ok(MusicFix::TrimFade {
            fade_secs: MUSIC_FADE_SECS,
        })
    }
}
