//! Final assembly: pulls completed assets, reconciles durations, runs the
//! composition plan through ffmpeg, and uploads the artifact + thumbnail.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use engine::compose::{build_plan, ClipInput, MusicInput};
use engine::graph::{AssetGraph, AssetKind};
use engine::script::ScriptBreakdown;

use crate::media::FFmpegWrapper;
use crate::reconcile::{reconcile_music, reconcile_narration};
use crate::storage::ObjectStorage;

pub struct ComposedArtifact {
    pub video_url: String,
    pub thumbnail_url: String,
    pub total_secs: f64,
}

pub struct Composer {
    storage: Arc<dyn ObjectStorage>,
    work_root: PathBuf,
    tolerance_secs: f64,
}

impl Composer {
    pub fn new(storage: Arc<dyn ObjectStorage>, work_root: PathBuf, tolerance_secs: f64) -> Self {
        Composer {
            storage,
            work_root,
            tolerance_secs,
        }
    }

    /// Assemble the final artifact from a fully generated graph.
    pub async fn compose(
        &self,
        task_id: &str,
        script: &ScriptBreakdown,
        graph: &AssetGraph,
    ) -> Result<ComposedArtifact> {
        let work_dir = self.work_root.join(task_id);
        tokio::fs::create_dir_all(&work_dir).await?;

        // Scene clips: motion video with reconciled narration muxed in.
        let mut clips = Vec::with_capacity(script.scenes.len());
        for scene in &script.scenes {
            let motion = graph
                .completed_for_scene(scene.index, AssetKind::MotionVideo)
                .with_context(|| format!("scene {} has no completed motion clip", scene.index))?;
            let narration = graph
                .completed_for_scene(scene.index, AssetKind::NarrationAudio)
                .with_context(|| format!("scene {} has no completed narration", scene.index))?;

            let motion_path = fetch_asset(
                motion.result_url.as_deref().unwrap_or_default(),
                &work_dir,
                &format!("motion-{}.mp4", scene.index),
            )
            .await?;
            let narration_path = fetch_asset(
                narration.result_url.as_deref().unwrap_or_default(),
                &work_dir,
                &format!("narration-{}.wav", scene.index),
            )
            .await?;

            let narration_path = reconcile_narration(
                scene.index,
                &narration_path,
                &work_dir,
                scene.duration_secs,
                self.tolerance_secs,
            )
            .await?;

            let clip_path = work_dir.join(format!("scene-{}.mp4", scene.index));
            FFmpegWrapper::attach_narration(&motion_path, &narration_path, &clip_path).await?;

            let measured = FFmpegWrapper::probe_duration(&clip_path).await?;
            clips.push(ClipInput {
                scene_index: scene.index,
                path: clip_path.to_string_lossy().into_owned(),
                measured_secs: measured,
            });
        }

        // Music tracks, reconciled to their group spans.
        let mut music = Vec::with_capacity(script.music_groups.len());
        for (group_index, group) in script.music_groups.iter().enumerate() {
            let node = graph
                .completed_for_group(group_index)
                .with_context(|| format!("music group {} has no completed track", group_index))?;
            let raw = fetch_asset(
                node.result_url.as_deref().unwrap_or_default(),
                &work_dir,
                &format!("music-{}.wav", group_index),
            )
            .await?;
            let reconciled = reconcile_music(
                group_index,
                &raw,
                &work_dir,
                group.target_duration_secs,
                self.tolerance_secs,
            )
            .await?;
            music.push(MusicInput {
                group_index,
                path: reconciled.to_string_lossy().into_owned(),
                scene_indexes: group.scene_indexes.clone(),
            });
        }

        let plan = build_plan(&script.scenes, &clips, &music, self.tolerance_secs)?;
        info!(
            task_id,
            clips = plan.clips.len(),
            total_secs = plan.total_secs,
            "composition plan built"
        );

        let clip_paths: Vec<PathBuf> = plan.clips.iter().map(|c| PathBuf::from(&c.path)).collect();
        let clip_refs: Vec<&Path> = clip_paths.iter().map(PathBuf::as_path).collect();

        let concat_path = work_dir.join("assembled.mp4");
        FFmpegWrapper::concat_with_transitions(&clip_refs, &plan.transitions, &concat_path).await?;

        let mixed_path = work_dir.join("final.mp4");
        FFmpegWrapper::mix_music(&concat_path, &plan, &mixed_path).await?;

        let thumb_path = work_dir.join("thumbnail.jpg");
        FFmpegWrapper::thumbnail(&mixed_path, plan.thumbnail_at_secs, &thumb_path).await?;

        let video_url = self.storage.put_file(&mixed_path).await?;
        let thumbnail_url = self.storage.put_file(&thumb_path).await?;

        Ok(ComposedArtifact {
            video_url,
            thumbnail_url,
            total_secs: plan.total_secs,
        })
    }
}

/// Materialize an asset reference into the task work dir. Generation
/// services hand back http URLs; adapters in tests hand back local paths.
async fn fetch_asset(url: &str, work_dir: &Path, file_name: &str) -> Result<PathBuf> {
    let dest = work_dir.join(file_name);
    if url.starts_with("http://") || url.starts_with("https://") {
        let response = reqwest::get(url)
            .await
            .with_context(|| format!("fetching asset {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!("asset fetch failed with {}: {}", response.status(), url);
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(&dest, &bytes).await?;
    } else {
        tokio::fs::copy(url, &dest)
            .await
            .with_context(|| format!("copying local asset {}", url))?;
    }
    Ok(dest)
}
