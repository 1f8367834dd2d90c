use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;

use engine::compose::{CompositionPlan, TransitionStep};

#[derive(Debug, Clone, Deserialize)]
struct ProbeOutput {
    format: Option<FormatInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct FormatInfo {
    duration: Option<String>,
}

pub struct FFmpegWrapper;

impl FFmpegWrapper {
    /// Measured duration of a media file in seconds.
    pub async fn probe_duration(media_path: &Path) -> Result<f64> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "json",
                media_path.to_str().unwrap_or_default(),
            ])
            .output()
            .await
            .context("Failed to execute ffprobe. Make sure FFmpeg is installed.")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffprobe failed: {}", stderr);
        }

        let probe: ProbeOutput = serde_json::from_slice(&output.stdout)
            .context("Failed to parse ffprobe JSON output")?;
        probe
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .context("ffprobe reported no duration")
    }

    /// Time-stretch audio with atempo. factor > 1 shortens the track.
    pub async fn adjust_tempo(input: &Path, output: &Path, factor: f64) -> Result<()> {
        run_ffmpeg(&[
            "-i",
            input.to_str().unwrap_or_default(),
            "-filter:a",
            &format!("atempo={:.6}", factor),
            "-y",
            output.to_str().unwrap_or_default(),
        ])
        .await
        .context("ffmpeg atempo failed")
    }

    /// Loop an audio track `repeats` extra times, then trim to target.
    pub async fn loop_to_duration(
        input: &Path,
        output: &Path,
        repeats: u32,
        target_secs: f64,
    ) -> Result<()> {
        run_ffmpeg(&[
            "-stream_loop",
            &repeats.to_string(),
            "-i",
            input.to_str().unwrap_or_default(),
            "-t",
            &format!("{:.3}", target_secs),
            "-y",
            output.to_str().unwrap_or_default(),
        ])
        .await
        .context("ffmpeg loop failed")
    }

    /// Trim audio to target with a fade-out over the final window.
    pub async fn trim_with_fade(
        input: &Path,
        output: &Path,
        target_secs: f64,
        fade_secs: f64,
    ) -> Result<()> {
        let fade_start = (target_secs - fade_secs).max(0.0);
        run_ffmpeg(&[
            "-i",
            input.to_str().unwrap_or_default(),
            "-t",
            &format!("{:.3}", target_secs),
            "-filter:a",
            &format!("afade=t=out:st={:.3}:d={:.3}", fade_start, fade_secs),
            "-y",
            output.to_str().unwrap_or_default(),
        ])
        .await
        .context("ffmpeg trim/fade failed")
    }

    /// Replace a clip's audio track with the reconciled narration.
    pub async fn attach_narration(video: &Path, narration: &Path, output: &Path) -> Result<()> {
        run_ffmpeg(&[
            "-i",
            video.to_str().unwrap_or_default(),
            "-i",
            narration.to_str().unwrap_or_default(),
            "-map",
            "0:v:0",
            "-map",
            "1:a:0",
            "-c:v",
            "copy",
            "-shortest",
            "-y",
            output.to_str().unwrap_or_default(),
        ])
        .await
        .context("ffmpeg narration mux failed")
    }

    /// Concatenate scene clips applying the planned transitions as xfade /
    /// acrossfade windows between adjacent clips.
    pub async fn concat_with_transitions(
        clips: &[&Path],
        transitions: &[TransitionStep],
        output: &Path,
    ) -> Result<()> {
        if clips.is_empty() {
            anyhow::bail!("no clips to concatenate");
        }
        if clips.len() == 1 {
            return run_ffmpeg(&[
                "-i",
                clips[0].to_str().unwrap_or_default(),
                "-c",
                "copy",
                "-y",
                output.to_str().unwrap_or_default(),
            ])
            .await
            .context("ffmpeg single-clip copy failed");
        }

        let mut args: Vec<String> = Vec::new();
        for clip in clips {
            args.push("-i".to_string());
            args.push(clip.to_str().unwrap_or_default().to_string());
        }

        let mut filter = String::new();
        let mut v_in = "0:v".to_string();
        let mut a_in = "0:a".to_string();
        for (i, step) in transitions.iter().enumerate() {
            let next = i + 1;
            let v_out = format!("v{}", next);
            let a_out = format!("a{}", next);
            // xfade needs a non-zero window; cuts get a 1-frame fade.
            let dur = step.overlap_secs.max(0.04);
            filter.push_str(&format!(
                "[{v_in}][{next}:v]xfade=transition={}:duration={:.3}:offset={:.3}[{v_out}];",
                step.kind.xfade_name(),
                dur,
                step.offset_secs,
            ));
            filter.push_str(&format!(
                "[{a_in}][{next}:a]acrossfade=d={:.3}[{a_out}];",
                dur
            ));
            v_in = v_out;
            a_in = a_out;
        }
        let filter = filter.trim_end_matches(';').to_string();

        args.push("-filter_complex".to_string());
        args.push(filter);
        args.push("-map".to_string());
        args.push(format!("[{}]", v_in));
        args.push("-map".to_string());
        args.push(format!("[{}]", a_in));
        args.extend(
            [
                "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-c:a", "aac", "-b:a",
                "192k", "-y",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(output.to_str().unwrap_or_default().to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_ffmpeg(&arg_refs)
            .await
            .context("ffmpeg transition concat failed")
    }

    /// Overlay music spans onto the assembled video, normalizing loudness
    /// relative to the narration bed.
    pub async fn mix_music(video: &Path, plan: &CompositionPlan, output: &Path) -> Result<()> {
        if plan.music.is_empty() {
            tokio::fs::copy(video, output).await?;
            return Ok(());
        }

        let mut args: Vec<String> = vec![
            "-i".to_string(),
            video.to_str().unwrap_or_default().to_string(),
        ];
        for span in &plan.music {
            args.push("-i".to_string());
            args.push(span.path.clone());
        }

        let mut filter = String::new();
        let mut labels = vec!["[0:a]".to_string()];
        for (i, span) in plan.music.iter().enumerate() {
            let input = i + 1;
            let delay_ms = (span.start_secs * 1000.0).round() as i64;
            let span_secs = span.end_secs - span.start_secs;
            filter.push_str(&format!(
                "[{input}:a]atrim=0:{:.3},volume=0.25,adelay={delay_ms}|{delay_ms}[m{i}];",
                span_secs
            ));
            labels.push(format!("[m{}]", i));
        }
        filter.push_str(&format!(
            "{}amix=inputs={}:duration=first:normalize=0,loudnorm[aout]",
            labels.join(""),
            labels.len()
        ));

        args.push("-filter_complex".to_string());
        args.push(filter);
        args.extend(
            ["-map", "0:v", "-map", "[aout]", "-c:v", "copy", "-c:a", "aac", "-y"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(output.to_str().unwrap_or_default().to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_ffmpeg(&arg_refs).await.context("ffmpeg music mix failed")
    }

    /// Single-frame thumbnail from the assembled video.
    pub async fn thumbnail(video: &Path, at_secs: f64, output: &Path) -> Result<()> {
        run_ffmpeg(&[
            "-ss",
            &format!("{:.3}", at_secs),
            "-i",
            video.to_str().unwrap_or_default(),
            "-vframes",
            "1",
            "-vf",
            "scale=640:-1",
            "-y",
            output.to_str().unwrap_or_default(),
        ])
        .await
        .context("ffmpeg thumbnail failed")
    }
}

async fn run_ffmpeg(args: &[&str]) -> Result<()> {
    let output = Command::new("ffmpeg")
        .args(args)
        .output()
        .await
        .context("Failed to execute ffmpeg. Make sure FFmpeg is installed.")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffmpeg failed: {}", stderr);
    }
    Ok(())
}
