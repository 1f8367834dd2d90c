use std::path::PathBuf;

use engine::planner::RemainderPolicy;
use engine::script::DURATION_TOLERANCE_SECS;

/// Runtime configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    pub media_dir: PathBuf,
    /// Base URL of the generation service the capability adapter talks to.
    pub adapter_base_url: String,
    /// Concurrent adapter calls per task; bounded by external rate limits.
    pub max_concurrency: usize,
    /// Retries after the initial attempt for a transient generation failure.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Hard wall-clock deadline for one task.
    pub task_deadline_secs: u64,
    pub duration_tolerance_secs: f64,
    pub remainder_policy: RemainderPolicy,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            port: env_parse("REELSMITH_PORT", 7801),
            db_path: PathBuf::from(
                std::env::var("REELSMITH_DB").unwrap_or_else(|_| ".cache/reelsmith.db".to_string()),
            ),
            media_dir: PathBuf::from(
                std::env::var("REELSMITH_MEDIA_DIR")
                    .unwrap_or_else(|_| ".cache/media".to_string()),
            ),
            adapter_base_url: std::env::var("REELSMITH_GEN_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8002".to_string()),
            max_concurrency: env_parse("REELSMITH_MAX_CONCURRENCY", 4),
            max_retries: env_parse("REELSMITH_MAX_RETRIES", 2),
            retry_backoff_ms: env_parse("REELSMITH_RETRY_BACKOFF_MS", 500),
            task_deadline_secs: env_parse("REELSMITH_TASK_DEADLINE_SECS", 3600),
            duration_tolerance_secs: DURATION_TOLERANCE_SECS,
            remainder_policy: match std::env::var("REELSMITH_REMAINDER_POLICY").as_deref() {
                Ok("absorb") => RemainderPolicy::Absorb,
                _ => RemainderPolicy::RoundUp,
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
