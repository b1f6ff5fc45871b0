//! Worker configuration loaded from the environment, following
//! `ferrex-server`'s `Config::from_env` convention.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for `transcode-worker`. Every field has an
/// environment-backed default so the binary runs unconfigured against
/// `./transcoded` and system `ffmpeg`/`packager` binaries.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local staging root each rendition's Controller writes into before the
    /// Uploader Node moves/syncs it to the job's real destination.
    pub transcoded_root: PathBuf,
    pub ffmpeg_path: String,
    pub packager_path: String,
    /// Initial backoff before the Webhook Notifier's first retry; doubles on
    /// each subsequent attempt up to `webhook.rs`'s fixed attempt cap.
    pub webhook_initial_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            transcoded_root: env::var("TRANSCODED_ROOT")
                .unwrap_or_else(|_| "./transcoded".to_string())
                .into(),
            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            packager_path: env::var("PACKAGER_PATH").unwrap_or_else(|_| "packager".to_string()),
            webhook_initial_backoff: env::var("WEBHOOK_INITIAL_BACKOFF_MS")
                .ok()
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(500)),
        }
    }

    pub fn ensure_transcoded_root(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.transcoded_root)
    }
}
