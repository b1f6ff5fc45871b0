use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle status shared by `Job` and `Output`, ordered so aggregation can
/// use a plain `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    Queued,
    Processing,
    Completed,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobFormat {
    Hls,
    Dash,
    /// Both HLS and DASH produced from one transcode; named `adaptive` per
    /// spec.md §3, aliased from the original `both_hls_and_dash` constant.
    #[serde(alias = "both_hls_and_dash")]
    Adaptive,
    Mp4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistType {
    Vod,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoPreset {
    pub width: u32,
    pub height: u32,
    pub codec: Option<String>,
    pub bitrate: Option<u32>,
    pub preset: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioPreset {
    pub codec: Option<String>,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPreset {
    pub name: String,
    pub video: VideoPreset,
    pub audio: AudioPreset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTemplate {
    pub id: Uuid,
    pub name: String,
    pub format: JobFormat,
    #[serde(default = "default_segment_length")]
    pub segment_length: u32,
    pub playlist_type: PlaylistType,
    pub outputs: Vec<OutputPreset>,
}

fn default_segment_length() -> u32 {
    10
}

impl JobTemplate {
    /// Shapes a settings blob the way `JobTemplate.populate_settings` does:
    /// `{name, segmentLength, format, playlist_type, outputs: [...]}`.
    pub fn populate_settings(&self) -> Value {
        let outputs: Vec<Value> = self
            .outputs
            .iter()
            .map(|o| {
                serde_json::json!({
                    "name": o.name,
                    "video": {
                        "width": o.video.width,
                        "height": o.video.height,
                        "codec": o.video.codec,
                        "bitrate": o.video.bitrate,
                        "preset": o.video.preset,
                    },
                    "audio": {
                        "codec": o.audio.codec,
                        "bitrate": o.audio.bitrate,
                    },
                })
            })
            .collect();

        serde_json::json!({
            "name": self.name,
            "segmentLength": self.segment_length,
            "format": self.format,
            "playlist_type": self.playlist_type,
            "outputs": outputs,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub template: Option<Uuid>,
    pub settings: Option<Value>,
    pub background_task_id: Option<Uuid>,
    pub progress: u8,
    pub status: JobStatus,
    pub input_url: String,
    pub output_url: String,
    pub webhook_url: Option<String>,
    pub encryption_key: Option<String>,
    pub key_url: Option<String>,
    pub meta_data: Option<Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

impl Job {
    /// P1: job progress is the mean of its outputs' progress, rounded down,
    /// matching `Job.update_progress`'s `Avg("progress")` aggregate. An
    /// empty output set leaves progress untouched.
    pub fn recompute_progress(&mut self, outputs: &[Output]) {
        if outputs.is_empty() {
            return;
        }
        let sum: u32 = outputs.iter().map(|o| o.progress as u32).sum();
        self.progress = (sum / outputs.len() as u32) as u8;
    }

    /// Builds the per-job settings blob: template settings (or own settings)
    /// plus the job's id/destination/file_name/input, meta_data, and
    /// encryption key/url when present. Mirrors `Job.populate_settings`.
    pub fn populate_settings(&mut self, template: Option<&JobTemplate>) {
        let mut settings: Map<String, Value> = match template {
            Some(t) => t
                .populate_settings()
                .as_object()
                .cloned()
                .unwrap_or_default(),
            None => self
                .settings
                .as_ref()
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default(),
        };
        if let Some(t) = template {
            settings.insert("template".into(), Value::String(t.id.to_string()));
        }

        let (destination, file_name) = split_path(&self.output_url);
        settings.insert("id".into(), Value::String(self.id.to_string()));
        settings.insert("destination".into(), Value::String(destination));
        settings.insert("file_name".into(), Value::String(file_name));
        settings.insert("input".into(), Value::String(self.input_url.clone()));

        if let Some(meta) = &self.meta_data {
            settings.insert("meta_data".into(), meta.clone());
        }

        if let Some(key) = &self.encryption_key {
            settings.insert(
                "encryption".into(),
                serde_json::json!({ "key": key, "url": self.key_url }),
            );
        }

        self.settings = Some(Value::Object(settings));
    }
}

fn split_path(url: &str) -> (String, String) {
    let path = Path::new(url);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let destination = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    (destination, file_name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub name: String,
    #[serde(default = "default_video_encoder")]
    pub video_encoder: String,
    pub video_bitrate: u32,
    #[serde(default = "default_video_preset")]
    pub video_preset: String,
    #[serde(default = "default_audio_encoder")]
    pub audio_encoder: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: u32,
    pub width: u32,
    pub height: u32,
    pub status: JobStatus,
    pub progress: u8,
    pub background_task_id: Option<Uuid>,
    pub settings: Option<Value>,
    pub error_message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

fn default_video_encoder() -> String {
    "h264".to_string()
}
fn default_video_preset() -> String {
    "faster".to_string()
}
fn default_audio_encoder() -> String {
    "aac".to_string()
}
fn default_audio_bitrate() -> u32 {
    128_000
}

impl Output {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// P3: valid terminal/initial status transitions, mirroring
    /// `update_output_as_*` in `VideoTranscoderRunnable`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.start_time = Some(now);
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.end_time = Some(now);
    }

    pub fn mark_error(&mut self, now: DateTime<Utc>, message: Option<String>) {
        self.status = JobStatus::Error;
        self.end_time = Some(now);
        self.error_message = message;
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
    }

    /// P7: progress callbacks are only accepted on multiples of five and
    /// only when they actually change the stored value.
    pub fn accepts_progress(&self, percentage: u8) -> bool {
        percentage % 5 == 0 && self.progress != percentage
    }
}

/// The per-rendition configuration passed to `Controller::start`, built from
/// a `Job`/`Output` pair via `RenditionConfig::from_output`. Plays the role
/// of the ad-hoc `config` dict threaded through
/// `LumberjackController`/`CommandGenerator`/`ShakaPackager` in the
/// original; here it's a typed struct instead of untyped JSON.
#[derive(Debug, Clone)]
pub struct RenditionConfig {
    pub job_id: Uuid,
    pub input_url: String,
    pub format: JobFormat,
    pub playlist_type: PlaylistType,
    pub segment_length: u32,
    pub output: OutputSpec,
    /// HLS key-info-file encryption for the plain-ffmpeg path.
    pub hls_key_encryption: Option<HlsKeyEncryption>,
    /// Widevine/FairPlay DRM for the packager path.
    pub drm_encryption: Option<DrmEncryption>,
}

#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub name: String,
    pub file_name: Option<String>,
    pub url: String,
    pub video: VideoSpec,
    pub audio: AudioSpec,
    /// Set by the controller once it allocates a named pipe for this
    /// rendition; `None` means ffmpeg writes straight to a local file.
    pub pipe: Option<std::path::PathBuf>,
    /// Explicit packager input override, used instead of `pipe` when the
    /// packager should read an already-materialised local file rather than a
    /// named pipe. Mirrors `stream.get("pipe") or stream.get("input")`.
    pub input: Option<std::path::PathBuf>,
    pub segment_per_file: bool,
}

#[derive(Debug, Clone)]
pub struct VideoSpec {
    pub width: u32,
    pub height: u32,
    pub codec: Option<String>,
    pub bitrate: Option<u32>,
    pub preset: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AudioSpec {
    pub codec: Option<String>,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct HlsKeyEncryption {
    pub key_hex: String,
    pub key_url: String,
    /// Packager `--key_id` for fixed-key encryption; the key itself has no
    /// separate id in the plain-ffmpeg (key-info-file) path, so this is only
    /// consulted when the packager applies the key instead (see
    /// `packager::append_encryption_args`). Defaults to `key_hex` when unset.
    pub key_id: Option<String>,
}

impl HlsKeyEncryption {
    pub fn key_id(&self) -> &str {
        self.key_id.as_deref().unwrap_or(&self.key_hex)
    }
}

#[derive(Debug, Clone)]
pub struct DrmEncryption {
    pub widevine: Option<WidevineEncryption>,
    pub fairplay: Option<FairplayEncryption>,
}

#[derive(Debug, Clone)]
pub struct WidevineEncryption {
    pub key_server_url: String,
    pub content_id: String,
    pub signer: String,
    pub aes_signing_key: String,
    pub aes_signing_iv: String,
}

#[derive(Debug, Clone)]
pub struct FairplayEncryption {
    pub key_hex: String,
    pub iv: String,
    pub uri: String,
}

impl RenditionConfig {
    pub fn from_job_and_output(job: &Job, output: &Output, template: &JobTemplate) -> Self {
        RenditionConfig {
            job_id: job.id,
            input_url: job.input_url.clone(),
            format: template.format,
            playlist_type: template.playlist_type,
            segment_length: template.segment_length,
            output: OutputSpec {
                name: output.name.clone(),
                file_name: None,
                url: job.output_url.clone(),
                video: VideoSpec {
                    width: output.width,
                    height: output.height,
                    codec: Some(output.video_encoder.clone()),
                    bitrate: Some(output.video_bitrate),
                    preset: Some(output.video_preset.clone()),
                },
                audio: AudioSpec {
                    codec: Some(output.audio_encoder.clone()),
                    bitrate: Some(output.audio_bitrate),
                },
                pipe: None,
                input: None,
                segment_per_file: true,
            },
            hls_key_encryption: job.encryption_key.as_ref().map(|key| HlsKeyEncryption {
                key_hex: key.clone(),
                key_url: job.key_url.clone().unwrap_or_default(),
                key_id: None,
            }),
            drm_encryption: None,
        }
    }

    /// Mirrors `LumberjackController.is_packaging_needed`: plain HLS without
    /// FairPlay can be produced by ffmpeg alone (as can raw `mp4`); every
    /// other format (or HLS with FairPlay) needs the packager.
    pub fn is_packaging_needed(&self) -> bool {
        if self.format == JobFormat::Mp4 {
            return false;
        }
        let fairplay = self
            .drm_encryption
            .as_ref()
            .and_then(|d| d.fairplay.as_ref())
            .is_some();
        if self.format == JobFormat::Hls && !fairplay {
            return false;
        }
        matches!(
            self.format,
            JobFormat::Adaptive | JobFormat::Dash | JobFormat::Hls
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(progress: u8) -> Output {
        Output {
            id: Uuid::new_v4(),
            job_id: None,
            name: "360p".into(),
            video_encoder: default_video_encoder(),
            video_bitrate: 800_000,
            video_preset: default_video_preset(),
            audio_encoder: default_audio_encoder(),
            audio_bitrate: default_audio_bitrate(),
            width: 640,
            height: 360,
            status: JobStatus::Processing,
            progress,
            background_task_id: None,
            settings: None,
            error_message: None,
            start_time: None,
            end_time: None,
            created: Utc::now(),
        }
    }

    fn job() -> Job {
        Job {
            id: Uuid::new_v4(),
            template: None,
            settings: None,
            background_task_id: None,
            progress: 0,
            status: JobStatus::Processing,
            input_url: "/in/video.mp4".into(),
            output_url: "/out/job/video.mp4".into(),
            webhook_url: None,
            encryption_key: None,
            key_url: None,
            meta_data: None,
            start_time: None,
            end_time: None,
            created: Utc::now(),
        }
    }

    #[test]
    fn progress_is_mean_of_outputs() {
        let mut j = job();
        j.recompute_progress(&[output(40), output(60)]);
        assert_eq!(j.progress, 50);
    }

    #[test]
    fn progress_untouched_with_no_outputs() {
        let mut j = job();
        j.progress = 10;
        j.recompute_progress(&[]);
        assert_eq!(j.progress, 10);
    }

    #[test]
    fn accepts_progress_only_on_multiples_of_five() {
        let out = output(25);
        assert!(!out.accepts_progress(27));
        assert!(!out.accepts_progress(25));
        assert!(out.accepts_progress(30));
    }

    #[test]
    fn default_video_codec_is_h264() {
        assert_eq!(default_video_encoder(), "h264");
    }
}
