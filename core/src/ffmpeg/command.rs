//! Pure-function ffmpeg argv synthesis from a [`RenditionConfig`]. Grounded
//! in `lumberjack/apps/ffmpeg/command_generator.py::CommandGenerator` and
//! `ferrex-server/src/stream/transcoding/worker.rs::build_ffmpeg_command`.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use super::input::{needs_reconnect_flags, resolve_input};
use crate::error::{CoreError, CoreResult};
use crate::model::{JobFormat, RenditionConfig};

const DEFAULT_VIDEO_CODEC: &str = "h264";
const DEFAULT_VIDEO_PRESET: &str = "fast";
const DEFAULT_AUDIO_CODEC: &str = "aac";
const DEFAULT_SEGMENT_LENGTH: u32 = 10;
const MUXING_QUEUE_SIZE: u32 = 9999;

/// Local staging directory for one job: `<transcoded_root>/<job_id>`.
pub fn job_local_dir(transcoded_root: &Path, job_id: uuid::Uuid) -> PathBuf {
    transcoded_root.join(job_id.to_string())
}

/// Local staging directory for one rendition:
/// `<transcoded_root>/<job_id>/<rendition_name>`.
pub fn rendition_local_dir(transcoded_root: &Path, job_id: uuid::Uuid, rendition: &str) -> PathBuf {
    job_local_dir(transcoded_root, job_id).join(rendition)
}

fn output_file_name(config: &RenditionConfig) -> CoreResult<String> {
    if let Some(name) = &config.output.file_name {
        return Ok(name.clone());
    }
    match config.format {
        JobFormat::Mp4 => Ok("video.mp4".to_string()),
        JobFormat::Hls => Ok("video.m3u8".to_string()),
        JobFormat::Dash | JobFormat::Adaptive => Err(CoreError::InvalidSettings(format!(
            "no default ffmpeg output file name for format {:?}; the packager writes its own",
            config.format
        ))),
    }
}

/// Builds the `ffmpeg` invocation for one rendition. `ffmpeg_path` is the
/// configured binary name/path (`Config::ffmpeg_path`); `transcoded_root` is
/// the job staging root (`TRANSCODED_ROOT`).
pub fn build_command(
    ffmpeg_path: &str,
    config: &RenditionConfig,
    transcoded_root: &Path,
) -> CoreResult<Command> {
    let rendition_dir = rendition_local_dir(transcoded_root, config.job_id, &config.output.name);
    std::fs::create_dir_all(&rendition_dir)?;

    let mut cmd = Command::new(ffmpeg_path);
    cmd.arg("-hide_banner").arg("-y");

    // Robustness flags for subtitle-heavy sources, folded in from the
    // teacher's `build_ffmpeg_command` (command synthesis is a pure function
    // of settings, but not an exhaustive list, per SPEC_FULL §4.2).
    cmd.arg("-probesize").arg("50M");
    cmd.arg("-analyzeduration").arg("100M");

    if needs_reconnect_flags(&config.input_url) {
        cmd.arg("-reconnect")
            .arg("1")
            .arg("-reconnect_streamed")
            .arg("1")
            .arg("-reconnect_delay_max")
            .arg("300");
    }

    let resolved_input = resolve_input(&config.input_url)?;
    cmd.arg("-i").arg(&resolved_input);

    // Video options.
    let video = &config.output.video;
    cmd.arg("-c:v")
        .arg(video.codec.as_deref().unwrap_or(DEFAULT_VIDEO_CODEC));
    cmd.arg("-preset")
        .arg(video.preset.as_deref().unwrap_or(DEFAULT_VIDEO_PRESET));
    cmd.arg("-s").arg(format!("{}x{}", video.width, video.height));
    if let Some(bitrate) = video.bitrate {
        cmd.arg("-b:v").arg(bitrate.to_string());
    }

    // Audio options.
    let audio = &config.output.audio;
    cmd.arg("-c:a")
        .arg(audio.codec.as_deref().unwrap_or(DEFAULT_AUDIO_CODEC));
    if let Some(bitrate) = audio.bitrate {
        cmd.arg("-b:a").arg(bitrate.to_string());
    }

    if config.format == JobFormat::Hls {
        let segment_length = if config.segment_length == 0 {
            DEFAULT_SEGMENT_LENGTH
        } else {
            config.segment_length
        };
        cmd.arg("-f").arg("hls");
        cmd.arg("-hls_list_size").arg("0");
        cmd.arg("-hls_time").arg(segment_length.to_string());
        cmd.arg("-hls_segment_filename")
            .arg(rendition_dir.join("video_%d.ts"));

        if let Some(enc) = &config.hls_key_encryption {
            let key_info_path = write_key_info_file(transcoded_root, config.job_id, enc)?;
            cmd.arg("-hls_key_info_file").arg(key_info_path);
        }
    }

    cmd.arg("-max_muxing_queue_size").arg(MUXING_QUEUE_SIZE.to_string());

    let output_path = match &config.output.pipe {
        Some(pipe) => pipe.clone(),
        None => rendition_dir.join(output_file_name(config)?),
    };
    debug!(job_id = %config.job_id, rendition = %config.output.name, output = %output_path.display(), "built ffmpeg command");
    cmd.arg(output_path);

    Ok(cmd)
}

/// Writes the HLS AES-128 key-info file ffmpeg expects: the raw key bytes to
/// `key/enc.key` and a two-line `<url>\n<path>` text file at `key/enc.keyinfo`,
/// returning the keyinfo path. Mirrors `HLSKeyInfoFile`.
fn write_key_info_file(
    transcoded_root: &Path,
    job_id: uuid::Uuid,
    enc: &crate::model::HlsKeyEncryption,
) -> CoreResult<PathBuf> {
    let key_dir = job_local_dir(transcoded_root, job_id).join("key");
    std::fs::create_dir_all(&key_dir)?;

    let key_bytes = hex::decode(&enc.key_hex)
        .map_err(|err| CoreError::InvalidSettings(format!("invalid hex encryption key: {err}")))?;
    let key_path = key_dir.join("enc.key");
    std::fs::write(&key_path, key_bytes)?;

    let key_info_path = key_dir.join("enc.keyinfo");
    std::fs::write(
        &key_info_path,
        format!("{}\n{}", enc.key_url, key_path.display()),
    )?;

    Ok(key_info_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AudioSpec, JobFormat, OutputSpec, PlaylistType, RenditionConfig, VideoSpec};
    use uuid::Uuid;

    fn config(format: JobFormat) -> RenditionConfig {
        RenditionConfig {
            job_id: Uuid::new_v4(),
            input_url: "/in/video.mp4".into(),
            format,
            playlist_type: PlaylistType::Vod,
            segment_length: 10,
            output: OutputSpec {
                name: "720p".into(),
                file_name: None,
                url: "/out/job/720p".into(),
                video: VideoSpec {
                    width: 1280,
                    height: 720,
                    codec: None,
                    bitrate: Some(1_500_000),
                    preset: None,
                },
                audio: AudioSpec {
                    codec: None,
                    bitrate: Some(128_000),
                },
                pipe: None,
                input: None,
                segment_per_file: true,
            },
            hls_key_encryption: None,
            drm_encryption: None,
        }
    }

    fn argv(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn defaults_video_codec_to_h264() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(JobFormat::Mp4);
        let cmd = build_command("ffmpeg", &cfg, dir.path()).unwrap();
        let args = argv(&cmd);
        let idx = args.iter().position(|a| a == "-c:v").unwrap();
        assert_eq!(args[idx + 1], "h264");
    }

    #[test]
    fn hls_format_sets_segment_filename_and_muxing_queue() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(JobFormat::Hls);
        let cmd = build_command("ffmpeg", &cfg, dir.path()).unwrap();
        let args = argv(&cmd);
        assert!(args.iter().any(|a| a == "-hls_segment_filename"));
        assert!(args.iter().any(|a| a == "-max_muxing_queue_size"));
        let idx = args.iter().position(|a| a == "-hls_time").unwrap();
        assert_eq!(args[idx + 1], "10");
    }

    #[test]
    fn writes_key_info_file_when_encryption_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(JobFormat::Hls);
        cfg.hls_key_encryption = Some(crate::model::HlsKeyEncryption {
            key_hex: "00112233445566778899aabbccddeeff".to_string(),
            key_url: "https://example.com/key".into(),
            key_id: None,
        });
        let cmd = build_command("ffmpeg", &cfg, dir.path()).unwrap();
        let args = argv(&cmd);
        assert!(args.iter().any(|a| a == "-hls_key_info_file"));
        let key_info_path = job_local_dir(dir.path(), cfg.job_id).join("key/enc.keyinfo");
        let content = std::fs::read_to_string(key_info_path).unwrap();
        assert!(content.starts_with("https://example.com/key\n"));
    }

    #[test]
    fn mp4_uses_default_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(JobFormat::Mp4);
        let cmd = build_command("ffmpeg", &cfg, dir.path()).unwrap();
        let args = argv(&cmd);
        assert!(args.last().unwrap().ends_with("video.mp4"));
    }
}
