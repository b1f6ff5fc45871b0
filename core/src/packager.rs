//! Packager Node: builds the `packager` (Shaka Packager) invocation for one
//! streaming format (HLS or DASH), including Widevine/FairPlay/fixed-key
//! encryption flags. Grounded in
//! `lumberjack/apps/executors/packager.py::ShakaPackager` and
//! `apps/nodes/packager.py` (the two near-duplicate originals converge here).

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{CoreError, CoreResult};
use crate::executor::{Executor, NodeStatus, PolitelyWait, SubprocessExecutor};
use crate::model::{JobFormat, PlaylistType, RenditionConfig};

const DEFAULT_SEGMENT_LENGTH: u32 = 10;

/// Which single format this packager instance produces. The controller
/// creates one per branch (HLS, DASH), even for `adaptive` jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackagerFormat {
    Hls,
    Dash,
}

fn stream_input(pipe: &Option<std::path::PathBuf>, input: &Option<std::path::PathBuf>) -> CoreResult<String> {
    pipe.as_ref()
        .or(input.as_ref())
        .map(|p| p.to_string_lossy().into_owned())
        .ok_or_else(|| CoreError::InvalidSettings("packager stream has neither pipe nor input".into()))
}

fn stream_spec(kind: &str, input: &str, init_segment: &Path, segment_template: &Path) -> String {
    format!(
        "stream={kind},in={input},init_segment={init},segment_template={tmpl}",
        kind = kind,
        input = input,
        init = init_segment.display(),
        tmpl = segment_template.display(),
    )
}

/// Builds the `packager` invocation writing into `output_dir` for the given
/// `config` and `format`. `config.output.pipe`/`.input` name the one stream
/// source this packager instance reads (the controller sets `pipe` to the
/// fan-out leg feeding this branch).
pub fn build_command(
    packager_path: &str,
    config: &RenditionConfig,
    format: PackagerFormat,
    output_dir: &Path,
) -> CoreResult<Command> {
    std::fs::create_dir_all(output_dir)?;

    let input = stream_input(&config.output.pipe, &config.output.input)?;
    let name = &config.output.name;

    let video_init = output_dir.join(format!("video_{name}_init.mp4"));
    let video_template = output_dir.join(format!("video_{name}_$Number$.mp4"));
    let audio_init = output_dir.join("audio_init.mp4");
    let audio_template = output_dir.join("audio_$Number$.mp4");

    let mut cmd = Command::new(packager_path);
    cmd.arg(stream_spec("video", &input, &video_init, &video_template));
    cmd.arg(stream_spec("audio", &input, &audio_init, &audio_template));

    let segment_length = if config.segment_length == 0 {
        DEFAULT_SEGMENT_LENGTH
    } else {
        config.segment_length
    };
    cmd.arg("--segment_duration").arg(segment_length.to_string());

    match format {
        PackagerFormat::Dash => {
            if config.playlist_type == PlaylistType::Vod {
                cmd.arg("--generate_static_live_mpd");
            }
            cmd.arg("--mpd_output").arg(output_dir.join("video.mpd"));
        }
        PackagerFormat::Hls => {
            let playlist_type = match config.playlist_type {
                PlaylistType::Live => "LIVE",
                PlaylistType::Vod => "VOD",
            };
            cmd.arg("--hls_playlist_type").arg(playlist_type);
            cmd.arg("--hls_master_playlist_output")
                .arg(output_dir.join("video.m3u8"));
        }
    }

    append_encryption_args(&mut cmd, config, format)?;

    Ok(cmd)
}

fn append_encryption_args(cmd: &mut Command, config: &RenditionConfig, format: PackagerFormat) -> CoreResult<()> {
    match format {
        PackagerFormat::Dash => {
            if let Some(widevine) = config.drm_encryption.as_ref().and_then(|d| d.widevine.as_ref()) {
                cmd.arg("--enable_widevine_encryption");
                cmd.arg("--key_server_url").arg(&widevine.key_server_url);
                cmd.arg("--content_id").arg(&widevine.content_id);
                cmd.arg("--signer").arg(&widevine.signer);
                cmd.arg("--aes_signing_key").arg(&widevine.aes_signing_key);
                cmd.arg("--aes_signing_iv").arg(&widevine.aes_signing_iv);
            }
        }
        PackagerFormat::Hls => {
            if let Some(fairplay) = config.drm_encryption.as_ref().and_then(|d| d.fairplay.as_ref()) {
                cmd.arg("--enable_raw_key_encryption");
                cmd.arg("--keys").arg(format!("label=:key={}", fairplay.key_hex));
                cmd.arg("--protection_systems").arg("Fairplay");
                cmd.arg("--iv").arg(&fairplay.iv);
                cmd.arg("--hls_key_uri").arg(&fairplay.uri);
            } else if let Some(enc) = &config.hls_key_encryption {
                // `adaptive` jobs always packager-ise the HLS branch (§4.6);
                // when that branch isn't carrying FairPlay DRM but the job
                // still has a plain HLS AES-128 key configured, the packager
                // has to apply it itself rather than ffmpeg's key-info file
                // path (which only exists for the non-packaged HLS branch).
                cmd.arg("--enable_fixed_key_encryption");
                cmd.arg("--key").arg(&enc.key_hex);
                cmd.arg("--key_id").arg(enc.key_id());
                cmd.arg("--hls_key_uri").arg(&enc.key_url);
            }
        }
    }
    Ok(())
}

/// The packager subprocess as a pipeline node (PolitelyWaitOnFinish, like the
/// transcoder: let it finish writing the final segment rather than killing it
/// outright when the rest of the controller's nodes have already finished).
pub struct PackagerNode {
    executor: PolitelyWait<SubprocessExecutor>,
}

impl PackagerNode {
    pub fn new(
        packager_path: &str,
        config: &RenditionConfig,
        format: PackagerFormat,
        output_dir: &Path,
    ) -> CoreResult<Self> {
        let command = build_command(packager_path, config, format, output_dir)?;
        let name = match format {
            PackagerFormat::Hls => "packager-hls",
            PackagerFormat::Dash => "packager-dash",
        };
        Ok(Self {
            executor: PolitelyWait::new(SubprocessExecutor::new(name, command)),
        })
    }
}

#[async_trait]
impl Executor for PackagerNode {
    async fn start(&mut self) -> CoreResult<()> {
        self.executor.start().await
    }

    async fn stop(&mut self, aggregate_status: Option<NodeStatus>) {
        self.executor.stop(aggregate_status).await;
    }

    fn status(&self) -> NodeStatus {
        self.executor.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AudioSpec, DrmEncryption, FairplayEncryption, HlsKeyEncryption, OutputSpec, VideoSpec, WidevineEncryption,
    };
    use std::path::PathBuf;
    use uuid::Uuid;

    fn base_config() -> RenditionConfig {
        RenditionConfig {
            job_id: Uuid::new_v4(),
            input_url: "/in/video.mp4".into(),
            format: JobFormat::Adaptive,
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
                    bitrate: None,
                },
                pipe: Some(PathBuf::from("/tmp/pipe0")),
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
    fn dash_branch_requests_mpd_output_and_static_flag_for_vod() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = base_config();
        let cmd = build_command("packager", &cfg, PackagerFormat::Dash, dir.path()).unwrap();
        let args = argv(&cmd);
        assert!(args.iter().any(|a| a == "--generate_static_live_mpd"));
        assert!(args.iter().any(|a| a == "--mpd_output"));
    }

    #[test]
    fn hls_branch_requests_master_playlist_output() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = base_config();
        let cmd = build_command("packager", &cfg, PackagerFormat::Hls, dir.path()).unwrap();
        let args = argv(&cmd);
        assert!(args.iter().any(|a| a == "--hls_master_playlist_output"));
        let idx = args.iter().position(|a| a == "--hls_playlist_type").unwrap();
        assert_eq!(args[idx + 1], "VOD");
    }

    #[test]
    fn widevine_flags_present_on_dash_branch() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config();
        cfg.drm_encryption = Some(DrmEncryption {
            widevine: Some(WidevineEncryption {
                key_server_url: "https://license.example/".into(),
                content_id: "abc123".into(),
                signer: "widevine_test".into(),
                aes_signing_key: "aa".into(),
                aes_signing_iv: "bb".into(),
            }),
            fairplay: None,
        });
        let cmd = build_command("packager", &cfg, PackagerFormat::Dash, dir.path()).unwrap();
        let args = argv(&cmd);
        assert!(args.iter().any(|a| a == "--enable_widevine_encryption"));
        let idx = args.iter().position(|a| a == "--content_id").unwrap();
        assert_eq!(args[idx + 1], "abc123");
    }

    #[test]
    fn fairplay_flags_present_on_hls_branch() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config();
        cfg.drm_encryption = Some(DrmEncryption {
            widevine: None,
            fairplay: Some(FairplayEncryption {
                key_hex: "deadbeef".into(),
                iv: "cafebabe".into(),
                uri: "skd://example".into(),
            }),
        });
        let cmd = build_command("packager", &cfg, PackagerFormat::Hls, dir.path()).unwrap();
        let args = argv(&cmd);
        assert!(args.iter().any(|a| a == "--enable_raw_key_encryption"));
        assert!(args.iter().any(|a| a == "Fairplay"));
    }

    #[test]
    fn fixed_key_used_when_hls_branch_has_plain_aes_key_without_fairplay() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config();
        cfg.hls_key_encryption = Some(HlsKeyEncryption {
            key_hex: "00112233445566778899aabbccddeeff".into(),
            key_url: "https://example.com/key".into(),
            key_id: None,
        });
        let cmd = build_command("packager", &cfg, PackagerFormat::Hls, dir.path()).unwrap();
        let args = argv(&cmd);
        assert!(args.iter().any(|a| a == "--enable_fixed_key_encryption"));
    }
}
