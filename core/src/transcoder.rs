//! Transcoder Node: wraps the external `ffmpeg` subprocess and drives a
//! [`LogParser`] over its merged stdout/stderr to emit progress events.
//! Grounded in `lumberjack/apps/executors/transcoder.py::FFMpegTranscoder`.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::CoreResult;
use crate::events::EventBus;
use crate::executor::{Executor, NodeStatus, PolitelyWait, SubprocessExecutor};
use crate::ffmpeg::{self, LogParser};
use crate::model::RenditionConfig;

/// Wraps the `ffmpeg` subprocess (via [`PolitelyWait`]`<`[`SubprocessExecutor`]`>`)
/// and the background task driving its [`LogParser`].
pub struct Transcoder {
    executor: PolitelyWait<SubprocessExecutor>,
    bus: Arc<Mutex<EventBus>>,
    log_task: Option<JoinHandle<()>>,
}

impl Transcoder {
    /// Builds the ffmpeg command for `config` but doesn't spawn it yet.
    /// `bus` is shared with the controller so it can register the progress
    /// callback and output-event observers before `start`.
    pub fn new(
        ffmpeg_path: &str,
        config: &RenditionConfig,
        transcoded_root: &std::path::Path,
        bus: Arc<Mutex<EventBus>>,
    ) -> CoreResult<Self> {
        let command = ffmpeg::build_command(ffmpeg_path, config, transcoded_root)?;
        let name = "transcoder";
        let mut subprocess = SubprocessExecutor::new(name, command);
        subprocess.configure_stdio(Stdio::piped(), Stdio::piped());

        Ok(Self {
            executor: PolitelyWait::new(subprocess),
            bus,
            log_task: None,
        })
    }
}

#[async_trait]
impl Executor for Transcoder {
    async fn start(&mut self) -> CoreResult<()> {
        self.executor.start().await?;
        info!("transcoder subprocess started");

        let (stdout, stderr) = self
            .executor
            .inner_mut()
            .child_mut()
            .map(|child| (child.stdout.take(), child.stderr.take()))
            .unwrap_or((None, None));

        if let (Some(stdout), Some(stderr)) = (stdout, stderr) {
            let parser = LogParser::new(self.bus.clone());
            self.log_task = Some(tokio::spawn(parser.run_merged(stdout, stderr)));
        } else {
            warn!("transcoder subprocess has no stdout/stderr pipes to parse");
        }

        Ok(())
    }

    async fn stop(&mut self, aggregate_status: Option<NodeStatus>) {
        self.executor.stop(aggregate_status).await;
        if let Some(task) = self.log_task.take() {
            let _ = task.await;
        }
    }

    fn status(&self) -> NodeStatus {
        self.executor.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventKind, Observer};
    use crate::model::{AudioSpec, JobFormat, OutputSpec, PlaylistType, VideoSpec};
    use std::sync::atomic::{AtomicU8, Ordering};
    use uuid::Uuid;

    struct LastProgress(Arc<AtomicU8>);
    impl Observer for LastProgress {
        fn notify(&mut self, event: &Event) {
            if let Event::Progress(p) = event {
                self.0.store(*p, Ordering::SeqCst);
            }
        }
    }

    fn config() -> RenditionConfig {
        RenditionConfig {
            job_id: Uuid::new_v4(),
            input_url: "/in/video.mp4".into(),
            format: JobFormat::Mp4,
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
                    bitrate: None,
                    preset: None,
                },
                audio: AudioSpec {
                    codec: None,
                    bitrate: None,
                },
                pipe: None,
                input: None,
                segment_per_file: true,
            },
            hls_key_encryption: None,
            drm_encryption: None,
        }
    }

    #[tokio::test]
    async fn runs_a_stub_binary_and_reports_progress_via_bus() {
        let dir = tempfile::tempdir().unwrap();
        let progress = Arc::new(AtomicU8::new(0));
        let mut bus = EventBus::new();
        bus.register(EventKind::Progress, Box::new(LastProgress(progress.clone())));
        let bus = Arc::new(Mutex::new(bus));

        // `true` stands in for ffmpeg here: it exits 0 immediately, which is
        // enough to exercise start/stop/status without a real binary.
        let mut transcoder = Transcoder::new("true", &config(), dir.path(), bus).unwrap();
        transcoder.start().await.unwrap();

        for _ in 0..50 {
            if transcoder.status() != NodeStatus::Running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        transcoder.stop(Some(NodeStatus::Finished)).await;
        assert_eq!(transcoder.status(), NodeStatus::Finished);
    }
}
