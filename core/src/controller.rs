//! Controller: assembles the node graph for one rendition (transcoder,
//! optional fan-out + packager(s), uploader(s)) and drives their shared
//! lifecycle. Grounded in `lumberjack/apps/jobs/controller.py::LumberjackController`.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, EventKind};
use crate::executor::{aggregate_status, Executor, NodeStatus};
use crate::fanout::FanoutWriter;
use crate::ffmpeg::command::rendition_local_dir;
use crate::model::{JobFormat, RenditionConfig};
use crate::packager::{PackagerFormat, PackagerNode};
use crate::storage::Storage;
use crate::transcoder::Transcoder;
use crate::uploader::{TranscodeCompletedFlag, UploaderNode};

#[cfg(unix)]
fn make_fifo(path: &Path) -> CoreResult<()> {
    nix::unistd::mkfifo(path, nix::sys::stat::Mode::S_IRWXU)
        .map_err(|err| CoreError::InvalidSettings(format!("mkfifo {} failed: {err}", path.display())))
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> CoreResult<()> {
    Err(CoreError::PlatformUnsupported)
}

pub(crate) fn packager_formats(config: &RenditionConfig) -> Vec<PackagerFormat> {
    match config.format {
        JobFormat::Hls => vec![PackagerFormat::Hls],
        JobFormat::Dash => vec![PackagerFormat::Dash],
        JobFormat::Adaptive => vec![PackagerFormat::Hls, PackagerFormat::Dash],
        JobFormat::Mp4 => vec![],
    }
}

/// A single named node plus the label used in logs; nodes are started and
/// stopped in `nodes` order, which the constructor arranges so that every
/// consumer of a pipe is already listening before its producer opens it for
/// writing.
struct Node {
    label: &'static str,
    executor: Box<dyn Executor>,
}

/// Drives one rendition end-to-end. A job with several renditions (e.g. one
/// per resolution) runs one `Controller` per rendition.
pub struct Controller {
    nodes: Vec<Node>,
    /// Holds the fan-out pipes' directory alive for the controller's
    /// lifetime; dropping it removes the pipes (P6).
    pipes_dir: Option<tempfile::TempDir>,
    output_dirs: Vec<PathBuf>,
    started: bool,
}

impl Controller {
    /// Builds (but does not start) every node this rendition needs. `config`
    /// is mutated in place: when packaging is needed, ffmpeg's own `pipe`
    /// output is redirected into a fan-out input fifo instead of a local
    /// file.
    pub fn new(
        ffmpeg_path: &str,
        packager_path: &str,
        mut config: RenditionConfig,
        transcoded_root: &Path,
        bus: Arc<Mutex<EventBus>>,
        destination_for: impl Fn(&Path) -> Arc<dyn Storage>,
    ) -> CoreResult<Self> {
        let mut nodes = Vec::new();
        let mut output_dirs = Vec::new();
        let mut pipes_dir = None;

        let formats = packager_formats(&config);
        if config.is_packaging_needed() && !formats.is_empty() {
            let dir = tempfile::tempdir_in(transcoded_root)
                .map_err(|err| CoreError::InvalidSettings(format!("failed to create pipes dir: {err}")))?;
            let ffmpeg_output_pipe = dir.path().join("ffmpeg_out");
            make_fifo(&ffmpeg_output_pipe)?;

            let mut packager_input_pipes = Vec::with_capacity(formats.len());
            for format in &formats {
                let name = match format {
                    PackagerFormat::Hls => "packager_in_hls",
                    PackagerFormat::Dash => "packager_in_dash",
                };
                let pipe = dir.path().join(name);
                make_fifo(&pipe)?;
                packager_input_pipes.push(pipe);
            }

            // Start order: packagers (readers) must be listening before the
            // fan-out writer opens its output pipes for writing, and the
            // fan-out writer must be listening before ffmpeg opens its input
            // pipe for writing. Reversing this deadlocks every party on
            // open(2), since a FIFO open blocks until its peer shows up.
            for (format, pipe) in formats.iter().zip(packager_input_pipes.iter()) {
                let mut packager_config = config.clone();
                packager_config.output.pipe = Some(pipe.clone());
                packager_config.output.input = None;

                let rendition_dir = rendition_local_dir(transcoded_root, config.job_id, &config.output.name);
                let output_dir = match format {
                    PackagerFormat::Hls => rendition_dir.join("hls"),
                    PackagerFormat::Dash => rendition_dir.join("dash"),
                };
                let node = PackagerNode::new(packager_path, &packager_config, *format, &output_dir)?;
                let label = match format {
                    PackagerFormat::Hls => "packager-hls",
                    PackagerFormat::Dash => "packager-dash",
                };
                nodes.push(Node {
                    label,
                    executor: Box::new(node),
                });
                output_dirs.push(output_dir);
            }

            nodes.push(Node {
                label: "fanout",
                executor: Box::new(FanoutWriter::new(ffmpeg_output_pipe.clone(), packager_input_pipes)),
            });

            config.output.pipe = Some(ffmpeg_output_pipe);
            pipes_dir = Some(dir);
        } else {
            output_dirs.push(rendition_local_dir(transcoded_root, config.job_id, &config.output.name));
        }

        let transcoder = Transcoder::new(ffmpeg_path, &config, transcoded_root, bus)?;
        nodes.push(Node {
            label: "transcoder",
            executor: Box::new(transcoder),
        });

        // Starts false regardless of format: the uploader must treat the
        // rendition's own playlist as partial for the whole run and only
        // upload its final version from `UploaderNode::post_stop`, once the
        // transcoder's terminal `Output` event flips this flag (§4.5).
        let transcode_completed = Arc::new(AtomicBool::new(false));
        bus.lock()
            .unwrap()
            .register(EventKind::Output, Box::new(TranscodeCompletedFlag::new(transcode_completed.clone())));
        for output_dir in &output_dirs {
            let storage = destination_for(output_dir);
            nodes.push(Node {
                label: "uploader",
                executor: Box::new(UploaderNode::new(output_dir.clone(), storage, transcode_completed.clone())),
            });
        }

        Ok(Self {
            nodes,
            pipes_dir,
            output_dirs,
            started: false,
        })
    }

    pub fn output_directories(&self) -> &[PathBuf] {
        &self.output_dirs
    }

    pub async fn start(&mut self) -> CoreResult<()> {
        if self.started {
            return Err(CoreError::AlreadyStarted);
        }
        for node in &mut self.nodes {
            info!(node = node.label, "starting controller node");
            node.executor.start().await?;
        }
        self.started = true;
        Ok(())
    }

    pub fn status(&self) -> NodeStatus {
        aggregate_status(self.nodes.iter().map(|n| n.executor.status()))
    }

    /// True iff no member node is still `Running` (§4.6); note this is not
    /// the same question `status()`'s aggregate `max` answers, since one
    /// `Running` node alongside a `Finished`/`Errored` one still has a
    /// non-`Running` max.
    pub fn is_completed(&self) -> bool {
        self.nodes.iter().all(|n| n.executor.status() != NodeStatus::Running)
    }

    /// Stops every node, passing the aggregate status down so
    /// `PolitelyWait`-wrapped subprocesses know whether to wait for a clean
    /// exit or force termination, then drops the pipes directory (P6).
    pub async fn stop(&mut self) {
        let aggregate = self.status();
        for node in &mut self.nodes {
            node.executor.stop(Some(aggregate)).await;
        }
        self.pipes_dir = None;
    }
}
