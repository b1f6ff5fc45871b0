//! Rendition Runner: the top-level per-rendition task body. Grounded in
//! `lumberjack/apps/jobs/runnables.py::VideoTranscoderRunnable`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::controller::{packager_formats, Controller};
use crate::error::CoreResult;
use crate::events::{Event, EventBus, EventKind, Observer};
use crate::executor::NodeStatus;
use crate::ffmpeg::command::rendition_local_dir;
use crate::model::{JobFormat, JobStatus, RenditionConfig};
use crate::packager::PackagerFormat;
use crate::queue::{CancellationToken, SharedTaskQueue};
use crate::storage::Storage;
use crate::store::JobStore;
use crate::webhook::WebhookNotifier;

/// Forwards the transcoder's `Progress` events into the Runner's progress
/// callback (P7), bridging the event bus's `Send`-only `Observer` with the
/// async store write the callback needs to perform.
struct ProgressForwarder {
    tx: tokio::sync::mpsc::UnboundedSender<u8>,
}

impl Observer for ProgressForwarder {
    fn notify(&mut self, event: &Event) {
        if let Event::Progress(percentage) = event {
            let _ = self.tx.send(*percentage);
        }
    }
}

/// Drives one Output from `Processing` through to a terminal status,
/// coordinating with siblings for job completion. One `RenditionRunner`
/// corresponds to one queued task.
pub struct RenditionRunner {
    store: Arc<dyn JobStore>,
    queue: SharedTaskQueue,
    webhook: Arc<WebhookNotifier>,
    ffmpeg_path: String,
    packager_path: String,
    transcoded_root: std::path::PathBuf,
}

impl RenditionRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: SharedTaskQueue,
        webhook: Arc<WebhookNotifier>,
        ffmpeg_path: impl Into<String>,
        packager_path: impl Into<String>,
        transcoded_root: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            store,
            queue,
            webhook,
            ffmpeg_path: ffmpeg_path.into(),
            packager_path: packager_path.into(),
            transcoded_root: transcoded_root.into(),
        }
    }

    /// Runs one Output to completion. `config` is the already-materialised
    /// rendition settings for this Output, also consulted by the Manifest
    /// Merger (once every sibling has settled) to know which packager
    /// directories to read.
    pub async fn run(
        &self,
        job_id: Uuid,
        output_id: Uuid,
        config: RenditionConfig,
        mut cancellation: CancellationToken,
        destination_for: impl Fn(&Path) -> Arc<dyn Storage>,
        manifest_destination: Arc<dyn Storage>,
    ) -> CoreResult<()> {
        self.initialize(job_id, output_id).await?;

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
        let bus = Arc::new(std::sync::Mutex::new(EventBus::new()));
        bus.lock()
            .unwrap()
            .register(EventKind::Progress, Box::new(ProgressForwarder { tx: progress_tx }));

        let format = config.format;
        let packaging_needed = config.is_packaging_needed();
        let formats = packager_formats(&config);

        let mut controller = Controller::new(
            &self.ffmpeg_path,
            &self.packager_path,
            config,
            &self.transcoded_root,
            bus,
            &destination_for,
        )?;
        controller.start().await?;

        let outcome = self.poll(job_id, output_id, &mut controller, &mut cancellation, &mut progress_rx).await;

        controller.stop().await;

        match outcome {
            PollOutcome::Finished => self.complete_output(job_id, output_id).await?,
            PollOutcome::Errored => self.fail_output(job_id, output_id, "transcoder or packager exited with an error".into()).await?,
            PollOutcome::Cancelled => self.cancel_output(output_id).await?,
        }

        if self.all_siblings_settled(job_id).await? {
            self.complete_job(job_id, format, packaging_needed, &formats, manifest_destination).await?;
        }

        Ok(())
    }

    async fn initialize(&self, job_id: Uuid, output_id: Uuid) -> CoreResult<()> {
        let mut job = self.store.get_job(job_id).await?;
        let now = Utc::now();
        if job.status != JobStatus::Processing {
            job.status = JobStatus::Processing;
            job.start_time = Some(now);
            self.store.save_job(&job).await?;
            self.webhook.notify(&job).await?;
        }

        let mut output = self.store.get_output(output_id).await?;
        output.mark_processing(now);
        self.store.save_output(&output).await
    }

    /// Polls the controller once per second until it settles or
    /// cancellation fires, forwarding progress events into the progress
    /// callback (P7) as they arrive.
    async fn poll(
        &self,
        job_id: Uuid,
        output_id: Uuid,
        controller: &mut Controller,
        cancellation: &mut CancellationToken,
        progress_rx: &mut tokio::sync::mpsc::UnboundedReceiver<u8>,
    ) -> PollOutcome {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                _ = cancellation.cancelled() => {
                    return PollOutcome::Cancelled;
                }
                Some(percentage) = progress_rx.recv() => {
                    if let Err(err) = self.on_progress(job_id, output_id, percentage).await {
                        warn!(%err, "failed to persist progress callback");
                    }
                    continue;
                }
            }

            match controller.status() {
                NodeStatus::Running => continue,
                NodeStatus::Finished => return PollOutcome::Finished,
                NodeStatus::Errored => return PollOutcome::Errored,
            }
        }
    }

    /// Progress callback (P7): only persists on a multiple of five that
    /// actually changes the stored value, then recomputes the job's mean
    /// progress (P1).
    async fn on_progress(&self, job_id: Uuid, output_id: Uuid, percentage: u8) -> CoreResult<()> {
        let mut output = self.store.get_output(output_id).await?;
        if !output.accepts_progress(percentage) {
            return Ok(());
        }
        output.progress = percentage;
        self.store.save_output(&output).await?;

        let mut job = self.store.get_job(job_id).await?;
        let siblings = self.store.sibling_outputs(job_id).await?;
        job.recompute_progress(&siblings);
        self.store.save_job(&job).await
    }

    async fn complete_output(&self, job_id: Uuid, output_id: Uuid) -> CoreResult<()> {
        let mut output = self.store.get_output(output_id).await?;
        output.mark_completed(Utc::now());
        self.store.save_output(&output).await?;
        let siblings = self.store.sibling_outputs(job_id).await?;
        let mut job = self.store.get_job(job_id).await?;
        job.recompute_progress(&siblings);
        self.store.save_job(&job).await
    }

    async fn cancel_output(&self, output_id: Uuid) -> CoreResult<()> {
        let mut output = self.store.get_output(output_id).await?;
        output.mark_cancelled();
        self.store.save_output(&output).await
    }

    /// The ffmpeg-exception path: marks this Output errored, revokes every
    /// sibling's background task so the job fails fast, and marks the Job
    /// errored (once) with a webhook notification.
    async fn fail_output(&self, job_id: Uuid, output_id: Uuid, message: String) -> CoreResult<()> {
        error!(%job_id, %output_id, %message, "rendition failed");
        let mut output = self.store.get_output(output_id).await?;
        output.mark_error(Utc::now(), Some(message));
        self.store.save_output(&output).await?;

        for sibling in self.store.sibling_outputs(job_id).await? {
            if sibling.id != output_id {
                if let Some(task_id) = sibling.background_task_id {
                    self.queue.revoke(task_id).await;
                }
            }
        }

        let mut job = self.store.get_job(job_id).await?;
        if job.status != JobStatus::Error {
            job.status = JobStatus::Error;
            job.end_time = Some(Utc::now());
            self.store.save_job(&job).await?;
            self.webhook.notify(&job).await?;
        }
        Ok(())
    }

    async fn all_siblings_settled(&self, job_id: Uuid) -> CoreResult<bool> {
        let siblings = self.store.sibling_outputs(job_id).await?;
        Ok(siblings.iter().all(|o| o.status != JobStatus::Processing && o.status != JobStatus::NotStarted))
    }

    /// Atomic job completion (§4.7 step 5 / P5): re-checks sibling statuses
    /// under the job-scoped lock, so only the actual last sibling runs the
    /// merge-and-notify block. `packaging_needed`/`formats` mirror the
    /// decision `Controller::new` made for every sibling (they all share one
    /// job-level format and DRM configuration), so the merger reads each
    /// sibling's packager output directory rather than its bare rendition
    /// directory whenever a packager actually ran.
    async fn complete_job(
        &self,
        job_id: Uuid,
        format: JobFormat,
        packaging_needed: bool,
        formats: &[PackagerFormat],
        manifest_destination: Arc<dyn Storage>,
    ) -> CoreResult<()> {
        let _guard = self.store.lock_job(job_id).await;

        let siblings = self.store.sibling_outputs(job_id).await?;
        let mut job = self.store.get_job(job_id).await?;
        if job.status == JobStatus::Completed {
            return Ok(());
        }
        if siblings.iter().any(|o| o.status != JobStatus::Completed) {
            return Ok(());
        }

        job.status = JobStatus::Completed;
        job.end_time = Some(Utc::now());
        self.store.save_job(&job).await?;
        self.webhook.notify(&job).await?;

        let packaged = packaging_needed && !formats.is_empty();
        let rendition_dirs: Vec<(Option<PathBuf>, Option<PathBuf>)> = siblings
            .iter()
            .map(|output| {
                if !packaged {
                    return (None, None);
                }
                let rendition_dir = rendition_local_dir(&self.transcoded_root, job_id, &output.name);
                let hls = formats.contains(&PackagerFormat::Hls).then(|| rendition_dir.join("hls"));
                let dash = formats.contains(&PackagerFormat::Dash).then(|| rendition_dir.join("dash"));
                (hls, dash)
            })
            .collect();

        let renditions: Vec<crate::manifest::RenditionManifest> = siblings
            .iter()
            .zip(rendition_dirs.iter())
            .map(|(output, (hls_directory, dash_directory))| crate::manifest::RenditionManifest {
                output,
                hls_directory: hls_directory.as_deref(),
                dash_directory: dash_directory.as_deref(),
            })
            .collect();
        crate::manifest::merge_and_publish(&job, format, &renditions, manifest_destination.as_ref()).await?;

        info!(%job_id, "job completed and manifest published");
        Ok(())
    }
}

enum PollOutcome {
    Finished,
    Errored,
    Cancelled,
}
