//! Worker harness for the transcoding pipeline core: parses one job
//! template + input/output URL pair from the command line, runs every
//! rendition to completion against in-memory `JobStore`/`TaskQueue` doubles,
//! and prints the final `Job`. Exercises the same surface a real
//! queue-backed worker would, without requiring a broker or database.

mod config;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use transcode_core::model::{
    AudioPreset, Job, JobFormat, JobStatus, JobTemplate, Output, OutputPreset, PlaylistType, RenditionConfig,
    VideoPreset,
};
use transcode_core::storage::storage_for_url;
use transcode_core::{InMemoryJobStore, InMemoryTaskQueue, JobStore, RenditionRunner, TaskQueue, WebhookNotifier};

use config::Config;

/// Command line arguments for the transcoding worker harness.
#[derive(Parser, Debug)]
#[command(name = "transcode-worker")]
#[command(about = "Runs one transcoding job's renditions to completion against local doubles")]
struct Args {
    /// Source media URL or local path.
    #[arg(long)]
    input: String,

    /// Destination URL or local path for the job's published output.
    #[arg(long)]
    output: String,

    /// Output format for the job.
    #[arg(long, value_enum, default_value = "hls")]
    format: CliFormat,

    /// Webhook URL notified on every job status transition, if any.
    #[arg(long)]
    webhook_url: Option<String>,

    /// `width:height` renditions to produce, repeatable (e.g. `--rendition 1280:720 --rendition 640:360`).
    #[arg(long = "rendition", value_parser = parse_rendition, num_args = 1.., default_values = ["1280:720"])]
    renditions: Vec<(u32, u32)>,

    /// Overrides the webhook notifier's initial retry backoff (e.g. `250ms`, `1s`).
    #[arg(long, value_parser = humantime::parse_duration)]
    webhook_backoff: Option<std::time::Duration>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliFormat {
    Hls,
    Dash,
    Adaptive,
    Mp4,
}

impl From<CliFormat> for JobFormat {
    fn from(value: CliFormat) -> Self {
        match value {
            CliFormat::Hls => JobFormat::Hls,
            CliFormat::Dash => JobFormat::Dash,
            CliFormat::Adaptive => JobFormat::Adaptive,
            CliFormat::Mp4 => JobFormat::Mp4,
        }
    }
}

fn parse_rendition(raw: &str) -> Result<(u32, u32), String> {
    let (w, h) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected WIDTH:HEIGHT, got {raw:?}"))?;
    let width: u32 = w.parse().map_err(|_| format!("invalid width in {raw:?}"))?;
    let height: u32 = h.parse().map_err(|_| format!("invalid height in {raw:?}"))?;
    Ok((width, height))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcode_server=info,transcode_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(backoff) = args.webhook_backoff {
        config.webhook_initial_backoff = backoff;
    }
    config.ensure_transcoded_root()?;

    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new());
    let webhook = Arc::new(WebhookNotifier::with_initial_backoff(config.webhook_initial_backoff));

    let template = build_template(args.format.into(), &args.renditions);
    let job = build_job(&args.input, &args.output, args.webhook_url, &template);

    for output in outputs_for_template(&template, job.id) {
        store.save_output(&output).await?;
    }
    store.save_job(&job).await?;

    let runner = RenditionRunner::new(
        store.clone(),
        queue.clone(),
        webhook.clone(),
        config.ffmpeg_path.clone(),
        config.packager_path.clone(),
        config.transcoded_root.clone(),
    );

    let manifest_destination: Arc<dyn transcode_core::storage::Storage> = Arc::from(storage_for_url(&job.output_url));
    let output_root = Path::new(&job.output_url)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let siblings = store.sibling_outputs(job.id).await?;

    for output in &siblings {
        let rendition_config = RenditionConfig::from_job_and_output(&job, output, &template);
        let cancellation = queue.enqueue(output.id, "transcode", serde_json::Value::Null).await;
        let job_id = job.id;
        let output_id = output.id;
        let transcoded_root = config.transcoded_root.clone();
        let output_root = output_root.clone();

        runner
            .run(
                job_id,
                output_id,
                rendition_config,
                cancellation,
                move |local_dir: &Path| -> Arc<dyn transcode_core::storage::Storage> {
                    let relative = local_dir.strip_prefix(&transcoded_root).unwrap_or(local_dir);
                    let destination = format!("{}/{}", output_root.trim_end_matches('/'), relative.display());
                    Arc::from(storage_for_url(&destination))
                },
                manifest_destination.clone(),
            )
            .await?;
    }

    let final_job = store.get_job(job.id).await?;
    println!("{}", serde_json::to_string_pretty(&final_job)?);
    Ok(())
}

fn build_template(format: JobFormat, renditions: &[(u32, u32)]) -> JobTemplate {
    let outputs = renditions
        .iter()
        .map(|(width, height)| OutputPreset {
            name: format!("{height}p"),
            video: VideoPreset {
                width: *width,
                height: *height,
                codec: None,
                bitrate: None,
                preset: None,
            },
            audio: AudioPreset { codec: None, bitrate: None },
        })
        .collect();

    JobTemplate {
        id: Uuid::new_v4(),
        name: "cli-submitted".into(),
        format,
        segment_length: 10,
        playlist_type: PlaylistType::Vod,
        outputs,
    }
}

fn build_job(input_url: &str, output_url: &str, webhook_url: Option<String>, template: &JobTemplate) -> Job {
    let mut job = Job {
        id: Uuid::new_v4(),
        template: Some(template.id),
        settings: None,
        background_task_id: None,
        progress: 0,
        status: JobStatus::NotStarted,
        input_url: input_url.to_string(),
        output_url: output_url.to_string(),
        webhook_url,
        encryption_key: None,
        key_url: None,
        meta_data: None,
        start_time: None,
        end_time: None,
        created: chrono::Utc::now(),
    };
    job.populate_settings(Some(template));
    job
}

fn outputs_for_template(template: &JobTemplate, job_id: Uuid) -> Vec<Output> {
    template
        .outputs
        .iter()
        .map(|preset| {
            Output {
                id: Uuid::new_v4(),
                job_id: Some(job_id),
                name: preset.name.clone(),
                video_encoder: preset.video.codec.clone().unwrap_or_else(|| "h264".into()),
                video_bitrate: preset.video.bitrate.unwrap_or(1_500_000),
                video_preset: preset.video.preset.clone().unwrap_or_else(|| "faster".into()),
                audio_encoder: preset.audio.codec.clone().unwrap_or_else(|| "aac".into()),
                audio_bitrate: preset.audio.bitrate.unwrap_or(128_000),
                width: preset.video.width,
                height: preset.video.height,
                status: JobStatus::NotStarted,
                progress: 0,
                background_task_id: None,
                settings: None,
                error_message: None,
                start_time: None,
                end_time: None,
                created: chrono::Utc::now(),
            }
        })
        .collect()
}
