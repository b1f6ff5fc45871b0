//! End-to-end exercises of the Rendition Runner against real subprocesses
//! (`true`/`false` standing in for `ffmpeg`/`packager`, as the unit tests in
//! `transcoder.rs`/`controller.rs` do), covering spec.md §8's scenarios that
//! need the whole pipeline wired together rather than one module in
//! isolation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use transcode_core::model::{
    AudioPreset, Job, JobFormat, JobStatus, JobTemplate, Output, OutputPreset, PlaylistType, RenditionConfig,
    VideoPreset,
};
use transcode_core::queue::InMemoryTaskQueue;
use transcode_core::storage::{LocalStorage, Storage};
use transcode_core::store::InMemoryJobStore;
use transcode_core::{JobStore, RenditionRunner, TaskQueue, WebhookNotifier};

fn template(format: JobFormat, renditions: &[(&str, u32, u32, u32)]) -> JobTemplate {
    JobTemplate {
        id: Uuid::new_v4(),
        name: "integration".into(),
        format,
        segment_length: 10,
        playlist_type: PlaylistType::Vod,
        outputs: renditions
            .iter()
            .map(|(name, _bitrate, width, height)| OutputPreset {
                name: (*name).into(),
                video: VideoPreset {
                    width: *width,
                    height: *height,
                    codec: None,
                    bitrate: None,
                    preset: None,
                },
                audio: AudioPreset { codec: None, bitrate: None },
            })
            .collect(),
    }
}

fn job(output_url: &str, webhook_url: Option<String>, template: &JobTemplate) -> Job {
    let mut job = Job {
        id: Uuid::new_v4(),
        template: Some(template.id),
        settings: None,
        background_task_id: None,
        progress: 0,
        status: JobStatus::NotStarted,
        input_url: "/in/video.mp4".into(),
        output_url: output_url.into(),
        webhook_url,
        encryption_key: None,
        key_url: None,
        meta_data: None,
        start_time: None,
        end_time: None,
        created: Utc::now(),
    };
    job.populate_settings(Some(template));
    job
}

fn output(job_id: Uuid, name: &str, bitrate: u32, width: u32, height: u32) -> Output {
    Output {
        id: Uuid::new_v4(),
        job_id: Some(job_id),
        name: name.into(),
        video_encoder: "h264".into(),
        video_bitrate: bitrate,
        video_preset: "faster".into(),
        audio_encoder: "aac".into(),
        audio_bitrate: 128_000,
        width,
        height,
        status: JobStatus::NotStarted,
        progress: 0,
        background_task_id: None,
        settings: None,
        error_message: None,
        start_time: None,
        end_time: None,
        created: Utc::now(),
    }
}

fn local_destination_for(root: std::path::PathBuf) -> impl Fn(&Path) -> Arc<dyn Storage> {
    move |dir: &Path| {
        let relative = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        Arc::new(LocalStorage::new(root.join(relative))) as Arc<dyn Storage>
    }
}

/// Scenario 1 (plain HLS, single rendition) driven through the whole Runner:
/// the manifest published at `output_url` matches the exact byte layout
/// spec.md §8 requires, and the job settles `Completed` with `end_time` set
/// (P2, P3).
#[tokio::test]
async fn plain_hls_job_completes_and_publishes_exact_master_manifest() {
    let transcoded_root = tempfile::tempdir().unwrap();
    let uploads_root = tempfile::tempdir().unwrap();
    let manifest_dir = tempfile::tempdir().unwrap();
    let manifest_path = manifest_dir.path().join("master.m3u8");

    let tmpl = template(JobFormat::Hls, &[("720p", 1_500_000, 1280, 720)]);
    let job = job(&manifest_path.to_string_lossy(), None, &tmpl);
    let out = output(job.id, "720p", 1_500_000, 1280, 720);

    let store = Arc::new(InMemoryJobStore::new());
    store.insert_job(job.clone()).await;
    store.insert_output(out.clone()).await;

    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new());
    let webhook = Arc::new(WebhookNotifier::new());
    let runner = RenditionRunner::new(store.clone(), queue.clone(), webhook, "true", "true", transcoded_root.path());

    let config = RenditionConfig::from_job_and_output(&job, &out, &tmpl);
    let cancellation = queue.enqueue(out.id, "transcode", serde_json::Value::Null).await;
    let manifest_destination: Arc<dyn Storage> = Arc::new(LocalStorage::new(manifest_path.clone()));

    runner
        .run(
            job.id,
            out.id,
            config,
            cancellation,
            local_destination_for(uploads_root.path().to_path_buf()),
            manifest_destination,
        )
        .await
        .unwrap();

    let final_job = store.get_job(job.id).await.unwrap();
    assert_eq!(final_job.status, JobStatus::Completed);
    assert!(final_job.end_time.is_some());

    let final_output = store.get_output(out.id).await.unwrap();
    assert_eq!(final_output.status, JobStatus::Completed);

    let manifest = std::fs::read_to_string(&manifest_path).unwrap();
    assert_eq!(
        manifest,
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-STREAM-INF:BANDWIDTH=1500000,RESOLUTION=1280x720\n720p/video.m3u8\n"
    );
}

/// Scenario 3: one rendition's transcoder exits non-zero. Expected: that
/// Output is `Error` with a message, the sibling's task is revoked (so it
/// settles `Cancelled`), the Job is `Error` exactly once, and a webhook
/// fires for the `Processing -> Error` transition.
#[tokio::test]
async fn transcoder_failure_revokes_sibling_and_marks_job_errored() {
    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .respond_with(wiremock::ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let transcoded_root = tempfile::tempdir().unwrap();
    let uploads_root = tempfile::tempdir().unwrap();
    let manifest_dir = tempfile::tempdir().unwrap();
    let manifest_path = manifest_dir.path().join("master.m3u8");

    let tmpl = template(JobFormat::Hls, &[("720p", 1_500_000, 1280, 720), ("360p", 800_000, 640, 360)]);
    let job = job(&manifest_path.to_string_lossy(), Some(format!("{}/hook", server.uri())), &tmpl);
    let failing = output(job.id, "720p", 1_500_000, 1280, 720);
    let mut slow = output(job.id, "360p", 800_000, 640, 360);

    let store = Arc::new(InMemoryJobStore::new());
    store.insert_job(job.clone()).await;
    store.insert_output(failing.clone()).await;

    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new());
    // Registers the second output's cancellation token before the first
    // output fails, mirroring the real flow where every sibling's task is
    // already enqueued by the time any one of them settles.
    let slow_cancellation = queue.enqueue(slow.id, "transcode", serde_json::Value::Null).await;
    slow.background_task_id = Some(slow.id);
    store.insert_output(slow.clone()).await;

    let webhook = Arc::new(WebhookNotifier::new());
    let runner = RenditionRunner::new(store.clone(), queue.clone(), webhook, "false", "true", transcoded_root.path());

    let failing_config = RenditionConfig::from_job_and_output(&job, &failing, &tmpl);
    let failing_cancellation = queue.enqueue(failing.id, "transcode", serde_json::Value::Null).await;
    let manifest_destination: Arc<dyn Storage> = Arc::new(LocalStorage::new(manifest_path.clone()));

    runner
        .run(
            job.id,
            failing.id,
            failing_config,
            failing_cancellation,
            local_destination_for(uploads_root.path().to_path_buf()),
            manifest_destination.clone(),
        )
        .await
        .unwrap();

    let after_first_failure = store.get_job(job.id).await.unwrap();
    assert_eq!(after_first_failure.status, JobStatus::Error);
    assert!(after_first_failure.end_time.is_some());

    let failed_output = store.get_output(failing.id).await.unwrap();
    assert_eq!(failed_output.status, JobStatus::Error);
    assert!(failed_output.error_message.is_some());
    assert!(slow_cancellation.is_cancelled());

    // The second runner observes the already-flipped cancellation token as
    // soon as it starts polling and settles Cancelled instead of running to
    // completion.
    let slow_config = RenditionConfig::from_job_and_output(&job, &slow, &tmpl);
    let runner_two = RenditionRunner::new(
        store.clone(),
        queue.clone(),
        Arc::new(WebhookNotifier::new()),
        "true",
        "true",
        transcoded_root.path(),
    );
    runner_two
        .run(
            job.id,
            slow.id,
            slow_config,
            slow_cancellation,
            local_destination_for(uploads_root.path().to_path_buf()),
            manifest_destination,
        )
        .await
        .unwrap();

    let cancelled_output = store.get_output(slow.id).await.unwrap();
    assert_eq!(cancelled_output.status, JobStatus::Cancelled);

    // The job was already marked Error by the first runner; completing the
    // (non-Completed) second sibling must not re-trigger the manifest merge
    // or flip the job status again (P5: exactly one merge).
    let still_errored = store.get_job(job.id).await.unwrap();
    assert_eq!(still_errored.status, JobStatus::Error);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let requests = server.received_requests().await.unwrap();
    assert!(!requests.is_empty(), "expected at least one webhook POST");
}
