//! Uploader Node: periodically mirrors a rendition's local output directory
//! to its configured storage backend, finishing with one last pass once the
//! transcode itself has completed. Grounded in
//! `lumberjack/apps/executors/cloud.py::CloudUploader`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::CoreResult;
use crate::events::{Event, Observer};
use crate::executor::{Executor, NodeStatus, ThreadExecutor};
use crate::storage::Storage;

/// Observer that flips a shared flag when the transcoder announces it has
/// finished writing output, so a concurrently-running uploader tick can stop
/// treating playlist files as partial. Registered on `EventKind::Output`.
pub struct TranscodeCompletedFlag {
    flag: Arc<AtomicBool>,
}

impl TranscodeCompletedFlag {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }
}

impl Observer for TranscodeCompletedFlag {
    fn notify(&mut self, event: &Event) {
        if let Event::Output { transcode_completed } = event {
            if *transcode_completed {
                self.flag.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Drives one rendition's `Storage::sync_directory` on a `ThreadExecutor`
/// loop. `continue_on_exception=true` mirrors `CloudUploader`'s behaviour of
/// logging and retrying on the next tick rather than killing the whole
/// controller over one failed upload pass.
pub struct UploaderNode {
    executor: ThreadExecutor,
    source_directory: PathBuf,
    storage: Arc<dyn Storage>,
    transcode_completed: Arc<AtomicBool>,
}

impl UploaderNode {
    pub fn new(source_directory: PathBuf, storage: Arc<dyn Storage>, transcode_completed: Arc<AtomicBool>) -> Self {
        Self {
            executor: ThreadExecutor::spawn(|| async { Ok(()) }, true),
            source_directory,
            storage,
            transcode_completed,
        }
    }

    fn spawn_loop(&mut self) {
        let source_directory = self.source_directory.clone();
        let storage = self.storage.clone();
        let transcode_completed = self.transcode_completed.clone();
        self.executor = ThreadExecutor::spawn(
            move || {
                let source_directory = source_directory.clone();
                let storage = storage.clone();
                let transcode_completed = transcode_completed.clone();
                async move {
                    storage
                        .sync_directory(&source_directory, transcode_completed.load(Ordering::SeqCst))
                        .await
                }
            },
            true,
        );
    }

    /// Final, un-skippable sync pass run once after `stop`, uploading
    /// whatever the last regular tick left behind (including the playlist,
    /// now that the transcode is known to be complete). Mirrors
    /// `CloudUploader.post_stop`.
    pub async fn post_stop(&self) -> CoreResult<()> {
        self.storage.sync_directory(&self.source_directory, true).await
    }
}

#[async_trait]
impl Executor for UploaderNode {
    async fn start(&mut self) -> CoreResult<()> {
        self.spawn_loop();
        Ok(())
    }

    async fn stop(&mut self, aggregate_status: Option<NodeStatus>) {
        self.executor.stop(aggregate_status).await;
        if let Err(err) = self.post_stop().await {
            warn!(%err, "uploader final sync pass failed");
        }
    }

    fn status(&self) -> NodeStatus {
        self.executor.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use std::time::Duration;

    #[tokio::test]
    async fn uploads_on_tick_and_final_pass_clears_playlist() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("segment.ts"), b"data").unwrap();
        std::fs::write(src.path().join("video.m3u8"), b"#EXTM3U").unwrap();

        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(dest.path().join("out")));
        let flag = Arc::new(AtomicBool::new(false));
        let mut node = UploaderNode::new(src.path().to_path_buf(), storage, flag);

        node.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dest.path().join("out/segment.ts").exists());
        assert!(!dest.path().join("out/video.m3u8").exists());

        node.stop(Some(NodeStatus::Finished)).await;
        assert!(dest.path().join("out/video.m3u8").exists());
    }
}
