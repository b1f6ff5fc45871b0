//! Fan-out Writer: duplicates bytes read from one named pipe to N downstream
//! named pipes, used when both HLS and DASH packagers consume a single
//! ffmpeg output. Grounded in
//! `lumberjack/apps/jobs/controller.py::OneToManyPipeWriter`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::CoreResult;
use crate::executor::{Executor, NodeStatus};

const CHUNK_SIZE: usize = 64 * 1024;

/// Reads from `input_pipe` and duplicates every chunk to every pipe in
/// `output_pipes`. A write failure on any output pipe is treated as the
/// downstream packager having died, and ends the whole fan-out as `Errored`.
pub struct FanoutWriter {
    input_pipe: PathBuf,
    output_pipes: Vec<PathBuf>,
    handle: Option<JoinHandle<()>>,
    /// Set by `copy_loop` right before it returns, so `status()` can report
    /// the loop's real outcome without needing to await the `JoinHandle`.
    status: Arc<Mutex<NodeStatus>>,
}

impl FanoutWriter {
    pub fn new(input_pipe: PathBuf, output_pipes: Vec<PathBuf>) -> Self {
        Self {
            input_pipe,
            output_pipes,
            handle: None,
            status: Arc::new(Mutex::new(NodeStatus::Running)),
        }
    }

    async fn copy_loop(input_pipe: PathBuf, output_pipes: Vec<PathBuf>, status: Arc<Mutex<NodeStatus>>) {
        let mut outputs = Vec::with_capacity(output_pipes.len());
        for path in &output_pipes {
            match File::create(path).await {
                Ok(file) => outputs.push(file),
                Err(err) => {
                    error!(pipe = %path.display(), %err, "fan-out failed to open output pipe");
                    *status.lock().unwrap() = NodeStatus::Errored;
                    return;
                }
            }
        }

        let mut input = match File::open(&input_pipe).await {
            Ok(file) => file,
            Err(err) => {
                error!(pipe = %input_pipe.display(), %err, "fan-out failed to open input pipe");
                *status.lock().unwrap() = NodeStatus::Errored;
                return;
            }
        };

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let read = match input.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    warn!(%err, "fan-out input pipe read error");
                    break;
                }
            };

            for (path, output) in output_pipes.iter().zip(outputs.iter_mut()) {
                if let Err(err) = output.write_all(&buf[..read]).await {
                    error!(pipe = %path.display(), %err, "fan-out write failed, downstream packager likely died");
                    *status.lock().unwrap() = NodeStatus::Errored;
                    return;
                }
            }
        }

        for output in &mut outputs {
            let _ = output.shutdown().await;
        }
        *status.lock().unwrap() = NodeStatus::Finished;
    }
}

#[async_trait]
impl Executor for FanoutWriter {
    async fn start(&mut self) -> CoreResult<()> {
        let input_pipe = self.input_pipe.clone();
        let output_pipes = self.output_pipes.clone();
        let status = self.status.clone();
        self.handle = Some(tokio::spawn(Self::copy_loop(input_pipe, output_pipes, status)));
        Ok(())
    }

    async fn stop(&mut self, _aggregate_status: Option<NodeStatus>) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    fn status(&self) -> NodeStatus {
        match &self.handle {
            Some(handle) if !handle.is_finished() => NodeStatus::Running,
            Some(_) => *self.status.lock().unwrap(),
            None => NodeStatus::Finished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[cfg(unix)]
    #[tokio::test]
    async fn duplicates_bytes_to_every_output_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        let out_a = dir.path().join("out_a");
        let out_b = dir.path().join("out_b");

        for p in [&input, &out_a, &out_b] {
            nix::unistd::mkfifo(p.as_path(), nix::sys::stat::Mode::S_IRWXU).unwrap();
        }

        let mut writer = FanoutWriter::new(input.clone(), vec![out_a.clone(), out_b.clone()]);
        writer.start().await.unwrap();

        let (a, b, mut w) = tokio::join!(
            async { tokio::fs::read(&out_a).await.unwrap() },
            async { tokio::fs::read(&out_b).await.unwrap() },
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut f = File::create(&input).await.unwrap();
                f.write_all(b"hello").await.unwrap();
                f.shutdown().await.unwrap();
            }
        );
        let _ = &mut w;

        assert_eq!(a, b"hello");
        assert_eq!(b, b"hello");

        writer.stop(None).await;
        assert_eq!(writer.status(), NodeStatus::Finished);
    }
}
