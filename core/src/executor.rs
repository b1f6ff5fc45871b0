use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::CoreResult;

/// Terminal/running state of a node, ordered so an aggregate over several
/// nodes is a plain `max` (P8): a single errored node makes the whole
/// pipeline errored, a single running node keeps it running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeStatus {
    Running,
    Finished,
    Errored,
}

/// Common lifecycle for every pipeline node: subprocesses, threads, and the
/// fan-out writer all implement this the same way.
#[async_trait]
pub trait Executor: Send {
    async fn start(&mut self) -> CoreResult<()>;
    async fn stop(&mut self, aggregate_status: Option<NodeStatus>);
    fn status(&self) -> NodeStatus;
}

/// Wraps a `tokio::process::Command`, owning the spawned child and exposing
/// its exit status as a `NodeStatus`.
pub struct SubprocessExecutor {
    name: &'static str,
    command: Command,
    child: Option<Child>,
    finished_status: Option<NodeStatus>,
}

impl SubprocessExecutor {
    pub fn new(name: &'static str, mut command: Command) -> Self {
        command.stdin(Stdio::null());
        Self {
            name,
            command,
            child: None,
            finished_status: None,
        }
    }

    /// Takes the child's stdout/stderr pipes so a caller (the transcoder's
    /// log parser) can drive them directly. Must be called before `start`
    /// mutates `self.command`'s stdio configuration further.
    pub fn configure_stdio(&mut self, stdout: Stdio, stderr: Stdio) {
        self.command.stdout(stdout).stderr(stderr);
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    fn poll_status(&mut self) -> NodeStatus {
        if let Some(status) = self.finished_status {
            return status;
        }
        let Some(child) = self.child.as_mut() else {
            return NodeStatus::Running;
        };
        match child.try_wait() {
            Ok(Some(exit)) => {
                let status = if exit.success() {
                    NodeStatus::Finished
                } else {
                    NodeStatus::Errored
                };
                self.finished_status = Some(status);
                status
            }
            Ok(None) => NodeStatus::Running,
            Err(err) => {
                warn!(node = self.name, %err, "failed to poll child process");
                NodeStatus::Errored
            }
        }
    }
}

#[async_trait]
impl Executor for SubprocessExecutor {
    async fn start(&mut self) -> CoreResult<()> {
        let child = self.command.spawn()?;
        debug!(node = self.name, pid = child.id(), "subprocess started");
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self, _aggregate_status: Option<NodeStatus>) {
        if let Some(mut child) = self.child.take() {
            terminate_politely(&mut child, self.name).await;
        }
    }

    fn status(&self) -> NodeStatus {
        self.finished_status.unwrap_or(NodeStatus::Running)
    }
}

/// SIGTERM, then SIGKILL if the process hasn't exited after a grace period.
/// Mirrors `BaseProcessExecutor.stop`'s `terminate()` + 1s wait, generalized
/// to an actual kill since `process.terminate()` has no forceful fallback in
/// the original and ours needs one to avoid leaking zombie ffmpeg/packager
/// processes.
async fn terminate_politely(child: &mut Child, name: &'static str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    match timeout(Duration::from_secs(1), child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(node = name, "process did not exit after SIGTERM, killing");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

/// Decorates a `SubprocessExecutor` so that `stop` waits (up to 5 minutes)
/// for the process to exit on its own when the aggregate status is already
/// `Finished`, instead of forcing termination. Mirrors
/// `PolitelyWaitOnFinishMixin`.
pub struct PolitelyWait<E> {
    inner: E,
}

impl<E> PolitelyWait<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> E {
        self.inner
    }

    pub fn inner_mut(&mut self) -> &mut E {
        &mut self.inner
    }
}

#[async_trait]
impl Executor for PolitelyWait<SubprocessExecutor> {
    async fn start(&mut self) -> CoreResult<()> {
        self.inner.start().await
    }

    async fn stop(&mut self, aggregate_status: Option<NodeStatus>) {
        if aggregate_status == Some(NodeStatus::Finished) {
            if let Some(child) = self.inner.child.as_mut() {
                match timeout(Duration::from_secs(300), child.wait()).await {
                    Ok(_) => {}
                    Err(_) => warn!(node = self.inner.name, "politely-wait timed out after 5m"),
                }
            }
        }
        self.inner.stop(aggregate_status).await;
    }

    fn status(&self) -> NodeStatus {
        self.inner.status()
    }
}

/// A node driven by a repeating async step rather than a subprocess, e.g.
/// the uploader and the fan-out writer. Mirrors `BaseThreadExecutor`'s
/// `_thread_main` loop and `continue_on_exception` flag, expressed with a
/// `tokio::task::JoinHandle` instead of a raw `threading.Thread`.
pub struct ThreadExecutor {
    handle: Option<tokio::task::JoinHandle<()>>,
    stop_tx: Option<tokio::sync::watch::Sender<bool>>,
    /// Set by the spawned task right before it returns, so `status()` can
    /// report the loop's real outcome without needing to await the
    /// `JoinHandle`.
    status: Arc<Mutex<NodeStatus>>,
}

impl ThreadExecutor {
    /// `step` performs one iteration of work and is invoked roughly once per
    /// second until stopped; returning `Err` either continues (when
    /// `continue_on_exception` is true) or ends the loop as `Errored`.
    pub fn spawn<F, Fut>(step: F, continue_on_exception: bool) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CoreResult<()>> + Send,
    {
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        let status = Arc::new(Mutex::new(NodeStatus::Running));
        let task_status = status.clone();
        let handle = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    *task_status.lock().unwrap() = NodeStatus::Finished;
                    return;
                }
                if let Err(err) = step().await {
                    warn!(%err, "thread executor step failed");
                    if !continue_on_exception {
                        *task_status.lock().unwrap() = NodeStatus::Errored;
                        return;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = stop_rx.changed() => {}
                }
            }
        });
        Self {
            handle: Some(handle),
            stop_tx: Some(stop_tx),
            status,
        }
    }
}

#[async_trait]
impl Executor for ThreadExecutor {
    async fn start(&mut self) -> CoreResult<()> {
        Ok(())
    }

    async fn stop(&mut self, _aggregate_status: Option<NodeStatus>) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(%err, "thread executor task panicked");
                *self.status.lock().unwrap() = NodeStatus::Errored;
            }
        }
    }

    fn status(&self) -> NodeStatus {
        match &self.handle {
            Some(handle) if !handle.is_finished() => NodeStatus::Running,
            _ => *self.status.lock().unwrap(),
        }
    }
}

/// Reduces a set of node statuses with the aggregate-max rule (P8): empty
/// input is `Finished`, otherwise `Running < Finished < Errored`.
pub fn aggregate_status(statuses: impl IntoIterator<Item = NodeStatus>) -> NodeStatus {
    statuses
        .into_iter()
        .max()
        .unwrap_or(NodeStatus::Finished)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_empty_set_is_finished() {
        assert_eq!(aggregate_status(vec![]), NodeStatus::Finished);
    }

    #[test]
    fn aggregate_takes_the_max() {
        assert_eq!(
            aggregate_status(vec![NodeStatus::Running, NodeStatus::Finished]),
            NodeStatus::Finished
        );
        assert_eq!(
            aggregate_status(vec![NodeStatus::Finished, NodeStatus::Errored]),
            NodeStatus::Errored
        );
    }
}
