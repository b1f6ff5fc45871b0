//! Job/Output persistence port. The core only needs a narrow read/write
//! surface plus a per-job critical section for the "last sibling finishes"
//! completion check (P5); the real row-level lock lives in whatever
//! relational store backs a production deployment. Grounded in
//! `lumberjack/apps/jobs/runnables.py`'s job/output queries and
//! `ferrex-core`'s `*RepositoryTrait: Send + Sync` repository ports.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{Job, Output};

/// Held while a Runner executes the atomic job-completion critical section
/// (§4.7 step 5 / P5); dropping it releases the job-scoped lock. Plays the
/// role of a `SELECT ... FOR UPDATE` row lock without committing this trait
/// to a generic (and therefore non-object-safe) `with_lock` method.
pub struct JobLockGuard {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, job_id: Uuid) -> CoreResult<Job>;
    async fn save_job(&self, job: &Job) -> CoreResult<()>;
    async fn get_output(&self, output_id: Uuid) -> CoreResult<Output>;
    async fn save_output(&self, output: &Output) -> CoreResult<()>;
    /// Every Output belonging to `job_id`, in creation order.
    async fn sibling_outputs(&self, job_id: Uuid) -> CoreResult<Vec<Output>>;

    /// Acquires the job-scoped lock; the caller re-checks sibling statuses
    /// and performs the completion/merge while holding the returned guard,
    /// so only the actual last sibling runs that block.
    async fn lock_job(&self, job_id: Uuid) -> JobLockGuard;
}

/// In-memory `JobStore`, sufficient for single-process test harnesses and
/// the CLI runner; a real deployment swaps this for a relational backend
/// without the Rendition Runner or Manifest Merger noticing.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    outputs: Mutex<HashMap<Uuid, Output>>,
    job_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_job(&self, job: Job) {
        self.jobs.lock().await.insert(job.id, job);
    }

    pub async fn insert_output(&self, output: Output) {
        self.outputs.lock().await.insert(output.id, output);
    }

    async fn job_lock(&self, job_id: Uuid) -> Arc<Mutex<()>> {
        self.job_locks
            .lock()
            .await
            .entry(job_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get_job(&self, job_id: Uuid) -> CoreResult<Job> {
        self.jobs
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| CoreError::InvalidSettings(format!("unknown job {job_id}")))
    }

    async fn save_job(&self, job: &Job) -> CoreResult<()> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_output(&self, output_id: Uuid) -> CoreResult<Output> {
        self.outputs
            .lock()
            .await
            .get(&output_id)
            .cloned()
            .ok_or_else(|| CoreError::InvalidSettings(format!("unknown output {output_id}")))
    }

    async fn save_output(&self, output: &Output) -> CoreResult<()> {
        self.outputs.lock().await.insert(output.id, output.clone());
        Ok(())
    }

    async fn sibling_outputs(&self, job_id: Uuid) -> CoreResult<Vec<Output>> {
        let mut outputs: Vec<Output> = self
            .outputs
            .lock()
            .await
            .values()
            .filter(|o| o.job_id == Some(job_id))
            .cloned()
            .collect();
        outputs.sort_by_key(|o| o.created);
        Ok(outputs)
    }

    async fn lock_job(&self, job_id: Uuid) -> JobLockGuard {
        let lock = self.job_lock(job_id).await;
        JobLockGuard {
            _guard: lock.lock_owned().await,
        }
    }
}
