//! Webhook Notifier: at-least-once JSON POST of a Job's serialized state on
//! every status transition. Grounded in
//! `lumberjack/apps/jobs/tasks.py::PostDataToWebhookTask` and
//! `apps/jobs/mixins.py::JobNotifierMixin`.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::CoreResult;
use crate::model::Job;

const MAX_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Fires a JSON POST of `job` to `job.webhook_url`, retrying with
/// exponential backoff on connection errors or non-2xx responses up to
/// `MAX_ATTEMPTS` times. A webhook failure is logged, never propagated to
/// the caller: the Runner fires this task-and-forgets, matching the
/// original's re-enqueue-on-failure semantics.
pub struct WebhookNotifier {
    client: reqwest::Client,
    initial_backoff: Duration,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self::with_initial_backoff(DEFAULT_INITIAL_BACKOFF)
    }

    /// Same as `new`, but with a caller-supplied initial backoff, letting
    /// the worker harness tune retry pacing via config instead of a
    /// hardcoded constant.
    pub fn with_initial_backoff(initial_backoff: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build webhook http client"),
            initial_backoff,
        }
    }

    /// Delivers `job`'s current state to its `webhook_url`, if any.
    /// Returns `Ok(())` once a 2xx response is observed, exhausting retries
    /// with a logged warning rather than returning an error on total
    /// failure (P4 only requires *a* POST fires per transition, not that
    /// this call succeeds synchronously).
    pub async fn notify(&self, job: &Job) -> CoreResult<()> {
        let Some(url) = job.webhook_url.as_deref() else {
            return Ok(());
        };

        let mut backoff = self.initial_backoff;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.post(url).json(job).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(job_id = %job.id, attempt, "webhook delivered");
                    return Ok(());
                }
                Ok(response) => {
                    warn!(job_id = %job.id, attempt, status = %response.status(), "webhook rejected");
                }
                Err(err) => {
                    warn!(job_id = %job.id, attempt, %err, "webhook delivery failed");
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        warn!(job_id = %job.id, "webhook exhausted retries, giving up");
        Ok(())
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}
