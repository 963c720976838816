//! Periodic jobs and the cron ticker that drives them.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::Error;
use crate::materializer::{ConversionReport, EmailMaterializer};

/// Create emails for every pending event.
pub async fn convert_events_to_emails(
    materializer: &EmailMaterializer,
) -> Result<ConversionReport, Error> {
    materializer.convert_pending_events().await
}

/// Send every email that is due and not yet sent.
pub async fn send_unsent_scheduled_emails(dispatcher: &Dispatcher) -> Result<DispatchReport, Error> {
    dispatcher.run_due(Utc::now()).await
}

/// Spawn a task that runs `job` at every fire time of `schedule`.
///
/// Runs never overlap. Failed runs are retried on the next fire time,
/// except configuration errors, which stop the ticker.
pub fn spawn_job_ticker<F, Fut>(
    name: &'static str,
    schedule: cron::Schedule,
    job: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                info!(job = name, "Schedule has no further fire times");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(job = name, next = %next, "Waiting for next run");
            tokio::time::sleep(wait).await;

            match job().await {
                Ok(()) => debug!(job = name, "Job run finished"),
                Err(e) if !e.is_retryable() => {
                    error!(job = name, "Job stopped: {e}");
                    break;
                }
                Err(e) => warn!(job = name, "Job run failed, retrying next tick: {e}"),
            }
        }
    })
}
