use crate::digest::DigestOrchestrator;
use crate::types::{DigestRunReport, Result, RunStatus, SignUpEvent, WelcomeOutcome};
use crate::welcome::WelcomeWorkflow;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What started a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    /// The daily cron fire.
    Scheduled,
    /// `app/send.daily.news` sent by hand.
    ManualEvent,
    UserCreated(SignUpEvent),
}

#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Digest(DigestRunReport),
    Welcome(WelcomeOutcome),
}

impl TriggerOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            TriggerOutcome::Digest(report) => report.run.status,
            TriggerOutcome::Welcome(outcome) => outcome.run.status,
        }
    }
}

/// Routes triggers to the workflow they start.
pub struct WorkflowDispatcher {
    digest: Arc<DigestOrchestrator>,
    welcome: Arc<WelcomeWorkflow>,
}

impl WorkflowDispatcher {
    pub fn new(digest: Arc<DigestOrchestrator>, welcome: Arc<WelcomeWorkflow>) -> Self {
        Self { digest, welcome }
    }

    pub async fn dispatch(&self, trigger: Trigger, run_id: Uuid) -> Result<TriggerOutcome> {
        info!(%run_id, ?trigger, "Dispatching trigger");
        match trigger {
            Trigger::Scheduled | Trigger::ManualEvent => Ok(TriggerOutcome::Digest(self.digest.run(run_id).await?)),
            Trigger::UserCreated(event) => Ok(TriggerOutcome::Welcome(self.welcome.run(run_id, &event).await?)),
        }
    }
}

/// 12:00 UTC.
pub fn default_digest_time() -> NaiveTime {
    NaiveTime::MIN + Duration::hours(12)
}

/// The first instant strictly after `now` whose UTC time of day is `at`.
pub fn next_daily_run(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

/// Fire a `Scheduled` trigger every day at `at` (UTC) until Ctrl-C.
pub async fn run_daily_schedule(dispatcher: &WorkflowDispatcher, at: NaiveTime) -> Result<()> {
    loop {
        let now = Utc::now();
        let next = next_daily_run(now, at);
        let wait = (next - now).to_std().unwrap_or_default();
        info!("Next digest run at {} (in {:?})", next.to_rfc3339(), wait);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Scheduler stopped");
                return Ok(());
            }
        }

        match dispatcher.dispatch(Trigger::Scheduled, Uuid::new_v4()).await {
            Ok(outcome) if outcome.status() == RunStatus::Completed => {}
            Ok(outcome) => warn!("Scheduled digest finished with status {}", outcome.status()),
            Err(e) => error!("Scheduled digest could not run: {}", e),
        }
    }
}
