use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;
// Boundary shapes and collaborator traits live in the interfaces crate
pub use interfaces::defs::{ArticleSource, Mailer, OutgoingEmail, RawArticle, SignUpEvent, Subscriber, SubscriberSource, Summarizer};

/// A validated, formatted news article. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub headline: String,
    pub summary: String,
    pub source: String,
    pub url: String,
    /// Unix seconds
    pub datetime: i64,
    pub related_symbol: Option<String>,
    pub image: Option<String>,
}

impl Article {
    /// Composite identity used for de-duplication.
    pub fn dedup_key(&self) -> (i64, String, String) {
        (self.id, self.url.clone(), self.headline.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberDigestInput {
    pub subscriber_id: String,
    pub email: String,
    pub display_name: String,
    /// Uppercased, trimmed, de-duplicated, in watchlist order
    pub interest_tags: Vec<String>,
}

impl SubscriberDigestInput {
    pub fn new(subscriber: &Subscriber, tags: &[String]) -> Self {
        Self {
            subscriber_id: subscriber.id.clone(),
            email: subscriber.email.clone(),
            display_name: subscriber.name.clone(),
            interest_tags: crate::aggregator::normalize_tags(tags),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(DigestError::General(format!("Unknown run status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            other => Err(DigestError::General(format!("Unknown step status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn new(run_id: Uuid, workflow: &str) -> Self {
        Self {
            run_id,
            workflow: workflow.to_string(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// pending -> running -> {completed, failed}. A failed run may go back to
    /// running when it is resumed under the same id.
    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Failed, RunStatus::Running)
        );
        if !allowed {
            return Err(DigestError::InvalidTransition {
                run_id: self.run_id,
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        match next {
            RunStatus::Completed | RunStatus::Failed => self.finished_at = Some(Utc::now()),
            RunStatus::Running => {
                self.finished_at = None;
                self.error = None;
            }
            RunStatus::Pending => {}
        }
        Ok(())
    }

    pub fn fail(&mut self, error: String) -> Result<()> {
        self.transition(RunStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub run_id: Uuid,
    pub step_name: String,
    pub attempts: u32,
    pub status: StepStatus,
    pub value: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(run_id: Uuid, step_name: &str, attempts: u32, value: serde_json::Value) -> Self {
        Self {
            run_id,
            step_name: step_name.to_string(),
            attempts,
            status: StepStatus::Succeeded,
            value: Some(value),
            error_message: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(run_id: Uuid, step_name: &str, attempts: u32, error_message: String) -> Self {
        Self {
            run_id,
            step_name: step_name.to_string(),
            attempts,
            status: StepStatus::Failed,
            value: None,
            error_message: Some(error_message),
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestOutcome {
    pub subscriber_id: String,
    pub email: String,
    pub name: String,
    pub articles: Vec<Article>,
    pub summary_text: Option<String>,
    pub delivered: bool,
}

impl DigestOutcome {
    /// Outcome for a subscriber whose pipeline errored.
    pub fn failed(subscriber: &Subscriber) -> Self {
        Self {
            subscriber_id: subscriber.id.clone(),
            email: subscriber.email.clone(),
            name: subscriber.name.clone(),
            articles: Vec::new(),
            summary_text: None,
            delivered: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DigestRunReport {
    pub run: WorkflowRun,
    pub outcomes: Vec<DigestOutcome>,
}

impl DigestRunReport {
    pub fn delivered_count(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.delivered).count()
    }

    pub fn outcome_for(&self, subscriber_id: &str) -> Option<&DigestOutcome> {
        self.outcomes.iter().find(|outcome| outcome.subscriber_id == subscriber_id)
    }
}

#[derive(Debug, Clone)]
pub struct WelcomeOutcome {
    pub run: WorkflowRun,
    pub intro: String,
    pub delivered: bool,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://finnhub.io/api/v1".to_string(),
            user_agent: "News-Digest/1.0".to_string(),
            timeout_seconds: 8,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

impl FetchConfig {
    /// Longest a single fetch can take: every attempt timing out plus the
    /// backoff waits between them, with the backoff's 50% jitter.
    pub fn retry_budget(&self) -> Duration {
        let attempts = self.max_retries + 1;
        let waits: u64 = (0..self.max_retries)
            .map(|retry| (self.retry_delay_ms << retry.min(4)) * 3 / 2)
            .sum();
        Duration::from_secs(self.timeout_seconds * attempts as u64) + Duration::from_millis(waits)
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub lookback_days: i64,
    pub max_total: usize,
    pub per_tag_limit_hint: Option<usize>,
    pub per_call_timeout: Duration,
    pub company_summary_chars: usize,
    pub general_summary_chars: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            lookback_days: 5,
            max_total: 6,
            per_tag_limit_hint: None,
            per_call_timeout: Duration::from_secs(30),
            company_summary_chars: 200,
            general_summary_chars: 150,
        }
    }
}

impl AggregatorConfig {
    /// Defaults, with the per-call timeout raised to cover the fetcher's
    /// whole retry budget.
    pub fn for_fetcher(fetch: &FetchConfig) -> Self {
        let defaults = Self::default();
        Self {
            per_call_timeout: defaults.per_call_timeout.max(fetch.retry_budget() + Duration::from_secs(1)),
            ..defaults
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DigestConfig {
    pub max_concurrency: usize,
    pub max_articles: usize,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            max_articles: 6,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream API error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Step '{step}' failed after {attempts} attempt(s): {message}")]
    StepFailed { step: String, attempts: u32, message: String },

    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidTransition { run_id: Uuid, from: RunStatus, to: RunStatus },

    #[error("General error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, DigestError>;
