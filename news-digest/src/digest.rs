//! The daily market digest workflow.
//!
//! `get-all-users` -> per subscriber (`fetch-news-{id}`, `summarize-news-{id}`)
//! -> `send-news-emails`. Every step goes through the [`StepExecutor`], so a run
//! re-entered under the same id picks up where it stopped.

use crate::aggregator::NewsAggregator;
use crate::prompts::news_summary_prompt;
use crate::step::StepExecutor;
use crate::types::{
    Article, DigestConfig, DigestOutcome, DigestRunReport, Mailer, Result, Subscriber, SubscriberDigestInput,
    SubscriberSource,
};
use chrono::Utc;
use email_delivery::news_summary_email;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DIGEST_WORKFLOW: &str = "daily-news-summary";

const LIST_SUBSCRIBERS_STEP: &str = "get-all-users";
const SEND_EMAILS_STEP: &str = "send-news-emails";

pub fn fetch_step_name(subscriber_id: &str) -> String {
    format!("fetch-news-{}", subscriber_id)
}

pub fn summarize_step_name(subscriber_id: &str) -> String {
    format!("summarize-news-{}", subscriber_id)
}

/// Date line used in the subject and header, e.g. `Thursday, October 16, 2026`.
pub fn today_label() -> String {
    Utc::now().format("%A, %B %-d, %Y").to_string()
}

pub struct DigestOrchestrator {
    executor: Arc<StepExecutor>,
    subscribers: Arc<dyn SubscriberSource>,
    aggregator: Arc<NewsAggregator>,
    mailer: Arc<dyn Mailer>,
    config: DigestConfig,
}

impl DigestOrchestrator {
    pub fn new(
        executor: Arc<StepExecutor>,
        subscribers: Arc<dyn SubscriberSource>,
        aggregator: Arc<NewsAggregator>,
        mailer: Arc<dyn Mailer>,
        config: DigestConfig,
    ) -> Self {
        Self {
            executor,
            subscribers,
            aggregator,
            mailer,
            config,
        }
    }

    /// Execute (or resume) the run with this id.
    ///
    /// A run-level failure is reported through the returned run's status; the
    /// error itself is only returned when the run record cannot be stored.
    pub async fn run(&self, run_id: Uuid) -> Result<DigestRunReport> {
        let mut run = self.executor.begin_run(run_id, DIGEST_WORKFLOW).await?;
        info!(%run_id, "Starting daily news digest");

        match self.execute(run_id).await {
            Ok(outcomes) => {
                self.executor.finish_run(&mut run, None).await?;
                let report = DigestRunReport { run, outcomes };
                info!(
                    %run_id,
                    "Digest run completed: {} subscriber(s), {} email(s) delivered",
                    report.outcomes.len(),
                    report.delivered_count()
                );
                Ok(report)
            }
            Err(e) => {
                error!(%run_id, "Digest run failed: {}", e);
                self.executor.finish_run(&mut run, Some(e.to_string())).await?;
                Ok(DigestRunReport {
                    run,
                    outcomes: Vec::new(),
                })
            }
        }
    }

    async fn execute(&self, run_id: Uuid) -> Result<Vec<DigestOutcome>> {
        let source = &self.subscribers;
        let subscribers: Vec<Subscriber> = self
            .executor
            .run(run_id, LIST_SUBSCRIBERS_STEP, move || async move { source.list_digest_subscribers().await })
            .await?;

        if subscribers.is_empty() {
            info!(%run_id, "No subscribers found for the news digest");
            return Ok(Vec::new());
        }

        let mut outcomes: Vec<DigestOutcome> = stream::iter(subscribers.iter())
            .map(|subscriber| {
                let span = info_span!("subscriber", id = %subscriber.id);
                self.prepare_isolated(run_id, subscriber).instrument(span)
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let deliveries = self.send_digests(run_id, &outcomes).await?;
        for outcome in &mut outcomes {
            outcome.delivered = deliveries.get(&outcome.subscriber_id).copied().unwrap_or(false);
        }

        Ok(outcomes)
    }

    /// One subscriber's articles and summary. Never fails: any error becomes an
    /// empty, undeliverable outcome.
    async fn prepare_isolated(&self, run_id: Uuid, subscriber: &Subscriber) -> DigestOutcome {
        match self.prepare(run_id, subscriber).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%run_id, "Error processing news for {}: {}", subscriber.email, e);
                DigestOutcome::failed(subscriber)
            }
        }
    }

    async fn prepare(&self, run_id: Uuid, subscriber: &Subscriber) -> Result<DigestOutcome> {
        let articles = self.collect_articles(run_id, subscriber).await?;

        let summary_text = if articles.is_empty() {
            debug!("No articles for {}, skipping summary", subscriber.email);
            None
        } else {
            let prompt = news_summary_prompt(&articles)?;
            self.executor
                .infer_ai(run_id, &summarize_step_name(&subscriber.id), &prompt)
                .await
        };

        Ok(DigestOutcome {
            subscriber_id: subscriber.id.clone(),
            email: subscriber.email.clone(),
            name: subscriber.name.clone(),
            articles,
            summary_text,
            delivered: false,
        })
    }

    async fn collect_articles(&self, run_id: Uuid, subscriber: &Subscriber) -> Result<Vec<Article>> {
        let this = self;
        self.executor
            .run(run_id, &fetch_step_name(&subscriber.id), move || async move {
                let tags = this.resolve_tags(subscriber).await;
                let input = SubscriberDigestInput::new(subscriber, &tags);

                let mut articles = this.aggregator.try_fetch(&input.interest_tags).await?;
                if articles.is_empty() {
                    debug!("Aggregation empty for {}, using general market news", subscriber.email);
                    articles = this.aggregator.try_fetch(&[]).await?;
                }
                articles.truncate(this.config.max_articles);
                Ok::<_, anyhow::Error>(articles)
            })
            .await
    }

    async fn resolve_tags(&self, subscriber: &Subscriber) -> Vec<String> {
        match self.subscribers.interest_tags(&subscriber.email).await {
            Ok(tags) => tags,
            Err(e) => {
                warn!("Could not load watchlist for {}: {:#}", subscriber.email, e);
                Vec::new()
            }
        }
    }

    /// Send every summarized digest at once. Returns delivered flags by subscriber id.
    async fn send_digests(&self, run_id: Uuid, outcomes: &[DigestOutcome]) -> Result<HashMap<String, bool>> {
        let date = today_label();
        let date = date.as_str();
        let mailer = &self.mailer;

        let deliveries: Vec<(String, bool)> = self
            .executor
            .run(run_id, SEND_EMAILS_STEP, move || async move {
                let sends = outcomes.iter().filter_map(|outcome| {
                    let summary = outcome.summary_text.as_deref()?;
                    let email = news_summary_email(&outcome.email, date, summary);
                    Some(async move {
                        let delivered = match mailer.send(&email).await {
                            Ok(()) => {
                                info!("Sent news summary to {}", outcome.email);
                                true
                            }
                            Err(e) => {
                                warn!("Failed to send news summary to {}: {:#}", outcome.email, e);
                                false
                            }
                        };
                        (outcome.subscriber_id.clone(), delivered)
                    })
                });
                Ok::<_, anyhow::Error>(join_all(sends).await)
            })
            .await?;

        Ok(deliveries.into_iter().collect())
    }
}
