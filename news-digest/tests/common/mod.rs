#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use news_digest::{
    AggregatorConfig, ArticleSource, DigestConfig, DigestOrchestrator, Mailer, NewsAggregator, OutgoingEmail,
    RawArticle, RetryPolicy, StepExecutor, StepStore, Subscriber, SubscriberSource, Summarizer,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn raw_article(id: i64, headline: &str, datetime: i64) -> RawArticle {
    RawArticle {
        id: Some(id),
        headline: Some(headline.to_string()),
        summary: Some(format!("Summary of {}", headline)),
        url: Some(format!("https://news.example.com/{}", id)),
        datetime: Some(datetime),
        source: Some("Reuters".to_string()),
        related: None,
        image: None,
        category: Some("company".to_string()),
    }
}

/// Missing its url, so validation drops it.
pub fn malformed_article(id: i64) -> RawArticle {
    RawArticle {
        id: Some(id),
        headline: Some(format!("Broken {}", id)),
        summary: Some("No link".to_string()),
        ..RawArticle::default()
    }
}

pub fn subscriber(id: &str) -> Subscriber {
    Subscriber {
        id: id.to_string(),
        email: format!("{}@example.com", id),
        name: id.to_uppercase(),
    }
}

/// Retries without real waiting.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_interval: Duration::from_millis(1),
        multiplier: 1.0,
        max_interval: Duration::from_millis(1),
    }
}

#[derive(Default)]
pub struct FakeArticleSource {
    by_tag: HashMap<String, Vec<RawArticle>>,
    failing_tags: HashSet<String>,
    slow_tags: HashMap<String, Duration>,
    general: Mutex<Option<Vec<RawArticle>>>,
    pub tag_calls: Mutex<Vec<String>>,
    pub general_calls: AtomicUsize,
}

impl FakeArticleSource {
    pub fn new() -> Self {
        Self {
            general: Mutex::new(Some(Vec::new())),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: &str, articles: Vec<RawArticle>) -> Self {
        self.by_tag.insert(tag.to_string(), articles);
        self
    }

    pub fn with_failing_tag(mut self, tag: &str) -> Self {
        self.failing_tags.insert(tag.to_string());
        self
    }

    pub fn with_slow_tag(mut self, tag: &str, delay: Duration) -> Self {
        self.slow_tags.insert(tag.to_string(), delay);
        self
    }

    pub fn with_general(self, articles: Vec<RawArticle>) -> Self {
        *self.general.lock().unwrap() = Some(articles);
        self
    }

    /// The general feed answers with an error.
    pub fn with_failing_general(self) -> Self {
        *self.general.lock().unwrap() = None;
        self
    }

    pub fn general_call_count(&self) -> usize {
        self.general_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArticleSource for FakeArticleSource {
    async fn fetch_by_tag(&self, tag: &str, _from: NaiveDate, _to: NaiveDate) -> anyhow::Result<Vec<RawArticle>> {
        self.tag_calls.lock().unwrap().push(tag.to_string());
        if let Some(delay) = self.slow_tags.get(tag) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing_tags.contains(tag) {
            anyhow::bail!("company news for {} unavailable", tag);
        }
        Ok(self.by_tag.get(tag).cloned().unwrap_or_default())
    }

    async fn fetch_general(&self) -> anyhow::Result<Vec<RawArticle>> {
        self.general_calls.fetch_add(1, Ordering::SeqCst);
        let general = self.general.lock().unwrap().clone();
        general.ok_or_else(|| anyhow::anyhow!("general news unavailable"))
    }
}

#[derive(Default)]
pub struct FakeSubscribers {
    subscribers: Vec<Subscriber>,
    tags: HashMap<String, Vec<String>>,
    failing_watchlists: HashSet<String>,
    list_fails: bool,
    pub list_calls: AtomicUsize,
}

impl FakeSubscribers {
    pub fn new(subscribers: Vec<Subscriber>) -> Self {
        Self {
            subscribers,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            list_fails: true,
            ..Self::default()
        }
    }

    pub fn with_tags(mut self, email: &str, tags: &[&str]) -> Self {
        self.tags.insert(email.to_string(), tags.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_failing_watchlist(mut self, email: &str) -> Self {
        self.failing_watchlists.insert(email.to_string());
        self
    }
}

#[async_trait]
impl SubscriberSource for FakeSubscribers {
    async fn list_digest_subscribers(&self) -> anyhow::Result<Vec<Subscriber>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.list_fails {
            anyhow::bail!("user store unreachable");
        }
        Ok(self.subscribers.clone())
    }

    async fn interest_tags(&self, email: &str) -> anyhow::Result<Vec<String>> {
        if self.failing_watchlists.contains(email) {
            anyhow::bail!("watchlist lookup failed for {}", email);
        }
        Ok(self.tags.get(email).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    NoText,
    Fail,
}

/// Answers by the first rule whose needle appears in the prompt.
pub struct FakeSummarizer {
    rules: Vec<(String, Reply)>,
    default: Reply,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeSummarizer {
    pub fn replying(text: &str) -> Self {
        Self {
            rules: Vec::new(),
            default: Reply::Text(text.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default(default: Reply) -> Self {
        Self {
            rules: Vec::new(),
            default,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_rule(mut self, needle: &str, reply: Reply) -> Self {
        self.rules.push((needle.to_string(), reply));
        self
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    async fn infer(&self, prompt: &str) -> anyhow::Result<Option<String>> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.default.clone());

        match reply {
            Reply::Text(text) => Ok(Some(text)),
            Reply::NoText => Ok(None),
            Reply::Fail => anyhow::bail!("model overloaded"),
        }
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    failing_recipients: HashSet<String>,
    pub sent: Mutex<Vec<OutgoingEmail>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, recipient: &str) -> Self {
        self.failing_recipients.insert(recipient.to_string());
        self
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn recipients(&self) -> Vec<String> {
        let mut recipients: Vec<String> = self.sent().into_iter().map(|email| email.to).collect();
        recipients.sort();
        recipients
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutgoingEmail) -> anyhow::Result<()> {
        if self.failing_recipients.contains(&email.to) {
            anyhow::bail!("mailbox {} rejected the message", email.to);
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

pub fn executor(store: Arc<dyn StepStore>, summarizer: Arc<FakeSummarizer>) -> Arc<StepExecutor> {
    Arc::new(StepExecutor::new(store, summarizer).with_retry_policy(fast_retry()))
}

pub fn aggregator(source: Arc<FakeArticleSource>) -> Arc<NewsAggregator> {
    Arc::new(NewsAggregator::new(
        source,
        AggregatorConfig {
            per_call_timeout: Duration::from_millis(200),
            ..AggregatorConfig::default()
        },
    ))
}

pub fn orchestrator(
    executor: Arc<StepExecutor>,
    subscribers: Arc<FakeSubscribers>,
    source: Arc<FakeArticleSource>,
    mailer: Arc<RecordingMailer>,
) -> DigestOrchestrator {
    DigestOrchestrator::new(executor, subscribers, aggregator(source), mailer, DigestConfig::default())
}
