use crate::types::{ArticleSource, DigestError, FetchConfig, RawArticle, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Finnhub news API client.
pub struct FinnhubClient {
    client: Client,
    config: FetchConfig,
    api_key: String,
}

impl FinnhubClient {
    pub fn new(api_key: String, config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()?;

        if api_key.is_empty() {
            warn!("FINNHUB_API_KEY is empty; news requests will most likely be rejected");
        }

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    pub fn company_news_url(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> Result<Url> {
        let url = Url::parse_with_params(
            &format!("{}/company-news", self.config.base_url.trim_end_matches('/')),
            &[
                ("symbol", symbol.to_string()),
                ("from", from.format("%Y-%m-%d").to_string()),
                ("to", to.format("%Y-%m-%d").to_string()),
            ],
        )?;
        Ok(url)
    }

    pub fn general_news_url(&self) -> Result<Url> {
        let url = Url::parse_with_params(
            &format!("{}/news", self.config.base_url.trim_end_matches('/')),
            &[("category", "general")],
        )?;
        Ok(url)
    }

    async fn fetch_articles(&self, url: Url) -> Result<Vec<RawArticle>> {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_millis(self.config.retry_delay_ms),
            initial_interval: Duration::from_millis(self.config.retry_delay_ms),
            max_interval: Duration::from_millis(self.config.retry_delay_ms * 16),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_once(&url).await {
                Ok(articles) => return Ok(articles),
                Err(FetchFailure::Retryable(e)) if attempt <= self.config.max_retries => {
                    if let Some(delay) = backoff.next_backoff() {
                        warn!("Attempt {} failed for {}, retrying in {:?}: {}", attempt, url.path(), delay, e);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(e);
                }
                Err(FetchFailure::Retryable(e)) | Err(FetchFailure::Fatal(e)) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, url: &Url) -> std::result::Result<Vec<RawArticle>, FetchFailure> {
        debug!("Fetching {}", url.path());

        let response = self.client
            .get(url.clone())
            .header("X-Finnhub-Token", &self.api_key)
            .send()
            .await
            .map_err(|e| FetchFailure::Retryable(DigestError::Http(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = DigestError::Upstream(format!("Finnhub error {}: {}", status.as_u16(), body));
            return Err(if is_retryable(status) {
                FetchFailure::Retryable(error)
            } else {
                FetchFailure::Fatal(error)
            });
        }

        let body = response.text().await
            .map_err(|e| FetchFailure::Retryable(DigestError::Http(e)))?;
        parse_articles(&body).map_err(FetchFailure::Fatal)
    }
}

/// Rate limiting and server errors are worth another attempt.
fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

enum FetchFailure {
    Retryable(DigestError),
    Fatal(DigestError),
}

/// Parse a JSON array of articles. Entries that do not fit the article shape
/// are dropped; a body that is not an array is an error.
pub fn parse_articles(body: &str) -> Result<Vec<RawArticle>> {
    let items: Vec<serde_json::Value> = serde_json::from_str(body)?;
    let total = items.len();
    let articles: Vec<RawArticle> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();

    if articles.len() < total {
        debug!("Dropped {} entries that were not articles", total - articles.len());
    }
    Ok(articles)
}

#[async_trait]
impl ArticleSource for FinnhubClient {
    async fn fetch_by_tag(&self, tag: &str, from: NaiveDate, to: NaiveDate) -> anyhow::Result<Vec<RawArticle>> {
        let url = self.company_news_url(tag, from, to)?;
        Ok(self.fetch_articles(url).await?)
    }

    async fn fetch_general(&self) -> anyhow::Result<Vec<RawArticle>> {
        let url = self.general_news_url()?;
        Ok(self.fetch_articles(url).await?)
    }
}
