use crate::types::{AggregatorConfig, Article, ArticleSource, DigestError, RawArticle, Result};
use chrono::{Duration, NaiveDate, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const COMPANY_NEWS_SOURCE: &str = "Company News";
const MARKET_NEWS_SOURCE: &str = "Market News";

/// Builds the ranked, de-duplicated article list for a set of interest tags.
pub struct NewsAggregator {
    source: Arc<dyn ArticleSource>,
    config: AggregatorConfig,
}

/// Per-call limits. `max_total` caps the output, `per_tag_limit_hint`
/// optionally caps each tag's list before interleaving.
#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    pub per_tag_limit_hint: Option<usize>,
    pub max_total: usize,
}

impl NewsAggregator {
    pub fn new(source: Arc<dyn ArticleSource>, config: AggregatorConfig) -> Self {
        Self { source, config }
    }

    pub fn default_limits(&self) -> FetchLimits {
        FetchLimits {
            per_tag_limit_hint: self.config.per_tag_limit_hint,
            max_total: self.config.max_total,
        }
    }

    /// Never fails: on total upstream failure the result is empty.
    pub async fn fetch(&self, tags: &[String]) -> Vec<Article> {
        self.fetch_with_limits(tags, self.default_limits()).await
    }

    pub async fn fetch_with_limits(&self, tags: &[String], limits: FetchLimits) -> Vec<Article> {
        match self.try_fetch_with_limits(tags, limits).await {
            Ok(articles) => articles,
            Err(e) => {
                error!("Failed to fetch news: {}", e);
                Vec::new()
            }
        }
    }

    /// Same as `fetch`, but a failed general feed is reported to the caller.
    pub async fn try_fetch(&self, tags: &[String]) -> Result<Vec<Article>> {
        self.try_fetch_with_limits(tags, self.default_limits()).await
    }

    pub async fn try_fetch_with_limits(&self, tags: &[String], limits: FetchLimits) -> Result<Vec<Article>> {
        let tags = normalize_tags(tags);

        if !tags.is_empty() {
            let personalized = self.fetch_personalized(&tags, limits).await;
            if !personalized.is_empty() {
                info!("Selected {} articles across {} symbols", personalized.len(), tags.len());
                return Ok(personalized);
            }
            debug!("No company news for {:?}, falling back to general news", tags);
        }

        self.fetch_general(limits.max_total).await
    }

    async fn fetch_personalized(&self, tags: &[String], limits: FetchLimits) -> Vec<Article> {
        let (from, to) = date_range(self.config.lookback_days);

        let per_tag = join_all(tags.iter().map(|tag| self.fetch_tag(tag, from, to))).await;

        let per_tag: Vec<Vec<Article>> = per_tag
            .into_iter()
            .map(|mut articles| {
                if let Some(limit) = limits.per_tag_limit_hint {
                    articles.truncate(limit);
                }
                articles
            })
            .collect();

        let mut selected = interleave_round_robin(&per_tag, limits.max_total);
        sort_by_recency(&mut selected);
        selected
    }

    /// One tag's validated articles. Errors and timeouts degrade to an empty list.
    async fn fetch_tag(&self, tag: &str, from: NaiveDate, to: NaiveDate) -> Vec<Article> {
        let raw = match tokio::time::timeout(self.config.per_call_timeout, self.source.fetch_by_tag(tag, from, to)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!("Error fetching company news for {}: {:#}", tag, e);
                return Vec::new();
            }
            Err(_) => {
                warn!("Timed out fetching company news for {} after {:?}", tag, self.config.per_call_timeout);
                return Vec::new();
            }
        };

        raw.iter()
            .filter_map(|article| format_article(article, Some(tag), self.config.company_summary_chars))
            .collect()
    }

    async fn fetch_general(&self, max_total: usize) -> Result<Vec<Article>> {
        let raw = match tokio::time::timeout(self.config.per_call_timeout, self.source.fetch_general()).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(DigestError::Upstream(format!("general news: {:#}", e))),
            Err(_) => {
                return Err(DigestError::Upstream(format!(
                    "general news timed out after {:?}",
                    self.config.per_call_timeout
                )))
            }
        };

        let formatted = raw
            .iter()
            .filter_map(|article| format_article(article, None, self.config.general_summary_chars));
        let articles = dedup_first_seen(formatted, max_total);

        info!("Selected {} general market articles", articles.len());
        Ok(articles)
    }
}

/// Trim, uppercase, drop blanks and repeats, keep first-seen order.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter()
        .map(|tag| tag.trim().to_uppercase())
        .filter(|tag| !tag.is_empty())
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

/// `[today - days, today]` in UTC.
pub fn date_range(days: i64) -> (NaiveDate, NaiveDate) {
    let to = Utc::now().date_naive();
    let from = to - Duration::days(days);
    (from, to)
}

/// A raw article is usable when headline, summary and url are all non-blank.
pub fn validate_article(article: &RawArticle) -> bool {
    let present = |field: &Option<String>| field.as_deref().map(|value| !value.trim().is_empty()).unwrap_or(false);
    present(&article.headline) && present(&article.summary) && present(&article.url)
}

/// Validate and normalize one raw article. `symbol` marks company news.
pub fn format_article(article: &RawArticle, symbol: Option<&str>, summary_chars: usize) -> Option<Article> {
    if !validate_article(article) {
        return None;
    }

    let text = |field: &Option<String>| field.as_deref().unwrap_or_default().trim().to_string();
    let default_source = if symbol.is_some() { COMPANY_NEWS_SOURCE } else { MARKET_NEWS_SOURCE };
    let source = Some(text(&article.source))
        .filter(|source| !source.is_empty())
        .unwrap_or_else(|| default_source.to_string());
    let related_symbol = match symbol {
        Some(symbol) => Some(symbol.to_string()),
        None => article.related.as_deref().map(str::trim).filter(|r| !r.is_empty()).map(str::to_string),
    };

    Some(Article {
        id: article.id.unwrap_or_default(),
        headline: text(&article.headline),
        summary: excerpt(&text(&article.summary), summary_chars),
        source,
        url: text(&article.url),
        datetime: article.datetime.unwrap_or_default(),
        related_symbol,
        image: article.image.as_deref().map(str::trim).filter(|i| !i.is_empty()).map(str::to_string),
    })
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

/// Take item 0 of every list in order, then item 1, and so on, until
/// `max_total` items are collected or every list is exhausted. An item whose
/// dedup key was already taken is skipped.
pub fn interleave_round_robin(lists: &[Vec<Article>], max_total: usize) -> Vec<Article> {
    let mut selected = Vec::new();
    let mut seen = HashSet::new();
    let longest = lists.iter().map(Vec::len).max().unwrap_or(0);

    'rounds: for round in 0..longest {
        for list in lists {
            if selected.len() >= max_total {
                break 'rounds;
            }
            if let Some(article) = list.get(round) {
                if seen.insert(article.dedup_key()) {
                    selected.push(article.clone());
                }
            }
        }
    }

    selected
}

/// Newest first. Stable, so ties keep their interleave order.
pub fn sort_by_recency(articles: &mut [Article]) {
    articles.sort_by(|a, b| b.datetime.cmp(&a.datetime));
}

/// Drop repeated dedup keys keeping the first occurrence, stop at `max_total`.
pub fn dedup_first_seen(articles: impl IntoIterator<Item = Article>, max_total: usize) -> Vec<Article> {
    let mut seen = HashSet::new();
    let mut deduped = Vec::new();
    for article in articles {
        if deduped.len() >= max_total {
            break;
        }
        if seen.insert(article.dedup_key()) {
            deduped.push(article);
        }
    }
    deduped
}
