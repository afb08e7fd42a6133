use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

/// A user who opted into the daily digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub email: String,
    pub name: String,
}

/// An article exactly as the news API returned it. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawArticle {
    #[serde(deserialize_with = "loose_i64")]
    pub id: Option<i64>,
    #[serde(deserialize_with = "loose_string")]
    pub headline: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub summary: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub url: Option<String>,
    #[serde(deserialize_with = "loose_i64")]
    pub datetime: Option<i64>,
    #[serde(deserialize_with = "loose_string")]
    pub source: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub related: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub image: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub category: Option<String>,
}

/// Any JSON scalar or structure. Fields of the wrong shape decode to `None`
/// instead of rejecting the whole article.
#[derive(Deserialize)]
#[serde(untagged)]
#[allow(dead_code)]
enum Loose {
    Int(i64),
    Float(f64),
    Text(String),
    Other(IgnoredAny),
}

fn loose_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<i64>, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Int(value)) => Some(value),
        Some(Loose::Float(value)) if value.is_finite() => Some(value.trunc() as i64),
        Some(Loose::Text(text)) => text.trim().parse().ok(),
        _ => None,
    })
}

fn loose_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Text(text)) => Some(text),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Payload of the `app/user.created` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpEvent {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub investment_goals: String,
    #[serde(default)]
    pub risk_tolerance: String,
    #[serde(default)]
    pub preferred_industry: String,
}

// Object style note:
// Implementations are handed to the workflow as `Arc<dyn Trait>` at
// construction time. They own their connection handles; nothing in the
// workflow reaches for a process-wide client.

#[async_trait]
pub trait SubscriberSource: Send + Sync {
    async fn list_digest_subscribers(&self) -> Result<Vec<Subscriber>>;

    /// Watchlist symbols for the user with this email, empty when the user is unknown.
    async fn interest_tags(&self, email: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait ArticleSource: Send + Sync {
    async fn fetch_by_tag(&self, tag: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<RawArticle>>;
    async fn fetch_general(&self) -> Result<Vec<RawArticle>>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `Ok(None)` means the backend answered but the answer carried no text.
    async fn infer(&self, prompt: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<()>;
}
