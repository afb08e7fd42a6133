use crate::types::{Result, Subscriber, SubscriberSource};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// PostgreSQL directory of users and their watchlists.
pub struct PgSubscriberDirectory {
    db: PgPool,
}

impl PgSubscriberDirectory {
    pub async fn new(database_url: &str) -> Result<Self> {
        let db = PgPool::connect(database_url).await?;
        Ok(Self { db })
    }

    pub fn from_pool(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn setup_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                country TEXT,
                investment_goals TEXT,
                risk_tolerance TEXT,
                preferred_industry TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watchlist (
                id BIGSERIAL PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                company TEXT NOT NULL,
                added_at TIMESTAMPTZ NOT NULL,
                UNIQUE (user_id, symbol)
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_watchlist_user_id ON watchlist(user_id)")
            .execute(&self.db)
            .await?;

        info!("Subscriber schema ready");
        Ok(())
    }

    /// Round-trip latency of a trivial query.
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(start.elapsed())
    }

    /// Insert a user, or refresh the name of an existing one. Returns the user id.
    pub async fn add_subscriber(&self, email: &str, name: &str) -> Result<String> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (id, email, name, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(email.trim())
        .bind(name.trim())
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await?;

        let id: String = row.try_get("id")?;
        info!("Subscriber {} has id {}", email, id);
        Ok(id)
    }

    /// Add a symbol to a user's watchlist. Returns false when the user is
    /// unknown or the symbol is already on the list.
    pub async fn add_to_watchlist(&self, email: &str, symbol: &str, company: &str) -> Result<bool> {
        let symbol = symbol.trim().to_uppercase();

        let result = sqlx::query(
            r#"
            INSERT INTO watchlist (user_id, symbol, company, added_at)
            SELECT id, $2, $3, $4 FROM users WHERE email = $1
            ON CONFLICT (user_id, symbol) DO NOTHING
            "#,
        )
        .bind(email.trim())
        .bind(&symbol)
        .bind(company.trim())
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        let added = result.rows_affected() > 0;
        debug!("Watchlist add {} for {}: {}", symbol, email, added);
        Ok(added)
    }
}

#[async_trait]
impl SubscriberSource for PgSubscriberDirectory {
    async fn list_digest_subscribers(&self) -> anyhow::Result<Vec<Subscriber>> {
        let rows = sqlx::query(
            r#"
            SELECT id, email, name FROM users
            WHERE email <> '' AND name <> ''
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        let mut subscribers = Vec::with_capacity(rows.len());
        for row in rows {
            subscribers.push(Subscriber {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                name: row.try_get("name")?,
            });
        }

        debug!("Found {} digest subscribers", subscribers.len());
        Ok(subscribers)
    }

    async fn interest_tags(&self, email: &str) -> anyhow::Result<Vec<String>> {
        if email.trim().is_empty() {
            return Ok(Vec::new());
        }

        let symbols: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT w.symbol FROM watchlist w
            JOIN users u ON u.id = w.user_id
            WHERE u.email = $1
            ORDER BY w.added_at, w.id
            "#,
        )
        .bind(email.trim())
        .fetch_all(&self.db)
        .await?;

        Ok(symbols)
    }
}
