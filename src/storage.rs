//! SQLite persistence.
//!
//! One database file with four tables: `requests` (append-only log),
//! `tenants`, `routing_feedback`, and `model_health`. WAL journaling is
//! enabled so dashboard reads proceed while the write queue flushes.
//! Write failures are logged by callers and never surface to clients.

use crate::tenants::Tenant;
use crate::GatewayError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// One append-only log row per completed request.
#[derive(Debug, Clone)]
pub struct RequestLogRow {
    pub request_id: String,
    pub tenant_id: Option<String>,
    /// First 100 chars of the user prompt.
    pub prompt_preview: String,
    pub tier: String,
    pub complexity_score: f64,
    pub confidence: f64,
    pub intent: String,
    pub model: String,
    pub provider: String,
    pub strategy: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub energy: f64,
    pub latency_ms: f64,
    pub provider_status: Option<i64>,
    pub cache_hit: bool,
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
}

/// One reward observation, persisted for bandit recomputes.
#[derive(Debug, Clone)]
pub struct FeedbackRow {
    pub request_id: String,
    pub model: String,
    pub tenant_id: Option<String>,
    pub quality: Option<f64>,
    pub latency_ms: Option<f64>,
    pub cost: Option<f64>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// Benchmarker flush row.
#[derive(Debug, Clone)]
pub struct ModelHealthRow {
    pub model: String,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_rate: f64,
    pub timeout_rate: f64,
    pub samples: i64,
    pub is_healthy: bool,
    pub created_at: DateTime<Utc>,
}

/// Aggregates for `/api/stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSummary {
    pub total_requests: i64,
    pub cache_hits: i64,
    pub total_cost: f64,
    pub total_energy: f64,
    pub avg_latency_ms: f64,
}

/// Pooled SQLite store.
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if missing) the database at `path` with WAL
    /// journaling, and run migrations.
    pub async fn connect(path: &str) -> Result<Self, GatewayError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| GatewayError::Storage(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    /// In-memory database for tests. Single connection: each SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self, GatewayError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                request_id TEXT PRIMARY KEY,
                tenant_id TEXT,
                prompt_preview TEXT NOT NULL,
                tier TEXT NOT NULL,
                complexity_score REAL NOT NULL,
                confidence REAL NOT NULL,
                intent TEXT NOT NULL,
                model TEXT NOT NULL,
                provider TEXT NOT NULL,
                strategy TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                energy REAL NOT NULL DEFAULT 0,
                latency_ms REAL NOT NULL DEFAULT 0,
                provider_status INTEGER,
                cache_hit INTEGER NOT NULL DEFAULT 0,
                reasoning TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                api_key_hash TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                strategy TEXT NOT NULL,
                allowed_models TEXT,
                budget_limit_monthly REAL,
                rate_limit_rpm INTEGER NOT NULL,
                rate_limit_tpm INTEGER NOT NULL,
                usage_this_month REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS routing_feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                model TEXT NOT NULL,
                tenant_id TEXT,
                quality REAL,
                latency_ms REAL,
                cost REAL,
                success INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_health (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model TEXT NOT NULL,
                mean_latency_ms REAL NOT NULL,
                p95_latency_ms REAL NOT NULL,
                p99_latency_ms REAL NOT NULL,
                error_rate REAL NOT NULL,
                timeout_rate REAL NOT NULL,
                samples INTEGER NOT NULL,
                is_healthy INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feedback_model ON routing_feedback(model, id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_requests_tenant ON requests(tenant_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ── Requests ───────────────────────────────────────────────────────

    /// Insert a batch of log rows in one transaction.
    pub async fn insert_request_rows(&self, rows: &[RequestLogRow]) -> Result<(), GatewayError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO requests (
                    request_id, tenant_id, prompt_preview, tier, complexity_score,
                    confidence, intent, model, provider, strategy, input_tokens,
                    output_tokens, cost, energy, latency_ms, provider_status,
                    cache_hit, reasoning, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(&row.request_id)
            .bind(&row.tenant_id)
            .bind(&row.prompt_preview)
            .bind(&row.tier)
            .bind(row.complexity_score)
            .bind(row.confidence)
            .bind(&row.intent)
            .bind(&row.model)
            .bind(&row.provider)
            .bind(&row.strategy)
            .bind(row.input_tokens)
            .bind(row.output_tokens)
            .bind(row.cost)
            .bind(row.energy)
            .bind(row.latency_ms)
            .bind(row.provider_status)
            .bind(row.cache_hit as i64)
            .bind(&row.reasoning)
            .bind(row.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn find_request(&self, request_id: &str) -> Result<Option<RequestLogRow>, GatewayError> {
        let row = sqlx::query("SELECT * FROM requests WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_request_row(&r)).transpose()
    }

    pub async fn stats(&self) -> Result<StatsSummary, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_requests,
                COALESCE(SUM(cache_hit), 0) AS cache_hits,
                COALESCE(SUM(cost), 0.0) AS total_cost,
                COALESCE(SUM(energy), 0.0) AS total_energy,
                COALESCE(AVG(latency_ms), 0.0) AS avg_latency_ms
            FROM requests
        "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StatsSummary {
            total_requests: row.try_get("total_requests").unwrap_or(0),
            cache_hits: row.try_get("cache_hits").unwrap_or(0),
            total_cost: row.try_get("total_cost").unwrap_or(0.0),
            total_energy: row.try_get("total_energy").unwrap_or(0.0),
            avg_latency_ms: row.try_get("avg_latency_ms").unwrap_or(0.0),
        })
    }

    // ── Tenants ────────────────────────────────────────────────────────

    pub async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), GatewayError> {
        let allowed = tenant
            .allowed_models
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default());
        sqlx::query(
            r#"
            INSERT INTO tenants (
                id, api_key_hash, name, strategy, allowed_models,
                budget_limit_monthly, rate_limit_rpm, rate_limit_tpm,
                usage_this_month, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&tenant.id)
        .bind(&tenant.api_key_hash)
        .bind(&tenant.name)
        .bind(tenant.strategy.as_str())
        .bind(allowed)
        .bind(tenant.budget_limit_monthly)
        .bind(tenant.rate_limit_rpm as i64)
        .bind(tenant.rate_limit_tpm as i64)
        .bind(tenant.usage_this_month)
        .bind(tenant.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_tenant_by_hash(&self, hash: &str) -> Result<Option<Tenant>, GatewayError> {
        let row = sqlx::query("SELECT * FROM tenants WHERE api_key_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_tenant_row(&r)).transpose()
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>, GatewayError> {
        let rows = sqlx::query("SELECT * FROM tenants ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_tenant_row).collect()
    }

    /// Accumulate monthly usage for a tenant.
    pub async fn add_tenant_usage(&self, tenant_id: &str, cost: f64) -> Result<(), GatewayError> {
        sqlx::query("UPDATE tenants SET usage_this_month = usage_this_month + ? WHERE id = ?")
            .bind(cost)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Feedback ───────────────────────────────────────────────────────

    pub async fn insert_feedback(&self, row: &FeedbackRow) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO routing_feedback (
                request_id, model, tenant_id, quality, latency_ms, cost,
                success, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&row.request_id)
        .bind(&row.model)
        .bind(&row.tenant_id)
        .bind(row.quality)
        .bind(row.latency_ms)
        .bind(row.cost)
        .bind(row.success as i64)
        .bind(row.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent feedback rows for a model, newest first.
    pub async fn recent_feedback_for_model(
        &self,
        model: &str,
        limit: u32,
    ) -> Result<Vec<FeedbackRow>, GatewayError> {
        let rows = sqlx::query(
            "SELECT * FROM routing_feedback WHERE model = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(model)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_feedback_row).collect()
    }

    // ── Model health ───────────────────────────────────────────────────

    pub async fn insert_model_health(&self, rows: &[ModelHealthRow]) -> Result<(), GatewayError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO model_health (
                    model, mean_latency_ms, p95_latency_ms, p99_latency_ms,
                    error_rate, timeout_rate, samples, is_healthy, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(&row.model)
            .bind(row.mean_latency_ms)
            .bind(row.p95_latency_ms)
            .bind(row.p99_latency_ms)
            .bind(row.error_rate)
            .bind(row.timeout_rate)
            .bind(row.samples)
            .bind(row.is_healthy as i64)
            .bind(row.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn parse_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, GatewayError> {
    let raw: String = row
        .try_get(column)
        .map_err(|e| GatewayError::Storage(e.to_string()))?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GatewayError::Storage(format!("bad timestamp {raw}: {e}")))
}

fn parse_request_row(row: &SqliteRow) -> Result<RequestLogRow, GatewayError> {
    let get_err = |e: sqlx::Error| GatewayError::Storage(e.to_string());
    Ok(RequestLogRow {
        request_id: row.try_get("request_id").map_err(get_err)?,
        tenant_id: row.try_get("tenant_id").map_err(get_err)?,
        prompt_preview: row.try_get("prompt_preview").map_err(get_err)?,
        tier: row.try_get("tier").map_err(get_err)?,
        complexity_score: row.try_get("complexity_score").map_err(get_err)?,
        confidence: row.try_get("confidence").map_err(get_err)?,
        intent: row.try_get("intent").map_err(get_err)?,
        model: row.try_get("model").map_err(get_err)?,
        provider: row.try_get("provider").map_err(get_err)?,
        strategy: row.try_get("strategy").map_err(get_err)?,
        input_tokens: row.try_get("input_tokens").map_err(get_err)?,
        output_tokens: row.try_get("output_tokens").map_err(get_err)?,
        cost: row.try_get("cost").map_err(get_err)?,
        energy: row.try_get("energy").map_err(get_err)?,
        latency_ms: row.try_get("latency_ms").map_err(get_err)?,
        provider_status: row.try_get("provider_status").map_err(get_err)?,
        cache_hit: row.try_get::<i64, _>("cache_hit").map_err(get_err)? != 0,
        reasoning: row.try_get("reasoning").map_err(get_err)?,
        created_at: parse_timestamp(row, "created_at")?,
    })
}

fn parse_tenant_row(row: &SqliteRow) -> Result<Tenant, GatewayError> {
    let get_err = |e: sqlx::Error| GatewayError::Storage(e.to_string());
    let allowed_raw: Option<String> = row.try_get("allowed_models").map_err(get_err)?;
    let allowed_models = allowed_raw
        .map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| GatewayError::Storage(format!("bad allowlist: {e}")))
        })
        .transpose()?;
    let strategy_raw: String = row.try_get("strategy").map_err(get_err)?;

    Ok(Tenant {
        id: row.try_get("id").map_err(get_err)?,
        api_key_hash: row.try_get("api_key_hash").map_err(get_err)?,
        name: row.try_get("name").map_err(get_err)?,
        strategy: strategy_raw
            .parse()
            .map_err(|e: String| GatewayError::Storage(e))?,
        allowed_models,
        budget_limit_monthly: row.try_get("budget_limit_monthly").map_err(get_err)?,
        rate_limit_rpm: row.try_get::<i64, _>("rate_limit_rpm").map_err(get_err)? as u32,
        rate_limit_tpm: row.try_get::<i64, _>("rate_limit_tpm").map_err(get_err)? as u32,
        usage_this_month: row.try_get("usage_this_month").map_err(get_err)?,
        created_at: parse_timestamp(row, "created_at")?,
    })
}

fn parse_feedback_row(row: &SqliteRow) -> Result<FeedbackRow, GatewayError> {
    let get_err = |e: sqlx::Error| GatewayError::Storage(e.to_string());
    Ok(FeedbackRow {
        request_id: row.try_get("request_id").map_err(get_err)?,
        model: row.try_get("model").map_err(get_err)?,
        tenant_id: row.try_get("tenant_id").map_err(get_err)?,
        quality: row.try_get("quality").map_err(get_err)?,
        latency_ms: row.try_get("latency_ms").map_err(get_err)?,
        cost: row.try_get("cost").map_err(get_err)?,
        success: row.try_get::<i64, _>("success").map_err(get_err)? != 0,
        created_at: parse_timestamp(row, "created_at")?,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;

    fn sample_row(id: &str, cache_hit: bool) -> RequestLogRow {
        RequestLogRow {
            request_id: id.to_string(),
            tenant_id: Some("t1".to_string()),
            prompt_preview: "What is Rust?".to_string(),
            tier: "simple".to_string(),
            complexity_score: 14.0,
            confidence: 0.65,
            intent: "qa".to_string(),
            model: "gpt-4o-mini".to_string(),
            provider: "openai".to_string(),
            strategy: "cost-first".to_string(),
            input_tokens: 12,
            output_tokens: 40,
            cost: 0.00003,
            energy: 0.002,
            latency_ms: 640.0,
            provider_status: Some(200),
            cache_hit,
            reasoning: "test".to_string(),
            created_at: Utc::now(),
        }
    }

    fn sample_tenant(name: &str) -> Tenant {
        Tenant {
            id: format!("tn-{name}"),
            api_key_hash: format!("hash-{name}"),
            name: name.to_string(),
            strategy: Strategy::Balanced,
            allowed_models: Some(vec!["gpt-4o".to_string()]),
            budget_limit_monthly: Some(25.0),
            rate_limit_rpm: 60,
            rate_limit_tpm: 100_000,
            usage_this_month: 0.0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_request() {
        let storage = Storage::in_memory().await.unwrap();
        storage
            .insert_request_rows(&[sample_row("req-1", false)])
            .await
            .unwrap();

        let found = storage.find_request("req-1").await.unwrap().unwrap();
        assert_eq!(found.model, "gpt-4o-mini");
        assert_eq!(found.intent, "qa");
        assert!(!found.cache_hit);
        assert_eq!(found.provider_status, Some(200));
    }

    #[tokio::test]
    async fn test_batch_insert_is_atomic() {
        let storage = Storage::in_memory().await.unwrap();
        let rows: Vec<RequestLogRow> = (0..10).map(|i| sample_row(&format!("r-{i}"), false)).collect();
        storage.insert_request_rows(&rows).await.unwrap();
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.total_requests, 10);
    }

    #[tokio::test]
    async fn test_stats_aggregates() {
        let storage = Storage::in_memory().await.unwrap();
        storage
            .insert_request_rows(&[sample_row("a", true), sample_row("b", false)])
            .await
            .unwrap();
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.cache_hits, 1);
        assert!(stats.total_cost > 0.0);
        assert!((stats.avg_latency_ms - 640.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_tenant_round_trip() {
        let storage = Storage::in_memory().await.unwrap();
        let tenant = sample_tenant("acme");
        storage.insert_tenant(&tenant).await.unwrap();

        let found = storage
            .find_tenant_by_hash("hash-acme")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, tenant.id);
        assert_eq!(found.strategy, Strategy::Balanced);
        assert_eq!(found.allowed_models, Some(vec!["gpt-4o".to_string()]));
        assert_eq!(found.budget_limit_monthly, Some(25.0));
    }

    #[tokio::test]
    async fn test_tenant_unknown_hash_is_none() {
        let storage = Storage::in_memory().await.unwrap();
        assert!(storage.find_tenant_by_hash("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_tenant_usage_accumulates() {
        let storage = Storage::in_memory().await.unwrap();
        let tenant = sample_tenant("acme");
        storage.insert_tenant(&tenant).await.unwrap();
        storage.add_tenant_usage(&tenant.id, 0.5).await.unwrap();
        storage.add_tenant_usage(&tenant.id, 0.25).await.unwrap();
        let found = storage
            .find_tenant_by_hash("hash-acme")
            .await
            .unwrap()
            .unwrap();
        assert!((found.usage_this_month - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_feedback_round_trip_newest_first() {
        let storage = Storage::in_memory().await.unwrap();
        for i in 0..5 {
            storage
                .insert_feedback(&FeedbackRow {
                    request_id: format!("r-{i}"),
                    model: "gpt-4o".to_string(),
                    tenant_id: None,
                    quality: Some(i as f64),
                    latency_ms: Some(100.0),
                    cost: Some(0.001),
                    success: true,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let rows = storage.recent_feedback_for_model("gpt-4o", 3).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].request_id, "r-4");
        assert_eq!(rows[0].quality, Some(4.0));
    }

    #[tokio::test]
    async fn test_feedback_limit_respected() {
        let storage = Storage::in_memory().await.unwrap();
        let rows = storage
            .recent_feedback_for_model("missing", 200)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_model_health_insert() {
        let storage = Storage::in_memory().await.unwrap();
        storage
            .insert_model_health(&[ModelHealthRow {
                model: "gpt-4o".to_string(),
                mean_latency_ms: 900.0,
                p95_latency_ms: 1800.0,
                p99_latency_ms: 2500.0,
                error_rate: 0.1,
                timeout_rate: 0.0,
                samples: 42,
                is_healthy: true,
                created_at: Utc::now(),
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let storage = Storage::in_memory().await.unwrap();
        storage.insert_request_rows(&[]).await.unwrap();
        storage.insert_model_health(&[]).await.unwrap();
    }
}
