use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// Days usage events are kept before cleanup removes them.
pub const USAGE_EVENT_RETENTION_DAYS: i64 = 90;

/// UsageEvent - one tracked action inside a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageEvent {
    pub id: i64,
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    pub event_type: String,
    pub event_data: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// SQL Queries - ALL queries must be in models/
// =============================================================================

impl UsageEvent {
    /// Record an event at `created_at`
    pub async fn record(
        tenant_id: i64,
        user_id: Option<i64>,
        event_type: &str,
        event_data: Option<&str>,
        created_at: DateTime<Utc>,
        pool: &SqlitePool,
    ) -> Result<Self> {
        let event = sqlx::query_as::<_, UsageEvent>(
            r#"
            INSERT INTO usage_events (tenant_id, user_id, event_type, event_data, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id, tenant_id, user_id, event_type, event_data, created_at
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(event_type)
        .bind(event_data)
        .bind(created_at)
        .fetch_one(pool)
        .await?;
        Ok(event)
    }

    /// Count events for a tenant
    pub async fn count_for_tenant(tenant_id: i64, pool: &SqlitePool) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM usage_events WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_one(pool)
                .await?;
        Ok(count)
    }

    /// Delete events created before `cutoff`. Returns rows deleted.
    pub async fn delete_older_than(cutoff: DateTime<Utc>, pool: &SqlitePool) -> Result<u64> {
        let result = sqlx::query("DELETE FROM usage_events WHERE created_at < ?")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Oldest timestamp an event may have and survive retention at `now`
    pub fn retention_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(USAGE_EVENT_RETENTION_DAYS)
    }
}
