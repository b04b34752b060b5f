use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use common::{Fingerprint, Result, TriggerEvent};

use crate::{db_err, parse_ts, ts};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerLogEntry {
    pub fingerprint: Fingerprint,
    pub triggered_at: DateTime<Utc>,
    pub symbol: String,
    pub timeframe: String,
    pub value: f64,
    pub subscriber_count: i64,
}

#[derive(sqlx::FromRow)]
struct TriggerLogRow {
    fingerprint: String,
    triggered_at: String,
    symbol: String,
    timeframe: String,
    value: f64,
    subscriber_count: i64,
}

/// Append-only audit trail of published triggers, keyed by
/// (fingerprint, triggered_at).
#[derive(Clone)]
pub struct TriggerLog {
    db: SqlitePool,
}

impl TriggerLog {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Duplicate (fingerprint, triggered_at) keys are ignored.
    pub async fn append(&self, event: &TriggerEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO trigger_log
                (fingerprint, triggered_at, symbol, timeframe, value, subscriber_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(event.fingerprint.as_str())
        .bind(ts(event.triggered_at))
        .bind(&event.symbol)
        .bind(event.timeframe.as_str())
        .bind(event.payload.value)
        .bind(event.subscriber_count as i64)
        .execute(&self.db)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent(&self, fp: &Fingerprint, limit: i64) -> Result<Vec<TriggerLogEntry>> {
        let rows: Vec<TriggerLogRow> = sqlx::query_as(
            r#"
            SELECT fingerprint, triggered_at, symbol, timeframe, value, subscriber_count
            FROM trigger_log WHERE fingerprint = ?1
            ORDER BY triggered_at DESC LIMIT ?2
            "#,
        )
        .bind(fp.as_str())
        .bind(limit)
        .fetch_all(&self.db)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|r| {
                Ok(TriggerLogEntry {
                    fingerprint: Fingerprint::new(r.fingerprint),
                    triggered_at: parse_ts(&r.triggered_at)?,
                    symbol: r.symbol,
                    timeframe: r.timeframe,
                    value: r.value,
                    subscriber_count: r.subscriber_count,
                })
            })
            .collect()
    }
}
