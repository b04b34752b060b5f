use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info};

use common::{Condition, ConditionDef, Error, Fingerprint, Pair, Result, Timeframe};

use crate::normalize::{fingerprint, normalize, RawCondition};
use crate::{db_err, parse_opt_ts, parse_ts, ts};

/// Outcome of a create-or-fetch registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub fingerprint: Fingerprint,
    /// `false` when an equal condition already existed.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConditionStatus {
    pub condition: Condition,
    pub subscriber_count: i64,
}

/// Public, tenant-free aggregate counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total_conditions: i64,
    pub total_subscriptions: i64,
    pub avg_subscribers: f64,
}

#[derive(sqlx::FromRow)]
struct ConditionRow {
    fingerprint: String,
    definition: String,
    trigger_count: i64,
    last_triggered_at: Option<String>,
    created_at: String,
}

impl TryFrom<ConditionRow> for Condition {
    type Error = Error;

    fn try_from(row: ConditionRow) -> Result<Self> {
        let def: ConditionDef = serde_json::from_str(&row.definition)?;
        Ok(Condition {
            fingerprint: Fingerprint::new(row.fingerprint),
            def,
            trigger_count: row.trigger_count,
            last_triggered_at: parse_opt_ts(row.last_triggered_at)?,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

const SELECT_CONDITION: &str = "SELECT fingerprint, definition, trigger_count, last_triggered_at, created_at FROM conditions";

/// Store of unique conditions keyed by fingerprint.
///
/// Rows are only ever created or have their trigger stats bumped;
/// nothing here updates a definition in place.
#[derive(Clone)]
pub struct ConditionRegistry {
    db: SqlitePool,
}

impl ConditionRegistry {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Validate, normalize and register a client-supplied condition.
    pub async fn register(&self, raw: &RawCondition) -> Result<Registration> {
        let def = normalize(raw)?;
        self.register_def(&def).await
    }

    /// Atomic create-if-absent. Concurrent callers with equal definitions
    /// see exactly one `created = true`.
    pub async fn register_def(&self, def: &ConditionDef) -> Result<Registration> {
        let fp = fingerprint(def);
        let definition = serde_json::to_string(def)?;

        let result = sqlx::query(
            r#"
            INSERT INTO conditions (fingerprint, kind, symbol, timeframe, indicator, definition, trigger_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(fp.as_str())
        .bind(def.kind.as_str())
        .bind(&def.symbol)
        .bind(def.timeframe.as_str())
        .bind(def.indicator.key())
        .bind(definition)
        .bind(ts(Utc::now()))
        .execute(&self.db)
        .await
        .map_err(db_err)?;

        let created = result.rows_affected() == 1;
        if created {
            info!(fingerprint = %fp, pair = %def.pair(), indicator = %def.indicator, "Registered new condition");
        } else {
            debug!(fingerprint = %fp, "Condition already registered");
        }
        Ok(Registration {
            fingerprint: fp,
            created,
        })
    }

    pub async fn get(&self, fp: &Fingerprint) -> Result<Condition> {
        let row: Option<ConditionRow> =
            sqlx::query_as(&format!("{SELECT_CONDITION} WHERE fingerprint = ?1"))
                .bind(fp.as_str())
                .fetch_optional(&self.db)
                .await
                .map_err(db_err)?;
        row.ok_or_else(|| Error::NotFound(format!("condition {fp}")))?
            .try_into()
    }

    pub async fn get_status(&self, fp: &Fingerprint) -> Result<ConditionStatus> {
        let condition = self.get(fp).await?;
        let subscriber_count = self.subscriber_count(fp).await?;
        Ok(ConditionStatus {
            condition,
            subscriber_count,
        })
    }

    /// Number of active subscriptions on a condition.
    pub async fn subscriber_count(&self, fp: &Fingerprint) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscriptions WHERE condition_fingerprint = ?1 AND active = 1",
        )
        .bind(fp.as_str())
        .fetch_one(&self.db)
        .await
        .map_err(db_err)
    }

    /// Increment the trigger counter in a single statement. Never
    /// read-modify-write: parallel callers must not lose updates.
    pub async fn record_trigger(&self, fp: &Fingerprint, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE conditions
            SET trigger_count = trigger_count + 1,
                last_triggered_at = CASE
                    WHEN last_triggered_at IS NULL OR last_triggered_at < ?2 THEN ?2
                    ELSE last_triggered_at
                END
            WHERE fingerprint = ?1
            "#,
        )
        .bind(fp.as_str())
        .bind(ts(at))
        .execute(&self.db)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("condition {fp}")));
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<RegistryStats> {
        let total_conditions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conditions")
            .fetch_one(&self.db)
            .await
            .map_err(db_err)?;
        let total_subscriptions: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE active = 1")
                .fetch_one(&self.db)
                .await
                .map_err(db_err)?;

        let avg_subscribers = if total_conditions == 0 {
            0.0
        } else {
            total_subscriptions as f64 / total_conditions as f64
        };

        Ok(RegistryStats {
            total_conditions,
            total_subscriptions,
            avg_subscribers,
        })
    }

    /// Distinct (symbol, timeframe) pairs with at least one condition that
    /// has an active subscriber. Pairs with nothing to evaluate are absent.
    pub async fn active_pairs(&self) -> Result<Vec<Pair>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT c.symbol, c.timeframe
            FROM conditions c
            JOIN subscriptions s ON s.condition_fingerprint = c.fingerprint AND s.active = 1
            ORDER BY c.symbol, c.timeframe
            "#,
        )
        .fetch_all(&self.db)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|(symbol, timeframe)| {
                Ok(Pair {
                    symbol,
                    timeframe: timeframe.parse::<Timeframe>()?,
                })
            })
            .collect()
    }

    /// Conditions on `pair` that have at least one active subscriber.
    pub async fn active_conditions_for_pair(&self, pair: &Pair) -> Result<Vec<Condition>> {
        let rows: Vec<ConditionRow> = sqlx::query_as(
            r#"
            SELECT c.fingerprint, c.definition, c.trigger_count, c.last_triggered_at, c.created_at
            FROM conditions c
            WHERE c.symbol = ?1 AND c.timeframe = ?2
              AND EXISTS (
                  SELECT 1 FROM subscriptions s
                  WHERE s.condition_fingerprint = c.fingerprint AND s.active = 1
              )
            ORDER BY c.fingerprint
            "#,
        )
        .bind(&pair.symbol)
        .bind(pair.timeframe.as_str())
        .fetch_all(&self.db)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(Condition::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubscriptionStore;
    use common::BotKind;
    use serde_json::json;

    fn rsi_below(value: f64) -> RawCondition {
        RawCondition {
            kind: "threshold".into(),
            symbol: "btcusdt".into(),
            timeframe: "1h".into(),
            indicator: Some("rsi".into()),
            operator: "<".into(),
            value: Some(value),
            ..Default::default()
        }
    }

    async fn setup() -> (ConditionRegistry, SubscriptionStore) {
        let db = common::db::memory().await.unwrap();
        (ConditionRegistry::new(db.clone()), SubscriptionStore::new(db))
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let (registry, _) = setup().await;

        let first = registry.register(&rsi_below(30.0)).await.unwrap();
        assert!(first.created);

        for _ in 0..4 {
            let again = registry
                .register(&RawCondition {
                    symbol: "BTC/USDT".into(),
                    period: Some(14),
                    ..rsi_below(30.0)
                })
                .await
                .unwrap();
            assert!(!again.created);
            assert_eq!(again.fingerprint, first.fingerprint);
        }

        assert_eq!(registry.stats().await.unwrap().total_conditions, 1);
    }

    #[tokio::test]
    async fn invalid_condition_is_rejected_before_storage() {
        let (registry, _) = setup().await;
        let bad = RawCondition {
            value: None,
            ..rsi_below(30.0)
        };
        assert!(matches!(registry.register(&bad).await, Err(Error::Validation(_))));
        assert_eq!(registry.stats().await.unwrap().total_conditions, 0);
    }

    #[tokio::test]
    async fn status_of_unknown_condition_is_not_found() {
        let (registry, _) = setup().await;
        let err = registry
            .get_status(&Fingerprint::new("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn status_reports_active_subscribers() {
        let (registry, subs) = setup().await;
        let reg = registry.register(&rsi_below(30.0)).await.unwrap();
        subs.subscribe("alice", "bot-1", &reg.fingerprint, BotKind::Dca, &json!({}))
            .await
            .unwrap();
        let s2 = subs
            .subscribe("bob", "bot-2", &reg.fingerprint, BotKind::Grid, &json!({}))
            .await
            .unwrap();
        subs.unsubscribe(&s2).await.unwrap();

        let status = registry.get_status(&reg.fingerprint).await.unwrap();
        assert_eq!(status.subscriber_count, 1);
        assert_eq!(status.condition.def.symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn record_trigger_updates_count_and_timestamp() {
        let (registry, _) = setup().await;
        let reg = registry.register(&rsi_below(30.0)).await.unwrap();
        let at = Utc::now();

        registry.record_trigger(&reg.fingerprint, at).await.unwrap();
        registry.record_trigger(&reg.fingerprint, at).await.unwrap();

        let cond = registry.get(&reg.fingerprint).await.unwrap();
        assert_eq!(cond.trigger_count, 2);
        assert!(cond.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn record_trigger_on_unknown_condition_fails() {
        let (registry, _) = setup().await;
        let err = registry
            .record_trigger(&Fingerprint::new("nope"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn stats_average_subscribers() {
        let (registry, subs) = setup().await;
        let a = registry.register(&rsi_below(30.0)).await.unwrap();
        let _b = registry.register(&rsi_below(25.0)).await.unwrap();
        for bot in ["b1", "b2", "b3", "b4"] {
            subs.subscribe("alice", bot, &a.fingerprint, BotKind::Dca, &json!({}))
                .await
                .unwrap();
        }

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.total_conditions, 2);
        assert_eq!(stats.total_subscriptions, 4);
        assert!((stats.avg_subscribers - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn active_pairs_skip_unsubscribed_conditions() {
        let (registry, subs) = setup().await;
        let btc = registry.register(&rsi_below(30.0)).await.unwrap();
        registry
            .register(&RawCondition {
                symbol: "ethusdt".into(),
                ..rsi_below(30.0)
            })
            .await
            .unwrap();
        let sub = subs
            .subscribe("alice", "bot-1", &btc.fingerprint, BotKind::Trend, &json!({}))
            .await
            .unwrap();

        let pairs = registry.active_pairs().await.unwrap();
        assert_eq!(
            pairs,
            vec![Pair {
                symbol: "BTCUSDT".into(),
                timeframe: Timeframe::H1
            }]
        );
        let conds = registry.active_conditions_for_pair(&pairs[0]).await.unwrap();
        assert_eq!(conds.len(), 1);

        subs.unsubscribe(&sub).await.unwrap();
        assert!(registry.active_pairs().await.unwrap().is_empty());
    }
}
