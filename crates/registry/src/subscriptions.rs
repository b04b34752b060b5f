use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use common::{BotKind, Error, Fingerprint, Result, Subscription};

use crate::{db_err, parse_opt_ts, parse_ts, ts};

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    bot_id: String,
    owner_id: String,
    condition_fingerprint: String,
    bot_kind: String,
    bot_config: String,
    active: bool,
    last_triggered_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = Error;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        Ok(Subscription {
            id: row.id,
            bot_id: row.bot_id,
            owner_id: row.owner_id,
            condition_fingerprint: Fingerprint::new(row.condition_fingerprint),
            bot_kind: row.bot_kind.parse()?,
            bot_config: serde_json::from_str(&row.bot_config)?,
            active: row.active,
            last_triggered_at: parse_opt_ts(row.last_triggered_at)?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

const SELECT_SUBSCRIPTION: &str = "SELECT id, bot_id, owner_id, condition_fingerprint, bot_kind, bot_config, active, last_triggered_at, created_at, updated_at FROM subscriptions";

/// (bot, condition) mappings. Rows are soft-deleted and kept for audit.
#[derive(Clone)]
pub struct SubscriptionStore {
    db: SqlitePool,
}

impl SubscriptionStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Upsert a subscription and return its id.
    ///
    /// Re-subscribing the same bot to the same condition updates its config
    /// and reactivates it. A bot id is bound to the owner that first used it,
    /// across every condition; anyone else gets `Unauthorized`.
    pub async fn subscribe(
        &self,
        owner_id: &str,
        bot_id: &str,
        fp: &Fingerprint,
        bot_kind: BotKind,
        bot_config: &serde_json::Value,
    ) -> Result<String> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM conditions WHERE fingerprint = ?1")
                .bind(fp.as_str())
                .fetch_optional(&self.db)
                .await
                .map_err(db_err)?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("condition {fp}")));
        }

        let now = ts(Utc::now());
        let id: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO subscriptions
                (id, bot_id, owner_id, condition_fingerprint, bot_kind, bot_config, active, created_at, updated_at)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7
            WHERE NOT EXISTS (
                SELECT 1 FROM subscriptions WHERE bot_id = ?2 AND owner_id <> ?3
            )
            ON CONFLICT(bot_id, condition_fingerprint) DO UPDATE SET
                bot_kind   = excluded.bot_kind,
                bot_config = excluded.bot_config,
                active     = 1,
                updated_at = excluded.updated_at
            WHERE subscriptions.owner_id = excluded.owner_id
            RETURNING id
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(bot_id)
        .bind(owner_id)
        .bind(fp.as_str())
        .bind(bot_kind.as_str())
        .bind(serde_json::to_string(bot_config)?)
        .bind(now)
        .fetch_optional(&self.db)
        .await
        .map_err(db_err)?;

        let id = id.ok_or_else(|| {
            Error::Unauthorized(format!("bot '{bot_id}' belongs to another owner"))
        })?;
        info!(subscription = %id, bot = %bot_id, kind = %bot_kind, fingerprint = %fp, "Subscription active");
        Ok(id)
    }

    /// Soft-delete. Returns `false` when the subscription was already inactive.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET active = 0, updated_at = ?2 WHERE id = ?1 AND active = 1",
        )
        .bind(subscription_id)
        .bind(ts(Utc::now()))
        .execute(&self.db)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            info!(subscription = %subscription_id, "Subscription deactivated");
            return Ok(true);
        }

        // Distinguish "already inactive" (no-op) from "never existed".
        self.get(subscription_id).await?;
        debug!(subscription = %subscription_id, "Unsubscribe on inactive subscription ignored");
        Ok(false)
    }

    /// Deactivate every subscription of a stopping bot.
    pub async fn deactivate_bot(&self, bot_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE subscriptions SET active = 0, updated_at = ?2 WHERE bot_id = ?1 AND active = 1",
        )
        .bind(bot_id)
        .bind(ts(Utc::now()))
        .execute(&self.db)
        .await
        .map_err(db_err)?;
        info!(bot = %bot_id, deactivated = result.rows_affected(), "Bot subscriptions deactivated");
        Ok(result.rows_affected())
    }

    pub async fn get(&self, subscription_id: &str) -> Result<Subscription> {
        let row: Option<SubscriptionRow> =
            sqlx::query_as(&format!("{SELECT_SUBSCRIPTION} WHERE id = ?1"))
                .bind(subscription_id)
                .fetch_optional(&self.db)
                .await
                .map_err(db_err)?;
        row.ok_or_else(|| Error::NotFound(format!("subscription {subscription_id}")))?
            .try_into()
    }

    /// Active subscriptions owned by `owner_id`.
    pub async fn list_for_user(&self, owner_id: &str) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "{SELECT_SUBSCRIPTION} WHERE owner_id = ?1 AND active = 1 ORDER BY created_at, id"
        ))
        .bind(owner_id)
        .fetch_all(&self.db)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    /// Active subscriptions on a condition. This is the notifier's fan-out set.
    pub async fn list_for_condition(&self, fp: &Fingerprint) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "{SELECT_SUBSCRIPTION} WHERE condition_fingerprint = ?1 AND active = 1 ORDER BY created_at, id"
        ))
        .bind(fp.as_str())
        .fetch_all(&self.db)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    pub async fn touch_last_triggered(&self, subscription_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET last_triggered_at = ?2 WHERE id = ?1")
            .bind(subscription_id)
            .bind(ts(at))
            .execute(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConditionRegistry, RawCondition};
    use serde_json::json;

    async fn setup() -> (SubscriptionStore, Fingerprint) {
        let db = common::db::memory().await.unwrap();
        let registry = ConditionRegistry::new(db.clone());
        let reg = registry
            .register(&RawCondition {
                kind: "range".into(),
                symbol: "SOLUSDT".into(),
                timeframe: "15m".into(),
                indicator: Some("rsi".into()),
                operator: "between".into(),
                lower_bound: Some(25.0),
                upper_bound: Some(35.0),
                ..Default::default()
            })
            .await
            .unwrap();
        (SubscriptionStore::new(db), reg.fingerprint)
    }

    #[tokio::test]
    async fn resubscribe_updates_config_and_keeps_id() {
        let (store, fp) = setup().await;
        let first = store
            .subscribe("alice", "bot-1", &fp, BotKind::Dca, &json!({"amount": 10}))
            .await
            .unwrap();
        let second = store
            .subscribe("alice", "bot-1", &fp, BotKind::Dca, &json!({"amount": 25}))
            .await
            .unwrap();
        assert_eq!(first, second);

        let sub = store.get(&first).await.unwrap();
        assert_eq!(sub.bot_config, json!({"amount": 25}));
        assert_eq!(store.list_for_condition(&fp).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resubscribe_reactivates() {
        let (store, fp) = setup().await;
        let id = store
            .subscribe("alice", "bot-1", &fp, BotKind::Grid, &json!({}))
            .await
            .unwrap();
        store.unsubscribe(&id).await.unwrap();
        assert!(store.list_for_condition(&fp).await.unwrap().is_empty());

        store
            .subscribe("alice", "bot-1", &fp, BotKind::Grid, &json!({}))
            .await
            .unwrap();
        assert!(store.get(&id).await.unwrap().active);
    }

    #[tokio::test]
    async fn subscribe_to_unknown_condition_is_not_found() {
        let (store, _) = setup().await;
        let err = store
            .subscribe("alice", "bot-1", &Fingerprint::new("missing"), BotKind::Dca, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn foreign_bot_cannot_be_taken_over() {
        let (store, fp) = setup().await;
        store
            .subscribe("alice", "bot-1", &fp, BotKind::Dca, &json!({}))
            .await
            .unwrap();
        let err = store
            .subscribe("mallory", "bot-1", &fp, BotKind::Dca, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn foreign_bot_cannot_subscribe_to_another_condition() {
        let (store, fp) = setup().await;
        let other = ConditionRegistry::new(store.db.clone())
            .register(&RawCondition {
                kind: "threshold".into(),
                symbol: "ETHUSDT".into(),
                timeframe: "1h".into(),
                indicator: Some("price".into()),
                operator: "<".into(),
                value: Some(2_000.0),
                ..Default::default()
            })
            .await
            .unwrap()
            .fingerprint;

        store
            .subscribe("alice", "bot-1", &fp, BotKind::Dca, &json!({}))
            .await
            .unwrap();
        let err = store
            .subscribe("mallory", "bot-1", &other, BotKind::Dca, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert!(store.list_for_user("mallory").await.unwrap().is_empty());
        assert!(store.list_for_condition(&other).await.unwrap().is_empty());

        // the owner can still spread the bot over more conditions
        store
            .subscribe("alice", "bot-1", &other, BotKind::Dca, &json!({}))
            .await
            .unwrap();
        assert_eq!(store.list_for_user("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_is_soft_and_idempotent() {
        let (store, fp) = setup().await;
        let keep = store
            .subscribe("alice", "bot-1", &fp, BotKind::Dca, &json!({}))
            .await
            .unwrap();
        let gone = store
            .subscribe("bob", "bot-2", &fp, BotKind::Trend, &json!({}))
            .await
            .unwrap();

        assert!(store.unsubscribe(&gone).await.unwrap());
        assert!(!store.unsubscribe(&gone).await.unwrap());

        let active = store.list_for_condition(&fp).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep);

        // row retained for audit
        assert!(!store.get(&gone).await.unwrap().active);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_is_not_found() {
        let (store, _) = setup().await;
        assert!(matches!(
            store.unsubscribe("nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_for_user_is_owner_scoped() {
        let (store, fp) = setup().await;
        store
            .subscribe("alice", "bot-1", &fp, BotKind::Dca, &json!({}))
            .await
            .unwrap();
        store
            .subscribe("bob", "bot-2", &fp, BotKind::Dca, &json!({}))
            .await
            .unwrap();

        let alice = store.list_for_user("alice").await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].bot_id, "bot-1");
    }

    #[tokio::test]
    async fn deactivate_bot_drops_all_its_subscriptions() {
        let (store, fp) = setup().await;
        store
            .subscribe("alice", "bot-1", &fp, BotKind::Dca, &json!({}))
            .await
            .unwrap();
        assert_eq!(store.deactivate_bot("bot-1").await.unwrap(), 1);
        assert!(store.list_for_user("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_sets_last_triggered() {
        let (store, fp) = setup().await;
        let id = store
            .subscribe("alice", "bot-1", &fp, BotKind::Dca, &json!({}))
            .await
            .unwrap();
        store.touch_last_triggered(&id, Utc::now()).await.unwrap();
        assert!(store.get(&id).await.unwrap().last_triggered_at.is_some());
    }
}
