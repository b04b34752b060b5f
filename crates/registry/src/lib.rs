pub mod conditions;
pub mod normalize;
pub mod subscriptions;
pub mod trigger_log;

pub use conditions::{ConditionRegistry, ConditionStatus, Registration, RegistryStats};
pub use normalize::{canonical_form, fingerprint, normalize, normalize_and_hash, RawCondition};
pub use subscriptions::SubscriptionStore;
pub use trigger_log::{TriggerLog, TriggerLogEntry};

use chrono::{DateTime, SecondsFormat, Utc};

use common::Error;

/// Classify a storage failure. Connectivity problems become
/// `ServiceUnavailable` so the evaluator and API treat them as retryable.
pub(crate) fn db_err(e: sqlx::Error) -> Error {
    let err = Error::Database(e);
    if err.is_retryable() {
        Error::ServiceUnavailable(err.to_string())
    } else {
        err
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("corrupt timestamp '{raw}': {e}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, Error> {
    raw.as_deref().map(parse_ts).transpose()
}
