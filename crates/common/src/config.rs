use std::collections::HashMap;
use std::time::Duration;

/// All configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,

    // API
    pub api_port: u16,
    /// Bearer token -> owner id.
    pub api_tokens: HashMap<String, String>,

    // Evaluator
    pub eval_tick: Duration,
    pub eval_max_concurrent_pairs: usize,
    pub eval_candle_limit: usize,
    pub market_data_url: String,
    pub fetch_timeout: Duration,

    // Notifier
    pub dispatch_timeout: Duration,
    pub handler_config_path: String,

    // Bus
    pub bus_capacity: usize,

    // Shutdown
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let api_tokens = parse_token_map(&required_env("API_TOKENS"))
            .unwrap_or_else(|e| panic!("API_TOKENS is malformed: {e}"));

        Config {
            database_url: required_env("DATABASE_URL"),
            api_port: parsed_env("API_PORT", 8080),
            api_tokens,
            eval_tick: secs_env("EVAL_TICK_SECS", 60),
            eval_max_concurrent_pairs: parsed_env("EVAL_MAX_CONCURRENT_PAIRS", 8),
            eval_candle_limit: parsed_env("EVAL_CANDLE_LIMIT", 200),
            market_data_url: optional_env("MARKET_DATA_URL")
                .unwrap_or_else(|| "https://api.binance.com".to_string()),
            fetch_timeout: secs_env("FETCH_TIMEOUT_SECS", 10),
            dispatch_timeout: secs_env("DISPATCH_TIMEOUT_SECS", 5),
            handler_config_path: optional_env("HANDLER_CONFIG_PATH")
                .unwrap_or_else(|| "config/handlers.toml".to_string()),
            bus_capacity: parsed_env("BUS_CAPACITY", 1024),
            shutdown_grace: Duration::from_secs(parsed_env("SHUTDOWN_GRACE_SECS", 15)),
        }
    }
}

/// Parse `token:owner,token2:owner2`.
pub fn parse_token_map(raw: &str) -> Result<HashMap<String, String>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((token, owner)) if !token.trim().is_empty() && !owner.trim().is_empty() => {
                Ok((token.trim().to_string(), owner.trim().to_string()))
            }
            _ => Err(format!("expected 'token:owner', got '{entry}'")),
        })
        .collect()
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Whole seconds, never below one: a zero tick or timeout is unusable.
fn secs_env(key: &str, default: u64) -> Duration {
    Duration::from_secs(parsed_env(key, default).max(1))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    optional_env(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
