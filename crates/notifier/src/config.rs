use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::{BotKind, Error, Result};

use crate::handler::{HandlerRegistry, HttpActionHandler};

/// Action-handler routing file (TOML).
///
/// Example `config/handlers.toml`:
/// ```toml
/// [[handler]]
/// kind = "dca"
/// url = "http://dca-bot:9000/actions"
/// timeout_ms = 3000
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HandlerFileConfig {
    #[serde(rename = "handler", default)]
    pub handlers: Vec<HandlerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandlerConfig {
    pub kind: BotKind,
    /// Endpoint the action request is POSTed to.
    pub url: String,
    /// Per-request timeout. Falls back to the dispatch timeout.
    pub timeout_ms: Option<u64>,
}

impl HandlerFileConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read handler config at '{path}': {e}")))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("invalid handler config at '{path}': {e}")))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let mut seen = Vec::new();
        for h in &config.handlers {
            if h.url.trim().is_empty() {
                return Err(Error::Config(format!("handler '{}' has an empty url", h.kind)));
            }
            if seen.contains(&h.kind) {
                return Err(Error::Config(format!("handler '{}' declared twice", h.kind)));
            }
            seen.push(h.kind);
        }
        Ok(config)
    }

    /// Build one HTTP handler per declared bot kind.
    pub fn into_registry(self, default_timeout: Duration) -> Result<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        for h in self.handlers {
            let timeout = h.timeout_ms.map(Duration::from_millis).unwrap_or(default_timeout);
            registry.register(h.kind, Arc::new(HttpActionHandler::new(h.url, timeout)?));
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handler_tables() {
        let cfg = HandlerFileConfig::parse(
            r#"
            [[handler]]
            kind = "dca"
            url = "http://localhost:9001/act"

            [[handler]]
            kind = "grid"
            url = "http://localhost:9002/act"
            timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(cfg.handlers.len(), 2);
        assert_eq!(cfg.handlers[0].kind, BotKind::Dca);
        assert_eq!(cfg.handlers[0].timeout_ms, None);
        assert_eq!(cfg.handlers[1].timeout_ms, Some(250));

        let registry = cfg.into_registry(Duration::from_secs(5)).unwrap();
        assert!(registry.get(BotKind::Dca).is_some());
        assert!(registry.get(BotKind::Grid).is_some());
        assert!(registry.get(BotKind::Trend).is_none());
    }

    #[test]
    fn empty_file_is_an_empty_registry() {
        let cfg = HandlerFileConfig::parse("").unwrap();
        assert!(cfg.into_registry(Duration::from_secs(1)).unwrap().is_empty());
    }

    #[test]
    fn rejects_unknown_kind_and_duplicates() {
        assert!(HandlerFileConfig::parse("[[handler]]\nkind = \"scalper\"\nurl = \"http://x\"").is_err());
        let dup = "[[handler]]\nkind = \"dca\"\nurl = \"http://a\"\n[[handler]]\nkind = \"dca\"\nurl = \"http://b\"";
        assert!(matches!(HandlerFileConfig::parse(dup), Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            HandlerFileConfig::load("/nonexistent/handlers.toml"),
            Err(Error::Config(_))
        ));
    }
}
