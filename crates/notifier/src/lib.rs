pub mod config;
pub mod handler;
pub mod notifier;

pub use config::{HandlerConfig, HandlerFileConfig};
pub use handler::{ActionHandler, ActionRequest, HandlerRegistry, HttpActionHandler, TriggerInfo};
pub use notifier::{DispatchSummary, Notifier, TRIGGER_PATTERN};
