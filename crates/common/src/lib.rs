pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod market;
pub mod types;

pub use auth::{Authorizer, Principal, StaticTokenAuthorizer};
pub use config::Config;
pub use error::{Error, Result};
pub use market::MarketDataClient;
pub use types::*;
