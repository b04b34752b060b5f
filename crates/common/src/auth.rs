use std::collections::HashMap;

use async_trait::async_trait;

use crate::{Error, Result};

/// The authenticated caller of a tenant-scoped operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub owner_id: String,
}

/// Resolves a bearer token to the owner it belongs to.
///
/// Identity management lives outside this service; the API only needs
/// the owner id to scope subscriptions.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, token: &str) -> Result<Principal>;
}

/// Fixed token table loaded from `API_TOKENS`.
pub struct StaticTokenAuthorizer {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthorizer {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Authorizer for StaticTokenAuthorizer {
    async fn authorize(&self, token: &str) -> Result<Principal> {
        self.tokens
            .get(token)
            .map(|owner| Principal {
                owner_id: owner.clone(),
            })
            .ok_or_else(|| Error::Unauthorized("invalid or missing token".into()))
    }
}
