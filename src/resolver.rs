//! Username-to-backend resolution capability.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// The claimed username has no backend mapping. The connection is failed
/// explicitly downstream, never silently dropped.
#[derive(Error, Debug)]
#[error("no upstream host for user {user:?}")]
pub struct ResolveError {
    pub user: String,
}

/// Maps a claimed username to the backend host that should serve it. Pure
/// function of the username for the core; injected per connection.
#[async_trait]
pub trait UpstreamResolver: Send + Sync {
    async fn resolve(&self, username: &str) -> Result<String, ResolveError>;
}

/// Resolver over a fixed route table, typically the `[routes]` section of
/// the configuration file.
pub struct StaticResolver {
    routes: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new(routes: HashMap<String, String>) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl UpstreamResolver for StaticResolver {
    async fn resolve(&self, username: &str) -> Result<String, ResolveError> {
        self.routes
            .get(username)
            .cloned()
            .ok_or_else(|| ResolveError { user: username.to_owned() })
    }
}
