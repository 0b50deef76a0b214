//! Startup-time API table.
//!
//! Handlers are registered explicitly by application wiring code, validated
//! before the server accepts its first connection. The table is owned by the
//! [`Server`](crate::Server) value, never process-global, so independent
//! servers (e.g. in tests) cannot interfere with each other.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::AuthApi;
use crate::quest::Quest;
use crate::{Error, Result, AUTH_API_NAME};

/// One registered API.
///
/// Every handler is asynchronous by construction; the subscription capability
/// is an explicit registration-time flag, never inferred from behavior.
///
/// A unary handler returns `Ok(Some(result))`; returning `None` is a call
/// error ("missing reply"). A subscription handler pushes results through
/// [`Quest::subscription`](crate::Quest::subscription) and returns
/// `Ok(None)`; a non-`None` return is itself a call error.
#[async_trait]
pub trait ApiHandler: Send + Sync + 'static {
    async fn call(&self, quest: &mut Quest, api_args: Value) -> Result<Option<Value>>;
}

pub(crate) struct ApiEntry {
    pub handler: Arc<dyn ApiHandler>,
    pub is_subscription: bool,
}

/// Accumulates `(name, handler, is_subscription)` registrations.
///
/// Duplicate names are a startup error, raised here rather than per-request.
pub struct RegistryBuilder {
    map: HashMap<String, ApiEntry>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        RegistryBuilder {
            map: HashMap::new(),
        }
    }

    /// Register a unary API.
    pub fn api(self, name: &str, handler: Arc<dyn ApiHandler>) -> Result<Self> {
        self.insert(name, handler, false)
    }

    /// Register a subscription API.
    pub fn subscription(self, name: &str, handler: Arc<dyn ApiHandler>) -> Result<Self> {
        self.insert(name, handler, true)
    }

    fn insert(mut self, name: &str, handler: Arc<dyn ApiHandler>, is_subscription: bool) -> Result<Self> {
        if self.map.contains_key(name) {
            return Err(Error::Protocol(format!("duplicate api={}", name)));
        }
        self.map.insert(
            name.to_owned(),
            ApiEntry {
                handler,
                is_subscription,
            },
        );
        Ok(self)
    }

    /// Finalize the table. When no registration claimed
    /// [`AUTH_API_NAME`](crate::AUTH_API_NAME), the default [`AuthApi`]
    /// (permissive unless `auth_secret` is set) is added so a server is
    /// always reachable.
    pub(crate) fn build(mut self, auth_secret: Option<String>) -> Registry {
        if !self.map.contains_key(AUTH_API_NAME) {
            self.map.insert(
                AUTH_API_NAME.to_owned(),
                ApiEntry {
                    handler: Arc::new(AuthApi::new(auth_secret)),
                    is_subscription: false,
                },
            );
        }
        Registry { map: self.map }
    }
}

/// Immutable name-to-handler table, built once at startup.
pub struct Registry {
    map: HashMap<String, ApiEntry>,
}

impl Registry {
    pub(crate) fn get(&self, api_name: &str) -> Option<&ApiEntry> {
        self.map.get(api_name)
    }

    /// Registered names, for startup logging.
    pub fn api_names(&self) -> Vec<&str> {
        let mut rv: Vec<&str> = self.map.keys().map(String::as_str).collect();
        rv.sort_unstable();
        rv
    }
}
