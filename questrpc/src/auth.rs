//! The handshake API gating all other traffic on a connection.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::quest::Quest;
use crate::registry::ApiHandler;
use crate::{Error, Result, AUTH_API_VERSION};

/// Default handler for [`AUTH_API_NAME`](crate::AUTH_API_NAME).
///
/// Checks the protocol version and, only when a secret is configured, the
/// presented token. The token value is never logged or echoed.
pub struct AuthApi {
    secret: Option<String>,
}

impl AuthApi {
    pub fn new(secret: Option<String>) -> Self {
        AuthApi { secret }
    }
}

#[async_trait]
impl ApiHandler for AuthApi {
    async fn call(&self, _quest: &mut Quest, api_args: Value) -> Result<Option<Value>> {
        let version = api_args.get("version").and_then(Value::as_u64);
        if version != Some(AUTH_API_VERSION) {
            return Err(Error::Protocol(format!(
                "invalid version={:?} expected={}",
                version, AUTH_API_VERSION
            )));
        }
        if let Some(secret) = &self.secret {
            if api_args.get("token").and_then(Value::as_str) != Some(secret.as_str()) {
                return Err(Error::Forbidden);
            }
        }
        Ok(Some(json!({})))
    }
}
