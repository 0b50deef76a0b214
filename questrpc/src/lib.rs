//! Bidirectional call/subscribe RPC multiplexed over one framed byte stream.
//!
//! questrpc layers a small remote-procedure-call protocol on top of a single
//! persistent, full-duplex byte stream. Both unary calls and server-push
//! subscriptions share the connection, correlated by a per-connection
//! `call_id`. An authentication handshake gates all other traffic.
//!
//! A server registers async handlers by name and serves connections:
//!
//!```no_run
//!use std::sync::Arc;
//!
//!use async_trait::async_trait;
//!use serde_json::{json, Value};
//!use questrpc::{
//!    ApiHandler, Listener, ListenConfig, Quest, RegistryBuilder, Result, Server, ServerConfig,
//!};
//!
//!struct EchoApi;
//!
//!#[async_trait]
//!impl ApiHandler for EchoApi {
//!    async fn call(&self, quest: &mut Quest, api_args: Value) -> Result<Option<Value>> {
//!        let n = quest.session_get("counter").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
//!        quest.session_put("counter", json!(n));
//!        let mut rv = api_args;
//!        rv["counter"] = json!(n);
//!        Ok(Some(rv))
//!    }
//!}
//!
//!#[tokio::main(flavor = "current_thread")]
//!async fn main() -> Result<()> {
//!    let registry = RegistryBuilder::new().api("echo", Arc::new(EchoApi))?;
//!    let server = Server::new(registry, Vec::new(), ServerConfig::default())?;
//!    let listener = Listener::new("tcp:127.0.0.1:9999").await?;
//!    Arc::new(server).serve(listener, ListenConfig::default()).await
//!}
//!```
//!
//!A client connects (which performs the auth handshake) and then calls or
//!subscribes:
//!
//!```no_run
//!use questrpc::{AuthArgs, Client, ClientConfig, Result};
//!use serde_json::json;
//!
//!# async fn run() -> Result<()> {
//!let client = Client::new(ClientConfig::new("tcp:127.0.0.1:9999"));
//!client.connect(Some(AuthArgs::with_token("secret"))).await?;
//!let reply = client.call_api("echo", json!({"ping": "pong"})).await?;
//!
//!let mut sub = client.subscribe_api("tail", json!({})).await?;
//!while let Some(result) = sub.result_get().await? {
//!    // process pushed result
//!}
//!# Ok(())
//!# }
//!```
//!
//!Supported address URIs:
//!
//!- TCP `tcp:127.0.0.1:12345` hostname/IP address and port
//!- UNIX socket `unix:/run/org.example.quest` (unix only)

use serde::ser::{Serialize, Serializer};
use serde_derive::Serialize;
use serde_json::Value;

pub mod auth;
pub mod client;
mod error;
pub mod protocol;
pub mod quest;
pub mod registry;
pub mod server;
pub mod stream;

pub use crate::auth::AuthApi;
pub use crate::client::{AuthArgs, Call, Client, ClientConfig};
pub use crate::error::{Error, Result};
pub use crate::protocol::{msg_pack, msg_unpack, Side};
pub use crate::quest::{Attr, AttrScope, AttrSpec, Quest};
pub use crate::registry::{ApiHandler, Registry, RegistryBuilder};
pub use crate::server::{
    ListenConfig, Listener, Server, ServerConfig, Session, Subscription,
};

/// API that authenticates connections; always registered on a server.
pub const AUTH_API_NAME: &str = "authenticate_connection";

/// Protocol version carried in the auth handshake.
pub const AUTH_API_VERSION: u64 = 658_584_001;

// Message kind discriminants are offset so a stray small integer on the wire
// never aliases a valid kind.
const MSG_KIND_BASE: u64 = 777_500;

/// Kind of a wire [`Message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgKind {
    /// Unary request (client to server).
    Call,
    /// Reply carrying `api_result` or `api_error` (server to client).
    Reply,
    /// Subscription request (client to server).
    Subscribe,
    /// Subscription end: client-initiated cancel, or the server signaling a
    /// clean end of stream.
    Unsubscribe,
}

impl MsgKind {
    /// The on-wire integer for this kind.
    pub const fn wire(self) -> u64 {
        match self {
            MsgKind::Call => MSG_KIND_BASE + 1,
            MsgKind::Reply => MSG_KIND_BASE + 2,
            MsgKind::Subscribe => MSG_KIND_BASE + 3,
            MsgKind::Unsubscribe => MSG_KIND_BASE + 4,
        }
    }

    /// Decode an on-wire integer; `None` for anything out of range.
    pub fn from_wire(v: u64) -> Option<MsgKind> {
        match v {
            x if x == MsgKind::Call.wire() => Some(MsgKind::Call),
            x if x == MsgKind::Reply.wire() => Some(MsgKind::Reply),
            x if x == MsgKind::Subscribe.wire() => Some(MsgKind::Subscribe),
            x if x == MsgKind::Unsubscribe.wire() => Some(MsgKind::Unsubscribe),
            _ => None,
        }
    }

    pub fn is_call(self) -> bool {
        self == MsgKind::Call
    }

    pub fn is_reply(self) -> bool {
        self == MsgKind::Reply
    }

    pub fn is_subscribe(self) -> bool {
        self == MsgKind::Subscribe
    }

    pub fn is_unsubscribe(self) -> bool {
        self == MsgKind::Unsubscribe
    }
}

impl Serialize for MsgKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.wire())
    }
}

/// The wire envelope shared by both directions.
///
/// Every message carries a positive `call_id` correlating it with one call or
/// subscription on its connection. The optional fields are populated per
/// [`MsgKind`]; absent fields are omitted from the encoded mapping.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub call_id: u64,
    pub msg_kind: MsgKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_error: Option<String>,
}

impl Message {
    /// A request envelope (`CALL` or `SUBSCRIBE`).
    pub fn request(call_id: u64, msg_kind: MsgKind, api_name: &str, api_args: Value) -> Self {
        Message {
            call_id,
            msg_kind,
            api_name: Some(api_name.to_owned()),
            api_args: Some(api_args),
            api_result: None,
            api_error: None,
        }
    }

    /// A terminal or pushed reply. Exactly one of `api_result`/`api_error` is
    /// meaningful.
    pub fn reply(
        call_id: u64,
        msg_kind: MsgKind,
        api_result: Option<Value>,
        api_error: Option<String>,
    ) -> Self {
        Message {
            call_id,
            msg_kind,
            api_name: None,
            api_args: None,
            api_result,
            api_error,
        }
    }

    /// The bare `UNSUBSCRIBE` control envelope.
    pub fn unsubscribe(call_id: u64) -> Self {
        Message {
            call_id,
            msg_kind: MsgKind::Unsubscribe,
            api_name: None,
            api_args: None,
            api_result: None,
            api_error: None,
        }
    }
}
