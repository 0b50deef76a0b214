//! End-to-end call and subscription behavior over a real TCP loopback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use questrpc::{
    ApiHandler, Client, ClientConfig, Error, ListenConfig, Listener, Quest, RegistryBuilder,
    Result, Server, ServerConfig,
};

struct EchoApi;

#[async_trait]
impl ApiHandler for EchoApi {
    async fn call(&self, quest: &mut Quest, api_args: Value) -> Result<Option<Value>> {
        let n = quest
            .session_get("counter")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            + 1;
        quest.session_put("counter", json!(n));
        let mut rv = api_args;
        rv["counter"] = json!(n);
        Ok(Some(rv))
    }
}

struct CountdownApi;

#[async_trait]
impl ApiHandler for CountdownApi {
    async fn call(&self, quest: &mut Quest, api_args: Value) -> Result<Option<Value>> {
        let count = api_args["count"].as_u64().unwrap_or(0);
        let sub = quest.subscription().unwrap();
        for i in 0..count {
            sub.result_put(json!({ "i": i })).await?;
        }
        Ok(None)
    }
}

struct FailApi;

#[async_trait]
impl ApiHandler for FailApi {
    async fn call(&self, _quest: &mut Quest, _api_args: Value) -> Result<Option<Value>> {
        Err(Error::Call("boom".into()))
    }
}

struct NoReplyApi;

#[async_trait]
impl ApiHandler for NoReplyApi {
    async fn call(&self, _quest: &mut Quest, _api_args: Value) -> Result<Option<Value>> {
        Ok(None)
    }
}

struct BadSubApi;

#[async_trait]
impl ApiHandler for BadSubApi {
    async fn call(&self, _quest: &mut Quest, _api_args: Value) -> Result<Option<Value>> {
        Ok(Some(json!(1)))
    }
}

struct PanicApi;

#[async_trait]
impl ApiHandler for PanicApi {
    async fn call(&self, quest: &mut Quest, _api_args: Value) -> Result<Option<Value>> {
        // Panic while holding the session guard to poison the lock too.
        let _guard = quest.session();
        panic!("handler blew up");
    }
}

fn registry() -> RegistryBuilder {
    RegistryBuilder::new()
        .api("echo", Arc::new(EchoApi))
        .unwrap()
        .subscription("countdown", Arc::new(CountdownApi))
        .unwrap()
        .api("fail", Arc::new(FailApi))
        .unwrap()
        .api("no_reply", Arc::new(NoReplyApi))
        .unwrap()
        .subscription("bad_sub", Arc::new(BadSubApi))
        .unwrap()
        .api("panic", Arc::new(PanicApi))
        .unwrap()
}

async fn start(registry: RegistryBuilder) -> String {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let server = Server::new(registry, Vec::new(), ServerConfig::default()).unwrap();
    let listener = Listener::new("tcp:127.0.0.1:0").await.unwrap();
    let address = listener.local_address().unwrap();
    tokio::spawn(Arc::new(server).serve(listener, ListenConfig::default()));
    address
}

async fn connect(address: &str) -> Client {
    let client = Client::new(ClientConfig::new(address));
    client.connect(None).await.unwrap();
    client
}

#[tokio::test]
async fn test_echo_with_session_counter() {
    let address = start(registry()).await;
    let client = connect(&address).await;
    let r = client.call_api("echo", json!({"ping": "pong"})).await.unwrap();
    assert_eq!(r["ping"], "pong");
    assert_eq!(r["counter"], 1);
    let r = client.call_api("echo", json!({})).await.unwrap();
    assert_eq!(r["counter"], 2);

    // A new connection gets a fresh session.
    let client2 = connect(&address).await;
    let r = client2.call_api("echo", json!({})).await.unwrap();
    assert_eq!(r["counter"], 1);
}

#[tokio::test]
async fn test_subscription_stream_then_clean_end() {
    let address = start(registry()).await;
    let client = connect(&address).await;
    let mut sub = client.subscribe_api("countdown", json!({"count": 3})).await.unwrap();
    for i in 0..3 {
        let r = sub.result_get().await.unwrap().unwrap();
        assert_eq!(r["i"], i);
    }
    assert!(sub.result_get().await.unwrap().is_none());
}

#[tokio::test]
async fn test_handler_error_surfaces_to_caller() {
    let address = start(registry()).await;
    let client = connect(&address).await;
    let e = client.call_api("fail", json!({})).await.unwrap_err();
    assert!(matches!(e, Error::Call(m) if m == "boom"), "unexpected error");
    // Non-fatal: the connection remains usable.
    assert_eq!(client.call_api("echo", json!({})).await.unwrap()["counter"], 1);
}

#[tokio::test]
async fn test_unknown_api_is_not_found() {
    let address = start(registry()).await;
    let client = connect(&address).await;
    let e = client.call_api("nope", json!({})).await.unwrap_err();
    assert!(matches!(e, Error::NotFound(m) if m == "nope"));
    assert_eq!(client.call_api("echo", json!({})).await.unwrap()["counter"], 1);
}

#[tokio::test]
async fn test_missing_reply_is_call_error() {
    let address = start(registry()).await;
    let client = connect(&address).await;
    let e = client.call_api("no_reply", json!({})).await.unwrap_err();
    assert!(matches!(e, Error::Call(m) if m.contains("missing reply")));
}

#[tokio::test]
async fn test_subscription_returning_value_is_call_error() {
    let address = start(registry()).await;
    let client = connect(&address).await;
    let mut sub = client.subscribe_api("bad_sub", json!({})).await.unwrap();
    let e = sub.result_get().await.unwrap_err();
    assert!(matches!(e, Error::Call(m) if m.contains("non-null return")));
}

#[tokio::test]
async fn test_handler_panic_becomes_call_error() {
    let address = start(registry()).await;
    let client = connect(&address).await;
    let e = client.call_api("panic", json!({})).await.unwrap_err();
    assert!(matches!(e, Error::Call(m) if m.contains("panicked")));
    // The connection and its session survive the panic, poisoned lock and
    // all.
    assert_eq!(client.call_api("echo", json!({})).await.unwrap()["counter"], 1);
    assert_eq!(client.call_api("echo", json!({})).await.unwrap()["counter"], 2);
}

#[tokio::test]
async fn test_kind_mismatch_is_fatal() {
    let address = start(registry()).await;
    let client = connect(&address).await;
    // Unary CALL to a subscription API.
    let e = client.call_api("countdown", json!({"count": 1})).await.unwrap_err();
    assert!(matches!(e, Error::Kind(_)));
    // The server closed the connection behind the reply.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let e = client.call_api("echo", json!({})).await.unwrap_err();
    assert!(matches!(e, Error::Disconnected));
}
