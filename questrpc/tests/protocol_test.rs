//! Protocol-level behavior: auth gating, call_id discipline, multiplexing,
//! cancellation and teardown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::sleep;

use questrpc::stream::{framed, Stream};
use questrpc::{
    msg_pack, msg_unpack, ApiHandler, AuthArgs, Client, ClientConfig, Error, ListenConfig,
    Listener, Message, MsgKind, Quest, RegistryBuilder, Result, Server, ServerConfig, Side,
};

struct SleepEchoApi;

#[async_trait]
impl ApiHandler for SleepEchoApi {
    async fn call(&self, _quest: &mut Quest, api_args: Value) -> Result<Option<Value>> {
        let ms = api_args["ms"].as_u64().unwrap_or(0);
        sleep(Duration::from_millis(ms)).await;
        Ok(Some(api_args))
    }
}

/// Subscription that produces nothing and waits for cancellation.
struct HangApi;

#[async_trait]
impl ApiHandler for HangApi {
    async fn call(&self, quest: &mut Quest, _api_args: Value) -> Result<Option<Value>> {
        for _ in 0..400 {
            if quest.is_ended() {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        Ok(None)
    }
}

/// Subscription pushing a counter until cancelled.
struct TickApi;

#[async_trait]
impl ApiHandler for TickApi {
    async fn call(&self, quest: &mut Quest, _api_args: Value) -> Result<Option<Value>> {
        for i in 0..200u64 {
            if quest.is_ended() {
                break;
            }
            if quest.subscription().unwrap().result_put(json!({ "i": i })).await.is_err() {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        Ok(None)
    }
}

/// Subscription like [`TickApi`] that also counts its pushes.
struct CountedTickApi {
    pushes: Arc<AtomicU64>,
}

#[async_trait]
impl ApiHandler for CountedTickApi {
    async fn call(&self, quest: &mut Quest, _api_args: Value) -> Result<Option<Value>> {
        for i in 0..200u64 {
            if quest.is_ended() {
                break;
            }
            if quest.subscription().unwrap().result_put(json!({ "i": i })).await.is_err() {
                break;
            }
            self.pushes.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(25)).await;
        }
        Ok(None)
    }
}

struct HookApi {
    log: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl ApiHandler for HookApi {
    async fn call(&self, quest: &mut Quest, _api_args: Value) -> Result<Option<Value>> {
        let log1 = Arc::clone(&self.log);
        let log2 = Arc::clone(&self.log);
        {
            let mut session = quest.session();
            session.on_close(move || log1.lock().unwrap().push(1));
            session.on_close(move || log2.lock().unwrap().push(2));
        }
        Ok(Some(json!({})))
    }
}

fn registry() -> RegistryBuilder {
    RegistryBuilder::new()
        .api("sleep_echo", Arc::new(SleepEchoApi))
        .unwrap()
        .subscription("hang", Arc::new(HangApi))
        .unwrap()
        .subscription("tick", Arc::new(TickApi))
        .unwrap()
}

async fn start_with(registry: RegistryBuilder, auth_secret: Option<&str>) -> String {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let server = Server::new(
        registry,
        Vec::new(),
        ServerConfig {
            auth_secret: auth_secret.map(str::to_owned),
        },
    )
    .unwrap();
    let listener = Listener::new("tcp:127.0.0.1:0").await.unwrap();
    let address = listener.local_address().unwrap();
    tokio::spawn(Arc::new(server).serve(listener, ListenConfig::default()));
    address
}

#[tokio::test]
async fn test_auth_token_checked() {
    let address = start_with(registry(), Some("s3cret")).await;

    let client = Client::new(ClientConfig::new(&address));
    let e = client.connect(Some(AuthArgs::with_token("wrong"))).await.unwrap_err();
    assert!(matches!(e, Error::Forbidden));

    let client = Client::new(ClientConfig::new(&address));
    client.connect(Some(AuthArgs::with_token("s3cret"))).await.unwrap();
    let r = client.call_api("sleep_echo", json!({"ms": 0, "tag": "x"})).await.unwrap();
    assert_eq!(r["tag"], "x");
}

#[tokio::test]
async fn test_auth_version_checked() {
    let address = start_with(registry(), None).await;
    let client = Client::new(ClientConfig::new(&address));
    let e = client
        .connect(Some(AuthArgs {
            version: 1,
            ..AuthArgs::default()
        }))
        .await
        .unwrap_err();
    assert!(matches!(e, Error::Protocol(m) if m.contains("version")));
}

#[tokio::test]
async fn test_unauthenticated_call_rejected_on_the_wire() {
    let address = start_with(registry(), Some("s3cret")).await;
    let stream = Stream::connect(&address).await.unwrap();
    let (mut reader, mut writer) = framed(stream);
    let m = Message::request(1, MsgKind::Call, "sleep_echo", json!({"ms": 0}));
    writer.write_frame(&msg_pack(&m).unwrap()).await.unwrap();
    let frame = reader.read_frame().await.unwrap().unwrap();
    let reply = msg_unpack(&frame, Side::Client).unwrap();
    assert_eq!(reply.call_id, 1);
    assert_eq!(reply.api_error.as_deref(), Some("forbidden"));
}

#[tokio::test]
async fn test_malformed_frame_closes_without_reply() {
    let address = start_with(registry(), None).await;
    let stream = Stream::connect(&address).await.unwrap();
    let (mut reader, mut writer) = framed(stream);
    writer.write_frame(b"\xff\xfe not a message").await.unwrap();
    assert!(reader.read_frame().await.unwrap().is_none());
}

#[tokio::test]
async fn test_call_ids_monotonic_and_unshared() {
    let address = start_with(registry(), None).await;
    let client = Client::new(ClientConfig::new(&address));
    client.connect(None).await.unwrap();
    // The auth handshake consumed call_id 1.
    let a = client.subscribe_api("hang", json!({})).await.unwrap();
    let b = client.subscribe_api("hang", json!({})).await.unwrap();
    let c = client.subscribe_api("hang", json!({})).await.unwrap();
    assert_eq!((a.call_id(), b.call_id(), c.call_id()), (2, 3, 4));
}

#[tokio::test]
async fn test_concurrent_calls_matched_by_call_id() {
    let address = start_with(registry(), None).await;
    let client = Client::new(ClientConfig::new(&address));
    client.connect(None).await.unwrap();
    let (slow, fast) = tokio::join!(
        client.call_api("sleep_echo", json!({"ms": 200, "tag": "slow"})),
        client.call_api("sleep_echo", json!({"ms": 10, "tag": "fast"})),
    );
    assert_eq!(slow.unwrap()["tag"], "slow");
    assert_eq!(fast.unwrap()["tag"], "fast");
}

#[tokio::test]
async fn test_destroy_fans_out_disconnected() {
    let address = start_with(registry(), None).await;
    let client = Client::new(ClientConfig::new(&address));
    client.connect(None).await.unwrap();
    let mut sub = client.subscribe_api("hang", json!({})).await.unwrap();
    let (call, _) = tokio::join!(
        client.call_api("sleep_echo", json!({"ms": 5000})),
        async {
            sleep(Duration::from_millis(50)).await;
            client.destroy();
        },
    );
    assert!(matches!(call.unwrap_err(), Error::Disconnected));
    assert!(matches!(sub.result_get().await.unwrap_err(), Error::Disconnected));
}

#[tokio::test]
async fn test_early_unsubscribe_is_idempotent() {
    let address = start_with(registry(), None).await;
    let client = Client::new(ClientConfig::new(&address));
    client.connect(None).await.unwrap();
    let mut sub = client.subscribe_api("tick", json!({})).await.unwrap();
    let first = sub.result_get().await.unwrap().unwrap();
    assert_eq!(first["i"], 0);
    sub.unsubscribe().await.unwrap();
    sub.unsubscribe().await.unwrap();
    assert!(matches!(sub.result_get().await.unwrap_err(), Error::Disconnected));
    // The connection itself is unaffected.
    let r = client.call_api("sleep_echo", json!({"ms": 0, "tag": "after"})).await.unwrap();
    assert_eq!(r["tag"], "after");
}

#[tokio::test]
async fn test_unsubscribe_right_behind_subscribe_stops_producer() {
    let pushes = Arc::new(AtomicU64::new(0));
    let registry = RegistryBuilder::new()
        .subscription(
            "counted",
            Arc::new(CountedTickApi {
                pushes: Arc::clone(&pushes),
            }),
        )
        .unwrap();
    let address = start_with(registry, None).await;
    let client = Client::new(ClientConfig::new(&address));
    client.connect(None).await.unwrap();
    // Cancel before ever reading a result; the cancel frame chases the
    // subscribe frame down the same stream and must still find its target.
    let mut sub = client.subscribe_api("counted", json!({})).await.unwrap();
    sub.unsubscribe().await.unwrap();
    sleep(Duration::from_millis(150)).await;
    let settled = pushes.load(Ordering::SeqCst);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(pushes.load(Ordering::SeqCst), settled, "producer kept running");
}

#[tokio::test]
async fn test_session_close_hooks_run_in_reverse() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = RegistryBuilder::new()
        .api("hooks", Arc::new(HookApi { log: Arc::clone(&log) }))
        .unwrap();
    let address = start_with(registry, None).await;
    let client = Client::new(ClientConfig::new(&address));
    client.connect(None).await.unwrap();
    client.call_api("hooks", json!({})).await.unwrap();
    client.destroy();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(*log.lock().unwrap(), vec![2, 1]);
}

#[tokio::test]
async fn test_stop_flag_ends_serve() {
    let server = Server::new(registry(), Vec::new(), ServerConfig::default()).unwrap();
    let listener = Listener::new("tcp:127.0.0.1:0").await.unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(Arc::new(server).serve(
        listener,
        ListenConfig {
            stop: Some(Arc::clone(&stop)),
        },
    ));
    stop.store(true, std::sync::atomic::Ordering::SeqCst);
    let rv = tokio::time::timeout(Duration::from_secs(1), handle).await;
    assert!(rv.unwrap().unwrap().is_ok());
}
