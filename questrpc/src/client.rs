//! Client side: connection lifecycle and the pending-call table.
//!
//! One background task owns the read half and routes every inbound reply to
//! the [`Call`] that created it, keyed by `call_id`. Identifiers are
//! monotonically increasing per connection and never reused, so a reply can
//! never be misdelivered to a later call. `connect()` runs the auth
//! handshake before any other traffic is allowed out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{msg_pack, msg_unpack, Side};
use crate::stream::{framed, FrameReader, FrameWriter, Stream};
use crate::{Error, Message, MsgKind, Result, AUTH_API_NAME, AUTH_API_VERSION};

/// Connection parameters, supplied by the caller's configuration layer.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `tcp:host:port` or `unix:/path`.
    pub address: String,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        ClientConfig {
            address: address.into(),
        }
    }
}

/// Arguments for the auth handshake sent by [`Client::connect`].
#[derive(Debug, Clone)]
pub struct AuthArgs {
    pub token: Option<String>,
    pub version: u64,
}

impl Default for AuthArgs {
    fn default() -> Self {
        AuthArgs {
            token: None,
            version: AUTH_API_VERSION,
        }
    }
}

impl AuthArgs {
    pub fn with_token(token: &str) -> Self {
        AuthArgs {
            token: Some(token.to_owned()),
            ..AuthArgs::default()
        }
    }

    fn to_value(&self) -> Value {
        let mut rv = json!({ "version": self.version });
        if let Some(t) = &self.token {
            rv["token"] = json!(t);
        }
        rv
    }
}

struct PendingCall {
    api_name: String,
    is_subscription: bool,
    /// Set on unsubscribe. Results already in flight when the server
    /// processes the cancel are discarded, not treated as unknown call_ids.
    draining: bool,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct ClientState {
    next_call_id: u64,
    pending: BTreeMap<u64, PendingCall>,
}

struct ClientInner {
    address: String,
    state: Mutex<ClientState>,
    writer: Arc<tokio::sync::Mutex<Option<FrameWriter<WriteHalf<Stream>>>>>,
    connected: AtomicBool,
    authenticated: AtomicBool,
    destroyed: AtomicBool,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

/// One client connection.
///
/// Usable concurrently from many tasks; calls issued while others are
/// outstanding are matched to their replies by `call_id`. Destroyed on drop,
/// which wakes every outstanding call with
/// [`Error::Disconnected`](crate::Error::Disconnected).
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                address: config.address,
                state: Mutex::new(ClientState {
                    next_call_id: 1,
                    pending: BTreeMap::new(),
                }),
                writer: Arc::new(tokio::sync::Mutex::new(None)),
                connected: AtomicBool::new(false),
                authenticated: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                read_task: Mutex::new(None),
            }),
        }
    }

    /// Open the stream and run the auth handshake.
    ///
    /// No other call may be issued before this completes; a rejected
    /// handshake destroys the client.
    pub async fn connect(&self, auth: Option<AuthArgs>) -> Result<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        if inner.connected.swap(true, Ordering::SeqCst) {
            return Err(Error::Protocol("already connected".into()));
        }
        let stream = match Stream::connect(&inner.address).await {
            Ok(s) => s,
            Err(e) => {
                inner.connected.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let (reader, writer) = framed(stream);
        *inner.writer.lock().await = Some(writer);
        let handle = tokio::spawn(read_loop(Arc::clone(inner), reader));
        *inner.read_task.lock().unwrap() = Some(handle);
        let args = auth.unwrap_or_default();
        let mut call = self.send_api(AUTH_API_NAME, args.to_value(), MsgKind::Call, true).await?;
        match call.result_get().await {
            Ok(Some(_)) => {
                inner.authenticated.store(true, Ordering::SeqCst);
                info!(address = %inner.address, "connected");
                Ok(())
            }
            Ok(None) => {
                inner.destroy();
                Err(Error::Protocol("unexpected unsubscribe reply to auth".into()))
            }
            Err(e) => {
                inner.destroy();
                Err(e)
            }
        }
    }

    /// Unary request; resolves to the handler's result.
    pub async fn call_api(&self, api_name: &str, api_args: Value) -> Result<Value> {
        let mut call = self.send_api(api_name, api_args, MsgKind::Call, false).await?;
        match call.result_get().await? {
            Some(v) => Ok(v),
            None => Err(Error::Protocol(format!(
                "unexpected unsubscribe reply api={}",
                api_name
            ))),
        }
    }

    /// Start a subscription; the returned [`Call`] yields pushed results.
    pub async fn subscribe_api(&self, api_name: &str, api_args: Value) -> Result<Call> {
        self.send_api(api_name, api_args, MsgKind::Subscribe, false).await
    }

    /// Tear down the connection. Idempotent; every outstanding call gets
    /// [`Error::Disconnected`](crate::Error::Disconnected).
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    async fn send_api(
        &self,
        api_name: &str,
        api_args: Value,
        msg_kind: MsgKind,
        allow_unauthenticated: bool,
    ) -> Result<Call> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        if !inner.connected.load(Ordering::SeqCst) {
            return Err(Error::Protocol(
                "no connection, must call connect() first".into(),
            ));
        }
        if !allow_unauthenticated && !inner.authenticated.load(Ordering::SeqCst) {
            // Rejected locally; the server would close the connection.
            return Err(Error::Protocol(
                "not authenticated, connect() must complete first".into(),
            ));
        }
        let is_subscription = msg_kind.is_subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let call_id = {
            let mut state = inner.state.lock().unwrap();
            let id = state.next_call_id;
            state.next_call_id += 1;
            state.pending.insert(
                id,
                PendingCall {
                    api_name: api_name.to_owned(),
                    is_subscription,
                    draining: false,
                    tx,
                },
            );
            id
        };
        debug!(call_id, api = api_name, kind = ?msg_kind, "send");
        let msg = Message::request(call_id, msg_kind, api_name, api_args);
        if let Err(e) = inner.write(&msg).await {
            inner.state.lock().unwrap().pending.remove(&call_id);
            return Err(e);
        }
        Ok(Call {
            api_name: api_name.to_owned(),
            call_id,
            is_subscription,
            rx,
            client: Arc::clone(inner),
            destroyed: false,
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl ClientInner {
    async fn write(&self, msg: &Message) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        let frame = msg_pack(msg)?;
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            None => Err(Error::Disconnected),
            Some(w) => Ok(w.write_frame(&frame).await?),
        }
    }

    /// Idempotent terminal transition. Senders are dropped in reverse
    /// creation order so waiters wake newest first.
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(address = %self.address, "client destroy");
        let pending = std::mem::take(&mut self.state.lock().unwrap().pending);
        for (call_id, p) in pending.into_iter().rev() {
            debug!(call_id, api = %p.api_name, "abandon call");
            drop(p);
        }
        if let Some(h) = self.read_task.lock().unwrap().take() {
            h.abort();
        }
        // Drop may run outside a runtime; skip the graceful shutdown then
        // and let the socket close with the writer.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let writer = Arc::clone(&self.writer);
            handle.spawn(async move {
                if let Some(mut w) = writer.lock().await.take() {
                    let _ = w.shutdown().await;
                }
            });
        }
    }
}

enum Route {
    Deliver(mpsc::UnboundedSender<Message>),
    Discard,
    Unknown,
}

async fn read_loop(inner: Arc<ClientInner>, mut reader: FrameReader<ReadHalf<Stream>>) {
    loop {
        if inner.destroyed.load(Ordering::SeqCst) {
            break;
        }
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                let msg = match msg_unpack(&frame, Side::Client) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "msg unpack error");
                        break;
                    }
                };
                let route = {
                    let mut state = inner.state.lock().unwrap();
                    let terminal = msg.msg_kind.is_unsubscribe() || msg.api_error.is_some();
                    match state.pending.get(&msg.call_id) {
                        None => Route::Unknown,
                        Some(p) if p.draining => {
                            if terminal {
                                state.pending.remove(&msg.call_id);
                            }
                            Route::Discard
                        }
                        Some(p) => {
                            let tx = p.tx.clone();
                            if terminal || !p.is_subscription {
                                state.pending.remove(&msg.call_id);
                            }
                            Route::Deliver(tx)
                        }
                    }
                };
                match route {
                    Route::Deliver(tx) => {
                        // Receiver may already be gone (dropped Call); fine.
                        let _ = tx.send(msg);
                    }
                    Route::Discard => {
                        debug!(call_id = msg.call_id, "discard result after unsubscribe");
                    }
                    Route::Unknown => {
                        // The stream is corrupt or the server is confused;
                        // neither is recoverable.
                        warn!(call_id = msg.call_id, "reply for unknown call_id");
                        break;
                    }
                }
            }
            Ok(None) => {
                debug!("server closed connection");
                break;
            }
            Err(e) => {
                if !inner.destroyed.load(Ordering::SeqCst) {
                    warn!(error = %e, "read error");
                }
                break;
            }
        }
    }
    inner.destroy();
}

/// Handle for one outstanding call or subscription.
///
/// Dropped handles stop receiving; for a subscription prefer
/// [`unsubscribe`](Call::unsubscribe) so the server stops producing too.
pub struct Call {
    api_name: String,
    call_id: u64,
    is_subscription: bool,
    rx: mpsc::UnboundedReceiver<Message>,
    client: Arc<ClientInner>,
    destroyed: bool,
}

impl Call {
    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Next result.
    ///
    /// `Ok(Some(value))` is the unary result or one pushed subscription
    /// result. `Ok(None)` is a subscription's clean end of stream. A unary
    /// call yields at most one result; afterwards the handle is dead.
    pub async fn result_get(&mut self) -> Result<Option<Value>> {
        if self.destroyed {
            return Err(Error::Disconnected);
        }
        let msg = match self.rx.recv().await {
            Some(m) => m,
            None => {
                self.local_destroy();
                return Err(Error::Disconnected);
            }
        };
        if msg.msg_kind.is_unsubscribe() {
            self.local_destroy();
            return Ok(None);
        }
        if let Some(e) = &msg.api_error {
            self.local_destroy();
            return Err(Error::from_wire(e));
        }
        if !self.is_subscription {
            self.local_destroy();
        }
        match msg.api_result {
            Some(v) => Ok(Some(v)),
            None => {
                self.local_destroy();
                Err(Error::Protocol(format!(
                    "reply missing api_result api={}",
                    self.api_name
                )))
            }
        }
    }

    /// Cancel a subscription. Idempotent; no reply is expected and results
    /// still in flight are discarded.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        if !self.is_subscription {
            return Err(Error::Protocol(format!(
                "not a subscription api={}",
                self.api_name
            )));
        }
        self.destroyed = true;
        self.rx.close();
        // Keep the pending entry in draining state rather than removing it:
        // the server may have pushed results before it sees the cancel, and
        // those must not look like unknown call_ids.
        if let Some(p) = self.client.state.lock().unwrap().pending.get_mut(&self.call_id) {
            p.draining = true;
        }
        self.client.write(&Message::unsubscribe(self.call_id)).await
    }

    fn local_destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.rx.close();
        if !self.client.destroyed.load(Ordering::SeqCst) {
            self.client.state.lock().unwrap().pending.remove(&self.call_id);
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        // Only detach. The pending entry must survive a dropped handle whose
        // reply is still in flight; the read loop removes it at the terminal
        // reply, and removing it here would make that reply look like an
        // unknown call_id.
        self.destroyed = true;
        self.rx.close();
    }
}
