//! Server side: listener, per-connection state, and the message pipeline.
//!
//! Each connection has exactly one outstanding read; every decoded frame is
//! handed to its own task so a slow handler never blocks reception of the
//! next frame. Per-connection state is only ever mutated behind that
//! connection's own locks; `destroy()` is idempotent and drains in-flight
//! messages in reverse creation order, closes the transport, then finalizes
//! the session.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::protocol::{msg_pack, msg_unpack, Side};
use crate::quest::{Attr, AttrScope, AttrSpec, Quest};
use crate::registry::{ApiHandler, Registry, RegistryBuilder};
use crate::stream::{framed, FrameReader, FrameWriter, Stream};
use crate::{Error, Message, MsgKind, Result, AUTH_API_NAME};

/// Deployment parameters, supplied by the caller's configuration layer.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Secret the default [`AuthApi`](crate::AuthApi) compares tokens
    /// against. `None` makes
    /// the default handler permissive.
    pub auth_secret: Option<String>,
}

/// Options for [`Server::serve`].
#[derive(Clone, Default)]
pub struct ListenConfig {
    /// When set, the accept loop polls this flag and returns cleanly once it
    /// is true.
    pub stop: Option<Arc<AtomicBool>>,
}

/// Bound listener for `tcp:host:port` or `unix:/path` addresses.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, String),
}

impl Listener {
    pub async fn new(address: &str) -> Result<Listener> {
        if let Some(addr) = address.strip_prefix("tcp:") {
            Ok(Listener::Tcp(TcpListener::bind(addr).await?))
        } else if let Some(path) = address.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                let _ = std::fs::remove_file(path);
                Ok(Listener::Unix(UnixListener::bind(path)?, path.to_owned()))
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                Err(Error::Protocol("unix sockets unsupported on this platform".into()))
            }
        } else {
            Err(Error::Protocol(format!("invalid address={}", address)))
        }
    }

    /// The bound address in connectable form; lets tests bind port 0.
    pub fn local_address(&self) -> Result<String> {
        match self {
            Listener::Tcp(l) => Ok(format!("tcp:{}", l.local_addr()?)),
            #[cfg(unix)]
            Listener::Unix(_, path) => Ok(format!("unix:{}", path)),
        }
    }

    async fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Stream::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(l, _) => {
                let (stream, _) = l.accept().await?;
                Ok((Stream::Unix(stream), "unix".to_owned()))
            }
        }
    }
}

/// State held on the server bound to one client connection.
///
/// Survives across calls on the connection; not persisted when the
/// connection or server terminates.
pub struct Session {
    values: HashMap<String, Value>,
    on_close: Vec<Box<dyn FnOnce() + Send>>,
    closed: bool,
}

impl Session {
    pub(crate) fn new() -> Self {
        Session {
            values: HashMap::new(),
            on_close: Vec::new(),
            closed: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn take(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Register a hook to run when the connection closes. Hooks run in
    /// reverse attach order.
    pub fn on_close(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_close.push(Box::new(hook));
    }

    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        while let Some(hook) = self.on_close.pop() {
            hook();
        }
        self.values.clear();
    }
}

/// Push channel bound to one in-flight `SUBSCRIBE` request.
///
/// Lets the handler send zero or more results before returning. Dead once
/// the client unsubscribes or the connection is lost.
pub struct Subscription {
    conn: Arc<Connection>,
    call_id: u64,
    ended: Arc<AtomicBool>,
}

impl Subscription {
    pub async fn result_put(&self, api_result: Value) -> Result<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        self.conn
            .write(&Message::reply(
                self.call_id,
                MsgKind::Reply,
                Some(api_result),
                None,
            ))
            .await
    }
}

/// Owns the registry and the attr composition list; accepts connections.
pub struct Server {
    registry: Registry,
    attr_specs: Vec<Box<dyn AttrSpec>>,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Validate the wiring and build the server value.
    ///
    /// Fails before any connection is accepted on duplicate API names
    /// (raised by the builder) or duplicate/reserved attr keys.
    pub fn new(
        registry: RegistryBuilder,
        attr_specs: Vec<Box<dyn AttrSpec>>,
        config: ServerConfig,
    ) -> Result<Server> {
        let mut seen: HashSet<&'static str> = HashSet::from(["session", "subscription"]);
        for spec in &attr_specs {
            if !seen.insert(spec.key()) {
                return Err(Error::Protocol(format!(
                    "duplicate or reserved attr key={}",
                    spec.key()
                )));
            }
        }
        Ok(Server {
            registry: registry.build(config.auth_secret),
            attr_specs,
            next_conn_id: AtomicU64::new(0),
        })
    }

    /// Accept connections until an accept error or, with
    /// [`ListenConfig::stop`], until the flag is raised.
    pub async fn serve(self: Arc<Self>, listener: Listener, config: ListenConfig) -> Result<()> {
        info!(apis = ?self.registry.api_names(), "server start");
        loop {
            let accepted = if let Some(stop) = &config.stop {
                match tokio::time::timeout(Duration::from_millis(100), listener.accept()).await {
                    Ok(r) => r,
                    Err(_) => {
                        if stop.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        continue;
                    }
                }
            } else {
                listener.accept().await
            };
            match accepted {
                Ok((stream, peer)) => {
                    Connection::open(Arc::clone(&self), stream, peer);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Per-socket state. `OPEN` until `destroy()`, which is terminal.
pub(crate) struct Connection {
    id: u64,
    remote_peer: String,
    server: Arc<Server>,
    session: Arc<Mutex<Session>>,
    singletons: Vec<(&'static str, Arc<Mutex<Box<dyn Attr>>>)>,
    writer: Arc<tokio::sync::Mutex<Option<FrameWriter<WriteHalf<Stream>>>>>,
    msgs: Mutex<Vec<Arc<ServerMsg>>>,
    authenticated: AtomicBool,
    destroyed: AtomicBool,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn open(server: Arc<Server>, stream: Stream, remote_peer: String) -> Arc<Connection> {
        let id = server.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (reader, writer) = framed(stream);
        let singletons: Vec<(&'static str, Arc<Mutex<Box<dyn Attr>>>)> = server
            .attr_specs
            .iter()
            .filter(|s| s.scope() == AttrScope::Singleton)
            .map(|s| (s.key(), Arc::new(Mutex::new(s.init()))))
            .collect();
        let conn = Arc::new(Connection {
            id,
            remote_peer,
            server,
            session: Arc::new(Mutex::new(Session::new())),
            singletons,
            writer: Arc::new(tokio::sync::Mutex::new(Some(writer))),
            msgs: Mutex::new(Vec::new()),
            authenticated: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            read_task: Mutex::new(None),
        });
        info!(conn = conn.id, peer = %conn.remote_peer, "open");
        let handle = tokio::spawn(Arc::clone(&conn).read_loop(reader));
        *conn.read_task.lock().unwrap() = Some(handle);
        conn
    }

    async fn read_loop(self: Arc<Connection>, mut reader: FrameReader<ReadHalf<Stream>>) {
        loop {
            if self.destroyed.load(Ordering::SeqCst) {
                break;
            }
            match reader.read_frame().await {
                Ok(Some(frame)) => {
                    let msg = match msg_unpack(&frame, Side::Server) {
                        Ok(m) => m,
                        Err(e) => {
                            // Compromised peer; no reply, just tear the
                            // connection down.
                            warn!(conn = self.id, error = %e, "msg unpack error");
                            break;
                        }
                    };
                    // Register call_id and kind before the task is scheduled
                    // so an UNSUBSCRIBE arriving right behind its SUBSCRIBE
                    // always finds the target.
                    let smsg = Arc::new(ServerMsg::new(
                        Arc::clone(&self),
                        msg.call_id,
                        msg.msg_kind.is_subscribe(),
                    ));
                    self.msgs.lock().unwrap().push(Arc::clone(&smsg));
                    let task_msg = Arc::clone(&smsg);
                    let conn = Arc::clone(&self);
                    let handle = tokio::spawn(async move {
                        task_msg.process(msg).await;
                        conn.remove_msg(&task_msg);
                    });
                    *smsg.task.lock().unwrap() = Some(handle);
                }
                Ok(None) => {
                    debug!(conn = self.id, "peer closed");
                    break;
                }
                Err(e) => {
                    if !self.destroyed.load(Ordering::SeqCst) {
                        warn!(conn = self.id, error = %e, "read error");
                    }
                    break;
                }
            }
        }
        self.destroy();
    }

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

    /// Client-initiated unsubscribe: locate the in-flight SUBSCRIBE with the
    /// matching call_id and tear it down without further replies.
    fn unsubscribe(&self, call_id: u64) {
        let found = {
            let mut msgs = self.msgs.lock().unwrap();
            msgs.iter()
                .position(|m| m.is_subscription && m.call_id == call_id)
                .map(|i| msgs.remove(i))
        };
        match found {
            Some(m) => m.destroy(),
            None => warn!(conn = self.id, call_id, "call_id not found in subscriptions"),
        }
    }

    fn remove_msg(&self, msg: &Arc<ServerMsg>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.msgs.lock().unwrap().retain(|m| !Arc::ptr_eq(m, msg));
    }

    /// Idempotent terminal transition.
    ///
    /// Order matters: drain in-flight messages LIFO, close the transport,
    /// then finalize the session (last, since it calls out of this module).
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(conn = self.id, peer = %self.remote_peer, "close");
        let mut drained = std::mem::take(&mut *self.msgs.lock().unwrap());
        while let Some(m) = drained.pop() {
            m.destroy();
        }
        if let Some(h) = self.read_task.lock().unwrap().take() {
            h.abort();
        }
        let writer = Arc::clone(&self.writer);
        tokio::spawn(async move {
            if let Some(mut w) = writer.lock().await.take() {
                let _ = w.shutdown().await;
            }
        });
        // A panicking handler may have poisoned these locks; close anyway.
        for (key, cell) in self.singletons.iter().rev() {
            debug!(conn = self.id, attr = *key, "attr close");
            cell.lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .on_close();
        }
        self.session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .close();
    }
}

/// One in-flight inbound message, processed in its own task.
struct ServerMsg {
    conn: Arc<Connection>,
    call_id: u64,
    is_subscription: bool,
    ended: Arc<AtomicBool>,
    destroyed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    handler_abort: Mutex<Option<AbortHandle>>,
}

impl ServerMsg {
    fn new(conn: Arc<Connection>, call_id: u64, is_subscription: bool) -> Self {
        ServerMsg {
            conn,
            call_id,
            is_subscription,
            ended: Arc::new(AtomicBool::new(false)),
            destroyed: AtomicBool::new(false),
            task: Mutex::new(None),
            handler_abort: Mutex::new(None),
        }
    }

    async fn process(&self, msg: Message) {
        debug!(
            conn = self.conn.id,
            call_id = msg.call_id,
            api = msg.api_name.as_deref().unwrap_or("-"),
            kind = ?msg.msg_kind,
            "call"
        );
        if msg.msg_kind.is_unsubscribe() {
            self.conn.unsubscribe(msg.call_id);
            return;
        }
        let outcome = match self.validate(&msg) {
            Ok((handler, is_subscription, api_name)) => {
                let rv = self
                    .dispatch(handler, is_subscription, &api_name, msg.api_args.unwrap_or(Value::Null))
                    .await;
                if api_name == AUTH_API_NAME && rv.is_ok() {
                    self.conn.authenticated.store(true, Ordering::SeqCst);
                }
                rv
            }
            Err(e) => Err(e),
        };
        self.reply(msg.call_id, outcome).await;
    }

    /// Shape and capability checks after decode. The auth gate comes before
    /// the registry lookup so an unauthenticated peer cannot probe names.
    fn validate(&self, msg: &Message) -> Result<(Arc<dyn ApiHandler>, bool, String)> {
        let api_name = match &msg.api_name {
            None => return Err(Error::Protocol("missing api_name".into())),
            Some(n) => n.clone(),
        };
        if api_name != AUTH_API_NAME && !self.conn.authenticated.load(Ordering::SeqCst) {
            return Err(Error::Forbidden);
        }
        let entry = match self.conn.server.registry.get(&api_name) {
            None => return Err(Error::NotFound(api_name)),
            Some(e) => e,
        };
        if msg.api_args.is_none() {
            return Err(Error::Protocol(format!("missing api_args api={}", api_name)));
        }
        match (msg.msg_kind, entry.is_subscription) {
            (MsgKind::Subscribe, false) => Err(Error::Kind(format!(
                "non-subscription api={} msg_kind={:?}",
                api_name, msg.msg_kind
            ))),
            (MsgKind::Call, true) => Err(Error::Kind(format!(
                "simple call not for subscription api={}",
                api_name
            ))),
            _ => Ok((Arc::clone(&entry.handler), entry.is_subscription, api_name)),
        }
    }

    /// Run the handler inside a freshly composed quest.
    ///
    /// `Ok(Some(v))` is a unary result; `Ok(None)` is a subscription's clean
    /// end of stream.
    async fn dispatch(
        &self,
        handler: Arc<dyn ApiHandler>,
        is_subscription: bool,
        api_name: &str,
        api_args: Value,
    ) -> Result<Option<Value>> {
        let per_quest: Vec<(&'static str, Box<dyn Attr>)> = self
            .conn
            .server
            .attr_specs
            .iter()
            .filter(|s| s.scope() == AttrScope::PerQuest)
            .map(|s| (s.key(), s.init()))
            .collect();
        let subscription = is_subscription.then(|| Subscription {
            conn: Arc::clone(&self.conn),
            call_id: self.call_id,
            ended: Arc::clone(&self.ended),
        });
        let mut quest = Quest::compose(
            Arc::clone(&self.conn.session),
            &self.conn.singletons,
            per_quest,
            subscription,
            Arc::clone(&self.ended),
        );
        // The handler runs in its own task so a panic stops at the dispatch
        // boundary instead of swallowing the reply. Quest teardown still runs
        // on the panic path, via Quest's drop.
        let task = tokio::spawn(async move {
            let rv = handler.call(&mut quest, api_args).await;
            quest.end(rv.is_ok());
            rv
        });
        *self.handler_abort.lock().unwrap() = Some(task.abort_handle());
        let rv = match task.await {
            Ok(rv) => rv,
            Err(e) if e.is_panic() => {
                warn!(conn = self.conn.id, api = api_name, error = %e, "api handler panicked");
                Err(Error::Call(format!("handler panicked api={}", api_name)))
            }
            // Aborted by unsubscribe or connection teardown; the reply is
            // suppressed either way.
            Err(_) => Err(Error::Disconnected),
        };
        match rv {
            Ok(Some(_)) if is_subscription => Err(Error::Call(format!(
                "non-null return from subscription api={}",
                api_name
            ))),
            Ok(None) if !is_subscription => {
                Err(Error::Call(format!("missing reply api={}", api_name)))
            }
            Ok(rv) => Ok(rv),
            Err(
                e @ (Error::Protocol(_)
                | Error::NotFound(_)
                | Error::Forbidden
                | Error::Kind(_)
                | Error::Call(_)
                | Error::Disconnected),
            ) => Err(e),
            Err(other) => {
                // Summarized for the wire; detail stays in the local log.
                warn!(conn = self.conn.id, api = api_name, error = %other, "api handler failed");
                Err(Error::Call(other.to_string()))
            }
        }
    }

    async fn reply(&self, call_id: u64, outcome: Result<Option<Value>>) {
        if self.destroyed.load(Ordering::SeqCst) || self.conn.destroyed.load(Ordering::SeqCst) {
            // Unsubscribed or torn down mid-flight; nobody is listening.
            return;
        }
        let fatal = matches!(&outcome, Err(e) if e.is_fatal());
        let msg = match outcome {
            Ok(Some(v)) => Message::reply(call_id, MsgKind::Reply, Some(v), None),
            // Clean end of a subscription stream.
            Ok(None) => Message::unsubscribe(call_id),
            Err(e) => Message::reply(call_id, MsgKind::Reply, None, Some(e.to_wire())),
        };
        debug!(conn = self.conn.id, call_id, kind = ?msg.msg_kind, "reply");
        if let Err(e) = self.conn.write(&msg).await {
            if !self.conn.destroyed.load(Ordering::SeqCst) {
                warn!(conn = self.conn.id, call_id, error = %e, "reply write failed");
            }
            self.conn.destroy();
            return;
        }
        if fatal {
            self.conn.destroy();
        }
    }

    /// Cancel this in-flight message: rollback for its quest, no further
    /// replies, waiters released.
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ended.store(true, Ordering::SeqCst);
        if let Some(h) = self.task.lock().unwrap().take() {
            h.abort();
        }
        if let Some(h) = self.handler_abort.lock().unwrap().take() {
            h.abort();
        }
    }
}
