//! Remote Store Client
//!
//! Talks to a `StoreServer` over a single multiplexed connection. The
//! connection is re-established in the background with the same session
//! while the server still holds it; session state changes are published
//! on a watch channel:
//!
//! - connection drop: `Suspended`, in-flight requests fail with
//!   `ConnectionLoss`
//! - reconnect within the session timeout: `Connected`, watches are
//!   re-registered and receive a `Resync`
//! - session timeout elapsed or server refused the session: `Lost`, then a
//!   fresh session is opened

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use super::protocol::{read_frame, write_frame, ErrorCode, Frame, Request, Response};
use super::{CreateMode, SessionState, Stat, Store, StoreEvent, Watcher};
use crate::config::{CoordinationConfig, Endpoint, TlsConfig};
use crate::error::{Error, Result};
use crate::tls;

const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Byte stream a store connection runs over
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedStream = Box<dyn Transport>;

/// Opens transport streams to store servers
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: &Endpoint) -> Result<BoxedStream>;
}

/// Dials store servers over TCP + mutual TLS
pub struct TlsDialer {
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TlsDialer {
    pub fn new(tls: &TlsConfig, connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            connector: tls::connector(tls)?,
            connect_timeout,
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<BoxedStream> {
        let address = endpoint.to_string();
        let tcp = match timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address)),
        };
        tcp.set_nodelay(true)?;

        let server_name = rustls::pki_types::ServerName::try_from(endpoint.host.clone())
            .map_err(|e| Error::Tls(format!("invalid server name {}: {}", endpoint.host, e)))?;

        let stream = match timeout(self.connect_timeout, self.connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address,
                    reason: format!("TLS handshake failed: {}", e),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address)),
        };
        Ok(Box::new(stream))
    }
}

/// Client session settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub read_only: bool,
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            session_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &CoordinationConfig) -> Self {
        Self {
            read_only: config.read_only,
            session_timeout: config.session_timeout(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Endpoints {
    list: Vec<Endpoint>,
    next: usize,
    chroot: String,
}

impl Endpoints {
    fn new(list: Vec<Endpoint>) -> Self {
        let chroot = list
            .iter()
            .map(|e| e.chroot.trim_end_matches('/'))
            .find(|c| !c.is_empty())
            .unwrap_or_default()
            .to_string();
        Self { list, next: 0, chroot }
    }

    /// Every endpoint once, starting one further along on each call
    fn rotation(&mut self) -> Vec<Endpoint> {
        if self.list.is_empty() {
            return Vec::new();
        }
        let start = self.next % self.list.len();
        self.next = self.next.wrapping_add(1);
        self.list[start..]
            .iter()
            .chain(self.list[..start].iter())
            .cloned()
            .collect()
    }
}

struct WatchEntry {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

struct Connection {
    reader: ReadHalf<BoxedStream>,
    writer: WriteHalf<BoxedStream>,
    endpoint: String,
}

struct Shared {
    options: ClientOptions,
    dialer: Arc<dyn Dialer>,
    endpoints: Mutex<Endpoints>,
    session_id: AtomicU64,
    state: watch::Sender<SessionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    watches: Mutex<HashMap<u64, WatchEntry>>,
    last_seen: Mutex<Instant>,
    next_xid: AtomicU64,
    next_watch: AtomicU64,
    closing: AtomicBool,
    cancel: CancellationToken,
}

/// Store session held with a remote `StoreServer`
pub struct RemoteStore {
    shared: Arc<Shared>,
}

impl RemoteStore {
    /// Open a session; fails if none of the endpoints can be reached
    pub async fn connect(
        endpoints: Vec<Endpoint>,
        dialer: Arc<dyn Dialer>,
        options: ClientOptions,
    ) -> Result<Self> {
        let (state, _) = watch::channel(SessionState::Suspended);
        let shared = Arc::new(Shared {
            options,
            dialer,
            endpoints: Mutex::new(Endpoints::new(endpoints)),
            session_id: AtomicU64::new(0),
            state,
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(Instant::now()),
            next_xid: AtomicU64::new(1),
            next_watch: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let connection = shared.establish().await?;
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(shared.clone().run(connection, ready_tx));
        // Requests may be issued as soon as this returns
        let _ = ready_rx.await;

        Ok(Self { shared })
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn abs(&self, path: &str) -> String {
        let endpoints = guard(&self.endpoints);
        if endpoints.chroot.is_empty() {
            path.to_string()
        } else if path == "/" {
            endpoints.chroot.clone()
        } else {
            format!("{}{}", endpoints.chroot, path)
        }
    }

    fn rel(&self, path: &str) -> String {
        let endpoints = guard(&self.endpoints);
        let chroot = endpoints.chroot.as_str();
        if chroot.is_empty() {
            return path.to_string();
        }
        match path.strip_prefix(chroot) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => path.to_string(),
        }
    }

    fn expire_session(&self, reason: &str) {
        let previous = self.session_id.swap(0, Ordering::SeqCst);
        if previous != 0 {
            tracing::warn!("Session {:#x} lost: {}", previous, reason);
        }
        self.state.send_replace(SessionState::Lost);
    }

    async fn handshake(&self, endpoint: &Endpoint) -> Result<Connection> {
        let stream = self.dialer.dial(endpoint).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let session_id = self.session_id.load(Ordering::SeqCst);
        let connect = Frame::Request {
            xid: 0,
            request: Request::Connect {
                session_id,
                session_timeout_ms: self.options.session_timeout.as_millis() as u64,
                read_only: self.options.read_only,
            },
        };
        let exchange = async {
            write_frame(&mut writer, &connect).await?;
            read_frame(&mut reader).await
        };
        let frame = timeout(self.options.connect_timeout, exchange)
            .await
            .map_err(|_| Error::ConnectionTimeout(endpoint.to_string()))??;

        match frame {
            Frame::Response {
                response: Response::Connected { session_id: id, session_timeout_ms },
                ..
            } => {
                self.session_id.store(id, Ordering::SeqCst);
                *guard(&self.last_seen) = Instant::now();
                if id == session_id {
                    tracing::info!("Resumed session {:#x} with {}", id, endpoint);
                } else {
                    tracing::info!(
                        "Established session {:#x} with {} (timeout {}ms)",
                        id,
                        endpoint,
                        session_timeout_ms
                    );
                }
                Ok(Connection {
                    reader,
                    writer,
                    endpoint: endpoint.to_string(),
                })
            }
            Frame::Response {
                response: Response::Error { code, message },
                ..
            } => Err(code.into_error(message)),
            other => Err(Error::Protocol(format!(
                "expected Connected, got {}",
                other.type_name()
            ))),
        }
    }

    /// Try each endpoint once
    async fn establish(&self) -> Result<Connection> {
        let candidates = guard(&self.endpoints).rotation();
        if candidates.is_empty() {
            return Err(Error::Config("no coordination servers configured".into()));
        }

        let mut last_error = Error::ConnectionLoss;
        for endpoint in candidates {
            let result = match self.handshake(&endpoint).await {
                Err(Error::SessionExpired) => {
                    self.expire_session("expired by the server");
                    self.handshake(&endpoint).await
                }
                other => other,
            };
            match result {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    tracing::debug!("Connection attempt to {} failed: {}", endpoint, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn run(self: Arc<Self>, mut connection: Connection, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);
        loop {
            self.serve(connection, ready.take()).await;
            guard(&self.pending).clear();
            if self.cancel.is_cancelled() || self.closing.load(Ordering::SeqCst) {
                break;
            }

            if *self.state.borrow() != SessionState::Lost {
                self.state.send_replace(SessionState::Suspended);
            }
            let lost_at = Instant::now() + self.options.session_timeout;
            let mut backoff = MIN_BACKOFF;

            connection = loop {
                if self.session_id.load(Ordering::SeqCst) != 0 && Instant::now() >= lost_at {
                    self.expire_session("session timeout elapsed while disconnected");
                }
                match self.establish().await {
                    Ok(connection) => break connection,
                    Err(e) => tracing::debug!("Reconnect failed: {}", e),
                }

                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
                tokio::select! {
                    _ = tokio::time::sleep(backoff + jitter) => {}
                    _ = self.cancel.cancelled() => return,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            };
        }
        self.state.send_replace(SessionState::Lost);
    }

    async fn serve(self: &Arc<Self>, connection: Connection, ready: Option<oneshot::Sender<()>>) {
        let Connection {
            mut reader,
            mut writer,
            endpoint,
        } = connection;
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

        {
            let watches = guard(&self.watches);
            for (watch_id, entry) in watches.iter() {
                let _ = tx.send(Frame::Request {
                    xid: 0,
                    request: Request::Watch {
                        watch_id: *watch_id,
                        prefix: entry.prefix.clone(),
                    },
                });
            }
            *guard(&self.outbound) = Some(tx.clone());
            // Anything could have changed while we were away
            for entry in watches.values() {
                let _ = entry.tx.send(StoreEvent::resync(&self.rel(&entry.prefix)));
            }
        }
        self.state.send_replace(SessionState::Connected);
        if let Some(ready) = ready {
            let _ = ready.send(());
        }

        let shared = self.clone();
        let mut reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => shared.dispatch(frame),
                    Err(e) => return e,
                }
            }
        });

        let ping_every = self.options.session_timeout / 3;
        let dead_after = ping_every * 2;
        let mut ping = tokio::time::interval(ping_every);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = &mut reader_task => {
                    match result {
                        Ok(e) => tracing::warn!("Connection to {} lost: {}", endpoint, e),
                        Err(e) => tracing::warn!("Connection reader for {} failed: {}", endpoint, e),
                    }
                    break;
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        tracing::warn!("Write to {} failed: {}", endpoint, e);
                        break;
                    }
                }
                _ = ping.tick() => {
                    let silent = guard(&self.last_seen).elapsed();
                    if silent > dead_after {
                        tracing::warn!("No response from {} in {:?}", endpoint, silent);
                        break;
                    }
                    let frame = Frame::Request { xid: 0, request: Request::Ping };
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        tracing::warn!("Ping to {} failed: {}", endpoint, e);
                        break;
                    }
                }
            }
        }

        *guard(&self.outbound) = None;
        reader_task.abort();
    }

    fn dispatch(&self, frame: Frame) {
        *guard(&self.last_seen) = Instant::now();
        match frame {
            // xid 0 carries pings and watch re-registration
            Frame::Response { xid: 0, .. } => {}
            Frame::Response { xid, response } => {
                if let Some(waiter) = guard(&self.pending).remove(&xid) {
                    let _ = waiter.send(response);
                }
            }
            Frame::Event { watch_id, mut event } => {
                event.path = self.rel(&event.path);
                if let Some(entry) = guard(&self.watches).get(&watch_id) {
                    let _ = entry.tx.send(event);
                }
            }
            Frame::Request { request, .. } => {
                tracing::warn!("Ignoring unexpected {} from server", request.type_name());
            }
        }
    }

    fn send_oneway(&self, request: Request) {
        if let Some(outbound) = guard(&self.outbound).as_ref() {
            let _ = outbound.send(Frame::Request { xid: 0, request });
        }
    }

    async fn request(&self, request: Request) -> Result<Response> {
        if self.options.read_only && request.is_write() {
            return Err(Error::ReadOnly);
        }
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let xid = self.next_xid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        guard(&self.pending).insert(xid, tx);

        let sent = guard(&self.outbound)
            .as_ref()
            .map(|outbound| outbound.send(Frame::Request { xid, request }).is_ok())
            .unwrap_or(false);
        if !sent {
            guard(&self.pending).remove(&xid);
            return Err(Error::ConnectionLoss);
        }

        match timeout(self.options.request_timeout, rx).await {
            Ok(Ok(Response::Error { code, message })) => {
                if code == ErrorCode::SessionExpired {
                    self.expire_session("rejected by the server");
                }
                Err(code.into_error(self.rel(&message)))
            }
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ConnectionLoss),
            Err(_) => {
                guard(&self.pending).remove(&xid);
                Err(Error::ConnectionTimeout(format!("request {}", xid)))
            }
        }
    }
}

fn unexpected<T>(response: Response) -> Result<T> {
    Err(Error::Protocol(format!(
        "unexpected {} response",
        response.type_name()
    )))
}

#[async_trait]
impl Store for RemoteStore {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        make_parents: bool,
    ) -> Result<String> {
        let request = Request::Create {
            path: self.shared.abs(path),
            data,
            mode,
            make_parents,
        };
        match self.shared.request(request).await? {
            Response::Created { path } => Ok(self.shared.rel(&path)),
            other => unexpected(other),
        }
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        let request = Request::Get { path: self.shared.abs(path) };
        match self.shared.request(request).await? {
            Response::Data { data, stat } => Ok((data, stat)),
            other => unexpected(other),
        }
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        let request = Request::Exists { path: self.shared.abs(path) };
        match self.shared.request(request).await? {
            Response::Exists { stat } => Ok(stat),
            other => unexpected(other),
        }
    }

    async fn set(&self, path: &str, data: Vec<u8>, version: Option<u32>) -> Result<Stat> {
        let request = Request::Set {
            path: self.shared.abs(path),
            data,
            version,
        };
        match self.shared.request(request).await? {
            Response::Stat { stat } => Ok(stat),
            other => unexpected(other),
        }
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let request = Request::Delete {
            path: self.shared.abs(path),
            recursive,
        };
        match self.shared.request(request).await? {
            Response::Ok => Ok(()),
            other => unexpected(other),
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let request = Request::Children { path: self.shared.abs(path) };
        match self.shared.request(request).await? {
            Response::Children { children } => Ok(children),
            other => unexpected(other),
        }
    }

    async fn watch(&self, prefix: &str) -> Result<Watcher> {
        let shared = &self.shared;
        let watch_id = shared.next_watch.fetch_add(1, Ordering::SeqCst);
        let server_prefix = shared.abs(prefix);
        let (tx, rx) = mpsc::unbounded_channel();
        guard(&shared.watches).insert(
            watch_id,
            WatchEntry {
                prefix: server_prefix.clone(),
                tx,
            },
        );

        let registered = shared
            .request(Request::Watch {
                watch_id,
                prefix: server_prefix,
            })
            .await;
        match registered {
            Ok(Response::Ok) => {}
            Ok(other) => {
                guard(&shared.watches).remove(&watch_id);
                return unexpected(other);
            }
            Err(e) => {
                guard(&shared.watches).remove(&watch_id);
                return Err(e);
            }
        }

        let weak: Weak<Shared> = Arc::downgrade(shared);
        Ok(Watcher::from_channel(prefix, rx, move || {
            if let Some(shared) = weak.upgrade() {
                guard(&shared.watches).remove(&watch_id);
                shared.send_oneway(Request::Unwatch { watch_id });
            }
        }))
    }

    fn session_id(&self) -> u64 {
        self.shared.session_id.load(Ordering::SeqCst)
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    fn set_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<()> {
        if endpoints.is_empty() {
            return Err(Error::Config("no coordination servers configured".into()));
        }
        *guard(&self.shared.endpoints) = Endpoints::new(endpoints);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Ok(());
        }
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.shared.request(Request::Close).await {
            tracing::debug!("Close request failed: {}", e);
        }
        self.shared.cancel.cancel();
        guard(&self.shared.watches).clear();
        self.shared.session_id.store(0, Ordering::SeqCst);
        self.shared.state.send_replace(SessionState::Lost);
        Ok(())
    }
}
