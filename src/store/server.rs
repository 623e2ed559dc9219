//! Store Server
//!
//! Serves a `DataTree` to `RemoteStore` clients over mutually
//! authenticated TLS. Sessions outlive their connection for the session
//! timeout so a client can reconnect without losing its ephemeral paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::protocol::{is_disconnect, read_frame, write_frame, Frame, Request, Response};
use super::{DataTree, StoreEvent};
use crate::error::{Error, Result};
use crate::paths;

/// Store server
#[derive(Clone)]
pub struct StoreServer {
    tree: Arc<DataTree>,
    max_session_timeout: Duration,
    shutdown: CancellationToken,
}

impl StoreServer {
    pub fn new(tree: Arc<DataTree>, max_session_timeout: Duration) -> Self {
        Self {
            tree,
            max_session_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// The served tree
    pub fn tree(&self) -> &Arc<DataTree> {
        &self.tree
    }

    /// Accept TLS clients until stopped
    pub async fn serve(&self, listener: TcpListener, acceptor: TlsAcceptor) -> Result<()> {
        tracing::info!("Store server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let server = self.clone();
                            let acceptor = acceptor.clone();

                            tokio::spawn(async move {
                                let peer = addr.to_string();
                                if let Err(e) = socket.set_nodelay(true) {
                                    tracing::debug!("Could not set nodelay for {}: {}", peer, e);
                                }
                                let stream = match acceptor.accept(socket).await {
                                    Ok(stream) => stream,
                                    Err(e) => {
                                        tracing::warn!("TLS handshake with {} failed: {}", peer, e);
                                        return;
                                    }
                                };
                                if let Err(e) = server.serve_connection(stream, &peer).await {
                                    tracing::warn!("Connection error from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        tracing::info!("Store server stopped");
        Ok(())
    }

    /// Stop accepting and drop every open connection
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Run the protocol on one established stream
    pub async fn serve_connection<S>(&self, stream: S, peer: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let (xid, session_id, requested_timeout, read_only) = match read_frame(&mut reader).await? {
            Frame::Request {
                xid,
                request:
                    Request::Connect {
                        session_id,
                        session_timeout_ms,
                        read_only,
                    },
            } => (xid, session_id, session_timeout_ms, read_only),
            other => {
                return Err(Error::Protocol(format!(
                    "expected Connect, got {}",
                    other.type_name()
                )))
            }
        };

        let session = if session_id == 0 {
            let timeout = self.negotiate_timeout(requested_timeout);
            let id = self.tree.open_session(read_only, timeout);
            tracing::info!("New session {:#x} from {} (timeout {:?})", id, peer, timeout);
            (id, timeout)
        } else {
            match self.tree.attach_session(session_id) {
                Ok(timeout) => {
                    tracing::info!("Session {:#x} resumed from {}", session_id, peer);
                    (session_id, timeout)
                }
                Err(e) => {
                    tracing::info!("Refusing expired session {:#x} from {}", session_id, peer);
                    let response = Response::from_error(&e);
                    write_frame(&mut writer, &Frame::Response { xid, response }).await?;
                    return Ok(());
                }
            }
        };
        let (session, timeout) = session;

        let connected = Response::Connected {
            session_id: session,
            session_timeout_ms: timeout.as_millis() as u64,
        };
        write_frame(&mut writer, &Frame::Response { xid, response: connected }).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let writer_peer = peer.to_string();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::debug!("Write to {} failed: {}", writer_peer, e);
                    break;
                }
            }
        });

        let mut watches: HashMap<u64, JoinHandle<()>> = HashMap::new();
        let closed = loop {
            let frame = tokio::select! {
                frame = read_frame(&mut reader) => frame,
                _ = self.shutdown.cancelled() => break false,
            };

            let (xid, request) = match frame {
                Ok(Frame::Request { xid, request }) => (xid, request),
                Ok(other) => {
                    tracing::warn!("Unexpected {} frame from {}", other.type_name(), peer);
                    break false;
                }
                Err(e) if is_disconnect(&e) => break false,
                Err(e) => {
                    tracing::warn!("Error reading frame from {}: {}", peer, e);
                    break false;
                }
            };
            tracing::trace!("Received {} from {}", request.type_name(), peer);

            let response = match request {
                Request::Close => {
                    self.tree.close_session(session);
                    tracing::info!("Session {:#x} closed by {}", session, peer);
                    let _ = tx.send(Frame::Response { xid, response: Response::Ok });
                    break true;
                }
                Request::Watch { watch_id, prefix } => {
                    let forwarder = self.spawn_forwarder(watch_id, prefix, tx.clone());
                    if let Some(previous) = watches.insert(watch_id, forwarder) {
                        previous.abort();
                    }
                    Response::Ok
                }
                Request::Unwatch { watch_id } => {
                    if let Some(forwarder) = watches.remove(&watch_id) {
                        forwarder.abort();
                    }
                    Response::Ok
                }
                Request::Connect { .. } => {
                    Response::from_error(&Error::Protocol("session already established".into()))
                }
                other => self.execute(session, other),
            };

            if tx.send(Frame::Response { xid, response }).is_err() {
                break false;
            }
        };

        for (_, forwarder) in watches.drain() {
            forwarder.abort();
        }
        drop(tx);
        let _ = writer_task.await;

        if !closed {
            self.schedule_expiry(session);
        }
        Ok(())
    }

    fn negotiate_timeout(&self, requested_ms: u64) -> Duration {
        if requested_ms == 0 {
            return self.max_session_timeout;
        }
        Duration::from_millis(requested_ms).min(self.max_session_timeout)
    }

    fn schedule_expiry(&self, session: u64) {
        let Some((generation, timeout)) = self.tree.detach_session(session) else {
            return;
        };
        tracing::debug!("Session {:#x} detached, expires in {:?}", session, timeout);

        let tree = self.tree.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if tree.expire_detached(session, generation) {
                tracing::info!("Session {:#x} expired", session);
            }
        });
    }

    fn spawn_forwarder(
        &self,
        watch_id: u64,
        prefix: String,
        tx: mpsc::UnboundedSender<Frame>,
    ) -> JoinHandle<()> {
        // Subscribe before replying so no event after the Ok is missed
        let mut events = BroadcastStream::new(self.tree.subscribe());
        tokio::spawn(async move {
            while let Some(item) = events.next().await {
                let event = match item {
                    Ok(event) if paths::is_under(&event.path, &prefix) => event,
                    Ok(_) => continue,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::warn!("Watch {} on {} lagged by {} events", watch_id, prefix, missed);
                        StoreEvent::resync(&prefix)
                    }
                };
                if tx.send(Frame::Event { watch_id, event }).is_err() {
                    break;
                }
            }
        })
    }

    fn execute(&self, session: u64, request: Request) -> Response {
        let tree = &self.tree;
        let result = match request {
            Request::Create {
                path,
                data,
                mode,
                make_parents,
            } => tree
                .create(session, &path, data, mode, make_parents)
                .map(|path| Response::Created { path }),
            Request::Get { path } => tree
                .get(session, &path)
                .map(|(data, stat)| Response::Data { data, stat }),
            Request::Exists { path } => tree
                .exists(session, &path)
                .map(|stat| Response::Exists { stat }),
            Request::Set {
                path,
                data,
                version,
            } => tree
                .set(session, &path, data, version)
                .map(|stat| Response::Stat { stat }),
            Request::Delete { path, recursive } => {
                tree.delete(session, &path, recursive).map(|_| Response::Ok)
            }
            Request::Children { path } => tree
                .children(session, &path)
                .map(|children| Response::Children { children }),
            Request::Ping => Ok(Response::Pong),
            other => Err(Error::Protocol(format!(
                "unexpected {} request",
                other.type_name()
            ))),
        };
        result.unwrap_or_else(|e| Response::from_error(&e))
    }
}
