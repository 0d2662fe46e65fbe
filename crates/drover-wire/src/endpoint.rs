//! Transport endpoints — one replying coordinator, many requesting workers.
//!
//! The coordinator binds a [`ReplyEndpoint`] and drains it one request at a
//! time; each request arrives paired with a [`ReplyHandle`] that must be
//! consumed to answer, which makes double replies unrepresentable. Worker
//! processes hold a [`RequestEndpoint`] whose `request` call sends one
//! frame and blocks until the reply frame arrives, so per connection the
//! exchange is always strictly alternating.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use flate2::Compression;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::codec::{self, DEFAULT_COMPRESSION};
use crate::error::{WireError, WireResult};
use crate::message::{Reply, Request};

const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Tuning knobs shared by both endpoint ends.
#[derive(Debug, Clone)]
pub struct WireOptions {
    /// zlib level applied to frames that do not specify their own.
    pub compression: u32,
    /// Requests buffered ahead of the dispatch loop.
    pub inbox_capacity: usize,
}

impl Default for WireOptions {
    fn default() -> Self {
        Self {
            compression: DEFAULT_COMPRESSION,
            inbox_capacity: 128,
        }
    }
}

impl WireOptions {
    pub fn with_compression(mut self, level: u32) -> Self {
        self.compression = level;
        self
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }
}

/// Coordinator-side endpoint: accepts worker connections and yields their
/// requests in arrival order, each paired with its reply handle.
pub struct ReplyEndpoint {
    local_addr: SocketAddr,
    inbox: mpsc::Receiver<(Request, ReplyHandle)>,
    accept_task: JoinHandle<()>,
}

impl ReplyEndpoint {
    /// Bind and start accepting worker connections.
    pub async fn bind<A: ToSocketAddrs>(addr: A, options: WireOptions) -> WireResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(options.inbox_capacity);
        let level = Compression::new(options.compression);
        let accept_task = tokio::spawn(accept_loop(listener, tx, level));
        debug!(addr = %local_addr, "reply endpoint bound");
        Ok(Self {
            local_addr,
            inbox: rx,
            accept_task,
        })
    }

    /// The address the endpoint actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive the next request from any connected worker.
    ///
    /// Cancel-safe, so it can sit in a `select!` arm next to a timer.
    pub async fn recv(&mut self) -> WireResult<(Request, ReplyHandle)> {
        self.inbox.recv().await.ok_or(WireError::ConnectionClosed)
    }
}

impl Drop for ReplyEndpoint {
    fn drop(&mut self) {
        // Connection tasks notice the closed inbox and unwind on their own.
        self.accept_task.abort();
    }
}

/// One-shot handle for answering a single request.
///
/// Dropping the handle without replying closes that worker's connection,
/// which the worker surfaces as a transport error.
pub struct ReplyHandle {
    tx: oneshot::Sender<(Reply, Compression)>,
    level: Compression,
}

impl ReplyHandle {
    /// Answer with the endpoint's default compression level.
    pub fn reply(self, reply: Reply) -> WireResult<()> {
        let level = self.level;
        self.reply_with(reply, level)
    }

    /// Answer with an explicit zlib level for this frame only.
    pub fn reply_with(self, reply: Reply, level: Compression) -> WireResult<()> {
        self.tx
            .send((reply, level))
            .map_err(|_| WireError::ConnectionClosed)
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<(Request, ReplyHandle)>,
    level: Compression,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "worker connected");
                tokio::spawn(serve_connection(stream, peer, tx.clone(), level));
            }
            Err(e) => {
                warn!(error = %e, "accept failed, retrying");
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<(Request, ReplyHandle)>,
    level: Compression,
) {
    let mut framed = Framed::new(stream, codec::frame_codec());
    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                warn!(%peer, error = %e, "framing error, closing connection");
                break;
            }
        };
        let request: Request = match codec::decode(&frame) {
            Ok(r) => r,
            // Corrupt payload: drop the message, keep the connection.
            Err(e) => {
                warn!(%peer, error = %e, "dropping undecodable message");
                continue;
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let handle = ReplyHandle {
            tx: reply_tx,
            level,
        };
        if tx.send((request, handle)).await.is_err() {
            // Endpoint dropped; stop serving.
            break;
        }
        let (reply, level) = match reply_rx.await {
            Ok(r) => r,
            Err(_) => {
                warn!(%peer, "request dropped without a reply, closing connection");
                break;
            }
        };
        let payload = match codec::encode(&reply, level) {
            Ok(p) => p,
            Err(e) => {
                warn!(%peer, error = %e, "failed to encode reply, closing connection");
                break;
            }
        };
        if let Err(e) = framed.send(Bytes::from(payload)).await {
            warn!(%peer, error = %e, "failed to send reply");
            break;
        }
    }
    debug!(%peer, "worker disconnected");
}

/// Worker-side endpoint: a single connection with strict send-then-receive.
pub struct RequestEndpoint {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    level: Compression,
}

impl RequestEndpoint {
    /// Connect to the coordinator.
    pub async fn connect<A: ToSocketAddrs>(addr: A, options: WireOptions) -> WireResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, codec::frame_codec()),
            level: Compression::new(options.compression),
        })
    }

    /// Send one request and wait for its reply.
    pub async fn request(&mut self, request: &Request) -> WireResult<Reply> {
        let level = self.level;
        self.request_with(request, level).await
    }

    /// Send one request at an explicit zlib level and wait for its reply.
    pub async fn request_with(
        &mut self,
        request: &Request,
        level: Compression,
    ) -> WireResult<Reply> {
        let payload = codec::encode(request, level)?;
        self.framed.send(Bytes::from(payload)).await?;
        match self.framed.next().await {
            Some(Ok(frame)) => codec::decode(&frame),
            Some(Err(e)) => Err(WireError::Io(e)),
            None => Err(WireError::ConnectionClosed),
        }
    }
}
