//! TCP transport: accept/dial, handshake, then one read loop per connection
//! that pauses after every delivered frame until the consumer resumes it.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::transport::{
    Decoder, Envelope, Handshake, HandshakeError, LengthPrefixDecoder, NopHandshake, Peer,
    PeerHandler, PeerReader, PeerReaderGuard, Transport, TransportError,
};

/// Decode failures tolerated per connection; one more drops it.
pub const MAX_DECODE_ERRORS: usize = 5;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_INBOUND_CAPACITY: usize = 16;

/// Remote node over an established stream connection.
pub struct TcpPeer {
    remote_addr: String,
    outbound: bool,
    reader: Arc<Mutex<PeerReader>>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    in_flight: AtomicUsize,
    resumed: Notify,
    closed: CancellationToken,
}

impl TcpPeer {
    /// Fails if the remote address can't be read; it is the peer's registry key.
    pub fn from_stream(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?.to_string();
        let (r, w) = stream.into_split();
        Ok(Self::new(remote_addr, outbound, Box::new(r), Box::new(w)))
    }

    /// Peer over arbitrary stream halves (in-memory pipes in tests).
    pub fn new(
        remote_addr: impl Into<String>,
        outbound: bool,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            outbound,
            reader: Arc::new(Mutex::new(BufReader::new(reader))),
            writer: Mutex::new(writer),
            in_flight: AtomicUsize::new(0),
            resumed: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Run a write that takes the writer lock, abandoning it once the peer is
    /// closed so a stalled remote can't pin the lock.
    async fn guarded_write<T>(
        &self,
        write: impl Future<Output = io::Result<T>>,
    ) -> Result<T, TransportError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            res = write => Ok(res?),
        }
    }
}

#[async_trait]
impl Peer for TcpPeer {
    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.guarded_write(async {
            let mut w = self.writer.lock().await;
            w.write_all(bytes).await?;
            w.flush().await
        })
        .await
    }

    async fn send_with_payload(
        &self,
        frame: &[u8],
        payload: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, TransportError> {
        self.guarded_write(async {
            let mut w = self.writer.lock().await;
            w.write_all(frame).await?;
            let n = tokio::io::copy(payload, &mut *w).await?;
            w.flush().await?;
            Ok::<u64, io::Error>(n)
        })
        .await
    }

    async fn reader(&self) -> PeerReaderGuard {
        self.reader.clone().lock_owned().await
    }

    fn resume(&self) {
        let had_pending = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        // A resume with nothing in flight must not leave a stray permit behind.
        if had_pending {
            self.resumed.notify_one();
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        // In-flight writes see the cancellation and drop the lock.
        let mut w = self.writer.lock().await;
        match w.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct TcpTransportOpts {
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub decoder: Arc<dyn Decoder>,
    pub inbound_capacity: usize,
}

impl TcpTransportOpts {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(NopHandshake),
            decoder: Arc::new(LengthPrefixDecoder::default()),
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

/// TCP implementation of [`Transport`].
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    opts: TcpTransportOpts,
    handler: RwLock<Option<Arc<dyn PeerHandler>>>,
    inbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: Mutex<mpsc::Receiver<Envelope>>,
    local_addr: SyncMutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(opts.inbound_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                opts,
                handler: RwLock::new(None),
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                local_addr: SyncMutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Bound socket address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn set_handler(&self, handler: Arc<dyn PeerHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    fn listen_addr(&self) -> Option<String> {
        self.local_addr().map(|a| a.to_string())
    }

    async fn dial(&self, addr: &str) -> Result<(), TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Dial {
                addr: addr.to_string(),
                source,
            })?;
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.handle_conn(stream, true).await });
        Ok(())
    }

    async fn listen_and_accept(&self) -> Result<(), TransportError> {
        let addr = &self.inner.opts.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local);
        tracing::info!(addr = %local, "tcp transport listening");

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.accept_loop(listener).await });
        Ok(())
    }

    async fn consume(&self) -> Option<Envelope> {
        self.inner.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.shutdown.cancel();
        Ok(())
    }
}

impl Inner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, _)) => {
                    let inner = self.clone();
                    tokio::spawn(async move { inner.handle_conn(stream, false).await });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "tcp accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        tracing::debug!("accept loop stopped");
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, outbound: bool) {
        let _ = stream.set_nodelay(true);
        let peer = match TcpPeer::from_stream(stream, outbound) {
            Ok(peer) => Arc::new(peer),
            Err(e) => {
                tracing::warn!(error = %e, outbound, "no remote address, dropping connection");
                return;
            }
        };
        self.run_peer(peer).await;
    }

    async fn run_peer(&self, peer: Arc<TcpPeer>) {
        let addr = peer.remote_addr().to_string();
        let handler = self.handler.read().clone();

        if let Err(e) = self.establish(&peer, handler.as_ref()).await {
            tracing::warn!(peer = %addr, error = %e, "dropping connection");
            let _ = peer.close().await;
            return;
        }
        tracing::info!(peer = %addr, outbound = peer.is_outbound(), "peer connected");

        self.read_loop(&peer).await;

        let _ = peer.close().await;
        if let Some(h) = &handler {
            let handle: Arc<dyn Peer> = peer.clone();
            h.on_peer_closed(&handle);
        }
        tracing::info!(peer = %addr, "dropped peer connection");
    }

    /// Handshake under a timeout, then hand the peer to the handler.
    async fn establish(
        &self,
        peer: &Arc<TcpPeer>,
        handler: Option<&Arc<dyn PeerHandler>>,
    ) -> Result<(), TransportError> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.opts.handshake.perform(&**peer))
            .await
            .unwrap_or(Err(HandshakeError::Timeout))?;
        if let Some(h) = handler {
            h.on_peer(peer.clone())?;
        }
        Ok(())
    }

    async fn read_loop(&self, peer: &Arc<TcpPeer>) {
        let mut failures = 0usize;
        loop {
            let decoded = tokio::select! {
                _ = peer.closed.cancelled() => return,
                res = async {
                    let mut r = peer.reader.lock().await;
                    self.opts.decoder.decode(&mut r).await
                } => res,
            };
            let payload = match decoded {
                Ok(p) => p,
                Err(e) if e.is_closed() => return,
                Err(e) => {
                    failures += 1;
                    if failures > MAX_DECODE_ERRORS {
                        tracing::warn!(peer = %peer.remote_addr, error = %e, "too many decode errors");
                        return;
                    }
                    tracing::warn!(peer = %peer.remote_addr, error = %e, failures, "decode error");
                    continue;
                }
            };

            peer.in_flight.fetch_add(1, Ordering::SeqCst);
            let envelope = Envelope {
                from: peer.remote_addr.clone(),
                payload,
                origin: peer.clone(),
            };
            tokio::select! {
                _ = peer.closed.cancelled() => return,
                sent = self.inbound_tx.send(envelope) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            tracing::debug!(peer = %peer.remote_addr, "frame delivered, waiting for resume");
            tokio::select! {
                _ = peer.closed.cancelled() => return,
                _ = peer.resumed.notified() => {}
            }
        }
    }
}
