//! File server: peer registry, bootstrap dialing, broadcast and the dispatch loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use crate::path::PathTransform;
use crate::protocol::{Message, Payload};
use crate::store::{Store, StoreError};
use crate::transport::{Envelope, Peer, PeerHandler, Transport, TransportError};
use crate::wire::{self, FrameEncodeError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("send to {addr} failed: {source}")]
    Broadcast {
        addr: String,
        source: TransportError,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("payload for {key} ended after {received} of {expected} bytes")]
    ShortPayload {
        key: String,
        expected: u64,
        received: u64,
    },
}

/// Connected peers keyed by remote address. The lock is never held across I/O;
/// callers get clones of the peer handles.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Arc<dyn Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: Arc<dyn Peer>) {
        let addr = peer.remote_addr().to_string();
        self.peers.lock().insert(addr, peer);
    }

    pub fn remove(&self, addr: &str) -> Option<Arc<dyn Peer>> {
        self.peers.lock().remove(addr)
    }

    pub fn get(&self, addr: &str) -> Option<Arc<dyn Peer>> {
        self.peers.lock().get(addr).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.peers.lock().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.lock().drain().map(|(_, p)| p).collect()
    }
}

impl PeerHandler for PeerRegistry {
    /// Registers `peer`. An open connection already registered under the same
    /// address is kept and the newcomer is rejected.
    fn on_peer(&self, peer: Arc<dyn Peer>) -> Result<(), TransportError> {
        let addr = peer.remote_addr().to_string();
        {
            let mut peers = self.peers.lock();
            if peers.get(&addr).is_some_and(|p| !p.is_closed()) {
                return Err(TransportError::Rejected(format!("{addr} is already connected")));
            }
            peers.insert(addr.clone(), peer);
        }
        tracing::info!(peer = %addr, "connected with remote");
        Ok(())
    }

    /// Removes the entry only if it is still this connection.
    fn on_peer_closed(&self, peer: &Arc<dyn Peer>) {
        let addr = peer.remote_addr();
        let mut peers = self.peers.lock();
        if peers.get(addr).is_some_and(|p| Arc::ptr_eq(p, peer)) {
            peers.remove(addr);
            tracing::debug!(peer = %addr, "peer removed from registry");
        }
    }
}

pub struct FileServerOpts {
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    pub transport: Arc<dyn Transport>,
    /// Empty entries are skipped.
    pub bootstrap_nodes: Vec<String>,
}

/// Coordinator for one node. Wrap in an `Arc` to call [`FileServer::stop`]
/// while [`FileServer::start`] is running.
pub struct FileServer {
    transport: Arc<dyn Transport>,
    bootstrap_nodes: Vec<String>,
    registry: Arc<PeerRegistry>,
    store: Store,
    stop_tx: watch::Sender<bool>,
}

impl FileServer {
    /// Builds the store and registers this server's peer registry with the transport.
    pub fn new(opts: FileServerOpts) -> Self {
        let registry = Arc::new(PeerRegistry::new());
        opts.transport.set_handler(registry.clone());
        let (stop_tx, _) = watch::channel(false);
        Self {
            transport: opts.transport,
            bootstrap_nodes: opts.bootstrap_nodes,
            registry,
            store: Store::new(opts.storage_root, opts.path_transform),
            stop_tx,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Registered remote addresses, sorted.
    pub fn peer_addrs(&self) -> Vec<String> {
        self.registry.addrs()
    }

    /// Listen, dial bootstrap nodes in the background, then run the dispatch loop until stopped.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.transport.listen_and_accept().await?;
        self.bootstrap_network();
        self.run_loop().await;
        Ok(())
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn bootstrap_network(&self) {
        for addr in self.bootstrap_nodes.iter().filter(|a| !a.is_empty()) {
            let transport = self.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                tracing::info!(addr = %addr, "attempting to connect with remote");
                if let Err(e) = transport.dial(&addr).await {
                    tracing::warn!(addr = %addr, error = %e, "dial error");
                }
            });
        }
    }

    /// Send one serialized copy of `msg` to every registered peer. The first
    /// failing peer aborts the broadcast.
    ///
    /// Messages that announce a trailing stream must go through [`FileServer::store_data`].
    pub async fn broadcast(&self, msg: &Message) -> Result<(), ServerError> {
        let frame = wire::encode_frame(msg)?;
        for peer in self.registry.snapshot() {
            peer.send(&frame)
                .await
                .map_err(|source| ServerError::Broadcast {
                    addr: peer.remote_addr().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Store `reader` locally under `key`, then replicate it to every peer as a
    /// store-intent frame followed by the blob bytes. Returns the blob size.
    pub async fn store_data<R>(&self, key: &str, reader: &mut R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let size = self.store.write(key, reader).await?;
        let from = self.transport.listen_addr().unwrap_or_default();
        let frame = wire::encode_frame(&Message::store_file(from, key, size))?;
        let peers = self.registry.snapshot();
        for peer in &peers {
            let mut blob = self.store.read(key).await?;
            peer.send_with_payload(&frame, &mut blob)
                .await
                .map_err(|source| ServerError::Broadcast {
                    addr: peer.remote_addr().to_string(),
                    source,
                })?;
        }
        tracing::info!(key = %key, size, peers = peers.len(), "stored and replicated");
        Ok(size)
    }

    async fn run_loop(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = stop_rx.changed() => {}
                envelope = self.transport.consume() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => break,
                },
            }
        }
        for peer in self.registry.drain() {
            let pending = peer.in_flight();
            if pending > 0 {
                tracing::debug!(
                    peer = %peer.remote_addr(),
                    pending,
                    "closing peer with unprocessed frames"
                );
            }
            let _ = peer.close().await;
        }
        tracing::info!("file server stopped");
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        let Envelope {
            from,
            payload,
            origin,
        } = envelope;

        let msg = match wire::decode_message(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "malformed message");
                origin.resume();
                return;
            }
        };

        let Some(peer) = self.registry.get(&from) else {
            let err = ServerError::Protocol(format!("message from unregistered peer {from}"));
            tracing::error!(peer = %from, error = %err, "closing connection");
            let _ = origin.close().await;
            return;
        };

        if let Err(e) = self.handle_message(&peer, msg).await {
            tracing::warn!(peer = %from, error = %e, "failed to handle message");
        }
        peer.resume();
    }

    async fn handle_message(&self, peer: &Arc<dyn Peer>, msg: Message) -> Result<(), ServerError> {
        match msg.payload {
            Payload::StoreFile { key, size } => {
                let written = self.receive_blob(peer, &key, size).await?;
                tracing::info!(peer = %peer.remote_addr(), key = %key, bytes = written, "stored replicated blob");
            }
        }
        Ok(())
    }

    /// Drain exactly `size` bytes of trailing stream into the store. If the
    /// store fails part way the rest is still drained so the next frame lines up;
    /// if the peer hangs up early the connection is closed. Either way any
    /// blob already stored under `key` is kept.
    async fn receive_blob(
        &self,
        peer: &Arc<dyn Peer>,
        key: &str,
        size: u64,
    ) -> Result<u64, ServerError> {
        let mut reader = peer.reader().await;
        let mut limited = (&mut *reader).take(size);
        let written = self.store.write_exact(key, &mut limited, size).await;

        let leftover = limited.limit();
        if leftover > 0 {
            let drained = tokio::io::copy(&mut limited, &mut tokio::io::sink())
                .await
                .unwrap_or(0);
            if drained < leftover {
                drop(reader);
                let _ = peer.close().await;
                return Err(ServerError::ShortPayload {
                    key: key.to_string(),
                    expected: size,
                    received: size - leftover + drained,
                });
            }
        }
        Ok(written?)
    }
}
