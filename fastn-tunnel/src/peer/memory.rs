//! In-process peer substrate for tests.
//!
//! Peers registered on the same [`MemoryNetwork`] can find, connect to and
//! open streams to each other; streams are `tokio::io::duplex` pairs. Closing
//! a connection notifies the remote side only, as a real transport would.

use super::{PeerConnections, PeerDirectory, PeerError, PeerId, PeerInfo, PeerStream, PeerTransport};

const STREAM_BUFFER: usize = 64 * 1024;

#[derive(Clone, Default)]
pub(crate) struct MemoryNetwork {
    peers: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<PeerId, std::sync::Arc<MemoryPeer>>>>,
}

impl MemoryNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a peer with an identity derived from `seed`.
    pub(crate) fn peer(&self, seed: u8) -> std::sync::Arc<MemoryPeer> {
        let id = PeerId::from_seed(seed);
        let (disconnects, _) = tokio::sync::broadcast::channel(16);
        let peer = std::sync::Arc::new(MemoryPeer {
            id,
            network: self.clone(),
            handlers: Default::default(),
            connected: Default::default(),
            close_counts: Default::default(),
            disconnects,
            closed: Default::default(),
            bootstrap_fails: Default::default(),
        });
        self.lock().insert(id, peer.clone());
        peer
    }

    fn get(&self, id: &PeerId) -> Option<std::sync::Arc<MemoryPeer>> {
        self.lock().get(id).cloned()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashMap<PeerId, std::sync::Arc<MemoryPeer>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) struct MemoryPeer {
    id: PeerId,
    network: MemoryNetwork,
    handlers: std::sync::Mutex<std::collections::HashMap<String, super::StreamHandler>>,
    connected: std::sync::Mutex<std::collections::HashSet<PeerId>>,
    close_counts: std::sync::Mutex<std::collections::HashMap<PeerId, usize>>,
    disconnects: tokio::sync::broadcast::Sender<PeerId>,
    closed: std::sync::atomic::AtomicBool,
    bootstrap_fails: std::sync::atomic::AtomicBool,
}

impl MemoryPeer {
    pub(crate) fn id(&self) -> PeerId {
        self.id
    }

    /// How many times `close_peer` severed a live connection to `peer`.
    pub(crate) fn close_count(&self, peer: &PeerId) -> usize {
        self.close_counts
            .lock()
            .unwrap()
            .get(peer)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.lock().unwrap().contains(peer)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn fail_bootstrap(&self) {
        self.bootstrap_fails
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn link(&self, other: &MemoryPeer) {
        self.connected.lock().unwrap().insert(other.id);
        other.connected.lock().unwrap().insert(self.id);
    }

    /// Drop the link to `other`; true when a link existed.
    fn unlink(&self, other: &PeerId) -> bool {
        let was_connected = self.connected.lock().unwrap().remove(other);
        if let Some(remote) = self.network.get(other) {
            if remote.connected.lock().unwrap().remove(&self.id) {
                let _ = remote.disconnects.send(self.id);
            }
        }
        was_connected
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PeerConnections for MemoryPeer {
    async fn close_peer(&self, peer: &PeerId) {
        if self.unlink(peer) {
            *self.close_counts.lock().unwrap().entry(*peer).or_default() += 1;
        }
    }

    async fn remote_address(&self, peer: &PeerId) -> Option<String> {
        self.network.get(peer).map(|p| format!("memory/{}", p.id))
    }
}

#[async_trait::async_trait]
impl PeerTransport for MemoryPeer {
    fn self_identity(&self) -> PeerId {
        self.id
    }

    async fn connect(
        &self,
        peer: &PeerInfo,
        _timeout: std::time::Duration,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        let remote = self
            .network
            .get(&peer.id)
            .filter(|p| !p.is_closed())
            .ok_or(PeerError::NotFound(peer.id))?;
        self.link(&remote);
        Ok(())
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
        _timeout: std::time::Duration,
    ) -> Result<PeerStream, PeerError> {
        self.ensure_open()?;
        let remote = self
            .network
            .get(peer)
            .filter(|p| !p.is_closed())
            .ok_or(PeerError::NotFound(*peer))?;
        let handler = remote
            .handlers
            .lock()
            .unwrap()
            .get(protocol)
            .cloned()
            .ok_or_else(|| PeerError::Unsupported {
                peer: *peer,
                protocol: protocol.to_string(),
            })?;

        self.link(&remote);

        let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);

        handler(PeerStream {
            peer: self.id,
            send: Box::new(their_write),
            recv: Box::new(their_read),
        });

        Ok(PeerStream {
            peer: *peer,
            send: Box::new(our_write),
            recv: Box::new(our_read),
        })
    }

    fn set_stream_handler(&self, protocol: &str, handler: super::StreamHandler) {
        self.handlers
            .lock()
            .unwrap()
            .insert(protocol.to_string(), handler);
    }

    fn listen_addresses(&self) -> Vec<String> {
        vec![format!("memory/{}", self.id)]
    }

    fn disconnects(&self) -> tokio::sync::broadcast::Receiver<PeerId> {
        self.disconnects.subscribe()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        let peers: Vec<PeerId> = self.connected.lock().unwrap().iter().copied().collect();
        for peer in peers {
            self.unlink(&peer);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PeerDirectory for MemoryPeer {
    async fn bootstrap(&self) -> Result<(), PeerError> {
        if self.bootstrap_fails.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PeerError::Timeout {
                operation: "bootstrap",
                after: std::time::Duration::ZERO,
            });
        }
        Ok(())
    }

    async fn find_peer(&self, peer: &PeerId) -> Result<PeerInfo, PeerError> {
        let remote = self
            .network
            .get(peer)
            .filter(|p| !p.is_closed())
            .ok_or(PeerError::NotFound(*peer))?;
        Ok(PeerInfo {
            id: remote.id,
            addrs: remote.listen_addresses(),
        })
    }
}
