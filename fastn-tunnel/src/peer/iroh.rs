//! The production substrate, built on `iroh`.
//!
//! All tunnel traffic uses one ALPN. A connection between two peers carries
//! any number of bidirectional streams, and each stream starts with a JSON
//! [`StreamHeader`] line naming the protocol it carries. The accepting side
//! answers with an `ack` line if it has a handler for that protocol, after
//! which the stream belongs to the handler:
//!
//! ```text
//! opener                              acceptor
//!   │ ── {"protocol":"fastn-tunnel/1.0"}\n ──▶ │
//!   │ ◀───────────────── ack\n ────────────── │
//!   │ ◀══════════ forwarded bytes ══════════▶ │
//! ```
//!
//! Peers are located through n0 DNS discovery and local network discovery;
//! iroh takes care of hole punching and relays.

use tokio::io::AsyncReadExt;

/// ALPN of every tunnel connection.
pub const ALPN: &[u8] = b"/fastn/tunnel/0.1";

const ACK: &str = "ack";
const MAX_HEADER_LINE: usize = 1024;
const HEADER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const BOOTSTRAP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const FIND_PEER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// First line of every stream.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct StreamHeader {
    pub protocol: String,
}

/// Read the identity key stored at `path`, or generate one and store it.
///
/// The file holds the 32 raw bytes of the secret key.
#[tracing::instrument]
pub async fn load_or_create_secret_key(
    path: &std::path::Path,
) -> eyre::Result<fastn_id52::SecretKey> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
                eyre::eyre!(
                    "secret key file {} must hold 32 bytes, found {}",
                    path.display(),
                    b.len()
                )
            })?;
            let key = fastn_id52::SecretKey::from_bytes(&bytes);
            tracing::info!("loaded identity {}", key.public_key().to_string());
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = fastn_id52::SecretKey::generate();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, key.to_bytes()).await?;
            tracing::info!("generated identity {}", key.public_key().to_string());
            Ok(key)
        }
        Err(e) => Err(eyre::Error::from(e).wrap_err(format!("reading {}", path.display()))),
    }
}

fn id_of(node: &iroh::NodeId) -> Result<super::PeerId, super::ParsePeerIdError> {
    super::PeerId::from_bytes(node.as_bytes())
}

fn node_of(peer: &super::PeerId) -> Result<iroh::NodeId, super::PeerError> {
    iroh::NodeId::from_bytes(&peer.to_bytes()).map_err(|e| super::PeerError::Transport {
        source: eyre::Error::from(e),
    })
}

fn transport<E>(e: E) -> super::PeerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    super::PeerError::Transport {
        source: eyre::Error::from(e),
    }
}

/// A bound iroh endpoint plus the bookkeeping the tunnel needs on top of it.
#[derive(Clone)]
pub struct IrohPeer {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    endpoint: iroh::Endpoint,
    id: super::PeerId,
    connections: tokio::sync::Mutex<std::collections::HashMap<super::PeerId, iroh::endpoint::Connection>>,
    handlers: std::sync::RwLock<std::collections::HashMap<String, super::StreamHandler>>,
    disconnects: tokio::sync::broadcast::Sender<super::PeerId>,
    shutdown: tokio_util::sync::CancellationToken,
}

impl IrohPeer {
    /// Bind an endpoint with `secret_key` and start accepting connections.
    pub async fn bind(secret_key: fastn_id52::SecretKey) -> Result<Self, super::PeerError> {
        let id = super::PeerId::from(secret_key.public_key());
        let iroh_secret_key = iroh::SecretKey::from_bytes(&secret_key.to_bytes());

        let endpoint = iroh::Endpoint::builder()
            .discovery_n0()
            .discovery_local_network()
            .alpns(vec![ALPN.to_vec()])
            .secret_key(iroh_secret_key)
            .bind()
            .await
            .map_err(|e| super::PeerError::Transport {
                // https://github.com/n0-computer/iroh/issues/2741
                source: eyre::eyre!("failed to bind to iroh network: {e:?}"),
            })?;
        tracing::info!("endpoint bound: {id}");

        let (disconnects, _) = tokio::sync::broadcast::channel(64);
        let inner = std::sync::Arc::new(Inner {
            endpoint,
            id,
            connections: Default::default(),
            handlers: Default::default(),
            disconnects,
            shutdown: tokio_util::sync::CancellationToken::new(),
        });

        tokio::spawn(accept_loop(inner.clone()));
        Ok(Self { inner })
    }

    /// Cached live connection to `peer`, or a new one.
    async fn connection(
        &self,
        peer: &super::PeerId,
    ) -> Result<iroh::endpoint::Connection, super::PeerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(super::PeerError::Closed);
        }
        if let Some(conn) = self.inner.connections.lock().await.get(peer) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }

        let conn = self
            .inner
            .endpoint
            .connect(node_of(peer)?, ALPN)
            .await
            .map_err(transport)?;
        tracing::debug!("connected to {peer}");

        track(&self.inner, *peer, conn.clone()).await;
        tokio::spawn(serve_streams(self.inner.clone(), *peer, conn.clone()));
        Ok(conn)
    }
}

async fn accept_loop(inner: std::sync::Arc<Inner>) {
    loop {
        let incoming = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            incoming = inner.endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("incoming connection failed: {e}");
                    return;
                }
            };
            let node = match conn.remote_node_id() {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!("could not identify remote peer: {e}");
                    return;
                }
            };
            let peer = match id_of(&node) {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::warn!("remote node id is not a peer id: {e}");
                    return;
                }
            };
            tracing::debug!("accepted connection from {peer}");

            track(&inner, peer, conn.clone()).await;
            serve_streams(inner, peer, conn).await;
        });
    }
    tracing::debug!("accept loop stopped");
}

/// Remember `conn` as the live connection to `peer` and report when it goes
/// away, unless it was closed locally or replaced in the meantime.
async fn track(inner: &std::sync::Arc<Inner>, peer: super::PeerId, conn: iroh::endpoint::Connection) {
    let id = conn.stable_id();
    inner.connections.lock().await.insert(peer, conn.clone());

    let inner = inner.clone();
    tokio::spawn(async move {
        let reason = conn.closed().await;
        let removed = {
            let mut connections = inner.connections.lock().await;
            match connections.get(&peer) {
                Some(current) if current.stable_id() == id => {
                    connections.remove(&peer);
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::info!("connection to {peer} closed: {reason}");
            let _ = inner.disconnects.send(peer);
        }
    });
}

async fn serve_streams(inner: std::sync::Arc<Inner>, peer: super::PeerId, conn: iroh::endpoint::Connection) {
    loop {
        let (send, recv) = match conn.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                tracing::debug!("no more streams from {peer}: {e}");
                break;
            }
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = route_stream(&inner, peer, send, recv).await {
                tracing::warn!("rejected stream from {peer}: {e}");
            }
        });
    }
}

async fn route_stream(
    inner: &Inner,
    peer: super::PeerId,
    mut send: iroh::endpoint::SendStream,
    mut recv: iroh::endpoint::RecvStream,
) -> eyre::Result<()> {
    let line = tokio::time::timeout(HEADER_TIMEOUT, read_line(&mut recv))
        .await
        .map_err(|_| eyre::eyre!("no stream header within {HEADER_TIMEOUT:?}"))??;
    let header: StreamHeader = serde_json::from_str(&line)?;

    let handler = inner
        .handlers
        .read()
        .map_err(|_| eyre::eyre!("handler table poisoned"))?
        .get(&header.protocol)
        .cloned();
    let Some(handler) = handler else {
        send.write_all(b"unsupported\n").await?;
        send.finish()?;
        return Err(eyre::eyre!("no handler for {}", header.protocol));
    };

    send.write_all(format!("{ACK}\n").as_bytes()).await?;
    handler(super::PeerStream {
        peer,
        send: Box::new(send),
        recv: Box::new(recv),
    });
    Ok(())
}

/// Read one `\n` terminated line without consuming anything after it.
async fn read_line<R>(recv: &mut R) -> eyre::Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = recv.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() == MAX_HEADER_LINE {
            return Err(eyre::eyre!("header line longer than {MAX_HEADER_LINE} bytes"));
        }
        line.push(byte);
    }
    Ok(String::from_utf8(line)?)
}

#[async_trait::async_trait]
impl super::PeerConnections for IrohPeer {
    async fn close_peer(&self, peer: &super::PeerId) {
        let conn = self.inner.connections.lock().await.remove(peer);
        if let Some(conn) = conn {
            conn.close(0u8.into(), b"session closed");
            tracing::debug!("closed connection to {peer}");
        }
    }

    async fn remote_address(&self, peer: &super::PeerId) -> Option<String> {
        use iroh::Watcher as _;

        let node = node_of(peer).ok()?;
        let mut conn_type = self.inner.endpoint.conn_type(node)?;
        Some(format!("{:?}", conn_type.get()))
    }
}

#[async_trait::async_trait]
impl super::PeerTransport for IrohPeer {
    fn self_identity(&self) -> super::PeerId {
        self.inner.id
    }

    async fn connect(
        &self,
        peer: &super::PeerInfo,
        timeout: std::time::Duration,
    ) -> Result<(), super::PeerError> {
        tokio::time::timeout(timeout, self.connection(&peer.id))
            .await
            .map_err(|_| super::PeerError::Timeout {
                operation: "connect",
                after: timeout,
            })??;
        Ok(())
    }

    async fn open_stream(
        &self,
        peer: &super::PeerId,
        protocol: &str,
        timeout: std::time::Duration,
    ) -> Result<super::PeerStream, super::PeerError> {
        let open = async {
            let conn = self.connection(peer).await?;
            let (mut send, mut recv) = conn.open_bi().await.map_err(transport)?;

            let header = serde_json::to_string(&StreamHeader {
                protocol: protocol.to_string(),
            })
            .map_err(transport)?;
            send.write_all(header.as_bytes()).await.map_err(transport)?;
            send.write_all(b"\n").await.map_err(transport)?;

            let reply = read_line(&mut recv)
                .await
                .map_err(|source| super::PeerError::Transport { source })?;
            if reply != ACK {
                return Err(super::PeerError::Unsupported {
                    peer: *peer,
                    protocol: protocol.to_string(),
                });
            }

            Ok(super::PeerStream {
                peer: *peer,
                send: Box::new(send),
                recv: Box::new(recv),
            })
        };

        tokio::time::timeout(timeout, open)
            .await
            .map_err(|_| super::PeerError::Timeout {
                operation: "open stream",
                after: timeout,
            })?
    }

    fn set_stream_handler(&self, protocol: &str, handler: super::StreamHandler) {
        match self.inner.handlers.write() {
            Ok(mut handlers) => {
                handlers.insert(protocol.to_string(), handler);
            }
            Err(e) => tracing::error!("cannot register handler for {protocol}: {e}"),
        }
    }

    fn listen_addresses(&self) -> Vec<String> {
        self.inner
            .endpoint
            .bound_sockets()
            .into_iter()
            .map(|addr| addr.to_string())
            .collect()
    }

    fn disconnects(&self) -> tokio::sync::broadcast::Receiver<super::PeerId> {
        self.inner.disconnects.subscribe()
    }

    async fn close(&self) -> Result<(), super::PeerError> {
        self.inner.shutdown.cancel();
        self.inner.connections.lock().await.clear();
        self.inner.endpoint.close().await;
        tracing::info!("endpoint closed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl super::PeerDirectory for IrohPeer {
    async fn bootstrap(&self) -> Result<(), super::PeerError> {
        use iroh::Watcher as _;

        // Published once a relay or a direct address is known.
        let _ = tokio::time::timeout(BOOTSTRAP_TIMEOUT, self.inner.endpoint.node_addr().initialized())
            .await
            .map_err(|_| super::PeerError::Timeout {
                operation: "bootstrap",
                after: BOOTSTRAP_TIMEOUT,
            })?;
        tracing::info!("bootstrap complete");
        Ok(())
    }

    async fn find_peer(&self, peer: &super::PeerId) -> Result<super::PeerInfo, super::PeerError> {
        match tokio::time::timeout(FIND_PEER_TIMEOUT, self.connection(peer)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::debug!("lookup of {peer} failed: {e}");
                return Err(super::PeerError::NotFound(*peer));
            }
            Err(_) => {
                tracing::debug!("lookup of {peer} timed out");
                return Err(super::PeerError::NotFound(*peer));
            }
        }

        use super::PeerConnections as _;
        Ok(super::PeerInfo {
            id: *peer,
            addrs: self.remote_address(peer).await.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_line_stops_at_newline() {
        let mut input: &[u8] = b"{\"protocol\":\"x\"}\nrest";
        let line = read_line(&mut input).await.unwrap();
        assert_eq!(line, "{\"protocol\":\"x\"}");
        assert_eq!(input, b"rest");
    }

    #[tokio::test]
    async fn read_line_rejects_oversized_header() {
        let long = vec![b'a'; MAX_HEADER_LINE + 10];
        let mut input: &[u8] = &long;
        assert!(read_line(&mut input).await.is_err());
    }

    #[tokio::test]
    async fn secret_key_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = load_or_create_secret_key(&path).await.unwrap();
        let second = load_or_create_secret_key(&path).await.unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
        assert_eq!(first.public_key().to_string(), second.public_key().to_string());
        assert_eq!(tokio::fs::read(&path).await.unwrap().len(), 32);

        tokio::fs::write(&path, b"short").await.unwrap();
        assert!(load_or_create_secret_key(&path).await.is_err());
    }
}
