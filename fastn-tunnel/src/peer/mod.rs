//! Peer-networking substrate seen by the tunnel.
//!
//! The tunnel never talks to the network stack directly. Everything it needs
//! from the substrate (identity, dialing, multiplexed streams, discovery,
//! connection teardown) is expressed by the [`PeerTransport`] and
//! [`PeerDirectory`] traits. The production implementation is
//! [`iroh::IrohPeer`]; tests run against an in-memory network.
//!
//! ## Peer Identity
//!
//! A peer is identified by its Ed25519 public key, a
//! [`fastn_id52::PublicKey`]. Its textual form is ID52: 52 lowercase letters
//! and digits, safe to paste anywhere (chat, URLs, DNS labels).

pub mod iroh;
#[cfg(test)]
pub(crate) mod memory;

/// Protocol tag of the tunnel's forwarded streams.
pub const TUNNEL_PROTOCOL: &str = "fastn-tunnel/1.0";

/// Identity of a peer: an Ed25519 public key, displayed as ID52.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(fastn_id52::PublicKey);

impl PeerId {
    pub const LEN: usize = 32;

    /// Rejects byte strings that are not a valid Ed25519 point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, ParsePeerIdError> {
        fastn_id52::PublicKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| ParsePeerIdError::Key(e.to_string()))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> &fastn_id52::PublicKey {
        &self.0
    }

    /// The ID52 form of this identity.
    pub fn id52(&self) -> String {
        self.0.to_string()
    }

    /// Identity of the secret key `[seed; 32]`.
    #[cfg(test)]
    pub(crate) fn from_seed(seed: u8) -> Self {
        Self(fastn_id52::SecretKey::from_bytes(&[seed; 32]).public_key())
    }
}

impl From<fastn_id52::PublicKey> for PeerId {
    fn from(key: fastn_id52::PublicKey) -> Self {
        Self(key)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id52())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.id52())
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParsePeerIdError {
    #[error("invalid ID52: {0}")]
    Id52(String),

    #[error("not an Ed25519 public key: {0}")]
    Key(String),
}

impl std::str::FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<fastn_id52::PublicKey>()
            .map(Self)
            .map_err(|e| ParsePeerIdError::Id52(e.to_string()))
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What the directory knows about a peer: its identity and the addresses it
/// is currently reachable on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

/// One multiplexed bidirectional stream to a remote peer.
pub struct PeerStream {
    /// The peer on the other end
    pub peer: PeerId,
    /// Bytes towards the peer; shutting it down half-closes the stream
    pub send: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    /// Bytes from the peer
    pub recv: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream").field("peer", &self.peer).finish()
    }
}

/// Callback invoked for every inbound stream of a registered protocol.
pub type StreamHandler = std::sync::Arc<dyn Fn(PeerStream) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer {0} not found")]
    NotFound(PeerId),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: std::time::Duration,
    },

    #[error("peer {peer} does not serve protocol {protocol}")]
    Unsupported { peer: PeerId, protocol: String },

    #[error("no connection to peer {0}")]
    NotConnected(PeerId),

    #[error("transport is closed")]
    Closed,

    #[error("transport error: {source}")]
    Transport { source: eyre::Error },
}

/// Connection bookkeeping the session registry relies on.
#[async_trait::async_trait]
pub trait PeerConnections: Send + Sync {
    /// Sever every connection to `peer`, resetting all of its streams.
    async fn close_peer(&self, peer: &PeerId);

    /// Best known remote address of `peer`, for display.
    async fn remote_address(&self, peer: &PeerId) -> Option<String>;
}

/// Dialing, stream multiplexing and teardown.
#[async_trait::async_trait]
pub trait PeerTransport: PeerConnections {
    fn self_identity(&self) -> PeerId;

    async fn connect(
        &self,
        peer: &PeerInfo,
        timeout: std::time::Duration,
    ) -> Result<(), PeerError>;

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
        timeout: std::time::Duration,
    ) -> Result<PeerStream, PeerError>;

    /// Route inbound streams tagged `protocol` to `handler`. Replaces any
    /// handler previously registered for the same tag.
    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    fn listen_addresses(&self) -> Vec<String>;

    /// Peer ids whose last connection to us closed, in the order observed.
    fn disconnects(&self) -> tokio::sync::broadcast::Receiver<PeerId>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Discovery: joining the network and resolving peer ids to addresses.
#[async_trait::async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn bootstrap(&self) -> Result<(), PeerError>;

    async fn find_peer(&self, peer: &PeerId) -> Result<PeerInfo, PeerError>;
}
