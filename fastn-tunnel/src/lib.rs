//! # fastn-tunnel
//!
//! Expose a local TCP or UDP service to a remote peer over a P2P link.
//!
//! The **host** runs next to the service. Once it has joined the network it
//! prints a connection token. The **client** is started with that token; it
//! finds the host, connects, and listens on a local port. Every connection
//! (or UDP source) accepted there becomes a stream to the host, which pairs
//! it with a fresh connection to the service:
//!
//! ```text
//! app ──▶ client:local port ══ peer stream ══▶ host ──▶ localhost:<port>
//! ```
//!
//! Both roles are driven by a supervisor through the JSON lines control
//! plane in [`control`]. The peer network itself (identity, discovery, NAT
//! traversal, encryption) is behind the traits in [`peer`]; the binary uses
//! [`peer::iroh::IrohPeer`].

pub mod client;
pub mod config;
pub mod control;
pub mod forward;
pub mod host;
pub mod lifecycle;
pub mod local;
pub mod peer;
pub mod registry;
pub mod token;

#[cfg(test)]
mod test_util;

pub use config::{Args, Config, Role, Timeouts};
pub use control::{ControlCommand, ControlEvent, EventSink};
pub use lifecycle::{Lifecycle, ShutdownReason, State};
pub use peer::{PeerDirectory, PeerId, PeerTransport};
pub use token::{ConnectionToken, NetworkType};

/// Fatal errors before a tunnel is up. Each is reported as an ERROR event
/// before it is returned.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid token: {source}")]
    Token { source: token::DecodeError },

    #[error("bootstrap failed: {source}")]
    Bootstrap { source: peer::PeerError },

    #[error("peer {peer} not found")]
    PeerNotFound { peer: PeerId },

    #[error("looking up peer failed: {source}")]
    Lookup { source: peer::PeerError },

    #[error("connecting to peer failed: {source}")]
    Connect { source: peer::PeerError },

    #[error("cannot listen locally: {source}")]
    Listen { source: local::LocalError },
}

/// What both roles share: where events go, the lifecycle, and timeouts.
#[derive(Debug, Clone)]
pub struct Context {
    pub events: EventSink,
    pub lifecycle: std::sync::Arc<Lifecycle>,
    pub timeouts: Timeouts,
}

impl Context {
    pub fn new(events: EventSink, timeouts: Timeouts) -> Self {
        Self {
            events,
            lifecycle: std::sync::Arc::new(Lifecycle::new()),
            timeouts,
        }
    }

    /// Report a startup failure, release the transport and hand the error
    /// back to the caller.
    pub(crate) async fn fail(&self, transport: &dyn PeerTransport, error: StartupError) -> StartupError {
        tracing::error!("{error}");
        self.events.error(&error);
        self.lifecycle.trigger(ShutdownReason::StartupFailed);
        self.close(transport).await;
        error
    }

    /// Close the transport and enter `Closed`. Errors are only logged.
    pub(crate) async fn close(&self, transport: &dyn PeerTransport) {
        if let Err(e) = transport.close().await {
            tracing::warn!("closing transport failed: {e}");
        }
        self.lifecycle.set_state(State::Closed);
    }
}
