//! Host-side record of connected peers.
//!
//! One [`Session`] exists per remote peer with a live connection, however
//! many streams that peer has open. Every stream forwarder of a peer watches
//! the session's cancellation token, so removing a session resets all of the
//! peer's streams at once.
//!
//! The mutex only guards the map. Address lookups, closing connections and
//! emitting control events happen after it is released.

/// A connected remote peer.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: crate::peer::PeerId,
    pub addr: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    streams: tokio_util::sync::CancellationToken,
}

impl Session {
    /// Token cancelled when the session's streams must be reset.
    pub fn streams(&self) -> tokio_util::sync::CancellationToken {
        self.streams.clone()
    }

    pub fn age(&self) -> chrono::Duration {
        chrono::Utc::now() - self.created_at
    }
}

pub struct SessionRegistry {
    sessions: tokio::sync::Mutex<std::collections::HashMap<crate::peer::PeerId, Session>>,
    connections: std::sync::Arc<dyn crate::peer::PeerConnections>,
    events: crate::control::EventSink,
}

impl SessionRegistry {
    pub fn new(
        connections: std::sync::Arc<dyn crate::peer::PeerConnections>,
        events: crate::control::EventSink,
    ) -> Self {
        Self {
            sessions: Default::default(),
            connections,
            events,
        }
    }

    /// Insert or refresh the session of `peer` and announce it.
    ///
    /// A refreshed session keeps its stream token, so streams opened earlier
    /// are still reset together with the new ones.
    pub async fn add_session(&self, peer: crate::peer::PeerId) -> tokio_util::sync::CancellationToken {
        let addr = self.connections.remote_address(&peer).await;

        let streams = {
            let mut sessions = self.sessions.lock().await;
            let streams = sessions
                .get(&peer)
                .map(|s| s.streams.clone())
                .unwrap_or_default();
            sessions.insert(
                peer,
                Session {
                    peer,
                    addr: addr.clone(),
                    created_at: chrono::Utc::now(),
                    streams: streams.clone(),
                },
            );
            streams
        };

        tracing::info!(%peer, addr = addr.as_deref().unwrap_or("unknown"), "session added");
        self.events.emit(crate::control::ControlEvent::Connected {
            session_id: peer.to_string(),
            addr,
            port: None,
        });
        streams
    }

    /// Reset the streams of `peer`, forget it, and announce the disconnect.
    /// With `force` the peer connection is severed as well.
    pub async fn remove_session(&self, peer: &crate::peer::PeerId, force: bool) {
        let removed = self.sessions.lock().await.remove(peer);

        match &removed {
            Some(session) => {
                session.streams.cancel();
                tracing::info!(%peer, age = ?session.age(), force, "session removed");
            }
            None => tracing::debug!(%peer, "remove of unknown session"),
        }
        if force && removed.is_some() {
            self.connections.close_peer(peer).await;
        }

        self.events.emit(crate::control::ControlEvent::Disconnect {
            session_id: peer.to_string(),
        });
    }

    /// Ids of all tracked peers, sorted.
    pub async fn list_sessions(&self) -> Vec<crate::peer::PeerId> {
        let mut peers: Vec<_> = self.sessions.lock().await.keys().copied().collect();
        peers.sort();
        peers
    }

    #[cfg(test)]
    pub(crate) async fn session(&self, peer: &crate::peer::PeerId) -> Option<Session> {
        self.sessions.lock().await.get(peer).cloned()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Reset every stream and sever every connection, leaving the registry
    /// empty. Sessions removed concurrently are closed by whoever removed
    /// them, never twice.
    pub async fn force_close_all(&self) {
        let drained: Vec<Session> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        tracing::info!(count = drained.len(), "force closing all sessions");

        for session in drained {
            session.streams.cancel();
            self.connections.close_peer(&session.peer).await;
        }
    }
}
