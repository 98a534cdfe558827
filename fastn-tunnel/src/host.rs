//! Host role: publish a token and serve inbound streams by forwarding each
//! one to a fresh connection to the local service.

/// Run the host until shutdown.
///
/// Streams are only accepted after the TOKEN event went out, so no CONNECTED
/// can precede it.
pub async fn run<P, R>(
    peer: std::sync::Arc<P>,
    network: crate::token::NetworkType,
    port: u16,
    ctx: crate::Context,
    control: R,
) -> Result<(), crate::StartupError>
where
    P: crate::peer::PeerTransport + crate::peer::PeerDirectory + 'static,
    R: tokio::io::AsyncBufRead + Unpin + Send + 'static,
{
    let lifecycle = ctx.lifecycle.clone();
    let mut disconnects = peer.disconnects();

    if let Err(source) = peer.bootstrap().await {
        return Err(ctx
            .fail(&*peer, crate::StartupError::Bootstrap { source })
            .await);
    }

    let delay = ctx.timeouts.stabilization_delay;
    tracing::info!("waiting {delay:?} for the network to settle");
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = lifecycle.cancelled() => {
            tracing::info!("shutdown before the tunnel was published");
            ctx.close(&*peer).await;
            return Ok(());
        }
    }

    for addr in peer.listen_addresses() {
        tracing::info!("listening on {addr}");
    }
    let token = crate::token::ConnectionToken::new(peer.self_identity(), network);
    tracing::info!(peer = %token.peer, %network, port, "exposing local service");
    ctx.events.emit(crate::control::ControlEvent::Token {
        token: token.encode(),
    });

    let registry = std::sync::Arc::new(crate::registry::SessionRegistry::new(
        peer.clone(),
        ctx.events.clone(),
    ));
    let tracker = tokio_util::task::TaskTracker::new();

    peer.set_stream_handler(crate::peer::TUNNEL_PROTOCOL, {
        let registry = registry.clone();
        let tracker = tracker.clone();
        let lifecycle = lifecycle.clone();
        let timeouts = ctx.timeouts;
        std::sync::Arc::new(move |stream: crate::peer::PeerStream| {
            if lifecycle.is_cancelled() {
                tracing::debug!(peer = %stream.peer, "shutting down, stream refused");
                return;
            }
            tracker.spawn(serve_stream(
                stream,
                registry.clone(),
                network,
                port,
                timeouts,
            ));
        })
    });

    let control = tokio::spawn(crate::control::run(
        control,
        Some(registry.clone()),
        ctx.events.clone(),
        lifecycle.clone(),
    ));

    let watcher = tokio::spawn({
        let registry = registry.clone();
        let lifecycle = lifecycle.clone();
        async move {
            loop {
                let peer = tokio::select! {
                    _ = lifecycle.cancelled() => break,
                    received = disconnects.recv() => match received {
                        Ok(peer) => peer,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("missed {n} disconnect notifications");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                };
                tracing::info!(%peer, "peer disconnected");
                registry.remove_session(&peer, false).await;
            }
        }
    });

    lifecycle.set_state(crate::lifecycle::State::Running);
    lifecycle.cancelled().await;

    lifecycle.set_state(crate::lifecycle::State::Draining);
    tracker.close();
    let drain = ctx.timeouts.drain;
    if tokio::time::timeout(drain, tracker.wait()).await.is_err() {
        tracing::info!(
            remaining = tracker.len(),
            "streams still open after {drain:?}, closing them"
        );
    }
    registry.force_close_all().await;
    tracker.wait().await;

    if let Err(e) = watcher.await {
        tracing::warn!("disconnect watcher failed: {e}");
    }
    if let Err(e) = control.await {
        tracing::warn!("control reader failed: {e}");
    }

    ctx.close(&*peer).await;
    tracing::info!("host stopped");
    Ok(())
}

async fn serve_stream(
    stream: crate::peer::PeerStream,
    registry: std::sync::Arc<crate::registry::SessionRegistry>,
    network: crate::token::NetworkType,
    port: u16,
    timeouts: crate::config::Timeouts,
) {
    let peer = stream.peer;
    let reset = registry.add_session(peer).await;

    let local = match crate::local::dial(network, port, timeouts.dial, timeouts.udp_idle).await {
        Ok(local) => local,
        Err(e) => {
            tracing::warn!(%peer, "cannot reach local service: {e}");
            return;
        }
    };

    tokio::select! {
        traffic = crate::forward::pipe(stream.into(), local) => {
            tracing::debug!(%peer, ?traffic, "stream finished");
        }
        _ = reset.cancelled() => {
            tracing::debug!(%peer, "stream reset");
        }
    }
}
