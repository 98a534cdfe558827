//! Client role: reach the host named by a token and offer its service on a
//! local port.

const ACCEPT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

/// Run the client until shutdown.
///
/// Startup failures (bad token, unknown host, failed connect, port in use)
/// are reported as an ERROR event and returned; the local port is never
/// opened unless the host was reached first.
pub async fn run<P, R>(
    peer: std::sync::Arc<P>,
    token: String,
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

    let token = match crate::token::ConnectionToken::decode(&token) {
        Ok(token) => token,
        Err(source) => return Err(ctx.fail(&*peer, crate::StartupError::Token { source }).await),
    };
    let host = token.peer;

    if let Err(source) = peer.bootstrap().await {
        return Err(ctx
            .fail(&*peer, crate::StartupError::Bootstrap { source })
            .await);
    }

    let info = match peer.find_peer(&host).await {
        Ok(info) => info,
        Err(crate::peer::PeerError::NotFound(peer_id)) => {
            return Err(ctx
                .fail(&*peer, crate::StartupError::PeerNotFound { peer: peer_id })
                .await);
        }
        Err(source) => {
            return Err(ctx.fail(&*peer, crate::StartupError::Lookup { source }).await);
        }
    };
    tracing::info!(%host, addrs = ?info.addrs, "found host");

    if let Err(source) = peer.connect(&info, ctx.timeouts.connect).await {
        return Err(ctx.fail(&*peer, crate::StartupError::Connect { source }).await);
    }

    let mut listener = match crate::local::LocalListener::bind(token.network, port, ctx.timeouts.udp_idle).await {
        Ok(listener) => listener,
        Err(source) => return Err(ctx.fail(&*peer, crate::StartupError::Listen { source }).await),
    };
    let local_port = match listener.local_port() {
        Ok(port) => port,
        Err(source) => return Err(ctx.fail(&*peer, crate::StartupError::Listen { source }).await),
    };

    ctx.events.emit(crate::control::ControlEvent::Connected {
        session_id: peer.self_identity().to_string(),
        addr: None,
        port: Some(local_port),
    });

    let watcher = tokio::spawn({
        let lifecycle = lifecycle.clone();
        async move {
            loop {
                tokio::select! {
                    _ = lifecycle.cancelled() => break,
                    received = disconnects.recv() => match received {
                        Ok(gone) if gone == host => {
                            tracing::info!(%host, "host disconnected");
                            lifecycle.trigger(crate::lifecycle::ShutdownReason::RemoteDisconnected);
                            break;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("missed {n} disconnect notifications");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    });

    let control = tokio::spawn(crate::control::run(
        control,
        None,
        ctx.events.clone(),
        lifecycle.clone(),
    ));

    let tracker = tokio_util::task::TaskTracker::new();
    // cancelled once forwarders had their chance to finish
    let cut = tokio_util::sync::CancellationToken::new();

    lifecycle.set_state(crate::lifecycle::State::Running);
    tracing::info!(port = local_port, network = %token.network, %host, "tunnel ready");

    loop {
        let (local, from) = tokio::select! {
            _ = lifecycle.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    if back_off(&lifecycle).await {
                        continue;
                    }
                    break;
                }
            },
        };
        tracing::debug!(%from, "local connection");
        tracker.spawn(forward_connection(
            peer.clone(),
            host,
            local,
            from,
            ctx.timeouts.stream,
            lifecycle.token(),
            cut.clone(),
        ));
    }

    lifecycle.set_state(crate::lifecycle::State::Draining);
    drop(listener);
    tracker.close();
    let drain = ctx.timeouts.drain;
    if tokio::time::timeout(drain, tracker.wait()).await.is_err() {
        tracing::info!(
            remaining = tracker.len(),
            "connections still open after {drain:?}, closing them"
        );
    }
    cut.cancel();
    peer.close_peer(&host).await;
    tracker.wait().await;

    if let Err(e) = watcher.await {
        tracing::warn!("disconnect watcher failed: {e}");
    }
    if let Err(e) = control.await {
        tracing::warn!("control reader failed: {e}");
    }

    ctx.close(&*peer).await;
    tracing::info!("client stopped");
    Ok(())
}

/// Pause before retrying a failed accept, since errors like EMFILE persist
/// for a while. False when shutdown started meanwhile.
async fn back_off(lifecycle: &crate::lifecycle::Lifecycle) -> bool {
    tokio::select! {
        _ = lifecycle.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

async fn forward_connection<P>(
    peer: std::sync::Arc<P>,
    host: crate::peer::PeerId,
    local: crate::forward::Endpoint,
    from: std::net::SocketAddr,
    timeout: std::time::Duration,
    shutdown: tokio_util::sync::CancellationToken,
    cut: tokio_util::sync::CancellationToken,
) where
    P: crate::peer::PeerTransport + ?Sized,
{
    let opened = tokio::select! {
        _ = shutdown.cancelled() => {
            tracing::debug!(%from, "shutting down, stream not opened");
            return;
        }
        opened = peer.open_stream(&host, crate::peer::TUNNEL_PROTOCOL, timeout) => opened,
    };
    let stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(%from, "cannot open stream to host: {e}");
            return;
        }
    };

    tokio::select! {
        traffic = crate::forward::pipe(local, stream.into()) => {
            tracing::debug!(%from, ?traffic, "connection finished");
        }
        _ = cut.cancelled() => {
            tracing::debug!(%from, "connection cut");
        }
    }
}
