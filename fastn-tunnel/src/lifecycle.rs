//! Process lifecycle: one cancellation signal, one state machine, and a
//! shutdown latch that only the first trigger passes.
//!
//! ```text
//! Starting ──▶ Running ──▶ Draining ──▶ Closed
//! ```
//!
//! Anything may ask for shutdown (a signal, a SHUTDOWN command, the remote
//! peer going away, a startup failure). Only the first request is acted on;
//! the rest are logged and dropped.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Running,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    Command,
    RemoteDisconnected,
    StartupFailed,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Signal => write!(f, "signal"),
            ShutdownReason::Command => write!(f, "SHUTDOWN command"),
            ShutdownReason::RemoteDisconnected => write!(f, "remote peer disconnected"),
            ShutdownReason::StartupFailed => write!(f, "startup failure"),
        }
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    token: tokio_util::sync::CancellationToken,
    reason: std::sync::OnceLock<ShutdownReason>,
    state: tokio::sync::watch::Sender<State>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = tokio::sync::watch::channel(State::Starting);
        Self {
            token: tokio_util::sync::CancellationToken::new(),
            reason: std::sync::OnceLock::new(),
            state,
        }
    }

    /// Request shutdown. Returns `true` only for the request that started
    /// it.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason).is_err() {
            tracing::debug!(%reason, "shutdown already in progress");
            return false;
        }

        tracing::info!(%reason, "shutting down");
        self.state.send_if_modified(|state| match state {
            State::Starting | State::Running => {
                *state = State::Draining;
                true
            }
            State::Draining | State::Closed => false,
        });
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> tokio_util::sync::CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn set_state(&self, next: State) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(?previous, ?next, "state changed");
        }
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<State> {
        self.state.subscribe()
    }
}

/// Trigger shutdown on SIGINT, or SIGTERM on unix.
pub fn spawn_signal_listener(
    lifecycle: std::sync::Arc<Lifecycle>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("received shutdown signal");
                lifecycle.trigger(ShutdownReason::Signal);
            }
            _ = lifecycle.cancelled() => {}
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!("cannot install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_trigger_wins() {
        let lifecycle = Lifecycle::new();
        let mut states = lifecycle.subscribe();
        lifecycle.set_state(State::Running);

        assert!(lifecycle.trigger(ShutdownReason::Command));
        assert!(!lifecycle.trigger(ShutdownReason::Signal));
        assert!(!lifecycle.trigger(ShutdownReason::RemoteDisconnected));

        assert!(lifecycle.is_cancelled());
        assert_eq!(lifecycle.reason(), Some(ShutdownReason::Command));
        assert_eq!(*states.borrow_and_update(), State::Draining);
    }

    #[tokio::test]
    async fn trigger_after_close_keeps_closed() {
        let lifecycle = Lifecycle::new();
        lifecycle.set_state(State::Closed);
        lifecycle.trigger(ShutdownReason::Signal);
        assert_eq!(lifecycle.state(), State::Closed);
    }

    #[tokio::test]
    async fn concurrent_triggers_cancel_once() {
        let lifecycle = std::sync::Arc::new(Lifecycle::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let lifecycle = lifecycle.clone();
            tasks.push(tokio::spawn(async move {
                lifecycle.trigger(ShutdownReason::Signal)
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        lifecycle.cancelled().await;
    }

    #[tokio::test]
    async fn signal_listener_exits_with_lifecycle() {
        let lifecycle = std::sync::Arc::new(Lifecycle::new());
        let listener = spawn_signal_listener(lifecycle.clone());
        lifecycle.trigger(ShutdownReason::Command);
        tokio::time::timeout(std::time::Duration::from_secs(5), listener)
            .await
            .unwrap()
            .unwrap();
    }
}
