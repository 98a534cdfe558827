/// Start a TCP echo service on 127.0.0.1 and return its port. Each
/// connection gets back what it sent, followed by EOF once it half-closed.
pub(crate) async fn echo_server() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let (mut read, mut write) = stream.into_split();
                if tokio::io::copy(&mut read, &mut write).await.is_ok() {
                    let _ = write.shutdown().await;
                }
            });
        }
    });
    port
}

/// Collect whatever events are already queued.
pub(crate) fn queued(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<crate::control::ControlEvent>,
) -> Vec<crate::control::ControlEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
