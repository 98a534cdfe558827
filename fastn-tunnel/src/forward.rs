//! Duplex forwarding between two byte endpoints.
//!
//! [`pipe`] pumps bytes A→B and B→A as two independent halves and returns
//! once both are done. What a half does when its source runs dry depends on
//! the destination's [`Shutdown`] capability:
//!
//! - `HalfClose`: the destination's write side is shut down, so the far end
//!   sees EOF while the other direction keeps flowing.
//! - `Drop`: the destination cannot signal EOF (a UDP flow). It is flushed,
//!   and the opposite half is told to stop reading from it at its next read
//!   boundary. Nothing already read is discarded.
//!
//! Both endpoints are released only after both halves completed.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

const BUFFER_SIZE: usize = 16 * 1024;

/// How an endpoint is closed once nothing more will be written to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    HalfClose,
    Drop,
}

type Reader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;
type Writer = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

/// One side of a forwarded connection.
pub struct Endpoint {
    read: Reader,
    write: Writer,
    shutdown: Shutdown,
}

impl Endpoint {
    pub fn new(read: Reader, write: Writer, shutdown: Shutdown) -> Self {
        Self {
            read,
            write,
            shutdown,
        }
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

impl From<tokio::net::TcpStream> for Endpoint {
    fn from(stream: tokio::net::TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self::new(Box::new(read), Box::new(write), Shutdown::HalfClose)
    }
}

impl From<crate::peer::PeerStream> for Endpoint {
    fn from(stream: crate::peer::PeerStream) -> Self {
        Self::new(stream.recv, stream.send, Shutdown::HalfClose)
    }
}

impl From<tokio::io::DuplexStream> for Endpoint {
    fn from(stream: tokio::io::DuplexStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self::new(Box::new(read), Box::new(write), Shutdown::HalfClose)
    }
}

impl From<crate::local::UdpFlow> for Endpoint {
    fn from(flow: crate::local::UdpFlow) -> Self {
        let (read, write) = tokio::io::split(flow);
        Self::new(Box::new(read), Box::new(write), Shutdown::Drop)
    }
}

/// Bytes moved in each direction by [`pipe`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Forward bytes between `a` and `b` in both directions until both
/// directions are finished.
pub async fn pipe(a: Endpoint, b: Endpoint) -> Traffic {
    // Cancelled when the half reading from that endpoint must stop early.
    let stop_reading_a = tokio_util::sync::CancellationToken::new();
    let stop_reading_b = tokio_util::sync::CancellationToken::new();

    let a_to_b = copy_half(
        a.read,
        b.write,
        b.shutdown,
        stop_reading_a.clone(),
        stop_reading_b.clone(),
    );
    let b_to_a = copy_half(
        b.read,
        a.write,
        a.shutdown,
        stop_reading_b,
        stop_reading_a,
    );

    let ((a_to_b, _a_read, _b_write), (b_to_a, _b_read, _a_write)) =
        tokio::join!(a_to_b, b_to_a);

    tracing::debug!(a_to_b, b_to_a, "forwarding finished");
    Traffic { a_to_b, b_to_a }
}

async fn copy_half(
    mut src: Reader,
    mut dst: Writer,
    dst_shutdown: Shutdown,
    stop: tokio_util::sync::CancellationToken,
    stop_reverse: tokio_util::sync::CancellationToken,
) -> (u64, Reader, Writer) {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = src.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("read failed: {e}");
                    break;
                }
            },
        };

        // datagram flows may hold complete frames until flushed
        let written = async {
            dst.write_all(&buf[..n]).await?;
            dst.flush().await
        };
        if let Err(e) = written.await {
            tracing::debug!("write failed: {e}");
            // Nothing more can be delivered, so the reverse half has no one
            // to answer to either.
            stop_reverse.cancel();
            return (copied, src, dst);
        }
        copied += n as u64;
    }

    match dst_shutdown {
        Shutdown::HalfClose => {
            if let Err(e) = dst.shutdown().await {
                tracing::debug!("half-close failed: {e}");
            }
        }
        Shutdown::Drop => {
            if let Err(e) = dst.flush().await {
                tracing::debug!("flush failed: {e}");
            }
            stop_reverse.cancel();
        }
    }

    (copied, src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exchanges_both_directions_and_returns_after_eof() {
        let (a_outer, a_inner) = tokio::io::duplex(64);
        let (b_outer, b_inner) = tokio::io::duplex(64);

        let pipe = tokio::spawn(pipe(Endpoint::from(a_inner), Endpoint::from(b_inner)));

        let x: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let y: Vec<u8> = (0..70_000u32).map(|i| (i % 13) as u8).collect();

        let (mut a_read, mut a_write) = tokio::io::split(a_outer);
        let (mut b_read, mut b_write) = tokio::io::split(b_outer);

        let x_send = x.clone();
        let a_writer = tokio::spawn(async move {
            a_write.write_all(&x_send).await.unwrap();
            a_write.shutdown().await.unwrap();
        });
        let y_send = y.clone();
        let b_writer = tokio::spawn(async move {
            b_write.write_all(&y_send).await.unwrap();
            b_write.shutdown().await.unwrap();
        });

        let mut at_b = Vec::new();
        let mut at_a = Vec::new();
        let (r1, r2) = tokio::join!(b_read.read_to_end(&mut at_b), a_read.read_to_end(&mut at_a));
        r1.unwrap();
        r2.unwrap();
        a_writer.await.unwrap();
        b_writer.await.unwrap();

        assert_eq!(at_b, x);
        assert_eq!(at_a, y);

        let traffic = pipe.await.unwrap();
        assert_eq!(
            traffic,
            Traffic {
                a_to_b: x.len() as u64,
                b_to_a: y.len() as u64
            }
        );
    }

    #[tokio::test]
    async fn half_close_keeps_reverse_direction_open() {
        let (a_outer, a_inner) = tokio::io::duplex(64);
        let (b_outer, b_inner) = tokio::io::duplex(64);
        let pipe = tokio::spawn(pipe(Endpoint::from(a_inner), Endpoint::from(b_inner)));

        let (mut a_read, mut a_write) = tokio::io::split(a_outer);
        let (mut b_read, mut b_write) = tokio::io::split(b_outer);

        a_write.write_all(b"request").await.unwrap();
        a_write.shutdown().await.unwrap();

        let mut request = Vec::new();
        b_read.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        // B only answers after it saw A's EOF
        b_write.write_all(b"response").await.unwrap();
        b_write.shutdown().await.unwrap();

        let mut response = Vec::new();
        a_read.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        let traffic = pipe.await.unwrap();
        assert_eq!(traffic.a_to_b, 7);
        assert_eq!(traffic.b_to_a, 8);
    }

    #[tokio::test]
    async fn drop_destination_stops_reverse_reader() {
        let (a_outer, a_inner) = tokio::io::duplex(64);
        let (_b_outer, b_inner) = tokio::io::duplex(64);

        // B behaves like a datagram flow: it never reports EOF by itself.
        let (b_read, b_write) = tokio::io::split(b_inner);
        let b = Endpoint::new(Box::new(b_read), Box::new(b_write), Shutdown::Drop);

        let pipe = tokio::spawn(pipe(Endpoint::from(a_inner), b));

        let (mut a_read, mut a_write) = tokio::io::split(a_outer);
        a_write.write_all(b"last words").await.unwrap();
        a_write.shutdown().await.unwrap();

        // A sees EOF because the B→A half was stopped and half-closed A.
        let mut rest = Vec::new();
        a_read.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let traffic = tokio::time::timeout(std::time::Duration::from_secs(5), pipe)
            .await
            .expect("pipe must finish once A is done")
            .unwrap();
        assert_eq!(traffic.a_to_b, 10);
        assert_eq!(traffic.b_to_a, 0);
    }
}
