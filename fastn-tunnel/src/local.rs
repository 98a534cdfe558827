//! The local side of a tunnel: dialing the exposed service on the host and
//! listening for applications on the client.
//!
//! TCP connections are used as they are. UDP has no connections, so each
//! remote source address becomes a [`UdpFlow`]: a byte stream in which every
//! datagram travels as a frame of a 2-byte big-endian length followed by the
//! payload. Both ends of the tunnel speak the same framing, so datagram
//! boundaries survive the trip over the peer stream.

use crate::token::NetworkType;

/// Upper bound of a single datagram, and therefore of a frame payload.
const MAX_DATAGRAM: usize = u16::MAX as usize;
/// Datagrams queued for one flow before new ones are dropped.
const FLOW_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    #[error("connecting to {addr} timed out after {after:?}")]
    Timeout {
        addr: String,
        after: std::time::Duration,
    },

    #[error("could not resolve {addr}")]
    Resolve { addr: String },

    #[error("local io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Open a fresh connection to `localhost:<port>`. A UDP flow ends after
/// `udp_idle` without traffic.
pub async fn dial(
    network: NetworkType,
    port: u16,
    timeout: std::time::Duration,
    udp_idle: std::time::Duration,
) -> Result<crate::forward::Endpoint, LocalError> {
    let addr = format!("localhost:{port}");
    let connect = async {
        match network {
            NetworkType::Tcp => {
                let stream = tokio::net::TcpStream::connect(("localhost", port)).await?;
                stream.set_nodelay(true)?;
                Ok::<_, LocalError>(crate::forward::Endpoint::from(stream))
            }
            NetworkType::Udp => {
                let target = resolve_localhost(port).await?;
                let bind: std::net::SocketAddr = if target.is_ipv4() {
                    (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = tokio::net::UdpSocket::bind(bind).await?;
                socket.connect(target).await?;
                Ok::<_, LocalError>(crate::forward::Endpoint::from(UdpFlow::connected(
                    socket, target, udp_idle,
                )))
            }
        }
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => {
            let endpoint = result?;
            tracing::debug!(%addr, %network, "dialed local service");
            Ok(endpoint)
        }
        Err(_) => Err(LocalError::Timeout {
            addr,
            after: timeout,
        }),
    }
}

// IPv4 wins when localhost resolves to both families: services are usually
// bound to 127.0.0.1 and a datagram sent to an unbound ::1 is lost silently.
async fn resolve_localhost(port: u16) -> Result<std::net::SocketAddr, LocalError> {
    let addrs: Vec<std::net::SocketAddr> =
        tokio::net::lookup_host(("localhost", port)).await?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| LocalError::Resolve {
            addr: format!("localhost:{port}"),
        })
}

/// Listening socket on the client side.
#[derive(Debug)]
pub enum LocalListener {
    Tcp(tokio::net::TcpListener),
    Udp(UdpListener),
}

impl LocalListener {
    /// Bind `localhost:<port>`; port 0 picks an ephemeral port. UDP flows
    /// end after `udp_idle` without traffic.
    pub async fn bind(
        network: NetworkType,
        port: u16,
        udp_idle: std::time::Duration,
    ) -> Result<Self, LocalError> {
        let listener = match network {
            NetworkType::Tcp => {
                let addr = resolve_localhost(port).await?;
                LocalListener::Tcp(tokio::net::TcpListener::bind(addr).await?)
            }
            NetworkType::Udp => LocalListener::Udp(UdpListener::bind(port, udp_idle).await?),
        };
        tracing::info!(port = listener.local_port()?, %network, "local listener bound");
        Ok(listener)
    }

    pub fn local_port(&self) -> Result<u16, LocalError> {
        let addr = match self {
            LocalListener::Tcp(l) => l.local_addr()?,
            LocalListener::Udp(l) => l.socket.local_addr()?,
        };
        Ok(addr.port())
    }

    /// Wait for the next local connection (TCP) or the first datagram of a
    /// new source address (UDP).
    pub async fn accept(
        &mut self,
    ) -> Result<(crate::forward::Endpoint, std::net::SocketAddr), LocalError> {
        match self {
            LocalListener::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                stream.set_nodelay(true)?;
                Ok((crate::forward::Endpoint::from(stream), addr))
            }
            LocalListener::Udp(l) => {
                let (flow, addr) = l.accept().await?;
                Ok((crate::forward::Endpoint::from(flow), addr))
            }
        }
    }
}

/// UDP socket that hands out one [`UdpFlow`] per source address.
#[derive(Debug)]
pub struct UdpListener {
    socket: std::sync::Arc<tokio::net::UdpSocket>,
    flows: std::collections::HashMap<std::net::SocketAddr, tokio::sync::mpsc::Sender<bytes::Bytes>>,
    buf: Vec<u8>,
    idle: std::time::Duration,
}

impl UdpListener {
    pub async fn bind(port: u16, idle: std::time::Duration) -> Result<Self, LocalError> {
        let socket = tokio::net::UdpSocket::bind(resolve_localhost(port).await?).await?;
        Ok(Self {
            socket: std::sync::Arc::new(socket),
            flows: std::collections::HashMap::new(),
            buf: vec![0u8; MAX_DATAGRAM],
            idle,
        })
    }

    /// Receive datagrams, routing those of known sources to their flow,
    /// until one arrives from a source without a live flow.
    pub async fn accept(&mut self) -> Result<(UdpFlow, std::net::SocketAddr), LocalError> {
        loop {
            let (n, from) = self.socket.recv_from(&mut self.buf).await?;
            let datagram = bytes::Bytes::copy_from_slice(&self.buf[..n]);

            if let Some(tx) = self.flows.get(&from) {
                match tx.try_send(datagram) {
                    Ok(()) => continue,
                    Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                        tracing::trace!(%from, "flow queue full, dropping datagram");
                        continue;
                    }
                    Err(tokio::sync::mpsc::error::TrySendError::Closed(d)) => {
                        // the previous flow from this source ended
                        self.flows.remove(&from);
                        return Ok((self.open_flow(from, d), from));
                    }
                }
            }

            return Ok((self.open_flow(from, datagram), from));
        }
    }

    fn open_flow(&mut self, from: std::net::SocketAddr, first: bytes::Bytes) -> UdpFlow {
        self.flows.retain(|_, tx| !tx.is_closed());

        let (tx, rx) = tokio::sync::mpsc::channel(FLOW_QUEUE);
        // a fresh channel always has room for the first datagram
        let _ = tx.try_send(first);
        self.flows.insert(from, tx);
        tracing::debug!(%from, flows = self.flows.len(), "new udp flow");

        UdpFlow::new(
            FlowSource::Demuxed {
                socket: self.socket.clone(),
                rx,
            },
            from,
            self.idle,
        )
    }
}

#[derive(Debug)]
enum FlowSource {
    /// Socket connected to a single remote, owned by this flow
    Connected(tokio::net::UdpSocket),
    /// Shared listening socket; datagrams for this flow arrive over `rx`
    Demuxed {
        socket: std::sync::Arc<tokio::net::UdpSocket>,
        rx: tokio::sync::mpsc::Receiver<bytes::Bytes>,
    },
}

/// A UDP conversation with one remote address, exposed as a framed byte
/// stream.
///
/// UDP never says a conversation is over, so a flow that saw no datagram in
/// either direction for its idle timeout reads as end of stream.
#[derive(Debug)]
pub struct UdpFlow {
    source: FlowSource,
    peer: std::net::SocketAddr,
    /// Framed datagrams not yet handed to the reader
    incoming: bytes::BytesMut,
    /// Bytes written but not yet sent as complete datagrams
    outgoing: bytes::BytesMut,
    scratch: Vec<u8>,
    idle: std::time::Duration,
    idle_timer: std::pin::Pin<Box<tokio::time::Sleep>>,
    last_activity: tokio::time::Instant,
}

impl UdpFlow {
    pub fn connected(
        socket: tokio::net::UdpSocket,
        peer: std::net::SocketAddr,
        idle: std::time::Duration,
    ) -> Self {
        Self::new(FlowSource::Connected(socket), peer, idle)
    }

    fn new(source: FlowSource, peer: std::net::SocketAddr, idle: std::time::Duration) -> Self {
        let scratch = match source {
            FlowSource::Connected(_) => vec![0u8; MAX_DATAGRAM],
            FlowSource::Demuxed { .. } => Vec::new(),
        };
        let now = tokio::time::Instant::now();
        Self {
            source,
            peer,
            incoming: bytes::BytesMut::new(),
            outgoing: bytes::BytesMut::new(),
            scratch,
            idle,
            idle_timer: Box::pin(tokio::time::sleep_until(now + idle)),
            last_activity: now,
        }
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer
    }

    fn push_frame(&mut self, payload: &[u8]) {
        use bytes::BufMut;
        self.incoming.reserve(2 + payload.len());
        self.incoming.put_u16(payload.len() as u16);
        self.incoming.put_slice(payload);
    }

    /// Send every complete frame in `outgoing` as a datagram.
    fn poll_drain(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        use bytes::Buf;

        while self.outgoing.len() >= 2 {
            let len = u16::from_be_bytes([self.outgoing[0], self.outgoing[1]]) as usize;
            if self.outgoing.len() < 2 + len {
                break;
            }
            let payload = &self.outgoing[2..2 + len];
            let sent = match &self.source {
                FlowSource::Connected(socket) => socket.poll_send(cx, payload),
                FlowSource::Demuxed { socket, .. } => socket.poll_send_to(cx, payload, self.peer),
            };
            std::task::ready!(sent)?;
            self.outgoing.advance(2 + len);
            self.last_activity = tokio::time::Instant::now();
        }
        std::task::Poll::Ready(Ok(()))
    }

    /// Pending until the flow has been idle for `idle`, then end of stream.
    fn poll_idle(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        loop {
            let deadline = self.last_activity + self.idle;
            if self.idle_timer.deadline() != deadline {
                self.idle_timer.as_mut().reset(deadline);
            }
            std::task::ready!(std::future::Future::poll(self.idle_timer.as_mut(), cx));
            // traffic written meanwhile moved the deadline
            if self.last_activity + self.idle <= tokio::time::Instant::now() {
                tracing::debug!(peer = %self.peer, idle = ?self.idle, "udp flow idle, closing");
                return std::task::Poll::Ready(Ok(()));
            }
        }
    }
}

impl tokio::io::AsyncRead for UdpFlow {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use bytes::Buf;

        let this = self.get_mut();

        if this.incoming.is_empty() {
            let received = match &mut this.source {
                FlowSource::Connected(socket) => {
                    let mut datagram = tokio::io::ReadBuf::new(&mut this.scratch);
                    match socket.poll_recv(cx, &mut datagram) {
                        std::task::Poll::Ready(result) => {
                            result?;
                            Some(bytes::Bytes::copy_from_slice(datagram.filled()))
                        }
                        std::task::Poll::Pending => None,
                    }
                }
                FlowSource::Demuxed { rx, .. } => match rx.poll_recv(cx) {
                    std::task::Poll::Ready(Some(payload)) => Some(payload),
                    // listener gone: end of stream
                    std::task::Poll::Ready(None) => return std::task::Poll::Ready(Ok(())),
                    std::task::Poll::Pending => None,
                },
            };
            match received {
                Some(payload) => {
                    this.push_frame(&payload);
                    this.last_activity = tokio::time::Instant::now();
                }
                None => return this.poll_idle(cx),
            }
        }

        let n = this.incoming.len().min(buf.remaining());
        buf.put_slice(&this.incoming[..n]);
        this.incoming.advance(n);
        std::task::Poll::Ready(Ok(()))
    }
}

impl tokio::io::AsyncWrite for UdpFlow {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.outgoing.len() >= 2 + MAX_DATAGRAM {
            std::task::ready!(this.poll_drain(cx))?;
        }

        let room = (2 + MAX_DATAGRAM).saturating_sub(this.outgoing.len()).max(1);
        let n = buf.len().min(room);
        this.outgoing.extend_from_slice(&buf[..n]);

        if let std::task::Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return std::task::Poll::Ready(Err(e));
        }
        std::task::Poll::Ready(Ok(n))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.get_mut().poll_drain(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.get_mut().poll_drain(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const IDLE: std::time::Duration = std::time::Duration::from_secs(60);

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn tcp_listener_and_dial() {
        let mut listener = LocalListener::bind(NetworkType::Tcp, 0, IDLE).await.unwrap();
        let port = listener.local_port().unwrap();
        assert_ne!(port, 0);

        let dialed = tokio::spawn(async move {
            dial(NetworkType::Tcp, port, std::time::Duration::from_secs(5), IDLE).await
        });
        let (accepted, _) = listener.accept().await.unwrap();
        let dialed = dialed.await.unwrap().unwrap();
        assert_eq!(accepted.shutdown(), crate::forward::Shutdown::HalfClose);
        assert_eq!(dialed.shutdown(), crate::forward::Shutdown::HalfClose);
    }

    #[tokio::test]
    async fn dial_refused_is_an_error() {
        // grab a free port, then close it
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let err = dial(NetworkType::Tcp, port, std::time::Duration::from_secs(5), IDLE)
            .await
            .unwrap_err();
        assert!(matches!(err, LocalError::Io { .. }), "{err}");
    }

    #[tokio::test]
    async fn connected_flow_preserves_datagram_boundaries() {
        let echo = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let (n, from) = echo.recv_from(&mut buf).await.unwrap();
                echo.send_to(&buf[..n], from).await.unwrap();
            }
        });

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(echo_addr).await.unwrap();
        let mut flow = UdpFlow::connected(socket, echo_addr, IDLE);

        // two frames in one write, the second split across writes
        let mut bytes = frame(b"ping");
        let second = frame(b"hello world");
        bytes.extend_from_slice(&second[..5]);
        flow.write_all(&bytes).await.unwrap();
        flow.write_all(&second[5..]).await.unwrap();
        flow.flush().await.unwrap();

        let mut got = vec![0u8; frame(b"ping").len() + second.len()];
        flow.read_exact(&mut got).await.unwrap();
        let mut expected = frame(b"ping");
        expected.extend_from_slice(&second);
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn udp_listener_demultiplexes_sources() {
        let mut listener = UdpListener::bind(0, IDLE).await.unwrap();
        let listen_addr = listener.socket.local_addr().unwrap();

        let one = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let two = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        one.send_to(b"from one", listen_addr).await.unwrap();

        let (mut flow_one, addr_one) = listener.accept().await.unwrap();
        assert_eq!(addr_one, one.local_addr().unwrap());

        two.send_to(b"from two", listen_addr).await.unwrap();
        let (mut flow_two, addr_two) = listener.accept().await.unwrap();
        assert_eq!(addr_two, two.local_addr().unwrap());
        assert_eq!(flow_two.peer_addr(), addr_two);

        let mut got = vec![0u8; frame(b"from one").len()];
        flow_one.read_exact(&mut got).await.unwrap();
        assert_eq!(got, frame(b"from one"));

        let mut got = vec![0u8; frame(b"from two").len()];
        flow_two.read_exact(&mut got).await.unwrap();
        assert_eq!(got, frame(b"from two"));

        // replies go back to the right source
        flow_two.write_all(&frame(b"reply")).await.unwrap();
        flow_two.flush().await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = two.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(from, listen_addr);
    }

    #[tokio::test]
    async fn idle_flow_ends_and_releases_its_source() {
        let idle = std::time::Duration::from_millis(200);
        let mut listener = UdpListener::bind(0, idle).await.unwrap();
        let listen_addr = listener.socket.local_addr().unwrap();
        let app = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        app.send_to(b"first", listen_addr).await.unwrap();
        let (mut flow, _) = listener.accept().await.unwrap();
        let mut got = vec![0u8; frame(b"first").len()];
        flow.read_exact(&mut got).await.unwrap();

        // a reply counts as traffic and keeps the flow alive
        tokio::time::sleep(idle / 2).await;
        flow.write_all(&frame(b"reply")).await.unwrap();
        flow.flush().await.unwrap();
        let started = tokio::time::Instant::now();

        let mut rest = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(5), flow.read_to_end(&mut rest))
            .await
            .expect("idle flow must end")
            .unwrap();
        assert!(rest.is_empty());
        assert!(started.elapsed() >= idle / 2);
        drop(flow);

        // the same source gets a fresh flow afterwards
        app.send_to(b"again", listen_addr).await.unwrap();
        let (mut again, from) = listener.accept().await.unwrap();
        assert_eq!(from, app.local_addr().unwrap());
        let mut got = vec![0u8; frame(b"again").len()];
        again.read_exact(&mut got).await.unwrap();
        assert_eq!(got, frame(b"again"));
    }

    #[tokio::test]
    async fn dialed_flow_ends_when_service_stays_silent() {
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let local = dial(
            NetworkType::Udp,
            port,
            std::time::Duration::from_secs(5),
            std::time::Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(local.shutdown(), crate::forward::Shutdown::Drop);

        // the far side acts like a client: it lets go of the stream at EOF
        let (stream, remote) = tokio::io::duplex(1024);
        let far = tokio::spawn(async move {
            let mut remote = remote;
            let mut rest = Vec::new();
            remote.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let traffic = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            crate::forward::pipe(stream.into(), local),
        )
        .await
        .expect("pipe must finish once the flow is idle");
        assert_eq!(traffic, crate::forward::Traffic::default());
        assert!(far.await.unwrap().is_empty());
    }
}
