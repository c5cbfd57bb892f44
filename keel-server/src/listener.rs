//! Listener binding and the per-connection enhancement chain.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// QUIC benefits from large socket buffers; this is applied to every
/// datagram socket before caller middlewares run.
const UDP_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Transform applied to each accepted stream before it is served. Runs
/// against the raw connection, ahead of context attachment, so proxy
/// protocol parsing or IP filtering sees exactly what arrived on the
/// wire. Returning an error drops the connection.
pub type StreamMiddleware = Arc<dyn Fn(TcpStream, SocketAddr) -> io::Result<TcpStream> + Send + Sync>;

/// Tuning hook applied to the datagram socket at bind time, after the
/// default buffer enlargement.
pub type DatagramMiddleware = Arc<dyn Fn(&Socket) -> io::Result<()> + Send + Sync>;

/// Per-connection context attached as a request extension once the raw
/// middlewares have run.
#[derive(Clone, Copy, Debug)]
pub struct ConnContext {
    pub peer: SocketAddr,
    pub accepted_at: Instant,
}

/// Bind a TCP listener, optionally asking the OS for port reuse.
pub fn bind_tcp(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Bind the datagram socket for HTTP/3 on the same address/port as the
/// stream listener, enlarge its buffers, and run caller middlewares.
pub fn bind_udp(
    addr: SocketAddr,
    reuse_port: bool,
    middlewares: &[DatagramMiddleware],
) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;

    socket.set_recv_buffer_size(UDP_BUFFER_BYTES)?;
    socket.set_send_buffer_size(UDP_BUFFER_BYTES)?;
    for middleware in middlewares {
        middleware(&socket)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Accepted connection together with its context and admission permit.
/// The permit must live as long as the connection; dropping it frees a
/// concurrency slot.
pub struct AcceptedConn {
    pub stream: TcpStream,
    pub context: ConnContext,
    pub permit: OwnedSemaphorePermit,
}

/// The ordered enhancement chain around a raw listener.
///
/// Accept path, outermost first: concurrency admission (a semaphore, so
/// overload blocks before any per-connection work), raw accept,
/// keep-alive configuration, caller middlewares, context attachment.
pub struct ListenerChain {
    keep_alive: Duration,
    middlewares: Vec<StreamMiddleware>,
    limiter: Arc<Semaphore>,
}

impl ListenerChain {
    pub fn new(keep_alive: Duration, middlewares: Vec<StreamMiddleware>, max_conns: usize) -> Self {
        Self {
            keep_alive,
            middlewares,
            limiter: Arc::new(Semaphore::new(max_conns)),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Accept the next connection through the chain. Waits for an
    /// admission slot before accepting, so the kernel backlog absorbs
    /// bursts past `max_conns`.
    pub async fn accept(&self, listener: &TcpListener) -> io::Result<AcceptedConn> {
        let permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "connection limiter closed"))?;

        let (stream, peer) = listener.accept().await?;

        if let Err(err) = set_keepalive(&stream, self.keep_alive) {
            debug!(peer = %peer, error = %err, "failed to configure TCP keep-alive");
        }

        let mut stream = stream;
        for middleware in &self.middlewares {
            stream = middleware(stream, peer)?;
        }

        Ok(AcceptedConn {
            stream,
            context: ConnContext {
                peer,
                accepted_at: Instant::now(),
            },
            permit,
        })
    }
}

fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(period))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_tcp_on_ephemeral_port() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap(), false).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn udp_binds_on_same_port_as_tcp() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = listener.local_addr().unwrap();
        let udp = bind_udp(addr, false, &[]).unwrap();
        assert_eq!(udp.local_addr().unwrap().port(), addr.port());
    }

    #[tokio::test]
    async fn reuse_port_allows_double_bind() {
        #[cfg(unix)]
        {
            let first = bind_tcp("127.0.0.1:0".parse().unwrap(), true).unwrap();
            let addr = first.local_addr().unwrap();
            bind_tcp(addr, true).expect("second SO_REUSEPORT bind must succeed");
        }
    }

    #[tokio::test]
    async fn chain_admission_caps_concurrent_connections() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = listener.local_addr().unwrap();
        let chain = ListenerChain::new(Duration::from_secs(60), Vec::new(), 2);

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();

        let a1 = chain.accept(&listener).await.unwrap();
        let _a2 = chain.accept(&listener).await.unwrap();
        assert_eq!(chain.available_permits(), 0);

        drop(a1);
        assert_eq!(chain.available_permits(), 1);
    }

    #[tokio::test]
    async fn middlewares_see_the_raw_connection() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = listener.local_addr().unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder: StreamMiddleware = {
            let seen = seen.clone();
            Arc::new(move |stream, peer| {
                seen.lock().unwrap().push(peer);
                Ok(stream)
            })
        };
        let chain = ListenerChain::new(Duration::from_secs(60), vec![recorder], 8);

        let client = TcpStream::connect(addr).await.unwrap();
        let accepted = chain.accept(&listener).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(accepted.context.peer, client.local_addr().unwrap());
    }
}
