//! gRPC service wrapper around a tonic router.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use keel::{FatalReporter, Service};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tracing::{error, info, warn};

use crate::listener::{bind_tcp, AcceptedConn, ConnContext, ListenerChain};

const DEFAULT_MAX_CONNS: usize = 10_000;
// gRPC connections are long-lived HTTP/2; probe less aggressively.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

/// Managed gRPC server. Built from a `tonic` router, served behind the
/// same bounded listener chain as the HTTP service, with graceful stop
/// raced against the shutdown deadline and a forceful stop on timeout.
pub struct GrpcService {
    name: String,
    addr: String,
    router: Option<tonic::transport::server::Router>,
    max_conns: usize,
    keep_alive: Duration,
    reporter: Option<FatalReporter>,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    stop_token: CancellationToken,
    task: JoinHandle<()>,
}

impl GrpcService {
    pub fn new(name: &str, addr: &str, router: tonic::transport::server::Router) -> Self {
        Self {
            name: name.to_string(),
            addr: addr.to_string(),
            router: Some(router),
            max_conns: DEFAULT_MAX_CONNS,
            keep_alive: DEFAULT_KEEP_ALIVE,
            reporter: None,
            running: None,
        }
    }

    pub fn with_max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    pub fn with_keep_alive(mut self, period: Duration) -> Self {
        self.keep_alive = period;
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }
}

#[async_trait::async_trait]
impl Service for GrpcService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .with_context(|| format!("invalid listen address {:?}", self.addr))?;
        let router = self
            .router
            .take()
            .context("gRPC service was already started once")?;

        let listener = bind_tcp(addr, false).with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;

        let chain = ListenerChain::new(self.keep_alive, Vec::new(), self.max_conns);
        let stop_token = shutdown.child_token();
        let incoming = incoming_stream(listener, chain, stop_token.clone());

        let graceful = {
            let token = stop_token.clone();
            async move { token.cancelled().await }
        };
        let serve = router.serve_with_incoming_shutdown(incoming, graceful);

        let name = self.name.clone();
        let reporter = self.reporter.clone();
        let task = keel::spawn_guarded(&self.name, self.reporter.clone(), async move {
            if let Err(err) = serve.await {
                error!(error = %err, service = %name, "gRPC service crashed");
                if let Some(reporter) = reporter {
                    reporter.report(
                        anyhow::Error::new(err).context(format!("gRPC service {name} failed")),
                    );
                }
            }
        });

        info!(
            service = %self.name,
            protocol = "gRPC (HTTP/2)",
            address = %local_addr,
            pid = std::process::id(),
            "Service listening"
        );

        self.running = Some(Running {
            local_addr,
            stop_token,
            task,
        });
        Ok(())
    }

    async fn stop(&mut self, deadline: CancellationToken) -> anyhow::Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        // Cancelling the token starts tonic's graceful stop: the listener
        // closes and in-flight RPCs are allowed to finish.
        running.stop_token.cancel();

        let mut task = running.task;
        tokio::select! {
            _ = &mut task => Ok(()),
            _ = deadline.cancelled() => {
                warn!(service = %self.name, "graceful stop deadline exceeded, aborting gRPC server");
                task.abort();
                Err(anyhow::anyhow!("graceful stop timed out, gRPC server aborted"))
            }
        }
    }

    fn set_fatal_reporter(&mut self, reporter: FatalReporter) {
        self.reporter = Some(reporter);
    }
}

fn incoming_stream(
    listener: TcpListener,
    chain: ListenerChain,
    stop: CancellationToken,
) -> impl futures::Stream<Item = Result<TrackedStream, std::io::Error>> {
    futures::stream::unfold((listener, chain, stop), |(listener, chain, stop)| async move {
        let accepted = tokio::select! {
            _ = stop.cancelled() => return None,
            accepted = chain.accept(&listener) => accepted,
        };
        let item = accepted.map(
            |AcceptedConn {
                 stream,
                 context,
                 permit,
             }| TrackedStream {
                inner: stream,
                context,
                _permit: permit,
            },
        );
        Some((item, (listener, chain, stop)))
    })
}

/// A TCP stream that holds its admission permit for its whole lifetime
/// and carries the chain's per-connection context. The context is the
/// stream's connect-info, so tonic places it in every request's
/// extensions (`request.extensions().get::<ConnContext>()`).
pub struct TrackedStream {
    inner: TcpStream,
    context: ConnContext,
    _permit: OwnedSemaphorePermit,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connected for TrackedStream {
    type ConnectInfo = ConnContext;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.context
    }
}
