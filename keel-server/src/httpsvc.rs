//! HTTP service: listener chain, optional TLS, optional HTTP/3, serve
//! loops, graceful shutdown.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use axum::{Extension, Router};
use http::HeaderValue;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use keel::{FatalReporter, Service};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, error, info, warn};

use crate::listener::{bind_tcp, bind_udp, AcceptedConn, ListenerChain};
use crate::observability::ObservabilityConfig;
use crate::{http3, DatagramMiddleware, StreamMiddleware};

/// Request headers are capped; bodies are not (streaming uploads are a
/// first-class use case; slow clients are an L4 concern).
const MAX_HEADER_BYTES: usize = 1024 * 1024;

const DEFAULT_MAX_CONNS: usize = 100_000;
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(3 * 60);
const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A production HTTP service: bounded listener chain, optional TLS via a
/// certificate manager, optional HTTP/3 on a datagram socket bound to the
/// same address, and fatal-error reporting from its serve loops.
pub struct HttpService {
    name: String,
    addr: String,
    router: Router,
    observability: ObservabilityConfig,
    cert: Option<Arc<keel_cert::Manager>>,
    http3: bool,
    reuse_port: bool,
    max_conns: usize,
    keep_alive: Duration,
    header_read_timeout: Duration,
    idle_timeout: Duration,
    stream_middlewares: Vec<StreamMiddleware>,
    datagram_middlewares: Vec<DatagramMiddleware>,
    reporter: Option<FatalReporter>,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    accept_token: CancellationToken,
    drain_token: CancellationToken,
    serve_task: JoinHandle<()>,
    h3: Option<H3Running>,
}

struct H3Running {
    endpoint: quinn::Endpoint,
    task: JoinHandle<()>,
}

impl HttpService {
    pub fn new(name: &str, addr: &str, router: Router) -> Self {
        Self {
            name: name.to_string(),
            addr: addr.to_string(),
            router,
            observability: ObservabilityConfig::default(),
            cert: None,
            http3: false,
            reuse_port: false,
            max_conns: DEFAULT_MAX_CONNS,
            keep_alive: DEFAULT_KEEP_ALIVE,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            stream_middlewares: Vec::new(),
            datagram_middlewares: Vec::new(),
            reporter: None,
            running: None,
        }
    }

    /// Terminate TLS with certificates from the given manager.
    pub fn with_tls(mut self, manager: Arc<keel_cert::Manager>) -> Self {
        self.cert = Some(manager);
        self
    }

    /// Additionally serve HTTP/3 over QUIC. Requires [`with_tls`](Self::with_tls).
    pub fn with_http3(mut self) -> Self {
        self.http3 = true;
        self
    }

    /// Ask the OS for SO_REUSEPORT so multiple processes can share the
    /// port with kernel-level load balancing.
    pub fn with_reuse_port(mut self) -> Self {
        self.reuse_port = true;
        self
    }

    pub fn with_max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    pub fn with_keep_alive(mut self, period: Duration) -> Self {
        self.keep_alive = period;
        self
    }

    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    /// Raw-connection middleware (proxy protocol, IP allow/deny). Runs
    /// before context attachment.
    pub fn with_stream_middleware(mut self, middleware: StreamMiddleware) -> Self {
        self.stream_middlewares.push(middleware);
        self
    }

    /// Datagram-socket tuning middleware, applied at bind time after the
    /// default buffer enlargement.
    pub fn with_datagram_middleware(mut self, middleware: DatagramMiddleware) -> Self {
        self.datagram_middlewares.push(middleware);
        self
    }

    pub fn with_observability(mut self, cfg: ObservabilityConfig) -> Self {
        self.observability = cfg;
        self
    }

    /// Bound address once started; useful with `:0` listeners in tests.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }
}

#[async_trait::async_trait]
impl Service for HttpService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .with_context(|| format!("invalid listen address {:?}", self.addr))?;

        if self.http3 && self.cert.is_none() {
            anyhow::bail!("HTTP/3 requires TLS, attach a certificate manager with with_tls()");
        }

        // Stream listener first, then the datagram socket on the same
        // port. A UDP bind failure returns here and drops the stream
        // listener with it: no partial bind.
        let listener = bind_tcp(addr, self.reuse_port)
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;

        let udp = if self.http3 {
            Some(
                bind_udp(local_addr, self.reuse_port, &self.datagram_middlewares)
                    .with_context(|| format!("failed to bind datagram socket on {local_addr}"))?,
            )
        } else {
            None
        };

        // TLS configuration; the certificate manager is started
        // (idempotently) so its watcher follows this service's lifetime.
        let mut protocol = "HTTP";
        let tls = match &self.cert {
            Some(manager) => {
                protocol = "HTTPS";
                manager.start(shutdown.clone());
                let config = build_tls_config(manager.clone())?;
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            None => None,
        };

        // Final handler chain: business handler, observability or minimal
        // panic recovery, and the Alt-Svc advertisement outermost.
        let mut app = crate::observability::wrap(&self.observability, self.router.clone());
        if self.http3 {
            let alt_svc = HeaderValue::from_str(&format!(
                "h3=\":{}\"; ma=2592000",
                local_addr.port()
            ))?;
            app = app.layer(SetResponseHeaderLayer::overriding(
                http::header::ALT_SVC,
                alt_svc,
            ));
        }

        let h3 = match udp {
            Some(udp) => {
                let manager = self.cert.clone().expect("checked above");
                let endpoint = build_h3_endpoint(udp, manager, self.idle_timeout)?;
                let task = keel::spawn_guarded(
                    &format!("{}-http3", self.name),
                    self.reporter.clone(),
                    http3::serve(endpoint.clone(), app.clone()),
                );
                info!(
                    service = %self.name,
                    protocol = "HTTP/3 (QUIC)",
                    address = %local_addr,
                    pid = std::process::id(),
                    "Service listening"
                );
                Some(H3Running { endpoint, task })
            }
            None => None,
        };

        let accept_token = shutdown.child_token();
        let drain_token = CancellationToken::new();
        let chain = ListenerChain::new(
            self.keep_alive,
            self.stream_middlewares.clone(),
            self.max_conns,
        );

        let loop_args = StreamLoop {
            name: self.name.clone(),
            listener,
            chain,
            tls,
            app,
            header_read_timeout: self.header_read_timeout,
            idle_timeout: self.idle_timeout,
            accept_token: accept_token.clone(),
            drain_token: drain_token.clone(),
            reporter: self.reporter.clone(),
        };
        let serve_task = keel::spawn_guarded(
            &self.name,
            self.reporter.clone(),
            serve_stream(loop_args),
        );

        info!(
            service = %self.name,
            protocol = protocol,
            address = %local_addr,
            pid = std::process::id(),
            "Service listening"
        );

        self.running = Some(Running {
            local_addr,
            accept_token,
            drain_token,
            serve_task,
            h3,
        });
        Ok(())
    }

    async fn stop(&mut self, deadline: CancellationToken) -> anyhow::Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let mut errors: Vec<String> = Vec::new();

        // HTTP/3 first: closing the endpoint releases the datagram
        // socket and ends the QUIC serve loop.
        if let Some(h3) = running.h3 {
            h3.endpoint.close(0u32.into(), b"server shutdown");
            let mut task = h3.task;
            tokio::select! {
                _ = &mut task => {}
                _ = deadline.cancelled() => {
                    task.abort();
                    errors.push("HTTP/3 serve loop did not stop before the deadline".to_string());
                }
            }
        }

        // Stream side: stop accepting, ask open connections to finish,
        // then wait bounded by the deadline.
        running.accept_token.cancel();
        let mut serve_task = running.serve_task;
        tokio::select! {
            _ = &mut serve_task => {}
            _ = deadline.cancelled() => {
                running.drain_token.cancel();
                if tokio::time::timeout(Duration::from_secs(1), &mut serve_task)
                    .await
                    .is_err()
                {
                    serve_task.abort();
                }
                errors.push("graceful shutdown deadline exceeded, open connections aborted".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(errors.join("; ")))
        }
    }

    fn set_fatal_reporter(&mut self, reporter: FatalReporter) {
        self.reporter = Some(reporter);
    }
}

struct StreamLoop {
    name: String,
    listener: TcpListener,
    chain: ListenerChain,
    tls: Option<TlsAcceptor>,
    app: Router,
    header_read_timeout: Duration,
    idle_timeout: Duration,
    accept_token: CancellationToken,
    drain_token: CancellationToken,
    reporter: Option<FatalReporter>,
}

async fn serve_stream(args: StreamLoop) {
    let StreamLoop {
        name,
        listener,
        chain,
        tls,
        app,
        header_read_timeout,
        idle_timeout,
        accept_token,
        drain_token,
        reporter,
    } = args;

    let tracker = TaskTracker::new();

    loop {
        let accepted = tokio::select! {
            _ = accept_token.cancelled() => break,
            accepted = chain.accept(&listener) => accepted,
        };

        let AcceptedConn {
            stream,
            context,
            permit,
        } = match accepted {
            Ok(accepted) => accepted,
            Err(err) if is_transient_accept_error(&err) => {
                warn!(service = %name, error = %err, "transient accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            Err(err) => {
                error!(service = %name, error = %err, "HTTP service accept loop failed");
                if let Some(reporter) = &reporter {
                    reporter.report(
                        anyhow::Error::new(err).context(format!("HTTP service {name} failed")),
                    );
                }
                break;
            }
        };

        let svc = app.clone().layer(Extension(context));
        let tls = tls.clone();
        let stop = accept_token.clone();
        tracker.spawn(async move {
            let _permit = permit;
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        serve_connection(stream, svc, header_read_timeout, idle_timeout, stop)
                            .await
                    }
                    Err(err) => debug!(error = %err, "TLS handshake failed"),
                },
                None => {
                    serve_connection(stream, svc, header_read_timeout, idle_timeout, stop).await
                }
            }
        });
    }

    tracker.close();
    tokio::select! {
        _ = tracker.wait() => debug!(service = %name, "all connections drained"),
        _ = drain_token.cancelled() => {
            warn!(service = %name, "shutdown deadline reached with connections still open")
        }
    }
}

async fn serve_connection<IO>(
    io: IO,
    svc: Router,
    header_read_timeout: Duration,
    idle_timeout: Duration,
    stop: CancellationToken,
) where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout)
        .max_buf_size(MAX_HEADER_BYTES);
    builder.http2().timer(TokioTimer::new());

    let epoch = tokio::time::Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));
    let io = TrackActivity {
        inner: io,
        last_activity_ms: last_activity.clone(),
        epoch,
    };

    let hyper_svc = TowerToHyperService::new(svc);
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), hyper_svc);
    tokio::pin!(conn);

    // Idle discipline: the deadline trails the last byte of I/O by
    // `idle_timeout`, so keep-alive connections get closed while
    // streaming transfers stay untouched. Zero disables the bound.
    let bound_idle = !idle_timeout.is_zero();
    let mut draining = false;
    loop {
        let idle_deadline =
            epoch + Duration::from_millis(last_activity.load(Ordering::Relaxed)) + idle_timeout;
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    debug!(error = %err, "connection error");
                }
                return;
            }
            _ = stop.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = tokio::time::sleep_until(idle_deadline), if bound_idle && !draining => {
                // Activity may have moved the deadline while we slept;
                // the loop recomputes it, so only act when still stale.
                let latest = epoch
                    + Duration::from_millis(last_activity.load(Ordering::Relaxed))
                    + idle_timeout;
                if tokio::time::Instant::now() >= latest {
                    debug!("closing idle connection");
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    }
}

/// IO wrapper stamping the instant of the last successful read or write,
/// as milliseconds since the connection was accepted.
struct TrackActivity<IO> {
    inner: IO,
    last_activity_ms: Arc<AtomicU64>,
    epoch: tokio::time::Instant,
}

impl<IO> TrackActivity<IO> {
    fn touch(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

impl<IO: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for TrackActivity<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) {
            this.touch();
        }
        result
    }
}

impl<IO: tokio::io::AsyncWrite + Unpin> tokio::io::AsyncWrite for TrackActivity<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(result, Poll::Ready(Ok(_))) {
            this.touch();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

/// TLS 1.3 only, certificates resolved through the manager on every
/// handshake, ALPN advertising h3/h2/http1.1.
fn build_tls_config(manager: Arc<keel_cert::Manager>) -> anyhow::Result<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable in the crypto provider")?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(keel_cert::Resolver::new(manager)));
    config.alpn_protocols = vec![b"h3".to_vec(), b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn build_h3_endpoint(
    udp: std::net::UdpSocket,
    manager: Arc<keel_cert::Manager>,
    idle_timeout: Duration,
) -> anyhow::Result<quinn::Endpoint> {
    let mut tls = build_tls_config(manager)?;
    tls.alpn_protocols = vec![b"h3".to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .context("rustls config not usable for QUIC")?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(idle_timeout).context("idle timeout out of range")?,
    ));
    server_config.transport_config(Arc::new(transport));

    let endpoint = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        Some(server_config),
        udp,
        Arc::new(quinn::TokioRuntime),
    )
    .context("failed to create QUIC endpoint")?;
    Ok(endpoint)
}
