//! Network services for the `keel` container.
//!
//! [`HttpService`] serves HTTP/1.1 and HTTP/2 over a protected listener
//! chain, optionally terminates TLS through `keel-cert`, and can serve
//! HTTP/3 over a datagram socket bound on the same address. [`GrpcService`]
//! wraps a tonic router behind the same chain. [`MonitorService`] exposes
//! the operational endpoints (`/healthz`, `/metrics`, `/debug/pprof`).

mod grpc;
mod http3;
mod httpsvc;
mod listener;
pub mod metrics;
mod monitor;
mod observability;
mod pprof_routes;

pub use grpc::GrpcService;
pub use httpsvc::HttpService;
pub use listener::{
    bind_tcp, bind_udp, ConnContext, DatagramMiddleware, ListenerChain, StreamMiddleware,
};
pub use monitor::{monitor_router, MonitorService};
pub use observability::{LogConfig, MetricsConfig, ObservabilityConfig, TraceConfig};
