//! Service container: one entry point that owns the lifecycle of a set of
//! long-running components in a single process.
//!
//! A [`Container`] starts registered [`Service`]s in order with rollback
//! on partial failure, multiplexes the two termination sources (an OS
//! signal and a fatal runtime error reported by any managed service) into
//! a single shutdown cause, and tears everything down in reverse
//! registration order under a bounded deadline.

mod container;
mod panic;
mod service;
mod signals;
mod snapshot;

pub use container::{Container, ContainerError, ContainerOptions, ShutdownHandle};
pub use panic::spawn_guarded;
pub use service::{FatalReporter, Service};
pub use snapshot::redact_sensitive;
