//! Core library for the Pictor extension host.
//!
//! Installs, starts, supervises, and routes events to third-party extension
//! processes. Each extension runs as an isolated child with its own
//! interpreter environment and connects back over a persistent bidirectional
//! channel; this crate owns the registry and lifecycle manager, the event
//! router and capability dispatcher, the throttling scheduler, the
//! synchronisation engine, and the archive handler. The HTTP surface lives in
//! `pictor-server`.
#![allow(missing_docs)]

pub mod archive;
pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod installer;
pub mod manifest_rules;
pub mod notifier;
pub mod persistence;
pub mod provision;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod sync;
pub mod throttle;
#[cfg(feature = "unpacked-watch")]
pub mod watcher;

pub use error::{HostError, Result};
pub use host::ExtensionHost;
pub use notifier::Notifier;
pub use registry::ExtensionRegistry;
pub use router::ConnectionRouter;
pub use supervisor::ProcessSupervisor;
pub use throttle::ThrottleScheduler;
