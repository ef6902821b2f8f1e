//! Shared configuration library for Pictor.
//!
//! This crate centralizes config loading and validation so the server binary
//! and integration tooling share a single source of truth for defaults,
//! environment overrides, and guard rails.

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigLoadError, load};
pub use models::{
    Config, DatabaseConfig, ExtensionsConfig, ServerConfig, WatchConfig,
};
pub use validation::{ConfigWarning, validate};
