//! # relq-core
//!
//! Core types shared by every relq crate. This crate has no dependency on the
//! query engine itself and provides the foundation for all other crates.
//!
//! ## Modules
//!
//! - [`error`] - Error types and result aliases
//! - [`settings`] - Engine settings and database configuration
//! - [`settings_loader`] - Loading settings from TOML, JSON, and the environment
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{RelqError, RelqResult};
pub use settings::{DatabaseSettings, Settings};
