//! Configuration subsystem.
//!
//! # Data Flow
//! ```text
//! TOML file → schema (serde) → CLI overrides → validation → ServerConfig
//! ```
//!
//! The resulting `ServerConfig` is immutable: built once at startup, owned by
//! the supervisor, and re-serialized into each worker's environment so every
//! process in the tree sees the same resolved settings.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{LogLevel, ServerConfig, TlsConfig, WorkerClass};
pub use validation::{validate_config, ValidationError};
