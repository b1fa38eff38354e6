//! Prefork worker HTTP server.
//!
//! A supervisor process binds the listening socket, spawns a fixed pool of
//! worker processes that all accept from it, and keeps the pool healthy:
//! crashed workers are respawned, silent workers are recycled after the
//! configured timeout, and operator signals drive graceful shutdown, pool
//! scaling, and in-place binary upgrades.
//!
//! # Architecture Overview
//!
//! ```text
//!             ┌───────────────────────────────────────────────────┐
//!             │                    SUPERVISOR                      │
//!             │                                                    │
//!             │  config ─▶ net/listener ─▶ supervisor (spawn,      │
//!             │                            monitor, recycle)       │
//!             │                │ fd 3 (listener)   fd 4 (status)   │
//!             └────────────────┼──────────┬──────────┬────────────┘
//!                              ▼          ▼          ▼
//!                          worker 0   worker 1  …  worker N
//!                         accept loop, hooks, access log
//! ```
//!
//! The application behind the workers is an injectable async handler; this
//! crate owns everything up to that seam and nothing behind it.

pub mod config;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;
pub mod supervisor;
pub mod worker;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use hooks::HookRegistry;
pub use server::Server;
pub use worker::{default_app, Handler};
