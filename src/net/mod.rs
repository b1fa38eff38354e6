//! Network foundation.
//!
//! # Responsibilities
//! - Create the listening socket with an explicit backlog
//! - Hand the bound socket across process boundaries (worker spawn, reexec)
//! - Rebuild an async listener from an inherited descriptor

pub mod listener;

pub use listener::{BindError, BoundSocket, LISTEN_FD_ENV};
