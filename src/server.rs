//! Public server entry and role dispatch.
//!
//! The same binary runs in two roles: the supervisor (no role markers in the
//! environment) and workers (spawned by the supervisor with markers set). An
//! embedder builds a `Server` once in `main`; whichever role the process is
//! in, `run` does the right thing, so hooks and the application handler are
//! available in every process of the tree.

use std::io;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::hooks::HookRegistry;
use crate::net::LISTEN_FD_ENV;
use crate::observability;
use crate::supervisor::{Supervisor, CONFIG_ENV, WORKER_ID_ENV};
use crate::worker::{self, default_app, Handler};

/// Which half of the prefork model this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    Worker,
}

/// Decide the role from the environment markers set at worker spawn.
pub fn detect_role() -> Role {
    if std::env::var(WORKER_ID_ENV).is_ok() {
        Role::Worker
    } else {
        Role::Supervisor
    }
}

/// The assembled server: configuration, hooks, and the embedded application.
pub struct Server {
    config: ServerConfig,
    hooks: Arc<HookRegistry>,
    app: Handler,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            hooks: Arc::new(HookRegistry::new()),
            app: default_app(),
        }
    }

    /// Install lifecycle hooks.
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Install the embedded application handler.
    pub fn with_app(mut self, app: Handler) -> Self {
        self.app = app;
        self
    }

    /// Run this process in its detected role. Blocks until shutdown.
    pub fn run(self) -> Result<()> {
        match detect_role() {
            Role::Worker => {
                // Workers trust the configuration the supervisor resolved and
                // serialized for them, not their own command line.
                let config = match worker_config_from_env()? {
                    Some(config) => config,
                    None => self.config,
                };
                observability::logging::init(&config)?;

                // Workers are single-threaded; the pool class gets its
                // concurrency from tasks, not threads.
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(worker::run(config, self.hooks, self.app))
            }
            Role::Supervisor => {
                observability::logging::init(&self.config)?;

                // Detach before the runtime exists; forking after threads
                // start is not an option. Skipped across reexec, where the
                // process is already detached.
                if self.config.daemon && std::env::var(LISTEN_FD_ENV).is_err() {
                    nix::unistd::daemon(true, false).map_err(io::Error::from)?;
                }

                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(async move {
                    let mut supervisor =
                        Supervisor::start(self.config, self.hooks).await?;
                    supervisor.monitor().await
                })
            }
        }
    }
}

/// Deserialize the resolved configuration the supervisor exported.
fn worker_config_from_env() -> Result<Option<ServerConfig>> {
    match std::env::var(CONFIG_ENV) {
        Err(_) => Ok(None),
        Ok(json) => {
            let config: ServerConfig = serde_json::from_str(&json)
                .map_err(|e| ServerError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
            Ok(Some(config))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_defaults_to_supervisor() {
        // The test runner never carries worker markers.
        assert_eq!(detect_role(), Role::Supervisor);
    }
}
