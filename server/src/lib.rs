//! The resident launcher broker.
//!
//! The broker owns the per-user `Launcher` endpoint, accepts connections from
//! text-service clients, and routes each session's messages to the backend
//! selected by its `init` handshake. It performs no input-method logic of its
//! own.
//!
//! Scheduling is cooperative and single-threaded: the binary runs a
//! current-thread runtime, the accept loop is one task, and each connection
//! gets its own task that processes messages to completion, one at a time.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use pime_common::{EndpointListener, SecurityPolicy};

use crate::registry::BackendRegistry;
use crate::session::ClientSession;

pub mod lifecycle;
pub mod registry;
pub mod session;

/// The connection multiplexer: binds the listening endpoint and fans incoming
/// connections out to per-session tasks until a session asks the launcher to
/// quit.
pub struct LauncherServer {
    endpoint_name: String,
    registry: Arc<BackendRegistry>,
    policy: Arc<SecurityPolicy>,
}

impl LauncherServer {
    /// Build the server for `endpoint_name`. Constructing the access policy
    /// happens here: without one there must be no endpoint, so failure is
    /// startup-fatal.
    pub fn new(endpoint_name: String, registry: Arc<BackendRegistry>) -> Result<Self> {
        let policy = SecurityPolicy::build().context("endpoint access policy construction failed")?;
        Ok(Self {
            endpoint_name,
            registry,
            policy: Arc::new(policy),
        })
    }

    /// Accept and serve clients until quit is requested, then release every
    /// backend and return.
    ///
    /// Session failures never reach this loop; a misbehaving client costs
    /// only its own session.
    pub async fn run(&self) -> Result<()> {
        let mut listener = EndpointListener::bind(&self.endpoint_name, self.policy.clone())
            .with_context(|| format!("failed to create endpoint {}", self.endpoint_name))?;

        tracing::info!(endpoint = %self.endpoint_name, "launcher accepting clients");

        let (quit_tx, mut quit_rx) = mpsc::channel::<()>(1);
        let mut session_counter: u64 = 0;

        loop {
            tokio::select! {
                _ = quit_rx.recv() => {
                    tracing::info!("quit requested, shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        session_counter += 1;
                        tracing::debug!(session = session_counter, "client connected");
                        let session = ClientSession::new(stream, session_counter);
                        let registry = self.registry.clone();
                        let quit = quit_tx.clone();
                        tokio::spawn(session.run(registry, quit));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
            }
        }

        // Outstanding session tasks die with the runtime; the backends are
        // released here, before the process goes away.
        self.registry.finalize();
        Ok(())
    }
}
