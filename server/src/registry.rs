//! The backend registry boundary.
//!
//! Engine backends live outside this crate; the launcher only needs a handler
//! it can register clients with, feed request strings to, and tear down at
//! shutdown. The registry maps stable profile identifiers (GUID-shaped
//! strings on the wire) to such handlers. Entries outlive individual client
//! sessions; several sessions may be bound to the same backend at once.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// One input-method backend, addressed by its profile identifier.
///
/// Implementations are shared across sessions and must tolerate concurrent
/// calls for different client ids; the launcher never issues two concurrent
/// calls for the same client id.
pub trait Backend: Send + Sync {
    /// Register a new client and issue its id.
    fn register_client(&self) -> String;

    /// Process one request string for the given client and produce the
    /// response to send back.
    fn handle_request(&self, client_id: &str, message: &str) -> String;

    /// Drop a client registration. Best-effort; called when the client's
    /// session disconnects.
    fn unregister_client(&self, client_id: &str);

    /// Release everything the backend holds. Called once, at launcher
    /// shutdown.
    fn shutdown(&self);
}

/// Maps profile identifiers to backends for the life of the process.
pub struct BackendRegistry {
    base_dir: PathBuf,
    entries: Mutex<HashMap<String, Arc<dyn Backend>>>,
}

impl BackendRegistry {
    /// Set up the registry. `base_dir` is the launcher's own directory;
    /// backends are located relative to it.
    pub fn initialize(base_dir: &Path) -> Self {
        tracing::info!(base_dir = %base_dir.display(), "backend registry initialized");
        Self {
            base_dir: base_dir.to_path_buf(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Directory backends resolve their resources against.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Make a backend reachable under `profile_guid`.
    pub fn insert(&self, profile_guid: &str, backend: Arc<dyn Backend>) {
        self.lock().insert(profile_guid.to_string(), backend);
    }

    /// Find the backend registered for `profile_guid`.
    pub fn lookup(&self, profile_guid: &str) -> Option<Arc<dyn Backend>> {
        self.lock().get(profile_guid).cloned()
    }

    /// Tear down every backend. Draining the map first makes a second call a
    /// no-op, so each backend is shut down exactly once.
    pub fn finalize(&self) {
        let drained: Vec<(String, Arc<dyn Backend>)> = self.lock().drain().collect();
        for (profile, backend) in drained {
            tracing::info!(profile = %profile, "shutting down backend");
            backend.shutdown();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Backend>>> {
        // A poisoned map is still a valid map.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Diagnostic backend answering status/version/echo requests.
///
/// Real engine backends run in their own processes; this one stands in for
/// them in demos and tests.
pub struct EchoBackend {
    profile: String,
    clients: Mutex<HashSet<String>>,
}

impl EchoBackend {
    pub fn new(profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
            clients: Mutex::new(HashSet::new()),
        }
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashSet<String>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Backend for EchoBackend {
    fn register_client(&self) -> String {
        let client_id = uuid::Uuid::new_v4().to_string();
        self.lock_clients().insert(client_id.clone());
        tracing::debug!(profile = %self.profile, client = %client_id, "client registered");
        client_id
    }

    fn handle_request(&self, client_id: &str, message: &str) -> String {
        let parsed: serde_json::Value = match serde_json::from_str(message) {
            Ok(value) => value,
            Err(_) => return serde_json::json!({ "success": false }).to_string(),
        };

        let response = match parsed.get("method").and_then(serde_json::Value::as_str) {
            Some("init") => serde_json::json!({ "success": true }),
            Some("status") => serde_json::json!({ "success": true, "data": "OK" }),
            Some("version") => {
                serde_json::json!({ "success": true, "data": env!("CARGO_PKG_VERSION") })
            }
            Some("echo") => serde_json::json!({
                "success": true,
                "client": client_id,
                "data": parsed.get("text").cloned().unwrap_or_default(),
            }),
            _ => serde_json::json!({ "success": false }),
        };
        response.to_string()
    }

    fn unregister_client(&self, client_id: &str) {
        if !self.lock_clients().remove(client_id) {
            tracing::warn!(profile = %self.profile, client = %client_id, "unregister for unknown client");
        }
    }

    fn shutdown(&self) {
        let remaining = self.lock_clients().drain().count();
        tracing::debug!(profile = %self.profile, remaining, "backend shut down");
    }
}
