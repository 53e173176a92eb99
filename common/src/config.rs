use std::time::Duration;

/// Fixed namespace segment carried by every endpoint path this framework
/// derives. Existing clients hard-code it, so it is part of the wire contract.
pub const ENDPOINT_NAMESPACE: &str = "PIME";

/// Logical service name of the launcher's own control endpoint.
pub const LAUNCHER_SERVICE_NAME: &str = "Launcher";

/// Reserved control payload interpreted by the launcher itself rather than
/// forwarded to a backend.
pub const QUIT_COMMAND: &[u8] = b"quit";

/// One buffered read per protocol message. Matches the 4096-byte pipe buffers
/// the existing clients were written against.
pub const MESSAGE_BUFFER_SIZE: usize = 4096;

/// Bound on the pending-connection queue of the listening endpoint.
pub const LISTEN_BACKLOG: i32 = 32;

/// How long a new process waits for a reply after asking an already-running
/// instance to quit. Expiry means "no prior instance", not an error.
pub const QUIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(unix)]
const ENDPOINT_DIR_ENV: &str = "PIME_ENDPOINT_DIR";
#[cfg(unix)]
const DEFAULT_ENDPOINT_DIR: &str = "/tmp";

/// Base directory under which the per-user endpoint directories are created.
/// Overridable so tests can run against a private directory.
#[cfg(unix)]
pub fn endpoint_base_dir() -> std::path::PathBuf {
    let dir = std::env::var(ENDPOINT_DIR_ENV).unwrap_or(DEFAULT_ENDPOINT_DIR.to_string());
    std::path::PathBuf::from(dir)
}
