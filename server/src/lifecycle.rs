//! Process lifecycle: the single-running-instance handshake and the startup
//! sequence of the launcher itself.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::time::timeout;

use pime_common::config::{LAUNCHER_SERVICE_NAME, QUIT_COMMAND, QUIT_REQUEST_TIMEOUT};
use pime_common::endpoint::derive_endpoint_name;
use pime_common::{protocol, EndpointStream};

use crate::registry::BackendRegistry;
use crate::LauncherServer;

/// Ask whatever is listening on the current user's launcher endpoint to quit.
///
/// Returns `Ok(true)` if an instance was found and told to quit, `Ok(false)`
/// if nothing was listening. Both are success: "no prior instance" is the
/// normal case on a fresh start.
pub async fn request_existing_instance_quit() -> Result<bool> {
    let endpoint = derive_endpoint_name(LAUNCHER_SERVICE_NAME)
        .context("cannot derive the launcher endpoint")?;
    request_quit_at(&endpoint).await
}

/// As [`request_existing_instance_quit`], against an explicit endpoint.
pub async fn request_quit_at(endpoint: &str) -> Result<bool> {
    let mut stream = match timeout(QUIT_REQUEST_TIMEOUT, EndpointStream::connect(endpoint)).await {
        Ok(Ok(stream)) => stream,
        // Connection refused, missing endpoint, or a wait that ran out all
        // mean the same thing here: no instance to quit.
        Ok(Err(e)) => {
            tracing::debug!(endpoint, error = %e, "no running instance found");
            return Ok(false);
        }
        Err(_) => {
            tracing::debug!(endpoint, "connect timed out, treating as no instance");
            return Ok(false);
        }
    };

    if let Err(e) = protocol::write_message(&mut stream, QUIT_COMMAND).await {
        // The instance went away between connect and write; good enough.
        tracing::debug!(endpoint, error = %e, "instance disappeared before quit was sent");
        return Ok(true);
    }

    // The launcher quits without replying; wait briefly so it has actually
    // seen the message before we return.
    let _ = timeout(QUIT_REQUEST_TIMEOUT, protocol::read_message(&mut stream)).await;
    tracing::info!(endpoint, "asked running instance to quit");
    Ok(true)
}

/// Directory the launcher executable lives in. Backends are located relative
/// to it.
pub fn executable_directory() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot resolve own executable path")?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow!("executable path {} has no parent", exe.display()))?;
    Ok(dir.to_path_buf())
}

/// Ask the OS to restart the launcher if it crashes. Best-effort: clients
/// reconnect on their own once a new instance owns the endpoint, so failure
/// here is logged and ignored.
#[cfg(windows)]
pub fn register_crash_restart() {
    use windows_sys::Win32::System::Recovery::RegisterApplicationRestart;

    // SAFETY: a null command line registers a restart with no extra
    // arguments; no buffers are borrowed.
    let status = unsafe { RegisterApplicationRestart(std::ptr::null(), 0) };
    if status < 0 {
        tracing::warn!(status, "crash-restart registration failed");
    } else {
        tracing::debug!("crash-restart registration done");
    }
}

/// Crash recovery is the service manager's job on this platform.
#[cfg(unix)]
pub fn register_crash_restart() {
    tracing::debug!("crash-restart registration not supported on this platform");
}

/// Full server startup: pin the working directory to the executable's
/// directory, register crash restart, initialize the backend registry, then
/// bind the endpoint and serve until quit.
pub async fn run_server() -> Result<()> {
    let top_dir = executable_directory()?;
    std::env::set_current_dir(&top_dir)
        .with_context(|| format!("cannot change directory to {}", top_dir.display()))?;

    register_crash_restart();

    let registry = Arc::new(BackendRegistry::initialize(&top_dir));
    let endpoint = derive_endpoint_name(LAUNCHER_SERVICE_NAME)
        .context("cannot derive the launcher endpoint")?;

    let server = LauncherServer::new(endpoint, registry)?;
    server.run().await
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use super::*;

    fn unique_endpoint(label: &str) -> String {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!(
                "pime-test-{label}-{}-{timestamp}.sock",
                std::process::id()
            ))
            .display()
            .to_string()
    }

    #[tokio::test]
    async fn quit_request_against_nothing_reports_no_instance_promptly() {
        let endpoint = unique_endpoint("no-instance");
        let started = Instant::now();
        let found = request_quit_at(&endpoint).await.unwrap();
        assert!(!found);
        assert!(started.elapsed() < QUIT_REQUEST_TIMEOUT + Duration::from_secs(1));
    }

    #[test]
    fn executable_directory_is_a_directory() {
        let dir = executable_directory().unwrap();
        assert!(dir.is_dir());
    }
}
