//! Endpoint identity and the platform endpoints behind it.
//!
//! An endpoint path is derived deterministically from the current OS user,
//! the fixed `PIME` namespace segment, and a logical service name. Two users
//! never collide on the same path, and the same user always derives the same
//! path, which is how a new launcher instance finds a prior one.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::config::ENDPOINT_NAMESPACE;
#[cfg(unix)]
use crate::config::LISTEN_BACKLOG;
use crate::security::SecurityPolicy;

/// Errors establishing the endpoint. All of these are startup-fatal for the
/// server; for a connecting client they mean "no instance is running".
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("cannot resolve the current user: {0}")]
    UserLookup(String),
    #[error("another launcher instance already owns {path}")]
    AlreadyRunning { path: String },
    #[error("failed to bind endpoint {path}: {source}")]
    Bind { path: String, source: io::Error },
}

/// Name of the user the process is running as.
#[cfg(unix)]
pub fn current_user_name() -> Result<String, EndpointError> {
    let uid = nix::unistd::Uid::effective();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Err(EndpointError::UserLookup(format!(
            "no passwd entry for uid {uid}"
        ))),
        Err(e) => Err(EndpointError::UserLookup(e.to_string())),
    }
}

/// Name of the user the process is running as.
#[cfg(windows)]
pub fn current_user_name() -> Result<String, EndpointError> {
    use windows_sys::Win32::System::WindowsProgramming::GetUserNameW;

    // UNLEN + 1
    let mut buf = [0u16; 257];
    let mut len = buf.len() as u32;
    // SAFETY: the buffer is valid for `len` UTF-16 units; GetUserNameW writes
    // the name plus terminating nul and stores the written length in `len`.
    let ok = unsafe { GetUserNameW(buf.as_mut_ptr(), &mut len) };
    if ok == 0 {
        return Err(EndpointError::UserLookup(
            io::Error::last_os_error().to_string(),
        ));
    }
    let chars = len.saturating_sub(1) as usize;
    Ok(String::from_utf16_lossy(&buf[..chars]))
}

/// Derive the endpoint path for `logical_name` on behalf of `user`.
///
/// Deterministic: the same (user, logical name) pair always yields the same
/// path, and different users never share one.
pub fn endpoint_name_for_user(logical_name: &str, user: &str) -> String {
    #[cfg(windows)]
    {
        format!(
            r"\\.\pipe\{user}\{ns}\{name}",
            ns = ENDPOINT_NAMESPACE,
            name = logical_name
        )
    }
    #[cfg(unix)]
    {
        format!(
            "{base}/{ns}-{user}/{name}",
            base = crate::config::endpoint_base_dir().display(),
            ns = ENDPOINT_NAMESPACE,
            name = logical_name
        )
    }
}

/// Derive the endpoint path for `logical_name` for the current user.
/// Fails, leaving no endpoint, when the user cannot be resolved.
pub fn derive_endpoint_name(logical_name: &str) -> Result<String, EndpointError> {
    let user = current_user_name()?;
    Ok(endpoint_name_for_user(logical_name, &user))
}

/// A bound, listening endpoint with message-oriented, non-blocking semantics
/// and a bounded pending-connection queue.
pub struct EndpointListener {
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(unix)]
    path: std::path::PathBuf,
    #[cfg(windows)]
    name: String,
    #[cfg(windows)]
    next: tokio::net::windows::named_pipe::NamedPipeServer,
    #[cfg(windows)]
    policy: Arc<SecurityPolicy>,
}

impl EndpointListener {
    /// Bind a listening endpoint at `path` under the given access policy.
    ///
    /// A stale endpoint left behind by a crashed instance is removed; a live
    /// one (something answers a probe connection) refuses the bind.
    #[cfg(unix)]
    pub fn bind(path: &str, policy: Arc<SecurityPolicy>) -> Result<Self, EndpointError> {
        let socket_path = std::path::PathBuf::from(path);
        let bind_err = |source| EndpointError::Bind {
            path: path.to_string(),
            source,
        };

        // The per-user namespace directory gets the policy's mode only when
        // this process creates it; an existing directory keeps its mode.
        if let Some(parent) = socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(bind_err)?;
                policy.apply_to_directory(parent).map_err(bind_err)?;
            }
        }

        if socket_path.exists() {
            if std::os::unix::net::UnixStream::connect(&socket_path).is_ok() {
                return Err(EndpointError::AlreadyRunning {
                    path: path.to_string(),
                });
            }
            tracing::warn!(endpoint = path, "removing stale endpoint");
            std::fs::remove_file(&socket_path).map_err(bind_err)?;
        }

        let std_listener = bind_with_backlog(&socket_path, LISTEN_BACKLOG).map_err(bind_err)?;
        policy.apply_to_socket(&socket_path).map_err(bind_err)?;
        std_listener.set_nonblocking(true).map_err(bind_err)?;
        let listener = tokio::net::UnixListener::from_std(std_listener).map_err(bind_err)?;

        tracing::info!(endpoint = path, "endpoint bound");
        Ok(Self {
            listener,
            path: socket_path,
        })
    }

    /// Bind a listening endpoint at `path` under the given access policy.
    #[cfg(windows)]
    pub fn bind(path: &str, policy: Arc<SecurityPolicy>) -> Result<Self, EndpointError> {
        let next = create_pipe_instance(path, &policy, true).map_err(|source| {
            EndpointError::Bind {
                path: path.to_string(),
                source,
            }
        })?;
        tracing::info!(endpoint = path, "endpoint bound");
        Ok(Self {
            name: path.to_string(),
            next,
            policy,
        })
    }

    /// Wait for the next client connection.
    #[cfg(unix)]
    pub async fn accept(&mut self) -> io::Result<EndpointStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(EndpointStream::Unix(stream))
    }

    /// Wait for the next client connection.
    ///
    /// Named pipes have no kernel accept queue; a fresh listening instance is
    /// created the moment the previous one is taken by a client.
    #[cfg(windows)]
    pub async fn accept(&mut self) -> io::Result<EndpointStream> {
        self.next.connect().await?;
        let replacement = create_pipe_instance(&self.name, &self.policy, false)?;
        let connected = std::mem::replace(&mut self.next, replacement);
        Ok(EndpointStream::PipeServer(connected))
    }
}

#[cfg(unix)]
impl Drop for EndpointListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Bind a pathname unix socket with an explicit listen backlog.
///
/// `UnixListener::bind` offers no control over the queue depth, so the socket
/// is assembled with raw calls and handed back as a safe listener.
#[cfg(unix)]
fn bind_with_backlog(
    path: &std::path::Path,
    backlog: i32,
) -> io::Result<std::os::unix::net::UnixListener> {
    use std::mem;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::io::FromRawFd;

    let path_bytes = path.as_os_str().as_bytes();

    // SAFETY: the fd is closed on every error path before returning; the
    // sockaddr is zero-initialized and the path length is checked against
    // sun_path before copying.
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_un = mem::zeroed();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        if path_bytes.len() >= addr.sun_path.len() {
            libc::close(fd);
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "endpoint path is too long",
            ));
        }
        for (dst, src) in addr.sun_path.iter_mut().zip(path_bytes) {
            *dst = *src as libc::c_char;
        }

        let addr_len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        if libc::bind(fd, &addr as *const _ as *const libc::sockaddr, addr_len) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(std::os::unix::net::UnixListener::from_raw_fd(fd))
    }
}

#[cfg(windows)]
fn create_pipe_instance(
    name: &str,
    policy: &SecurityPolicy,
    first: bool,
) -> io::Result<tokio::net::windows::named_pipe::NamedPipeServer> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let mut options = ServerOptions::new();
    options.first_pipe_instance(first);
    // SAFETY: the attribute block is owned by the process-wide policy, which
    // outlives every pipe instance created from it.
    unsafe { options.create_with_security_attributes_raw(name, policy.attributes_ptr()) }
}

/// One open duplex connection, server- or client-side.
pub enum EndpointStream {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    #[cfg(windows)]
    PipeServer(tokio::net::windows::named_pipe::NamedPipeServer),
    #[cfg(windows)]
    PipeClient(tokio::net::windows::named_pipe::NamedPipeClient),
}

impl EndpointStream {
    /// Connect to an endpoint as a client. Failure means no instance is
    /// listening there.
    #[cfg(unix)]
    pub async fn connect(path: &str) -> io::Result<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(EndpointStream::Unix(stream))
    }

    /// Connect to an endpoint as a client. Failure means no instance is
    /// listening there.
    ///
    /// A busy pipe (all instances taken) is retried; callers bound the total
    /// wait with a timeout.
    #[cfg(windows)]
    pub async fn connect(path: &str) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ClientOptions;
        use windows_sys::Win32::Foundation::ERROR_PIPE_BUSY;

        loop {
            match ClientOptions::new().open(path) {
                Ok(client) => return Ok(EndpointStream::PipeClient(client)),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsyncRead for EndpointStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            EndpointStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(windows)]
            EndpointStream::PipeServer(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(windows)]
            EndpointStream::PipeClient(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for EndpointStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            EndpointStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(windows)]
            EndpointStream::PipeServer(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(windows)]
            EndpointStream::PipeClient(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            EndpointStream::Unix(s) => Pin::new(s).poll_flush(cx),
            #[cfg(windows)]
            EndpointStream::PipeServer(s) => Pin::new(s).poll_flush(cx),
            #[cfg(windows)]
            EndpointStream::PipeClient(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            EndpointStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(windows)]
            EndpointStream::PipeServer(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(windows)]
            EndpointStream::PipeClient(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_user_always_derives_the_same_path() {
        let first = endpoint_name_for_user("Launcher", "alice");
        let second = endpoint_name_for_user("Launcher", "alice");
        assert_eq!(first, second);
    }

    #[test]
    fn different_users_never_share_a_path() {
        let alice = endpoint_name_for_user("Launcher", "alice");
        let bob = endpoint_name_for_user("Launcher", "bob");
        assert_ne!(alice, bob);
    }

    #[test]
    fn different_services_get_distinct_paths_for_one_user() {
        let launcher = endpoint_name_for_user("Launcher", "alice");
        let other = endpoint_name_for_user("Preferences", "alice");
        assert_ne!(launcher, other);
    }

    #[test]
    fn derived_path_carries_namespace_and_service_name() {
        let path = endpoint_name_for_user("Launcher", "alice");
        assert!(path.contains(ENDPOINT_NAMESPACE));
        assert!(path.contains("alice"));
        assert!(path.ends_with("Launcher"));
    }

    #[test]
    fn current_user_resolves() {
        let user = current_user_name().unwrap();
        assert!(!user.is_empty());
    }
}
