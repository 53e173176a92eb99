use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::time::timeout;

use pime_common::config::{LAUNCHER_SERVICE_NAME, QUIT_COMMAND};
use pime_common::endpoint::derive_endpoint_name;
use pime_common::{protocol, EndpointStream};

/// Configuration for a launcher connection.
pub struct ClientConfig {
    /// Explicit endpoint path; when absent, the current user's launcher
    /// endpoint is derived.
    pub endpoint: Option<String>,
    /// Bound on connecting and on waiting for each response.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to an explicit endpoint instead of the derived one
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the connect/response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One connection to the launcher, to be bound to a backend profile with
/// [`LauncherClient::init`] before sending requests.
pub struct LauncherClient {
    stream: EndpointStream,
    timeout: Duration,
}

impl LauncherClient {
    /// Connect to the launcher endpoint.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let endpoint = match config.endpoint {
            Some(endpoint) => endpoint,
            None => derive_endpoint_name(LAUNCHER_SERVICE_NAME)
                .context("cannot derive the launcher endpoint")?,
        };

        let stream = timeout(config.timeout, EndpointStream::connect(&endpoint))
            .await
            .map_err(|_| anyhow!("timed out connecting to {endpoint}"))?
            .with_context(|| format!("no launcher instance at {endpoint}"))?;

        tracing::debug!(endpoint = %endpoint, "connected to launcher");
        Ok(Self {
            stream,
            timeout: config.timeout,
        })
    }

    /// Bind this connection to a backend profile. The returned string is the
    /// backend's own init response.
    ///
    /// A launcher that does not know the profile answers with silence, so
    /// this surfaces as a timeout; the connection stays usable for a retry.
    pub async fn init(&mut self, profile_guid: &str) -> Result<String> {
        let payload = serde_json::json!({ "method": "init", "id": profile_guid }).to_string();
        self.round_trip(payload.as_bytes()).await
    }

    /// Send one raw protocol message and wait for the backend's response.
    pub async fn request(&mut self, message: &str) -> Result<String> {
        self.round_trip(message.as_bytes()).await
    }

    /// Ask the launcher process to quit. No response is expected; the
    /// connection is consumed.
    pub async fn request_quit(mut self) -> Result<()> {
        protocol::write_message(&mut self.stream, QUIT_COMMAND)
            .await
            .context("failed to send quit to the launcher")
    }

    async fn round_trip(&mut self, payload: &[u8]) -> Result<String> {
        protocol::write_message(&mut self.stream, payload)
            .await
            .context("failed to send message to the launcher")?;

        let response = timeout(self.timeout, protocol::read_message(&mut self.stream))
            .await
            .map_err(|_| anyhow!("timed out waiting for the launcher's response"))?
            .context("failed to read the launcher's response")?
            .ok_or_else(|| anyhow!("launcher closed the connection"))?;

        String::from_utf8(response).context("launcher response was not UTF-8")
    }
}
