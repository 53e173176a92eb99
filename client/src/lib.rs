//! PIME Launcher Client Library
//!
//! Text services embed this crate to talk to the resident launcher: connect
//! to the per-user endpoint, bind the connection to a backend profile with an
//! `init` handshake, then exchange request/response messages with that
//! backend through the launcher.
//!
//! ```no_run
//! use pime_client::{ClientConfig, LauncherClient};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut client = LauncherClient::connect(ClientConfig::new()).await?;
//! client.init("F80736AF-4502-4D8F-A684-1889C2B3BBBD").await?;
//! let response = client.request(r#"{"method":"keyDown","keyCode":65}"#).await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::{ClientConfig, LauncherClient};
