//! Run a launcher serving a single echo backend under a demo profile, on the
//! current user's real endpoint. Pair it with the client crate's `basic`
//! example.

use std::sync::Arc;

use anyhow::Result;

use pime_common::config::LAUNCHER_SERVICE_NAME;
use pime_common::endpoint::derive_endpoint_name;
use pime_server::registry::{BackendRegistry, EchoBackend};
use pime_server::{lifecycle, LauncherServer};

const DEMO_PROFILE: &str = "123E4567-E89B-12D3-A456-426614174000";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let top_dir = lifecycle::executable_directory()?;
    let registry = Arc::new(BackendRegistry::initialize(&top_dir));
    registry.insert(DEMO_PROFILE, Arc::new(EchoBackend::new("echo")));

    let endpoint = derive_endpoint_name(LAUNCHER_SERVICE_NAME)?;
    println!("launcher on {endpoint}, echo backend under profile {DEMO_PROFILE}");

    LauncherServer::new(endpoint, registry)?.run().await
}
