//! Connect to a running launcher (see the server crate's `echo_launcher`
//! example), bind to the demo echo profile, and exchange a few requests.

use anyhow::Result;

use pime_client::{ClientConfig, LauncherClient};

const DEMO_PROFILE: &str = "123E4567-E89B-12D3-A456-426614174000";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let mut client = LauncherClient::connect(ClientConfig::new()).await?;

    let init = client.init(DEMO_PROFILE).await?;
    println!("init response: {init}");

    let echo = client
        .request(r#"{"method":"echo","text":"hello from the example"}"#)
        .await?;
    println!("echo response: {echo}");

    let status = client.request(r#"{"method":"status"}"#).await?;
    println!("status response: {status}");

    Ok(())
}
