use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pime_server::lifecycle;

#[derive(Parser)]
#[command(name = "pime-launcher")]
#[command(about = "Resident broker routing text-service clients to input-method backends")]
struct Args {
    /// Ask a running launcher instance to quit instead of starting one.
    #[arg(long)]
    quit: bool,

    /// Anything else on the command line is accepted and ignored.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    rest: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if !args.rest.is_empty() {
        tracing::debug!(arguments = ?args.rest, "ignoring extra command-line arguments");
    }

    if args.quit {
        if lifecycle::request_existing_instance_quit().await? {
            tracing::info!("running instance asked to quit");
        } else {
            tracing::info!("no running instance found");
        }
        return Ok(());
    }

    lifecycle::run_server().await
}
