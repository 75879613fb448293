//! Stand-in trading gate for local smoke tests.
//!
//! Accepts gate connections one at a time and blindly approves whatever
//! the agent sends. A very inadequate test environment, but enough to let
//! the agent run without touching the real exchange.

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use quotebot::gate::dummy;

#[derive(Parser)]
#[command(name = "dummy_gate")]
#[command(version, about = "Approve-everything trading gate for smoke tests", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:12345")]
    listen: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    let listener = match TcpListener::bind(&cli.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %cli.listen, error = %e, "cannot bind");
            std::process::exit(1);
        }
    };
    info!(listen = %cli.listen, "dummy gate listening");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                if let Err(e) = dummy::serve(stream).await {
                    error!(error = %e, "session ended with error");
                }
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                std::process::exit(1);
            }
        }
    }
}
