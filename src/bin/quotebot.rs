//! Quoting agent entry point.
//!
//! Thin shell around the library: loads the TOML configuration, wires the
//! trading gate, the market observer and the quoting engine together, and
//! hooks process exit to the engine's shutdown so resting orders get mass
//! cancelled on the way out.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use quotebot::config::{AppConfig, LogFormat};
use quotebot::{GateChannel, MarketObserver, QuoteEngine};

/// The engine needs the top two book levels to see past its own resting
/// orders.
const BOOK_DEPTH: usize = 2;

#[derive(Parser)]
#[command(name = "quotebot")]
#[command(version, about = "Two-sided limit quoting agent", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "quotebot.toml")]
    config: String,

    /// Override instrument id from config
    #[arg(long)]
    instrument: Option<i32>,

    /// Override quote volume
    #[arg(long)]
    quote_volume: Option<i32>,

    /// Override max position
    #[arg(long)]
    max_position: Option<i32>,

    /// Override first request id (seed from the previous run's log)
    #[arg(long)]
    first_request_id: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Output format (pretty, json, compact)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a sample config file
    GenerateConfig {
        /// Output file path
        #[arg(short, long, default_value = "quotebot.toml")]
        output: String,
    },
    /// Validate config without running
    ValidateConfig,
    /// Run the agent (default)
    Run,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::GenerateConfig { output }) => {
            if let Err(e) = generate_sample_config(output) {
                eprintln!("could not write sample config: {e}");
                std::process::exit(1);
            }
            return;
        }
        Some(Commands::ValidateConfig) => {
            match load_config(&cli) {
                Ok(config) => println!("Configuration is valid:\n{config:#?}"),
                Err(e) => {
                    eprintln!("invalid configuration: {e}");
                    std::process::exit(1);
                }
            }
            return;
        }
        Some(Commands::Run) | None => {}
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("could not load configuration: {e}");
            std::process::exit(1);
        }
    };
    setup_logging(&config, &cli);

    info!(
        instrument = config.quoting.instrument,
        quote_volume = config.quoting.quote_volume,
        max_position = config.quoting.max_position,
        first_request_id = config.gate.first_request_id,
        "starting quoting agent"
    );

    let channel = GateChannel::new(
        config.gate.host.clone(),
        config.gate.port,
        config.gate.login,
        config.gate.account,
        config.gate.first_request_id,
    );
    let engine = QuoteEngine::spawn(config.engine_config(), Arc::new(channel.clone()));
    channel.set_handler(Arc::new(engine.clone()));

    let observer = MarketObserver::new(config.feed.endpoint.clone(), config.quoting.instrument);
    observer.set_listener(Some(Arc::new(engine.clone())), BOOK_DEPTH);

    if let Err(e) = channel.connect().await {
        error!(error = %e, "trading gate connection failed");
        std::process::exit(1);
    }
    if let Err(e) = observer.connect().await {
        error!(error = %e, "book feed connection failed");
        engine.shutdown();
        tokio::time::sleep(Duration::from_millis(250)).await;
        std::process::exit(1);
    }

    // Quoting now runs on the spawned tasks; hold here until the operator
    // stops the process, then cancel outstanding orders before exiting.
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, shutting down"),
        Err(e) => error!(error = %e, "signal handler failed, shutting down"),
    }
    engine.shutdown();
    info!(last_request_id = engine.last_request_id(), "seed the next run above this request id");
    // Give the writer a moment to flush the mass cancel.
    tokio::time::sleep(Duration::from_millis(250)).await;
    channel.close();
}

fn load_config(cli: &Cli) -> quotebot::Result<AppConfig> {
    let mut config = AppConfig::load(&cli.config)?;
    if let Some(instrument) = cli.instrument {
        config.quoting.instrument = instrument;
    }
    if let Some(quote_volume) = cli.quote_volume {
        config.quoting.quote_volume = quote_volume;
    }
    if let Some(max_position) = cli.max_position {
        config.quoting.max_position = max_position;
    }
    if let Some(first_request_id) = cli.first_request_id {
        config.gate.first_request_id = first_request_id;
    }
    config.validate()?;
    Ok(config)
}

fn setup_logging(config: &AppConfig, cli: &Cli) {
    let level = cli.log_level.as_ref().unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let format = cli
        .log_format
        .as_deref()
        .unwrap_or(match config.logging.format {
            LogFormat::Json => "json",
            LogFormat::Compact => "compact",
            LogFormat::Pretty => "pretty",
        });

    match format {
        "json" => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        "compact" => tracing_subscriber::fmt().with_env_filter(filter).compact().init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

fn generate_sample_config(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let content = toml::to_string_pretty(&AppConfig::default())?;
    let with_comments = format!(
        "# Quoting agent configuration\n\
         # The previous run logs its highest used request id on exit;\n\
         # gate.first_request_id must be set above it.\n\n{content}"
    );
    std::fs::write(path, with_comments)?;
    println!("Sample config written to: {path}");
    Ok(())
}
