use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use aprs_weather::config::{WeatherConfig, config_path};
use aprs_weather::log_format::TargetFirstFormat;

mod commands;

#[derive(Parser)]
#[command(name = "aprs-weather", version)]
#[command(about = "Turn APRS-IS weather reports into per-station sensor notifications", long_about = None)]
struct Cli {
    /// Config file (default: $APRS_WEATHER_CONFIG, then ./aprs-weather.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Disable colored log output
    #[arg(long, global = true, default_value_t = false)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to APRS-IS and report sensor creates/updates until interrupted
    Run {
        /// Print sensor events as JSON lines on stdout instead of logging them
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the effective configuration
    CheckConfig,
    /// Print the server-side filter sent at login
    Filter,
}

fn init_logging(no_color: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = TargetFirstFormat::terminal().with_ansi(!no_color);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .event_format(format),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.no_color);

    let path = config_path(cli.config.as_deref());
    let config = WeatherConfig::load_or_default(&path)?;
    info!("Using configuration {:?}", path);

    match cli.command {
        Commands::Run { json } => commands::handle_run(config, json).await,
        Commands::CheckConfig => commands::handle_check_config(&config, &path),
        Commands::Filter => commands::handle_filter(&config),
    }
}
