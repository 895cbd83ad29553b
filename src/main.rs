use clap::Parser;
use tracing_subscriber::filter::EnvFilter;

use rookery::cli::{run, Cli};
use rookery::config::load_config;

fn setup_tracing() {
    tracing_log::LogTracer::init().expect("Failed to set up log tracer");

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set up the tracing subscriber");
}

#[tokio::main]
async fn main() {
    setup_tracing();

    let cli = Cli::parse();
    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config from {}: {e}", cli.config.display());
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli.command, &config).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
