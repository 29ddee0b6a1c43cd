//! tagpull: poll PLCs and SNMP devices at a fixed rate and push changed
//! values to stdout.
//!
//! ```bash
//! # one poll cycle
//! tagpull -F plant1.yml
//!
//! # production: poll continuously, restart on runtime errors
//! tagpull -F plant1.yml -L -R
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tagpull_core::config::PollConfig;
use tagpull_core::engine::Engine;

#[derive(Parser)]
#[command(name = "tagpull")]
#[command(version)]
#[command(about = "Fixed-rate industrial telemetry poller")]
struct Cli {
    /// Configuration file
    #[arg(short = 'F', long = "config", value_name = "CONFIG")]
    config: PathBuf,

    /// Loop (production)
    #[arg(short = 'L', long = "loop")]
    loop_mode: bool,

    /// Restart the loop after runtime errors
    #[arg(short = 'R', long = "auto-restart")]
    auto_restart: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Data goes to stdout; everything diagnostic stays on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut engine = match build_engine(&cli) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("{e:#}");
            return ExitCode::from(1);
        }
    };

    match engine.run(cli.loop_mode, cli.auto_restart).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(2)
        }
    }
}

fn build_engine(cli: &Cli) -> anyhow::Result<Engine> {
    let cfg = PollConfig::load(&cli.config)?;
    Engine::from_config(&cfg)
        .with_context(|| format!("cannot initialize from {}", cli.config.display()))
}
