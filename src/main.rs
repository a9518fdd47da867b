use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use chime_gateway::{Config, Gateway};

/// Chime - realtime voice gateway for embedded speech devices
#[derive(Parser)]
#[command(name = "chime", version, about)]
struct Cli {
    /// Path to a TOML config file (defaults to ~/.config/omni/chime/config.toml)
    #[arg(short, long, env = "CHIME_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(long, env = "CHIME_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,chime_gateway=info",
        1 => "info,chime_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        stt = %config.stt.provider,
        tts = %config.tts.provider,
        llm_providers = config.llm.providers.len(),
        "starting chime gateway"
    );

    let gateway = Gateway::new(config)?;
    gateway.run().await?;

    Ok(())
}
