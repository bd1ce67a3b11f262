use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use tick_config::{EngineConfig, apply_env_overrides};
use tick_runtime::tracing_init::init_tracing;
use tick_runtime::{Server, wait_for_signal};

/// Environment override prefix: `TICKD_<SECTION>_<FIELD>`.
const ENV_PREFIX: &str = "TICKD";

#[derive(Parser)]
#[command(name = "tickd", about = "Streaming data-processing and alerting engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine
    Run {
        /// Path to tickd.toml config file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config_path = config
                .canonicalize()
                .map_err(|e| anyhow::anyhow!("config path '{}': {e}", config.display()))?;
            let mut engine_config = EngineConfig::load(&config_path)?;
            apply_env_overrides(&mut engine_config, ENV_PREFIX, std::env::vars())?;
            let base_dir = config_path
                .parent()
                .expect("config path must have a parent directory");

            let _guard = init_tracing(&engine_config.logging, base_dir)?;

            let server = Server::start(engine_config, base_dir)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            tracing::info!(domain = "sys", listen = %server.listen_addr(), "tickd started");

            wait_for_signal(server.cancel_token()).await;
            server.shutdown();
            server.wait().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        }
    }

    Ok(())
}
