use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inference_oracle::api;
use inference_oracle::chain::HttpChainClient;
use inference_oracle::config::OracleConfig;
use inference_oracle::crypto::{generate_signing_key, save_keypair, signer_address, signing_key_from_hex};
use inference_oracle::node::Oracle;

#[derive(Parser)]
#[command(author, version, about = "Contribution oracle for the inference agent network")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the oracle using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/oracle.toml")]
        config: PathBuf,
    },
    /// Generate a default oracle configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/oracle.toml")]
        path: PathBuf,
    },
    /// Generate a new secp256k1 keypair for the oracle
    Keygen {
        #[arg(short, long, default_value = "keys/oracle.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_oracle(config).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
        Commands::Keygen { path } => keygen(path)?,
    }

    Ok(())
}

async fn start_oracle(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        OracleConfig::load(&config_path)?
    } else {
        OracleConfig::from_env()?
    };

    // Missing signer key is fatal at boot; the oracle is useless without
    // its on-chain identity.
    let key_hex = env::var("ORACLE_PRIVATE_KEY").context("ORACLE_PRIVATE_KEY is required")?;
    let signer = signing_key_from_hex(&key_hex)?;
    let oracle_address = signer_address(&signer);

    let chain = Arc::new(HttpChainClient::new(
        config.rpc_url.clone(),
        config.chain_id,
        signer,
    ));
    let api_addr = config.api_listen;

    let oracle = Oracle::new(config, chain, oracle_address)?;
    let handle = oracle.handle();
    let runtime = oracle.start().await?;
    let api_task = tokio::spawn(async move { api::serve(handle, api_addr).await });

    let result = tokio::select! {
        res = api_task => handle_join(res),
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    runtime.shutdown().await;
    result?;
    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = OracleConfig::default();
    config.ensure_directories()?;
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn keygen(path: PathBuf) -> Result<()> {
    let key = generate_signing_key();
    save_keypair(&path, &key)?;
    info!(?path, address = %signer_address(&key), "generated oracle keypair");
    Ok(())
}

fn handle_join(
    result: Result<inference_oracle::errors::OracleResult<()>, JoinError>,
) -> Result<()> {
    let inner = result?;
    inner?;
    Ok(())
}
