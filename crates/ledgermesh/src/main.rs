//! ledgermesh - overlay node for a ledger peer-to-peer network.
//!
//! # Quick Start
//!
//! ```bash
//! # Print a sample configuration
//! ledgermesh sample-config > ledgermesh.toml
//!
//! # Run a node
//! ledgermesh --config ledgermesh.toml run
//!
//! # Ask a running node for its peers
//! ledgermesh crawl 203.0.113.7:51235
//! ```
//!
//! # Commands
//!
//! - **run**: Start the node
//! - **new-keypair**: Generate a node seed and print its public key
//! - **sample-config**: Print a sample configuration
//! - **crawl**: Fetch a node's `/crawl` document
//!
//! Configuration comes from a TOML file (`--config <FILE>`) with
//! `LEDGERMESH_` environment overrides, or from built-in defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ledgermesh_app::{
    crawl_peer, logging, run_node, AppConfig, LogConfig, LogFormat, RunOptions,
};
use ledgermesh_overlay::{Ed25519Handshake, HandshakeVerifier, PeerAddress};

/// Overlay node for a ledger peer-to-peer network
#[derive(Parser)]
#[command(name = "ledgermesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Log output format
    #[arg(long, global = true)]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    command: Commands,
}

/// Log output format for CLI
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliLogFormat {
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Run the overlay node
    Run {
        /// Do not dial any peer automatically and ignore fixed peers
        #[arg(long)]
        standalone: bool,
    },

    /// Generate a new node keypair
    NewKeypair,

    /// Print a sample configuration file
    SampleConfig,

    /// Fetch the crawl document of a running node
    Crawl {
        /// Node address, as `host:port` or `host port`
        #[arg(value_name = "ADDR")]
        addr: String,

        /// Seconds to wait for the answer
        #[arg(long, default_value_t = 15)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;

    init_logging(&cli, &config)?;

    match cli.command {
        Commands::Run { standalone } => cmd_run(config, standalone).await,

        Commands::NewKeypair => cmd_new_keypair(),

        Commands::SampleConfig => cmd_sample_config(),

        Commands::Crawl { addr, timeout } => cmd_crawl(&addr, timeout).await,
    }
}

/// Initialize the logging subsystem.
///
/// Command line flags win over the configuration file.
fn init_logging(cli: &Cli, config: &AppConfig) -> anyhow::Result<()> {
    let level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };

    let format = match cli.log_format {
        Some(format) => format.into(),
        None => config.logging.format.parse()?,
    };

    let log_config = LogConfig::default().with_level(level).with_format(format);
    logging::init(&log_config)?;

    tracing::debug!("Logging initialized");
    Ok(())
}

/// Load configuration from file or use defaults.
fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    match &cli.config {
        Some(path) => AppConfig::from_file_with_env(path),
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Run command handler.
async fn cmd_run(config: AppConfig, standalone: bool) -> anyhow::Result<()> {
    run_node(config, RunOptions { standalone }).await
}

/// Generate keypair command handler.
fn cmd_new_keypair() -> anyhow::Result<()> {
    let identity = Ed25519Handshake::generate();

    println!("Generated new keypair:");
    println!();
    println!("Public Key:  {}", identity.public_key());
    println!("Node Seed:   {}", identity.seed_base64());
    println!();
    println!("Put the seed in [node] node_seed. It cannot be recovered.");

    Ok(())
}

/// Sample config command handler.
fn cmd_sample_config() -> anyhow::Result<()> {
    println!("{}", AppConfig::sample_config());
    Ok(())
}

/// Crawl command handler.
async fn cmd_crawl(addr: &str, timeout: u64) -> anyhow::Result<()> {
    let target: SocketAddr = match addr.parse() {
        Ok(addr) => addr,
        Err(_) => {
            let address = PeerAddress::parse(addr)?;
            *address
                .resolve()
                .await?
                .first()
                .ok_or_else(|| anyhow::anyhow!("{} did not resolve", address))?
        }
    };

    let crawl = crawl_peer(target, Duration::from_secs(timeout)).await?;
    println!("{}", serde_json::to_string_pretty(&crawl)?);
    Ok(())
}
