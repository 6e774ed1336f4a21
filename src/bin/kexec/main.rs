//! kexec CLI tool
//!
//! Serve a directory of notebooks for kernel execution over HTTP.
//!
//! ## Commands
//!
//! - `init <path>`: Write a default `kexec.toml` into a notebook directory
//! - `serve <path>`: Serve kernels and write execution results back into notebooks below `path`
//!
//! ## Configuration
//!
//! `serve` reads `<path>/kexec.toml` (or `--config`) when present. Command line flags override
//! file values. File identity tracking is on unless `--no-file-ids` is given; it is what lets a
//! running cell write into its notebook after the notebook was renamed.

use clap::{Parser, Subcommand};
use kernel_executor::{
    config::{ExecutorConfig, TomlConfigProvider, CONFIG_FILE_NAME},
    db::FILE_ID_DB,
    server,
    service::ExecutorService,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

#[derive(Parser)]
#[command(name = "kexec")]
#[command(author, version, about = "Execute notebook cells and write results back to notebooks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Notebook directory (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Serve the kernel execution API for a notebook directory
    Serve {
        /// Notebook directory (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Configuration file path (default: <path>/kexec.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Identity database, relative to the notebook directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Key documents by path only. Renames during execution lose their write-back.
        #[arg(long)]
        no_file_ids: bool,

        /// Address to bind
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => {
            let provider = TomlConfigProvider::new(path.join(CONFIG_FILE_NAME));
            if provider.path().exists() {
                eprintln!("Error: {} already exists", provider.path().display());
                std::process::exit(1);
            }
            let config = ExecutorConfig {
                db_path: Some(PathBuf::from(FILE_ID_DB)),
                ..Default::default()
            };
            provider.store(&config)?;
            println!("✓ Config file created: {}", provider.path().display());
            Ok(())
        }

        Commands::Serve {
            path,
            config,
            db,
            no_file_ids,
            bind,
            port,
        } => {
            let provider =
                TomlConfigProvider::new(config.unwrap_or_else(|| path.join(CONFIG_FILE_NAME)));
            let file_config = provider.path().exists();
            let mut config = provider.load()?;
            config.root_dir = path;
            if let Some(db) = db {
                config.db_path = Some(db);
            } else if !file_config {
                config.db_path = Some(PathBuf::from(FILE_ID_DB));
            }
            if no_file_ids {
                config.db_path = None;
            }
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async {
                let service = Arc::new(ExecutorService::new(config).await?);
                let shutdown = async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for ctrl-c: {}", e);
                    }
                    println!("\nShutting down...");
                };
                let served = server::serve(service.clone(), addr, shutdown).await;
                service.shutdown().await;
                served
            })?;
            Ok(())
        }
    }
}
