//! Pitaya CLI — stdio host for the RPC dispatcher.
//!
//! Stands in for the cluster transport: requests come in as JSON lines or
//! command-line flags, go through the same `Dispatcher` a server would use,
//! and replies are printed as JSON.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use pitaya_cli::commands;
use pitaya_core::{LogFormat, PitayaConfig, RpcType};

/// Pitaya CLI — in-process RPC dispatch
#[derive(Parser)]
#[command(name = "pitaya", version, about = "Pitaya CLI — in-process RPC dispatch")]
pub struct Cli {
    /// Path to a YAML configuration file (falls back to <ENV_PREFIX>_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Prefix of environment variables that override the configuration
    #[arg(long, default_value = "PITAYA")]
    env_prefix: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum CallType {
    /// Session-bound request, as forwarded by a frontend
    Sys,
    /// Remote call from a peer server
    User,
}

impl From<CallType> for RpcType {
    fn from(value: CallType) -> Self {
        match value {
            CallType::Sys => RpcType::Sys,
            CallType::User => RpcType::User,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Read JSON-line requests from stdin and write replies to stdout
    Serve {
        /// Print Prometheus metrics to stderr once the input is closed
        #[arg(long)]
        metrics: bool,
    },

    /// Dispatch a single request
    Call {
        /// Request type: sys or user
        #[arg(long = "type", value_enum, default_value = "user")]
        rpc_type: CallType,
        /// Route, e.g. "room.room.join" or "room.join"
        #[arg(long)]
        route: String,
        /// Handler argument as JSON
        #[arg(long)]
        args: Option<String>,
        /// Session as JSON (sys requests), e.g. '{"id": 42}'
        #[arg(long)]
        session: Option<String>,
    },

    /// List server info and registered handlers
    Routes,
}

fn init_tracing(config: &PitayaConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log.format {
        LogFormat::Console => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path =
        commands::config_path(cli.config, &cli.env_prefix, |key| std::env::var_os(key));
    let config = commands::load_config(config_path.as_deref(), &cli.env_prefix);
    init_tracing(&config);

    let result = match cli.command {
        Some(Commands::Serve { metrics }) => commands::serve::run(&config, metrics).await,
        Some(Commands::Call {
            rpc_type,
            route,
            args,
            session,
        }) => {
            commands::call::run(
                &config,
                rpc_type.into(),
                &route,
                args.as_deref(),
                session.as_deref(),
            )
            .await
        }
        Some(Commands::Routes) => commands::routes::run(&config),
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
