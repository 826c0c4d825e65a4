//! mesh-tcc command line
//!
//! Inspects the transaction settings of a deployment without talking to the
//! coordinator.

use clap::{Parser, Subcommand};
use mesh_tcc::address::{Operation, ParticipantAddress};
use mesh_tcc::config::TxnConfig;
use mesh_tcc::descriptor::CompensableFlags;
use mesh_tcc::manager::Route;
use mesh_tcc::rpc::CallTarget;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mesh-tcc")]
#[command(about = "Inspect TCC transaction settings")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the coordinator endpoints
    Check {
        /// Path to the config file (JSON/TOML/YAML)
        #[arg(short, long, env = "MESH_TXN_CONFIG")]
        config: PathBuf,
    },

    /// Print the participant address this deployment advertises
    ParticipantAddress {
        /// Path to the config file (JSON/TOML/YAML)
        #[arg(short, long, env = "MESH_TXN_CONFIG")]
        config: PathBuf,

        /// The service has a Confirm method
        #[arg(long)]
        confirm: bool,

        /// The service has a Cancel method
        #[arg(long)]
        cancel: bool,
    },

    /// Decode a participant address
    ParseAddress {
        /// Pipe-delimited address
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            let config = TxnConfig::from_file(&config)?;
            let route = Route::resolve(&config, &config.coordinator_address)?;

            let endpoints: serde_json::Map<String, serde_json::Value> =
                [Operation::Begin, Operation::Join, Operation::End]
                    .into_iter()
                    .map(|op| (op.as_str().to_string(), describe(&route.target(&config, op))))
                    .collect();

            tracing::info!(mode = %config.comm_mode, "Configuration is valid");
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "mode": config.comm_mode.as_str(),
                    "coordinator": route.address.encode(),
                    "instance_id": route.address.instance_id(),
                    "macro_service_override": route.direct_override,
                    "endpoints": endpoints,
                }))?
            );
        }

        Commands::ParticipantAddress {
            config,
            confirm,
            cancel,
        } => {
            let config = TxnConfig::from_file(&config)?;
            let mut flags = CompensableFlags::NONE;
            if confirm {
                flags = flags | CompensableFlags::CONFIRM;
            }
            if cancel {
                flags = flags | CompensableFlags::CANCEL;
            }

            let direct_override = Route::resolve(&config, &config.coordinator_address)
                .is_ok_and(|route| route.direct_override);

            println!(
                "{}",
                ParticipantAddress::build(&config, flags, direct_override).encode()
            );
        }

        Commands::ParseAddress { address } => {
            let parsed = ParticipantAddress::parse(&address)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "mode": parsed.mode.as_str(),
                    "base_url": parsed.base_url,
                    "confirm": parsed.confirm,
                    "cancel": parsed.cancel,
                    "confirm_url": parsed.confirm_url(),
                    "cancel_url": parsed.cancel_url(),
                }))?
            );
        }
    }

    Ok(())
}

fn describe(target: &CallTarget) -> serde_json::Value {
    match target {
        CallTarget::Http { url } => serde_json::json!({ "url": url }),
        CallTarget::Topic { route, topic } => serde_json::json!({
            "topic": topic,
            "org": route.org,
            "workspace": route.workspace,
            "env": route.env,
            "unit": route.unit,
            "node_id": route.node_id,
            "instance_id": route.instance_id,
        }),
    }
}
