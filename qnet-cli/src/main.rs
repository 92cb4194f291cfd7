use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use qnet_config::NodeConfig;
use qnet_node::{run_node, ShutdownReason};
use qnet_wallet::WalletStore;
use tokio::runtime::Runtime;

#[derive(Parser)]
#[command(name = "qnet", version, about = "qnet node CLI")]
struct Cli {
    /// If set, show help instead of launching the dashboard when no subcommand is given.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    help_mode: bool,
    /// Base URL of a running node's RPC server, used by the dashboard and `node status`.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    api: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file
    Init {
        #[arg(long, default_value = "config/qnet.toml")]
        config: PathBuf,
    },
    /// Start or inspect a node
    Node {
        #[command(subcommand)]
        cmd: NodeCmd,
    },
    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        cmd: WalletCmd,
    },
}

#[derive(Subcommand)]
enum NodeCmd {
    Start {
        #[arg(long, default_value = "config/qnet.toml")]
        config: PathBuf,
    },
    Status,
}

#[derive(Subcommand)]
enum WalletCmd {
    New {
        #[arg(long, default_value = "default")]
        name: String,
        #[arg(long)]
        password: String,
    },
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.command.is_none() && !cli.help_mode {
        return qnet_tui::launch_tui(cli.api);
    }
    match cli.command.unwrap_or(Commands::Init {
        config: PathBuf::from("config/qnet.toml"),
    }) {
        Commands::Init { config } => init_config(config)?,
        Commands::Node { cmd } => match cmd {
            NodeCmd::Start { config } => {
                let rt = Runtime::new()?;
                match rt.block_on(async move { run_node(config).await }) {
                    Ok(ShutdownReason::CtrlC) => {}
                    Err(e) => {
                        eprintln!("node failed to start: {e}");
                        std::process::exit(e.exit_code());
                    }
                }
            }
            NodeCmd::Status => {
                println!("query {}/chain/status for node status, or run without a subcommand for the dashboard", cli.api);
            }
        },
        Commands::Wallet { cmd } => match cmd {
            WalletCmd::New { name, password } => {
                let store = WalletStore::new(wallet_dir()?)?;
                let wallet = store.create(&name, &password)?;
                println!(
                    "Created wallet {} address {}",
                    wallet.name,
                    qnet_wallet::address_to_base58(&wallet.address)
                );
            }
            WalletCmd::List => {
                let store = WalletStore::new(wallet_dir()?)?;
                for w in store.list()? {
                    println!("{} -> {}", w.name, qnet_wallet::address_to_base58(&w.address));
                }
            }
        },
    }
    Ok(())
}

fn init_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        println!("Config already exists at {:?}", path);
        return Ok(());
    }
    let cfg = NodeConfig::example();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, toml::to_string_pretty(&cfg)?)?;
    println!("Wrote config to {:?}", path);
    Ok(())
}

fn wallet_dir() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .unwrap_or(std::env::temp_dir())
        .join(".qnet")
        .join("wallets");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
