use qnet_node::{run_node, ShutdownReason};
use std::path::PathBuf;

#[tokio::main]
async fn main() {
    let path = std::env::var("QNET_CONFIG").unwrap_or_else(|_| "config/qnet.toml".to_string());
    match run_node(PathBuf::from(path)).await {
        Ok(ShutdownReason::CtrlC) => std::process::exit(qnet_config::exit_code::SIGINT),
        Err(e) => {
            eprintln!("node failed to start: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
