//! LAN chat server: answers discovery broadcasts and hosts the
//! `/ws/{user_id}` endpoint.
//!
//! ```bash
//! lanchat-server --name "Lab" --port 8000 --description "3rd floor"
//! ```

mod logging;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lanchat::config::{default_config_path, AppConfig};
use lanchat::{Hub, Responder};
use log::{info, LevelFilter};

#[derive(Parser, Debug)]
#[command(name = "lanchat-server")]
#[command(author, version, about = "LAN chat server with UDP discovery", long_about = None)]
struct Args {
    /// Address the chat endpoint binds to
    #[arg(long)]
    host: Option<IpAddr>,

    /// Chat endpoint port
    #[arg(short, long)]
    port: Option<u16>,

    /// UDP port for discovery requests
    #[arg(long)]
    broadcast_port: Option<u16>,

    #[arg(long)]
    max_users: Option<u32>,

    /// Advertise the server as password protected (`--password-protected false` turns it off)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    password_protected: Option<bool>,

    #[arg(long)]
    description: Option<String>,

    /// Name shown to discovering clients
    #[arg(short, long)]
    name: Option<String>,

    /// Configuration file (TOML); created with defaults if missing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_logger("server", args.log_level)?;

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut cfg = AppConfig::load_or_default(&config_path)?;

    let server = &mut cfg.server;
    if let Some(host) = args.host {
        server.host = host;
    }
    if let Some(port) = args.port {
        server.port = port;
    }
    if let Some(max_users) = args.max_users {
        server.max_users = max_users;
    }
    if let Some(description) = args.description {
        server.description = description;
    }
    if let Some(name) = args.name {
        server.name = name;
    }
    if let Some(password_protected) = args.password_protected {
        server.password_protected = password_protected;
    }
    let broadcast_port = args.broadcast_port.unwrap_or(cfg.discovery.port);

    let hub = Arc::new(Hub::bind(cfg.server.listen_addr()).await?);

    let mut responder_config = cfg.server.responder_config(broadcast_port);
    responder_config.server_port = hub.local_addr().port();
    let mut responder = Responder::start(responder_config, hub.clone())
        .await
        .context("Failed to start discovery responder")?;

    info!("+----------------------------------------------------+");
    info!("|  Server:    {:38} |", cfg.server.name);
    info!("|  Chat:      {:38} |", format!("ws://{}", hub.local_addr()));
    info!("|  Discovery: {:38} |", responder.local_addr());
    info!("|  Max users: {:38} |", cfg.server.max_users);
    info!(
        "|  Password:  {:38} |",
        if cfg.server.password_protected {
            "required"
        } else {
            "none"
        }
    );
    info!("+----------------------------------------------------+");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    responder.stop().await;
    hub.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_flag_can_switch_either_way() {
        let unset = Args::try_parse_from(["lanchat-server"]).unwrap();
        assert_eq!(unset.password_protected, None);

        let bare = Args::try_parse_from(["lanchat-server", "--password-protected"]).unwrap();
        assert_eq!(bare.password_protected, Some(true));

        let off =
            Args::try_parse_from(["lanchat-server", "--password-protected", "false"]).unwrap();
        assert_eq!(off.password_protected, Some(false));
    }

    #[test]
    fn log_levels_parse_case_insensitively() {
        let args = Args::try_parse_from(["lanchat-server", "--log-level", "DEBUG"]).unwrap();
        assert_eq!(args.log_level, LevelFilter::Debug);
        let default = Args::try_parse_from(["lanchat-server"]).unwrap();
        assert_eq!(default.log_level, LevelFilter::Info);
        assert!(Args::try_parse_from(["lanchat-server", "--log-level", "loud"]).is_err());
    }
}
