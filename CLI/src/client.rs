//! LAN chat client.
//!
//! ```bash
//! lanchat-client discover --quick
//! lanchat-client discover --watch
//! lanchat-client connect --server 192.168.1.20:8000 --user-id 7 --token abc
//! ```

mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use lanchat::config::{default_config_path, AppConfig};
use lanchat::store::{default_servers_path, load_servers, save_servers};
use lanchat::{
    check_server_availability, DiscoveryService, HttpPresence, PresenceUpdater, ServerDescriptor,
    ServerRegistry, Session, SessionError, SessionObservers,
};
use log::{info, warn, LevelFilter};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "lanchat-client")]
#[command(author, version, about = "Find LAN chat servers and talk to them", long_about = None)]
struct Args {
    /// Configuration file (TOML); created with defaults if missing
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Known-servers cache (JSON)
    #[arg(long, global = true)]
    servers: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast a discovery request and list the servers that answer
    Discover {
        /// Use the short listening window
        #[arg(long)]
        quick: bool,

        /// Keep probing periodically until Ctrl-C
        #[arg(long, conflicts_with = "quick")]
        watch: bool,
    },
    /// Open a chat session; stdin lines are sent as messages
    Connect {
        /// Server as host:port
        #[arg(short, long)]
        server: String,

        #[arg(short, long)]
        user_id: u64,

        #[arg(short, long)]
        token: String,

        /// Go active without waiting for the server's auth response
        #[arg(long)]
        no_ack: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_logger("client", args.log_level)?;

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let cfg = AppConfig::load_or_default(&config_path)?;
    let servers_path = args.servers.clone().unwrap_or_else(default_servers_path);

    match args.command {
        Command::Discover { quick, watch } => discover(&cfg, &servers_path, quick, watch).await,
        Command::Connect {
            server,
            user_id,
            token,
            no_ack,
        } => connect(&cfg, &server, user_id, &token, no_ack).await,
    }
}

async fn discover(cfg: &AppConfig, servers_path: &Path, quick: bool, watch: bool) -> Result<()> {
    let seed = match load_servers(servers_path) {
        Ok(seed) => seed,
        Err(err) => {
            warn!("Ignoring server cache: {:#}", err);
            Vec::new()
        }
    };
    let registry = Arc::new(ServerRegistry::with_seed(seed));
    let mut service = DiscoveryService::with_registry(
        registry.clone(),
        cfg.discovery.prober(),
        cfg.discovery.options(),
    );

    if watch {
        service.add_subscriber(|servers: &[ServerDescriptor]| {
            println!("--- {} server(s) online ---", servers.len());
            for server in servers {
                println!("{}", server);
            }
            Ok(())
        });
        service.start();
        info!("Watching for servers, Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        service.stop().await;
    } else {
        let servers = if quick {
            service.quick_discover().await?
        } else {
            service.discover().await?
        };
        if servers.is_empty() {
            println!("No servers found");
        }
        for server in &servers {
            println!("{}", server);
        }
    }

    save_servers(servers_path, &registry.list_all())?;
    Ok(())
}

async fn connect(
    cfg: &AppConfig,
    server: &str,
    user_id: u64,
    token: &str,
    no_ack: bool,
) -> Result<()> {
    let (host, port) = split_host_port(server)?;
    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to resolve {}", server))?
        .next()
        .ok_or_else(|| anyhow!("{} did not resolve to an address", server))?;

    let mut session_config = cfg.session.session_config(host, port, user_id, token);
    if no_ack {
        session_config.require_auth_ack = false;
    }
    if !check_server_availability(addr, session_config.connect_timeout).await {
        warn!("{} is not accepting connections yet; the session will keep retrying", addr);
    }
    let presence: Arc<dyn PresenceUpdater> = Arc::new(HttpPresence::new(addr)?);

    let (handle, observers) = Session::new(session_config)
        .with_presence(presence)
        .connect()?;
    let SessionObservers {
        mut status,
        mut status_updates,
        mut messages,
    } = observers;

    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            info!(
                "Session {:?} (attempts {})",
                current.state, current.reconnect_attempts
            );
        }
    });
    tokio::spawn(async move {
        while let Some(update) = status_updates.recv().await {
            println!(
                "* user {} is {}",
                update["user_id"],
                if update["is_online"].as_bool().unwrap_or(false) {
                    "online"
                } else {
                    "offline"
                }
            );
        }
    });
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let from = &message["sender_id"];
            match message["text"].as_str() {
                Some(text) => println!("[{}] {}", from, text),
                None => println!("{}", message),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            status = handle.closed() => {
                warn!("Session ended: {:?}", status.close);
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                let message = json!({"type": "message", "text": text});
                match handle.send(&message).await {
                    Ok(()) => {}
                    Err(SessionError::NotConnected) => warn!("Not connected, message dropped"),
                    Err(err) => {
                        warn!("Send failed: {}", err);
                        break;
                    }
                }
            }
        }
    }

    handle.disconnect().await;
    info!("Session state: {}", serde_json::to_string(&handle.snapshot())?);
    Ok(())
}

/// `host:port`, with IPv6 literals in brackets.
fn split_host_port(server: &str) -> Result<(String, u16)> {
    let (host, port) = server
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected host:port, got {:?}", server))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("missing host in {:?}", server);
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in {:?}", server))?;
    Ok((host.to_string(), port))
}
