//! NodeNet - Peer node messaging for networked game sessions
//!
//! Runs a session server with an admin console, or joins one as a chat client.

use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nodenet::config::{self, Config};
use nodenet::login::local_machine_hash;
use nodenet::network::{
    ClientMessenger, EventForwarder, Messenger, MessengerEvent, ServerMessenger,
};
use nodenet::node::{find_local_address, interface_addresses};
use nodenet::protocol::{self, ChatMessage, Payload};

/// NodeNet - Peer node messaging
#[derive(Parser)]
#[command(name = "nodenet")]
#[command(author = "NodeNet Contributors")]
#[command(version = nodenet::VERSION)]
#[command(about = "Host or join a networked game session", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Name of the server node
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Join a session
    Client {
        /// Server address to connect to
        #[arg(short, long)]
        server: String,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Name to ask for
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show system information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { port, name } => {
            run_server(config, port, name).await?;
        }
        Commands::Client { server, port, name } => {
            run_client(config, server, port, name).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_system_info();
        }
    }

    Ok(())
}

/// Run the session server with its admin console
async fn run_server(config: Config, port: Option<u16>, name: Option<String>) -> anyhow::Result<()> {
    let mut server_config = config.server_config()?;
    if let Some(port) = port {
        server_config.port = port;
    }
    if let Some(name) = name {
        server_config.name = name;
    }
    let chat_channel = server_config.chat_channel.clone();

    let server = ServerMessenger::bind(server_config).await?;
    let (forwarder, mut events) = EventForwarder::channel();
    server.add_message_listener(forwarder.clone());
    server.add_connection_listener(forwarder);

    let local = server.local_node();
    println!("\n========================================");
    println!("  NodeNet Server Running");
    println!("========================================");
    println!("  Node: {}", local.name());
    println!("  Address: {}", local.socket_addr());
    println!("========================================");
    println!("\nCommands: /nodes /kick NAME /ban NAME [MINUTES] /mute NAME [MINUTES]");
    println!("          /unmute NAME /accept on|off /quit");
    println!("Anything else is sent as chat.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !admin_command(&server, &chat_channel, line.trim()) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.shutdown();
    tracing::info!("Server stopped");

    Ok(())
}

/// Execute one console line. Returns false when the console should exit.
fn admin_command(server: &ServerMessenger, chat_channel: &str, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (command, args) = match line.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    };

    let result: anyhow::Result<()> = match command {
        "/quit" => return false,
        "/nodes" => {
            for node in server.get_nodes() {
                println!("  {}", node);
            }
            Ok(())
        }
        "/accept" => match args {
            "on" => {
                server.set_accept_new_connections(true);
                Ok(())
            }
            "off" => {
                server.set_accept_new_connections(false);
                Ok(())
            }
            _ => Err(anyhow::anyhow!("usage: /accept on|off")),
        },
        "/kick" => with_node(server, args, |node| Ok(server.remove_connection(node)?)),
        "/ban" => {
            let (name, expires) = split_expiry(args);
            with_node(server, name, |node| Ok(server.ban_player(node, expires)?))
        }
        "/mute" => {
            let (name, expires) = split_expiry(args);
            with_node(server, name, |node| Ok(server.mute_player(node, expires)?))
        }
        "/unmute" => {
            if !server.moderation().unmute_username(args) {
                println!("{} was not muted", args);
            }
            Ok(())
        }
        other if other.starts_with('/') => Err(anyhow::anyhow!("unknown command {}", other)),
        _ => {
            server.broadcast(Payload::Chat(ChatMessage::new(chat_channel, line)));
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("! {}", e);
    }
    true
}

fn with_node<F>(server: &ServerMessenger, name: &str, action: F) -> anyhow::Result<()>
where
    F: FnOnce(&nodenet::Node) -> anyhow::Result<()>,
{
    match server.find_node(name) {
        Some(node) => action(&node),
        None => Err(anyhow::anyhow!("no node named '{}'", name)),
    }
}

/// Split "NAME [MINUTES]" into the name and an optional expiry
fn split_expiry(args: &str) -> (&str, Option<DateTime<Utc>>) {
    if let Some((name, last)) = args.rsplit_once(' ') {
        if let Ok(minutes) = last.parse::<i64>() {
            return (name.trim(), Some(Utc::now() + ChronoDuration::minutes(minutes)));
        }
    }
    (args, None)
}

/// Join a session and chat over stdin
async fn run_client(
    config: Config,
    server: String,
    port: Option<u16>,
    name: Option<String>,
) -> anyhow::Result<()> {
    let mut client_config = config.client_config(&server);
    if let Some(port) = port {
        client_config.port = port;
    }
    if let Some(name) = name {
        client_config.name = name;
    }
    let chat_channel = config.moderation.chat_channel.clone();

    println!("Connecting to {}:{}...", client_config.host, client_config.port);
    let client = ClientMessenger::connect(client_config).await?;

    let (forwarder, mut events) = EventForwarder::channel();
    client.add_message_listener(forwarder.clone());
    client.add_error_listener(forwarder);

    println!("\n========================================");
    println!("  NodeNet Client Connected");
    println!("========================================");
    println!("  Local: {}", client.local_node());
    println!("  Server: {}", client.server_node());
    println!("========================================");
    println!("\nType to chat, /quit to leave.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                print_event(&event);
                if matches!(event, MessengerEvent::Invalid { .. }) {
                    break;
                }
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim() == "/quit" => break,
                    Some(line) if !line.trim().is_empty() => {
                        client.broadcast(Payload::Chat(ChatMessage::new(chat_channel.as_str(), line.trim())));
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    client.shutdown();
    tracing::info!("Client disconnected");

    Ok(())
}

fn print_event(event: &MessengerEvent) {
    match event {
        MessengerEvent::ConnectionAdded(node) => println!("+ {} joined", node),
        MessengerEvent::ConnectionRemoved(node) => println!("- {} left", node),
        MessengerEvent::MessageReceived { payload, from } => match payload {
            Payload::Chat(chat) => println!("<{}> {}", from.name(), chat.text),
            Payload::Data(bytes) => println!("[{} sent {} bytes]", from.name(), bytes.len()),
        },
        MessengerEvent::Invalid { reason } => println!("Disconnected: {}", reason),
    }
}

/// Print system information
fn print_system_info() {
    println!("NodeNet System Information");
    println!("==========================\n");

    println!("Interfaces:");
    for (name, addr) in interface_addresses() {
        println!("  {:<12} {}", name, addr);
    }
    println!("\nAdvertised address: {}", find_local_address());
    println!("Machine hash: {}", local_machine_hash());

    println!("\nConfig search path:");
    for path in Config::search_paths() {
        println!("  {}", path.display());
    }

    println!("\nVersion: {}", nodenet::VERSION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        assert!(Cli::try_parse_from(["nodenet", "info"]).is_ok());
        assert!(Cli::try_parse_from(["nodenet", "client", "--server", "10.0.0.1", "-p", "9000"]).is_ok());
        assert!(Cli::try_parse_from(["nodenet", "client"]).is_err());
    }

    #[test]
    fn test_split_expiry() {
        let (name, expires) = split_expiry("Host (1) 15");
        assert_eq!(name, "Host (1)");
        assert!(expires.is_some());

        let (name, expires) = split_expiry("Host (1)");
        assert_eq!(name, "Host (1)");
        assert!(expires.is_none());
    }
}
