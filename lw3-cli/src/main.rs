//! lw3-cli - Command-line interface for LW3 servers
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use lw3_client::{
    Client, ClientEvent, ClientOptions, ConnectionConfig, Credentials, TlsClientConfig,
    Transport,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lw3-cli")]
#[command(about = "Command-line interface for LW3 servers")]
#[command(version)]
struct Cli {
    /// Server address ([tcp://|ws://|wss://]host[:port])
    #[arg(short, long, default_value = "127.0.0.1:6107", env = "LW3_SERVER")]
    server: String,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "1000")]
    timeout: u64,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "LW3_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "LW3_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "LW3_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "LW3_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server hostname)
    #[arg(long)]
    server_name: Option<String>,

    // ===== WebSocket Options =====
    /// Connect over WebSocket (implied by a ws:// or wss:// address)
    #[arg(long, env = "LW3_WEBSOCKET")]
    websocket: bool,

    /// Username for WebSocket Basic authentication
    #[arg(long, env = "LW3_USERNAME", requires = "password")]
    username: Option<String>,

    /// Password for WebSocket Basic authentication
    #[arg(long, env = "LW3_PASSWORD", requires = "username", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start interactive REPL
    Repl,

    /// Read a property (/NODE.Property)
    Get {
        path: String,
    },

    /// Write a property (/NODE.Property)
    Set {
        path: String,
        value: String,
    },

    /// Invoke a method (/NODE:method)
    Call {
        path: String,

        /// Comma separated arguments
        #[arg(default_value = "")]
        args: String,
    },

    /// List the child nodes of a node
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Show manuals (/NODE.*, /NODE.Property or /NODE:method)
    Man {
        target: String,
    },

    /// Print all properties of a node as JSON
    Dump {
        path: String,
    },

    /// Print change notifications of a node until Ctrl+C
    Watch {
        path: String,

        /// Filter rule: Property or Property=value
        #[arg(default_value = "")]
        rule: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Build TLS config if any TLS option is set
    let tls_config =
        if cli.tls || cli.ca_cert.is_some() || cli.client_cert.is_some() || cli.insecure {
            let mut tls = TlsClientConfig::new();
            if let Some(ref path) = cli.ca_cert {
                tls = tls.with_ca_cert(path);
            }
            match (&cli.client_cert, &cli.client_key) {
                (Some(cert), Some(key)) => tls = tls.with_client_cert(cert, key),
                (None, None) => {}
                _ => {
                    eprintln!(
                        "{}: --client-cert and --client-key must be used together",
                        "Error".red()
                    );
                    std::process::exit(1);
                }
            }
            if cli.insecure {
                tls = tls.with_insecure();
            }
            if let Some(ref name) = cli.server_name {
                tls = tls.with_server_name(name);
            }
            Some(tls)
        } else {
            None
        };

    let mut config = ConnectionConfig::parse(&cli.server)?;
    if let Some(tls) = tls_config {
        config = config.with_tls(tls);
    }
    if cli.websocket {
        config = config.with_transport(Transport::WebSocket);
    }
    if let (Some(username), Some(password)) = (&cli.username, &cli.password) {
        if config.transport != Transport::WebSocket {
            eprintln!(
                "{}: --username and --password need the WebSocket transport",
                "Error".red()
            );
            std::process::exit(1);
        }
        config = config.with_credentials(Credentials::new(username, password));
    }
    let options = ClientOptions::default().with_request_timeout(Duration::from_millis(cli.timeout));
    let client = Client::with_options(config, options);
    let connect_timeout = Duration::from_millis(cli.timeout.max(3000));

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, &cli.server, connect_timeout).await?;
        }
        Some(Commands::Watch { path, rule }) => {
            connect(&client, &cli.server, connect_timeout).await;
            let id = match client
                .open(&path, &rule, None, |path, property, value| {
                    println!(
                        "{} {}.{}={}",
                        "CHG".yellow(),
                        path,
                        property.cyan(),
                        value
                    );
                })
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            };
            eprintln!("{} {}", "Watching".green(), path.cyan());
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

            let mut events = client.subscribe_events();
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(lw3_client::ClientEvent::Disconnected) => {
                            eprintln!("{}", "Connection lost, reconnecting...".yellow());
                        }
                        Ok(lw3_client::ClientEvent::Connected) => {
                            eprintln!("{}", "Reconnected".green());
                        }
                        Ok(lw3_client::ClientEvent::Error(e)) => {
                            eprintln!("{}: {}", "Warning".yellow(), e);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{}", "Stopping watch...".dimmed());
                        let _ = client.close(id).await;
                        break;
                    }
                }
            }
            client.disconnect();
        }
        Some(cmd) => {
            connect(&client, &cli.server, connect_timeout).await;
            match commands::execute(&client, cmd).await {
                Ok(output) => println!("{}", output),
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
            client.disconnect();
        }
    }

    Ok(())
}

/// Waits for the first connection or exits, reporting the last connection
/// error seen meanwhile.
async fn connect(client: &Client, server: &str, timeout: Duration) {
    let mut events = client.subscribe_events();
    let wait = client.wait_connected(timeout);
    tokio::pin!(wait);
    let mut reason = None;
    loop {
        tokio::select! {
            result = &mut wait => {
                if result.is_ok() {
                    return;
                }
                break;
            }
            Ok(ClientEvent::Error(message)) = events.recv() => reason = Some(message),
        }
    }
    match reason {
        Some(reason) => eprintln!("{}: {}: {}", "Connection failed".red(), server, reason),
        None => eprintln!("{}: cannot reach {}", "Connection failed".red(), server),
    }
    std::process::exit(1);
}
