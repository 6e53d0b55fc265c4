//! muxwire Client Binary
//!
//! Usage: muxwire-client [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a default configuration
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use muxwire::config::{ClientSection, ConfigFile};
use muxwire::mux::{ClientPool, Dialer};
use muxwire::net::{Destination, Network};
use muxwire::pipe::{self, PipeOptions};

/// Dials the mux server over plain TCP.
struct TcpDialer {
    server: String,
}

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self) -> muxwire::Result<TcpStream> {
        let stream = TcpStream::connect(&self.server).await?;
        stream.set_nodelay(true)?;
        tracing::info!("Connected to mux server {}", self.server);
        Ok(stream)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing, respects RUST_LOG env var (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_client(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"muxwire Client - local TCP forwarder over a multiplexed connection

USAGE:
    muxwire-client [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    -g, --generate       Print a default configuration
    -h, --help           Print help information

Every connection accepted on [client].listen becomes one mux session to
[client].target, carried over a pooled connection to [client].server.

EXAMPLES:
    muxwire-client --generate > client.toml
    muxwire-client --config client.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config = ConfigFile {
        client: Some(ClientSection {
            listen: "127.0.0.1:8080".to_string(),
            server: "server.example.com:7000".to_string(),
            target: "example.com:80".to_string(),
        }),
        ..ConfigFile::default()
    };

    println!("# muxwire client configuration");
    println!();
    println!("{}", config.to_toml_string()?);
    Ok(())
}

async fn run_client(config_path: &str) -> anyhow::Result<()> {
    let config_file = ConfigFile::load(config_path)?;
    let mux = config_file.mux.to_config()?;
    let section = config_file
        .client
        .ok_or_else(|| anyhow::anyhow!("{} has no [client] section", config_path))?;
    let target = Destination::parse(Network::Tcp, &section.target)?;

    let listener = TcpListener::bind(&section.listen).await?;
    let pool = Arc::new(ClientPool::new(
        TcpDialer {
            server: section.server.clone(),
        },
        mux,
    ));
    tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run_cleanup().await }
    });

    tracing::info!("muxwire client listening on {}", section.listen);
    tracing::info!("Forwarding to {} via {}", target, section.server);

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("set_nodelay failed for {}: {}", peer_addr, e);
                }

                let pool = Arc::clone(&pool);
                let target = target.clone();
                tokio::spawn(async move {
                    let (app, local) = pipe::new_links(PipeOptions::with_limit(64 * 1024));
                    match pool.dispatch(target, local).await {
                        Ok(id) => {
                            tracing::debug!("Forwarding {} as session {}", peer_addr, id);
                            if let Err(e) = pipe::pump(stream, app).await {
                                tracing::debug!("Session {} from {} failed: {}", id, peer_addr, e);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Cannot forward {}: {}", peer_addr, e);
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
            }
        }
    }
}
