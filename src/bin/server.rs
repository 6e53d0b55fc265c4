//! muxwire Server Binary
//!
//! Usage: muxwire-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a default configuration
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;

use muxwire::config::{ConfigFile, ServerSection};
use muxwire::mux::Server;
use muxwire::outbound::DirectDispatcher;
use muxwire::pipe;

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
            run_server(&args[2]).await?;
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
        r#"muxwire Server - stream multiplexing endpoint

USAGE:
    muxwire-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Print a default configuration
    -h, --help              Print help information

Every accepted connection carries multiplexed sessions; each session is
connected directly to the destination named in its first frame.

EXAMPLES:
    muxwire-server --generate > server.toml
    muxwire-server --config server.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config = ConfigFile {
        server: Some(ServerSection {
            listen: "0.0.0.0:7000".to_string(),
        }),
        ..ConfigFile::default()
    };

    println!("# muxwire server configuration");
    println!();
    println!("{}", config.to_toml_string()?);
    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let config_file = ConfigFile::load(config_path)?;
    let mux = config_file.mux.to_config()?;
    let section = config_file
        .server
        .ok_or_else(|| anyhow::anyhow!("{} has no [server] section", config_path))?;

    let listener = TcpListener::bind(&section.listen).await?;
    let dispatcher = Arc::new(DirectDispatcher::default());

    tracing::info!("muxwire server listening on {}", section.listen);
    tracing::info!(
        "Session buffer: {:?} bytes, first payload wait: {:?}",
        mux.session_buffer,
        mux.first_payload_timeout
    );

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("set_nodelay failed for {}: {}", peer_addr, e);
                }

                let link = pipe::attach(stream, mux.session_pipe());
                let server = Server::new(link, Arc::clone(&dispatcher), &mux);

                tokio::spawn(async move {
                    tracing::debug!("Mux connection from {}", peer_addr);
                    match server.run().await {
                        Ok(()) => tracing::debug!(
                            "Mux connection from {} closed after {} sessions",
                            peer_addr,
                            server.total_sessions()
                        ),
                        Err(e) => tracing::debug!("Mux connection error from {}: {}", peer_addr, e),
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
            }
        }
    }
}
