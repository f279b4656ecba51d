//! Tabula CLI - collaborative spreadsheet server.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use tabula_server::{Server, ServerConfig};

/// Default port when none is given on the command line.
const DEFAULT_PORT: u16 = 2000;

/// Range of ports accepted when one is given explicitly.
const PORT_RANGE: std::ops::RangeInclusive<u16> = 2112..=2120;

#[derive(Parser)]
#[command(name = "tabula")]
#[command(about = "Collaborative spreadsheet server")]
#[command(version)]
struct Cli {
    /// Port to listen on. Valid ports are 2000 (default) and 2112 to 2120.
    port: Option<String>,

    /// Extra positional arguments; rejected with a usage message.
    #[arg(trailing_var_arg = true, hide = true)]
    extra: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding server state (spreadsheets/ and the users file)
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
}

fn print_usage() {
    println!("Usage: tabula <port>");
    println!("\t<port>\tA valid port number used for accepting connections.");
    println!("\t      \t  Valid ports are 2000 and 2112 to 2120.");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if !cli.extra.is_empty() {
        print_usage();
        return Ok(());
    }

    let port = match cli.port.as_deref() {
        None => DEFAULT_PORT,
        Some(raw) => match raw.parse::<u16>() {
            Ok(port) if PORT_RANGE.contains(&port) => port,
            _ => {
                println!("Invalid port number. Port must be between 2112 and 2120.");
                std::process::exit(1);
            }
        },
    };

    let config = ServerConfig {
        host: String::new(),
        port,
        data_dir: cli.data_dir,
    };
    let server = Server::new(config);
    server.start().await?;

    println!("The server can be stopped with the STOP command.");

    // Wait for STOP on standard input, or Ctrl-C.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim() == "STOP" => break,
                Ok(Some(_)) => {}
                // Stdin closed or unreadable: fall back to Ctrl-C only.
                Ok(None) | Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server.stop().await;
    Ok(())
}
