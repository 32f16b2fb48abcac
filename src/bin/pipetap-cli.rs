use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

#[derive(Parser)]
#[command(name = "pipetap-cli")]
#[command(about = "Line client for the pipetap demo host", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    addr: String,

    /// Log in under this identity (UUID) before sending.
    #[arg(short, long)]
    identity: Option<String>,

    /// How long to wait for each reply, in milliseconds.
    #[arg(short, long, default_value_t = 500)]
    wait_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send lines and print whatever comes back
    Send { lines: Vec<String> },
    /// Generate a fresh identity
    Identity,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let lines = match cli.command {
        Commands::Identity => {
            println!("{}", uuid::Uuid::new_v4());
            return Ok(());
        }
        Commands::Send { lines } => lines,
    };

    let stream = TcpStream::connect(&cli.addr).await?;
    let mut framed = Framed::new(stream, LinesCodec::new());
    let wait = Duration::from_millis(cli.wait_ms);

    if let Some(identity) = &cli.identity {
        uuid::Uuid::parse_str(identity)?;
        framed.send(format!("/login {identity}")).await?;
    }

    for line in lines {
        framed.send(line.as_str()).await?;
        println!("> {line}");
        match tokio::time::timeout(wait, framed.next()).await {
            Ok(Some(reply)) => println!("< {}", reply?),
            Ok(None) => {
                println!("connection closed");
                break;
            }
            Err(_) => println!("  (no reply)"),
        }
    }

    // Anything still in flight.
    while let Ok(Some(reply)) = tokio::time::timeout(wait, framed.next()).await {
        println!("< {}", reply?);
    }
    Ok(())
}
