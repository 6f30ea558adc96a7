use clap::Parser;
use log::info;
use server::{Behaviour, MockHost};
use std::collections::HashSet;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Main-method of the scripted host.
/// Binds the control socket, then forwards console lines to connected directors.
///
/// Console input:
/// - `chat <player id> <text>` sends a chat broadcast, e.g.
///   `chat 7650 Ace killed F-16 (Rival) with AIM-9.`
/// - anything else is written to the directors verbatim
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
        port: u16,
        /// Prefix the first line of each connection with a byte-order mark
        #[clap(long)]
        bom: bool,
        /// Commands to never answer (repeatable)
        #[clap(long)]
        silent: Vec<String>,
    }

    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let behaviour = Behaviour {
        bom: args.bom,
        silent: args.silent.into_iter().collect::<HashSet<_>>(),
        ..Behaviour::default()
    };

    let address = format!("{}:{}", args.host, args.port);
    let host = MockHost::bind(&address, behaviour).await?;
    info!("Type 'chat <id> <text>' or a raw line to send it to connected directors");

    let console = async {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.strip_prefix("chat ").and_then(|rest| rest.split_once(' ')) {
                Some((player_id, text)) => host.inject_chat(player_id, text),
                None => host.inject(line),
            }
        }
    };

    tokio::select! {
        _ = console => {
            info!("Console closed, serving until Ctrl+C");
            tokio::signal::ctrl_c().await?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    for line in host.received() {
        info!("received: {}", line);
    }
    Ok(())
}
