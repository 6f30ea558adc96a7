use clap::Parser;
use client::archive::FsArchiver;
use client::config::DirectorConfig;
use client::network::{Client, ClientOptions};
use client::rotation::{describe, Collaborators, RotationDriver, RotationMode};
use client::router::AutoProcessor;
use client::store::{JsonFileStore, PlayerStore};
use client::telemetry::TelemetryEngine;
use log::{error, info, warn};
use shared::Command;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address of the server's control socket
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Control socket port
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,

    /// Rotation index to start from; asked for on stdin when omitted
    #[arg(short, long)]
    start_index: Option<usize>,

    /// Pick the next map at random instead of in order
    #[arg(long)]
    random: bool,

    /// TOML configuration file, created with defaults if missing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only query the host configuration, then exit
    #[arg(long)]
    check_only: bool,
}

async fn read_start_index(config: &DirectorConfig) -> Result<usize, Box<dyn std::error::Error>> {
    println!("Choose a starting state:");
    for line in describe(config) {
        println!("  {}", line);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim().parse::<usize>() {
            Ok(index) if index < config.maps.len() => return Ok(index),
            _ => println!("Enter a number between 0 and {}", config.maps.len() - 1),
        }
    }
    Err("stdin closed before a start index was chosen".into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DirectorConfig::load_or_create(path)?,
        None => DirectorConfig::default(),
    };

    let store: Arc<dyn PlayerStore> = Arc::new(JsonFileStore::open(&config.paths.store_file)?);
    let first_category = config.maps[0].category;
    let telemetry = Arc::new(TelemetryEngine::new(
        Arc::clone(&store),
        config.rating.clone(),
        first_category,
    ));

    let processor: Arc<dyn AutoProcessor> = telemetry.clone();
    let options = ClientOptions {
        auto_tags: vec![config.tags.chat.clone()],
        processor: Some(processor),
        ..ClientOptions::default()
    };
    let address = format!("{}:{}", args.host, args.port);
    let client = Arc::new(Client::connect(&address, options).await?);

    let host_reply = client
        .send_and_wait(
            &Command::CheckHost,
            &[config.tags.host_config.as_str()],
            config.timing.request_timeout(),
            config.timing.retries,
        )
        .await;
    match host_reply {
        Ok(reply) => info!("Host configuration: {}", reply.msg),
        Err(e) if args.check_only => {
            client.shutdown().await;
            return Err(e.into());
        }
        Err(e) => warn!("Host did not answer checkhost: {}", e),
    }
    if args.check_only {
        client.shutdown().await;
        return Ok(());
    }

    for line in describe(&config) {
        info!("{}", line);
    }
    let start_index = match args.start_index {
        Some(index) => index,
        None => read_start_index(&config).await?,
    };
    config.check_start_index(start_index)?;

    let mode = if args.random {
        RotationMode::Random
    } else {
        RotationMode::Sequential
    };
    info!("Starting rotation at state {} ({:?})", start_index, mode);

    let archiver = FsArchiver::new(&config.paths.autosave_dir, &config.paths.replay_dir);
    let collaborators = Collaborators {
        telemetry,
        store,
        archiver: Arc::new(archiver),
    };
    let mut driver =
        RotationDriver::new(Arc::clone(&client), config, collaborators, start_index, mode)?;

    let outcome = tokio::select! {
        result = driver.run() => result,
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
            Ok(())
        }
    };

    driver.shutdown();
    client.shutdown().await;

    if let Err(e) = outcome {
        error!("Rotation stopped: {}", e);
        return Err(e.into());
    }
    Ok(())
}
