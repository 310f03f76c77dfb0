use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use swarm_transfer::hash::derive_transport_key;
use swarm_transfer::manager::{self, DownloadRequest, TransferManager};
use swarm_transfer::{Collaborators, Config, FileHash, JsonResumeStore, LoopbackNetwork, PeerId, StaticFileIndex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SEEDER: u8 = 1;
const LEECHER: u8 = 2;
const RELAY_DOWNLOAD_ID: u64 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (TOML format)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Share a file between two in-process nodes
    Relay {
        /// Path to the file to share
        #[arg(short, long)]
        file: PathBuf,
        /// Where the downloaded copy goes, instead of the configured incoming directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Find the source through tunnels instead of naming it
        #[arg(long)]
        tunnels: bool,
    },
    /// Print the transport key derived from a file hash
    Key {
        /// Hex encoded SHA-256 of the file
        hash: String,
    },
    /// List downloads waiting to be resumed
    Resume,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = Config::load_or_create(&cli.config)?;

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.logging.filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Relay { file, output, tunnels } => {
            if let Some(output) = output {
                config.transfer.incoming_directory = output.to_string_lossy().into_owned();
            }
            run_relay(config, file, tunnels).await?
        }
        Commands::Key { hash } => {
            let hash = FileHash::from_str(&hash)?;
            println!("{}", hex::encode(derive_transport_key(&hash)));
        }
        Commands::Resume => list_suspended(&config)?,
    }

    Ok(())
}

async fn run_relay(config: Config, file: PathBuf, tunnels: bool) -> Result<(), Box<dyn std::error::Error>> {
    let size = std::fs::metadata(&file)?.len();
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("{} has no file name", file.display()))?;

    let mut files = StaticFileIndex::default();
    let hash = files.add_file(file.clone())?;
    info!("Sharing {} ({} bytes) as {}", file.display(), size, hash);

    let network = LoopbackNetwork::default();
    let seeder_peer = PeerId::from_index(SEEDER);
    let leecher_peer = PeerId::from_index(LEECHER);

    let seeder = TransferManager::new(
        seeder_peer,
        config.transfer.clone(),
        Collaborators::new(network.transport(seeder_peer)).with_files(files),
    );
    let (seeder, seeder_join) = manager::spawn(seeder);
    network.register(seeder_peer, seeder.sender());

    let store = JsonResumeStore::new(PathBuf::from(&config.transfer.resume_directory));
    let suspended = store.load_all()?.into_iter().find(|download| download.hash == hash);
    let leecher = TransferManager::new(
        leecher_peer,
        config.transfer.clone(),
        Collaborators::new(network.transport(leecher_peer)).with_store(store),
    );
    let (leecher, leecher_join) = manager::spawn(leecher);
    network.register(leecher_peer, leecher.sender());

    let source = (!tunnels).then_some(seeder_peer);
    let request = match suspended {
        Some(download) => {
            info!("Resuming download {} at {:.1}%", download.id, download.completion_percentage());
            DownloadRequest {
                from: source,
                ..DownloadRequest::from(download)
            }
        }
        None => DownloadRequest {
            id: RELAY_DOWNLOAD_ID,
            name: name.clone(),
            hash,
            size,
            from: source,
            chunk_map: None,
        },
    };
    let id = request.id;
    leecher.start_download(request)?;

    let pb = ProgressBar::new(size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) ETA: {eta} - {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(format!("Receiving: {}", name));

    let mut interval = tokio::time::interval(Duration::from_millis(200));
    let completed = loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, suspending download");
                break false;
            }
        }
        let progress = leecher.downloads_progress().await?;
        let Some(download) = progress.iter().find(|p| p.id == id) else {
            break false;
        };
        pb.set_position(download.current);
        if download.completed {
            break true;
        }
    };

    if completed {
        pb.finish_with_message(format!("Received: {}", name));
        info!("{} saved in {}", name, config.transfer.incoming_directory);
    } else {
        pb.abandon_with_message(format!("Suspended: {}", name));
    }

    leecher.shutdown();
    seeder.shutdown();
    leecher_join.await?;
    seeder_join.await?;
    Ok(())
}

fn list_suspended(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = JsonResumeStore::new(PathBuf::from(&config.transfer.resume_directory));
    let downloads = store.load_all()?;
    if downloads.is_empty() {
        println!("No suspended downloads in {}", store.dir().display());
    }
    for download in downloads {
        println!(
            "{:>6}  {:>5.1}%  {}  {}",
            download.id,
            download.completion_percentage(),
            download.hash,
            download.name
        );
    }
    Ok(())
}
