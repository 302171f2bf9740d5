use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};
use color_eyre::{eyre::WrapErr as _, Result};
use peerfetch::{
    scheduler, storage, tracker::TrackerHttpClient, AnnounceParams, DownloadConfig, Downloader,
    MagnetLink, OutputFile, PeerConfig, PeerConnection, PeerId, PieceIdx, TorrentInfo,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[clap(about = "Download single-file torrents from their peers")]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decode a bencoded value and print it as JSON.
    Decode { value: String },
    /// Print the metadata of a torrent file.
    Info { torrent: PathBuf },
    /// Ask the tracker for peers.
    Peers { torrent: PathBuf },
    /// Handshake with one peer and print its id.
    Handshake { torrent: PathBuf, peer: SocketAddr },
    /// Download a single piece.
    DownloadPiece {
        #[clap(short, long)]
        output: PathBuf,
        torrent: PathBuf,
        piece: u32,
        #[clap(flatten)]
        options: DownloadOptions,
    },
    /// Download the whole file.
    Download {
        #[clap(short, long)]
        output: PathBuf,
        torrent: PathBuf,
        #[clap(flatten)]
        options: DownloadOptions,
    },
    /// Print the tracker and info hash of a magnet link.
    MagnetParse { link: String },
    /// Handshake with the first peer of a magnet link's tracker.
    MagnetHandshake { link: String },
    /// Check an existing file against a torrent.
    Verify { torrent: PathBuf, file: PathBuf },
}

#[derive(Debug, clap::Args)]
struct DownloadOptions {
    /// Peers to use instead of asking the tracker.
    #[clap(long = "peer")]
    peers: Vec<SocketAddr>,

    #[clap(long, default_value_t = 5)]
    workers: usize,

    #[clap(long, default_value_t = 5)]
    max_attempts: u32,

    /// Block requests kept in flight per connection.
    #[clap(long, default_value_t = 1)]
    pipeline: usize,

    /// Give up after this many seconds.
    #[clap(long)]
    timeout: Option<u64>,
}

impl DownloadOptions {
    fn config(&self, peer_id: PeerId) -> DownloadConfig {
        DownloadConfig {
            workers: self.workers,
            max_attempts: self.max_attempts,
            pipeline_depth: self.pipeline,
            timeout: self.timeout.map(Duration::from_secs),
            peer: PeerConfig::default(),
            peer_id,
        }
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter_layer)
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(args.command))
}

async fn run(command: Command) -> Result<()> {
    let peer_id = PeerId::generate();
    match command {
        Command::Decode { value } => {
            let value = bencode::decode_value(value.as_bytes())?;
            println!("{}", serde_json::to_string(&to_json(&value))?);
        }
        Command::Info { torrent } => {
            let info = load_torrent(&torrent)?;
            println!("Tracker URL: {}", info.announce());
            println!("Length: {}", info.length());
            println!("Info Hash: {}", info.info_hash());
            println!("Piece Length: {}", info.piece_length());
            println!("Piece Hashes:");
            for hash in info.pieces() {
                println!("{hash}");
            }
        }
        Command::Peers { torrent } => {
            let info = load_torrent(&torrent)?;
            for peer in announce(&info, peer_id).await? {
                println!("{peer}");
            }
        }
        Command::Handshake { torrent, peer } => {
            let info = load_torrent(&torrent)?;
            let mut conn =
                PeerConnection::connect(peer, info.info_hash(), peer_id, &PeerConfig::default())
                    .await?;
            println!("Peer ID: {}", conn.remote_peer_id());
            conn.close().await;
        }
        Command::DownloadPiece {
            output,
            torrent,
            piece,
            options,
        } => {
            let info = load_torrent(&torrent)?;
            let peers = resolve_peers(&info, peer_id, &options).await?;
            let index = PieceIdx::new(piece);
            let data =
                scheduler::download_single_piece(&info, &peers, index, &options.config(peer_id))
                    .await?;
            tokio::fs::write(&output, &data)
                .await
                .wrap_err_with(|| format!("writing {}", output.display()))?;
            println!("Piece {piece} downloaded to {}.", output.display());
        }
        Command::Download {
            output,
            torrent,
            options,
        } => {
            let info = load_torrent(&torrent)?;
            let peers = resolve_peers(&info, peer_id, &options).await?;
            let file = OutputFile::create(&output, info.clone()).await?;
            let downloader = Downloader::new(info, peers, file, options.config(peer_id));

            let cancel = downloader.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, cancelling download");
                    cancel.cancel();
                }
            });

            let report = downloader.run().await?;
            println!(
                "Downloaded {} to {} ({} pieces, {} failed attempts).",
                torrent.display(),
                output.display(),
                report.pieces,
                report.failures
            );
        }
        Command::MagnetParse { link } => {
            let link = MagnetLink::parse(&link)?;
            println!("Tracker URL: {}", link.tracker.as_deref().unwrap_or(""));
            println!("Info Hash: {}", link.info_hash);
        }
        Command::MagnetHandshake { link } => {
            let link = MagnetLink::parse(&link)?;
            let handshake = link.handshake(peer_id, &PeerConfig::default()).await?;
            println!("Peer ID: {}", handshake.peer_id);
            tracing::info!(
                peer = %handshake.peer,
                extension = handshake.supports_extension,
                "magnet handshake complete"
            );
        }
        Command::Verify { torrent, file } => {
            let info = load_torrent(&torrent)?;
            let bad = storage::verify_existing(&file, &info).await?;
            if bad.is_empty() {
                println!("All {} pieces verified.", info.pieces_count());
            } else {
                for index in &bad {
                    println!("{index} is corrupt or missing");
                }
                color_eyre::eyre::bail!(
                    "{} of {} pieces failed verification",
                    bad.len(),
                    info.pieces_count()
                );
            }
        }
    }
    Ok(())
}

fn load_torrent(path: &Path) -> Result<TorrentInfo> {
    let content =
        std::fs::read(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    Ok(TorrentInfo::decode(&content)?)
}

async fn announce(info: &TorrentInfo, peer_id: PeerId) -> Result<Vec<SocketAddr>> {
    let client = TrackerHttpClient::new(info.announce())?;
    let announce = client.announce(&AnnounceParams::new(info, peer_id)).await?;
    Ok(announce
        .addresses
        .into_iter()
        .map(SocketAddr::V4)
        .collect())
}

async fn resolve_peers(
    info: &TorrentInfo,
    peer_id: PeerId,
    options: &DownloadOptions,
) -> Result<Vec<SocketAddr>> {
    if options.peers.is_empty() {
        announce(info, peer_id).await
    } else {
        Ok(options.peers.clone())
    }
}

fn to_json(value: &bencode::Value) -> serde_json::Value {
    match &value.data {
        bencode::ValueData::Integer(v) => serde_json::Value::from(*v),
        bencode::ValueData::Bytes(v) => {
            serde_json::Value::String(String::from_utf8_lossy(v).into_owned())
        }
        bencode::ValueData::List(values) => values.iter().map(to_json).collect(),
        bencode::ValueData::Dict(dict) => serde_json::Value::Object(
            dict.iter()
                .map(|(key, value)| (String::from_utf8_lossy(key).into_owned(), to_json(value)))
                .collect(),
        ),
    }
}
