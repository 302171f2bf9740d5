//! Fake peers and trackers served from 127.0.0.1, scripted to misbehave.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use rand::{RngCore as _, SeedableRng as _};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    net::TcpListener,
    task::JoinHandle,
};

use crate::{
    wire::{self, Handshake, Message},
    PeerId, PieceIdx, Sha1, TorrentInfo,
};

pub const SEEDER_PEER_ID: &[u8; 20] = b"-FS0001-seeder000000";

/// Deterministic file contents together with their metadata.
pub struct TestTorrent {
    pub info: TorrentInfo,
    pub data: Bytes,
}

impl TestTorrent {
    pub fn new(length: usize, piece_length: u32) -> Self {
        let mut data = vec![0u8; length];
        rand::rngs::StdRng::seed_from_u64(length as u64).fill_bytes(&mut data);
        let pieces = data
            .chunks(piece_length as usize)
            .map(Sha1::hash)
            .collect::<Vec<_>>();
        let info = TorrentInfo::new(
            "http://127.0.0.1:1/announce",
            "test.bin",
            length as u64,
            piece_length,
            pieces,
        )
        .unwrap();
        Self {
            info,
            data: Bytes::from(data),
        }
    }

    pub fn piece(&self, index: PieceIdx) -> &[u8] {
        let start = self.info.piece_offset(index) as usize;
        let end = start + self.info.piece_length_from_index(index) as usize;
        &self.data[start..end]
    }

    fn bitfield(&self) -> Bytes {
        let count = self.info.pieces_count() as usize;
        let mut bitfield = vec![0u8; count.div_ceil(8)];
        for piece in 0..count {
            bitfield[piece / 8] |= 0x80 >> (piece % 8);
        }
        Bytes::from(bitfield)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Honest,
    /// Echoes a digest other than the one received.
    WrongInfoHash,
    /// Serves one block then hangs up.
    DropMidPiece,
    /// Answers every request one byte past the requested offset.
    WrongOffset,
    /// Flips a byte in the final block of every piece.
    CorruptBlock,
    /// Surrounds every reply with keep-alives and unrelated messages.
    Chatty,
    /// Opens with unchoke instead of a bitfield.
    NoBitfield,
    /// Floods have messages instead of unchoking.
    NeverUnchoke,
    /// Completes the handshake, then goes silent until the client hangs up.
    Stall,
}

async fn send<S>(stream: &mut S, message: Message) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&message.encode()).await
}

async fn read_message<S>(stream: &mut S) -> std::io::Result<Option<Message>>
where
    S: AsyncRead + Unpin,
{
    loop {
        let length = match stream.read_u32().await {
            Ok(length) => length,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        };
        if length == 0 {
            continue;
        }
        let mut buf = length.to_be_bytes().to_vec();
        buf.resize(wire::LENGTH_PREFIX + length as usize, 0);
        stream.read_exact(&mut buf[wire::LENGTH_PREFIX..]).await?;
        return wire::decode_frame(&buf)
            .and_then(|frame| Message::from_frame(&frame))
            .map(Some)
            .map_err(std::io::Error::other);
    }
}

/// Plays the seeding side of one connection until the client hangs up.
pub async fn serve<S>(stream: S, torrent: &TestTorrent, behavior: Behavior) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufStream::new(stream);
    let mut buf = [0u8; wire::HANDSHAKE_LENGTH];
    stream.read_exact(&mut buf).await?;
    Handshake::parse(&buf).map_err(std::io::Error::other)?;

    let info_hash = match behavior {
        Behavior::WrongInfoHash => Sha1::hash(b"some other torrent"),
        _ => torrent.info.info_hash(),
    };
    let reply = Handshake::new(info_hash, PeerId::new(*SEEDER_PEER_ID), true);
    stream.write_all(&reply.serialize()).await?;
    stream.flush().await?;

    match behavior {
        Behavior::WrongInfoHash => return Ok(()),
        Behavior::Stall => {
            let mut ignored = Vec::new();
            stream.read_to_end(&mut ignored).await?;
            return Ok(());
        }
        Behavior::NoBitfield => send(&mut stream, Message::Unchoke).await?,
        _ => {
            let bitfield = torrent.bitfield();
            send(&mut stream, Message::Bitfield { bitfield }).await?
        }
    }
    stream.flush().await?;

    let mut served = 0;
    while let Some(message) = read_message(&mut stream).await? {
        match message {
            Message::Interested => match behavior {
                Behavior::NeverUnchoke => {
                    for _ in 0..64 {
                        send(&mut stream, Message::Have { index: PieceIdx::new(0) }).await?;
                    }
                }
                Behavior::Chatty => {
                    stream.write_all(&[0, 0, 0, 0]).await?;
                    send(&mut stream, Message::Have { index: PieceIdx::new(0) }).await?;
                    send(&mut stream, Message::Choke).await?;
                    stream.write_all(&[0, 0, 0, 0]).await?;
                    send(&mut stream, Message::Unchoke).await?;
                }
                _ => send(&mut stream, Message::Unchoke).await?,
            },
            Message::Request {
                index,
                begin,
                length,
            } => {
                if behavior == Behavior::DropMidPiece && served == 1 {
                    return Ok(());
                }
                let piece = torrent.piece(index);
                let start = begin as usize;
                let end = start + length as usize;
                if end > piece.len() {
                    return Err(std::io::Error::other("request out of range"));
                }
                let mut data = piece[start..end].to_vec();
                let mut begin = begin;
                match behavior {
                    Behavior::WrongOffset => begin += 1,
                    Behavior::CorruptBlock if end == piece.len() => data[0] ^= 0xff,
                    Behavior::Chatty => {
                        stream.write_all(&[0, 0, 0, 0]).await?;
                        send(&mut stream, Message::NotInterested).await?;
                    }
                    _ => {}
                }
                let data = Bytes::from(data);
                send(&mut stream, Message::Piece { index, begin, data }).await?;
                served += 1;
            }
            _ => {}
        }
        stream.flush().await?;
    }
    Ok(())
}

/// A TCP seeder. Connection `n` is served with `script[n]`, the last entry repeating.
pub struct Seeder {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Seeder {
    pub async fn spawn(torrent: Arc<TestTorrent>, script: &[Behavior]) -> Self {
        assert!(!script.is_empty());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let script = script.to_vec();
        let task = tokio::spawn({
            let accepted = accepted.clone();
            let finished = finished.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let n = accepted.fetch_add(1, Ordering::SeqCst);
                    let behavior = script[n.min(script.len() - 1)];
                    let torrent = torrent.clone();
                    let finished = finished.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve(stream, &torrent, behavior).await {
                            tracing::trace!("seeder connection ended: {err}");
                        }
                        finished.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }
        });
        Self {
            addr,
            accepted,
            finished,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections whose client went away or that were dropped by the seeder.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Waits up to a second for `count` connections to finish.
    pub async fn wait_finished(&self, count: usize) -> bool {
        for _ in 0..100 {
            if self.finished() >= count {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }
}

impl Drop for Seeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An address nothing listens on.
pub fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Minimal HTTP server answering every request with the same response.
pub struct FakeTracker {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeTracker {
    pub async fn spawn(status: u16, body: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn({
            let requests = requests.clone();
            async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&head);
                    let line = head.lines().next().unwrap_or_default().to_string();
                    requests.lock().unwrap().push(line);

                    let mut response = format!(
                        "HTTP/1.1 {status} Whatever\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        body.len()
                    )
                    .into_bytes();
                    response.extend_from_slice(&body);
                    let _ = stream.write_all(&response).await;
                    let _ = stream.shutdown().await;
                }
            }
        });
        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/announce", self.addr)
    }

    /// Request lines received so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
