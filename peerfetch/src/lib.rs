mod error;
pub use error::{Error, Result};

mod hash;
pub use hash::Sha1;

mod info;
pub use info::TorrentInfo;

pub mod magnet;
pub use magnet::MagnetLink;

pub mod peer;
pub use peer::{ConnectionState, PeerConfig, PeerConnection};

pub mod piece;

pub mod scheduler;
pub use scheduler::{DownloadConfig, DownloadReport, Downloader};

pub mod storage;
pub use storage::OutputFile;

pub mod tracker;
pub use tracker::{Announce, AnnounceParams};

pub mod wire;

#[cfg(test)]
mod testing;

/// Prefix of locally generated peer ids, Azureus style.
const PEER_ID_PREFIX: &[u8; 8] = b"-PF0100-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIdx(u32);

impl std::fmt::Display for PieceIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Piece({})", self.0)
    }
}

impl From<PieceIdx> for u32 {
    fn from(value: PieceIdx) -> Self {
        value.0
    }
}

impl From<u32> for PieceIdx {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl PieceIdx {
    pub fn new(index: u32) -> Self {
        Self(index)
    }
}

#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// A fresh random id for this client.
    pub fn generate() -> Self {
        use rand::{distributions::Alphanumeric, Rng as _};

        let mut id = [0u8; 20];
        id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
        let mut rng = rand::thread_rng();
        for byte in id[PEER_ID_PREFIX.len()..].iter_mut() {
            *byte = rng.sample(Alphanumeric);
        }
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
