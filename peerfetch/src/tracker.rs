use std::net::{Ipv4Addr, SocketAddrV4};

pub mod http;

pub use http::TrackerHttpClient;

use crate::{Error, PeerId, Result, Sha1, TorrentInfo};

/// Port announced to trackers, nothing listens on it.
pub const DEFAULT_PORT: u16 = 6881;

/// Length of one compact peer record, 4 bytes of address and 2 of port.
const COMPACT_PEER_LENGTH: usize = 6;

#[derive(Debug, Default, Clone)]
pub struct AnnounceParams {
    pub info_hash: Sha1,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub port: u16,
}

impl AnnounceParams {
    /// Parameters for a client that has nothing of `info` yet.
    pub fn new(info: &TorrentInfo, peer_id: PeerId) -> Self {
        Self::for_hash(info.info_hash(), peer_id, info.length())
    }

    /// Used when only the info hash is known, as with magnet links.
    pub fn for_hash(info_hash: Sha1, peer_id: PeerId, left: u64) -> Self {
        Self {
            info_hash,
            peer_id,
            downloaded: 0,
            left,
            uploaded: 0,
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug)]
pub struct Announce {
    pub interval: u32,
    pub leechers: Option<u32>,
    pub seeders: Option<u32>,
    pub addresses: Vec<SocketAddrV4>,
}

/// Parses the compact peer list, rejecting a trailing partial record.
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddrV4>> {
    if bytes.len() % COMPACT_PEER_LENGTH != 0 {
        return Err(Error::TrackerUnavailable(format!(
            "compact peer list of {} bytes is not a multiple of {COMPACT_PEER_LENGTH}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(COMPACT_PEER_LENGTH)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}
