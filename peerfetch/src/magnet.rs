use std::{net::SocketAddr, str::FromStr};

use crate::{
    tracker::{AnnounceParams, TrackerHttpClient},
    Error, PeerConfig, PeerConnection, PeerId, Result, Sha1,
};

const MAGNET_PREFIX: &str = "magnet:?";
const BTIH_PREFIX: &str = "urn:btih:";

/// Bytes left announced for a magnet link, the real length is unknown until the metadata
/// has been fetched.
const UNKNOWN_LEFT: u64 = 999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: Sha1,
    /// First `tr` parameter, percent-decoded.
    pub tracker: Option<String>,
    pub name: Option<String>,
}

impl MagnetLink {
    pub fn parse(link: &str) -> Result<Self> {
        let query = link
            .strip_prefix(MAGNET_PREFIX)
            .ok_or_else(|| Error::InvalidMagnet(format!("missing {MAGNET_PREFIX} prefix")))?;

        let mut info_hash = None;
        let mut tracker = None;
        let mut name = None;
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(value)
                .map_err(|err| Error::InvalidMagnet(format!("parameter {key}: {err}")))?;
            match key {
                "xt" if info_hash.is_none() => {
                    let hex = value.strip_prefix(BTIH_PREFIX).ok_or_else(|| {
                        Error::InvalidMagnet(format!("unsupported exact topic {value}"))
                    })?;
                    let hash = Sha1::from_hex(hex).ok_or_else(|| {
                        Error::InvalidMagnet(format!("info hash {hex} is not 40 hex digits"))
                    })?;
                    info_hash = Some(hash);
                }
                "tr" if tracker.is_none() => tracker = Some(value.into_owned()),
                "dn" if name.is_none() => name = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash
                .ok_or_else(|| Error::InvalidMagnet("missing xt parameter".to_string()))?,
            tracker,
            name,
        })
    }

    /// Finds a peer through the link's tracker and handshakes with it, advertising the
    /// extension protocol.
    pub async fn handshake(&self, peer_id: PeerId, config: &PeerConfig) -> Result<MagnetHandshake> {
        let tracker = self
            .tracker
            .as_deref()
            .ok_or_else(|| Error::InvalidMagnet("link has no tracker".to_string()))?;
        let client = TrackerHttpClient::new(tracker)?;
        let params = AnnounceParams::for_hash(self.info_hash, peer_id, UNKNOWN_LEFT);
        let announce = client.announce(&params).await?;
        let peer = announce
            .addresses
            .first()
            .copied()
            .map(SocketAddr::V4)
            .ok_or(Error::NoPeersFound)?;

        let config = PeerConfig {
            extension: true,
            ..config.clone()
        };
        let mut conn = PeerConnection::connect(peer, self.info_hash, peer_id, &config).await?;
        let handshake = MagnetHandshake {
            peer,
            peer_id: conn.remote_peer_id(),
            supports_extension: conn.supports_extension(),
        };
        conn.close().await;
        Ok(handshake)
    }
}

impl FromStr for MagnetLink {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone)]
pub struct MagnetHandshake {
    pub peer: SocketAddr,
    pub peer_id: PeerId,
    pub supports_extension: bool,
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use bencode::{ByteStr, Encoder, EncoderConfig};

    use super::*;
    use crate::testing::{Behavior, FakeTracker, Seeder, TestTorrent, SEEDER_PEER_ID};

    #[test]
    fn parses_link() {
        let link = MagnetLink::parse(
            "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&dn=magnet1.gif&tr=http%3A%2F%2Fbittorrent-test-tracker.codecrafters.io%2Fannounce",
        )
        .unwrap();
        insta::assert_yaml_snapshot!(link.info_hash.to_string(), @"ad42ce8109f54c99613ce38f9b4d87e70f24a165");
        assert_eq!(
            link.tracker.as_deref(),
            Some("http://bittorrent-test-tracker.codecrafters.io/announce")
        );
        insta::assert_yaml_snapshot!(link.name, @"magnet1.gif");
    }

    #[test]
    fn optional_parameters() {
        let link: MagnetLink = "magnet:?xt=urn:btih:AD42CE8109F54C99613CE38F9B4D87E70F24A165"
            .parse()
            .unwrap();
        assert_eq!(link.tracker, None);
        assert_eq!(link.name, None);
    }

    #[test]
    fn rejects_bad_links() {
        for link in [
            "http://example.com",
            "magnet:?dn=name",
            "magnet:?xt=urn:btih:abcd",
            "magnet:?xt=urn:sha1:ad42ce8109f54c99613ce38f9b4d87e70f24a165",
        ] {
            assert!(
                matches!(MagnetLink::parse(link), Err(Error::InvalidMagnet(_))),
                "{link}"
            );
        }
    }

    #[tokio::test]
    async fn handshake_through_tracker() {
        let torrent = Arc::new(TestTorrent::new(1000, 512));
        let seeder = Seeder::spawn(torrent.clone(), &[Behavior::Honest]).await;
        let std::net::SocketAddr::V4(addr) = seeder.addr() else {
            unreachable!()
        };

        let mut peers = addr.ip().octets().to_vec();
        peers.extend_from_slice(&addr.port().to_be_bytes());
        let mut body = Vec::new();
        {
            let config = EncoderConfig::default();
            let mut encoder = Encoder::new(&mut body, &config);
            let mut dict = encoder.dict();
            dict.push(b"interval", 60u32);
            dict.push(b"peers", ByteStr(&peers));
        }
        let tracker = FakeTracker::spawn(200, body).await;

        let link = MagnetLink {
            info_hash: torrent.info.info_hash(),
            tracker: Some(tracker.url()),
            name: None,
        };
        let handshake = link
            .handshake(PeerId::generate(), &PeerConfig::default())
            .await
            .unwrap();
        assert_eq!(handshake.peer, seeder.addr());
        assert_eq!(handshake.peer_id, PeerId::new(*SEEDER_PEER_ID));
        assert!(handshake.supports_extension);
        assert!(tracker.requests()[0].contains("left=999"));
    }
}
