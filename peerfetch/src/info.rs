use std::sync::Arc;

use bencode::{ByteStr, Encode, Encoder};

use crate::{Error, PieceIdx, Result, Sha1};

struct TorrentInfoInner {
    announce: String,
    name: String,
    length: u64,
    piece_length: u32,
    pieces: Vec<Sha1>,
    info_hash: Sha1,
}

impl std::fmt::Debug for TorrentInfoInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Torrent \n\tAnnounce : {:?}\n\tName : {:?}\n\tLength : {}\n\tPiece length : {}\n\tPieces : {}\n\tInfo hash : {}\n",
            self.announce,
            self.name,
            self.length,
            self.piece_length,
            self.pieces.len(),
            self.info_hash
        )
    }
}

/// Immutable description of a single-file torrent.
#[derive(Clone)]
pub struct TorrentInfo(Arc<TorrentInfoInner>);

impl std::fmt::Debug for TorrentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl TorrentInfo {
    /// Builds metadata from its parts, computing the info hash from the canonical encoding
    /// of the info dictionary.
    pub fn new(
        announce: impl Into<String>,
        name: impl Into<String>,
        length: u64,
        piece_length: u32,
        pieces: Vec<Sha1>,
    ) -> Result<Self> {
        let info = Info {
            name: name.into(),
            length,
            piece_length,
            pieces,
        };
        info.validate()?;
        let info_hash = Sha1::hash(&bencode::encode(&info));
        Ok(Self::from_parts(announce.into(), info, info_hash))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let metainfo = bencode::decode::<Metainfo>(buf)?;
        metainfo.info.validate()?;
        Ok(Self::from_parts(
            metainfo.announce,
            metainfo.info,
            metainfo.info_hash,
        ))
    }

    /// Encodes the metadata as a `.torrent` file.
    pub fn encode(&self) -> Vec<u8> {
        let info = Info {
            name: self.0.name.clone(),
            length: self.0.length,
            piece_length: self.0.piece_length,
            pieces: self.0.pieces.clone(),
        };
        let mut buf = Vec::new();
        let config = bencode::EncoderConfig::default();
        {
            let mut encoder = Encoder::new(&mut buf, &config);
            let mut dict = encoder.dict();
            dict.push(b"announce", &self.0.announce);
            dict.push(b"info", &info);
        }
        buf
    }

    fn from_parts(announce: String, info: Info, info_hash: Sha1) -> Self {
        Self(Arc::new(TorrentInfoInner {
            announce,
            name: info.name,
            length: info.length,
            piece_length: info.piece_length,
            pieces: info.pieces,
            info_hash,
        }))
    }

    pub fn announce(&self) -> &str {
        &self.0.announce
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn length(&self) -> u64 {
        self.0.length
    }

    pub fn info_hash(&self) -> Sha1 {
        self.0.info_hash
    }

    /// Nominal piece length, every piece but the last has exactly this length.
    pub fn piece_length(&self) -> u32 {
        self.0.piece_length
    }

    pub fn pieces_count(&self) -> u32 {
        self.0.pieces.len() as u32
    }

    pub fn pieces(&self) -> &[Sha1] {
        &self.0.pieces
    }

    pub fn piece_indices(&self) -> impl Iterator<Item = PieceIdx> {
        (0..self.pieces_count()).map(PieceIdx::new)
    }

    pub fn piece_index_valid(&self, piece_index: PieceIdx) -> bool {
        u32::from(piece_index) < self.pieces_count()
    }

    pub fn piece_hash(&self, piece_index: PieceIdx) -> Option<Sha1> {
        self.0.pieces.get(u32::from(piece_index) as usize).copied()
    }

    /// Length of the given piece, shorter for the final piece. Zero for invalid indices.
    pub fn piece_length_from_index(&self, piece_index: PieceIdx) -> u32 {
        let index = u32::from(piece_index);
        let count = self.pieces_count();
        if index >= count {
            0
        } else if index + 1 == count {
            let preceding = u64::from(self.piece_length()) * u64::from(count - 1);
            (self.length() - preceding) as u32
        } else {
            self.piece_length()
        }
    }

    /// Absolute byte offset of the piece in the output file.
    pub fn piece_offset(&self, piece_index: PieceIdx) -> u64 {
        u64::from(u32::from(piece_index)) * u64::from(self.piece_length())
    }
}

#[derive(Debug)]
struct Metainfo {
    announce: String,
    info: Info,
    info_hash: Sha1,
}

#[derive(Debug)]
struct Info {
    name: String,
    length: u64,
    piece_length: u32,
    pieces: Vec<Sha1>,
}

impl Info {
    fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(Error::MalformedMetadata(
                "piece length must be positive".to_string(),
            ));
        }
        let expected = self.length.div_ceil(u64::from(self.piece_length));
        if self.pieces.len() as u64 != expected {
            return Err(Error::MalformedMetadata(format!(
                "expected {expected} piece hashes for {} bytes, found {}",
                self.length,
                self.pieces.len()
            )));
        }
        Ok(())
    }
}

impl bencode::FromValue for Info {
    fn from_value(value: &bencode::Value) -> bencode::Result<Self> {
        let dict = value.as_dict()?;
        if dict.contains_key(b"files") {
            return Err(bencode::Error::message(
                "multi-file torrents are not supported",
            ));
        }

        let pieces_bytes = dict.require_value(b"pieces")?.as_bytes()?;
        if pieces_bytes.len() % Sha1::LENGTH != 0 {
            return Err(bencode::Error::message(
                "size of pieces byte string is not a multiple of 20",
            ));
        }
        let pieces = pieces_bytes
            .chunks_exact(Sha1::LENGTH)
            .filter_map(Sha1::from_bytes)
            .collect();

        Ok(Self {
            name: dict.find(b"name")?.unwrap_or_default(),
            length: dict.require(b"length")?,
            piece_length: dict.require(b"piece length")?,
            pieces,
        })
    }
}

impl Encode for Info {
    fn encode(&self, encoder: &mut Encoder) {
        let pieces = self
            .pieces
            .iter()
            .flat_map(|hash| hash.as_bytes())
            .copied()
            .collect::<Vec<u8>>();
        let mut dict = encoder.dict();
        dict.push(b"length", self.length);
        dict.push(b"name", &self.name);
        dict.push(b"piece length", self.piece_length);
        dict.push(b"pieces", ByteStr(&pieces));
    }
}

impl bencode::FromValue for Metainfo {
    fn from_value(value: &bencode::Value) -> bencode::Result<Self> {
        let dict = value.as_dict()?;
        let info_value = dict.require_value(b"info")?;
        Ok(Self {
            announce: dict.require(b"announce")?,
            info: Info::from_value(info_value)?,
            info_hash: Sha1::hash(info_value.bytes),
        })
    }
}
