//! Peer wire encoding: the fixed handshake and length prefixed messages.
//!
//! Every function here is pure, connections live in [`crate::peer`].

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};

use crate::{Error, PeerId, PieceIdx, Result, Sha1};

const HANDSHAKE_PREFIX_LENGTH: usize = 20;
const HANDSHAKE_PREFIX: &[u8; HANDSHAKE_PREFIX_LENGTH] = b"\x13BitTorrent protocol";

const HANDSHAKE_RESERVED_IDX: usize = HANDSHAKE_PREFIX_LENGTH;
const HANDSHAKE_RESERVED_LENGTH: usize = 8;

const HANDSHAKE_INFOHASH_IDX: usize = HANDSHAKE_RESERVED_IDX + HANDSHAKE_RESERVED_LENGTH;
const HANDSHAKE_PEERID_IDX: usize = HANDSHAKE_INFOHASH_IDX + 20;

pub const HANDSHAKE_LENGTH: usize = HANDSHAKE_PREFIX_LENGTH
    + HANDSHAKE_RESERVED_LENGTH
    + 20 // sha1 info hash
    + 20; // peer id

/// Reserved byte and bit advertising support for the extension protocol.
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// Length of the big endian length prefix in front of every message.
pub const LENGTH_PREFIX: usize = 4;

/// Largest message body accepted from a peer. A piece message carrying one block is
/// 16 KiB plus 9 bytes, bitfields of very large torrents are the next biggest thing.
pub const MAX_FRAME_LENGTH: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    pub fn from_u8(id: u8) -> Option<MessageId> {
        Some(match id {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageId::Choke => "choke",
            MessageId::Unchoke => "unchoke",
            MessageId::Interested => "interested",
            MessageId::NotInterested => "not interested",
            MessageId::Have => "have",
            MessageId::Bitfield => "bitfield",
            MessageId::Request => "request",
            MessageId::Piece => "piece",
            MessageId::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// One length prefixed message with an uninterpreted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        encode_frame(self.id, &self.payload)
    }
}

/// Prepends the 4 byte big endian length (`1 + payload.len()`) and the id byte.
pub fn encode_frame(id: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + 1 + payload.len());
    buf.put_u32(1 + payload.len() as u32);
    buf.put_u8(id);
    buf.put_slice(payload);
    buf.freeze()
}

/// Inverse of [`encode_frame`]. Keep-alives have no id and are not frames.
pub fn decode_frame(buf: &[u8]) -> Result<Frame> {
    if buf.len() < LENGTH_PREFIX + 1 {
        return Err(Error::Framing(format!(
            "frame of {} bytes is too short",
            buf.len()
        )));
    }
    let (prefix, body) = buf.split_at(LENGTH_PREFIX);
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if declared as usize != body.len() {
        return Err(Error::Framing(format!(
            "declared length {declared} but {} bytes follow",
            body.len()
        )));
    }
    Ok(Frame {
        id: body[0],
        payload: Bytes::copy_from_slice(&body[1..]),
    })
}

/// Decodes a raw frame and checks that it carries the expected message id.
pub fn verify_expected(buf: &[u8], expected: MessageId) -> Result<Frame> {
    let frame = decode_frame(buf).map_err(|err| match err {
        Error::Framing(msg) => Error::ProtocolViolation(msg),
        other => other,
    })?;
    check_expected(&frame, expected)?;
    Ok(frame)
}

/// Fails with a protocol violation unless `frame` carries the `expected` id.
pub fn check_expected(frame: &Frame, expected: MessageId) -> Result<()> {
    if frame.id != expected.to_u8() {
        return Err(Error::violation(format!(
            "expected {expected} message, received id {}",
            frame.id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        index: PieceIdx,
    },
    Bitfield {
        bitfield: Bytes,
    },
    Request {
        index: PieceIdx,
        begin: u32,
        length: u32,
    },
    Piece {
        index: PieceIdx,
        begin: u32,
        data: Bytes,
    },
    Cancel {
        index: PieceIdx,
        begin: u32,
        length: u32,
    },
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield { .. } => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Message> {
        let id = MessageId::from_u8(frame.id)
            .ok_or_else(|| Error::violation(format!("unknown message id {}", frame.id)))?;
        let mut payload = frame.payload.clone();
        let check_len = |expected: usize| {
            if frame.payload.len() == expected {
                Ok(())
            } else {
                Err(Error::violation(format!(
                    "{id} payload has {} bytes, expected {expected}",
                    frame.payload.len()
                )))
            }
        };

        let message = match id {
            MessageId::Choke => check_len(0).map(|_| Message::Choke)?,
            MessageId::Unchoke => check_len(0).map(|_| Message::Unchoke)?,
            MessageId::Interested => check_len(0).map(|_| Message::Interested)?,
            MessageId::NotInterested => check_len(0).map(|_| Message::NotInterested)?,
            MessageId::Have => {
                check_len(4)?;
                Message::Have {
                    index: PieceIdx::new(payload.get_u32()),
                }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: payload },
            MessageId::Request | MessageId::Cancel => {
                check_len(12)?;
                let index = PieceIdx::new(payload.get_u32());
                let begin = payload.get_u32();
                let length = payload.get_u32();
                if id == MessageId::Request {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(Error::violation(format!(
                        "piece payload has {} bytes, expected at least 8",
                        payload.len()
                    )));
                }
                let index = PieceIdx::new(payload.get_u32());
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: payload,
                }
            }
        };
        Ok(message)
    }

    pub fn to_frame(&self) -> Frame {
        let mut payload = BytesMut::new();
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have { index } => payload.put_u32(u32::from(*index)),
            Message::Bitfield { bitfield } => payload.put_slice(bitfield),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                payload.put_u32(u32::from(*index));
                payload.put_u32(*begin);
                payload.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                payload.put_u32(u32::from(*index));
                payload.put_u32(*begin);
                payload.put_slice(data);
            }
        }
        Frame::new(self.id().to_u8(), payload.freeze())
    }

    pub fn encode(&self) -> Bytes {
        self.to_frame().encode()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; HANDSHAKE_RESERVED_LENGTH],
    pub info_hash: Sha1,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1, peer_id: PeerId, extension: bool) -> Self {
        let mut reserved = [0u8; HANDSHAKE_RESERVED_LENGTH];
        if extension {
            reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        }
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the sender advertised the extension protocol capability.
    pub fn supports_extension(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LENGTH] {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        buf[..HANDSHAKE_PREFIX_LENGTH].copy_from_slice(HANDSHAKE_PREFIX);
        buf[HANDSHAKE_RESERVED_IDX..HANDSHAKE_INFOHASH_IDX].copy_from_slice(&self.reserved);
        buf[HANDSHAKE_INFOHASH_IDX..HANDSHAKE_PEERID_IDX]
            .copy_from_slice(self.info_hash.as_bytes());
        buf[HANDSHAKE_PEERID_IDX..].copy_from_slice(self.peer_id.as_bytes());
        buf
    }

    pub fn parse(buf: &[u8; HANDSHAKE_LENGTH]) -> Result<Self> {
        if &buf[..HANDSHAKE_PREFIX_LENGTH] != HANDSHAKE_PREFIX {
            return Err(Error::HandshakeFailed(
                "peer does not speak the BitTorrent protocol".to_string(),
            ));
        }
        let mut reserved = [0u8; HANDSHAKE_RESERVED_LENGTH];
        reserved.copy_from_slice(&buf[HANDSHAKE_RESERVED_IDX..HANDSHAKE_INFOHASH_IDX]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[HANDSHAKE_INFOHASH_IDX..HANDSHAKE_PEERID_IDX]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[HANDSHAKE_PEERID_IDX..]);
        Ok(Self {
            reserved,
            info_hash: Sha1::from(info_hash),
            peer_id: PeerId::from(peer_id),
        })
    }
}
