use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use sha1::Digest as _;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    peer::{ConnectionState, PeerConnection},
    wire::{self, Message, MessageId},
    Error, PieceIdx, Result, Sha1, TorrentInfo,
};

/// Size of a block request, only the final block of a piece may be shorter.
pub const BLOCK_LENGTH: u32 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: PieceIdx,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn to_message(self) -> Message {
        Message::Request {
            index: self.index,
            begin: self.begin,
            length: self.length,
        }
    }
}

/// Splits a piece into consecutive block requests covering `[0, piece_length)`.
pub fn block_requests(index: PieceIdx, piece_length: u32) -> Vec<BlockRequest> {
    let block_count = piece_length.div_ceil(BLOCK_LENGTH);
    let mut requests = Vec::with_capacity(block_count as usize);
    let mut remaining_length = piece_length;
    for block in 0..block_count {
        let length = remaining_length.min(BLOCK_LENGTH);
        requests.push(BlockRequest {
            index,
            begin: block * BLOCK_LENGTH,
            length,
        });
        remaining_length -= length;
    }
    requests
}

/// Bytes and hash state of one attempt at downloading a piece. Never reused after a
/// failure.
pub struct PieceAttempt {
    index: PieceIdx,
    expected_digest: Sha1,
    expected_length: u32,
    accumulated: BytesMut,
    hasher: sha1::Sha1,
}

impl PieceAttempt {
    pub fn new(info: &TorrentInfo, index: PieceIdx) -> Result<Self> {
        let expected_digest = info.piece_hash(index).ok_or(Error::InvalidPiece(index))?;
        let expected_length = info.piece_length_from_index(index);
        Ok(Self {
            index,
            expected_digest,
            expected_length,
            accumulated: BytesMut::with_capacity(expected_length as usize),
            hasher: sha1::Sha1::new(),
        })
    }

    pub fn index(&self) -> PieceIdx {
        self.index
    }

    pub fn expected_length(&self) -> u32 {
        self.expected_length
    }

    pub fn requests(&self) -> Vec<BlockRequest> {
        block_requests(self.index, self.expected_length)
    }

    /// Appends the reply to `request`. Blocks must arrive in request order.
    pub fn append(&mut self, request: &BlockRequest, reply: Message) -> Result<()> {
        let Message::Piece { index, begin, data } = reply else {
            return Err(Error::violation(format!(
                "expected piece message, received {}",
                reply.id()
            )));
        };
        if index != request.index || begin != request.begin {
            return Err(Error::violation(format!(
                "requested block at {} offset {}, received {index} offset {begin}",
                request.index, request.begin
            )));
        }
        if data.len() != request.length as usize {
            return Err(Error::violation(format!(
                "requested {} bytes at offset {begin}, received {}",
                request.length,
                data.len()
            )));
        }
        if self.accumulated.len() != begin as usize {
            return Err(Error::violation(format!(
                "block at offset {begin} arrived out of order"
            )));
        }
        self.hasher.update(&data);
        self.accumulated.extend_from_slice(&data);
        Ok(())
    }

    /// Checks the assembled piece against its expected digest.
    pub fn finish(self) -> Result<Bytes> {
        if self.accumulated.len() != self.expected_length as usize {
            return Err(Error::violation(format!(
                "{} is incomplete, {} of {} bytes",
                self.index,
                self.accumulated.len(),
                self.expected_length
            )));
        }
        let digest = Sha1::from(<[u8; 20]>::from(self.hasher.finalize()));
        if digest != self.expected_digest {
            return Err(Error::HashMismatch(self.index));
        }
        Ok(self.accumulated.freeze())
    }
}

/// Downloads one piece over a freshly handshaken connection.
///
/// The peer must open with a bitfield. After that the piece is requested block by block
/// with at most `pipeline_depth` requests outstanding, and the assembled bytes are
/// returned only if they match the expected digest. The connection is left open, closing
/// it is up to the caller.
pub async fn download_piece<S>(
    conn: &mut PeerConnection<S>,
    info: &TorrentInfo,
    index: PieceIdx,
    pipeline_depth: usize,
) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut attempt = PieceAttempt::new(info, index)?;
    let max_skip = conn.config().max_skip;

    conn.set_state(ConnectionState::AwaitingBitfield);
    let first = conn.read_message().await?;
    wire::check_expected(&first, MessageId::Bitfield)?;

    conn.send_message(&Message::Interested).await?;
    conn.await_message(MessageId::Unchoke, max_skip).await?;
    conn.set_state(ConnectionState::Ready);

    let requests = attempt.requests();
    tracing::debug!(
        piece = %index,
        length = attempt.expected_length(),
        blocks = requests.len(),
        "requesting piece"
    );

    let depth = pipeline_depth.max(1);
    let mut unsent = requests.iter();
    let mut outstanding = VecDeque::with_capacity(depth);
    loop {
        while outstanding.len() < depth {
            let Some(request) = unsent.next() else { break };
            conn.send_message(&request.to_message()).await?;
            outstanding.push_back(request);
        }
        let Some(request) = outstanding.pop_front() else {
            break;
        };
        let frame = conn.await_message(MessageId::Piece, max_skip).await?;
        attempt.append(request, Message::from_frame(&frame)?)?;
    }

    attempt.finish()
}
