use thiserror::Error;

use crate::PieceIdx;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("tracker unavailable: {0}")]
    TrackerUnavailable(String),

    #[error("tracker returned no peers")]
    NoPeersFound,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(#[source] std::io::Error),

    #[error("malformed frame: {0}")]
    Framing(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{0} failed hash verification")]
    HashMismatch(PieceIdx),

    #[error("timed out waiting for {0}")]
    ProtocolTimeout(String),

    #[error("{0} does not exist in this torrent")]
    InvalidPiece(PieceIdx),

    #[error("{0} conflicts with data already written")]
    IntegrityViolation(PieceIdx),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    #[error("download incomplete, {} could not be downloaded", piece_list(.failed))]
    DownloadIncomplete { failed: Vec<PieceIdx> },

    #[error("download cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the error is confined to one piece attempt, so the piece may be retried
    /// on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::HandshakeFailed(_)
                | Error::ConnectionLost(_)
                | Error::Framing(_)
                | Error::ProtocolViolation(_)
                | Error::HashMismatch(_)
                | Error::ProtocolTimeout(_)
        )
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }
}

fn piece_list(pieces: &[PieceIdx]) -> String {
    pieces
        .iter()
        .map(PieceIdx::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<bencode::Error> for Error {
    fn from(value: bencode::Error) -> Self {
        Error::MalformedMetadata(value.to_string())
    }
}
