use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    net::TcpStream,
};

use crate::{
    wire::{self, Frame, Handshake, Message, MessageId},
    Error, PeerId, Result, Sha1,
};

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Upper bound for reading one message, keep-alives included.
    pub read_timeout: Duration,
    /// Number of unrelated messages tolerated while waiting for a specific one.
    pub max_skip: usize,
    /// Advertise the extension protocol in the handshake reserved bytes.
    pub extension: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_skip: 32,
            extension: false,
        }
    }
}

/// Lifecycle of a connection once its handshake was verified. Connecting and sending the
/// handshake happen inside [`PeerConnection::connect`] and [`PeerConnection::handshake`],
/// which only hand out a connection after the reply checks out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    HandshakeVerified,
    AwaitingBitfield,
    Ready,
    Closed,
}

/// One connection to one peer, past the handshake.
#[derive(Debug)]
pub struct PeerConnection<S = TcpStream> {
    stream: BufStream<S>,
    remote: Handshake,
    state: ConnectionState,
    config: PeerConfig,
}

impl PeerConnection<TcpStream> {
    pub async fn connect(
        addr: SocketAddr,
        info_hash: Sha1,
        peer_id: PeerId,
        config: &PeerConfig,
    ) -> Result<Self> {
        tracing::debug!(addr = ?addr, "connecting");
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::HandshakeFailed(format!("connecting to {addr} timed out")))?
            .map_err(|err| Error::HandshakeFailed(format!("connecting to {addr}: {err}")))?;
        Self::handshake(stream, info_hash, peer_id, config).await
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Exchanges handshakes over an already open stream. The stream is shut down if the
    /// peer does not echo `info_hash`.
    pub async fn handshake(
        stream: S,
        info_hash: Sha1,
        peer_id: PeerId,
        config: &PeerConfig,
    ) -> Result<Self> {
        let mut stream = BufStream::new(stream);
        let local = Handshake::new(info_hash, peer_id, config.extension);
        let exchange = async {
            stream.write_all(&local.serialize()).await?;
            stream.flush().await?;
            let mut reply = [0u8; wire::HANDSHAKE_LENGTH];
            stream.read_exact(&mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        };
        let reply = tokio::time::timeout(config.handshake_timeout, exchange)
            .await
            .map_err(|_| Error::HandshakeFailed("timed out waiting for reply".to_string()))?
            .map_err(|err| Error::HandshakeFailed(err.to_string()))?;

        let remote = match Handshake::parse(&reply) {
            Ok(remote) if remote.info_hash == info_hash => remote,
            Ok(remote) => {
                let _ = stream.shutdown().await;
                return Err(Error::HandshakeFailed(format!(
                    "peer answered with info hash {} instead of {info_hash}",
                    remote.info_hash
                )));
            }
            Err(err) => {
                let _ = stream.shutdown().await;
                return Err(err);
            }
        };
        tracing::debug!(
            peer_id = %remote.peer_id,
            extension = remote.supports_extension(),
            "handshake verified"
        );

        Ok(Self {
            stream,
            remote,
            state: ConnectionState::HandshakeVerified,
            config: config.clone(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.remote.peer_id
    }

    /// Whether the remote peer advertised the extension protocol.
    pub fn supports_extension(&self) -> bool {
        self.remote.supports_extension()
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Reads the next message, consuming keep-alives. The whole call, keep-alives
    /// included, is bounded by the read timeout.
    pub async fn read_message(&mut self) -> Result<Frame> {
        self.ensure_open()?;
        let read_timeout = self.config.read_timeout;
        match tokio::time::timeout(read_timeout, self.read_frame()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ProtocolTimeout(format!(
                "a message after {read_timeout:?}"
            ))),
        }
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            let length = self
                .stream
                .read_u32()
                .await
                .map_err(Error::ConnectionLost)?;
            if length == 0 {
                tracing::trace!("keep-alive");
                continue;
            }
            if length > wire::MAX_FRAME_LENGTH {
                return Err(Error::violation(format!(
                    "message length {length} exceeds limit"
                )));
            }

            let mut buf = vec![0u8; wire::LENGTH_PREFIX + length as usize];
            buf[..wire::LENGTH_PREFIX].copy_from_slice(&length.to_be_bytes());
            self.stream
                .read_exact(&mut buf[wire::LENGTH_PREFIX..])
                .await
                .map_err(Error::ConnectionLost)?;
            return wire::decode_frame(&buf);
        }
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        tracing::trace!(message = %message.id(), "sending");
        self.send_frame(&message.to_frame()).await
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        self.ensure_open()?;
        self.stream
            .write_all(&frame.encode())
            .await
            .map_err(Error::ConnectionLost)?;
        self.stream.flush().await.map_err(Error::ConnectionLost)
    }

    /// Reads until a message with id `expected` arrives, discarding others. Fails with
    /// [`Error::ProtocolTimeout`] once `max_skip` messages were discarded.
    pub async fn await_message(&mut self, expected: MessageId, max_skip: usize) -> Result<Frame> {
        let mut skipped = 0;
        loop {
            let frame = self.read_message().await?;
            if frame.id == expected.to_u8() {
                return Ok(frame);
            }
            tracing::trace!(expected = %expected, received = frame.id, "skipping message");
            skipped += 1;
            if skipped >= max_skip {
                return Err(Error::ProtocolTimeout(format!(
                    "{expected} message, skipped {skipped} others"
                )));
            }
        }
    }

    /// Shuts the write half down. Reads and sends fail afterwards.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Err(err) = self.stream.shutdown().await {
            tracing::trace!("shutdown failed: {err}");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionLost(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection was closed",
            )));
        }
        Ok(())
    }
}
