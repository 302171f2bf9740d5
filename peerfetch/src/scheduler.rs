//! Worker pool downloading every piece of a torrent into an [`OutputFile`].
//!
//! Workers share a [`PieceTable`] behind a single mutex. A worker claims a pending piece,
//! opens a fresh connection for it and reports the outcome back to the table. Failed
//! pieces return to pending until their attempt budget runs out. Idle workers park on a
//! [`Notify`] that fires on every slot change.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::Notify, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    piece::download_piece, Error, OutputFile, PeerConfig, PeerConnection, PeerId, PieceIdx,
    Result, TorrentInfo,
};

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Number of concurrent workers, each owning at most one connection.
    pub workers: usize,
    /// Attempts per piece before it is given up on.
    pub max_attempts: u32,
    /// Block requests kept in flight per connection.
    pub pipeline_depth: usize,
    /// Overall deadline, the download is cancelled when it elapses.
    pub timeout: Option<Duration>,
    pub peer: PeerConfig,
    pub peer_id: PeerId,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_attempts: 5,
            pipeline_depth: 1,
            timeout: None,
            peer: PeerConfig::default(),
            peer_id: PeerId::generate(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    pub pieces: u32,
    /// Piece attempts started, successful or not.
    pub attempts: u32,
    /// Piece attempts that failed and were retried or given up on.
    pub failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    InProgress,
    Done,
    PermanentlyFailed,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub index: PieceIdx,
    /// Zero based attempt number for this piece.
    pub attempt: u32,
}

#[derive(Debug)]
pub struct PieceTable {
    slots: Vec<Slot>,
    max_attempts: u32,
    attempts: u32,
    failures: u32,
}

impl PieceTable {
    pub fn new(pieces: u32, max_attempts: u32) -> Self {
        Self {
            slots: vec![
                Slot {
                    state: SlotState::Pending,
                    failures: 0,
                };
                pieces as usize
            ],
            max_attempts: max_attempts.max(1),
            attempts: 0,
            failures: 0,
        }
    }

    /// Moves the lowest pending piece to in progress.
    pub fn claim(&mut self) -> Option<Claim> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.state == SlotState::Pending)?;
        slot.state = SlotState::InProgress;
        self.attempts += 1;
        Some(Claim {
            index: PieceIdx::new(index as u32),
            attempt: slot.failures,
        })
    }

    pub fn complete(&mut self, index: PieceIdx) {
        if let Some(slot) = self.slot_mut(index) {
            slot.state = SlotState::Done;
        }
    }

    /// Records a failed attempt, returning the slot to pending unless the budget is spent.
    pub fn fail(&mut self, index: PieceIdx) -> SlotState {
        let max_attempts = self.max_attempts;
        let Some(slot) = self.slot_mut(index) else {
            return SlotState::PermanentlyFailed;
        };
        slot.failures += 1;
        slot.state = if slot.failures >= max_attempts {
            SlotState::PermanentlyFailed
        } else {
            SlotState::Pending
        };
        let state = slot.state;
        self.failures += 1;
        state
    }

    /// Returns an abandoned piece to pending without charging an attempt.
    pub fn release(&mut self, index: PieceIdx) {
        if let Some(slot) = self.slot_mut(index) {
            if slot.state == SlotState::InProgress {
                slot.state = SlotState::Pending;
            }
        }
    }

    pub fn state(&self, index: PieceIdx) -> Option<SlotState> {
        self.slots
            .get(u32::from(index) as usize)
            .map(|slot| slot.state)
    }

    /// No piece is pending or in progress.
    pub fn is_finished(&self) -> bool {
        self.slots.iter().all(|slot| {
            matches!(
                slot.state,
                SlotState::Done | SlotState::PermanentlyFailed
            )
        })
    }

    pub fn failed(&self) -> Vec<PieceIdx> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == SlotState::PermanentlyFailed)
            .map(|(index, _)| PieceIdx::new(index as u32))
            .collect()
    }

    fn slot_mut(&mut self, index: PieceIdx) -> Option<&mut Slot> {
        self.slots.get_mut(u32::from(index) as usize)
    }
}

/// Peer used for the given attempt at a piece. Consecutive attempts rotate through the
/// list so a retry goes elsewhere when possible.
fn choose_peer(peers: &[SocketAddr], index: PieceIdx, attempt: u32) -> SocketAddr {
    let slot = (u32::from(index) as usize + attempt as usize) % peers.len();
    peers[slot]
}

struct Shared {
    info: TorrentInfo,
    peers: Vec<SocketAddr>,
    output: OutputFile,
    config: DownloadConfig,
    table: Mutex<PieceTable>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PieceTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Downloader {
    shared: Arc<Shared>,
}

impl Downloader {
    pub fn new(
        info: TorrentInfo,
        peers: Vec<SocketAddr>,
        output: OutputFile,
        config: DownloadConfig,
    ) -> Self {
        let table = PieceTable::new(info.pieces_count(), config.max_attempts);
        Self {
            shared: Arc::new(Shared {
                info,
                peers,
                output,
                config,
                table: Mutex::new(table),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Token that aborts [`Downloader::run`] when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub async fn run(self) -> Result<DownloadReport> {
        let shared = self.shared;
        if shared.peers.is_empty() {
            return Err(Error::NoPeersFound);
        }

        let pieces = shared.info.pieces_count();
        let workers = shared.config.workers.clamp(1, pieces.max(1) as usize);
        tracing::info!(
            name = shared.info.name(),
            pieces,
            peers = shared.peers.len(),
            workers,
            "starting download"
        );

        let timer = shared.config.timeout.map(|timeout| {
            let cancel = shared.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::warn!("download timed out after {timeout:?}");
                cancel.cancel();
            })
        });

        let mut tasks = JoinSet::new();
        for worker_id in 0..workers {
            let shared = shared.clone();
            let span = tracing::debug_span!("worker", id = worker_id);
            tasks.spawn(worker(shared, worker_id).instrument(span));
        }

        let mut fatal = None;
        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(Error::Cancelled)) => cancelled = true,
                Ok(Err(err)) => {
                    fatal.get_or_insert(err);
                }
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => cancelled = true,
            }
        }
        if let Some(timer) = timer {
            timer.abort();
        }

        if let Some(err) = fatal {
            return Err(err);
        }
        if cancelled {
            return Err(Error::Cancelled);
        }

        let (failed, report) = {
            let table = shared.table();
            let report = DownloadReport {
                pieces,
                attempts: table.attempts,
                failures: table.failures,
            };
            (table.failed(), report)
        };
        if !failed.is_empty() {
            tracing::error!(failed = failed.len(), "download incomplete");
            return Err(Error::DownloadIncomplete { failed });
        }

        shared.output.finish().await?;
        tracing::info!(
            path = %shared.output.path().display(),
            attempts = report.attempts,
            failures = report.failures,
            "download complete"
        );
        Ok(report)
    }
}

async fn worker(shared: Arc<Shared>, worker_id: usize) -> Result<()> {
    loop {
        if shared.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // registered before inspecting the table so no wakeup is missed
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let claim = {
            let mut table = shared.table();
            if table.is_finished() {
                return Ok(());
            }
            table.claim()
        };

        let Some(Claim { index, attempt }) = claim else {
            tokio::select! {
                _ = notified.as_mut() => {}
                _ = shared.cancel.cancelled() => return Err(Error::Cancelled),
            }
            continue;
        };

        let addr = choose_peer(&shared.peers, index, attempt);
        let span = tracing::info_span!(
            "attempt",
            piece = %index,
            peer = %addr,
            attempt = attempt + 1
        );
        tracing::debug!(parent: &span, worker_id, "claimed piece");

        let outcome = tokio::select! {
            result = attempt_piece(&shared, index, addr).instrument(span.clone()) => Some(result),
            _ = shared.cancel.cancelled() => None,
        };

        match outcome {
            None => {
                tracing::debug!(parent: &span, "attempt abandoned");
                shared.table().release(index);
                shared.notify.notify_waiters();
                return Err(Error::Cancelled);
            }
            Some(Ok(())) => {
                shared.table().complete(index);
                tracing::info!(parent: &span, "piece complete");
            }
            Some(Err(err)) if err.is_retryable() => {
                let state = shared.table().fail(index);
                if state == SlotState::PermanentlyFailed {
                    tracing::error!(parent: &span, "giving up on piece: {err}");
                } else {
                    tracing::warn!(parent: &span, "attempt failed: {err}");
                }
            }
            Some(Err(err)) => {
                tracing::error!(parent: &span, "aborting download: {err}");
                shared.table().release(index);
                shared.cancel.cancel();
                shared.notify.notify_waiters();
                return Err(err);
            }
        }
        shared.notify.notify_waiters();
    }
}

async fn attempt_piece(shared: &Shared, index: PieceIdx, addr: SocketAddr) -> Result<()> {
    let data = fetch_piece(&shared.info, addr, index, &shared.config).await?;
    shared.output.write_piece(index, &data).await
}

async fn fetch_piece(
    info: &TorrentInfo,
    addr: SocketAddr,
    index: PieceIdx,
    config: &DownloadConfig,
) -> Result<Bytes> {
    let mut conn =
        PeerConnection::connect(addr, info.info_hash(), config.peer_id, &config.peer).await?;
    let result = download_piece(&mut conn, info, index, config.pipeline_depth).await;
    conn.close().await;
    result
}

/// Downloads a single piece, retrying through `peers` like the worker pool does.
pub async fn download_single_piece(
    info: &TorrentInfo,
    peers: &[SocketAddr],
    index: PieceIdx,
    config: &DownloadConfig,
) -> Result<Bytes> {
    if !info.piece_index_valid(index) {
        return Err(Error::InvalidPiece(index));
    }
    if peers.is_empty() {
        return Err(Error::NoPeersFound);
    }

    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let addr = choose_peer(peers, index, attempt);
        let span = tracing::info_span!(
            "attempt",
            piece = %index,
            peer = %addr,
            attempt = attempt + 1
        );
        match fetch_piece(info, addr, index, config).instrument(span.clone()).await {
            Ok(data) => return Ok(data),
            Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                tracing::warn!(parent: &span, "attempt failed: {err}");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        storage::verify_existing,
        testing::{closed_addr, Behavior, Seeder, TestTorrent},
    };

    fn addr(n: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], n))
    }

    #[test]
    fn claims_are_exclusive() {
        let mut table = PieceTable::new(3, 5);
        let claims = std::iter::from_fn(|| table.claim()).collect::<Vec<_>>();
        assert_eq!(
            claims.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![PieceIdx::new(0), PieceIdx::new(1), PieceIdx::new(2)]
        );
        assert!(table.claim().is_none());
        assert!(!table.is_finished());

        table.release(PieceIdx::new(1));
        assert_eq!(table.state(PieceIdx::new(1)), Some(SlotState::Pending));
        assert_eq!(
            table.claim(),
            Some(Claim {
                index: PieceIdx::new(1),
                attempt: 0
            })
        );
    }

    #[test]
    fn released_claims_keep_their_budget() {
        let mut table = PieceTable::new(1, 3);
        let index = PieceIdx::new(0);
        table.claim().unwrap();
        table.fail(index);

        assert_eq!(table.claim(), Some(Claim { index, attempt: 1 }));
        table.release(index);
        assert_eq!(table.state(index), Some(SlotState::Pending));
        // an abandoned attempt is not charged
        assert_eq!(table.claim(), Some(Claim { index, attempt: 1 }));
        assert_eq!(table.failures, 1);

        // only in-progress slots go back to pending
        table.complete(index);
        table.release(index);
        assert_eq!(table.state(index), Some(SlotState::Done));
    }

    #[test]
    fn retry_budget() {
        let mut table = PieceTable::new(2, 3);
        let index = PieceIdx::new(0);
        for attempt in 0..2 {
            assert_eq!(table.claim(), Some(Claim { index, attempt }));
            assert_eq!(table.fail(index), SlotState::Pending);
        }
        assert_eq!(table.claim(), Some(Claim { index, attempt: 2 }));
        assert_eq!(table.fail(index), SlotState::PermanentlyFailed);

        let other = table.claim().unwrap();
        assert_eq!(other.index, PieceIdx::new(1));
        table.complete(other.index);
        assert!(table.claim().is_none());
        assert!(table.is_finished());
        assert_eq!(table.failed(), vec![index]);
        assert_eq!((table.attempts, table.failures), (4, 3));
    }

    #[test]
    fn retries_rotate_peers() {
        let peers = [addr(1), addr(2), addr(3)];
        assert_eq!(choose_peer(&peers, PieceIdx::new(0), 0), addr(1));
        assert_eq!(choose_peer(&peers, PieceIdx::new(0), 1), addr(2));
        assert_eq!(choose_peer(&peers, PieceIdx::new(4), 0), addr(2));
        assert_eq!(choose_peer(&peers, PieceIdx::new(4), 2), addr(1));
        assert_eq!(choose_peer(&peers[..1], PieceIdx::new(4), 2), addr(1));
    }

    struct Fixture {
        torrent: Arc<TestTorrent>,
        _dir: tempfile::TempDir,
        path: std::path::PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("download.bin");
            Self {
                torrent: Arc::new(TestTorrent::new(300_000, 65_536)),
                _dir: dir,
                path,
            }
        }

        async fn downloader(&self, peers: Vec<SocketAddr>, config: DownloadConfig) -> Downloader {
            let output = OutputFile::create(&self.path, self.torrent.info.clone())
                .await
                .unwrap();
            Downloader::new(self.torrent.info.clone(), peers, output, config)
        }

        async fn seeder(&self, script: &[Behavior]) -> Seeder {
            Seeder::spawn(self.torrent.clone(), script).await
        }

        async fn assert_output_exact(&self) {
            let written = tokio::fs::read(&self.path).await.unwrap();
            assert_eq!(written, self.torrent.data.as_ref());
            let bad = verify_existing(&self.path, &self.torrent.info).await.unwrap();
            assert!(bad.is_empty());
        }
    }

    #[tokio::test]
    async fn downloads_with_worker_pool() {
        let fixture = Fixture::new();
        let seeder = fixture.seeder(&[Behavior::Honest]).await;
        let config = DownloadConfig {
            pipeline_depth: 3,
            ..Default::default()
        };
        let report = fixture
            .downloader(vec![seeder.addr()], config)
            .await
            .run()
            .await
            .unwrap();
        assert_eq!(
            report,
            DownloadReport {
                pieces: 5,
                attempts: 5,
                failures: 0
            }
        );
        fixture.assert_output_exact().await;
    }

    #[tokio::test]
    async fn dropped_connection_is_retried() {
        let fixture = Fixture::new();
        let seeder = fixture
            .seeder(&[Behavior::DropMidPiece, Behavior::Honest])
            .await;
        let config = DownloadConfig {
            workers: 1,
            ..Default::default()
        };
        let report = fixture
            .downloader(vec![seeder.addr()], config)
            .await
            .run()
            .await
            .unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(report.attempts, 6);
        assert_eq!(seeder.accepted(), 6);
        fixture.assert_output_exact().await;
    }

    #[tokio::test]
    async fn misbehaving_peers_are_routed_around() {
        let fixture = Fixture::new();
        let wrong_offset = fixture.seeder(&[Behavior::WrongOffset]).await;
        let corrupt = fixture.seeder(&[Behavior::CorruptBlock]).await;
        let wrong_hash = fixture.seeder(&[Behavior::WrongInfoHash]).await;
        let chatty = fixture.seeder(&[Behavior::Chatty]).await;
        let honest = fixture.seeder(&[Behavior::Honest]).await;
        let peers = vec![
            wrong_offset.addr(),
            corrupt.addr(),
            closed_addr(),
            wrong_hash.addr(),
            chatty.addr(),
            honest.addr(),
        ];
        let config = DownloadConfig {
            max_attempts: peers.len() as u32,
            ..Default::default()
        };
        let report = fixture.downloader(peers, config).await.run().await.unwrap();
        assert!(report.failures > 0);
        fixture.assert_output_exact().await;
    }

    #[tokio::test]
    async fn exhausted_budget_reports_failed_pieces() {
        let fixture = Fixture::new();
        let corrupt = fixture.seeder(&[Behavior::CorruptBlock]).await;
        let config = DownloadConfig {
            max_attempts: 2,
            ..Default::default()
        };
        let result = fixture
            .downloader(vec![corrupt.addr()], config)
            .await
            .run()
            .await;
        match result {
            Err(Error::DownloadIncomplete { failed }) => {
                assert_eq!(failed, fixture.torrent.info.piece_indices().collect::<Vec<_>>());
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(corrupt.accepted(), 10);
    }

    #[tokio::test]
    async fn overall_timeout_cancels() {
        let fixture = Fixture::new();
        let stalled = fixture.seeder(&[Behavior::Stall]).await;
        let config = DownloadConfig {
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let downloader = fixture.downloader(vec![stalled.addr()], config).await;
        let shared = downloader.shared.clone();
        let result = downloader.run().await;
        assert!(matches!(result, Err(Error::Cancelled)));

        // abandoned attempts hang up and their pieces go back to pending uncharged
        assert!(stalled.accepted() > 0);
        assert!(stalled.wait_finished(stalled.accepted()).await);
        let table = shared.table();
        assert!(fixture
            .torrent
            .info
            .piece_indices()
            .all(|index| table.state(index) == Some(SlotState::Pending)));
        assert_eq!(table.failures, 0);
    }

    #[tokio::test]
    async fn explicit_cancellation() {
        let fixture = Fixture::new();
        let stalled = fixture.seeder(&[Behavior::Stall]).await;
        let downloader = fixture
            .downloader(vec![stalled.addr()], DownloadConfig::default())
            .await;
        let token = downloader.cancellation_token();
        let run = tokio::spawn(downloader.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        assert!(matches!(run.await.unwrap(), Err(Error::Cancelled)));
        assert!(stalled.wait_finished(stalled.accepted()).await);
    }

    #[tokio::test]
    async fn requires_peers() {
        let fixture = Fixture::new();
        let result = fixture
            .downloader(Vec::new(), DownloadConfig::default())
            .await
            .run()
            .await;
        assert!(matches!(result, Err(Error::NoPeersFound)));
    }

    #[tokio::test]
    async fn single_piece_retries_next_peer() {
        let torrent = TestTorrent::new(300_000, 65_536);
        let torrent = Arc::new(torrent);
        let honest = Seeder::spawn(torrent.clone(), &[Behavior::Honest]).await;
        let peers = [closed_addr(), honest.addr()];
        let index = PieceIdx::new(2);
        // piece 2 starts at peers[0] and moves on to peers[1]
        let data = download_single_piece(&torrent.info, &peers, index, &DownloadConfig::default())
            .await
            .unwrap();
        assert_eq!(data.as_ref(), torrent.piece(index));

        assert!(matches!(
            download_single_piece(
                &torrent.info,
                &peers,
                PieceIdx::new(5),
                &DownloadConfig::default()
            )
            .await,
            Err(Error::InvalidPiece(_))
        ));
    }
}
