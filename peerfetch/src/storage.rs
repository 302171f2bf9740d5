use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use tokio::{
    fs::File,
    io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _},
    sync::Mutex,
};

use crate::{Error, PieceIdx, Result, Sha1, TorrentInfo};

#[derive(Debug)]
struct State {
    file: File,
    written: HashMap<PieceIdx, Sha1>,
}

/// Destination file assembled from verified pieces, written by absolute offset so the
/// result does not depend on completion order.
#[derive(Debug)]
pub struct OutputFile {
    path: PathBuf,
    info: TorrentInfo,
    state: Mutex<State>,
}

impl OutputFile {
    /// Creates or truncates `path` and sizes it to the torrent length.
    pub async fn create(path: impl AsRef<Path>, info: TorrentInfo) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        file.set_len(info.length()).await?;
        Ok(Self {
            path,
            info,
            state: Mutex::new(State {
                file,
                written: HashMap::default(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a verified piece at `index * piece_length`. Writing the same bytes again is
    /// a no-op, writing different bytes is an [`Error::IntegrityViolation`].
    pub async fn write_piece(&self, index: PieceIdx, data: &[u8]) -> Result<()> {
        if !self.info.piece_index_valid(index)
            || data.len() != self.info.piece_length_from_index(index) as usize
        {
            return Err(Error::IntegrityViolation(index));
        }

        let digest = Sha1::hash(data);
        let mut state = self.state.lock().await;
        match state.written.get(&index) {
            Some(existing) if *existing == digest => {
                tracing::debug!(piece = %index, "piece already written");
                return Ok(());
            }
            Some(_) => return Err(Error::IntegrityViolation(index)),
            None => {}
        }

        let offset = self.info.piece_offset(index);
        state.file.seek(std::io::SeekFrom::Start(offset)).await?;
        state.file.write_all(data).await?;
        state.file.flush().await?;
        state.written.insert(index, digest);
        Ok(())
    }

    pub async fn written_count(&self) -> usize {
        self.state.lock().await.written.len()
    }

    /// Flushes to disk and checks that every piece was written and the file has the
    /// expected length.
    pub async fn finish(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.file.flush().await?;
        state.file.sync_all().await?;

        let missing = self
            .info
            .piece_indices()
            .filter(|index| !state.written.contains_key(index))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(Error::DownloadIncomplete { failed: missing });
        }

        let length = state.file.metadata().await?.len();
        if length != self.info.length() {
            return Err(Error::Storage(std::io::Error::other(format!(
                "output is {length} bytes, expected {}",
                self.info.length()
            ))));
        }
        Ok(())
    }
}

/// Re-hashes an existing file and returns the pieces that do not match their digest.
/// Pieces past the end of a short file count as mismatches.
pub async fn verify_existing(path: impl AsRef<Path>, info: &TorrentInfo) -> Result<Vec<PieceIdx>> {
    let mut file = File::open(path).await?;
    let mut bad = Vec::new();
    let mut buf = Vec::with_capacity(info.piece_length() as usize);
    for index in info.piece_indices() {
        buf.resize(info.piece_length_from_index(index) as usize, 0);
        file.seek(std::io::SeekFrom::Start(info.piece_offset(index)))
            .await?;
        match file.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                bad.push(index);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
        if Some(Sha1::hash(&buf)) != info.piece_hash(index) {
            bad.push(index);
        }
    }
    Ok(bad)
}
