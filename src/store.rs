//! The on-disk file store: maps the torrent's virtual linear byte space
//! onto one or more backing files and provides the piece-level read/write
//! contract the piece manager commits through.
use crate::torrent::TorrentDescriptor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece {0} out of range")]
    PieceOutOfRange(usize),

    #[error("piece {0} has not been written yet")]
    PieceNotWritten(usize),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The collaborator contract the piece manager commits verified pieces
/// through: `initialize` lays out backing files, `write_piece` is
/// all-or-nothing per call, and a piece not yet committed may read back
/// arbitrary (zero-initialized) bytes.
pub trait FileStore: Send + Sync {
    async fn write_piece(&self, index: usize, bytes: Vec<u8>) -> StoreResult<()>;
    async fn read_piece(&self, index: usize) -> StoreResult<Vec<u8>>;
}

struct FileSpan {
    handle: Mutex<File>,
    /// Byte offset range `[start, end)` this file occupies in the virtual
    /// linear byte space.
    start: u64,
    end: u64,
}

/// A `FileStore` backed by real files on disk, laid out according to a
/// torrent's file map.
pub struct FileSystemStore {
    piece_length: u64,
    total_length: u64,
    files: Vec<FileSpan>,
}

impl FileSystemStore {
    /// Creates (or opens) every backing file under `root`, pre-allocated to
    /// its final length, ready for out-of-order piece writes.
    #[instrument(skip(descriptor), fields(name = %descriptor.name))]
    pub async fn initialize(root: &Path, descriptor: &TorrentDescriptor) -> StoreResult<Self> {
        fs::create_dir_all(root).await?;
        let mut files = Vec::with_capacity(descriptor.files.len());
        let mut position = 0u64;
        for entry in &descriptor.files {
            let path = root.join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await?;
            let length = entry.length.max(0) as u64;
            file.set_len(length).await?;
            debug!(path = %path.display(), length, "backing file ready");
            files.push(FileSpan { handle: Mutex::new(file), start: position, end: position + length });
            position += length;
        }
        Ok(Self {
            piece_length: descriptor.piece_length.max(0) as u64,
            total_length: descriptor.total_length().max(0) as u64,
            files,
        })
    }

    fn piece_range(&self, index: usize) -> (u64, u64) {
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_length);
        (start, end)
    }
}

impl FileStore for FileSystemStore {
    #[instrument(skip(self, bytes), level = "debug")]
    async fn write_piece(&self, index: usize, bytes: Vec<u8>) -> StoreResult<()> {
        let (piece_start, piece_end) = self.piece_range(index);
        if piece_start >= piece_end && !self.files.is_empty() {
            return Err(StoreError::PieceOutOfRange(index));
        }
        let mut cursor = 0usize;
        for span in &self.files {
            if span.end <= piece_start || span.start >= piece_end {
                continue;
            }
            let overlap_start = piece_start.max(span.start);
            let overlap_end = piece_end.min(span.end);
            let len = (overlap_end - overlap_start) as usize;
            let slice = &bytes[cursor..cursor + len];
            let mut handle = span.handle.lock().await;
            handle.seek(std::io::SeekFrom::Start(overlap_start - span.start)).await?;
            handle.write_all(slice).await?;
            handle.flush().await?;
            cursor += len;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_piece(&self, index: usize) -> StoreResult<Vec<u8>> {
        let (piece_start, piece_end) = self.piece_range(index);
        let mut out = vec![0u8; (piece_end - piece_start) as usize];
        for span in &self.files {
            if span.end <= piece_start || span.start >= piece_end {
                continue;
            }
            let overlap_start = piece_start.max(span.start);
            let overlap_end = piece_end.min(span.end);
            let out_offset = (overlap_start - piece_start) as usize;
            let len = (overlap_end - overlap_start) as usize;
            let mut handle = span.handle.lock().await;
            handle.seek(std::io::SeekFrom::Start(overlap_start - span.start)).await?;
            handle.read_exact(&mut out[out_offset..out_offset + len]).await?;
        }
        Ok(out)
    }
}

/// Resolves the store's root directory for a given torrent name under a
/// configured downloads directory.
pub fn root_for(downloads_dir: &Path, torrent_name: &str) -> PathBuf {
    downloads_dir.join(torrent_name)
}

/// Thread-safe handle shared between the piece manager and upload path.
pub type SharedStore = Arc<FileSystemStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::descriptor::FileEntry;

    fn descriptor(files: Vec<FileEntry>, piece_length: i64) -> TorrentDescriptor {
        TorrentDescriptor {
            announce: "http://tracker.example/announce".to_string(),
            announce_list: vec![],
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            name: "demo".to_string(),
            piece_length,
            info_fingerprint: [0u8; 20],
            piece_fingerprints: vec![[0u8; 20]; 2],
            files,
        }
    }

    #[tokio::test]
    async fn writes_and_reads_back_a_single_file_piece() {
        let dir = tempdir();
        let descriptor = descriptor(
            vec![FileEntry { path: "demo.bin".into(), length: 32768 }],
            16384,
        );
        let store = FileSystemStore::initialize(&dir, &descriptor).await.unwrap();
        let data = vec![42u8; 16384];
        store.write_piece(0, data.clone()).await.unwrap();
        assert_eq!(store.read_piece(0).await.unwrap(), data);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn piece_spans_two_files() {
        let dir = tempdir();
        let descriptor = descriptor(
            vec![
                FileEntry { path: "a.bin".into(), length: 10000 },
                FileEntry { path: "b.bin".into(), length: 10000 },
            ],
            16384,
        );
        let store = FileSystemStore::initialize(&dir, &descriptor).await.unwrap();
        let data = vec![9u8; 16384];
        store.write_piece(0, data.clone()).await.unwrap();
        assert_eq!(store.read_piece(0).await.unwrap(), data);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    fn tempdir() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("rs-torrent-client-test-{}", std::process::id()));
        path
    }
}
