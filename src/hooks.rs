//! Interfaces to the systems around the transfer engine: the routing layer
//! carrying messages to remote peers, the local file catalogue, download
//! persistence and file system post-processing.

use crate::error::Result;
use crate::hash::{ChunkChecksum, FileHash, PeerId};
use crate::resume::SuspendedDownload;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Messages the engine emits towards a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Asks for the peer's chunk map. With `leecher_side` set the peer answers
    /// with what it has downloaded so far, otherwise with what it serves.
    ChunkMapRequest { hash: FileHash, leecher_side: bool },
    ChunkMap { hash: FileHash, words: Vec<u32> },
    DataRequest { hash: FileHash, file_size: u64, offset: u64, size: u64 },
    Data { hash: FileHash, file_size: u64, offset: u64, data: Bytes },
    ChecksumRequest { hash: FileHash, chunk: u32 },
    Checksum { hash: FileHash, chunk: u32, checksum: ChunkChecksum },
}

pub trait Transport: Send {
    fn send(&self, peer: &PeerId, message: Outbound);

    /// Start looking for sources of `hash` through tunnels.
    fn activate_tunnels(&self, hash: &FileHash);

    fn deactivate_tunnels(&self, hash: &FileHash);
}

/// Lookup of complete local files that can be served.
pub trait FileIndex: Send {
    fn find_path_by_hash(&self, hash: &FileHash) -> Option<PathBuf>;
}

/// Persistence of download state across restarts.
pub trait DownloadStore: Send {
    fn suspend_download(&self, download: &SuspendedDownload) -> Result<()>;

    fn mark_completed(&self, id: u64, hash: &FileHash) -> Result<()>;

    fn remove_download(&self, id: u64) -> Result<()>;
}

pub trait FileAttributes: Send {
    fn set_visible(&self, path: &Path, visible: bool);

    /// Tags a completed file with where it came from. Untrusted files get
    /// the platform's "downloaded from the internet" marker.
    fn set_trusted(&self, path: &Path, trusted: bool);
}

/// Everything an agent or the manager may call out to.
pub struct Collaborators {
    pub transport: Box<dyn Transport>,
    pub files: Box<dyn FileIndex>,
    pub store: Box<dyn DownloadStore>,
    pub attributes: Box<dyn FileAttributes>,
}

impl Collaborators {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            files: Box::new(StaticFileIndex::default()),
            store: Box::new(NoopStore),
            attributes: Box::new(PlatformFileAttributes),
        }
    }

    pub fn with_files(mut self, files: impl FileIndex + 'static) -> Self {
        self.files = Box::new(files);
        self
    }

    pub fn with_store(mut self, store: impl DownloadStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    pub fn with_attributes(mut self, attributes: impl FileAttributes + 'static) -> Self {
        self.attributes = Box::new(attributes);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticFileIndex {
    files: HashMap<FileHash, PathBuf>,
}

impl StaticFileIndex {
    /// Hashes `path` and makes it available for serving.
    pub fn add_file(&mut self, path: PathBuf) -> Result<FileHash> {
        let hash = FileHash::of_file(&path)?;
        self.files.insert(hash, path);
        Ok(hash)
    }

    pub fn insert(&mut self, hash: FileHash, path: PathBuf) {
        self.files.insert(hash, path);
    }
}

impl FileIndex for StaticFileIndex {
    fn find_path_by_hash(&self, hash: &FileHash) -> Option<PathBuf> {
        self.files.get(hash).cloned()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

impl DownloadStore for NoopStore {
    fn suspend_download(&self, download: &SuspendedDownload) -> Result<()> {
        debug!(id = download.id, "not persisting suspended download");
        Ok(())
    }

    fn mark_completed(&self, _id: u64, _hash: &FileHash) -> Result<()> {
        Ok(())
    }

    fn remove_download(&self, _id: u64) -> Result<()> {
        Ok(())
    }
}

/// On Windows the temporary file gets the hidden attribute and untrusted
/// files a zone marker. Elsewhere the dot prefix of the temporary name is
/// what hides it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformFileAttributes;

impl FileAttributes for PlatformFileAttributes {
    fn set_visible(&self, path: &Path, visible: bool) {
        debug!(path = %path.display(), visible, "file visibility");
        hidden::set(path, !visible);
    }

    fn set_trusted(&self, path: &Path, trusted: bool) {
        zone::mark(path, trusted);
    }
}

#[cfg(windows)]
mod hidden {
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use tracing::warn;
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::{
        GetFileAttributesW, SetFileAttributesW, FILE_ATTRIBUTE_HIDDEN, FILE_FLAGS_AND_ATTRIBUTES,
    };

    const INVALID_ATTRIBUTES: u32 = u32::MAX;

    pub(super) fn set(path: &Path, hidden: bool) {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
        // SAFETY: `wide` is NUL-terminated and outlives both calls.
        let result = unsafe {
            let attributes = GetFileAttributesW(PCWSTR(wide.as_ptr()));
            if attributes == INVALID_ATTRIBUTES {
                warn!("Failed to read attributes of {}", path.display());
                return;
            }
            let attributes = if hidden {
                attributes | FILE_ATTRIBUTE_HIDDEN.0
            } else {
                attributes & !FILE_ATTRIBUTE_HIDDEN.0
            };
            SetFileAttributesW(PCWSTR(wide.as_ptr()), FILE_FLAGS_AND_ATTRIBUTES(attributes))
        };
        if let Err(e) = result {
            warn!("Failed to change visibility of {}: {}", path.display(), e);
        }
    }
}

#[cfg(not(windows))]
mod hidden {
    use std::path::Path;

    pub(super) fn set(_path: &Path, _hidden: bool) {}
}

#[cfg(windows)]
mod zone {
    use std::path::Path;
    use tracing::warn;

    const UNTRUSTED_ZONE: &str = "[ZoneTransfer]\r\nZoneId=3\r\n";

    pub(super) fn mark(path: &Path, trusted: bool) {
        let mut stream = path.as_os_str().to_os_string();
        stream.push(":Zone.Identifier");
        let result = if trusted {
            match std::fs::remove_file(&stream) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        } else {
            std::fs::write(&stream, UNTRUSTED_ZONE)
        };
        if let Err(e) = result {
            warn!("Failed to set zone of {}: {}", path.display(), e);
        }
    }
}

#[cfg(not(windows))]
mod zone {
    use std::path::Path;

    pub(super) fn mark(_path: &Path, _trusted: bool) {}
}
