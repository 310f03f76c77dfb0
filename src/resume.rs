use crate::chunk_map::{self, ChunkMap};
use crate::error::Result;
use crate::hash::FileHash;
use crate::hooks::DownloadStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// What is needed to pick up a download after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendedDownload {
    pub id: u64,
    pub name: String,
    pub hash: FileHash,
    pub size: u64,
    /// Chunk map in its wire form.
    pub chunk_map: Vec<u32>,
    pub timestamp: u64,
}

impl SuspendedDownload {
    pub fn new(id: u64, name: String, hash: FileHash, size: u64, chunk_map: &ChunkMap) -> Self {
        Self {
            id,
            name,
            hash,
            size,
            chunk_map: chunk_map::encode(chunk_map),
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    pub fn chunk_map(&self) -> ChunkMap {
        chunk_map::fit(chunk_map::decode(&self.chunk_map), chunk_map::chunk_count(self.size))
    }

    pub fn completion_percentage(&self) -> f64 {
        let map = self.chunk_map();
        if map.is_empty() {
            return 0.0;
        }
        map.count_ones() as f64 / map.len() as f64 * 100.0
    }
}

/// Keeps one `<id>.resume` JSON file per suspended download.
#[derive(Debug, Clone)]
pub struct JsonResumeStore {
    dir: PathBuf,
}

impl JsonResumeStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}.resume", id))
    }

    pub fn load(&self, id: u64) -> Option<SuspendedDownload> {
        let json = fs::read_to_string(self.path_for(id)).ok()?;
        serde_json::from_str(&json).ok()
    }

    /// Every readable resume file in the directory, by id. Broken files are skipped.
    pub fn load_all(&self) -> Result<Vec<SuspendedDownload>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("resume") {
                continue;
            }
            match read_resume_file(&path) {
                Ok(download) => out.push(download),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read resume file");
                }
            }
        }
        out.sort_by_key(|d| d.id);
        Ok(out)
    }

    fn delete(&self, id: u64) -> Result<()> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_resume_file(path: &Path) -> Result<SuspendedDownload> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

impl DownloadStore for JsonResumeStore {
    fn suspend_download(&self, download: &SuspendedDownload) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(download.id);
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");

        let json = serde_json::to_string_pretty(download)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!(id = download.id, path = %path.display(), "download suspended");
        Ok(())
    }

    fn mark_completed(&self, id: u64, _hash: &FileHash) -> Result<()> {
        self.delete(id)
    }

    fn remove_download(&self, id: u64) -> Result<()> {
        self.delete(id)
    }
}
