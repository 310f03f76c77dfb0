use crate::hash::FileHash;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

/// Snapshot of one transfer for progress reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileProgress {
    /// Download id, or 0 for uploads.
    pub id: u64,
    pub name: String,
    /// Bytes written for downloads, bytes sent for uploads.
    pub current: u64,
    pub total: u64,
    pub hash: FileHash,
    pub completed: bool,
}

impl FileProgress {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return if self.completed { 100.0 } else { 0.0 };
        }
        self.current as f64 / self.total as f64 * 100.0
    }
}

/// Progress lists written by the control loop and read from anywhere.
#[derive(Debug, Clone, Default)]
pub struct ProgressBoard {
    downloads: Arc<Mutex<Vec<FileProgress>>>,
    uploads: Arc<Mutex<Vec<FileProgress>>>,
}

impl ProgressBoard {
    pub fn publish_downloads(&self, progress: Vec<FileProgress>) {
        *lock(&self.downloads) = progress;
    }

    pub fn publish_uploads(&self, progress: Vec<FileProgress>) {
        *lock(&self.uploads) = progress;
    }

    pub fn downloads(&self) -> Vec<FileProgress> {
        lock(&self.downloads).clone()
    }

    pub fn uploads(&self) -> Vec<FileProgress> {
        lock(&self.uploads).clone()
    }
}

// A panicking reader cannot leave a Vec half-written.
fn lock(list: &Mutex<Vec<FileProgress>>) -> MutexGuard<'_, Vec<FileProgress>> {
    list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
