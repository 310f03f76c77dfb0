//! Access to the file behind a transfer.
//!
//! One provider type serves both sides of a transfer. A consuming provider
//! builds a download up in a sparse file and gates reads on its chunk map; a
//! producing provider serves a complete file and considers every chunk present.

use crate::block::{BlockMap, BLOCK_SIZE, CHUNK_SIZE};
use crate::chunk_map::{self, ChunkMap};
use crate::distributor::ChunkDistributor;
use crate::error::{Result, TransferError};
use crate::hash::ChunkChecksum;
use crate::sparse::allocate_sparse;
use bytes::Bytes;
use fs2::FileExt;
use std::cell::OnceCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

#[derive(Debug)]
pub struct FileProvider {
    path: PathBuf,
    file: Option<File>,
    file_size: u64,
    role: Role,
}

#[derive(Debug)]
enum Role {
    Consuming(Consuming),
    Producing(Producing),
}

#[derive(Debug)]
struct Consuming {
    id: u64,
    chunk_map: ChunkMap,
    distributor: ChunkDistributor,
    // Only chunks with data in flight have an entry.
    blocks: HashMap<u32, BlockMap>,
    completed_bytes: u64,
}

#[derive(Debug, Default)]
struct Producing {
    chunk_map: OnceCell<ChunkMap>,
}

impl FileProvider {
    /// A download target of `file_size` bytes at `path`, optionally resuming
    /// from a previously saved chunk map.
    pub fn for_download(
        id: u64,
        path: PathBuf,
        file_size: u64,
        chunk_map: Option<ChunkMap>,
        distributor: ChunkDistributor,
    ) -> Self {
        let n_chunks = chunk_map::chunk_count(file_size);
        let chunk_map = chunk_map::fit(chunk_map.unwrap_or_default(), n_chunks);
        let completed_bytes = chunk_map
            .iter_ones()
            .map(|index| chunk_map::chunk_len(file_size, index as u32))
            .sum();

        Self {
            path,
            file: None,
            file_size,
            role: Role::Consuming(Consuming {
                id,
                chunk_map,
                distributor,
                blocks: HashMap::new(),
                completed_bytes,
            }),
        }
    }

    /// A complete file served to others. Its size is read when opening.
    pub fn for_upload(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            file_size: 0,
            role: Role::Producing(Producing::default()),
        }
    }

    pub fn open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = match &mut self.role {
            Role::Consuming(_) => {
                let file = allocate_sparse(&self.path, self.file_size)?;
                FileExt::try_lock_exclusive(&file)?;
                file
            }
            Role::Producing(producing) => {
                let file = File::open(&self.path)?;
                FileExt::try_lock_shared(&file)?;
                self.file_size = file.metadata()?.len();
                producing.chunk_map = OnceCell::new();
                file
            }
        };
        self.file = Some(file);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Reads at most one block. A short or empty result means end of file.
    pub fn read(&self, offset: u64, size: usize) -> Result<Bytes> {
        if size as u64 > BLOCK_SIZE {
            return Err(TransferError::ReadTooLarge(size));
        }
        let file = self.file.as_ref().ok_or(TransferError::NotOpen)?;
        if offset >= self.file_size || size == 0 {
            return Ok(Bytes::new());
        }
        if let Role::Consuming(consuming) = &self.role {
            if !consuming.range_available(offset, size as u64, self.file_size) {
                return Err(TransferError::NotAvailable { offset, size });
            }
        }
        let mut buf = vec![0u8; size];
        let n = read_at(file, offset, &mut buf)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Writes received data and updates block and chunk completion.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let Role::Consuming(consuming) = &mut self.role else {
            return Err(TransferError::ReadOnly);
        };
        if offset % BLOCK_SIZE != 0 {
            return Err(TransferError::MisalignedOffset(offset));
        }
        if offset + data.len() as u64 > self.file_size {
            return Err(TransferError::OutOfRange {
                offset,
                size: data.len(),
                file_size: self.file_size,
            });
        }
        let file = self.file.as_ref().ok_or(TransferError::NotOpen)?;

        let mut written = 0usize;
        while written < data.len() {
            let position = offset + written as u64;
            let chunk = (position / CHUNK_SIZE) as u32;
            let chunk_end = (chunk as u64 + 1) * CHUNK_SIZE;
            let len = ((chunk_end - position) as usize).min(data.len() - written);
            let segment = &data[written..written + len];
            written += len;

            if consuming.chunk_map[chunk as usize] {
                trace!(chunk, position, "ignoring data for a completed chunk");
                continue;
            }
            write_all_at(file, position, segment)?;

            let file_size = self.file_size;
            let blocks = consuming
                .blocks
                .entry(chunk)
                .or_insert_with(|| BlockMap::new(chunk_map::chunk_len(file_size, chunk)));
            blocks.mark_written(position, len as u64)?;
            if blocks.is_complete() {
                debug!(chunk, path = %self.path.display(), "chunk complete");
                consuming.blocks.remove(&chunk);
                consuming.chunk_map.set(chunk as usize, true);
                consuming.completed_bytes += chunk_map::chunk_len(file_size, chunk);
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                warn!("Failed to flush file {}: {}", self.path.display(), e);
            }
            if let Err(e) = FileExt::unlock(&file) {
                error!("Failed to unlock file {} properly: {}", self.path.display(), e);
            }
        }
    }

    /// Closes and removes the backing file, discarding a partial download.
    pub fn close_and_delete(&mut self) -> Result<()> {
        if matches!(self.role, Role::Producing(_)) {
            return Err(TransferError::ReadOnly);
        }
        self.close();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn chunk_map(&self) -> ChunkMap {
        match &self.role {
            Role::Consuming(consuming) => consuming.chunk_map.clone(),
            Role::Producing(producing) => producing
                .chunk_map
                .get_or_init(|| chunk_map::full(self.chunk_count()))
                .clone(),
        }
    }

    /// Next chunk to ask from a peer whose chunk map is `remote`.
    pub fn needed_chunk(&mut self, remote: &ChunkMap, now: Instant) -> Option<u32> {
        match &mut self.role {
            Role::Consuming(consuming) => consuming
                .distributor
                .next_chunk(&consuming.chunk_map, remote, now),
            Role::Producing(_) => None,
        }
    }

    /// Makes an in-flight chunk eligible again.
    pub fn release_chunk(&mut self, chunk: u32) {
        if let Role::Consuming(consuming) = &mut self.role {
            consuming.distributor.release(chunk);
        }
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        match &self.role {
            Role::Consuming(consuming) => chunk_map::has(&consuming.chunk_map, index as usize),
            Role::Producing(_) => (index as usize) < self.chunk_count(),
        }
    }

    pub fn is_complete(&self) -> bool {
        match &self.role {
            Role::Consuming(consuming) => consuming.chunk_map.all(),
            Role::Producing(_) => true,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        match &self.role {
            Role::Consuming(consuming) => {
                let in_flight: u64 = consuming
                    .blocks
                    .iter()
                    .map(|(&chunk, blocks)| {
                        (blocks.written_blocks() as u64 * BLOCK_SIZE)
                            .min(chunk_map::chunk_len(self.file_size, chunk))
                    })
                    .sum();
                consuming.completed_bytes + in_flight
            }
            Role::Producing(_) => 0,
        }
    }

    /// Checksum of the chunk starting at `offset`. Only complete files can answer.
    pub fn compute_hash(&self, offset: u64) -> Result<ChunkChecksum> {
        if matches!(self.role, Role::Consuming(_)) {
            return Err(TransferError::ChecksumUnavailable);
        }
        self.hash_range(offset)
    }

    /// Compares a locally completed chunk with the checksum reported by a peer.
    pub fn verify_chunk(&self, index: u32, expected: &ChunkChecksum) -> Result<bool> {
        if !self.has_chunk(index) {
            return Err(TransferError::ChunkIncomplete(index));
        }
        let actual = self.hash_range(index as u64 * CHUNK_SIZE)?;
        Ok(actual == *expected)
    }

    /// Forgets a completed chunk so that it gets downloaded again.
    pub fn invalidate_chunk(&mut self, index: u32) {
        if let Role::Consuming(consuming) = &mut self.role {
            if chunk_map::has(&consuming.chunk_map, index as usize) {
                consuming.chunk_map.set(index as usize, false);
                consuming.completed_bytes -= chunk_map::chunk_len(self.file_size, index);
            }
            consuming.blocks.remove(&index);
            consuming.distributor.release(index);
            consuming.distributor.reset_cursor();
        }
    }

    fn hash_range(&self, offset: u64) -> Result<ChunkChecksum> {
        let file = self.file.as_ref().ok_or(TransferError::NotOpen)?;
        if offset >= self.file_size {
            return Err(TransferError::OutOfRange {
                offset,
                size: 0,
                file_size: self.file_size,
            });
        }
        let len = (self.file_size - offset).min(CHUNK_SIZE) as usize;
        let mut buf = vec![0u8; len];
        let n = read_at(file, offset, &mut buf)?;
        Ok(ChunkChecksum::of(&buf[..n]))
    }

    pub fn chunk_count(&self) -> usize {
        chunk_map::chunk_count(self.file_size)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Download id, for consuming providers.
    pub fn id(&self) -> Option<u64> {
        match &self.role {
            Role::Consuming(consuming) => Some(consuming.id),
            Role::Producing(_) => None,
        }
    }

    pub fn is_consuming(&self) -> bool {
        matches!(self.role, Role::Consuming(_))
    }
}

impl Consuming {
    fn range_available(&self, offset: u64, size: u64, file_size: u64) -> bool {
        let end = (offset + size).min(file_size);
        let first = (offset / CHUNK_SIZE) as usize;
        let last = ((end - 1) / CHUNK_SIZE) as usize;
        (first..=last).all(|chunk| chunk_map::has(&self.chunk_map, chunk))
    }
}

impl Drop for FileProvider {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_at(mut file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn write_all_at(mut file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}
