use crate::chunk_map::{self, ChunkMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const MAX_RANDOM_TRY: usize = 10;

/// Time after which a handed out chunk is considered lost.
pub const GIVEN_CHUNK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileTransferStrategy {
    Linear,
    #[default]
    Random,
}

/// Hands out the chunks still missing from a download, never the same
/// in-flight chunk twice.
///
/// The local chunk map is owned by the file provider and passed in on every
/// call, so chunks completed in the meantime are seen by the next selection.
#[derive(Debug)]
pub struct ChunkDistributor {
    total_chunks: usize,
    strategy: FileTransferStrategy,
    given: HashMap<usize, Instant>,
    given_timeout: Duration,
    min_chunk: usize,
    max_chunk: Option<usize>,
    rng: StdRng,
}

impl ChunkDistributor {
    pub fn new(total_chunks: usize, strategy: FileTransferStrategy) -> Self {
        Self::with_rng(total_chunks, strategy, StdRng::from_entropy())
    }

    pub fn with_rng(total_chunks: usize, strategy: FileTransferStrategy, rng: StdRng) -> Self {
        Self {
            total_chunks,
            strategy,
            given: HashMap::new(),
            given_timeout: GIVEN_CHUNK_TIMEOUT,
            min_chunk: 0,
            max_chunk: None,
            rng,
        }
    }

    pub fn set_given_timeout(&mut self, timeout: Duration) {
        self.given_timeout = timeout;
    }

    pub fn strategy(&self) -> FileTransferStrategy {
        self.strategy
    }

    pub fn given_count(&self) -> usize {
        self.given.len()
    }

    pub fn is_given(&self, chunk: u32) -> bool {
        self.given.contains_key(&(chunk as usize))
    }

    /// Returns a chunk to the pool, e.g. when the peer it was asked from went away.
    pub fn release(&mut self, chunk: u32) {
        self.given.remove(&(chunk as usize));
        if self.strategy == FileTransferStrategy::Linear {
            self.min_chunk = self.min_chunk.min(chunk as usize);
        }
    }

    /// Restarts the scan from the first chunk, needed when a completed chunk
    /// was invalidated behind the cursor.
    pub fn reset_cursor(&mut self) {
        self.min_chunk = 0;
    }

    /// Picks the next chunk to fetch among those `available` on the remote side.
    pub fn next_chunk(&mut self, local: &ChunkMap, available: &ChunkMap, now: Instant) -> Option<u32> {
        if self.total_chunks == 0 {
            return None;
        }
        self.refresh(local, now);

        let max_chunk = self.max_chunk?;
        let complete = local[..self.total_chunks].count_ones();
        if self.min_chunk > max_chunk || complete + self.given.len() >= self.total_chunks {
            return None;
        }

        let chunk = match self.strategy {
            FileTransferStrategy::Linear => self.linear_chunk(local, available, max_chunk),
            FileTransferStrategy::Random => self.random_chunk(local, available, max_chunk),
        }?;
        self.given.insert(chunk, now);
        Some(chunk as u32)
    }

    fn refresh(&mut self, local: &ChunkMap, now: Instant) {
        let total = self.total_chunks;
        let start = self.min_chunk.min(total);
        self.min_chunk = local[start..total]
            .first_zero()
            .map_or(total, |i| start + i);
        self.max_chunk = local[..total].last_zero();

        let before = self.given.len();
        let timeout = self.given_timeout;
        self.given
            .retain(|&chunk, given_at| !local[chunk] && now.saturating_duration_since(*given_at) < timeout);

        // A chunk finished out of order, or a lost one came back.
        if self.strategy == FileTransferStrategy::Linear && before != self.given.len() {
            self.min_chunk = self.find_min_chunk(local);
        }
    }

    fn find_min_chunk(&self, local: &ChunkMap) -> usize {
        let total = self.total_chunks;
        let mut chunk = local[..total].first_zero().unwrap_or(total);
        while chunk < total && !self.is_free(local, chunk) {
            chunk += 1;
        }
        chunk
    }

    fn is_free(&self, local: &ChunkMap, chunk: usize) -> bool {
        !local[chunk] && !self.given.contains_key(&chunk)
    }

    fn linear_chunk(&mut self, local: &ChunkMap, available: &ChunkMap, max_chunk: usize) -> Option<usize> {
        while self.min_chunk <= max_chunk && !self.is_free(local, self.min_chunk) {
            self.min_chunk += 1;
        }
        (self.min_chunk..=max_chunk)
            .find(|&chunk| self.is_free(local, chunk) && chunk_map::has(available, chunk))
    }

    fn random_chunk(&mut self, local: &ChunkMap, available: &ChunkMap, max_chunk: usize) -> Option<usize> {
        let min_chunk = self.min_chunk;
        for _ in 0..MAX_RANDOM_TRY {
            let chunk = self.rng.gen_range(min_chunk..=max_chunk);
            if self.is_free(local, chunk) && chunk_map::has(available, chunk) {
                return Some(chunk);
            }
        }

        let mut any_free = false;
        for chunk in min_chunk..=max_chunk {
            if self.is_free(local, chunk) {
                if chunk_map::has(available, chunk) {
                    return Some(chunk);
                }
                any_free = true;
            }
        }
        if !any_free {
            unreachable!(
                "no free chunk in [{min_chunk}, {max_chunk}] while {} of {} are accounted for",
                local[..self.total_chunks].count_ones() + self.given.len(),
                self.total_chunks
            );
        }
        None
    }
}
