//! Per-peer transfer state held by an agent.

use crate::block::BLOCK_SIZE;
use crate::chunk_map::ChunkMap;
use crate::hash::{FileHash, PeerId};
use crate::hooks::{Outbound, Transport};
use crate::provider::FileProvider;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Pushes one requested byte range to a remote sink, a block at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceSender {
    offset: u64,
    remaining: u64,
    waiting: bool,
}

impl SliceSender {
    pub fn new(offset: u64, size: u64) -> Self {
        Self {
            offset,
            remaining: size,
            waiting: false,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// True while the next block is not downloaded yet.
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Sends the next block of the range. Returns whether more remains.
    ///
    /// Data not downloaded yet keeps the job where it is; any other failed
    /// or empty read ends it.
    pub fn send(&mut self, provider: &FileProvider, transport: &dyn Transport, peer: &PeerId, hash: &FileHash) -> bool {
        let size = self.remaining.min(BLOCK_SIZE) as usize;
        let data = match provider.read(self.offset, size) {
            Ok(data) => data,
            Err(e) if e.is_retryable() => {
                trace!(%peer, offset = self.offset, "waiting for data: {}", e);
                self.waiting = true;
                return true;
            }
            Err(e) => {
                debug!(%peer, offset = self.offset, "dropping send job: {}", e);
                self.remaining = 0;
                return false;
            }
        };
        if data.is_empty() {
            trace!(%peer, offset = self.offset, "nothing left to read");
            self.remaining = 0;
            return false;
        }

        self.waiting = false;
        let len = data.len() as u64;
        transport.send(
            peer,
            Outbound::Data {
                hash: *hash,
                file_size: provider.file_size(),
                offset: self.offset,
                data,
            },
        );
        self.offset += len;
        self.remaining = self.remaining.saturating_sub(len);
        self.remaining > 0
    }
}

/// Bounded exponential back-off: `min(base * 2^failures, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: 0 }
    }

    pub fn delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.failures.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Records a failure and returns the delay to wait before the next attempt.
    pub fn fail(&mut self) -> Duration {
        let delay = self.delay();
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// State of one remote source we pull chunks from.
#[derive(Debug, Clone)]
pub struct ChunkReceiver {
    chunk_map: Option<ChunkMap>,
    receiving: bool,
    chunk: u32,
    requested_at: Option<Instant>,
    map_requested_at: Option<Instant>,
    backoff: Backoff,
    next_service: Instant,
}

impl ChunkReceiver {
    pub fn new(backoff: Backoff, now: Instant) -> Self {
        Self {
            chunk_map: None,
            receiving: false,
            chunk: 0,
            requested_at: None,
            map_requested_at: None,
            backoff,
            next_service: now,
        }
    }

    pub fn chunk_map(&self) -> Option<&ChunkMap> {
        self.chunk_map.as_ref()
    }

    pub fn set_chunk_map(&mut self, map: ChunkMap, now: Instant) {
        self.chunk_map = Some(map);
        self.map_requested_at = None;
        self.backoff.reset();
        self.next_service = now;
    }

    pub fn map_requested(&mut self, now: Instant) {
        self.map_requested_at = Some(now);
    }

    pub fn map_requested_at(&self) -> Option<Instant> {
        self.map_requested_at
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    /// Chunk of the outstanding request, if any.
    pub fn chunk(&self) -> Option<u32> {
        self.receiving.then_some(self.chunk)
    }

    pub fn requested_at(&self) -> Option<Instant> {
        self.requested_at.filter(|_| self.receiving)
    }

    pub fn start_receiving(&mut self, chunk: u32, now: Instant) {
        self.chunk = chunk;
        self.receiving = true;
        self.requested_at = Some(now);
    }

    /// The outstanding chunk arrived.
    pub fn finish_receiving(&mut self, now: Instant) {
        self.receiving = false;
        self.requested_at = None;
        self.backoff.reset();
        self.next_service = now;
    }

    /// The outstanding request, if any, is abandoned and the peer is left
    /// alone for a growing delay.
    pub fn fail(&mut self, now: Instant) {
        self.receiving = false;
        self.requested_at = None;
        self.next_service = now + self.backoff.fail();
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_service <= now
    }

    pub fn next_service(&self) -> Instant {
        self.next_service
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}
