//! One file transfer: the provider behind it, the peers we pull from and
//! the peers we push to.

use crate::block::CHUNK_SIZE;
use crate::chunk_map;
use crate::hash::{ChunkChecksum, FileHash, PeerId};
use crate::hooks::{Collaborators, Outbound};
use crate::peer::{Backoff, ChunkReceiver, SliceSender};
use crate::progress::FileProgress;
use crate::provider::FileProvider;
use crate::rename::rename_completed;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const CHECKSUM_TIMEOUT: Duration = Duration::from_secs(60);
pub const BACKOFF_BASE: Duration = Duration::from_millis(250);
pub const BACKOFF_MAX: Duration = Duration::from_secs(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentTimings {
    /// An upload without activity for this long is closed.
    pub idle_timeout: Duration,
    /// A chunk or chunk map request unanswered for this long is abandoned.
    pub request_timeout: Duration,
    pub checksum_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Ask the seeder for a checksum of every chunk it completed.
    pub verify_chunks: bool,
}

impl Default for AgentTimings {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            checksum_timeout: CHECKSUM_TIMEOUT,
            backoff_base: BACKOFF_BASE,
            backoff_max: BACKOFF_MAX,
            verify_chunks: true,
        }
    }
}

pub struct TransferAgent {
    hash: FileHash,
    file_name: String,
    provider: FileProvider,
    timings: AgentTimings,
    done: bool,
    trusted: bool,
    final_path: Option<PathBuf>,
    last_activity: Instant,
    bytes_sent: u64,
    seeders: BTreeMap<PeerId, ChunkReceiver>,
    leechers: BTreeMap<PeerId, VecDeque<SliceSender>>,
    pending_checks: HashMap<u32, (PeerId, Instant)>,
    rng: StdRng,
}

impl TransferAgent {
    pub fn new(hash: FileHash, file_name: String, provider: FileProvider, timings: AgentTimings, now: Instant) -> Self {
        Self {
            hash,
            file_name,
            provider,
            timings,
            done: false,
            trusted: false,
            final_path: None,
            last_activity: now,
            bytes_sent: 0,
            seeders: BTreeMap::new(),
            leechers: BTreeMap::new(),
            pending_checks: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Pins the peer selection, for reproducible runs.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn set_trusted(&mut self, trusted: bool) {
        self.trusted = trusted;
    }

    pub fn hash(&self) -> &FileHash {
        &self.hash
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn provider(&self) -> &FileProvider {
        &self.provider
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Where the file ended up after completion.
    pub fn final_path(&self) -> Option<&Path> {
        self.final_path.as_deref()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn has_peers(&self) -> bool {
        !(self.seeders.is_empty() && self.leechers.is_empty())
    }

    pub fn seeder_count(&self) -> usize {
        self.seeders.len()
    }

    pub fn leecher_count(&self) -> usize {
        self.leechers.len()
    }

    /// Registers a source and asks for its chunk map.
    pub fn add_seeder(&mut self, peer: PeerId, collaborators: &Collaborators, now: Instant) {
        if self.done {
            debug!(%peer, hash = %self.hash, "download already done, not adding seeder");
            return;
        }
        let backoff = Backoff::new(self.timings.backoff_base, self.timings.backoff_max);
        let receiver = self
            .seeders
            .entry(peer)
            .or_insert_with(|| ChunkReceiver::new(backoff, now));
        receiver.map_requested(now);
        collaborators.transport.send(
            &peer,
            Outbound::ChunkMapRequest {
                hash: self.hash,
                leecher_side: false,
            },
        );
    }

    /// Queues a byte range to push to `peer`, after any range already queued for it.
    pub fn add_leecher(&mut self, peer: PeerId, offset: u64, size: u64, now: Instant) {
        self.leechers
            .entry(peer)
            .or_default()
            .push_back(SliceSender::new(offset, size));
        self.last_activity = now;
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        if let Some(receiver) = self.seeders.remove(peer) {
            if let Some(chunk) = receiver.chunk() {
                self.provider.release_chunk(chunk);
            }
            self.pending_checks.retain(|_, (checker, _)| *checker != *peer);
        } else if self.leechers.remove(peer).is_none() {
            warn!("Removal of peer {} failed because it's not in the list", peer);
        }
    }

    pub fn add_chunk_map(&mut self, peer: &PeerId, words: &[u32], now: Instant) {
        let Some(receiver) = self.seeders.get_mut(peer) else {
            error!("Seeder {} not found for adding chunk map", peer);
            return;
        };
        let map = chunk_map::fit(chunk_map::decode(words), self.provider.chunk_count());
        debug!(%peer, chunks = map.count_ones(), "received chunk map");
        receiver.set_chunk_map(map, now);
    }

    /// Stores received data. Failures are logged; the chunk is simply asked again later.
    pub fn receive_data(&mut self, offset: u64, data: &[u8], now: Instant) {
        if self.done {
            trace!(offset, "download done, dropping data");
            return;
        }
        trace!("Writing file {}, offset: {}, length: {}", self.file_name, offset, data.len());
        if let Err(e) = self.provider.write(offset, data) {
            error!("Failed to write to file {}: {}", self.provider.path().display(), e);
            return;
        }
        self.last_activity = now;
    }

    /// Checks a locally completed chunk against the checksum its seeder reported.
    pub fn receive_checksum(&mut self, peer: &PeerId, chunk: u32, checksum: &ChunkChecksum) {
        if self.pending_checks.remove(&chunk).is_none() {
            debug!(%peer, chunk, "unexpected chunk checksum");
            return;
        }
        match self.provider.verify_chunk(chunk, checksum) {
            Ok(true) => debug!(chunk, "chunk verified"),
            Ok(false) => {
                warn!(%peer, chunk, hash = %self.hash, "chunk checksum mismatch, downloading it again");
                self.provider.invalidate_chunk(chunk);
            }
            Err(e) => warn!(chunk, "Failed to verify chunk: {}", e),
        }
    }

    /// Advances one seeder and one leecher. Returns whether any peer remains.
    pub fn process(&mut self, now: Instant, collaborators: &Collaborators) -> bool {
        self.expire_checks(now);
        if let Some(peer) = self.pick_seeder(now) {
            self.process_seeder(peer, now, collaborators);
        }
        self.try_complete(collaborators);
        if let Some(peer) = self.pick(self.leechers.len()).and_then(|i| self.leechers.keys().nth(i).copied()) {
            self.process_leecher(peer, now, collaborators);
        }
        self.has_peers()
    }

    fn pick(&mut self, len: usize) -> Option<usize> {
        (len > 0).then(|| self.rng.gen_range(0..len))
    }

    fn pick_seeder(&mut self, now: Instant) -> Option<PeerId> {
        let due: Vec<PeerId> = self
            .seeders
            .iter()
            .filter(|(_, receiver)| self.seeder_deadline(receiver, now).is_some_and(|deadline| deadline <= now))
            .map(|(peer, _)| *peer)
            .collect();
        let index = self.pick(due.len())?;
        Some(due[index])
    }

    /// When `receiver` next needs attention, or `None` once the file has
    /// nothing left to fetch from it.
    fn seeder_deadline(&self, receiver: &ChunkReceiver, now: Instant) -> Option<Instant> {
        match (receiver.chunk(), receiver.requested_at()) {
            (Some(chunk), _) if self.provider.has_chunk(chunk) => Some(now),
            (Some(_), Some(at)) => Some(at + self.timings.request_timeout),
            _ if self.provider.is_complete() => None,
            _ => match (receiver.chunk_map(), receiver.map_requested_at()) {
                (None, Some(at)) => Some(receiver.next_service().max(at + self.timings.request_timeout)),
                _ => Some(receiver.next_service()),
            },
        }
    }

    fn process_seeder(&mut self, peer: PeerId, now: Instant, collaborators: &Collaborators) {
        let Some(receiver) = self.seeders.get_mut(&peer) else {
            return;
        };

        if let Some(chunk) = receiver.chunk() {
            if self.provider.has_chunk(chunk) {
                debug!("Chunk {} is complete", chunk);
                receiver.finish_receiving(now);
                if self.timings.verify_chunks {
                    self.pending_checks.insert(chunk, (peer, now));
                    collaborators
                        .transport
                        .send(&peer, Outbound::ChecksumRequest { hash: self.hash, chunk });
                }
            } else if receiver
                .requested_at()
                .is_some_and(|at| now.saturating_duration_since(at) >= self.timings.request_timeout)
            {
                debug!(%peer, chunk, "chunk request timed out");
                self.provider.release_chunk(chunk);
                receiver.fail(now);
            }
            return;
        }

        if self.provider.is_complete() {
            return;
        }

        let Some(remote) = receiver.chunk_map() else {
            // The request went unanswered
            debug!(%peer, "asking again for chunk map");
            receiver.fail(now);
            receiver.map_requested(now);
            collaborators.transport.send(
                &peer,
                Outbound::ChunkMapRequest {
                    hash: self.hash,
                    leecher_side: false,
                },
            );
            return;
        };

        match self.provider.needed_chunk(remote, now) {
            Some(chunk) => {
                debug!("Requesting chunk number {} to peer {}", chunk, peer);
                let file_size = self.provider.file_size();
                collaborators.transport.send(
                    &peer,
                    Outbound::DataRequest {
                        hash: self.hash,
                        file_size,
                        offset: chunk as u64 * CHUNK_SIZE,
                        size: chunk_map::chunk_len(file_size, chunk),
                    },
                );
                receiver.start_receiving(chunk, now);
            }
            None => {
                trace!(%peer, "nothing needed from peer");
                receiver.fail(now);
            }
        }
    }

    fn process_leecher(&mut self, peer: PeerId, now: Instant, collaborators: &Collaborators) {
        let Some(queue) = self.leechers.get_mut(&peer) else {
            return;
        };
        let Some(sender) = queue.front_mut() else {
            self.leechers.remove(&peer);
            return;
        };

        let before = sender.remaining();
        let more = sender.send(&self.provider, collaborators.transport.as_ref(), &peer, &self.hash);
        self.bytes_sent += before - sender.remaining();
        if !sender.is_waiting() {
            self.last_activity = now;
        }

        // Only the job goes away. The manager closes idle uploads, which
        // avoids reopening the file for the next request.
        if !more {
            queue.pop_front();
            if queue.is_empty() {
                self.leechers.remove(&peer);
            }
        }
    }

    fn expire_checks(&mut self, now: Instant) {
        let timeout = self.timings.checksum_timeout;
        self.pending_checks.retain(|chunk, (peer, asked_at)| {
            let keep = now.saturating_duration_since(*asked_at) < timeout;
            if !keep {
                warn!(%peer, chunk, "no checksum received, keeping chunk unverified");
            }
            keep
        });
    }

    /// Finishes a download once every chunk is in, verified or given up on,
    /// whether or not any source is still around.
    fn try_complete(&mut self, collaborators: &Collaborators) {
        if self.done || !self.provider.is_consuming() || !self.provider.is_complete() {
            return;
        }
        if !self.pending_checks.is_empty() || self.seeders.values().any(|receiver| receiver.chunk().is_some()) {
            return;
        }
        self.complete(collaborators);
    }

    fn complete(&mut self, collaborators: &Collaborators) {
        info!("File is complete, size: {}, renaming to {}", self.provider.file_size(), self.file_name);
        self.stop();
        if let Some(id) = self.provider.id() {
            if let Err(e) = collaborators.store.mark_completed(id, &self.hash) {
                error!("Failed to mark download {} as completed: {}", id, e);
            }
        }
        collaborators.transport.deactivate_tunnels(&self.hash);

        let path = rename_completed(self.provider.path(), &self.file_name);
        collaborators.attributes.set_visible(&path, true);
        collaborators.attributes.set_trusted(&path, self.trusted);
        self.final_path = Some(path);

        self.seeders.clear();
        self.leechers.clear();
        self.pending_checks.clear();
        self.done = true;
    }

    /// Drops the transfer, deleting the file if it is incomplete.
    pub fn cancel(&mut self) {
        if self.provider.is_complete() {
            self.stop();
        } else if let Err(e) = self.provider.close_and_delete() {
            error!("Failed to delete {}: {}", self.provider.path().display(), e);
        }
    }

    pub fn stop(&mut self) {
        self.provider.close();
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.timings.idle_timeout
    }

    /// Earliest time at which `process` has something to do, if ever.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        // Jobs waiting on chunks still downloading are resumed by incoming data.
        let sendable = self
            .leechers
            .values()
            .any(|queue| queue.front().is_some_and(|sender| !sender.is_waiting()));
        if sendable {
            return Some(now);
        }
        let seeders = self
            .seeders
            .values()
            .filter_map(|receiver| self.seeder_deadline(receiver, now));
        let checks = self
            .pending_checks
            .values()
            .map(|(_, at)| *at + self.timings.checksum_timeout);
        seeders.chain(checks).min()
    }

    pub fn progress(&self) -> FileProgress {
        let (id, current) = match self.provider.id() {
            Some(id) => (id, self.provider.bytes_written()),
            None => (0, self.bytes_sent),
        };
        FileProgress {
            id,
            name: self.file_name.clone(),
            current,
            total: self.provider.file_size(),
            hash: self.hash,
            completed: self.done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_SIZE;
    use crate::distributor::{ChunkDistributor, FileTransferStrategy};
    use crate::hooks::tests::{RecordingAttributes, RecordingStore, RecordingTransport};
    use tempfile::{tempdir, TempDir};

    struct Harness {
        dir: TempDir,
        transport: RecordingTransport,
        store: RecordingStore,
        attributes: RecordingAttributes,
        collaborators: Collaborators,
    }

    impl Harness {
        fn new() -> Self {
            let transport = RecordingTransport::default();
            let store = RecordingStore::default();
            let attributes = RecordingAttributes::default();
            let collaborators = Collaborators::new(transport.clone())
                .with_store(store.clone())
                .with_attributes(attributes.clone());
            Self {
                dir: tempdir().unwrap(),
                transport,
                store,
                attributes,
                collaborators,
            }
        }

        fn download(&self, size: u64, timings: AgentTimings) -> TransferAgent {
            let distributor = ChunkDistributor::new(chunk_map::chunk_count(size), FileTransferStrategy::Linear);
            let path = self.dir.path().join(".hash.swarmpart");
            let mut provider = FileProvider::for_download(7, path, size, None, distributor);
            provider.open().unwrap();
            TransferAgent::new(FileHash([9; 32]), "final.bin".to_string(), provider, timings, Instant::now())
                .with_rng(StdRng::seed_from_u64(1))
        }

        fn upload(&self, data: &[u8]) -> TransferAgent {
            let path = self.dir.path().join("seed.bin");
            std::fs::write(&path, data).unwrap();
            let mut provider = FileProvider::for_upload(path);
            provider.open().unwrap();
            TransferAgent::new(FileHash([3; 32]), "seed.bin".to_string(), provider, AgentTimings::default(), Instant::now())
                .with_rng(StdRng::seed_from_u64(2))
        }
    }

    fn unverified() -> AgentTimings {
        AgentTimings {
            verify_chunks: false,
            ..AgentTimings::default()
        }
    }

    fn chunk_data(chunk: u32) -> Vec<u8> {
        vec![chunk as u8 + 1; CHUNK_SIZE as usize]
    }

    fn data_requests(transport: &RecordingTransport) -> Vec<u64> {
        transport
            .take()
            .into_iter()
            .filter_map(|(_, msg)| match msg {
                Outbound::DataRequest { offset, .. } => Some(offset / CHUNK_SIZE),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_linear_download_from_single_seeder() {
        let h = Harness::new();
        let mut agent = h.download(10 * CHUNK_SIZE, unverified());
        let seeder = PeerId::from_index(1);
        let mut now = Instant::now();

        agent.add_seeder(seeder, &h.collaborators, now);
        let sent = h.transport.take();
        assert_eq!(
            sent,
            vec![(seeder, Outbound::ChunkMapRequest { hash: FileHash([9; 32]), leecher_side: false })]
        );
        agent.add_chunk_map(&seeder, &chunk_map::encode(&chunk_map::full(10)), now);

        let mut requested = Vec::new();
        for _ in 0..100 {
            now += Duration::from_millis(10);
            agent.process(now, &h.collaborators);
            for chunk in data_requests(&h.transport) {
                requested.push(chunk);
                let data = chunk_data(chunk as u32);
                for (block, bytes) in data.chunks(BLOCK_SIZE as usize).enumerate() {
                    agent.receive_data(chunk * CHUNK_SIZE + block as u64 * BLOCK_SIZE, bytes, now);
                }
            }
        }

        assert_eq!(requested, (0..10).collect::<Vec<u64>>());
        assert!(agent.is_done());
        assert_eq!(h.store.completed.lock().unwrap().as_slice(), &[7]);
        assert_eq!(h.transport.deactivated.lock().unwrap().len(), 1);
        let final_path = h.dir.path().join("final.bin");
        assert_eq!(agent.final_path(), Some(final_path.as_path()));
        assert_eq!(std::fs::metadata(&final_path).unwrap().len(), 10 * CHUNK_SIZE);
        assert_eq!(h.attributes.visible.lock().unwrap().as_slice(), &[(final_path.clone(), true)]);
        assert_eq!(h.attributes.trusted.lock().unwrap().as_slice(), &[(final_path, false)]);
        assert!(!agent.has_peers());
        assert!(agent.progress().completed);
    }

    #[test]
    fn test_one_outstanding_request_per_seeder() {
        let h = Harness::new();
        let mut agent = h.download(4 * CHUNK_SIZE, unverified());
        let seeder = PeerId::from_index(1);
        let now = Instant::now();
        agent.add_seeder(seeder, &h.collaborators, now);
        agent.add_chunk_map(&seeder, &chunk_map::encode(&chunk_map::full(4)), now);
        h.transport.take();

        for _ in 0..5 {
            agent.process(now, &h.collaborators);
        }
        assert_eq!(data_requests(&h.transport), vec![0]);
        assert!(agent.next_deadline(now).unwrap() > now);
    }

    #[test]
    fn test_timed_out_request_is_released_and_retried_later() {
        let h = Harness::new();
        let timings = AgentTimings {
            request_timeout: Duration::from_secs(5),
            ..unverified()
        };
        let mut agent = h.download(2 * CHUNK_SIZE, timings);
        let slow = PeerId::from_index(1);
        let start = Instant::now();
        agent.add_seeder(slow, &h.collaborators, start);
        agent.add_chunk_map(&slow, &chunk_map::encode(&chunk_map::full(2)), start);
        agent.process(start, &h.collaborators);
        h.transport.take();

        let later = start + Duration::from_secs(6);
        agent.process(later, &h.collaborators);
        let receiver = agent.seeders.get(&slow).unwrap();
        assert!(!receiver.is_receiving());
        assert!(!receiver.is_due(later));

        let fast = PeerId::from_index(2);
        agent.add_seeder(fast, &h.collaborators, later);
        agent.add_chunk_map(&fast, &chunk_map::encode(&chunk_map::full(2)), later);
        agent.process(later, &h.collaborators);
        assert_eq!(data_requests(&h.transport), vec![0]);
    }

    #[test]
    fn test_removed_seeder_releases_its_chunk() {
        let h = Harness::new();
        let mut agent = h.download(2 * CHUNK_SIZE, unverified());
        let first = PeerId::from_index(1);
        let now = Instant::now();
        agent.add_seeder(first, &h.collaborators, now);
        agent.add_chunk_map(&first, &chunk_map::encode(&chunk_map::full(2)), now);
        agent.process(now, &h.collaborators);
        assert_eq!(data_requests(&h.transport), vec![0]);

        agent.remove_peer(&first);
        assert!(!agent.has_peers());

        let second = PeerId::from_index(2);
        agent.add_seeder(second, &h.collaborators, now);
        agent.add_chunk_map(&second, &chunk_map::encode(&chunk_map::full(2)), now);
        agent.process(now, &h.collaborators);
        assert_eq!(data_requests(&h.transport), vec![0]);
    }

    #[test]
    fn test_remove_unknown_peer_is_harmless() {
        let h = Harness::new();
        let mut agent = h.download(CHUNK_SIZE, unverified());
        agent.remove_peer(&PeerId::from_index(42));
        assert!(!agent.has_peers());
    }

    #[test]
    fn test_checksum_mismatch_requests_chunk_again() {
        let h = Harness::new();
        let mut agent = h.download(CHUNK_SIZE, AgentTimings::default());
        let seeder = PeerId::from_index(1);
        let now = Instant::now();
        agent.add_seeder(seeder, &h.collaborators, now);
        agent.add_chunk_map(&seeder, &chunk_map::encode(&chunk_map::full(1)), now);
        agent.process(now, &h.collaborators);
        h.transport.take();

        let data = chunk_data(0);
        agent.receive_data(0, &data, now);
        agent.process(now, &h.collaborators);
        let sent = h.transport.take();
        assert_eq!(sent, vec![(seeder, Outbound::ChecksumRequest { hash: FileHash([9; 32]), chunk: 0 })]);

        // Not done while the check is pending
        agent.process(now, &h.collaborators);
        assert!(!agent.is_done());

        agent.receive_checksum(&seeder, 0, &ChunkChecksum::of(b"something else"));
        assert!(!agent.provider().has_chunk(0));
        agent.process(now, &h.collaborators);
        assert_eq!(data_requests(&h.transport), vec![0]);

        agent.receive_data(0, &data, now);
        agent.process(now, &h.collaborators);
        h.transport.take();
        agent.receive_checksum(&seeder, 0, &ChunkChecksum::of(&data));
        agent.process(now, &h.collaborators);
        assert!(agent.is_done());
    }

    #[test]
    fn test_missing_checksum_does_not_block_completion() {
        let h = Harness::new();
        let timings = AgentTimings {
            checksum_timeout: Duration::from_secs(1),
            ..AgentTimings::default()
        };
        let mut agent = h.download(BLOCK_SIZE, timings);
        let seeder = PeerId::from_index(1);
        let now = Instant::now();
        agent.add_seeder(seeder, &h.collaborators, now);
        agent.add_chunk_map(&seeder, &chunk_map::encode(&chunk_map::full(1)), now);
        agent.process(now, &h.collaborators);
        agent.receive_data(0, &[5u8; BLOCK_SIZE as usize], now);
        agent.process(now, &h.collaborators);
        agent.process(now, &h.collaborators);
        assert!(!agent.is_done());

        agent.process(now + Duration::from_secs(2), &h.collaborators);
        assert!(agent.is_done());
    }

    #[test]
    fn test_pending_checksum_waits_without_spinning() {
        let h = Harness::new();
        let mut agent = h.download(BLOCK_SIZE, AgentTimings::default());
        let seeder = PeerId::from_index(1);
        let start = Instant::now();
        agent.add_seeder(seeder, &h.collaborators, start);
        agent.add_chunk_map(&seeder, &chunk_map::encode(&chunk_map::full(1)), start);
        agent.process(start, &h.collaborators);
        agent.receive_data(0, &[5u8; BLOCK_SIZE as usize], start);
        agent.process(start, &h.collaborators);
        assert!(matches!(h.transport.take().last(), Some((_, Outbound::ChecksumRequest { chunk: 0, .. }))));

        let expiry = start + CHECKSUM_TIMEOUT;
        let mut now = start;
        for _ in 0..100 {
            now += Duration::from_millis(10);
            assert_eq!(agent.next_deadline(now), Some(expiry));
            agent.process(now, &h.collaborators);
        }
        assert!(!agent.is_done());
        assert!(h.transport.take().is_empty());

        agent.process(expiry, &h.collaborators);
        assert!(agent.is_done());
        assert_eq!(agent.next_deadline(expiry), None);
    }

    #[test]
    fn test_download_completes_after_last_seeder_left() {
        let h = Harness::new();
        let mut agent = h.download(2 * BLOCK_SIZE, unverified());
        let seeder = PeerId::from_index(1);
        let now = Instant::now();
        agent.add_seeder(seeder, &h.collaborators, now);
        agent.add_chunk_map(&seeder, &chunk_map::encode(&chunk_map::full(1)), now);
        agent.process(now, &h.collaborators);
        assert_eq!(data_requests(&h.transport), vec![0]);

        agent.receive_data(0, &[1u8; 2 * BLOCK_SIZE as usize], now);
        agent.remove_peer(&seeder);
        assert!(!agent.has_peers());

        agent.process(now, &h.collaborators);
        assert!(agent.is_done());
        assert_eq!(h.store.completed.lock().unwrap().as_slice(), &[7]);
        assert_eq!(agent.final_path(), Some(h.dir.path().join("final.bin").as_path()));
    }

    #[test]
    fn test_swarming_leecher_waits_for_missing_chunk() {
        let h = Harness::new();
        let mut agent = h.download(2 * CHUNK_SIZE, unverified());
        let leecher = PeerId::from_index(4);
        let now = Instant::now();
        agent.add_leecher(leecher, CHUNK_SIZE, BLOCK_SIZE, now);
        assert_eq!(agent.next_deadline(now), Some(now));

        agent.process(now, &h.collaborators);
        assert!(h.transport.take().is_empty());
        assert_eq!(agent.leecher_count(), 1);
        assert_eq!(agent.next_deadline(now), None);

        let data = chunk_data(1);
        for (block, bytes) in data.chunks(BLOCK_SIZE as usize).enumerate() {
            agent.receive_data(CHUNK_SIZE + block as u64 * BLOCK_SIZE, bytes, now);
        }
        agent.process(now, &h.collaborators);
        let sent = h.transport.take();
        assert!(matches!(
            sent.as_slice(),
            [(to, Outbound::Data { offset, .. })] if *to == leecher && *offset == CHUNK_SIZE
        ));
        assert_eq!(agent.leecher_count(), 0);
        assert_eq!(agent.bytes_sent(), BLOCK_SIZE);
    }

    #[test]
    fn test_unanswered_chunk_map_request_is_repeated() {
        let h = Harness::new();
        let timings = AgentTimings {
            request_timeout: Duration::from_secs(5),
            ..unverified()
        };
        let mut agent = h.download(CHUNK_SIZE, timings);
        let seeder = PeerId::from_index(1);
        let start = Instant::now();
        agent.add_seeder(seeder, &h.collaborators, start);
        h.transport.take();

        agent.process(start + Duration::from_secs(1), &h.collaborators);
        assert!(h.transport.take().is_empty());
        assert_eq!(agent.next_deadline(start), Some(start + Duration::from_secs(5)));

        agent.process(start + Duration::from_secs(5), &h.collaborators);
        let sent = h.transport.take();
        assert!(matches!(sent.as_slice(), [(_, Outbound::ChunkMapRequest { .. })]));
    }

    #[test]
    fn test_cancel_deletes_incomplete_download() {
        let h = Harness::new();
        let mut agent = h.download(CHUNK_SIZE, unverified());
        let path = agent.provider().path().to_path_buf();
        assert!(path.exists());
        agent.cancel();
        assert!(!path.exists());
    }

    #[test]
    fn test_upload_serves_queued_ranges_in_order() {
        let h = Harness::new();
        let data: Vec<u8> = (0..3 * BLOCK_SIZE).map(|i| i as u8).collect();
        let mut agent = h.upload(&data);
        let leecher = PeerId::from_index(5);
        let now = Instant::now();

        agent.add_leecher(leecher, 2 * BLOCK_SIZE, BLOCK_SIZE, now);
        agent.add_leecher(leecher, 0, BLOCK_SIZE, now);
        assert_eq!(agent.next_deadline(now), Some(now));

        assert!(agent.process(now, &h.collaborators));
        assert!(!agent.process(now, &h.collaborators));

        let offsets: Vec<u64> = h
            .transport
            .take()
            .into_iter()
            .map(|(peer, msg)| {
                assert_eq!(peer, leecher);
                match msg {
                    Outbound::Data { offset, .. } => offset,
                    other => panic!("unexpected {other:?}"),
                }
            })
            .collect();
        assert_eq!(offsets, vec![2 * BLOCK_SIZE, 0]);
        assert_eq!(agent.bytes_sent(), 2 * BLOCK_SIZE);
        assert_eq!(agent.progress().current, 2 * BLOCK_SIZE);
        assert_eq!(agent.progress().id, 0);
        // The file stays open for the next request
        assert!(agent.provider().is_open());
    }

    #[test]
    fn test_every_leecher_gets_served() {
        let h = Harness::new();
        let data = vec![1u8; 64 * BLOCK_SIZE as usize];
        let mut agent = h.upload(&data);
        let now = Instant::now();
        for n in 0..4 {
            agent.add_leecher(PeerId::from_index(n), 0, 8 * BLOCK_SIZE, now);
        }
        while agent.process(now, &h.collaborators) {}

        let mut served = BTreeMap::new();
        for (peer, _) in h.transport.take() {
            *served.entry(peer).or_insert(0) += 1;
        }
        assert_eq!(served.len(), 4);
        assert!(served.values().all(|&n| n == 8));
    }

    #[test]
    fn test_upload_becomes_idle() {
        let h = Harness::new();
        let mut agent = h.upload(b"abc");
        let now = Instant::now();
        agent.add_leecher(PeerId::from_index(1), 0, 3, now);
        agent.process(now, &h.collaborators);
        assert!(!agent.is_idle(now + Duration::from_secs(60)));
        assert!(agent.is_idle(now + IDLE_TIMEOUT + Duration::from_secs(1)));
        assert_eq!(agent.next_deadline(now), None);
    }
}
