//! The coordinator owning every transfer.
//!
//! All transfer state lives in [`TransferManager`] and is only touched from
//! its control loop. Everything else talks to it by queueing [`Action`]s
//! through a [`TransferHandle`].

use crate::agent::{AgentTimings, TransferAgent};
use crate::block::CHUNK_SIZE;
use crate::chunk_map::{self, ChunkMap};
use crate::config::TransferConfig;
use crate::distributor::{ChunkDistributor, FileTransferStrategy};
use crate::error::{Result, TransferError};
use crate::hash::{ChunkChecksum, FileHash, PeerId};
use crate::hooks::{Collaborators, Outbound};
use crate::progress::{FileProgress, ProgressBoard};
use crate::provider::FileProvider;
use crate::resume::SuspendedDownload;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub id: u64,
    pub name: String,
    pub hash: FileHash,
    pub size: u64,
    /// A peer known to have the file. Without one, tunnels are searched.
    pub from: Option<PeerId>,
    /// Chunks already present from an earlier run.
    pub chunk_map: Option<ChunkMap>,
}

impl From<SuspendedDownload> for DownloadRequest {
    fn from(download: SuspendedDownload) -> Self {
        let chunk_map = Some(download.chunk_map());
        Self {
            id: download.id,
            name: download.name,
            hash: download.hash,
            size: download.size,
            from: None,
            chunk_map,
        }
    }
}

#[derive(Debug)]
pub enum Action {
    /// A source for one of our downloads showed up.
    AddPeer { hash: FileHash, peer: PeerId },
    RemovePeer { hash: FileHash, peer: PeerId },
    ReceiveDataRequest { peer: PeerId, hash: FileHash, offset: u64, size: u64 },
    ReceiveData { peer: PeerId, hash: FileHash, offset: u64, data: Bytes },
    StartDownload(DownloadRequest),
    RemoveDownload { id: u64 },
    GetDownloadsProgress { reply: Option<oneshot::Sender<Vec<FileProgress>>> },
    GetUploadsProgress { reply: Option<oneshot::Sender<Vec<FileProgress>>> },
    ReceiveChunkMapRequest { peer: PeerId, hash: FileHash, leecher_side: bool },
    ReceiveChunkMap { peer: PeerId, hash: FileHash, words: Vec<u32> },
    ReceiveChecksumRequest { peer: PeerId, hash: FileHash, chunk: u32 },
    ReceiveChecksum { peer: PeerId, hash: FileHash, chunk: u32, checksum: ChunkChecksum },
}

/// How long the control loop may wait for the next action.
///
/// `None` means no transfer exists and the loop can block until an action
/// arrives. Otherwise the wait ends at the earliest deadline, immediately for
/// one already past, and never later than `tick`.
pub fn compute_poll_timeout<I>(now: Instant, deadlines: I, tick: Duration) -> Option<Duration>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    let mut any = false;
    let mut timeout = tick;
    for deadline in deadlines {
        any = true;
        if let Some(deadline) = deadline {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
    }
    any.then_some(timeout)
}

pub struct TransferManager {
    own_peer: PeerId,
    settings: TransferConfig,
    timings: AgentTimings,
    collaborators: Collaborators,
    progress: ProgressBoard,
    downloads: BTreeMap<FileHash, TransferAgent>,
    uploads: BTreeMap<FileHash, TransferAgent>,
    rng: StdRng,
}

impl TransferManager {
    pub fn new(own_peer: PeerId, settings: TransferConfig, collaborators: Collaborators) -> Self {
        let timings = settings.timings();
        Self {
            own_peer,
            settings,
            timings,
            collaborators,
            progress: ProgressBoard::default(),
            downloads: BTreeMap::new(),
            uploads: BTreeMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Derives every random choice of the manager and its transfers from `seed`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn own_peer(&self) -> PeerId {
        self.own_peer
    }

    pub fn progress_board(&self) -> ProgressBoard {
        self.progress.clone()
    }

    pub fn download(&self, hash: &FileHash) -> Option<&TransferAgent> {
        self.downloads.get(hash)
    }

    pub fn upload(&self, hash: &FileHash) -> Option<&TransferAgent> {
        self.uploads.get(hash)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.len()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.len()
    }

    fn child_rng(&mut self) -> StdRng {
        StdRng::seed_from_u64(self.rng.gen())
    }

    pub fn handle(&mut self, action: Action, now: Instant) {
        match action {
            Action::AddPeer { hash, peer } => {
                if let Some(agent) = self.downloads.get_mut(&hash) {
                    agent.add_seeder(peer, &self.collaborators, now);
                }
            }
            Action::RemovePeer { hash, peer } => {
                if let Some(agent) = self.downloads.get_mut(&hash) {
                    agent.remove_peer(&peer);
                }
            }
            Action::ReceiveDataRequest { peer, hash, offset, size } => {
                self.receive_data_request(peer, hash, offset, size, now)
            }
            Action::ReceiveData { peer, hash, offset, data } => match self.downloads.get_mut(&hash) {
                Some(agent) => {
                    trace!(%peer, offset, len = data.len(), "received data");
                    agent.receive_data(offset, &data, now);
                }
                None => error!("No matching agent for hash {} for receiving data", hash),
            },
            Action::StartDownload(request) => self.start_download(request, now),
            Action::RemoveDownload { id } => self.remove_download(id),
            Action::GetDownloadsProgress { reply } => {
                let progress: Vec<FileProgress> = self.downloads.values().map(TransferAgent::progress).collect();
                self.progress.publish_downloads(progress.clone());
                if let Some(reply) = reply {
                    let _ = reply.send(progress);
                }
            }
            Action::GetUploadsProgress { reply } => {
                let progress: Vec<FileProgress> = self.uploads.values().map(TransferAgent::progress).collect();
                self.progress.publish_uploads(progress.clone());
                if let Some(reply) = reply {
                    let _ = reply.send(progress);
                }
            }
            Action::ReceiveChunkMapRequest { peer, hash, leecher_side } => {
                self.receive_chunk_map_request(peer, hash, leecher_side, now)
            }
            Action::ReceiveChunkMap { peer, hash, words } => match self.downloads.get_mut(&hash) {
                Some(agent) => agent.add_chunk_map(&peer, &words, now),
                None => error!("No matching agent for hash {} for chunk map", hash),
            },
            Action::ReceiveChecksumRequest { peer, hash, chunk } => self.receive_checksum_request(peer, hash, chunk, now),
            Action::ReceiveChecksum { peer, hash, chunk, checksum } => match self.downloads.get_mut(&hash) {
                Some(agent) => agent.receive_checksum(&peer, chunk, &checksum),
                None => debug!("No matching agent for hash {} for chunk checksum", hash),
            },
        }
    }

    fn start_download(&mut self, request: DownloadRequest, now: Instant) {
        if self.downloads.contains_key(&request.hash) {
            debug!(hash = %request.hash, "already downloading");
            return;
        }
        let incoming = PathBuf::from(&self.settings.incoming_directory);
        if let Err(e) = std::fs::create_dir_all(&incoming) {
            error!("Couldn't create incoming directory {}: {}", incoming.display(), e);
            return;
        }
        let path = incoming.join(format!(
            "{}{}{}",
            self.settings.download_prefix, request.hash, self.settings.download_extension
        ));
        debug!("Downloading file {}, size: {}, from: {:?}", path.display(), request.size, request.from);

        // A known source is read front to back.
        let strategy = if request.from.is_some() {
            FileTransferStrategy::Linear
        } else {
            self.settings.strategy
        };
        let mut distributor =
            ChunkDistributor::with_rng(chunk_map::chunk_count(request.size), strategy, self.child_rng());
        distributor.set_given_timeout(self.settings.given_chunk_timeout());

        let mut provider = FileProvider::for_download(request.id, path.clone(), request.size, request.chunk_map, distributor);
        if let Err(e) = provider.open() {
            error!("Couldn't create file {} for download: {}", path.display(), e);
            return;
        }
        self.collaborators.attributes.set_visible(&path, false);

        let rng = self.child_rng();
        let mut agent = TransferAgent::new(request.hash, request.name, provider, self.timings, now).with_rng(rng);
        match request.from {
            Some(peer) => {
                agent.set_trusted(true);
                agent.add_seeder(peer, &self.collaborators, now);
            }
            None => self.collaborators.transport.activate_tunnels(&request.hash),
        }
        info!(id = request.id, hash = %request.hash, "download started");
        self.downloads.insert(request.hash, agent);
    }

    fn remove_download(&mut self, id: u64) {
        let hash = self
            .downloads
            .iter()
            .find(|(_, agent)| agent.provider().id() == Some(id))
            .map(|(hash, _)| *hash);
        if let Some(hash) = hash {
            self.collaborators.transport.deactivate_tunnels(&hash);
            if let Some(mut agent) = self.downloads.remove(&hash) {
                agent.cancel();
            }
            info!(id, %hash, "download removed");
        }
        if let Err(e) = self.collaborators.store.remove_download(id) {
            error!("Failed to remove download {}: {}", id, e);
        }
    }

    fn receive_data_request(&mut self, peer: PeerId, hash: FileHash, offset: u64, size: u64, now: Instant) {
        debug!("Received data request from {}, hash: {}, offset: {}, size: {}", peer, hash, offset, size);
        if peer == self.own_peer {
            return;
        }
        if size > CHUNK_SIZE {
            warn!("Ignoring request from {} for hash {}: {}", peer, hash, TransferError::ChunkTooLarge(size));
            return;
        }
        match self.serving_agent(&hash, now) {
            Some(agent) => agent.add_leecher(peer, offset, size, now),
            None => debug!(%peer, %hash, "no file to serve"),
        }
    }

    fn receive_chunk_map_request(&mut self, peer: PeerId, hash: FileHash, leecher_side: bool, now: Instant) {
        debug!(
            "Received {} chunk map request from {}, hash: {}",
            if leecher_side { "leecher" } else { "seeder" },
            peer,
            hash
        );
        if peer == self.own_peer {
            return;
        }
        let agent = if leecher_side {
            self.downloads.get(&hash)
        } else {
            self.serving_agent(&hash, now).map(|agent| &*agent)
        };
        let Some(words) = agent.map(|agent| chunk_map::encode(&agent.provider().chunk_map())) else {
            error!("No matching agent for hash {} for chunk map request", hash);
            return;
        };
        self.collaborators.transport.send(&peer, Outbound::ChunkMap { hash, words });
    }

    fn receive_checksum_request(&mut self, peer: PeerId, hash: FileHash, chunk: u32, now: Instant) {
        debug!("Received chunk checksum request from {}", peer);
        if peer == self.own_peer {
            return;
        }
        let agent = match self.uploads.contains_key(&hash) {
            true => self.uploads.get(&hash),
            false => self.local_search(&hash, now).map(|agent| &*agent),
        };
        let Some(checksum) = agent.map(|agent| agent.provider().compute_hash(chunk as u64 * CHUNK_SIZE)) else {
            error!("No matching agent for hash {} for chunk number {}", hash, chunk);
            return;
        };
        match checksum {
            Ok(checksum) => self
                .collaborators
                .transport
                .send(&peer, Outbound::Checksum { hash, chunk, checksum }),
            Err(e) => warn!(chunk, %hash, "Cannot compute chunk checksum: {}", e),
        }
    }

    /// The transfer answering remote requests for `hash`: an upload, else a
    /// download still in progress, else a complete local file opened on demand.
    fn serving_agent(&mut self, hash: &FileHash, now: Instant) -> Option<&mut TransferAgent> {
        if !self.uploads.contains_key(hash) {
            if self.downloads.get(hash).is_some_and(|agent| !agent.is_done()) {
                return self.downloads.get_mut(hash);
            }
            return self.local_search(hash, now);
        }
        self.uploads.get_mut(hash)
    }

    fn local_search(&mut self, hash: &FileHash, now: Instant) -> Option<&mut TransferAgent> {
        let completed = self
            .downloads
            .get(hash)
            .and_then(|agent| agent.final_path())
            .map(|path| path.to_path_buf());
        let path = completed.or_else(|| self.collaborators.files.find_path_by_hash(hash))?;

        debug!("Serving file {} for hash {}", path.display(), hash);
        let mut provider = FileProvider::for_upload(path.clone());
        if let Err(e) = provider.open() {
            debug!("Failed to open file {} for serving: {}", path.display(), e);
            return None;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rng = self.child_rng();
        let agent = TransferAgent::new(*hash, name, provider, self.timings, now).with_rng(rng);
        Some(self.uploads.entry(*hash).or_insert(agent))
    }

    /// Advances every transfer by one step, closing uploads nobody asked for in a while.
    pub fn tick(&mut self, now: Instant) {
        for agent in self.downloads.values_mut() {
            agent.process(now, &self.collaborators);
        }

        self.uploads.retain(|hash, agent| {
            if agent.is_idle(now) {
                debug!(%hash, "closing idle upload");
                agent.stop();
                return false;
            }
            true
        });
        for agent in self.uploads.values_mut() {
            agent.process(now, &self.collaborators);
        }
    }

    pub fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        let deadlines = self
            .downloads
            .values()
            .chain(self.uploads.values())
            .map(|agent| agent.next_deadline(now));
        compute_poll_timeout(now, deadlines, self.settings.default_tick())
    }

    /// Hands every unfinished download to the store so it can resume later.
    pub fn suspend_all(&mut self) {
        for (hash, agent) in self.downloads.iter_mut() {
            if agent.is_done() {
                continue;
            }
            if let Some(id) = agent.provider().id() {
                let download = SuspendedDownload::new(
                    id,
                    agent.file_name().to_string(),
                    *hash,
                    agent.provider().file_size(),
                    &agent.provider().chunk_map(),
                );
                if let Err(e) = self.collaborators.store.suspend_download(&download) {
                    error!("Failed to suspend download {}: {}", id, e);
                }
            }
            agent.stop();
        }
        for agent in self.uploads.values_mut() {
            agent.stop();
        }
    }

    /// Runs the control loop until shutdown is signalled or every handle is gone.
    pub async fn run(mut self, mut actions: mpsc::UnboundedReceiver<Action>, mut shutdown: watch::Receiver<bool>) {
        info!(peer = %self.own_peer, "transfer manager started");
        loop {
            let action = match self.poll_timeout(Instant::now()) {
                None => tokio::select! {
                    action = actions.recv() => match action {
                        Some(action) => Some(action),
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                },
                Some(timeout) => {
                    if timeout.is_zero() {
                        tokio::task::yield_now().await;
                    }
                    tokio::select! {
                        result = tokio::time::timeout(timeout, actions.recv()) => match result {
                            Ok(Some(action)) => Some(action),
                            Ok(None) => break,
                            // Nothing came in, time to advance the transfers.
                            Err(_) => None,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            };

            let now = Instant::now();
            if let Some(action) = action {
                self.handle(action, now);
            }
            self.tick(now);
        }
        debug!("transfer manager interrupted");
        self.suspend_all();
    }
}

/// Cloneable access to a running [`TransferManager`].
#[derive(Clone)]
pub struct TransferHandle {
    tx: mpsc::UnboundedSender<Action>,
    shutdown: Arc<watch::Sender<bool>>,
    progress: ProgressBoard,
}

/// Starts the control loop of `manager` on the tokio runtime.
pub fn spawn(manager: TransferManager) -> (TransferHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = TransferHandle {
        tx,
        shutdown: Arc::new(shutdown_tx),
        progress: manager.progress_board(),
    };
    let join = tokio::spawn(manager.run(rx, shutdown_rx));
    (handle, join)
}

impl TransferHandle {
    pub fn submit(&self, action: Action) -> Result<()> {
        self.tx.send(action).map_err(|_| TransferError::ChannelClosed)
    }

    /// Raw access to the action queue, for transports feeding received messages.
    pub fn sender(&self) -> mpsc::UnboundedSender<Action> {
        self.tx.clone()
    }

    pub fn start_download(&self, request: DownloadRequest) -> Result<()> {
        self.submit(Action::StartDownload(request))
    }

    pub fn remove_download(&self, id: u64) -> Result<()> {
        self.submit(Action::RemoveDownload { id })
    }

    pub async fn downloads_progress(&self) -> Result<Vec<FileProgress>> {
        let (tx, rx) = oneshot::channel();
        self.submit(Action::GetDownloadsProgress { reply: Some(tx) })?;
        rx.await.map_err(|_| TransferError::ChannelClosed)
    }

    pub async fn uploads_progress(&self) -> Result<Vec<FileProgress>> {
        let (tx, rx) = oneshot::channel();
        self.submit(Action::GetUploadsProgress { reply: Some(tx) })?;
        rx.await.map_err(|_| TransferError::ChannelClosed)
    }

    /// Last published snapshots, readable without going through the loop.
    pub fn progress_board(&self) -> &ProgressBoard {
        &self.progress
    }

    /// Asks the loop to persist unfinished downloads and stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
