//! In-process network: every node's outgoing messages are turned into
//! actions on the receiving node's queue.

use crate::hash::{FileHash, PeerId};
use crate::hooks::{Outbound, Transport};
use crate::manager::Action;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// What `to` has to do with a message `from` sent it.
pub fn into_action(from: PeerId, message: Outbound) -> Action {
    match message {
        Outbound::ChunkMapRequest { hash, leecher_side } => Action::ReceiveChunkMapRequest {
            peer: from,
            hash,
            leecher_side,
        },
        Outbound::ChunkMap { hash, words } => Action::ReceiveChunkMap { peer: from, hash, words },
        Outbound::DataRequest { hash, offset, size, .. } => Action::ReceiveDataRequest {
            peer: from,
            hash,
            offset,
            size,
        },
        Outbound::Data { hash, offset, data, .. } => Action::ReceiveData {
            peer: from,
            hash,
            offset,
            data,
        },
        Outbound::ChecksumRequest { hash, chunk } => Action::ReceiveChecksumRequest { peer: from, hash, chunk },
        Outbound::Checksum { hash, chunk, checksum } => Action::ReceiveChecksum {
            peer: from,
            hash,
            chunk,
            checksum,
        },
    }
}

/// Registry of the nodes reachable from each other.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    nodes: Arc<Mutex<BTreeMap<PeerId, UnboundedSender<Action>>>>,
}

impl LoopbackNetwork {
    pub fn register(&self, peer: PeerId, actions: UnboundedSender<Action>) {
        self.nodes().insert(peer, actions);
    }

    pub fn unregister(&self, peer: &PeerId) {
        self.nodes().remove(peer);
    }

    pub fn transport(&self, own: PeerId) -> LoopbackTransport {
        LoopbackTransport {
            own,
            network: self.clone(),
        }
    }

    fn nodes(&self) -> MutexGuard<'_, BTreeMap<PeerId, UnboundedSender<Action>>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, to: &PeerId, action: Action) {
        let nodes = self.nodes();
        match nodes.get(to) {
            Some(actions) => {
                if actions.send(action).is_err() {
                    debug!(peer = %to, "node stopped, dropping message");
                }
            }
            None => warn!(peer = %to, "unknown peer, dropping message"),
        }
    }
}

/// The [`Transport`] of one node on a [`LoopbackNetwork`].
///
/// Activating tunnels for a hash announces every other node as a source.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    own: PeerId,
    network: LoopbackNetwork,
}

impl Transport for LoopbackTransport {
    fn send(&self, peer: &PeerId, message: Outbound) {
        self.network.deliver(peer, into_action(self.own, message));
    }

    fn activate_tunnels(&self, hash: &FileHash) {
        let others: Vec<PeerId> = self.network.nodes().keys().filter(|peer| **peer != self.own).copied().collect();
        debug!(%hash, sources = others.len(), "tunnels activated");
        for peer in others {
            self.network.deliver(&self.own, Action::AddPeer { hash: *hash, peer });
        }
    }

    fn deactivate_tunnels(&self, hash: &FileHash) {
        debug!(%hash, "tunnels deactivated");
    }
}
