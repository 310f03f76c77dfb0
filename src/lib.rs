pub mod agent;
pub mod block;
pub mod chunk_map;
pub mod config;
pub mod distributor;
pub mod error;
pub mod hash;
pub mod hooks;
pub mod loopback;
pub mod manager;
pub mod peer;
pub mod progress;
pub mod provider;
pub mod rename;
pub mod resume;
pub mod sparse;

pub use agent::{AgentTimings, TransferAgent};
pub use block::{BLOCK_SIZE, CHUNK_SIZE};
pub use chunk_map::ChunkMap;
pub use config::Config;
pub use distributor::{ChunkDistributor, FileTransferStrategy};
pub use error::{Result, TransferError};
pub use hash::{ChunkChecksum, FileHash, PeerId};
pub use hooks::{Collaborators, DownloadStore, FileAttributes, FileIndex, Outbound, StaticFileIndex, Transport};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use manager::{spawn, Action, DownloadRequest, TransferHandle, TransferManager};
pub use progress::{FileProgress, ProgressBoard};
pub use provider::FileProvider;
pub use resume::{JsonResumeStore, SuspendedDownload};

// Re-export commonly used types
pub use bytes;
pub use tokio;
