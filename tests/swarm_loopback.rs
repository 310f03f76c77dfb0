use std::path::{Path, PathBuf};
use std::time::Duration;
use swarm_transfer::config::TransferConfig;
use swarm_transfer::manager::{self, DownloadRequest, TransferHandle, TransferManager};
use swarm_transfer::{
    Collaborators, FileHash, FileTransferStrategy, JsonResumeStore, LoopbackNetwork, PeerId, StaticFileIndex, CHUNK_SIZE,
};
use tempfile::tempdir;
use tokio::task::JoinHandle;

fn settings(root: &Path, node: &str) -> TransferConfig {
    TransferConfig {
        incoming_directory: root.join(node).join("incoming").to_string_lossy().into_owned(),
        resume_directory: root.join(node).join("resume").to_string_lossy().into_owned(),
        strategy: FileTransferStrategy::Random,
        default_tick_ms: 10,
        backoff_base_ms: 10,
        backoff_max_ms: 100,
        // Another leecher cannot vouch for chunks it is still downloading
        checksum_timeout_secs: 1,
        ..TransferConfig::default()
    }
}

fn shared_file(root: &Path, len: usize) -> (PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i * 31 % 253) as u8).collect();
    let path = root.join("shared.iso");
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

fn start_node(network: &LoopbackNetwork, peer: PeerId, collaborators: Collaborators, settings: TransferConfig) -> (TransferHandle, JoinHandle<()>) {
    let (handle, join) = manager::spawn(TransferManager::new(peer, settings, collaborators));
    network.register(peer, handle.sender());
    (handle, join)
}

async fn wait_until_complete(handle: &TransferHandle, id: u64) {
    let result = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let progress = handle.downloads_progress().await.unwrap();
            if progress.iter().any(|p| p.id == id && p.completed) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "download {id} did not complete");
}

fn download(id: u64, hash: FileHash, size: u64) -> DownloadRequest {
    DownloadRequest {
        id,
        name: "copy.iso".to_string(),
        hash,
        size,
        from: None,
        chunk_map: None,
    }
}

#[tokio::test]
async fn test_download_through_tunnels_with_verification() {
    let root = tempdir().unwrap();
    let (path, data) = shared_file(root.path(), 2 * CHUNK_SIZE as usize + 4321);
    let mut files = StaticFileIndex::default();
    let hash = files.add_file(path).unwrap();

    let network = LoopbackNetwork::default();
    let seeder_peer = PeerId::from_index(1);
    let leecher_peer = PeerId::from_index(2);
    let (seeder, seeder_join) = start_node(
        &network,
        seeder_peer,
        Collaborators::new(network.transport(seeder_peer)).with_files(files),
        settings(root.path(), "seeder"),
    );
    let (leecher, leecher_join) = start_node(
        &network,
        leecher_peer,
        Collaborators::new(network.transport(leecher_peer)),
        settings(root.path(), "leecher"),
    );

    leecher.start_download(download(1, hash, data.len() as u64)).unwrap();
    wait_until_complete(&leecher, 1).await;

    let copy = root.path().join("leecher").join("incoming").join("copy.iso");
    assert_eq!(std::fs::read(&copy).unwrap(), data);
    let temp = root.path().join("leecher").join("incoming").join(format!(".{}.swarmpart", hash));
    assert!(!temp.exists());

    let uploads = seeder.uploads_progress().await.unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].current, data.len() as u64);

    leecher.shutdown();
    seeder.shutdown();
    leecher_join.await.unwrap();
    seeder_join.await.unwrap();
}

#[tokio::test]
async fn test_two_leechers_swarm_from_one_seeder() {
    let root = tempdir().unwrap();
    let (path, data) = shared_file(root.path(), 4 * CHUNK_SIZE as usize);
    let mut files = StaticFileIndex::default();
    let hash = files.add_file(path).unwrap();

    let network = LoopbackNetwork::default();
    let seeder_peer = PeerId::from_index(1);
    let (seeder, seeder_join) = start_node(
        &network,
        seeder_peer,
        Collaborators::new(network.transport(seeder_peer)).with_files(files),
        settings(root.path(), "seeder"),
    );
    let mut leechers = Vec::new();
    for index in [2u8, 3] {
        let peer = PeerId::from_index(index);
        leechers.push(start_node(
            &network,
            peer,
            Collaborators::new(network.transport(peer)),
            settings(root.path(), &format!("leecher{index}")),
        ));
    }

    for (handle, _) in &leechers {
        handle.start_download(download(7, hash, data.len() as u64)).unwrap();
    }
    for (handle, _) in &leechers {
        wait_until_complete(handle, 7).await;
    }
    for index in [2u8, 3] {
        let copy = root.path().join(format!("leecher{index}")).join("incoming").join("copy.iso");
        assert_eq!(std::fs::read(&copy).unwrap(), data);
    }

    for (handle, join) in leechers {
        handle.shutdown();
        join.await.unwrap();
    }
    seeder.shutdown();
    seeder_join.await.unwrap();
}

#[tokio::test]
async fn test_suspended_download_resumes_after_restart() {
    let root = tempdir().unwrap();
    let (path, data) = shared_file(root.path(), CHUNK_SIZE as usize + 100);
    let mut files = StaticFileIndex::default();
    let hash = files.add_file(path).unwrap();
    let leecher_settings = settings(root.path(), "leecher");
    let resume_dir = PathBuf::from(&leecher_settings.resume_directory);

    // No source around yet: the download is suspended on shutdown
    let network = LoopbackNetwork::default();
    let leecher_peer = PeerId::from_index(2);
    let (leecher, leecher_join) = start_node(
        &network,
        leecher_peer,
        Collaborators::new(network.transport(leecher_peer)).with_store(JsonResumeStore::new(resume_dir.clone())),
        leecher_settings.clone(),
    );
    leecher.start_download(download(3, hash, data.len() as u64)).unwrap();
    assert_eq!(leecher.downloads_progress().await.unwrap().len(), 1);
    leecher.shutdown();
    leecher_join.await.unwrap();
    network.unregister(&leecher_peer);

    let store = JsonResumeStore::new(resume_dir.clone());
    let suspended = store.load_all().unwrap();
    assert_eq!(suspended.len(), 1);
    assert_eq!(suspended[0].hash, hash);
    assert_eq!(suspended[0].completion_percentage(), 0.0);

    let seeder_peer = PeerId::from_index(1);
    let (seeder, seeder_join) = start_node(
        &network,
        seeder_peer,
        Collaborators::new(network.transport(seeder_peer)).with_files(files),
        settings(root.path(), "seeder"),
    );
    let (leecher, leecher_join) = start_node(
        &network,
        leecher_peer,
        Collaborators::new(network.transport(leecher_peer)).with_store(store),
        leecher_settings,
    );
    let request = DownloadRequest {
        from: Some(seeder_peer),
        ..DownloadRequest::from(suspended[0].clone())
    };
    leecher.start_download(request).unwrap();
    wait_until_complete(&leecher, 3).await;

    let copy = root.path().join("leecher").join("incoming").join("copy.iso");
    assert_eq!(std::fs::read(&copy).unwrap(), data);
    assert!(JsonResumeStore::new(resume_dir).load(3).is_none());

    leecher.shutdown();
    seeder.shutdown();
    leecher_join.await.unwrap();
    seeder_join.await.unwrap();
}
