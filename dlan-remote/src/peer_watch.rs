//! Periodic source-peer lookup for downloads whose peer is unknown.

use std::sync::Arc;

use dlan_core::{Download, PeerLookup};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Retry the source peer lookup until it is found or the download is removed.
/// Returns immediately if the download already has its peer.
///
/// The watch ends once the peer is found. If the peer is lost later (`valid_peer()`
/// returns `None` and `peer_retry()` is `Some` again), the owner spawns a new watch.
pub fn watch_peer(download: Arc<Mutex<Download>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = {
                let d = download.lock().await;
                if d.is_removed() {
                    return;
                }
                d.peer_retry()
            };
            let Some(delay) = delay else { return };
            tokio::time::sleep(delay).await;
            let mut d = download.lock().await;
            match d.retrieve_peer() {
                PeerLookup::RetryIn(_) => {}
                PeerLookup::Found | PeerLookup::Removed => {
                    debug!(download = %d.id(), status = ?d.status(), "peer watch done");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use dlan_core::protocol::{Entry, EntryKind};
    use dlan_core::{Hash, PeerDirectory, PeerHandle, PeerId, Status};

    type Online = Arc<StdMutex<HashSet<PeerId>>>;

    /// Alive while its ID is in the directory's online set.
    struct Peer {
        id: PeerId,
        online: Online,
    }

    impl PeerHandle for Peer {
        fn id(&self) -> PeerId {
            self.id
        }
        fn is_alive(&self) -> bool {
            self.online.lock().unwrap().contains(&self.id)
        }
    }

    #[derive(Default)]
    struct Directory {
        online: Online,
        lookups: AtomicUsize,
    }

    impl PeerDirectory for Directory {
        fn resolve(&self, peer_id: &PeerId) -> Option<Arc<dyn PeerHandle>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.online.lock().unwrap().contains(peer_id) {
                Some(Arc::new(Peer {
                    id: *peer_id,
                    online: self.online.clone(),
                }))
            } else {
                None
            }
        }
    }

    fn entry() -> Entry {
        Entry {
            kind: EntryKind::File,
            path: "/music/".into(),
            name: "track.flac".into(),
            size: 30_000_000,
            shared_dir: Some(Hash::random()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_peer_appears() {
        let dir = Arc::new(Directory::default());
        let peer = Hash::random();
        let download = Download::with_retry_interval(
            dir.clone(),
            peer,
            entry(),
            Duration::from_secs(10),
        );
        assert_eq!(download.status(), Status::UnknownPeer);
        let download = Arc::new(Mutex::new(download));
        let watch = watch_peer(download.clone());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(dir.lookups.load(Ordering::SeqCst), 4);
        assert_eq!(download.lock().await.status(), Status::UnknownPeer);
        assert!(!watch.is_finished());

        dir.online.lock().unwrap().insert(peer);
        tokio::time::timeout(Duration::from_secs(11), watch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(download.lock().await.status(), Status::Queued);
        assert_eq!(dir.lookups.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_stops_watch() {
        let dir = Arc::new(Directory::default());
        let download = Arc::new(Mutex::new(Download::with_retry_interval(
            dir.clone(),
            Hash::random(),
            entry(),
            Duration::from_secs(10),
        )));
        let watch = watch_peer(download.clone());
        tokio::time::sleep(Duration::from_secs(15)).await;
        download.lock().await.remove();
        tokio::time::timeout(Duration::from_secs(11), watch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(download.lock().await.status(), Status::Deleted);
        // Initial lookup plus the one at 10s; the one at 20s saw the removal.
        assert_eq!(dir.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn known_peer_needs_no_watch() {
        let dir = Arc::new(Directory::default());
        let peer = Hash::random();
        dir.online.lock().unwrap().insert(peer);
        let download = Arc::new(Mutex::new(Download::new(dir, peer, entry())));
        watch_peer(download.clone()).await.unwrap();
        assert_eq!(download.lock().await.status(), Status::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_peer_is_watched_again() {
        let dir = Arc::new(Directory::default());
        let peer = Hash::random();
        dir.online.lock().unwrap().insert(peer);
        let download = Arc::new(Mutex::new(Download::with_retry_interval(
            dir.clone(),
            peer,
            entry(),
            Duration::from_secs(10),
        )));
        watch_peer(download.clone()).await.unwrap();

        dir.online.lock().unwrap().remove(&peer);
        {
            let mut d = download.lock().await;
            assert!(d.valid_peer().is_none());
            assert_eq!(d.status(), Status::UnknownPeer);
            assert!(d.peer_retry().is_some());
        }
        let watch = watch_peer(download.clone());
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!watch.is_finished());

        dir.online.lock().unwrap().insert(peer);
        tokio::time::timeout(Duration::from_secs(11), watch)
            .await
            .unwrap()
            .unwrap();
        let mut d = download.lock().await;
        assert_eq!(d.status(), Status::Queued);
        assert!(d.valid_peer().is_some());
    }
}
