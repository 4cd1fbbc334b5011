//! Download lifecycle: identity, source peer binding, queue persistence.
//!
//! A download is bound to the peer it was queued from. While that peer cannot be
//! resolved to a live handle the download sits in [`Status::UnknownPeer`] and the
//! host retries the lookup every [`Download::retry_interval`]. It is never dropped
//! because its peer is gone.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::PeerId;
use crate::protocol::Entry;

/// Period between two lookups of an unreachable source peer.
pub const CHECK_DEAD_PEER_PERIOD: Duration = Duration::from_secs(10);

/// Process-wide identity counter. Identities are never reused, even after removal.
static NEXT_DOWNLOAD_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DownloadId(u32);

impl DownloadId {
    fn next() -> Self {
        DownloadId(NEXT_DOWNLOAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Queued,
    Downloading,
    Paused,
    Complete,
    /// The source peer is unknown or not alive.
    UnknownPeer,
    Deleted,
}

/// A connected peer as seen by the peer directory. May die at any time.
pub trait PeerHandle: Send + Sync {
    fn id(&self) -> PeerId;
    fn is_alive(&self) -> bool;
}

/// Maps a peer ID to a live handle.
pub trait PeerDirectory: Send + Sync {
    fn resolve(&self, peer_id: &PeerId) -> Option<Arc<dyn PeerHandle>>;
}

/// Outcome of a source peer lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLookup {
    Found,
    RetryIn(Duration),
    /// The download was removed; no lookup was made.
    Removed,
}

/// Persistent form of a queued download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: u32,
    pub peer_id: PeerId,
    pub entry: Entry,
    pub complete: bool,
}

/// Serialize a download queue for the queue store.
pub fn encode_queue(entries: &[QueueEntry]) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(entries)
}

pub fn decode_queue(bytes: &[u8]) -> Result<Vec<QueueEntry>, bincode::Error> {
    bincode::deserialize(bytes)
}

/// Control-plane state of one download.
pub struct Download {
    id: DownloadId,
    directory: Arc<dyn PeerDirectory>,
    peer_source_id: PeerId,
    peer_source: Option<Arc<dyn PeerHandle>>,
    entry: Entry,
    status: Status,
    /// Status to restore once the source peer is back.
    status_before_unknown_peer: Status,
    retry_interval: Duration,
}

impl Download {
    /// New queued download; looks its source peer up immediately.
    pub fn new(directory: Arc<dyn PeerDirectory>, peer_source_id: PeerId, entry: Entry) -> Self {
        Self::with_retry_interval(directory, peer_source_id, entry, CHECK_DEAD_PEER_PERIOD)
    }

    pub fn with_retry_interval(
        directory: Arc<dyn PeerDirectory>,
        peer_source_id: PeerId,
        entry: Entry,
        retry_interval: Duration,
    ) -> Self {
        let mut download = Self {
            id: DownloadId::next(),
            directory,
            peer_source_id,
            peer_source: None,
            entry,
            status: Status::Queued,
            status_before_unknown_peer: Status::Queued,
            retry_interval,
        };
        download.retrieve_peer();
        download
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn peer_source_id(&self) -> PeerId {
        self.peer_source_id
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Download progress in percent. Data transfer is not tracked here.
    pub fn progress(&self) -> u8 {
        if self.status == Status::Complete {
            100
        } else {
            0
        }
    }

    /// Ask the directory for the source peer again.
    pub fn retrieve_peer(&mut self) -> PeerLookup {
        if self.status == Status::Deleted {
            return PeerLookup::Removed;
        }
        self.peer_source = self.directory.resolve(&self.peer_source_id);
        if self.has_valid_peer() {
            if self.status == Status::UnknownPeer {
                self.status = self.status_before_unknown_peer;
                debug!(download = %self.id, peer = %self.peer_source_id, "source peer is back");
            }
            PeerLookup::Found
        } else {
            debug!(download = %self.id, peer = %self.peer_source_id, "unable to retrieve the peer");
            self.peer_source = None;
            self.mark_unknown_peer();
            PeerLookup::RetryIn(self.retry_interval)
        }
    }

    /// Delay before the next lookup is due, if one is.
    pub fn peer_retry(&self) -> Option<Duration> {
        if self.status == Status::UnknownPeer {
            Some(self.retry_interval)
        } else {
            None
        }
    }

    pub fn has_valid_peer(&self) -> bool {
        self.peer_source
            .as_ref()
            .map(|p| p.is_alive())
            .unwrap_or(false)
    }

    /// Source peer handle, checked for liveness. A dead handle is dropped and the
    /// directory is asked again; if the peer is still gone the download goes back to
    /// [`Status::UnknownPeer`] and the owner must schedule retries (`peer_retry()`).
    pub fn valid_peer(&mut self) -> Option<Arc<dyn PeerHandle>> {
        if self.has_valid_peer() {
            return self.peer_source.clone();
        }
        match self.retrieve_peer() {
            PeerLookup::Found => self.peer_source.clone(),
            PeerLookup::RetryIn(_) | PeerLookup::Removed => None,
        }
    }

    /// Operational status change from the download manager.
    pub fn set_status(&mut self, status: Status) {
        if self.status == Status::Deleted {
            return;
        }
        if self.status == Status::UnknownPeer && status != Status::Deleted {
            self.status_before_unknown_peer = status;
            return;
        }
        self.status = status;
    }

    pub fn populate_entry(&self) -> QueueEntry {
        QueueEntry {
            id: self.id.0,
            peer_id: self.peer_source_id,
            entry: self.entry.clone(),
            complete: self.status == Status::Complete,
        }
    }

    /// Mark for deletion; the owner drops it. No further peer lookups happen.
    pub fn remove(&mut self) {
        self.status = Status::Deleted;
        self.peer_source = None;
    }

    pub fn is_removed(&self) -> bool {
        self.status == Status::Deleted
    }

    fn mark_unknown_peer(&mut self) {
        if self.status != Status::UnknownPeer {
            self.status_before_unknown_peer = self.status;
            self.status = Status::UnknownPeer;
        }
    }
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("id", &self.id)
            .field("peer_source_id", &self.peer_source_id)
            .field("status", &self.status)
            .field("entry", &self.entry.name)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{PeerDirectory, PeerHandle};
    use crate::identity::PeerId;

    pub struct FakePeer {
        pub id: PeerId,
        pub alive: AtomicBool,
    }

    impl PeerHandle for FakePeer {
        fn id(&self) -> PeerId {
            self.id
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    pub struct FakeDirectory {
        pub peers: Mutex<HashMap<PeerId, Arc<FakePeer>>>,
        pub lookups: AtomicUsize,
    }

    impl FakeDirectory {
        pub fn add(&self, id: PeerId) -> Arc<FakePeer> {
            let peer = Arc::new(FakePeer {
                id,
                alive: AtomicBool::new(true),
            });
            self.peers.lock().unwrap().insert(id, peer.clone());
            peer
        }
    }

    impl PeerDirectory for FakeDirectory {
        fn resolve(&self, peer_id: &PeerId) -> Option<Arc<dyn PeerHandle>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let peers = self.peers.lock().unwrap();
            peers
                .get(peer_id)
                .map(|p| p.clone() as Arc<dyn PeerHandle>)
        }
    }
}
