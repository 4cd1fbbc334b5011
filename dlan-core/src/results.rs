//! Search/browse request registry: FIFO tag correlation and request lifetimes.
//!
//! The core answers every search or browse request with a tag message and then
//! with result messages carrying that tag. Tags are matched to requests purely by
//! order: the oldest request still waiting for a tag gets the next tag of its kind.
//! If a core ever reordered tag replies, results would be attached to the wrong
//! request; nothing on the wire allows detecting it.

use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Handle to a search or browse request issued on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Search,
    Browse,
}

#[derive(Debug)]
struct PendingRequest {
    tag: Option<u64>,
    /// Released by its owner before the tag arrived.
    released: bool,
}

/// Arena of outstanding requests keyed by [`RequestId`].
#[derive(Debug, Default)]
pub struct ResultRegistry {
    next_id: u64,
    requests: HashMap<RequestId, PendingRequest>,
    untagged_searches: VecDeque<RequestId>,
    untagged_browses: VecDeque<RequestId>,
    by_tag: HashMap<(RequestKind, u64), RequestId>,
}

impl ResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request that was just sent; it waits for a tag.
    pub fn register(&mut self, kind: RequestKind) -> RequestId {
        self.next_id += 1;
        let id = RequestId(self.next_id);
        self.requests.insert(
            id,
            PendingRequest {
                tag: None,
                released: false,
            },
        );
        self.queue_mut(kind).push_back(id);
        id
    }

    /// Attach a tag to the oldest untagged request of `kind`. Returns `None` when
    /// nothing is waiting or the oldest request was already released.
    pub fn attach_tag(&mut self, kind: RequestKind, tag: u64) -> Option<RequestId> {
        let id = self.queue_mut(kind).pop_front()?;
        let pending = self.requests.get_mut(&id)?;
        if pending.released {
            self.requests.remove(&id);
            return None;
        }
        pending.tag = Some(tag);
        self.by_tag.insert((kind, tag), id);
        Some(id)
    }

    /// Request a result with this tag belongs to.
    pub fn request_for(&self, kind: RequestKind, tag: u64) -> Option<RequestId> {
        self.by_tag.get(&(kind, tag)).copied()
    }

    pub fn tag_of(&self, id: RequestId) -> Option<u64> {
        self.requests.get(&id).and_then(|p| p.tag)
    }

    /// Drop a request. An untagged request stays queued (released) so later
    /// requests keep their place in the tag order. Returns false if unknown.
    pub fn release(&mut self, id: RequestId) -> bool {
        let Some(pending) = self.requests.get_mut(&id) else {
            return false;
        };
        if pending.released {
            return false;
        }
        match pending.tag {
            None => {
                pending.released = true;
            }
            Some(tag) => {
                self.by_tag.retain(|&(_, t), r| !(t == tag && *r == id));
                self.requests.remove(&id);
            }
        }
        true
    }

    /// Requests still waiting for a tag, released ones included.
    pub fn untagged(&self, kind: RequestKind) -> usize {
        match kind {
            RequestKind::Search => self.untagged_searches.len(),
            RequestKind::Browse => self.untagged_browses.len(),
        }
    }

    /// Live (not released) requests.
    pub fn len(&self) -> usize {
        self.requests.values().filter(|p| !p.released).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything (connection reset: the core forgets its tags too).
    pub fn clear(&mut self) {
        self.requests.clear();
        self.untagged_searches.clear();
        self.untagged_browses.clear();
        self.by_tag.clear();
    }

    fn queue_mut(&mut self, kind: RequestKind) -> &mut VecDeque<RequestId> {
        match kind {
            RequestKind::Search => &mut self.untagged_searches,
            RequestKind::Browse => &mut self.untagged_browses,
        }
    }
}
