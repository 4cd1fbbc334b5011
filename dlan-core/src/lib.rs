//! D-LAN control plane.
//! Host-driven: no socket I/O; host passes events and performs the returned actions.

pub mod download;
pub mod identity;
pub mod pool;
pub mod protocol;
pub mod results;
pub mod session;
pub mod wire;

pub use download::{Download, DownloadId, PeerDirectory, PeerHandle, PeerLookup, Status};
pub use identity::{Credential, Hash, PeerId};
pub use pool::{PoolError, Runnable, WorkerContext, WorkerId, WorkerPool};
pub use protocol::{MessageType, DEFAULT_CORE_PORT};
pub use results::{RequestId, RequestKind};
pub use session::{
    LookupId, Notice, SessionAction, SessionConfig, SessionConnection, SessionError,
    SessionEvent, SessionState,
};
pub use wire::{encode_frame, Frame, FrameDecodeError, FrameEncodeError, FramedChannel};
