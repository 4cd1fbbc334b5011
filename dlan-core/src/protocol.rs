//! GUI ↔ core wire protocol: message types and their payloads.

use serde::{Deserialize, Serialize};

use crate::identity::{Credential, Hash, PeerId};

/// Default TCP port a core listens on for GUI connections.
pub const DEFAULT_CORE_PORT: u16 = 59485;

/// Message type tag carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // GUI -> core.
    Authentication,
    Settings,
    ChatMessage,
    Refresh,
    Search,
    Browse,
    Download,
    CancelDownloads,
    MoveDownloads,
    // Core -> GUI.
    AuthenticationResult,
    State,
    EventChatMessage,
    EventLogMessage,
    SearchTag,
    SearchResult,
    BrowseTag,
    BrowseResult,
    /// Tag this build does not know about.
    Unknown(u32),
}

impl MessageType {
    pub fn from_u32(tag: u32) -> Self {
        match tag {
            0x01 => MessageType::Authentication,
            0x02 => MessageType::Settings,
            0x03 => MessageType::ChatMessage,
            0x04 => MessageType::Refresh,
            0x05 => MessageType::Search,
            0x06 => MessageType::Browse,
            0x07 => MessageType::Download,
            0x08 => MessageType::CancelDownloads,
            0x09 => MessageType::MoveDownloads,
            0x81 => MessageType::AuthenticationResult,
            0x82 => MessageType::State,
            0x83 => MessageType::EventChatMessage,
            0x84 => MessageType::EventLogMessage,
            0x85 => MessageType::SearchTag,
            0x86 => MessageType::SearchResult,
            0x87 => MessageType::BrowseTag,
            0x88 => MessageType::BrowseResult,
            other => MessageType::Unknown(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            MessageType::Authentication => 0x01,
            MessageType::Settings => 0x02,
            MessageType::ChatMessage => 0x03,
            MessageType::Refresh => 0x04,
            MessageType::Search => 0x05,
            MessageType::Browse => 0x06,
            MessageType::Download => 0x07,
            MessageType::CancelDownloads => 0x08,
            MessageType::MoveDownloads => 0x09,
            MessageType::AuthenticationResult => 0x81,
            MessageType::State => 0x82,
            MessageType::EventChatMessage => 0x83,
            MessageType::EventLogMessage => 0x84,
            MessageType::SearchTag => 0x85,
            MessageType::SearchResult => 0x86,
            MessageType::BrowseTag => 0x87,
            MessageType::BrowseResult => 0x88,
            MessageType::Unknown(tag) => tag,
        }
    }
}

/// A shared file or directory as described by a core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    /// Path relative to the shared directory, without the name.
    pub path: String,
    pub name: String,
    pub size: u64,
    pub shared_dir: Option<Hash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
}

/// Sent by the GUI right after connecting to a non-local core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authentication {
    pub password: Credential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStatus {
    Ok,
    BadPassword,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationResult {
    pub status: AuthStatus,
}

/// Settings pushed from the GUI to the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreSettings {
    pub nick: String,
    pub shared_directories: Vec<String>,
    pub destination_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventChatMessage {
    pub peer_id: PeerId,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    FatalError,
    Error,
    Warning,
    Debug,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogMessage {
    /// Milliseconds since the Unix epoch.
    pub time_ms: i64,
    pub severity: Severity,
    pub message: String,
}

/// Correlation tag for a search or browse request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub tag: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Search {
    pub terms: String,
}

/// What to browse on a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrowseTarget {
    Roots,
    Entry(Entry),
    Entries { entries: Vec<Entry>, with_roots: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Browse {
    pub peer_id: PeerId,
    pub target: BrowseTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    pub peer_id: PeerId,
    pub entry: Entry,
    pub destination_directory_id: Option<Hash>,
    pub destination_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelDownloads {
    pub ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveDownloads {
    pub id_ref: u64,
    pub ids_to_move: Vec<u64>,
    pub move_before: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub nick: String,
    pub sharing_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub id: u64,
    pub peer_id: PeerId,
    pub entry: Entry,
    pub status: u32,
    pub downloaded_bytes: u64,
}

/// Periodic snapshot of the core's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreState {
    pub our_id: PeerId,
    pub peers: Vec<PeerInfo>,
    pub downloads: Vec<DownloadInfo>,
    pub shared_directories: Vec<String>,
}

/// One peer's answer to a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindResult {
    pub tag: u64,
    pub peer_id: PeerId,
    pub entries: Vec<FoundEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundEntry {
    pub entry: Entry,
    /// Match level, lower is better.
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseResult {
    pub tag: u64,
    pub entries: Vec<Entry>,
}
