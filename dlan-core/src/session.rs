//! Connection to a core: resolve → connect → authenticate → ready, then framed dispatch.
//!
//! Host-driven like the rest of the crate: the host feeds socket and resolver
//! events in and performs the returned [`SessionAction`]s. All inputs must come
//! from a single task, so no two inbound handlers ever run concurrently.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::identity::{Credential, Hash, PeerId};
use crate::protocol::{
    AuthStatus, Authentication, AuthenticationResult, Browse, BrowseResult, BrowseTarget,
    CancelDownloads, ChatMessage, CoreSettings, CoreState, Download, Entry, EventChatMessage,
    EventLogMessage, FindResult, MessageType, MoveDownloads, Search, Severity, Tag,
    DEFAULT_CORE_PORT,
};
use crate::results::{RequestId, RequestKind, ResultRegistry};
use crate::wire::{self, Frame, FrameDecodeError, FrameEncodeError};

/// Default delay before resolving again once every address failed.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    ResolvingHost,
    Connecting,
    Authenticating,
    /// The core refused the credential; the socket may still be open but nothing is
    /// dispatched and no reconnection happens until `connect` is called.
    AuthRejected,
    Ready,
}

/// Identifies one host-name resolution so late results can be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupId(u64);

/// Work for the host to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Resolve `host` after `delay`, then call `on_resolved` / `on_resolve_failed`.
    Resolve {
        lookup: LookupId,
        host: String,
        delay: Duration,
    },
    /// Abort a resolution; its result must not be delivered.
    CancelResolve(LookupId),
    /// About to connect to a loopback address: start the local core if needed.
    StartLocalCore,
    Connect(SocketAddr),
    Send(Vec<u8>),
    /// Close the socket without reporting it back through `on_disconnected`.
    Close,
    Emit(SessionEvent),
}

/// Events for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    StateUpdated(CoreState),
    ChatMessage {
        peer_id: PeerId,
        message: String,
    },
    LogMessage(LogEntry),
    SearchTagged {
        request: RequestId,
        tag: u64,
    },
    SearchResult {
        request: Option<RequestId>,
        result: FindResult,
    },
    BrowseResult {
        request: Option<RequestId>,
        result: BrowseResult,
    },
    Notice(Notice),
}

/// Log entry relayed from the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub time: SystemTime,
    pub severity: Severity,
    pub message: String,
}

/// User-facing status notices. Transport and authentication problems are kept apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ResolveFailed { host: String },
    ConnectFailed,
    BadPassword,
    AuthenticationFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not connected to a core")]
    NotConnected,
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

/// Control connection to a (local or remote) core.
pub struct SessionConnection {
    config: SessionConfig,
    state: SessionState,
    address: String,
    port: u16,
    credential: Credential,
    addresses_to_try: VecDeque<IpAddr>,
    next_lookup: u64,
    current_lookup: Option<LookupId>,
    peer: Option<SocketAddr>,
    our_id: Hash,
    authenticated: bool,
    /// Set by a refused authentication; disables automatic reconnection.
    auth_rejected: bool,
    channel: wire::FramedChannel,
    results: ResultRegistry,
}

impl SessionConnection {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            address: "localhost".to_string(),
            port: DEFAULT_CORE_PORT,
            credential: Credential::none(),
            addresses_to_try: VecDeque::new(),
            next_lookup: 0,
            current_lookup: None,
            peer: None,
            our_id: Hash::default(),
            authenticated: false,
            auth_rejected: false,
            channel: wire::FramedChannel::new(),
            results: ResultRegistry::new(),
        }
    }

    /// Start (or restart) connecting to `address:port`.
    pub fn connect(
        &mut self,
        address: &str,
        port: u16,
        credential: Credential,
    ) -> Vec<SessionAction> {
        self.address = address.to_string();
        self.port = port;
        self.credential = credential;
        self.auth_rejected = false;
        self.addresses_to_try.clear();
        let mut actions = Vec::new();
        if self.peer.is_some() || self.state != SessionState::Disconnected {
            actions.push(SessionAction::Close);
            if self.authenticated {
                actions.push(SessionAction::Emit(SessionEvent::Disconnected));
            }
        }
        self.reset_connection();
        self.start_lookup(Duration::ZERO, &mut actions);
        actions
    }

    /// Connect to the local core on the default port.
    pub fn connect_local(&mut self) -> Vec<SessionAction> {
        self.connect("localhost", DEFAULT_CORE_PORT, Credential::none())
    }

    pub fn on_resolved(&mut self, lookup: LookupId, addresses: Vec<IpAddr>) -> Vec<SessionAction> {
        if self.current_lookup != Some(lookup) {
            debug!(?lookup, "ignoring stale host lookup");
            return Vec::new();
        }
        self.current_lookup = None;
        let mut actions = Vec::new();
        if addresses.is_empty() {
            self.fail_resolution(&mut actions);
            return actions;
        }
        self.addresses_to_try = addresses.into();
        self.try_next_address(&mut actions);
        actions
    }

    pub fn on_resolve_failed(
        &mut self,
        lookup: LookupId,
        error: &std::io::Error,
    ) -> Vec<SessionAction> {
        if self.current_lookup != Some(lookup) {
            return Vec::new();
        }
        self.current_lookup = None;
        debug!(%error, host = %self.address, "host lookup failed");
        let mut actions = Vec::new();
        self.fail_resolution(&mut actions);
        actions
    }

    /// The socket reached connected state with `peer`.
    pub fn on_connected(&mut self, peer: SocketAddr) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.state != SessionState::Connecting {
            return actions;
        }
        self.peer = Some(peer);
        self.addresses_to_try.clear();
        if peer.ip().is_loopback() {
            self.authenticated = true;
            self.state = SessionState::Ready;
            info!("connected to the core");
            debug!(%peer, "core address");
            actions.push(SessionAction::Emit(SessionEvent::Connected));
        } else {
            self.state = SessionState::Authenticating;
            let auth = Authentication {
                password: self.credential.clone(),
            };
            match self.frame(MessageType::Authentication, Some(&auth)) {
                Ok(bytes) => actions.push(SessionAction::Send(bytes)),
                Err(e) => warn!(error = %e, "unable to encode authentication"),
            }
        }
        actions
    }

    /// A connection attempt failed before the socket connected.
    pub fn on_connect_failed(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.state != SessionState::Connecting {
            return actions;
        }
        self.on_unconnected(&mut actions);
        actions
    }

    /// An established socket closed.
    pub fn on_disconnected(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.peer.is_none() {
            return actions;
        }
        let was_authenticated = self.authenticated;
        self.reset_connection();
        if was_authenticated {
            actions.push(SessionAction::Emit(SessionEvent::Disconnected));
        }
        self.on_unconnected(&mut actions);
        actions
    }

    /// Bytes arrived on the socket.
    pub fn on_data(&mut self, bytes: &[u8]) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.peer.is_none() || bytes.is_empty() {
            return actions;
        }
        self.channel.feed(bytes);
        loop {
            match self.channel.try_decode_next() {
                Ok(Some(frame)) => {
                    self.our_id = frame.header.sender_id;
                    debug!(
                        message_type = ?frame.header.message_type,
                        size = frame.header.payload_size,
                        "data received"
                    );
                    if let Err(e) = self.read_message(&frame, &mut actions) {
                        warn!(
                            error = %e,
                            message_type = ?frame.header.message_type,
                            "unable to read message"
                        );
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stream out of sync, closing connection");
                    actions.push(SessionAction::Close);
                    let was_authenticated = self.authenticated;
                    self.reset_connection();
                    if was_authenticated {
                        actions.push(SessionAction::Emit(SessionEvent::Disconnected));
                    }
                    self.on_unconnected(&mut actions);
                    break;
                }
            }
        }
        actions
    }

    /// Build a frame for `kind` with our sender ID. Requires an open socket.
    pub fn send_command<T: Serialize>(
        &self,
        kind: MessageType,
        payload: Option<&T>,
    ) -> Result<Vec<u8>, SessionError> {
        if self.peer.is_none() {
            return Err(SessionError::NotConnected);
        }
        Ok(self.frame(kind, payload)?)
    }

    pub fn send_chat_message(&self, message: &str) -> Result<Vec<u8>, SessionError> {
        let msg = ChatMessage {
            message: message.to_string(),
        };
        self.send_command(MessageType::ChatMessage, Some(&msg))
    }

    pub fn set_core_settings(&self, settings: &CoreSettings) -> Result<Vec<u8>, SessionError> {
        self.send_command(MessageType::Settings, Some(settings))
    }

    /// Send a search; results arrive as `SearchTagged` then `SearchResult` events.
    pub fn search(&mut self, terms: &str) -> Result<(RequestId, Vec<u8>), SessionError> {
        let msg = Search {
            terms: terms.to_string(),
        };
        let bytes = self.send_command(MessageType::Search, Some(&msg))?;
        Ok((self.results.register(RequestKind::Search), bytes))
    }

    /// Browse a peer. The request is released after its result is delivered.
    pub fn browse(
        &mut self,
        peer_id: PeerId,
        target: BrowseTarget,
    ) -> Result<(RequestId, Vec<u8>), SessionError> {
        let msg = Browse { peer_id, target };
        let bytes = self.send_command(MessageType::Browse, Some(&msg))?;
        Ok((self.results.register(RequestKind::Browse), bytes))
    }

    /// Stop tracking a search or browse request.
    pub fn release(&mut self, request: RequestId) -> bool {
        self.results.release(request)
    }

    pub fn download(
        &self,
        peer_id: PeerId,
        entry: Entry,
        destination: Option<(Hash, String)>,
    ) -> Result<Vec<u8>, SessionError> {
        let (destination_directory_id, destination_path) = match destination {
            Some((dir, path)) => (Some(dir), Some(path)),
            None => (None, None),
        };
        let msg = Download {
            peer_id,
            entry,
            destination_directory_id,
            destination_path,
        };
        self.send_command(MessageType::Download, Some(&msg))
    }

    pub fn cancel_downloads(&self, ids: &[u64]) -> Result<Vec<u8>, SessionError> {
        let msg = CancelDownloads { ids: ids.to_vec() };
        self.send_command(MessageType::CancelDownloads, Some(&msg))
    }

    /// Move `ids` before (or after) the download `id_ref` in the queue.
    pub fn move_downloads(
        &self,
        id_ref: u64,
        ids: &[u64],
        move_before: bool,
    ) -> Result<Vec<u8>, SessionError> {
        let msg = MoveDownloads {
            id_ref,
            ids_to_move: ids.to_vec(),
            move_before,
        };
        self.send_command(MessageType::MoveDownloads, Some(&msg))
    }

    pub fn refresh(&self) -> Result<Vec<u8>, SessionError> {
        self.send_command::<()>(MessageType::Refresh, None)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Socket connected (authenticated or not).
    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The connected core runs on this machine.
    pub fn is_local(&self) -> bool {
        self.peer.map(|p| p.ip().is_loopback()).unwrap_or(false)
    }

    /// Our ID as announced by the core in its headers.
    pub fn our_id(&self) -> Hash {
        self.our_id
    }

    pub fn results(&self) -> &ResultRegistry {
        &self.results
    }

    fn frame<T: Serialize>(
        &self,
        kind: MessageType,
        payload: Option<&T>,
    ) -> Result<Vec<u8>, FrameEncodeError> {
        debug!(message_type = ?kind, "send");
        wire::encode_frame(kind, self.our_id, payload)
    }

    fn start_lookup(&mut self, delay: Duration, actions: &mut Vec<SessionAction>) {
        if let Some(old) = self.current_lookup.take() {
            actions.push(SessionAction::CancelResolve(old));
        }
        self.next_lookup += 1;
        let lookup = LookupId(self.next_lookup);
        self.current_lookup = Some(lookup);
        self.state = SessionState::ResolvingHost;
        actions.push(SessionAction::Resolve {
            lookup,
            host: self.address.clone(),
            delay,
        });
    }

    fn fail_resolution(&mut self, actions: &mut Vec<SessionAction>) {
        info!(host = %self.address, "unable to resolve the address");
        self.state = SessionState::Disconnected;
        actions.push(SessionAction::Emit(SessionEvent::Notice(
            Notice::ResolveFailed {
                host: self.address.clone(),
            },
        )));
    }

    /// Prefer IPv4; otherwise take the first remaining address.
    fn try_next_address(&mut self, actions: &mut Vec<SessionAction>) {
        let index = self
            .addresses_to_try
            .iter()
            .position(|a| a.is_ipv4())
            .unwrap_or(0);
        let Some(address) = self.addresses_to_try.remove(index) else {
            return;
        };
        if address.is_loopback() {
            actions.push(SessionAction::StartLocalCore);
        }
        self.state = SessionState::Connecting;
        debug!(%address, port = self.port, "connecting");
        actions.push(SessionAction::Connect(SocketAddr::new(address, self.port)));
    }

    fn on_unconnected(&mut self, actions: &mut Vec<SessionAction>) {
        self.state = SessionState::Disconnected;
        if self.auth_rejected {
            return;
        }
        if !self.addresses_to_try.is_empty() {
            self.try_next_address(actions);
        } else {
            info!("unable to connect to the core");
            actions.push(SessionAction::Emit(SessionEvent::Notice(Notice::ConnectFailed)));
            self.start_lookup(self.config.retry_delay, actions);
        }
    }

    fn reset_connection(&mut self) {
        self.peer = None;
        self.authenticated = false;
        self.channel.reset();
        self.results.clear();
        self.state = SessionState::Disconnected;
    }

    fn read_message(
        &mut self,
        frame: &Frame,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), FrameDecodeError> {
        let kind = frame.header.message_type;
        if kind == MessageType::AuthenticationResult {
            let result: AuthenticationResult = frame.decode()?;
            self.on_authentication_result(result.status, actions);
            return Ok(());
        }
        if !self.authenticated {
            debug!(message_type = ?kind, "dropping message received before authentication");
            return Ok(());
        }
        match kind {
            MessageType::State => {
                let state: CoreState = frame.decode()?;
                actions.push(SessionAction::Emit(SessionEvent::StateUpdated(state)));
            }
            MessageType::EventChatMessage => {
                let msg: EventChatMessage = frame.decode()?;
                actions.push(SessionAction::Emit(SessionEvent::ChatMessage {
                    peer_id: msg.peer_id,
                    message: msg.message,
                }));
            }
            MessageType::EventLogMessage => {
                let msg: EventLogMessage = frame.decode()?;
                actions.push(SessionAction::Emit(SessionEvent::LogMessage(LogEntry {
                    time: time_from_millis(msg.time_ms),
                    severity: msg.severity,
                    message: msg.message,
                })));
            }
            MessageType::SearchTag => {
                let tag: Tag = frame.decode()?;
                if let Some(request) = self.results.attach_tag(RequestKind::Search, tag.tag) {
                    actions.push(SessionAction::Emit(SessionEvent::SearchTagged {
                        request,
                        tag: tag.tag,
                    }));
                }
            }
            MessageType::SearchResult => {
                let result: FindResult = frame.decode()?;
                let request = self.results.request_for(RequestKind::Search, result.tag);
                actions.push(SessionAction::Emit(SessionEvent::SearchResult { request, result }));
            }
            MessageType::BrowseTag => {
                let tag: Tag = frame.decode()?;
                self.results.attach_tag(RequestKind::Browse, tag.tag);
            }
            MessageType::BrowseResult => {
                let result: BrowseResult = frame.decode()?;
                let request = self.results.request_for(RequestKind::Browse, result.tag);
                if let Some(id) = request {
                    self.results.release(id);
                }
                actions.push(SessionAction::Emit(SessionEvent::BrowseResult { request, result }));
            }
            other => {
                warn!(message_type = ?other, "message not understood");
            }
        }
        Ok(())
    }

    fn on_authentication_result(&mut self, status: AuthStatus, actions: &mut Vec<SessionAction>) {
        if self.authenticated {
            return;
        }
        match status {
            AuthStatus::Ok => {
                self.authenticated = true;
                self.state = SessionState::Ready;
                info!("connected to the core");
                actions.push(SessionAction::Emit(SessionEvent::Connected));
            }
            AuthStatus::BadPassword => {
                info!("authentication failed, bad password");
                self.auth_rejected = true;
                self.state = SessionState::AuthRejected;
                actions.push(SessionAction::Emit(SessionEvent::Notice(Notice::BadPassword)));
            }
            AuthStatus::Error => {
                info!("authentication failed");
                self.auth_rejected = true;
                self.state = SessionState::AuthRejected;
                actions.push(SessionAction::Emit(SessionEvent::Notice(
                    Notice::AuthenticationFailed,
                )));
            }
        }
    }
}

impl Default for SessionConnection {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

fn time_from_millis(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}
