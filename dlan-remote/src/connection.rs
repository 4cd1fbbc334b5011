//! Session driver: one reactor task owns the `SessionConnection` and performs its actions
//! over tokio (host lookup, TCP connect, read loop, writes).

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use dlan_core::protocol::{BrowseTarget, CoreSettings, Entry};
use dlan_core::{
    Credential, Hash, LookupId, PeerId, RequestId, SessionAction, SessionConfig,
    SessionConnection, SessionError, SessionEvent,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::launcher::LocalCoreLauncher;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Requests from the application to the session.
#[derive(Debug)]
pub enum Command {
    Connect {
        address: String,
        port: u16,
        credential: Credential,
    },
    Search {
        terms: String,
        reply: oneshot::Sender<Result<RequestId, SessionError>>,
    },
    Browse {
        peer_id: PeerId,
        target: BrowseTarget,
        reply: oneshot::Sender<Result<RequestId, SessionError>>,
    },
    Release(RequestId),
    Download {
        peer_id: PeerId,
        entry: Entry,
        destination: Option<(Hash, String)>,
    },
    CancelDownloads(Vec<u64>),
    MoveDownloads {
        id_ref: u64,
        ids: Vec<u64>,
        move_before: bool,
    },
    Chat(String),
    Settings(CoreSettings),
    Refresh,
}

/// Application side of a running session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Returns false once the reactor has stopped.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn connect(&self, address: &str, port: u16, credential: Credential) -> bool {
        self.send(Command::Connect {
            address: address.to_string(),
            port,
            credential,
        })
    }

    pub async fn search(&self, terms: &str) -> Option<Result<RequestId, SessionError>> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::Search {
            terms: terms.to_string(),
            reply,
        }) {
            return None;
        }
        rx.await.ok()
    }

    pub async fn browse(
        &self,
        peer_id: PeerId,
        target: BrowseTarget,
    ) -> Option<Result<RequestId, SessionError>> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::Browse {
            peer_id,
            target,
            reply,
        }) {
            return None;
        }
        rx.await.ok()
    }

    /// Stop the reactor and close the connection.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

/// Socket and resolver completions, tagged so stale ones can be dropped.
enum Io {
    Resolved {
        lookup: LookupId,
        result: io::Result<Vec<IpAddr>>,
    },
    Connected {
        attempt: u64,
        stream: TcpStream,
    },
    ConnectFailed {
        attempt: u64,
        error: io::Error,
    },
    Data {
        attempt: u64,
        bytes: Vec<u8>,
    },
    Closed {
        attempt: u64,
    },
}

/// Spawn the reactor. Nothing happens until a `Connect` command is sent.
pub fn spawn_session(
    config: SessionConfig,
    connect_timeout: Duration,
    launcher: LocalCoreLauncher,
) -> SessionHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (io_tx, io_rx) = mpsc::unbounded_channel();
    let reactor = Reactor::new(config, connect_timeout, launcher, io_tx, events_tx);
    let task = tokio::spawn(reactor.run(commands_rx, io_rx));
    SessionHandle {
        commands: commands_tx,
        events: events_rx,
        task,
    }
}

struct Reactor {
    session: SessionConnection,
    launcher: LocalCoreLauncher,
    connect_timeout: Duration,
    io_tx: mpsc::UnboundedSender<Io>,
    events: mpsc::UnboundedSender<SessionEvent>,
    lookup_task: Option<(LookupId, JoinHandle<()>)>,
    connect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    writer: Option<OwnedWriteHalf>,
    /// Incremented on every close; socket events of older attempts are ignored.
    attempt: u64,
}

impl Reactor {
    fn new(
        config: SessionConfig,
        connect_timeout: Duration,
        launcher: LocalCoreLauncher,
        io_tx: mpsc::UnboundedSender<Io>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            session: SessionConnection::new(config),
            launcher,
            connect_timeout,
            io_tx,
            events,
            lookup_task: None,
            connect_task: None,
            reader_task: None,
            writer: None,
            attempt: 0,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut io_rx: mpsc::UnboundedReceiver<Io>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.on_command(command).await;
                }
                Some(io) = io_rx.recv() => {
                    self.on_io(io).await;
                }
            }
        }
        self.close();
        if let Some((_, task)) = self.lookup_task.take() {
            task.abort();
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                address,
                port,
                credential,
            } => {
                let actions = self.session.connect(&address, port, credential);
                self.apply(actions).await;
            }
            Command::Search { terms, reply } => {
                let result = match self.session.search(&terms) {
                    Ok((id, bytes)) => {
                        self.write(&bytes).await;
                        Ok(id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Browse {
                peer_id,
                target,
                reply,
            } => {
                let result = match self.session.browse(peer_id, target) {
                    Ok((id, bytes)) => {
                        self.write(&bytes).await;
                        Ok(id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Release(id) => {
                self.session.release(id);
            }
            Command::Download {
                peer_id,
                entry,
                destination,
            } => {
                let frame = self.session.download(peer_id, entry, destination);
                self.write_command(frame).await;
            }
            Command::CancelDownloads(ids) => {
                let frame = self.session.cancel_downloads(&ids);
                self.write_command(frame).await;
            }
            Command::MoveDownloads {
                id_ref,
                ids,
                move_before,
            } => {
                let frame = self.session.move_downloads(id_ref, &ids, move_before);
                self.write_command(frame).await;
            }
            Command::Chat(message) => {
                let frame = self.session.send_chat_message(&message);
                self.write_command(frame).await;
            }
            Command::Settings(settings) => {
                let frame = self.session.set_core_settings(&settings);
                self.write_command(frame).await;
            }
            Command::Refresh => {
                let frame = self.session.refresh();
                self.write_command(frame).await;
            }
        }
    }

    async fn on_io(&mut self, io: Io) {
        let actions = match io {
            Io::Resolved { lookup, result } => {
                if matches!(&self.lookup_task, Some((id, _)) if *id == lookup) {
                    self.lookup_task = None;
                }
                match result {
                    Ok(addresses) => self.session.on_resolved(lookup, addresses),
                    Err(e) => self.session.on_resolve_failed(lookup, &e),
                }
            }
            Io::Connected { attempt, stream } if attempt == self.attempt => {
                self.connect_task = None;
                match stream.peer_addr() {
                    Ok(peer) => {
                        self.start_io(stream);
                        self.session.on_connected(peer)
                    }
                    Err(e) => {
                        debug!(error = %e, "connected socket has no peer address");
                        self.session.on_connect_failed()
                    }
                }
            }
            Io::ConnectFailed { attempt, error } if attempt == self.attempt => {
                self.connect_task = None;
                debug!(%error, "connection attempt failed");
                self.session.on_connect_failed()
            }
            Io::Data { attempt, bytes } if attempt == self.attempt => self.session.on_data(&bytes),
            Io::Closed { attempt } if attempt == self.attempt => {
                self.close();
                self.session.on_disconnected()
            }
            _ => return,
        };
        self.apply(actions).await;
    }

    async fn apply(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::Resolve {
                    lookup,
                    host,
                    delay,
                } => self.resolve(lookup, host, delay),
                SessionAction::CancelResolve(lookup) => {
                    if let Some((id, task)) = self.lookup_task.take() {
                        if id == lookup {
                            task.abort();
                        } else {
                            self.lookup_task = Some((id, task));
                        }
                    }
                }
                SessionAction::StartLocalCore => {
                    let _ = self.launcher.spawn_start();
                }
                SessionAction::Connect(addr) => self.connect(addr),
                SessionAction::Send(bytes) => self.write(&bytes).await,
                SessionAction::Close => self.close(),
                SessionAction::Emit(event) => {
                    let _ = self.events.send(event);
                }
            }
        }
    }

    fn resolve(&mut self, lookup: LookupId, host: String, delay: Duration) {
        let io_tx = self.io_tx.clone();
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map(|addrs| {
                    let mut ips: Vec<IpAddr> = Vec::new();
                    for a in addrs {
                        if !ips.contains(&a.ip()) {
                            ips.push(a.ip());
                        }
                    }
                    ips
                });
            let _ = io_tx.send(Io::Resolved { lookup, result });
        });
        if let Some((_, old)) = self.lookup_task.replace((lookup, task)) {
            old.abort();
        }
    }

    fn connect(&mut self, addr: SocketAddr) {
        self.close();
        let attempt = self.attempt;
        let io_tx = self.io_tx.clone();
        let timeout = self.connect_timeout;
        self.connect_task = Some(tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => Io::Connected { attempt, stream },
                Ok(Err(error)) => Io::ConnectFailed { attempt, error },
                Err(_) => Io::ConnectFailed {
                    attempt,
                    error: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                },
            };
            let _ = io_tx.send(event);
        }));
    }

    fn start_io(&mut self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();
        self.writer = Some(writer);
        let attempt = self.attempt;
        let io_tx = self.io_tx.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let bytes = buf[..n].to_vec();
                        if io_tx.send(Io::Data { attempt, bytes }).is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = io_tx.send(Io::Closed { attempt });
        }));
    }

    async fn write_command(&mut self, frame: Result<Vec<u8>, SessionError>) {
        match frame {
            Ok(bytes) => self.write(&bytes).await,
            Err(e) => warn!(error = %e, "command not sent"),
        }
    }

    /// Writes complete before the next event is handled.
    async fn write(&mut self, bytes: &[u8]) {
        let Some(writer) = self.writer.as_mut() else {
            debug!("no socket, dropping outbound frame");
            return;
        };
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            // The reader observes the broken socket and reports the disconnection.
            warn!(error = %e, "write to core failed");
        }
    }

    /// Drop the current socket. Events already queued for it become stale.
    fn close(&mut self) {
        self.attempt += 1;
        self.writer = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlan_core::protocol::{EventChatMessage, MessageType, Search, Tag};
    use dlan_core::wire::{encode_frame, FramedChannel};
    use dlan_core::{Frame, Notice};
    use tokio::net::TcpListener;

    const CORE_ID: [u8; 20] = [7u8; 20];

    async fn next_event(handle: &mut SessionHandle) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), handle.events.recv())
            .await
            .expect("event timeout")
            .expect("session stopped")
    }

    async fn read_frame(stream: &mut TcpStream, channel: &mut FramedChannel) -> Frame {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(frame) = channel.try_decode_next().unwrap() {
                return frame;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "socket closed");
            channel.feed(&buf[..n]);
        }
    }

    fn spawn_local(config: SessionConfig) -> SessionHandle {
        spawn_session(
            config,
            Duration::from_secs(2),
            LocalCoreLauncher::disabled(),
        )
    }

    #[tokio::test]
    async fn local_core_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut handle = spawn_local(SessionConfig::default());
        assert!(handle.connect("127.0.0.1", port, Credential::none()));

        let (mut core, _) = listener.accept().await.unwrap();
        assert_eq!(next_event(&mut handle).await, SessionEvent::Connected);

        // Core pushes a chat event split over two writes.
        let peer = Hash::random();
        let frame = encode_frame(
            MessageType::EventChatMessage,
            Hash::from_bytes(CORE_ID),
            Some(&EventChatMessage {
                peer_id: peer,
                message: "hello".into(),
            }),
        )
        .unwrap();
        core.write_all(&frame[..10]).await.unwrap();
        core.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        core.write_all(&frame[10..]).await.unwrap();
        assert_eq!(
            next_event(&mut handle).await,
            SessionEvent::ChatMessage {
                peer_id: peer,
                message: "hello".into()
            }
        );

        // Search goes out with our learned sender ID; the tag attaches to it.
        let request = handle.search("ogg").await.unwrap().unwrap();
        let mut channel = FramedChannel::new();
        let sent = read_frame(&mut core, &mut channel).await;
        assert_eq!(sent.header.message_type, MessageType::Search);
        assert_eq!(sent.header.sender_id, Hash::from_bytes(CORE_ID));
        assert_eq!(sent.decode::<Search>().unwrap().terms, "ogg");
        let tag = encode_frame(
            MessageType::SearchTag,
            Hash::from_bytes(CORE_ID),
            Some(&Tag { tag: 5 }),
        )
        .unwrap();
        core.write_all(&tag).await.unwrap();
        assert_eq!(
            next_event(&mut handle).await,
            SessionEvent::SearchTagged { request, tag: 5 }
        );

        drop(core);
        assert_eq!(next_event(&mut handle).await, SessionEvent::Disconnected);
        handle.shutdown();
    }

    #[tokio::test]
    async fn connection_refused_is_reported_and_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut handle = spawn_local(SessionConfig {
            retry_delay: Duration::from_millis(50),
        });
        handle.connect("127.0.0.1", port, Credential::none());
        assert_eq!(
            next_event(&mut handle).await,
            SessionEvent::Notice(Notice::ConnectFailed)
        );
        // The session keeps retrying after the delay.
        assert_eq!(
            next_event(&mut handle).await,
            SessionEvent::Notice(Notice::ConnectFailed)
        );
        handle.shutdown();
    }

    #[tokio::test]
    async fn commands_without_connection_fail() {
        let handle = spawn_local(SessionConfig::default());
        let result = handle.search("nothing").await.unwrap();
        assert!(matches!(result, Err(SessionError::NotConnected)));
        handle.shutdown();
    }

    #[tokio::test]
    async fn socket_connected_after_close_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (io_tx, mut io_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut reactor = Reactor::new(
            SessionConfig::default(),
            Duration::from_secs(2),
            LocalCoreLauncher::disabled(),
            io_tx,
            events_tx,
        );

        reactor.connect(addr);
        let (mut core, _) = listener.accept().await.unwrap();
        let connected = tokio::time::timeout(Duration::from_secs(5), io_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(connected, Io::Connected { .. }));

        // The session closes before the queued completion is handled.
        reactor.close();
        reactor.on_io(connected).await;
        assert!(reactor.writer.is_none());
        assert!(reactor.reader_task.is_none());

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), core.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "stale socket must be closed");
    }
}
