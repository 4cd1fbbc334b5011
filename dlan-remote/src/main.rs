// dlan-remote: connect to a D-LAN core and drive it from the terminal.

use dlan_core::protocol::BrowseTarget;
use dlan_core::{Notice, PeerId, SessionEvent};
use dlan_remote::config;
use dlan_remote::connection::{spawn_session, Command, SessionHandle};
use dlan_remote::launcher::LocalCoreLauncher;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_LOG_FILTER: &str = "dlan_remote=info,dlan_core=info";

/// One line typed by the user.
#[derive(Debug, PartialEq)]
enum Input {
    Search(String),
    Browse(PeerId),
    Refresh,
    Quit,
    Chat(String),
    Invalid(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };
    let input = match cmd {
        "/search" if !rest.is_empty() => Input::Search(rest.to_string()),
        "/search" => Input::Invalid("usage: /search <terms>".into()),
        "/browse" => match rest.parse() {
            Ok(peer) => Input::Browse(peer),
            Err(e) => Input::Invalid(format!("usage: /browse <peer id> ({e})")),
        },
        "/refresh" => Input::Refresh,
        "/quit" => Input::Quit,
        _ if cmd.starts_with('/') => Input::Invalid(format!("unknown command {cmd}")),
        _ => Input::Chat(line.to_string()),
    };
    Some(input)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("dlan-remote {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cfg = config::load();
    let launcher = LocalCoreLauncher::new(cfg.core_executable.clone(), cfg.core_port);
    let mut session = spawn_session(cfg.session_config(), cfg.connect_timeout(), launcher);
    info!(address = %cfg.core_address, port = cfg.core_port, "connecting to core");
    session.connect(&cfg.core_address, cfg.core_port, cfg.credential());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            r = &mut shutdown => {
                r?;
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_input(&session, &line).await {
                    break;
                }
            }
            event = session.events.recv() => {
                let Some(event) = event else { break };
                report(event);
            }
        }
    }
    session.shutdown();
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_input(session: &SessionHandle, line: &str) -> bool {
    match parse_input(line) {
        None => {}
        Some(Input::Quit) => return false,
        Some(Input::Search(terms)) => match session.search(&terms).await {
            Some(Ok(request)) => info!(%request, %terms, "search sent"),
            Some(Err(e)) => warn!(error = %e, "search not sent"),
            None => return false,
        },
        Some(Input::Browse(peer)) => match session.browse(peer, BrowseTarget::Roots).await {
            Some(Ok(request)) => info!(%request, %peer, "browse sent"),
            Some(Err(e)) => warn!(error = %e, "browse not sent"),
            None => return false,
        },
        Some(Input::Refresh) => {
            session.send(Command::Refresh);
        }
        Some(Input::Chat(message)) => {
            session.send(Command::Chat(message));
        }
        Some(Input::Invalid(msg)) => println!("{msg}"),
    }
    true
}

fn report(event: SessionEvent) {
    match event {
        SessionEvent::Connected => info!("connected"),
        SessionEvent::Disconnected => info!("disconnected"),
        SessionEvent::StateUpdated(state) => info!(
            our_id = %state.our_id,
            peers = state.peers.len(),
            downloads = state.downloads.len(),
            "core state"
        ),
        SessionEvent::ChatMessage { peer_id, message } => println!("<{peer_id}> {message}"),
        SessionEvent::LogMessage(entry) => {
            info!(severity = ?entry.severity, "core: {}", entry.message)
        }
        SessionEvent::SearchTagged { request, tag } => info!(%request, tag, "search tagged"),
        SessionEvent::SearchResult { request, result } => {
            for found in &result.entries {
                println!(
                    "[{}] {}{} ({} bytes) from {}",
                    request.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
                    found.entry.path,
                    found.entry.name,
                    found.entry.size,
                    result.peer_id
                );
            }
        }
        SessionEvent::BrowseResult { result, .. } => {
            for entry in &result.entries {
                println!("{}{}", entry.path, entry.name);
            }
        }
        SessionEvent::Notice(Notice::ResolveFailed { host }) => {
            warn!(%host, "unable to resolve the core address")
        }
        SessionEvent::Notice(Notice::ConnectFailed) => warn!("unable to connect to the core"),
        SessionEvent::Notice(Notice::BadPassword) => warn!("core rejected the password"),
        SessionEvent::Notice(Notice::AuthenticationFailed) => warn!("authentication failed"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlan_core::Hash;

    #[test]
    fn commands_and_chat() {
        assert_eq!(parse_input("   "), None);
        assert_eq!(
            parse_input("/search  some words "),
            Some(Input::Search("some words".into()))
        );
        assert_eq!(parse_input("/refresh"), Some(Input::Refresh));
        assert_eq!(parse_input("/quit"), Some(Input::Quit));
        assert_eq!(
            parse_input("hello all"),
            Some(Input::Chat("hello all".into()))
        );
        assert!(matches!(parse_input("/search"), Some(Input::Invalid(_))));
        assert!(matches!(parse_input("/nope"), Some(Input::Invalid(_))));
    }

    #[test]
    fn browse_takes_hex_peer_id() {
        let peer = Hash::random();
        assert_eq!(
            parse_input(&format!("/browse {peer}")),
            Some(Input::Browse(peer))
        );
        assert!(matches!(parse_input("/browse 12"), Some(Input::Invalid(_))));
    }
}
