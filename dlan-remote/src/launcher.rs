//! Best-effort start of a local core before connecting to it.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Starts the core executable if nothing listens on the local core port.
#[derive(Debug, Clone)]
pub struct LocalCoreLauncher {
    executable: Option<PathBuf>,
    port: u16,
}

impl LocalCoreLauncher {
    pub fn new(executable: Option<PathBuf>, port: u16) -> Self {
        Self { executable, port }
    }

    /// Launcher that never starts anything.
    pub fn disabled() -> Self {
        Self::new(None, 0)
    }

    /// Something accepts connections on the local core port.
    pub fn is_running(&self) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
    }

    /// Blocking. Returns the spawned process, which the caller must reap; failures are
    /// only logged.
    pub fn start_if_not_running(&self) -> Option<Child> {
        let Some(exe) = &self.executable else {
            debug!("no core executable configured");
            return None;
        };
        if self.is_running() {
            return None;
        }
        match Command::new(exe)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                info!(pid = child.id(), path = %exe.display(), "started local core");
                Some(child)
            }
            Err(e) => {
                warn!(path = %exe.display(), error = %e, "unable to start local core");
                None
            }
        }
    }

    /// Fire-and-forget variant for async contexts. A started core is reaped by a
    /// detached thread so it does not linger as a zombie; the runtime never waits on it.
    pub fn spawn_start(&self) -> Option<tokio::task::JoinHandle<()>> {
        if self.executable.is_none() {
            return None;
        }
        let launcher = self.clone();
        Some(tokio::task::spawn_blocking(move || {
            if let Some(child) = launcher.start_if_not_running() {
                reap_in_background(child);
            }
        }))
    }
}

fn reap_in_background(mut child: Child) {
    let pid = child.id();
    let spawned = std::thread::Builder::new()
        .name("dlan-core-reaper".into())
        .spawn(move || match child.wait() {
            Ok(status) => info!(pid, %status, "local core exited"),
            Err(e) => warn!(pid, error = %e, "unable to wait for local core"),
        });
    if let Err(e) = spawned {
        warn!(pid, error = %e, "unable to start reaper thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_spawns() {
        assert!(LocalCoreLauncher::disabled().start_if_not_running().is_none());
    }

    #[test]
    fn missing_executable_is_not_fatal() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let launcher =
            LocalCoreLauncher::new(Some(PathBuf::from("/nonexistent/dlan-core-bin")), port);
        assert!(launcher.start_if_not_running().is_none());
    }

    #[test]
    fn running_core_is_detected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let launcher = LocalCoreLauncher::new(Some(PathBuf::from("/bin/false")), port);
        assert!(launcher.is_running());
        assert!(launcher.start_if_not_running().is_none());
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn started_core_is_handed_back_for_reaping() {
        let launcher = LocalCoreLauncher::new(Some(PathBuf::from("/bin/true")), free_port());
        let mut child = launcher.start_if_not_running().expect("spawned");
        assert!(child.wait().unwrap().success());
        // Reaped: nothing is left to collect.
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn spawn_start_launches_and_returns() {
        let launcher = LocalCoreLauncher::new(Some(PathBuf::from("/bin/true")), free_port());
        let task = launcher.spawn_start().expect("executable configured");
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(LocalCoreLauncher::disabled().spawn_start().is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn exited_core_is_reaped() {
        let child = Command::new("/bin/true").spawn().unwrap();
        let proc_entry = PathBuf::from(format!("/proc/{}", child.id()));
        reap_in_background(child);
        // A zombie keeps its /proc entry until it is waited on.
        for _ in 0..250 {
            if !proc_entry.exists() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("{} still present", proc_entry.display());
    }
}
