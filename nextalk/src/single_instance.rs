//! Single-instance enforcement & command channel.
//!
//! At startup the process attempts to bind `$XDG_RUNTIME_DIR/nextalk-cmd.sock`
//! (permissions 0600). If the bind fails because the address is in use *and*
//! a probe connection to that address succeeds, this process is a
//! **secondary** invocation: it serializes the requested command and sends it
//! to the primary, exiting once acknowledged. Otherwise it is the **primary**:
//! it owns the socket and forwards each decoded command to the session
//! controller.
//!
//! Uses a stale-socket-cleanup + `UnixListener::bind`/`accept` shape,
//! adapted to a bind-or-probe-connect primary/secondary
//! detection: this process binds one fixed, well-known path and treats
//! "already bound" as the secondary-instance signal.

use std::path::PathBuf;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::framing;

/// A command accepted over the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Toggle,
    Show,
    Hide,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Toggle => "toggle",
            Command::Show => "show",
            Command::Hide => "hide",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "toggle" => Some(Command::Toggle),
            "show" => Some(Command::Show),
            "hide" => Some(Command::Hide),
            _ => None,
        }
    }
}

pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("nextalk-cmd.sock")
}

/// Outcome of attempting to claim the primary role.
pub enum Instance {
    /// This process is the primary; commands arrive on the returned channel.
    Primary(mpsc::UnboundedReceiver<Command>),
    /// This process is secondary; another primary is already reachable.
    Secondary,
}

/// Attempt to bind the command socket. On success, spawns the accept loop
/// and returns `Instance::Primary`. On an address-in-use error, probes the
/// existing socket; a successful probe connect means a live primary already
/// owns it, so this returns `Instance::Secondary`. A stale socket file (bind
/// fails but no primary answers) is removed and the bind retried once.
pub async fn claim(socket_path: &PathBuf) -> std::io::Result<Instance> {
    match UnixListener::bind(socket_path) {
        Ok(listener) => {
            set_socket_permissions(socket_path);
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(accept_loop(listener, tx));
            info!(path = ?socket_path, "claimed primary command channel");
            Ok(Instance::Primary(rx))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if probe_connect(socket_path).await {
                Ok(Instance::Secondary)
            } else {
                warn!(path = ?socket_path, "stale command socket, removing and retrying bind");
                let _ = std::fs::remove_file(socket_path);
                let listener = UnixListener::bind(socket_path)?;
                set_socket_permissions(socket_path);
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(accept_loop(listener, tx));
                Ok(Instance::Primary(rx))
            }
        }
        Err(e) => Err(e),
    }
}

async fn probe_connect(socket_path: &PathBuf) -> bool {
    tokio::time::timeout(Duration::from_millis(500), UnixStream::connect(socket_path))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

fn set_socket_permissions(path: &PathBuf) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    let _ = path;
}

async fn accept_loop(listener: UnixListener, tx: mpsc::UnboundedSender<Command>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("command channel accept error: {e}");
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(handle_connection(stream, tx));
    }
}

async fn handle_connection(mut stream: UnixStream, tx: mpsc::UnboundedSender<Command>) {
    match framing::read_frame(&mut stream).await {
        Ok(Some(text)) => {
            if let Some(cmd) = Command::parse(&text) {
                let _ = tx.send(cmd);
                let _ = framing::write_ack(&mut stream).await;
            } else {
                warn!(command = %text, "command channel received unrecognized command");
            }
        }
        Ok(None) => {}
        Err(e) => warn!("command channel read error: {e}"),
    }
}

/// Secondary-invocation path: serialize `command` to the primary and wait
/// for acknowledgment. Returns `Ok(())` when delivered, `Err` when the
/// primary is unreachable.
pub async fn send_to_primary(socket_path: &PathBuf, command: Command) -> std::io::Result<()> {
    let mut stream = UnixStream::connect(socket_path).await?;
    framing::write_frame(&mut stream, command.as_str())
        .await
        .map_err(std::io::Error::other)?;
    framing::read_ack(&mut stream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_strings() {
        for cmd in [Command::Toggle, Command::Show, Command::Hide] {
            assert_eq!(Command::parse(cmd.as_str()), Some(cmd));
        }
        assert_eq!(Command::parse("bogus"), None);
    }

    #[tokio::test]
    async fn second_bind_on_same_path_is_secondary_when_primary_reachable() {
        let dir = std::env::temp_dir().join(format!("nextalk-cmd-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nextalk-cmd.sock");
        let _ = std::fs::remove_file(&path);

        let first = claim(&path).await.unwrap();
        assert!(matches!(first, Instance::Primary(_)));

        let second = claim(&path).await.unwrap();
        assert!(matches!(second, Instance::Secondary));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn primary_delivers_toggle_from_secondary() {
        let dir = std::env::temp_dir().join(format!("nextalk-cmd-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nextalk-cmd.sock");
        let _ = std::fs::remove_file(&path);

        let Instance::Primary(mut rx) = claim(&path).await.unwrap() else {
            panic!("expected primary");
        };

        send_to_primary(&path, Command::Toggle).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Command::Toggle);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
