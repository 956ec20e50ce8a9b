//! IME client: commits recognized text into the focused application by
//! talking to the fcitx5 addon over a Unix stream socket.
//!
//! State machine: `disconnected -> connecting -> ready -> (sending -> ready)
//! | failed`. Any error moves to `failed` and latches *degraded mode*:
//! further `send()` calls short-circuit to `sendFailed` without touching the
//! socket until [`ImeClient::reset`] is called. [`ImeClient::reconnect`] tears
//! the connection down and re-runs discovery; it is never automatic — the
//! session controller decides when to call it.
//!
//! Uses the same Unix accept/connect shape as the command channel,
//! generalized to a client role with the explicit timeout budget
//! the IME bridge is expected to honor (5 s connect, 30 s overall), enforced via
//! `tokio::time::timeout`.

use std::path::PathBuf;
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::{info, warn};

use nextalk_core::error::{NextalkError, Result, SocketErrorKind};

use crate::framing;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Ready,
    Failed,
}

/// Client for the `nextalk-fcitx5.sock` text-commit bridge.
pub struct ImeClient {
    socket_path: PathBuf,
    stream: Option<UnixStream>,
    state: State,
    degraded: bool,
}

/// Resolve the fcitx5 bridge socket path: `$XDG_RUNTIME_DIR/nextalk-fcitx5.sock`,
/// falling back to `/tmp/nextalk-fcitx5.sock` when `XDG_RUNTIME_DIR` is unset.
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("nextalk-fcitx5.sock")
}

/// Resolve the fcitx5 configuration-message socket path:
/// `$XDG_RUNTIME_DIR/nextalk-fcitx5-cfg.sock`. Nothing in this crate connects
/// to it proactively today; it exists so a future settings push can reuse the
/// same framing without a new wire format.
pub fn default_cfg_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("nextalk-fcitx5-cfg.sock")
}

/// Send a single configuration message to the fcitx5 addon's config socket.
/// Same framing and timeout budget as [`ImeClient::send`], kept as a free
/// function since configuration messages carry no session state worth
/// latching into degraded mode.
pub async fn send_config_message(socket_path: &PathBuf, text: &str) -> Result<()> {
    check_socket_permissions(socket_path)?;

    let connect = UnixStream::connect(socket_path);
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| socket_err(SocketErrorKind::ConnectionTimeout, "connect timed out"))?
        .map_err(|e| socket_err(SocketErrorKind::ConnectionFailed, e.to_string()))?;

    tokio::time::timeout(OVERALL_TIMEOUT, async {
        framing::write_frame(&mut stream, text).await.map_err(framing_err)?;
        framing::read_ack(&mut stream)
            .await
            .map_err(|e| socket_err(SocketErrorKind::SendFailed, e.to_string()))
    })
    .await
    .map_err(|_| socket_err(SocketErrorKind::SendFailed, "send exceeded 30s budget"))?
}

impl ImeClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            stream: None,
            state: State::Disconnected,
            degraded: false,
        }
    }

    pub fn with_default_socket() -> Self {
        Self::new(default_socket_path())
    }

    /// Tear down any open connection and re-run discovery on the next
    /// `send()`. Clears degraded mode.
    pub fn reconnect(&mut self) {
        self.stream = None;
        self.state = State::Disconnected;
        self.degraded = false;
    }

    /// Alias for `reconnect()` — the controller's public "clear degraded
    /// mode and retry" action.
    pub fn reset(&mut self) {
        self.reconnect();
    }

    fn check_permissions(&self) -> std::result::Result<(), NextalkError> {
        check_socket_permissions(&self.socket_path)
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_some() && self.state == State::Ready {
            return Ok(());
        }
        self.check_permissions()?;

        let connect = UnixStream::connect(&self.socket_path);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| socket_err(SocketErrorKind::ConnectionTimeout, "connect timed out"))?
            .map_err(|e| socket_err(SocketErrorKind::ConnectionFailed, e.to_string()))?;

        self.stream = Some(stream);
        self.state = State::Ready;
        info!(socket = ?self.socket_path, "ime client connected");
        Ok(())
    }

    /// Send recognized text to the IME addon.
    ///
    /// Trims to printable content and no-ops on empty input. Returns `Ok(())`
    /// on acknowledgment, or the `socketError` sub-kind on failure. A failure
    /// latches degraded mode: subsequent calls short-circuit to `sendFailed`
    /// until [`reset`](Self::reset) is called.
    pub async fn send(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        if self.degraded {
            return Err(socket_err(SocketErrorKind::SendFailed, "client is in degraded mode"));
        }

        let result = tokio::time::timeout(OVERALL_TIMEOUT, self.send_inner(text)).await;
        match result {
            Ok(Ok(())) => {
                self.state = State::Ready;
                Ok(())
            }
            Ok(Err(e)) => {
                self.fail(&e);
                Err(e)
            }
            Err(_) => {
                let e = socket_err(SocketErrorKind::SendFailed, "send exceeded 30s budget");
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn send_inner(&mut self, text: &str) -> Result<()> {
        self.ensure_connected().await?;
        let stream = self.stream.as_mut().expect("connected by ensure_connected");

        framing::write_frame(stream, text)
            .await
            .map_err(framing_err)?;
        framing::read_ack(stream)
            .await
            .map_err(|e| socket_err(SocketErrorKind::SendFailed, e.to_string()))?;
        Ok(())
    }

    fn fail(&mut self, _err: &NextalkError) {
        self.state = State::Failed;
        self.degraded = true;
        self.stream = None;
        warn!("ime client entered degraded mode");
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// Shared 0600-permission check for any socket in the fcitx5 bridge family.
fn check_socket_permissions(socket_path: &PathBuf) -> std::result::Result<(), NextalkError> {
    let meta = std::fs::metadata(socket_path)
        .map_err(|_| socket_err(SocketErrorKind::SocketNotFound, "fcitx5 bridge socket not found"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode() & 0o777;
        if mode != 0o600 {
            return Err(socket_err(
                SocketErrorKind::SocketPermissionInsecure,
                format!("socket permissions {mode:o} != 0600"),
            ));
        }
    }
    #[cfg(not(unix))]
    let _ = meta;
    Ok(())
}

fn socket_err(kind: SocketErrorKind, message: impl Into<String>) -> NextalkError {
    NextalkError::Socket {
        kind,
        message: message.into(),
    }
}

/// Map a framing-layer failure to its `socketError` sub-kind: an oversize
/// payload is `messageTooLarge`, anything else is a generic send failure.
fn framing_err(e: framing::FramingError) -> NextalkError {
    match e {
        framing::FramingError::TooLarge(len) => socket_err(
            SocketErrorKind::MessageTooLarge,
            format!("payload too large: {len} bytes"),
        ),
        other => socket_err(SocketErrorKind::SendFailed, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_is_a_noop_on_empty_text() {
        let mut client = ImeClient::new(PathBuf::from("/nonexistent/path.sock"));
        client.send("   ").await.unwrap();
    }

    #[tokio::test]
    async fn send_reports_socket_not_found_when_path_absent() {
        let mut client = ImeClient::new(PathBuf::from("/nonexistent/nextalk-fcitx5.sock"));
        let err = client.send("hello").await.unwrap_err();
        match err {
            NextalkError::Socket { kind, .. } => assert_eq!(kind, SocketErrorKind::SocketNotFound),
            other => panic!("expected Socket error, got {other:?}"),
        }
        assert!(client.is_degraded());
    }

    #[tokio::test]
    async fn degraded_mode_short_circuits_until_reset() {
        let mut client = ImeClient::new(PathBuf::from("/nonexistent/nextalk-fcitx5.sock"));
        let _ = client.send("hello").await;
        assert!(client.is_degraded());

        let err = client.send("again").await.unwrap_err();
        match err {
            NextalkError::Socket { kind, .. } => assert_eq!(kind, SocketErrorKind::SendFailed),
            other => panic!("expected Socket error, got {other:?}"),
        }

        client.reset();
        assert!(!client.is_degraded());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn send_reports_message_too_large_for_oversize_payload() {
        use std::os::unix::fs::PermissionsExt;
        use tokio::net::UnixListener;

        let dir = std::env::temp_dir().join(format!("nextalk-ime-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("oversize.sock");
        let listener = UnixListener::bind(&path).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut client = ImeClient::new(path.clone());
        let oversized = "a".repeat((framing::MAX_MESSAGE_SIZE as usize) + 1);
        let err = client.send(&oversized).await.unwrap_err();
        match err {
            NextalkError::Socket { kind, .. } => assert_eq!(kind, SocketErrorKind::MessageTooLarge),
            other => panic!("expected Socket error, got {other:?}"),
        }
        assert!(client.is_degraded());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn send_config_message_reports_socket_not_found_when_path_absent() {
        let path = PathBuf::from("/nonexistent/nextalk-fcitx5-cfg.sock");
        let err = send_config_message(&path, "lang=zh").await.unwrap_err();
        match err {
            NextalkError::Socket { kind, .. } => assert_eq!(kind, SocketErrorKind::SocketNotFound),
            other => panic!("expected Socket error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn refuses_socket_with_insecure_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!("nextalk-ime-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("insecure.sock");
        std::fs::write(&path, b"not a real socket").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let mut client = ImeClient::new(path.clone());
        let err = client.send("hello").await.unwrap_err();
        match err {
            NextalkError::Socket { kind, .. } => {
                assert_eq!(kind, SocketErrorKind::SocketPermissionInsecure)
            }
            other => panic!("expected Socket error, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}
