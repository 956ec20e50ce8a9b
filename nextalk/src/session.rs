//! Session controller: the single execution context that owns the
//! recording/delivery state machine — `idle -> listening -> processing ->
//! (idle | copiedToClipboard | error)` — and publishes [`CapsuleState`] for
//! any UI surface to observe.
//!
//! Pipeline events, commands, and user actions are folded onto one
//! `tokio::sync::mpsc` channel drained by a single task, giving the FIFO
//! serialization this controller needs without a dedicated actor framework.
//! `CapsuleState` is published over `tokio::sync::watch`, a true
//! latest-wins channel, so any observer always sees the most recent state
//! rather than risking a lagged read.
//!
//! Clipboard fallback uses `arboard`.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use nextalk_core::error::{ErrorKind, NextalkError, SocketErrorKind};
use nextalk_core::ipc::CapsuleState;
use nextalk_core::pipeline::{FlushPolicy, Pipeline, PipelineEvent};

use crate::ime_client::ImeClient;
use crate::single_instance::Command;

const ERROR_AUTO_HIDE: Duration = Duration::from_secs(3);
const COPIED_AUTO_HIDE: Duration = Duration::from_secs(2);

/// Seam over the system clipboard so the delivery algorithm is testable
/// without a display server. [`ArboardSink`] is the real implementation.
pub trait ClipboardSink: Send + 'static {
    fn set_text(&mut self, text: &str) -> Result<(), String>;
}

/// Real clipboard, backed by `arboard`.
pub struct ArboardSink;

impl ClipboardSink for ArboardSink {
    fn set_text(&mut self, text: &str) -> Result<(), String> {
        arboard::Clipboard::new()
            .and_then(|mut clipboard| clipboard.set_text(text.to_string()))
            .map_err(|e| e.to_string())
    }
}

/// A user action taken on the error screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Retry,
    Dismiss,
    Discard,
    Copy,
}

/// Everything that can reach the controller's single execution context.
pub enum ControllerEvent {
    Command(Command),
    Pipeline(PipelineEvent),
    Action(UserAction),
    /// Internal: fires when a scheduled auto-hide timer elapses, carrying
    /// the session epoch it was scheduled under so stale timers are no-ops.
    AutoHideElapsed(u64),
}

/// State owned exclusively by the controller's execution context.
struct Session {
    state: CapsuleState,
    preserved_text: Option<String>,
    last_error: Option<ErrorKind>,
    prevent_auto_hide: bool,
    /// Bumped on every state transition; a stale `AutoHideElapsed` whose
    /// epoch no longer matches is ignored.
    epoch: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            state: CapsuleState::Idle,
            preserved_text: None,
            last_error: None,
            prevent_auto_hide: false,
            epoch: 0,
        }
    }
}

pub struct SessionController<C: ClipboardSink = ArboardSink> {
    pipeline: Pipeline,
    ime: ImeClient,
    clipboard: C,
    state_tx: watch::Sender<CapsuleState>,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    session: Session,
}

impl<C: ClipboardSink> SessionController<C> {
    /// Build a controller. `events_tx` is retained so the controller can
    /// post its own auto-hide timers back onto the same execution context.
    pub fn new(
        pipeline: Pipeline,
        ime: ImeClient,
        clipboard: C,
        events_tx: mpsc::UnboundedSender<ControllerEvent>,
    ) -> (Self, watch::Receiver<CapsuleState>) {
        let (state_tx, state_rx) = watch::channel(CapsuleState::Idle);
        let controller = Self {
            pipeline,
            ime,
            clipboard,
            state_tx,
            events_tx,
            session: Session::new(),
        };
        (controller, state_rx)
    }

    /// Drain events until the channel closes. Each event is fully processed
    /// (including any `.await`s) before the next is pulled, which is what
    /// gives a useful ordering guarantee for free: a `toggle`
    /// that arrives mid-`processing` just waits in the channel.
    pub async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<ControllerEvent>) {
        info!("session controller started");
        while let Some(event) = events_rx.recv().await {
            self.handle_event(event).await;
        }
        info!("session controller stopped");
    }

    async fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Command(Command::Toggle) => self.handle_toggle().await,
            ControllerEvent::Command(Command::Show) => debug!("show requested (UI concern, no-op in core)"),
            ControllerEvent::Command(Command::Hide) => debug!("hide requested (UI concern, no-op in core)"),
            ControllerEvent::Pipeline(event) => self.handle_pipeline_event(event).await,
            ControllerEvent::Action(action) => self.handle_action(action).await,
            ControllerEvent::AutoHideElapsed(epoch) => self.handle_auto_hide(epoch),
        }
    }

    async fn handle_toggle(&mut self) {
        match self.session.state.clone() {
            CapsuleState::Idle => self.start_session().await,
            CapsuleState::Listening { partial } => self.begin_processing(partial).await,
            _ => debug!("toggle ignored in current state"),
        }
    }

    async fn start_session(&mut self) {
        let pipeline = self.pipeline.clone();
        let result = tokio::task::spawn_blocking(move || pipeline.start())
            .await
            .unwrap_or_else(|e| Err(NextalkError::Unknown(e.to_string())));
        match result {
            Ok(()) => self.set_state(CapsuleState::Listening { partial: None }),
            Err(e) => self.enter_error(e.kind(), None),
        }
    }

    /// User `toggle` while recording: transitions to `processing` and
    /// signals the pipeline to flush. Delivery happens once the resulting
    /// `endpoint` event arrives, the same path a pipeline-originated
    /// endpoint takes — there is only one place text delivery is decided.
    async fn begin_processing(&mut self, partial: Option<String>) {
        self.set_state(CapsuleState::Processing { partial });
        if let Err(e) = self.pipeline.stop(FlushPolicy::Commit) {
            warn!("stop(commit) requested but pipeline was not running: {e}");
        }
    }

    async fn handle_pipeline_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Partial(t) => {
                if matches!(self.session.state, CapsuleState::Listening { .. }) {
                    self.set_state(CapsuleState::Listening { partial: Some(t.text) });
                }
            }
            PipelineEvent::Endpoint(t) => self.finalize_and_deliver(t.text).await,
            PipelineEvent::Error(kind) => self.handle_pipeline_error(kind),
        }
    }

    async fn finalize_and_deliver(&mut self, text: String) {
        self.set_state(CapsuleState::Processing {
            partial: Some(text.clone()),
        });
        self.deliver_text(text).await;
    }

    /// Text delivery algorithm:
    /// 1. Empty text goes directly to `idle`.
    /// 2. `ime.send` succeeding goes to `idle`.
    /// 3. A `socketError` falls back to the clipboard; a clipboard failure
    ///    too surfaces `error{socketError, preservedText}` with
    ///    `preventAutoHide=true`.
    async fn deliver_text(&mut self, text: String) {
        if text.trim().is_empty() {
            self.set_state(CapsuleState::Idle);
            return;
        }
        match self.ime.send(&text).await {
            Ok(()) => self.set_state(CapsuleState::Idle),
            Err(NextalkError::Socket { kind, .. }) => self.fall_back_to_clipboard(kind, text),
            Err(e) => self.enter_error(e.kind(), Some(text)),
        }
    }

    fn fall_back_to_clipboard(&mut self, sub_kind: SocketErrorKind, text: String) {
        match self.clipboard.set_text(&text) {
            Ok(()) => {
                self.set_state(CapsuleState::CopiedToClipboard);
                self.schedule_auto_hide(COPIED_AUTO_HIDE);
            }
            Err(e) => {
                warn!("clipboard fallback also failed: {e}");
                self.enter_error(ErrorKind::Socket(sub_kind), Some(text));
            }
        }
    }

    fn handle_pipeline_error(&mut self, kind: ErrorKind) {
        let preserved = match &self.session.state {
            CapsuleState::Listening { partial } | CapsuleState::Processing { partial } => partial.clone(),
            _ => None,
        };
        self.enter_error(kind, preserved);
    }

    async fn handle_action(&mut self, action: UserAction) {
        let CapsuleState::Error {
            kind,
            preserved_text,
            ..
        } = self.session.state.clone()
        else {
            return;
        };
        match action {
            UserAction::Dismiss | UserAction::Discard => {
                self.session.preserved_text = None;
                self.session.last_error = None;
                self.set_state(CapsuleState::Idle);
            }
            UserAction::Copy => {
                if let Some(text) = preserved_text {
                    match self.clipboard.set_text(&text) {
                        Ok(()) => {
                            self.session.preserved_text = None;
                            self.set_state(CapsuleState::CopiedToClipboard);
                            self.schedule_auto_hide(COPIED_AUTO_HIDE);
                        }
                        Err(e) => warn!("copy action failed: {e}"),
                    }
                }
            }
            UserAction::Retry => self.retry(kind, preserved_text).await,
        }
    }

    /// `retry` behaves differently by kind: a socket error clears degraded
    /// mode and resends the preserved text; anything else just re-attempts
    /// the pipeline's `start()` against whatever is on disk now (re-download
    /// is a separate model-store action, not this controller's concern).
    async fn retry(&mut self, kind: ErrorKind, preserved_text: Option<String>) {
        match kind {
            ErrorKind::Socket(_) => {
                self.ime.reset();
                match preserved_text {
                    Some(text) => self.deliver_text(text).await,
                    None => self.set_state(CapsuleState::Idle),
                }
            }
            _ => self.start_session().await,
        }
    }

    fn enter_error(&mut self, kind: ErrorKind, preserved_text: Option<String>) {
        self.session.last_error = Some(kind);
        self.session.preserved_text = preserved_text.clone();
        // Every error kind offers at least one action today, so this is
        // always true; the auto-hide branch below is kept for a
        // hypothetical actionless kind.
        self.session.prevent_auto_hide = true;
        self.set_state(CapsuleState::Error {
            kind,
            message: None,
            preserved_text,
            fcitx_subkind: None,
        });
        if !self.session.prevent_auto_hide {
            self.schedule_auto_hide(ERROR_AUTO_HIDE);
        }
    }

    fn set_state(&mut self, state: CapsuleState) {
        self.session.epoch += 1;
        self.session.state = state.clone();
        let _ = self.state_tx.send(state);
    }

    fn schedule_auto_hide(&self, after: Duration) {
        let epoch = self.session.epoch;
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(ControllerEvent::AutoHideElapsed(epoch));
        });
    }

    fn handle_auto_hide(&mut self, epoch: u64) {
        if epoch != self.session.epoch {
            return;
        }
        match &self.session.state {
            CapsuleState::CopiedToClipboard => self.set_state(CapsuleState::Idle),
            CapsuleState::Error { .. } if !self.session.prevent_auto_hide => {
                self.session.last_error = None;
                self.session.preserved_text = None;
                self.set_state(CapsuleState::Idle);
            }
            _ => {}
        }
    }
}

/// Forward pipeline broadcast events onto the controller's execution
/// context. One task per subscription, folding into the single `mpsc`
/// channel so cross-thread events are posted to this context and
/// processed FIFO.
pub fn spawn_pipeline_forwarder(pipeline: &Pipeline, events_tx: mpsc::UnboundedSender<ControllerEvent>) {
    let mut rx = pipeline.subscribe_events();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if events_tx.send(ControllerEvent::Pipeline(event)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "pipeline event forwarder lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Forward command-channel commands onto the controller's execution
/// context.
pub fn spawn_command_forwarder(
    mut commands_rx: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
) {
    tokio::spawn(async move {
        while let Some(command) = commands_rx.recv().await {
            if events_tx.send(ControllerEvent::Command(command)).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use nextalk_core::ipc::Transcript;
    use tokio::net::UnixListener;

    struct FakeClipboard {
        last: Option<String>,
        fail: bool,
    }

    impl FakeClipboard {
        fn ok() -> Self {
            Self { last: None, fail: false }
        }

        fn failing() -> Self {
            Self { last: None, fail: true }
        }
    }

    impl ClipboardSink for FakeClipboard {
        fn set_text(&mut self, text: &str) -> Result<(), String> {
            if self.fail {
                return Err("clipboard unavailable".into());
            }
            self.last = Some(text.to_string());
            Ok(())
        }
    }

    fn noop_pipeline() -> Pipeline {
        struct NullEngine;
        impl nextalk_core::asr::AsrEngine for NullEngine {
            fn initialize(&mut self) -> nextalk_core::error::Result<()> {
                Ok(())
            }
            fn accept_waveform(&mut self, _samples: &[f32]) {}
            fn decode(&mut self) {}
            fn is_ready(&self) -> bool {
                false
            }
            fn get_result(&self) -> Transcript {
                Transcript::new("")
            }
            fn is_endpoint(&mut self) -> bool {
                false
            }
            fn reset(&mut self) {}
            fn input_finished(&mut self) {}
            fn dispose(&mut self) {}
        }
        Pipeline::new(Box::new(NullEngine))
    }

    async fn ime_pointed_at_nonexistent_socket() -> ImeClient {
        ImeClient::new(std::path::PathBuf::from("/nonexistent/nextalk-fcitx5.sock"))
    }

    /// A fake fcitx5 addon that accepts one frame and acks it.
    async fn spawn_fake_ime_server() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("nextalk-session-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fake-fcitx5.sock");
        let listener = UnixListener::bind(&path).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = crate::framing::read_frame(&mut stream).await;
                let _ = crate::framing::write_ack(&mut stream).await;
            }
        });
        path
    }

    fn new_controller(
        clipboard: FakeClipboard,
        ime: ImeClient,
    ) -> (SessionController<FakeClipboard>, mpsc::UnboundedSender<ControllerEvent>, watch::Receiver<CapsuleState>) {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (controller, state_rx) = SessionController::new(noop_pipeline(), ime, clipboard, events_tx.clone());
        (controller, events_tx, state_rx)
    }

    #[tokio::test]
    async fn endpoint_with_reachable_ime_delivers_and_returns_to_idle() {
        let socket = spawn_fake_ime_server().await;
        let ime = ImeClient::new(socket.clone());
        let (mut controller, _tx, mut state_rx) = new_controller(FakeClipboard::ok(), ime);

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("你好世界")))
            .await;

        state_rx.changed().await.ok();
        assert!(matches!(*state_rx.borrow(), CapsuleState::Idle));
        let _ = std::fs::remove_dir_all(socket.parent().unwrap());
    }

    #[tokio::test]
    async fn empty_endpoint_text_goes_directly_to_idle() {
        let ime = ime_pointed_at_nonexistent_socket().await;
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::ok(), ime);

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("   ")))
            .await;

        assert!(matches!(controller.session.state, CapsuleState::Idle));
    }

    #[tokio::test]
    async fn unreachable_ime_falls_back_to_clipboard() {
        let ime = ime_pointed_at_nonexistent_socket().await;
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::ok(), ime);

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("测试")))
            .await;

        assert!(matches!(controller.session.state, CapsuleState::CopiedToClipboard));
        assert_eq!(controller.clipboard.last.as_deref(), Some("测试"));
    }

    #[tokio::test]
    async fn clipboard_failure_after_socket_failure_surfaces_preserved_text() {
        let ime = ime_pointed_at_nonexistent_socket().await;
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::failing(), ime);

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("draft text")))
            .await;

        match &controller.session.state {
            CapsuleState::Error {
                kind,
                preserved_text,
                ..
            } => {
                assert_eq!(*kind, ErrorKind::Socket(SocketErrorKind::SocketNotFound));
                assert_eq!(preserved_text.as_deref(), Some("draft text"));
            }
            other => panic!("expected Error state, got {other:?}"),
        }
        assert!(controller.session.prevent_auto_hide);
    }

    #[tokio::test]
    async fn partial_only_updates_state_while_listening() {
        let ime = ime_pointed_at_nonexistent_socket().await;
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::ok(), ime);
        controller.session.state = CapsuleState::Listening { partial: None };

        controller
            .handle_pipeline_event(PipelineEvent::Partial(Transcript::new("hel")))
            .await;
        assert!(matches!(
            controller.session.state,
            CapsuleState::Listening { partial: Some(ref p) } if p == "hel"
        ));

        controller.session.state = CapsuleState::Idle;
        controller
            .handle_pipeline_event(PipelineEvent::Partial(Transcript::new("ignored")))
            .await;
        assert!(matches!(controller.session.state, CapsuleState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn copied_to_clipboard_auto_hides_after_two_seconds() {
        let ime = ime_pointed_at_nonexistent_socket().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (mut controller, state_rx) = SessionController::new(noop_pipeline(), ime, FakeClipboard::ok(), events_tx);

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("ok")))
            .await;
        assert!(matches!(controller.session.state, CapsuleState::CopiedToClipboard));

        tokio::time::advance(COPIED_AUTO_HIDE + Duration::from_millis(10)).await;
        let event = events_rx.recv().await.expect("auto-hide event");
        controller.handle_event(event).await;

        assert!(matches!(controller.session.state, CapsuleState::Idle));
        drop(state_rx);
    }

    #[tokio::test]
    async fn stale_auto_hide_after_a_newer_transition_is_a_no_op() {
        let ime = ime_pointed_at_nonexistent_socket().await;
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::ok(), ime);

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("ok")))
            .await;
        let stale_epoch = controller.session.epoch - 1;

        controller.handle_auto_hide(stale_epoch);
        assert!(matches!(controller.session.state, CapsuleState::CopiedToClipboard));
    }

    #[tokio::test]
    async fn dismiss_clears_preserved_text_and_returns_to_idle() {
        let ime = ime_pointed_at_nonexistent_socket().await;
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::failing(), ime);

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("draft")))
            .await;
        assert!(matches!(controller.session.state, CapsuleState::Error { .. }));

        controller.handle_action(UserAction::Dismiss).await;
        assert!(matches!(controller.session.state, CapsuleState::Idle));
        assert!(controller.session.preserved_text.is_none());
    }

    #[tokio::test]
    async fn retry_on_socket_error_resends_preserved_text() {
        let socket = spawn_fake_ime_server().await;
        let failing_path = std::path::PathBuf::from("/nonexistent/nextalk-fcitx5.sock");
        let ime = ImeClient::new(failing_path);
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::failing(), ime);

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("draft")))
            .await;
        assert!(matches!(controller.session.state, CapsuleState::Error { .. }));

        // Point the client at the now-live fake server before retrying.
        controller.ime = ImeClient::new(socket.clone());
        controller.handle_action(UserAction::Retry).await;

        assert!(matches!(controller.session.state, CapsuleState::Idle));
        let _ = std::fs::remove_dir_all(socket.parent().unwrap());
    }

    #[tokio::test]
    async fn toggle_while_listening_transitions_to_processing() {
        let ime = ime_pointed_at_nonexistent_socket().await;
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::ok(), ime);
        controller.session.state = CapsuleState::Listening {
            partial: Some("partial text".into()),
        };

        controller.handle_toggle().await;

        assert!(matches!(
            controller.session.state,
            CapsuleState::Processing { partial: Some(ref p) } if p == "partial text"
        ));
    }

    #[tokio::test]
    async fn copy_action_moves_preserved_text_to_clipboard() {
        let ime = ime_pointed_at_nonexistent_socket().await;
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::failing(), ime);

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("draft")))
            .await;
        assert!(matches!(controller.session.state, CapsuleState::Error { .. }));

        controller.clipboard.fail = false;
        controller.handle_action(UserAction::Copy).await;

        assert!(matches!(controller.session.state, CapsuleState::CopiedToClipboard));
        assert_eq!(controller.clipboard.last.as_deref(), Some("draft"));
    }

    /// Like [`spawn_fake_ime_server`], but captures the received payload so
    /// a test can assert on exactly what was delivered.
    async fn spawn_fake_ime_server_capturing() -> (std::path::PathBuf, std::sync::Arc<std::sync::Mutex<Option<String>>>) {
        let dir = std::env::temp_dir().join(format!("nextalk-session-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fake-fcitx5.sock");
        let listener = UnixListener::bind(&path).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        let received = std::sync::Arc::new(std::sync::Mutex::new(None));
        let received_clone = received.clone();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                if let Ok(Some(text)) = crate::framing::read_frame(&mut stream).await {
                    *received_clone.lock().unwrap() = Some(text);
                }
                let _ = crate::framing::write_ack(&mut stream).await;
            }
        });
        (path, received)
    }

    // The following mirror the end-to-end scenarios: audio capture and the
    // ASR pipeline are stood in for by directly injecting the
    // `ControllerEvent::Pipeline` events they would forward, since driving a
    // real `Pipeline` needs a real audio device; the IME side uses the real
    // `ImeClient` against a short-lived fake server.

    #[tokio::test]
    async fn streaming_happy_path_partials_are_monotone_and_endpoint_delivers() {
        let (socket, received) = spawn_fake_ime_server_capturing().await;
        let ime = ImeClient::new(socket.clone());
        let (mut controller, _tx, mut state_rx) = new_controller(FakeClipboard::ok(), ime);

        controller.session.state = CapsuleState::Listening { partial: None };
        for prefix in ["你", "你好", "你好世界"] {
            controller
                .handle_pipeline_event(PipelineEvent::Partial(Transcript::new(prefix)))
                .await;
            assert!(matches!(
                &controller.session.state,
                CapsuleState::Listening { partial: Some(p) } if p == prefix
            ));
        }

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("你好世界")))
            .await;

        state_rx.changed().await.ok();
        assert!(matches!(*state_rx.borrow(), CapsuleState::Idle));
        assert_eq!(received.lock().unwrap().as_deref(), Some("你好世界"));
        let _ = std::fs::remove_dir_all(socket.parent().unwrap());
    }

    #[tokio::test]
    async fn segmented_endpoint_with_language_delivers_via_ime() {
        let (socket, received) = spawn_fake_ime_server_capturing().await;
        let ime = ImeClient::new(socket.clone());
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::ok(), ime);

        let mut transcript = Transcript::new("Hello world");
        transcript.language = Some("en".to_string());
        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(transcript))
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(controller.session.state, CapsuleState::Idle));
        assert_eq!(received.lock().unwrap().as_deref(), Some("Hello world"));
        let _ = std::fs::remove_dir_all(socket.parent().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn ime_unavailable_falls_back_to_clipboard_then_auto_hides() {
        let ime = ime_pointed_at_nonexistent_socket().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (mut controller, _state_rx) =
            SessionController::new(noop_pipeline(), ime, FakeClipboard::ok(), events_tx);

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("测试")))
            .await;
        assert!(matches!(controller.session.state, CapsuleState::CopiedToClipboard));
        assert_eq!(controller.clipboard.last.as_deref(), Some("测试"));

        tokio::time::advance(COPIED_AUTO_HIDE + Duration::from_millis(10)).await;
        let event = events_rx.recv().await.expect("auto-hide event");
        controller.handle_event(event).await;
        assert!(matches!(controller.session.state, CapsuleState::Idle));
    }

    #[tokio::test]
    async fn device_lost_mid_utterance_surfaces_error_with_preserved_text() {
        let ime = ime_pointed_at_nonexistent_socket().await;
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::ok(), ime);
        controller.session.state = CapsuleState::Listening {
            partial: Some("last partial".into()),
        };

        controller
            .handle_pipeline_event(PipelineEvent::Error(ErrorKind::AudioDeviceLost))
            .await;

        match &controller.session.state {
            CapsuleState::Error {
                kind,
                preserved_text,
                ..
            } => {
                assert_eq!(*kind, ErrorKind::AudioDeviceLost);
                assert_eq!(preserved_text.as_deref(), Some("last partial"));
            }
            other => panic!("expected Error state, got {other:?}"),
        }
        assert!(controller.session.prevent_auto_hide);
    }

    #[tokio::test]
    async fn hotkey_toggle_off_on_off_delivers_and_returns_to_idle() {
        let (socket, received) = spawn_fake_ime_server_capturing().await;
        let ime = ImeClient::new(socket.clone());
        let (mut controller, _tx, _rx) = new_controller(FakeClipboard::ok(), ime);

        // First toggle: simulate the session already having started and
        // captured some speech ("OK").
        controller.session.state = CapsuleState::Listening {
            partial: Some("OK".into()),
        };

        // Second toggle: stop(commit) is requested; delivery happens once
        // the forwarded endpoint event arrives.
        controller.handle_toggle().await;
        assert!(matches!(controller.session.state, CapsuleState::Processing { .. }));

        controller
            .handle_pipeline_event(PipelineEvent::Endpoint(Transcript::new("OK")))
            .await;

        assert!(matches!(controller.session.state, CapsuleState::Idle));
        assert_eq!(received.lock().unwrap().as_deref(), Some("OK"));
        let _ = std::fs::remove_dir_all(socket.parent().unwrap());
    }
}
