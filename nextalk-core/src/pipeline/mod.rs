//! Inference Pipeline: owns the capture → engine loop and the
//! `stopped → starting → running → stopping → stopped` state machine.
//! `error` is a terminal substate until the caller calls `start()` again.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on some platforms, so `AudioCapture` is opened
//! *inside* the `spawn_blocking` closure, same as the engine lifecycle this
//! is generalized from. A sync oneshot channel reports the open outcome back
//! to the `start()` caller.

mod worker;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    asr::AsrEngine,
    audio::AudioCapture,
    buffering::create_audio_ring,
    error::{ErrorKind, NextalkError, Result},
    ipc::Transcript,
};

const BROADCAST_CAP: usize = 256;

/// Thread-safe handle to the active `AsrEngine`, shared between the
/// `Pipeline` and its worker thread.
#[derive(Clone)]
pub struct EngineHandle(pub Arc<Mutex<dyn AsrEngine>>);

impl EngineHandle {
    pub fn new(engine: Box<dyn AsrEngine>) -> Self {
        Self(Arc::new(Mutex::new(engine)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// How `stop()` should dispose of any buffered/in-flight result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Call `inputFinished()`, drain any remaining result, emit a terminal
    /// transcript.
    Commit,
    /// Call `reset()`; no terminal emission.
    Discard,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Partial(Transcript),
    Endpoint(Transcript),
    Error(ErrorKind),
}

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub frames_in: std::sync::atomic::AtomicUsize,
    pub frames_resampled: std::sync::atomic::AtomicUsize,
    pub decode_calls: std::sync::atomic::AtomicUsize,
    pub partials_emitted: std::sync::atomic::AtomicUsize,
    pub endpoints_emitted: std::sync::atomic::AtomicUsize,
    pub errors: std::sync::atomic::AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.frames_in.store(0, Ordering::Relaxed);
        self.frames_resampled.store(0, Ordering::Relaxed);
        self.decode_calls.store(0, Ordering::Relaxed);
        self.partials_emitted.store(0, Ordering::Relaxed);
        self.endpoints_emitted.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_resampled: self.frames_resampled.load(Ordering::Relaxed),
            decode_calls: self.decode_calls.load(Ordering::Relaxed),
            partials_emitted: self.partials_emitted.load(Ordering::Relaxed),
            endpoints_emitted: self.endpoints_emitted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub frames_in: usize,
    pub frames_resampled: usize,
    pub decode_calls: usize,
    pub partials_emitted: usize,
    pub endpoints_emitted: usize,
    pub errors: usize,
}

/// Target sample rate both ASR engine variants expect.
const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Top-level pipeline handle. Cheaply cloneable — all fields use interior
/// mutability — so it can be shared with a session controller and any
/// event-forwarding task.
#[derive(Clone)]
pub struct Pipeline {
    engine: EngineHandle,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<PipelineState>>,
    events_tx: broadcast::Sender<PipelineEvent>,
    diagnostics: Arc<PipelineDiagnostics>,
    flush_policy: Arc<Mutex<FlushPolicy>>,
}

impl Pipeline {
    pub fn new(engine: Box<dyn AsrEngine>) -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            engine: EngineHandle::new(engine),
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(PipelineState::Stopped)),
            events_tx,
            diagnostics: Arc::new(PipelineDiagnostics::default()),
            flush_policy: Arc::new(Mutex::new(FlushPolicy::Commit)),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Swap the active engine. Only callable while `state() == Stopped`.
    pub fn update_engine(&self, new_engine: Box<dyn AsrEngine>) -> Result<()> {
        if self.state() != PipelineState::Stopped {
            return Err(NextalkError::Unknown(
                "updateEngine called while pipeline is not stopped".into(),
            ));
        }
        *self.engine.0.lock() = new_engine;
        Ok(())
    }

    /// Start capture and the worker loop. Blocks until the audio device is
    /// confirmed open (or fails to open).
    pub fn start(&self) -> Result<()> {
        self.start_with_device(None)
    }

    pub fn start_with_device(&self, preferred_input_device: Option<String>) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(NextalkError::Unknown("pipeline already running".into()));
        }

        *self.state.lock() = PipelineState::Starting;
        self.diagnostics.reset();
        self.running.store(true, Ordering::SeqCst);

        let (producer, consumer) = create_audio_ring();
        let engine = self.engine.clone();
        let running = Arc::clone(&self.running);
        let events_tx = self.events_tx.clone();
        let state = Arc::clone(&self.state);
        let diagnostics = Arc::clone(&self.diagnostics);
        let flush_policy = Arc::clone(&self.flush_policy);

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        tokio::task::spawn_blocking(move || {
            let capture = match AudioCapture::open_with_preference(
                producer,
                Arc::clone(&running),
                preferred_input_device.as_deref(),
            ) {
                Ok(c) => {
                    let _ = open_tx.send(Ok(c.sample_rate));
                    c
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let capture_sample_rate = capture.sample_rate;
            *state.lock() = PipelineState::Running;

            worker::run(worker::WorkerContext {
                engine,
                consumer,
                running,
                events_tx,
                diagnostics,
                capture_sample_rate,
                target_sample_rate: TARGET_SAMPLE_RATE,
                flush_policy,
            });

            drop(capture);
        });

        match open_rx.recv() {
            Ok(Ok(_rate)) => {
                info!("pipeline started — listening");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                *self.state.lock() = PipelineState::Error;
                let _ = self.events_tx.send(PipelineEvent::Error(e.kind()));
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                *self.state.lock() = PipelineState::Error;
                Err(NextalkError::Unknown(
                    "pipeline worker task died before confirming device open".into(),
                ))
            }
        }
    }

    /// Stop capture and the worker loop per `flush_policy`.
    ///
    /// Guaranteed to release the audio device even if the engine raises
    /// mid-stop — the worker's `AudioCapture` is dropped unconditionally
    /// once its loop returns.
    pub fn stop(&self, flush_policy: FlushPolicy) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(NextalkError::Unknown("pipeline not running".into()));
        }
        *self.flush_policy.lock() = flush_policy;
        *self.state.lock() = PipelineState::Stopping;
        self.running.store(false, Ordering::SeqCst);
        info!(?flush_policy, "pipeline stop requested");
        Ok(())
    }
}

pub use worker::WorkerContext;
