//! # nextalk-core
//!
//! Offline voice-input runtime: audio capture, ASR engines, the on-disk
//! model store, and the inference pipeline that drives them.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → Pipeline(spawn_blocking)
//!                                                    │
//!                                             AsrEngine::accept_waveform
//!                                                    │
//!                                          broadcast::Sender<Transcript>
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens in the pipeline
//! thread. `model` resolves on-disk assets before either engine variant can
//! initialize.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod asr;
pub mod audio;
pub mod buffering;
pub mod error;
pub mod ipc;
pub mod model;
pub mod pipeline;
pub mod vad;

// Convenience re-exports for downstream crates
pub use asr::{AsrEngine, EngineConfig};
pub use error::{ErrorKind, NextalkError, Result};
pub use ipc::{CapsuleState, EngineKind, ModelStatus, Transcript};
pub use model::ModelAsset;
pub use pipeline::Pipeline;

#[cfg(feature = "onnx")]
pub use vad::SileroVad;

/// Serializes tests across the crate that mutate process-wide environment
/// variables (`XDG_DATA_HOME`) so they don't stomp on each other when the
/// test harness runs them concurrently.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
