//! Engine Initializer: resolves a preferred engine kind into a concrete,
//! already-initialized [`AsrEngine`], falling back to the alternate variant
//! when the preferred one's model assets are missing or broken.

use tracing::{info, warn};

#[cfg(feature = "onnx")]
use super::{segmented::SegmentedEngine, streaming::StreamingEngine, SegmentedConfig, StreamingConfig};
use super::AsrEngine;
use crate::error::{NextalkError, Result};
use crate::ipc::EngineKind;
use crate::model;

/// Outcome of resolving a preferred engine kind to a concrete engine.
pub struct InitializedEngine {
    pub kind: EngineKind,
    pub engine: Box<dyn AsrEngine>,
    /// `true` when the actual engine differs from the caller's preference.
    pub fallback_occurred: bool,
    pub fallback_reason: Option<String>,
}

fn alternate(kind: EngineKind) -> EngineKind {
    match kind {
        EngineKind::Streaming => EngineKind::Segmented,
        EngineKind::Segmented => EngineKind::Streaming,
    }
}

#[cfg(feature = "onnx")]
fn build_streaming_config() -> StreamingConfig {
    let dir = model::data_dir().join("models").join("zipformer");
    let tokens = dir.join("tokens.txt");
    StreamingConfig::from_model_dir(dir, tokens)
}

#[cfg(feature = "onnx")]
fn build_segmented_config() -> SegmentedConfig {
    let dir = model::data_dir().join("models").join("sensevoice");
    let tokens = dir.join("tokens.txt");
    let vad_path = model::data_dir()
        .join("models")
        .join("vad")
        .join("silero_vad.onnx");
    SegmentedConfig::from_model_dir(dir, tokens, vad_path)
}

/// Whether a given failure warrants falling back to the alternate engine,
/// per the Engine Initializer's contract (model asset problems only —
/// audio/socket failures are unrelated to engine selection).
fn is_model_failure(err: &NextalkError) -> bool {
    matches!(
        err,
        NextalkError::ModelNotFound(_)
            | NextalkError::ModelIncomplete { .. }
            | NextalkError::ModelLoadFailed(_)
    )
}

#[cfg(feature = "onnx")]
fn try_build(kind: EngineKind) -> Result<Box<dyn AsrEngine>> {
    match kind {
        EngineKind::Streaming => {
            let mut engine = StreamingEngine::new(build_streaming_config());
            engine.initialize()?;
            Ok(Box::new(engine))
        }
        EngineKind::Segmented => {
            let mut engine = SegmentedEngine::new(build_segmented_config());
            engine.initialize()?;
            Ok(Box::new(engine))
        }
    }
}

/// Without the `onnx` feature there is no concrete `AsrEngine` to build —
/// both variants need an ONNX Runtime session. Compiled in so the rest of
/// the crate (and any downstream crate building `nextalk-core` without ONNX,
/// e.g. to exercise the audio/model-store layers in isolation) still links.
#[cfg(not(feature = "onnx"))]
fn try_build(_kind: EngineKind) -> Result<Box<dyn AsrEngine>> {
    Err(NextalkError::ModelLoadFailed(
        "compiled without onnx feature: no ASR engine available".into(),
    ))
}

/// Initialize the preferred engine; on a model-asset failure, try the
/// alternate. Any other failure (e.g. a transient I/O error) propagates
/// without triggering fallback.
pub fn initialize_preferred(preferred: EngineKind) -> Result<InitializedEngine> {
    match try_build(preferred) {
        Ok(engine) => {
            info!(engine = ?preferred, "engine initialized on first attempt");
            Ok(InitializedEngine {
                kind: preferred,
                engine,
                fallback_occurred: false,
                fallback_reason: None,
            })
        }
        Err(primary_err) if is_model_failure(&primary_err) => {
            let alt = alternate(preferred);
            warn!(
                preferred = ?preferred,
                alternate = ?alt,
                error = %primary_err,
                "preferred engine unavailable, trying alternate"
            );
            match try_build(alt) {
                Ok(engine) => Ok(InitializedEngine {
                    kind: alt,
                    engine,
                    fallback_occurred: true,
                    fallback_reason: Some(primary_err.to_string()),
                }),
                Err(alt_err) => Err(NextalkError::ModelNotFound(format!(
                    "no ASR engine available: tried {preferred:?} ({primary_err}) and {alt:?} ({alt_err})"
                ))),
            }
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn with_empty_data_dir<T>(f: impl FnOnce() -> T) -> T {
        let _guard = crate::test_support::lock_env();
        let tmp = std::env::temp_dir().join(format!(
            "nextalk-init-test-{}-{:?}",
            std::process::id(),
            std::time::Instant::now()
        ));
        std::fs::create_dir_all(&tmp).unwrap();
        let prev = env::var_os("XDG_DATA_HOME");
        env::set_var("XDG_DATA_HOME", &tmp);
        let result = f();
        match prev {
            Some(v) => env::set_var("XDG_DATA_HOME", v),
            None => env::remove_var("XDG_DATA_HOME"),
        }
        let _ = std::fs::remove_dir_all(&tmp);
        result
    }

    #[test]
    fn falls_back_and_then_fails_when_no_assets_installed() {
        with_empty_data_dir(|| {
            let err = initialize_preferred(EngineKind::Streaming).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::ModelNotFound);
            match err {
                NextalkError::ModelNotFound(msg) => {
                    assert!(msg.contains("Streaming"));
                    assert!(msg.contains("Segmented"));
                }
                other => panic!("expected ModelNotFound aggregate error, got {other:?}"),
            }
        });
    }
}
