//! ASR Engine abstraction.
//!
//! Two concrete variants share one contract: [`streaming`] (an online
//! zipformer-style transducer, partials every decode tick) and [`segmented`]
//! (Silero VAD gates a FIFO of completed utterances fed to an offline
//! recognizer). [`init`] resolves which variant actually starts, falling
//! back to the alternate engine when the preferred one's model assets are
//! missing or broken.

pub mod init;
pub mod tokens;

#[cfg(feature = "onnx")]
pub mod segmented;
#[cfg(feature = "onnx")]
pub mod streaming;

use std::path::PathBuf;

use crate::error::Result;
use crate::ipc::Transcript;

/// Decode search strategy for the streaming transducer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeStrategy {
    Greedy,
    Beam { width: usize },
}

impl Default for DecodeStrategy {
    fn default() -> Self {
        DecodeStrategy::Beam { width: 4 }
    }
}

/// Configuration for the `streaming` engine variant.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub encoder_path: PathBuf,
    pub decoder_path: PathBuf,
    pub joiner_path: PathBuf,
    pub tokens_path: PathBuf,
    /// Trailing silence that always ends an utterance. Default: 2.4 s.
    pub short_pause_threshold_secs: f32,
    /// Trailing silence that ends an utterance once some tokens have
    /// already been decoded. Default: 1.2 s.
    pub long_pause_threshold_secs: f32,
    /// Hard ceiling on utterance length regardless of silence. Default: 20 s.
    pub max_utterance_secs: f32,
    pub decode_strategy: DecodeStrategy,
}

impl StreamingConfig {
    pub fn from_model_dir(dir: PathBuf, tokens_path: PathBuf) -> Self {
        Self {
            encoder_path: dir.join("encoder.onnx"),
            decoder_path: dir.join("decoder.onnx"),
            joiner_path: dir.join("joiner.onnx"),
            tokens_path,
            short_pause_threshold_secs: 2.4,
            long_pause_threshold_secs: 1.2,
            max_utterance_secs: 20.0,
            decode_strategy: DecodeStrategy::default(),
        }
    }
}

/// Configuration for the `segmented` engine variant.
#[derive(Debug, Clone)]
pub struct SegmentedConfig {
    pub recognizer_path: PathBuf,
    pub tokens_path: PathBuf,
    pub vad_path: PathBuf,
    pub vad_threshold: f32,
    /// Minimum trailing silence before a segment is considered complete.
    pub min_silence_duration_secs: f32,
    /// Minimum accumulated speech before a segment can be emitted.
    pub min_speech_duration_secs: f32,
    /// Hard ceiling on one segment's length. Default: 10 s.
    pub max_speech_duration_secs: f32,
    /// Ring buffer retained for VAD context. Default: 30 s.
    pub ring_buffer_secs: f32,
}

impl SegmentedConfig {
    pub fn from_model_dir(dir: PathBuf, tokens_path: PathBuf, vad_path: PathBuf) -> Self {
        Self {
            recognizer_path: dir.join("model.onnx"),
            tokens_path,
            vad_path,
            vad_threshold: 0.5,
            min_silence_duration_secs: 0.5,
            min_speech_duration_secs: 0.25,
            max_speech_duration_secs: 10.0,
            ring_buffer_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EngineConfig {
    Streaming(StreamingConfig),
    Segmented(SegmentedConfig),
}

/// Common contract implemented by both ASR engine variants.
///
/// One instance is used by exactly one pipeline thread at a time;
/// `dispose` must be safe to call in any state, including before
/// `initialize` or after a prior `dispose`.
pub trait AsrEngine: Send {
    /// Load model assets and prepare the decoder. Called once before any
    /// other method.
    fn initialize(&mut self) -> Result<()>;

    /// Hand raw samples to the engine. The borrow ends when this call
    /// returns — implementations must copy anything they need to retain.
    fn accept_waveform(&mut self, samples: &[f32]);

    /// Pump the decoder. No-op for `segmented` (processing happens on
    /// segment completion instead).
    fn decode(&mut self);

    /// Whether a new decode result is available. Always `false` for
    /// `segmented`.
    fn is_ready(&self) -> bool;

    /// The latest partial (streaming) or latest completed segment
    /// (segmented).
    fn get_result(&self) -> Transcript;

    /// Whether an endpoint fired since the last call. Latched: reading it
    /// clears it back to `false`.
    fn is_endpoint(&mut self) -> bool;

    /// Clear decoder state; keep the model loaded.
    fn reset(&mut self);

    /// Flush any buffered audio. For `segmented`, forces processing of a
    /// pending VAD segment even if silence hasn't yet been observed.
    fn input_finished(&mut self);

    /// Release native resources. Safe to call more than once.
    fn dispose(&mut self);
}
