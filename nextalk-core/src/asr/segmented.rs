//! Segmented ASR engine: Silero VAD gates a FIFO of offline-recognized
//! utterances.
//!
//! `acceptWaveform` feeds a fixed 512-sample Silero window. A completed
//! segment (silence ≥ `minSilenceDuration` after speech ≥
//! `minSpeechDuration`, or speech reaching `maxSpeechDuration`) is submitted
//! to the offline recognizer immediately, and the resulting transcript is
//! queued. `isEndpoint()` pops one queued result per call — multiple
//! segments completed between polls are drained one endpoint at a time.

use std::collections::VecDeque;
use std::path::Path;

use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use tracing::{info, warn};

use super::{AsrEngine, SegmentedConfig};
use crate::buffering::chunk::AudioChunk;
use crate::error::{NextalkError, Result};
use crate::ipc::Transcript;
use crate::vad::{SileroVad, VadDecision, VoiceActivityDetector};

use super::tokens::Vocabulary;

fn create_onnx_session(path: &Path) -> Result<Session> {
    SessionBuilder::new()
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?
        .commit_from_file(path)
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))
}

pub struct SegmentedEngine {
    config: SegmentedConfig,
    vad: Option<SileroVad>,
    recognizer: Option<Session>,
    vocab: Option<Vocabulary>,

    sample_rate: u32,
    /// Samples accumulated for the in-progress segment.
    segment_buf: Vec<f32>,
    /// Trailing silent samples observed since speech last stopped.
    trailing_silence_samples: usize,
    in_speech: bool,

    /// Completed transcripts awaiting delivery, FIFO.
    results_queue: VecDeque<Transcript>,
    /// The transcript returned by `get_result` until the next pop.
    current_result: Transcript,
}

impl SegmentedEngine {
    pub fn new(config: SegmentedConfig) -> Self {
        Self {
            config,
            vad: None,
            recognizer: None,
            vocab: None,
            sample_rate: 16_000,
            segment_buf: Vec::new(),
            trailing_silence_samples: 0,
            in_speech: false,
            results_queue: VecDeque::new(),
            current_result: Transcript::new(""),
        }
    }

    fn min_speech_samples(&self) -> usize {
        (self.config.min_speech_duration_secs * self.sample_rate as f32) as usize
    }

    fn min_silence_samples(&self) -> usize {
        (self.config.min_silence_duration_secs * self.sample_rate as f32) as usize
    }

    fn max_speech_samples(&self) -> usize {
        (self.config.max_speech_duration_secs * self.sample_rate as f32) as usize
    }

    fn complete_segment(&mut self) {
        if self.segment_buf.len() < self.min_speech_samples() {
            self.segment_buf.clear();
            self.trailing_silence_samples = 0;
            self.in_speech = false;
            return;
        }
        let samples = std::mem::take(&mut self.segment_buf);
        self.trailing_silence_samples = 0;
        self.in_speech = false;

        match self.run_recognizer(&samples) {
            Ok(transcript) => {
                self.results_queue.push_back(transcript);
            }
            Err(e) => {
                warn!(error = %e, samples = samples.len(), "offline recognizer failed on segment");
            }
        }
    }

    fn run_recognizer(&mut self, samples: &[f32]) -> Result<Transcript> {
        let (Some(recognizer), Some(vocab)) = (self.recognizer.as_mut(), self.vocab.as_ref())
        else {
            return Err(NextalkError::ModelLoadFailed(
                "recognizer not initialized".into(),
            ));
        };

        let arr = ndarray::Array2::<f32>::from_shape_vec((1, samples.len()), samples.to_vec())
            .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
        let value = Value::from_array(arr)
            .map_err(|e: ort::Error| NextalkError::ModelLoadFailed(e.to_string()))?;
        let input_name = recognizer
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or_else(|| NextalkError::ModelLoadFailed("recognizer has no inputs".into()))?;
        let inputs: Vec<(String, SessionInputValue<'_>)> = vec![(input_name, value.into())];
        let outputs = recognizer
            .run(inputs)
            .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
        let (_, ids) = outputs[0]
            .try_extract_tensor::<i64>()
            .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;

        let text = vocab.decode(ids.as_slice().unwrap_or(&[]));
        let mut transcript = Transcript::new(text);

        // SenseVoice-style recognizers may emit a leading language/emotion tag
        // output; surface it when present as a second output tensor.
        if let Some(tag_output) = outputs.get(1) {
            if let Ok((_, tag_ids)) = tag_output.try_extract_tensor::<i64>() {
                if let Some(&id) = tag_ids.first() {
                    if let Some(tok) = vocab.token(id as usize) {
                        if !tok.is_empty() {
                            transcript.language = Some(tok.to_string());
                        }
                    }
                }
            }
        }

        Ok(transcript)
    }
}

impl AsrEngine for SegmentedEngine {
    fn initialize(&mut self) -> Result<()> {
        if !self.config.recognizer_path.exists() {
            return Err(NextalkError::model_not_found(&self.config.recognizer_path));
        }
        if !self.config.tokens_path.exists() {
            return Err(NextalkError::model_not_found(&self.config.tokens_path));
        }
        if !self.config.vad_path.exists() {
            return Err(NextalkError::model_not_found(&self.config.vad_path));
        }

        self.recognizer = Some(create_onnx_session(&self.config.recognizer_path)?);
        self.vocab = Some(Vocabulary::load(&self.config.tokens_path)?);
        self.vad = Some(SileroVad::new(&self.config.vad_path, self.config.vad_threshold)?);

        info!(
            recognizer = ?self.config.recognizer_path,
            vocab_size = self.vocab.as_ref().map(Vocabulary::len).unwrap_or(0),
            "segmented engine initialized"
        );
        Ok(())
    }

    fn accept_waveform(&mut self, samples: &[f32]) {
        let Some(vad) = self.vad.as_mut() else {
            return;
        };
        if samples.is_empty() {
            return;
        }

        let chunk = AudioChunk::new(samples.to_vec(), self.sample_rate);
        let decision = vad.classify(&chunk);

        match decision {
            VadDecision::Speech => {
                self.in_speech = true;
                self.trailing_silence_samples = 0;
                self.segment_buf.extend_from_slice(samples);
                if self.segment_buf.len() >= self.max_speech_samples() {
                    self.complete_segment();
                }
            }
            VadDecision::Silence => {
                if self.in_speech {
                    self.trailing_silence_samples =
                        self.trailing_silence_samples.saturating_add(samples.len());
                    self.segment_buf.extend_from_slice(samples);
                    if self.trailing_silence_samples >= self.min_silence_samples() {
                        self.complete_segment();
                    }
                }
            }
        }
    }

    fn decode(&mut self) {
        // No-op: segments are processed inline as soon as VAD completes them.
    }

    fn is_ready(&self) -> bool {
        false
    }

    fn get_result(&self) -> Transcript {
        self.current_result.clone()
    }

    fn is_endpoint(&mut self) -> bool {
        if let Some(next) = self.results_queue.pop_front() {
            self.current_result = next;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.segment_buf.clear();
        self.trailing_silence_samples = 0;
        self.in_speech = false;
        self.results_queue.clear();
        if let Some(vad) = self.vad.as_mut() {
            vad.reset();
        }
    }

    fn input_finished(&mut self) {
        if self.in_speech && !self.segment_buf.is_empty() {
            self.complete_segment();
        }
    }

    fn dispose(&mut self) {
        self.vad = None;
        self.recognizer = None;
        self.vocab = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_config() -> SegmentedConfig {
        SegmentedConfig {
            recognizer_path: "/nonexistent/model.onnx".into(),
            tokens_path: "/nonexistent/tokens.txt".into(),
            vad_path: "/nonexistent/silero_vad.onnx".into(),
            vad_threshold: 0.5,
            min_silence_duration_secs: 0.5,
            min_speech_duration_secs: 0.25,
            max_speech_duration_secs: 10.0,
            ring_buffer_secs: 30.0,
        }
    }

    #[test]
    fn initialize_fails_fast_on_missing_recognizer() {
        let mut engine = SegmentedEngine::new(bare_config());
        let err = engine.initialize().unwrap_err();
        assert!(matches!(err, NextalkError::ModelNotFound(_)));
    }

    #[test]
    fn decode_is_a_no_op() {
        let mut engine = SegmentedEngine::new(bare_config());
        engine.decode();
        assert!(!engine.is_ready());
    }

    #[test]
    fn is_endpoint_false_with_empty_queue() {
        let mut engine = SegmentedEngine::new(bare_config());
        assert!(!engine.is_endpoint());
    }

    #[test]
    fn accept_waveform_without_initialized_vad_is_a_no_op() {
        let mut engine = SegmentedEngine::new(bare_config());
        // vad is None pre-initialize(); should not panic
        engine.accept_waveform(&[0.1; 960]);
        assert!(engine.segment_buf.is_empty());
    }
}
