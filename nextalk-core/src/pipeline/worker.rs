//! Blocking worker loop driving one `AsrEngine` from the audio ring buffer.
//!
//! ```text
//! 1. Drain ring buffer → Vec<f32> (one chunk per iteration)
//! 2. Resample to 16 kHz
//! 3. acceptWaveform(chunk)
//! 4. while isReady(): decode()
//! 5. getResult(); if changed since last read, emit Partial
//! 6. if isEndpoint(): emit Endpoint(result), continue
//! ```
//!
//! Runs inside `spawn_blocking`, keeping the async runtime free for sockets
//! and file I/O elsewhere in the process.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{EngineHandle, FlushPolicy, PipelineDiagnostics, PipelineEvent, PipelineState};
use crate::audio::resample::RateConverter;
use crate::buffering::AudioConsumer;
use crate::ipc::Transcript;

/// Chunk size drained from the ring buffer per iteration. 20 ms at 48 kHz.
const DRAIN_CHUNK: usize = 960;
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

pub struct WorkerContext {
    pub engine: EngineHandle,
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    pub events_tx: broadcast::Sender<PipelineEvent>,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub capture_sample_rate: u32,
    pub target_sample_rate: u32,
    pub flush_policy: Arc<parking_lot::Mutex<FlushPolicy>>,
}

pub fn run(mut ctx: WorkerContext) {
    info!("pipeline worker started");

    let mut resampler = match RateConverter::new(
        ctx.capture_sample_rate,
        ctx.target_sample_rate,
        DRAIN_CHUNK,
    ) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create resampler: {e}");
            let _ = ctx.events_tx.send(PipelineEvent::Error(e.kind()));
            return;
        }
    };

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut last_partial_text: Option<String> = None;

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(std::time::Duration::from_millis(DEFAULT_SLEEP_EMPTY_MS));
            continue;
        }
        ctx.diagnostics.frames_in.fetch_add(n, Ordering::Relaxed);

        let resampled = resampler.process(&raw[..n]);
        if resampled.is_empty() {
            continue;
        }
        ctx.diagnostics
            .frames_resampled
            .fetch_add(resampled.len(), Ordering::Relaxed);

        process_chunk(&mut ctx, &resampled, &mut last_partial_text);
    }

    let policy = *ctx.flush_policy.lock();
    finalize(&mut ctx, policy, &mut last_partial_text);

    let snap = ctx.diagnostics.snapshot();
    info!(
        frames_in = snap.frames_in,
        frames_resampled = snap.frames_resampled,
        decode_calls = snap.decode_calls,
        partials_emitted = snap.partials_emitted,
        endpoints_emitted = snap.endpoints_emitted,
        errors = snap.errors,
        "pipeline worker stopped"
    );
}

fn process_chunk(ctx: &mut WorkerContext, samples: &[f32], last_partial_text: &mut Option<String>) {
    let mut engine = ctx.engine.0.lock();
    engine.accept_waveform(samples);

    let mut guard_iterations = 0usize;
    while engine.is_ready() {
        engine.decode();
        ctx.diagnostics.decode_calls.fetch_add(1, Ordering::Relaxed);
        guard_iterations += 1;
        if guard_iterations > 64 {
            warn!("decode() loop exceeded iteration guard, breaking to avoid livelock");
            break;
        }
    }

    emit_result_if_changed(ctx, &mut engine, last_partial_text);

    if engine.is_endpoint() {
        let result = engine.get_result();
        debug!(text = %result.text, "endpoint");
        *last_partial_text = None;
        ctx.diagnostics
            .endpoints_emitted
            .fetch_add(1, Ordering::Relaxed);
        let _ = ctx.events_tx.send(PipelineEvent::Endpoint(result));
    }
}

fn emit_result_if_changed(
    ctx: &mut WorkerContext,
    engine: &mut Box<dyn crate::asr::AsrEngine>,
    last_partial_text: &mut Option<String>,
) {
    let result = engine.get_result();
    if result.text.is_empty() {
        return;
    }
    if last_partial_text.as_deref() != Some(result.text.as_str()) {
        *last_partial_text = Some(result.text.clone());
        ctx.diagnostics
            .partials_emitted
            .fetch_add(1, Ordering::Relaxed);
        let _ = ctx.events_tx.send(PipelineEvent::Partial(result));
    }
}

fn finalize(ctx: &mut WorkerContext, policy: FlushPolicy, last_partial_text: &mut Option<String>) {
    let mut engine = ctx.engine.0.lock();
    match policy {
        FlushPolicy::Commit => {
            engine.input_finished();
            if engine.is_endpoint() {
                let result = engine.get_result();
                ctx.diagnostics
                    .endpoints_emitted
                    .fetch_add(1, Ordering::Relaxed);
                let _ = ctx.events_tx.send(PipelineEvent::Endpoint(result));
            } else {
                let result: Transcript = engine.get_result();
                if !result.text.is_empty() {
                    let _ = ctx.events_tx.send(PipelineEvent::Endpoint(result));
                }
            }
            *last_partial_text = None;
        }
        FlushPolicy::Discard => {
            engine.reset();
            *last_partial_text = None;
        }
    }
}
