//! The per-cycle processing loop and its consolidated state.
//!
//! One `Pipeline` value owns every piece of loop state: the reframer,
//! the reference ring, the aligner counters, the arbiter state machine
//! and the transport handles. Each cycle executes in a fixed order:
//! capture/reframe, inbound receives, ring update, conditional resync,
//! detection, outbound send. The loop is single-threaded; no cycle
//! begins before the previous one's outbound send completed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aligner::{AlignerConfig, StreamAligner};
use crate::arbiter::{ArbiterConfig, CycleDecision, DetectionArbiter, DetectionState};
use crate::capture::{CaptureError, CaptureSource, Sample};
use crate::engine::WakeEngine;
use crate::fallback::{CommandEngine, Detection, EnergyEngineConfig};
use crate::notify::{DetectionEvent, NotificationSink, DETECTION_TOPIC};
use crate::reframer::{FrameReframer, ReframerConfig};
use crate::ring_buffer::{RingBuffer, RingBufferError, BYTES_PER_SAMPLE};
use crate::sync_channel::{SyncChannelConfig, SyncError, SyncTransport};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Ring(#[from] RingBufferError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture sample rate in Hz; fixed for the process lifetime.
    pub sample_rate: u32,

    /// Frames per capture period.
    pub period_frames: usize,

    /// Frames per hop; also the reference block size.
    pub hop_frames: usize,

    /// Reference blocks the ring can hold.
    pub ring_blocks: usize,

    /// Cycles between realignment attempts. A counter, not wall clock:
    /// at the default hop and rate, 100 cycles is 1.25 s.
    pub resync_cadence: u32,

    /// Confirmation window length in cycles.
    pub confirmation_cycles: u32,

    /// Sleep between retries of a short capture read, in milliseconds.
    pub retry_sleep_ms: u64,

    /// Underrun retries tolerated per capture period.
    pub max_read_retries: u32,

    /// Shared module providing the primary engine; `None` runs
    /// fallback-only.
    pub engine_path: Option<PathBuf>,

    /// Publish confirmed detections to the notification sink.
    pub notify_detections: bool,

    pub fallback: EnergyEngineConfig,

    pub queues: SyncChannelConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            period_frames: 128,
            hop_frames: 200,
            ring_blocks: 40,
            resync_cadence: 100,
            confirmation_cycles: 240,
            retry_sleep_ms: 10,
            max_read_retries: 500,
            engine_path: None,
            notify_detections: false,
            fallback: EnergyEngineConfig::default(),
            queues: SyncChannelConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample_rate must be greater than 0".to_string());
        }
        if self.ring_blocks < 2 {
            return Err("ring_blocks must be at least 2".to_string());
        }
        self.reframer_config().validate()?;
        self.aligner_config().validate()?;
        self.arbiter_config().validate()?;
        self.fallback.validate()?;
        self.queues.validate()?;
        Ok(())
    }

    pub fn reframer_config(&self) -> ReframerConfig {
        ReframerConfig {
            period_frames: self.period_frames,
            hop_frames: self.hop_frames,
            retry_sleep_ms: self.retry_sleep_ms,
            max_read_retries: self.max_read_retries,
        }
    }

    pub fn aligner_config(&self) -> AlignerConfig {
        AlignerConfig {
            resync_cadence: self.resync_cadence,
            hop_frames: self.hop_frames,
        }
    }

    pub fn arbiter_config(&self) -> ArbiterConfig {
        ArbiterConfig {
            confirmation_cycles: self.confirmation_cycles,
        }
    }
}

/// Counters exposed for logging and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub cycles: u64,
    pub resyncs: u64,
    pub detections: u64,
    pub bias_samples: i32,
}

/// What one full cycle produced.
#[derive(Debug, Clone, Copy)]
pub struct CycleOutcome {
    /// Offset sent outbound this cycle: raw detector offset plus the
    /// alignment bias. Sent every cycle, detection or not.
    pub offset_samples: i32,

    pub command: Option<Detection>,

    pub resynced: bool,
}

pub struct Pipeline<S: CaptureSource, T: SyncTransport> {
    config: PipelineConfig,
    reframer: FrameReframer<S>,
    transport: T,
    ring: RingBuffer,
    aligner: StreamAligner,
    arbiter: DetectionArbiter,
    notifier: Box<dyn NotificationSink>,
    hop: Vec<Sample>,
    reference: Vec<Sample>,
    block_bytes: Vec<u8>,
    stats: PipelineStats,
}

impl<S: CaptureSource, T: SyncTransport> Pipeline<S, T> {
    pub fn new(
        config: PipelineConfig,
        source: S,
        transport: T,
        primary: Option<Box<dyn WakeEngine>>,
        fallback_engine: Box<dyn CommandEngine>,
        notifier: Box<dyn NotificationSink>,
    ) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;

        let hop_bytes = config.hop_frames * BYTES_PER_SAMPLE;
        let ring = RingBuffer::new(config.ring_blocks * hop_bytes)?;

        info!(
            hop_frames = config.hop_frames,
            period_frames = config.period_frames,
            ring_blocks = config.ring_blocks,
            primary = primary.is_some(),
            "pipeline assembled"
        );

        Ok(Self {
            reframer: FrameReframer::new(source, config.reframer_config()),
            aligner: StreamAligner::new(config.aligner_config()),
            arbiter: DetectionArbiter::new(
                config.arbiter_config(),
                primary,
                fallback_engine,
                config.hop_frames,
            ),
            transport,
            ring,
            notifier,
            hop: vec![0; config.hop_frames],
            reference: vec![0; config.hop_frames],
            block_bytes: Vec::with_capacity(hop_bytes),
            stats: PipelineStats::default(),
            config,
        })
    }

    /// Run cycles until a fatal error. Detection anomalies never stop
    /// the loop; only capture and channel failures do.
    pub fn run(&mut self) -> Result<(), PipelineError> {
        loop {
            self.run_cycle()?;
        }
    }

    /// Execute one processing cycle in the fixed order.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, PipelineError> {
        self.reframer.next_hop(&mut self.hop)?;

        self.transport.recv_reference(&mut self.reference)?;
        let iteration = self.transport.recv_iteration()?;
        let trigger = self.transport.recv_trigger()?;

        self.absorb_reference_block()?;

        self.aligner.note_cycle();
        let mut resynced = false;
        if self.aligner.due(&self.ring) {
            resynced = self.aligner.try_resync(&self.hop, &mut self.ring).is_some();
            if resynced {
                self.stats.resyncs += 1;
            }
        }

        let decision = self.arbiter.process_cycle(
            &self.reference,
            &self.hop,
            self.config.notify_detections,
            iteration,
            trigger != 0,
        );

        let offset_samples = decision.offset_samples + self.aligner.bias_samples();
        self.transport.send_offset(offset_samples)?;

        self.finish_cycle(&decision, offset_samples, iteration);
        Ok(CycleOutcome {
            offset_samples,
            command: decision.command,
            resynced,
        })
    }

    /// Evict the oldest block when the ring is one block short of full,
    /// then absorb this cycle's reference block.
    fn absorb_reference_block(&mut self) -> Result<(), PipelineError> {
        let hop_bytes = self.config.hop_frames * BYTES_PER_SAMPLE;
        if self.ring.len() >= self.ring.capacity() - hop_bytes {
            self.ring.dequeue(hop_bytes)?;
        }

        self.block_bytes.clear();
        for &sample in &self.reference {
            self.block_bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.ring.enqueue(&self.block_bytes);
        Ok(())
    }

    fn finish_cycle(&mut self, decision: &CycleDecision, offset_samples: i32, iteration: i32) {
        self.stats.cycles += 1;
        self.stats.bias_samples = self.aligner.bias_samples();

        if let Some(detection) = decision.command {
            self.stats.detections += 1;
            debug!(
                command_id = detection.command_id,
                offset_samples, iteration, "command resolved"
            );

            if self.config.notify_detections {
                let event = DetectionEvent {
                    command_id: detection.command_id,
                    offset_samples,
                    iteration,
                };
                match serde_json::to_vec(&event) {
                    Ok(payload) => {
                        if !self.notifier.publish(DETECTION_TOPIC, &payload) {
                            warn!("notification sink rejected detection event");
                        }
                    }
                    Err(e) => warn!("failed to encode detection event: {}", e),
                }
            }
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn detection_state(&self) -> DetectionState {
        self.arbiter.state()
    }

    pub fn bias_samples(&self) -> i32 {
        self.aligner.bias_samples()
    }

    pub fn buffered_reference_bytes(&self) -> usize {
        self.ring.len()
    }
}
