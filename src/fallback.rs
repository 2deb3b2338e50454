//! Fallback/confirmation command engine.
//!
//! The fallback engine works on its own frame size (480 samples of
//! 16-bit PCM), distinct from the pipeline hop, so hops are converted
//! and regrouped through a small frame bank before each phase-processing
//! call. The compiled-in engine is energy-based; the trait is the seam
//! for a vendor model.

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::capture::Sample;

/// Identity of a recognized voice command.
pub type CommandId = i16;

/// A confirmed command with its detector-reported start offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub command_id: CommandId,
    pub start_offset_samples: i32,
}

/// Phase-processing contract of the fallback engine.
///
/// One call consumes exactly one frame of [`Self::frame_size`] samples
/// and reports a command if the recognition phase finalized on it.
pub trait CommandEngine {
    fn frame_size(&self) -> usize;

    fn process_phase(&mut self, frame: &[i16], notify: bool, iteration: i32)
        -> Option<Detection>;

    /// Forget any partially recognized command.
    fn reset(&mut self);
}

/// Regroups hops of 32-bit capture samples into engine-sized frames of
/// 16-bit PCM.
pub struct FrameBank {
    bank: HeapRb<i16>,
    frame: Vec<i16>,
    pcm: Vec<i16>,
}

impl FrameBank {
    /// `capacity_frames` bounds how much converted audio can sit between
    /// phase-processing calls; six hops comfortably covers one frame plus
    /// one hop of slack.
    pub fn new(frame_size: usize, capacity_samples: usize) -> Self {
        Self {
            bank: HeapRb::new(capacity_samples),
            frame: vec![0; frame_size],
            pcm: Vec::new(),
        }
    }

    /// Convert one hop to 16-bit PCM and append it to the bank.
    pub fn push_hop(&mut self, hop: &[Sample]) {
        self.pcm.clear();
        self.pcm.extend(hop.iter().map(|&s| (s >> 16) as i16));

        let pushed = self.bank.push_slice(&self.pcm);
        debug_assert_eq!(pushed, self.pcm.len(), "frame bank sized too small");
    }

    /// Pop the next full frame, if one has accumulated.
    pub fn next_frame(&mut self) -> Option<&[i16]> {
        if self.bank.occupied_len() < self.frame.len() {
            return None;
        }

        let popped = self.bank.pop_slice(&mut self.frame);
        debug_assert_eq!(popped, self.frame.len());
        Some(&self.frame)
    }

    pub fn buffered_samples(&self) -> usize {
        self.bank.occupied_len()
    }

    /// Discard all banked samples, including any partial frame.
    pub fn clear(&mut self) {
        while self.bank.try_pop().is_some() {}
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyEngineConfig {
    /// Samples per phase-processing frame.
    pub frame_size: usize,

    /// RMS threshold (on normalized 16-bit PCM) for a voiced frame.
    pub energy_threshold: f32,

    /// Zero-crossing-rate threshold for a voiced frame.
    pub zcr_threshold: f32,

    /// Consecutive voiced frames required to report a command.
    pub voiced_frames_required: usize,
}

impl Default for EnergyEngineConfig {
    fn default() -> Self {
        Self {
            frame_size: 480,
            energy_threshold: 0.02,
            zcr_threshold: 0.01,
            voiced_frames_required: 3,
        }
    }
}

impl EnergyEngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.frame_size == 0 {
            return Err("frame_size must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.energy_threshold) {
            return Err("energy_threshold must be between 0.0 and 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.zcr_threshold) {
            return Err("zcr_threshold must be between 0.0 and 1.0".to_string());
        }
        if self.voiced_frames_required == 0 {
            return Err("voiced_frames_required must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Compiled-in command engine based on frame energy and zero-crossing
/// rate. A run of consecutive voiced frames is reported as one command
/// whose start offset spans the voiced run.
pub struct EnergyCommandEngine {
    config: EnergyEngineConfig,
    /// Standalone engines detect on their own; confirmation engines
    /// re-evaluate audio already flagged by the primary path.
    standalone: bool,
    voiced_run: usize,
}

impl EnergyCommandEngine {
    pub fn open(config: EnergyEngineConfig, standalone: bool) -> Self {
        info!(
            standalone,
            frame_size = config.frame_size,
            "opening built-in command engine"
        );

        Self {
            config,
            standalone,
            voiced_run: 0,
        }
    }

    pub fn is_standalone(&self) -> bool {
        self.standalone
    }

    fn rms(frame: &[i16]) -> f32 {
        let sum_squares: f64 = frame
            .iter()
            .map(|&s| {
                let normalized = s as f64 / i16::MAX as f64;
                normalized * normalized
            })
            .sum();
        (sum_squares / frame.len() as f64).sqrt() as f32
    }

    fn zero_crossing_rate(frame: &[i16]) -> f32 {
        if frame.len() < 2 {
            return 0.0;
        }
        let crossings = frame
            .windows(2)
            .filter(|pair| (pair[0] >= 0 && pair[1] < 0) || (pair[0] < 0 && pair[1] >= 0))
            .count();
        crossings as f32 / (frame.len() - 1) as f32
    }
}

impl CommandEngine for EnergyCommandEngine {
    fn frame_size(&self) -> usize {
        self.config.frame_size
    }

    fn process_phase(
        &mut self,
        frame: &[i16],
        notify: bool,
        iteration: i32,
    ) -> Option<Detection> {
        let energy = Self::rms(frame);
        let zcr = Self::zero_crossing_rate(frame);
        let voiced = energy > self.config.energy_threshold && zcr > self.config.zcr_threshold;

        trace!(energy, zcr, voiced, run = self.voiced_run, "phase frame");

        if !voiced {
            self.voiced_run = 0;
            return None;
        }

        self.voiced_run += 1;
        if self.voiced_run < self.config.voiced_frames_required {
            return None;
        }

        let detection = Detection {
            command_id: 1,
            start_offset_samples: (self.voiced_run * self.config.frame_size) as i32,
        };
        self.voiced_run = 0;

        debug!(
            command_id = detection.command_id,
            start_offset = detection.start_offset_samples,
            notify,
            iteration,
            "command recognized"
        );
        Some(detection)
    }

    fn reset(&mut self) {
        self.voiced_run = 0;
    }
}

/// Owns a command engine plus the frame bank feeding it.
pub struct PhaseRunner {
    engine: Box<dyn CommandEngine>,
    bank: FrameBank,
}

impl PhaseRunner {
    /// `hop_frames` sizes the bank; six hops of slack matches the
    /// engine's worst-case carry between cycles.
    pub fn new(engine: Box<dyn CommandEngine>, hop_frames: usize) -> Self {
        let frame_size = engine.frame_size();
        let capacity = (6 * hop_frames).max(frame_size + hop_frames);

        Self {
            engine,
            bank: FrameBank::new(frame_size, capacity),
        }
    }

    /// Feed one hop and run the phase processor over every full frame
    /// that becomes available. Stops at the first recognized command.
    pub fn push_hop(&mut self, hop: &[Sample], notify: bool, iteration: i32) -> Option<Detection> {
        self.bank.push_hop(hop);

        while let Some(frame) = self.bank.next_frame() {
            if let Some(detection) = self.engine.process_phase(frame, notify, iteration) {
                return Some(detection);
            }
        }
        None
    }

    /// Drop banked audio and any partially recognized command.
    pub fn reset(&mut self) {
        self.bank.clear();
        self.engine.reset();
    }
}
