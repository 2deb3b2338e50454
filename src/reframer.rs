//! Capture-period to hop regrouping.
//!
//! The capture device delivers fixed-size periods while the alignment
//! and detection stage consumes fixed-size hops, and neither size divides
//! the other. The reframer accumulates periods and emits exact hops,
//! spanning period boundaries where needed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::capture::{CaptureError, CaptureSource, Sample};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReframerConfig {
    /// Frames delivered per capture read.
    pub period_frames: usize,

    /// Frames per emitted hop.
    pub hop_frames: usize,

    /// Sleep between retries of a short capture read.
    pub retry_sleep_ms: u64,

    /// Underrun retries tolerated per period before the capture is
    /// considered stalled.
    pub max_read_retries: u32,
}

impl Default for ReframerConfig {
    fn default() -> Self {
        Self {
            period_frames: 128,
            hop_frames: 200,
            retry_sleep_ms: 10,
            max_read_retries: 500,
        }
    }
}

impl ReframerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.period_frames == 0 {
            return Err("period_frames must be greater than 0".to_string());
        }
        if self.hop_frames == 0 {
            return Err("hop_frames must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Converts capture periods into hops.
pub struct FrameReframer<S: CaptureSource> {
    source: S,
    config: ReframerConfig,
    period: Vec<Sample>,
    /// Read cursor into `period`; equal to `period_frames` when the
    /// current period is exhausted.
    capture_pos: usize,
}

impl<S: CaptureSource> FrameReframer<S> {
    pub fn new(source: S, config: ReframerConfig) -> Self {
        let period = vec![0; config.period_frames];
        let capture_pos = config.period_frames;

        Self {
            source,
            config,
            period,
            capture_pos,
        }
    }

    /// Fill `hop` with the next hop of captured audio.
    ///
    /// Pulls a new period from the source only when the current one is
    /// exhausted. Short reads are retried with a bounded backoff; a hard
    /// read error or an exhausted retry budget propagates to the caller.
    pub fn next_hop(&mut self, hop: &mut [Sample]) -> Result<(), CaptureError> {
        let mut filled = 0;

        while filled < hop.len() {
            if self.capture_pos == self.config.period_frames {
                self.refill_period()?;
            }

            let take = (self.config.period_frames - self.capture_pos).min(hop.len() - filled);
            hop[filled..filled + take]
                .copy_from_slice(&self.period[self.capture_pos..self.capture_pos + take]);
            filled += take;
            self.capture_pos += take;
        }

        Ok(())
    }

    fn refill_period(&mut self) -> Result<(), CaptureError> {
        let mut got = 0;
        let mut retries = 0;

        while got < self.config.period_frames {
            got += self.source.read_frames(&mut self.period[got..])?;

            if got < self.config.period_frames {
                retries += 1;
                if retries > self.config.max_read_retries {
                    warn!(got, retries, "capture never delivered a full period");
                    return Err(CaptureError::Stalled { retries });
                }
                trace!(got, retries, "transient capture underrun, retrying");
                std::thread::sleep(Duration::from_millis(self.config.retry_sleep_ms));
            }
        }

        self.capture_pos = 0;
        Ok(())
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ScriptedCapture;

    fn config(period: usize, hop: usize) -> ReframerConfig {
        ReframerConfig {
            period_frames: period,
            hop_frames: hop,
            retry_sleep_ms: 0,
            max_read_retries: 4,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(ReframerConfig::default().validate().is_ok());
        assert!(config(0, 200).validate().is_err());
        assert!(config(128, 0).validate().is_err());
    }

    #[test]
    fn test_hops_span_period_boundaries() {
        // 128-frame periods, 200-frame hops: every hop crosses a boundary.
        let samples: Vec<i32> = (0..1024).collect();
        let source = ScriptedCapture::new(samples);
        let mut reframer = FrameReframer::new(source, config(128, 200));

        let mut hop = vec![0; 200];
        reframer.next_hop(&mut hop).unwrap();
        assert_eq!(hop, (0..200).collect::<Vec<i32>>());

        reframer.next_hop(&mut hop).unwrap();
        assert_eq!(hop, (200..400).collect::<Vec<i32>>());
    }

    #[test]
    fn test_period_larger_than_hop() {
        let samples: Vec<i32> = (0..900).collect();
        let source = ScriptedCapture::new(samples);
        let mut reframer = FrameReframer::new(source, config(300, 100));

        let mut hop = vec![0; 100];
        for expected_start in [0, 100, 200, 300] {
            reframer.next_hop(&mut hop).unwrap();
            assert_eq!(hop[0], expected_start);
            assert_eq!(hop[99], expected_start + 99);
        }
    }

    #[test]
    fn test_underrun_is_retried_without_losing_samples() {
        let samples: Vec<i32> = (0..256).collect();
        // First period arrives in dribs: 50, 0, 78 frames.
        let source = ScriptedCapture::new(samples).with_read_limits(vec![50, 0, 78]);
        let mut reframer = FrameReframer::new(source, config(128, 64));

        let mut hop = vec![0; 64];
        reframer.next_hop(&mut hop).unwrap();
        assert_eq!(hop, (0..64).collect::<Vec<i32>>());
        reframer.next_hop(&mut hop).unwrap();
        assert_eq!(hop, (64..128).collect::<Vec<i32>>());
    }

    #[test]
    fn test_stall_exhausts_retry_budget() {
        let samples: Vec<i32> = (0..16).collect();
        // Every read returns zero frames after the first trickle.
        let source = ScriptedCapture::new(samples).with_read_limits(vec![8, 0, 0, 0, 0, 0]);
        let mut reframer = FrameReframer::new(source, config(128, 64));

        let mut hop = vec![0; 64];
        match reframer.next_hop(&mut hop) {
            Err(CaptureError::Stalled { retries }) => assert_eq!(retries, 5),
            other => panic!("expected stall, got {:?}", other),
        }
    }

    #[test]
    fn test_hard_read_error_propagates() {
        let source = ScriptedCapture::new(vec![1; 64]);
        let mut reframer = FrameReframer::new(source, config(64, 64));

        let mut hop = vec![0; 64];
        reframer.next_hop(&mut hop).unwrap();
        assert!(matches!(
            reframer.next_hop(&mut hop),
            Err(CaptureError::Read(_))
        ));
    }
}
