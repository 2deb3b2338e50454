//! Exact-match realignment between the reference stream and the live
//! capture.
//!
//! The reference blocks and the locally reframed capture travel through
//! independent paths with independent latency, so their sample positions
//! drift apart. Periodically the freshly captured hop is used as a search
//! key into the buffered reference stream; on an exact full-length match
//! everything up to and including the match is discarded and the
//! remaining buffered span becomes the bias applied to reported keyword
//! offsets.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::capture::Sample;
use crate::ring_buffer::{RingBuffer, BYTES_PER_SAMPLE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignerConfig {
    /// Cycles between realignment attempts.
    pub resync_cadence: u32,

    /// Frames per hop; one hop is the search key length.
    pub hop_frames: usize,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            resync_cadence: 100,
            hop_frames: 200,
        }
    }
}

impl AlignerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.resync_cadence == 0 {
            return Err("resync_cadence must be greater than 0".to_string());
        }
        if self.hop_frames == 0 {
            return Err("hop_frames must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Drift corrector between the reference ring and the capture stream.
pub struct StreamAligner {
    config: AlignerConfig,
    frames_since_resync: u32,
    accumulated_offset: i32,
}

impl StreamAligner {
    pub fn new(config: AlignerConfig) -> Self {
        Self {
            config,
            frames_since_resync: 0,
            accumulated_offset: 0,
        }
    }

    /// Record one processing cycle.
    pub fn note_cycle(&mut self) {
        self.frames_since_resync = self.frames_since_resync.saturating_add(1);
    }

    /// Whether a realignment attempt is due this cycle.
    ///
    /// Requires a full cadence to have elapsed and at least two hops of
    /// buffered reference audio, so the search window is never smaller
    /// than the key.
    pub fn due(&self, ring: &RingBuffer) -> bool {
        self.frames_since_resync > self.config.resync_cadence
            && ring.len() >= 2 * self.config.hop_frames * BYTES_PER_SAMPLE
    }

    /// Attempt to realign using `key` (the freshly captured hop) against
    /// the buffered reference stream.
    ///
    /// On a match at sample index `idx`, everything up to and including
    /// the matched span is dequeued and the remaining buffered samples
    /// become the new offset bias. Returns the matched index, or `None`
    /// when the key does not occur. Either way the cadence counter
    /// restarts, so the next attempt happens a full cadence later.
    pub fn try_resync(&mut self, key: &[Sample], ring: &mut RingBuffer) -> Option<usize> {
        self.frames_since_resync = 0;

        let idx = find_exact_match(key, ring)?;
        let consumed = (idx + key.len()) * BYTES_PER_SAMPLE;
        if ring.dequeue(consumed).is_err() {
            // Unreachable while find_exact_match bounds its candidates.
            return None;
        }

        self.accumulated_offset = ring.sample_len() as i32;
        debug!(
            matched_at = idx,
            bias_samples = self.accumulated_offset,
            "streams realigned"
        );
        Some(idx)
    }

    /// Sample correction applied to reported offsets since the last
    /// successful realignment.
    pub fn bias_samples(&self) -> i32 {
        self.accumulated_offset
    }

    pub fn frames_since_resync(&self) -> u32 {
        self.frames_since_resync
    }
}

/// Scan the ring's logical content for the first exact full-length
/// occurrence of `key`, comparing 4-byte samples.
///
/// Candidate start positions stop where the key would run past the
/// buffered content, so a partially present key never matches.
pub fn find_exact_match(key: &[Sample], ring: &RingBuffer) -> Option<usize> {
    let total = ring.sample_len();
    if key.is_empty() || total < key.len() {
        return None;
    }

    'candidates: for start in 0..=(total - key.len()) {
        for (j, &expected) in key.iter().enumerate() {
            if ring.sample_at(start + j) != expected {
                continue 'candidates;
            }
        }
        trace!(start, "exact match found");
        return Some(start);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(samples: &[i32], capacity_samples: usize) -> RingBuffer {
        let mut ring = RingBuffer::new(capacity_samples * BYTES_PER_SAMPLE).unwrap();
        for &s in samples {
            ring.enqueue(&s.to_le_bytes());
        }
        ring
    }

    #[test]
    fn test_match_finds_first_occurrence() {
        let ring = ring_with(&[5, 6, 7, 8, 9, 7, 8, 9], 16);
        assert_eq!(find_exact_match(&[7, 8, 9], &ring), Some(2));
    }

    #[test]
    fn test_match_at_start_and_end() {
        let ring = ring_with(&[1, 2, 3, 4, 5], 8);
        assert_eq!(find_exact_match(&[1, 2], &ring), Some(0));
        assert_eq!(find_exact_match(&[4, 5], &ring), Some(3));
    }

    #[test]
    fn test_no_partial_match_tolerance() {
        let ring = ring_with(&[1, 2, 3, 4], 8);
        // Prefix present, tail differs.
        assert_eq!(find_exact_match(&[3, 4, 5], &ring), None);
        // Key longer than the buffered content never matches.
        assert_eq!(find_exact_match(&[1, 2, 3, 4, 5], &ring), None);
    }

    #[test]
    fn test_match_across_storage_wrap() {
        let mut ring = ring_with(&[1, 2, 3, 4, 5, 6], 8);
        ring.dequeue(4 * BYTES_PER_SAMPLE).unwrap();
        // These writes wrap around the end of storage.
        for s in [7, 8, 9] {
            ring.enqueue(&(s as i32).to_le_bytes());
        }
        assert_eq!(find_exact_match(&[6, 7, 8], &ring), Some(1));
    }

    #[test]
    fn test_resync_discards_through_match_and_sets_bias() {
        let mut ring = ring_with(&[10, 11, 12, 13, 14, 15, 16, 17], 16);
        let mut aligner = StreamAligner::new(AlignerConfig {
            resync_cadence: 100,
            hop_frames: 2,
        });

        let matched = aligner.try_resync(&[12, 13], &mut ring);
        assert_eq!(matched, Some(2));
        // Everything through the match is gone; four samples remain.
        assert_eq!(ring.sample_len(), 4);
        assert_eq!(ring.sample_at(0), 14);
        assert_eq!(aligner.bias_samples(), 4);
        assert_eq!(aligner.frames_since_resync(), 0);
    }

    #[test]
    fn test_resync_is_not_spuriously_repeatable() {
        let mut ring = ring_with(&[10, 11, 12, 13, 14, 15], 16);
        let mut aligner = StreamAligner::new(AlignerConfig {
            resync_cadence: 100,
            hop_frames: 2,
        });

        assert!(aligner.try_resync(&[12, 13], &mut ring).is_some());
        // The key has been consumed; repeating the attempt finds nothing
        // and leaves the buffered content untouched.
        let before = ring.sample_len();
        assert!(aligner.try_resync(&[12, 13], &mut ring).is_none());
        assert_eq!(ring.sample_len(), before);
    }

    #[test]
    fn test_no_match_leaves_state_unchanged() {
        let mut ring = ring_with(&[1, 2, 3, 4], 8);
        let mut aligner = StreamAligner::new(AlignerConfig::default());
        aligner.accumulated_offset = 7;

        assert!(aligner.try_resync(&[8, 9], &mut ring).is_none());
        assert_eq!(ring.sample_len(), 4);
        assert_eq!(aligner.bias_samples(), 7);
    }

    #[test]
    fn test_due_requires_cadence_and_two_hops() {
        let config = AlignerConfig {
            resync_cadence: 3,
            hop_frames: 2,
        };
        let mut aligner = StreamAligner::new(config);
        let full = ring_with(&[1, 2, 3, 4, 5], 8);
        let thin = ring_with(&[1, 2, 3], 8);

        for _ in 0..3 {
            aligner.note_cycle();
        }
        assert!(!aligner.due(&full));

        aligner.note_cycle();
        assert!(aligner.due(&full));
        assert!(!aligner.due(&thin));
    }
}
