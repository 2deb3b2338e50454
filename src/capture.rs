//! Audio capture capability.
//!
//! The pipeline only consumes a blocking `read_frames` call with a fixed
//! sample format (signed 32-bit PCM, mono, 16 kHz). The cpal-backed
//! implementation decouples the device callback from the cycle loop
//! through a lock-free ring; the scripted implementation replays a fixed
//! signal for tests and offline runs.

use cache_padded::CachePadded;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use thiserror::Error;
use tracing::{debug, error, info};

/// One captured sample (signed 32-bit little-endian PCM).
pub type Sample = i32;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no capture device available: {0}")]
    DeviceUnavailable(String),

    #[error("failed to open capture stream: {0}")]
    StreamOpen(String),

    #[error("capture read failed: {0}")]
    Read(String),

    #[error("capture stalled after {retries} underrun retries")]
    Stalled { retries: u32 },
}

/// Blocking frame source with a fixed format negotiated at startup.
#[cfg_attr(test, mockall::automock)]
pub trait CaptureSource {
    /// Fill `frames` with captured samples, returning how many were
    /// written. A short count is a transient underrun, not an error.
    fn read_frames(&mut self, frames: &mut [Sample]) -> Result<usize, CaptureError>;
}

type CaptureRb = HeapRb<Sample>;
type CaptureConsumer = <CaptureRb as Split>::Cons;

/// Live capture through the default cpal input device.
///
/// The device callback pushes into the ring; `read_frames` drains it
/// without blocking the callback thread.
pub struct CpalCaptureSource {
    _stream: cpal::Stream,
    consumer: CachePadded<CaptureConsumer>,
}

impl CpalCaptureSource {
    /// Open the default input device at the given rate, mono.
    ///
    /// `buffer_frames` sizes the handoff ring between the device callback
    /// and the cycle loop.
    pub fn open(sample_rate: u32, buffer_frames: usize) -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no default input device".into()))?;

        let name = device
            .name()
            .unwrap_or_else(|_| "<unknown device>".to_string());
        info!(device = %name, sample_rate, "opening capture stream");

        let config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(sample_rate),
            buffer_size: BufferSize::Default,
        };

        let rb = CaptureRb::new(buffer_frames);
        let (mut producer, consumer) = rb.split();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[Sample], _: &cpal::InputCallbackInfo| {
                    let pushed = producer.push_slice(data);
                    if pushed < data.len() {
                        // The cycle loop fell behind; the newest frames win.
                        debug!(dropped = data.len() - pushed, "capture ring full");
                    }
                },
                |err| error!("capture stream error: {}", err),
                None,
            )
            .map_err(|e| CaptureError::StreamOpen(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CaptureError::StreamOpen(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            consumer: CachePadded::new(consumer),
        })
    }
}

impl CaptureSource for CpalCaptureSource {
    fn read_frames(&mut self, frames: &mut [Sample]) -> Result<usize, CaptureError> {
        Ok(self.consumer.pop_slice(frames))
    }
}

/// Replays a fixed sample sequence, optionally split into short reads.
///
/// Running past the end of the script is a hard read error so that a
/// runaway loop fails loudly instead of spinning on silence.
pub struct ScriptedCapture {
    samples: Vec<Sample>,
    position: usize,
    read_limits: Vec<usize>,
    next_limit: usize,
}

impl ScriptedCapture {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            position: 0,
            read_limits: Vec::new(),
            next_limit: 0,
        }
    }

    /// Cap the sizes of upcoming reads to simulate device underruns.
    /// Once the schedule is exhausted, reads are unrestricted again.
    pub fn with_read_limits(mut self, limits: Vec<usize>) -> Self {
        self.read_limits = limits;
        self
    }

    /// Samples not yet handed out.
    pub fn remaining(&self) -> usize {
        self.samples.len() - self.position
    }
}

impl CaptureSource for ScriptedCapture {
    fn read_frames(&mut self, frames: &mut [Sample]) -> Result<usize, CaptureError> {
        if self.position >= self.samples.len() {
            return Err(CaptureError::Read("capture script exhausted".into()));
        }

        let mut take = frames.len().min(self.samples.len() - self.position);
        if self.next_limit < self.read_limits.len() {
            take = take.min(self.read_limits[self.next_limit]);
            self.next_limit += 1;
        }

        frames[..take].copy_from_slice(&self.samples[self.position..self.position + take]);
        self.position += take;
        Ok(take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_capture_hands_out_samples_in_order() {
        let mut source = ScriptedCapture::new((0..10).collect());
        let mut buf = [0; 4];

        assert_eq!(source.read_frames(&mut buf).unwrap(), 4);
        assert_eq!(buf, [0, 1, 2, 3]);
        assert_eq!(source.read_frames(&mut buf).unwrap(), 4);
        assert_eq!(buf, [4, 5, 6, 7]);
        assert_eq!(source.remaining(), 2);
    }

    #[test]
    fn test_scripted_capture_short_reads() {
        let mut source = ScriptedCapture::new((0..8).collect()).with_read_limits(vec![3, 0]);
        let mut buf = [0; 8];

        assert_eq!(source.read_frames(&mut buf).unwrap(), 3);
        assert_eq!(source.read_frames(&mut buf).unwrap(), 0);
        // Schedule exhausted; the rest arrives in one read.
        assert_eq!(source.read_frames(&mut buf).unwrap(), 5);
    }

    #[test]
    fn test_scripted_capture_exhaustion_is_a_hard_error() {
        let mut source = ScriptedCapture::new(vec![1, 2]);
        let mut buf = [0; 2];
        source.read_frames(&mut buf).unwrap();
        assert!(matches!(
            source.read_frames(&mut buf),
            Err(CaptureError::Read(_))
        ));
    }

    #[test]
    fn test_mock_capture_source() {
        let mut source = MockCaptureSource::new();
        source
            .expect_read_frames()
            .returning(|frames| Ok(frames.len()));

        let mut buf = [0; 16];
        assert_eq!(source.read_frames(&mut buf).unwrap(), 16);
    }
}
