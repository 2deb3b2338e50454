//! Cross-process synchronization channels.
//!
//! An external producer supplies one reference audio block, one
//! iteration counter and one trigger-enable flag per cycle over three
//! named, bounded, blocking FIFO queues; the resolved keyword offset
//! goes back over a fourth. Queue names are well-known by convention
//! with the producer. The in-memory transport mirrors the same contract
//! over bounded process-local channels for tests and offline runs.

use std::ffi::CString;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use nix::mqueue::{mq_close, mq_open, mq_receive, mq_send, MQ_OFlag, MqAttr, MqdT};
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::capture::Sample;
use crate::ring_buffer::BYTES_PER_SAMPLE;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to open queue {name}: {errno}")]
    Open {
        name: String,
        errno: nix::errno::Errno,
    },

    #[error("receive on {name} failed: {errno}")]
    Receive {
        name: String,
        errno: nix::errno::Errno,
    },

    #[error("send on {name} failed: {errno}")]
    Send {
        name: String,
        errno: nix::errno::Errno,
    },

    #[error("unexpected payload size on {name}: expected {expected} bytes, got {actual}")]
    Payload {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("queue name {0:?} is not a valid path")]
    BadName(String),

    #[error("peer closed the channel")]
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChannelConfig {
    /// Inbound reference audio blocks, one hop per message.
    pub reference_queue: String,

    /// Inbound producer iteration counter.
    pub iteration_queue: String,

    /// Inbound trigger-enable flag.
    pub trigger_queue: String,

    /// Outbound resolved offset in samples.
    pub offset_queue: String,

    /// Message depth of each queue.
    pub depth: i64,
}

impl Default for SyncChannelConfig {
    fn default() -> Self {
        Self {
            reference_queue: "/wakeword_reference".to_string(),
            iteration_queue: "/wakeword_iterations".to_string(),
            trigger_queue: "/wakeword_trigger".to_string(),
            offset_queue: "/wakeword_offset".to_string(),
            depth: 10,
        }
    }
}

impl SyncChannelConfig {
    pub fn validate(&self) -> Result<(), String> {
        for name in [
            &self.reference_queue,
            &self.iteration_queue,
            &self.trigger_queue,
            &self.offset_queue,
        ] {
            if !name.starts_with('/') || name.len() < 2 {
                return Err(format!("queue name {:?} must look like /name", name));
            }
        }
        if self.depth <= 0 {
            return Err("queue depth must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Per-cycle message exchange with the external producer.
///
/// Each cycle receives exactly one message from every inbound channel
/// before proceeding, then sends exactly one offset. Blocking on a
/// receive is the backpressure mechanism against the producer, not an
/// error.
pub trait SyncTransport {
    /// Receive one reference block into `block` (fixed hop length).
    fn recv_reference(&mut self, block: &mut [Sample]) -> Result<(), SyncError>;

    fn recv_iteration(&mut self) -> Result<i32, SyncError>;

    fn recv_trigger(&mut self) -> Result<i32, SyncError>;

    fn send_offset(&mut self, offset_samples: i32) -> Result<(), SyncError>;
}

/// One named POSIX message queue.
struct Queue {
    name: String,
    mqd: Option<MqdT>,
}

impl Queue {
    fn open(name: &str, flags: MQ_OFlag, msg_size: i64, depth: i64) -> Result<Self, SyncError> {
        let cname =
            CString::new(name).map_err(|_| SyncError::BadName(name.to_string()))?;
        let attr = MqAttr::new(0, depth, msg_size, 0);
        let mqd = mq_open(
            cname.as_c_str(),
            flags | MQ_OFlag::O_CREAT,
            Mode::from_bits_truncate(0o644),
            Some(&attr),
        )
        .map_err(|errno| SyncError::Open {
            name: name.to_string(),
            errno,
        })?;

        Ok(Self {
            name: name.to_string(),
            mqd: Some(mqd),
        })
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SyncError> {
        let mqd = self.mqd.as_ref().ok_or(SyncError::Closed)?;
        let mut priority = 0;
        mq_receive(mqd, buf, &mut priority).map_err(|errno| SyncError::Receive {
            name: self.name.clone(),
            errno,
        })
    }

    fn send(&mut self, buf: &[u8]) -> Result<(), SyncError> {
        let mqd = self.mqd.as_ref().ok_or(SyncError::Closed)?;
        mq_send(mqd, buf, 0).map_err(|errno| SyncError::Send {
            name: self.name.clone(),
            errno,
        })
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Some(mqd) = self.mqd.take() {
            let _ = mq_close(mqd);
        }
    }
}

/// Transport over four named POSIX message queues.
pub struct PosixQueueTransport {
    reference: Queue,
    iterations: Queue,
    trigger: Queue,
    offset: Queue,
    scratch: Vec<u8>,
}

impl PosixQueueTransport {
    /// Create or attach the four queues. Fails fast: a live pipeline
    /// without its channels is useless, so any open failure is fatal to
    /// startup.
    pub fn open(config: &SyncChannelConfig, hop_frames: usize) -> Result<Self, SyncError> {
        let hop_bytes = (hop_frames * BYTES_PER_SAMPLE) as i64;
        let word = std::mem::size_of::<i32>() as i64;

        let reference = Queue::open(
            &config.reference_queue,
            MQ_OFlag::O_RDONLY,
            hop_bytes,
            config.depth,
        )?;
        let iterations = Queue::open(
            &config.iteration_queue,
            MQ_OFlag::O_RDONLY,
            word,
            config.depth,
        )?;
        let trigger = Queue::open(
            &config.trigger_queue,
            MQ_OFlag::O_RDONLY,
            word,
            config.depth,
        )?;
        let offset = Queue::open(
            &config.offset_queue,
            MQ_OFlag::O_WRONLY,
            word,
            config.depth,
        )?;

        info!(
            reference = %config.reference_queue,
            offset = %config.offset_queue,
            depth = config.depth,
            "sync channels open"
        );

        Ok(Self {
            reference,
            iterations,
            trigger,
            offset,
            scratch: vec![0; hop_bytes as usize],
        })
    }

    fn recv_word(queue: &mut Queue) -> Result<i32, SyncError> {
        let mut buf = [0u8; 4];
        let n = queue.recv(&mut buf)?;
        if n != buf.len() {
            return Err(SyncError::Payload {
                name: queue.name.clone(),
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(i32::from_ne_bytes(buf))
    }
}

impl SyncTransport for PosixQueueTransport {
    fn recv_reference(&mut self, block: &mut [Sample]) -> Result<(), SyncError> {
        let expected = block.len() * BYTES_PER_SAMPLE;
        let n = self.reference.recv(&mut self.scratch)?;
        if n != expected {
            return Err(SyncError::Payload {
                name: self.reference.name.clone(),
                expected,
                actual: n,
            });
        }

        for (sample, lane) in block
            .iter_mut()
            .zip(self.scratch.chunks_exact(BYTES_PER_SAMPLE))
        {
            *sample = i32::from_le_bytes([lane[0], lane[1], lane[2], lane[3]]);
        }
        Ok(())
    }

    fn recv_iteration(&mut self) -> Result<i32, SyncError> {
        Self::recv_word(&mut self.iterations)
    }

    fn recv_trigger(&mut self) -> Result<i32, SyncError> {
        Self::recv_word(&mut self.trigger)
    }

    fn send_offset(&mut self, offset_samples: i32) -> Result<(), SyncError> {
        self.offset.send(&offset_samples.to_ne_bytes())
    }
}

/// Producer half of the in-memory transport.
pub struct InMemoryProducer {
    reference_tx: SyncSender<Vec<Sample>>,
    iteration_tx: SyncSender<i32>,
    trigger_tx: SyncSender<i32>,
    offset_rx: Receiver<i32>,
}

impl InMemoryProducer {
    /// Queue one cycle's worth of inbound messages.
    pub fn send_cycle(
        &self,
        reference: Vec<Sample>,
        iteration: i32,
        trigger: i32,
    ) -> Result<(), SyncError> {
        self.reference_tx
            .send(reference)
            .map_err(|_| SyncError::Closed)?;
        self.iteration_tx
            .send(iteration)
            .map_err(|_| SyncError::Closed)?;
        self.trigger_tx
            .send(trigger)
            .map_err(|_| SyncError::Closed)?;
        Ok(())
    }

    /// Receive the next resolved offset from the pipeline.
    pub fn recv_offset(&self) -> Result<i32, SyncError> {
        self.offset_rx.recv().map_err(|_| SyncError::Closed)
    }
}

/// Consumer half of the in-memory transport.
pub struct InMemoryTransport {
    reference_rx: Receiver<Vec<Sample>>,
    iteration_rx: Receiver<i32>,
    trigger_rx: Receiver<i32>,
    offset_tx: SyncSender<i32>,
}

/// Build a connected producer/consumer pair with the given channel
/// depth, mirroring the bounded blocking semantics of the named queues.
pub fn in_memory_pair(depth: usize) -> (InMemoryProducer, InMemoryTransport) {
    let (reference_tx, reference_rx) = sync_channel(depth);
    let (iteration_tx, iteration_rx) = sync_channel(depth);
    let (trigger_tx, trigger_rx) = sync_channel(depth);
    let (offset_tx, offset_rx) = sync_channel(depth);

    (
        InMemoryProducer {
            reference_tx,
            iteration_tx,
            trigger_tx,
            offset_rx,
        },
        InMemoryTransport {
            reference_rx,
            iteration_rx,
            trigger_rx,
            offset_tx,
        },
    )
}

impl SyncTransport for InMemoryTransport {
    fn recv_reference(&mut self, block: &mut [Sample]) -> Result<(), SyncError> {
        let message = self.reference_rx.recv().map_err(|_| SyncError::Closed)?;
        if message.len() != block.len() {
            return Err(SyncError::Payload {
                name: "reference".to_string(),
                expected: block.len() * BYTES_PER_SAMPLE,
                actual: message.len() * BYTES_PER_SAMPLE,
            });
        }
        block.copy_from_slice(&message);
        Ok(())
    }

    fn recv_iteration(&mut self) -> Result<i32, SyncError> {
        self.iteration_rx.recv().map_err(|_| SyncError::Closed)
    }

    fn recv_trigger(&mut self) -> Result<i32, SyncError> {
        self.trigger_rx.recv().map_err(|_| SyncError::Closed)
    }

    fn send_offset(&mut self, offset_samples: i32) -> Result<(), SyncError> {
        self.offset_tx
            .send(offset_samples)
            .map_err(|_| SyncError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(SyncChannelConfig::default().validate().is_ok());

        let mut config = SyncChannelConfig::default();
        config.reference_queue = "no-leading-slash".to_string();
        assert!(config.validate().is_err());

        config = SyncChannelConfig::default();
        config.depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_in_memory_round_trip() {
        let (producer, mut transport) = in_memory_pair(4);

        producer.send_cycle(vec![1, 2, 3], 42, 1).unwrap();

        let mut block = vec![0; 3];
        transport.recv_reference(&mut block).unwrap();
        assert_eq!(block, vec![1, 2, 3]);
        assert_eq!(transport.recv_iteration().unwrap(), 42);
        assert_eq!(transport.recv_trigger().unwrap(), 1);

        transport.send_offset(-17).unwrap();
        assert_eq!(producer.recv_offset().unwrap(), -17);
    }

    #[test]
    fn test_in_memory_block_length_mismatch() {
        let (producer, mut transport) = in_memory_pair(4);
        producer.send_cycle(vec![1, 2], 0, 0).unwrap();

        let mut block = vec![0; 3];
        assert!(matches!(
            transport.recv_reference(&mut block),
            Err(SyncError::Payload { .. })
        ));
    }

    #[test]
    fn test_closed_peer_is_reported() {
        let (producer, transport) = in_memory_pair(1);
        drop(transport.reference_rx);
        assert!(matches!(
            producer.send_cycle(vec![], 0, 0),
            Err(SyncError::Closed)
        ));

        let (producer, mut transport) = in_memory_pair(1);
        drop(producer);
        assert!(matches!(
            transport.recv_iteration(),
            Err(SyncError::Closed)
        ));
    }
}
