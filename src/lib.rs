/// Wake-word stream alignment library
///
/// This library aligns an externally produced reference audio stream
/// against the live capture path, arbitrates detections between a
/// pluggable primary wake-word engine and a built-in fallback command
/// engine, and reports keyword offsets back over synchronization
/// channels.

pub mod aligner;
pub mod arbiter;
pub mod capture;
pub mod engine;
pub mod fallback;
pub mod notify;
pub mod pipeline;
pub mod reframer;
pub mod ring_buffer;
pub mod sync_channel;

// Re-export main types
pub use aligner::{AlignerConfig, StreamAligner};
pub use arbiter::{ArbiterConfig, CycleDecision, DetectionArbiter, DetectionState};
pub use capture::{CaptureError, CaptureSource, CpalCaptureSource, Sample, ScriptedCapture};
pub use engine::{load_wake_engine, EngineError, LoadedWakeEngine, ScriptedWakeEngine, WakeEngine};
pub use fallback::{
    CommandEngine, CommandId, Detection, EnergyCommandEngine, EnergyEngineConfig, FrameBank,
    PhaseRunner,
};
pub use notify::{DetectionEvent, LogNotifier, NotificationSink, DETECTION_TOPIC};
pub use pipeline::{CycleOutcome, Pipeline, PipelineConfig, PipelineError, PipelineStats};
pub use reframer::{FrameReframer, ReframerConfig};
pub use ring_buffer::{RingBuffer, RingBufferError, BYTES_PER_SAMPLE};
pub use sync_channel::{
    in_memory_pair, InMemoryProducer, InMemoryTransport, PosixQueueTransport, SyncChannelConfig,
    SyncError, SyncTransport,
};
