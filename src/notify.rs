//! Detection notification capability.
//!
//! Delivery to an external broker is out of scope for the pipeline; it
//! only needs a fire-and-forget `publish`. The default sink writes the
//! event to the log, which is also what runs when notifications are
//! disabled at the command line.

use serde::Serialize;
use tracing::{info, warn};

use crate::fallback::CommandId;

/// Fire-and-forget message delivery. Returns whether the message was
/// handed off; a `false` never interrupts the cycle loop.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;
}

/// Payload published for a confirmed detection.
#[derive(Debug, Serialize)]
pub struct DetectionEvent {
    pub command_id: CommandId,
    pub offset_samples: i32,
    pub iteration: i32,
}

/// Topic confirmed detections are published under.
pub const DETECTION_TOPIC: &str = "voice/detection";

/// Sink that records events in the process log.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        match std::str::from_utf8(payload) {
            Ok(text) => info!(topic, payload = text, "detection published"),
            Err(_) => warn!(topic, bytes = payload.len(), "non-UTF-8 payload"),
        }
        true
    }
}
