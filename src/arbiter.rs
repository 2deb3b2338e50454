//! Detection arbitration between the primary and fallback engines.
//!
//! One arbiter instance owns both detector handles and the single
//! detection state machine, mutated once per processing cycle. With a
//! primary engine present, the fallback engine only re-evaluates audio
//! inside a bounded confirmation window after a wake-word latch; without
//! one it runs standalone every cycle as the sole detector.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::Sample;
use crate::engine::WakeEngine;
use crate::fallback::{CommandEngine, Detection, PhaseRunner};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Cycles the fallback engine is given to confirm a latched
    /// wake word (240 cycles of a 200-sample hop at 16 kHz is 3 s).
    pub confirmation_cycles: u32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            confirmation_cycles: 240,
        }
    }
}

impl ArbiterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.confirmation_cycles == 0 {
            return Err("confirmation_cycles must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Detection state, advanced once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    /// No wake word pending.
    Idle,

    /// The primary engine reported a nonzero offset this cycle.
    WakewordLatched { remaining_cycles: u32 },

    /// The fallback engine is re-evaluating the latched wake word.
    ConfirmationWindow { remaining_cycles: u32 },
}

/// What one arbitration cycle decided.
#[derive(Debug, Clone, Copy)]
pub struct CycleDecision {
    /// Raw detector offset in samples, before alignment bias. Zero when
    /// nothing fired.
    pub offset_samples: i32,

    /// A command confirmed this cycle, if any.
    pub command: Option<Detection>,
}

pub struct DetectionArbiter {
    config: ArbiterConfig,
    state: DetectionState,
    primary: Option<Box<dyn WakeEngine>>,
    fallback: PhaseRunner,
}

impl DetectionArbiter {
    pub fn new(
        config: ArbiterConfig,
        primary: Option<Box<dyn WakeEngine>>,
        fallback_engine: Box<dyn CommandEngine>,
        hop_frames: usize,
    ) -> Self {
        if primary.is_none() {
            info!("no primary engine, fallback runs standalone");
        }

        Self {
            config,
            state: DetectionState::Idle,
            primary,
            fallback: PhaseRunner::new(fallback_engine, hop_frames),
        }
    }

    /// Run one arbitration cycle.
    ///
    /// `reference` is this cycle's block from the external producer;
    /// `capture_hop` is the locally reframed capture. The primary engine
    /// and the confirmation window consume the reference stream, the
    /// standalone fallback consumes the capture.
    pub fn process_cycle(
        &mut self,
        reference: &[Sample],
        capture_hop: &[Sample],
        notify: bool,
        iteration: i32,
        trigger_enabled: bool,
    ) -> CycleDecision {
        let mut offset_samples = 0;
        let mut command = None;

        match self.state {
            DetectionState::Idle => match &mut self.primary {
                Some(engine) => {
                    offset_samples =
                        engine.process_signal(reference, notify, iteration, trigger_enabled);
                    if offset_samples != 0 {
                        self.state = DetectionState::WakewordLatched {
                            remaining_cycles: self.config.confirmation_cycles,
                        };
                        debug!(offset_samples, iteration, "wake word latched");
                    }
                }
                None => {
                    if let Some(detection) = self.fallback.push_hop(capture_hop, notify, iteration)
                    {
                        offset_samples = detection.start_offset_samples;
                        command = Some(detection);
                        info!(command_id = detection.command_id, "standalone command");
                    }
                }
            },

            DetectionState::WakewordLatched { remaining_cycles }
            | DetectionState::ConfirmationWindow { remaining_cycles } => {
                if let Some(detection) = self.fallback.push_hop(reference, notify, iteration) {
                    offset_samples = detection.start_offset_samples;
                    command = Some(detection);
                    self.state = DetectionState::Idle;
                    info!(command_id = detection.command_id, "wake word confirmed");
                } else {
                    let left = remaining_cycles - 1;
                    if left == 0 {
                        self.state = DetectionState::Idle;
                        self.fallback.reset();
                        debug!("confirmation window expired with no command");
                    } else {
                        self.state = DetectionState::ConfirmationWindow {
                            remaining_cycles: left,
                        };
                    }
                }
            }
        }

        CycleDecision {
            offset_samples,
            command,
        }
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptedWakeEngine;
    use crate::fallback::{CommandId, EnergyCommandEngine, EnergyEngineConfig};

    const HOP: usize = 200;

    /// Scripted fallback: confirms on the n-th phase frame it sees.
    struct CountdownEngine {
        frames_until_hit: Option<u32>,
        frames_seen: u32,
        command_id: CommandId,
    }

    impl CommandEngine for CountdownEngine {
        fn frame_size(&self) -> usize {
            480
        }

        fn process_phase(
            &mut self,
            _frame: &[i16],
            _notify: bool,
            _iteration: i32,
        ) -> Option<Detection> {
            self.frames_seen += 1;
            match self.frames_until_hit {
                Some(n) if self.frames_seen >= n => Some(Detection {
                    command_id: self.command_id,
                    start_offset_samples: 960,
                }),
                _ => None,
            }
        }

        fn reset(&mut self) {
            self.frames_seen = 0;
        }
    }

    fn arbiter_with(
        primary_offsets: Vec<i32>,
        frames_until_hit: Option<u32>,
        confirmation_cycles: u32,
    ) -> DetectionArbiter {
        DetectionArbiter::new(
            ArbiterConfig {
                confirmation_cycles,
            },
            Some(Box::new(ScriptedWakeEngine::new(primary_offsets))),
            Box::new(CountdownEngine {
                frames_until_hit,
                frames_seen: 0,
                command_id: 7,
            }),
            HOP,
        )
    }

    fn run_cycle(arbiter: &mut DetectionArbiter, iteration: i32) -> CycleDecision {
        let block = vec![0i32; HOP];
        arbiter.process_cycle(&block, &block, false, iteration, true)
    }

    #[test]
    fn test_nonzero_primary_offset_latches() {
        let mut arbiter = arbiter_with(vec![0, 4800], None, 240);

        let quiet = run_cycle(&mut arbiter, 0);
        assert_eq!(quiet.offset_samples, 0);
        assert_eq!(arbiter.state(), DetectionState::Idle);

        let latched = run_cycle(&mut arbiter, 1);
        assert_eq!(latched.offset_samples, 4800);
        assert!(latched.command.is_none());
        assert_eq!(
            arbiter.state(),
            DetectionState::WakewordLatched {
                remaining_cycles: 240
            }
        );
    }

    #[test]
    fn test_window_times_out_back_to_idle() {
        let mut arbiter = arbiter_with(vec![100], None, 240);

        run_cycle(&mut arbiter, 0);
        for i in 0..240 {
            let decision = run_cycle(&mut arbiter, 1 + i);
            assert!(decision.command.is_none());
        }
        assert_eq!(arbiter.state(), DetectionState::Idle);
    }

    #[test]
    fn test_confirmation_before_timeout_reports_command() {
        // 480-sample frames over 200-sample hops: the 5th phase frame
        // completes on the 12th confirmation cycle.
        let mut arbiter = arbiter_with(vec![100], Some(5), 240);

        run_cycle(&mut arbiter, 0);
        let mut confirmed = None;
        for i in 0..40 {
            let decision = run_cycle(&mut arbiter, 1 + i);
            if decision.command.is_some() {
                confirmed = decision.command;
                break;
            }
        }

        let detection = confirmed.expect("command should confirm within the window");
        assert_eq!(detection.command_id, 7);
        assert_eq!(arbiter.state(), DetectionState::Idle);
    }

    #[test]
    fn test_primary_is_not_polled_while_latched() {
        let mut arbiter = arbiter_with(vec![100, 999, 999], None, 10);

        run_cycle(&mut arbiter, 0);
        for i in 0..5 {
            run_cycle(&mut arbiter, 1 + i);
        }
        // Only the latching cycle touched the primary engine.
        match arbiter.state() {
            DetectionState::ConfirmationWindow { remaining_cycles } => {
                assert_eq!(remaining_cycles, 5)
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_relatch_after_timeout() {
        let mut arbiter = arbiter_with(vec![100, 200], None, 2);

        run_cycle(&mut arbiter, 0); // latch
        run_cycle(&mut arbiter, 1);
        run_cycle(&mut arbiter, 2); // timeout
        assert_eq!(arbiter.state(), DetectionState::Idle);

        let relatched = run_cycle(&mut arbiter, 3);
        assert_eq!(relatched.offset_samples, 200);
        assert!(matches!(
            arbiter.state(),
            DetectionState::WakewordLatched { .. }
        ));
    }

    #[test]
    fn test_standalone_mode_detects_on_capture() {
        let engine = EnergyCommandEngine::open(
            EnergyEngineConfig {
                voiced_frames_required: 2,
                ..Default::default()
            },
            true,
        );
        let mut arbiter =
            DetectionArbiter::new(ArbiterConfig::default(), None, Box::new(engine), HOP);
        assert!(!arbiter.has_primary());

        let silence = vec![0i32; HOP];
        let mut detection = None;
        let mut phase = 0usize;
        for iteration in 0..10 {
            let capture: Vec<i32> = (0..HOP)
                .map(|i| {
                    let t = (phase + i) as f32 / 16000.0;
                    let s = 0.5 * (2.0 * std::f32::consts::PI * 250.0 * t).sin();
                    ((s * i16::MAX as f32) as i32) << 16
                })
                .collect();
            phase += HOP;

            let decision =
                arbiter.process_cycle(&silence, &capture, false, iteration, true);
            if decision.command.is_some() {
                detection = decision.command;
                break;
            }
        }

        assert!(detection.is_some(), "standalone fallback should detect");
        assert_eq!(arbiter.state(), DetectionState::Idle);
    }
}
