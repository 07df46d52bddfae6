// Workout phase controller
//
// A two-state machine (execution/rest) that dictates the sensor sampling
// rate. All transitions are gated on an `active` flag so a stray phase
// request between sessions can never re-arm capture.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Buffered phase events per subscriber.
const SUBSCRIBER_CAPACITY: usize = 32;

/// The two phases of an active workout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Actively performing reps; sample fast.
    Execution,
    /// Resting between sets; sample slow.
    Rest,
}

impl Phase {
    pub fn sample_rate_hz(&self) -> f64 {
        match self {
            Phase::Execution => 50.0,
            Phase::Rest => 20.0,
        }
    }

    pub fn sample_period(&self) -> Duration {
        match self {
            Phase::Execution => Duration::from_millis(20),
            Phase::Rest => Duration::from_millis(50),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Execution => "execution",
            Phase::Rest => "rest",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What requested a phase transition. Recorded on the event for audit;
/// no trigger is currently rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTrigger {
    Automatic,
    Manual,
    Timer,
    System,
}

impl fmt::Display for PhaseTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Automatic => write!(f, "automatic"),
            Self::Manual => write!(f, "manual"),
            Self::Timer => write!(f, "timer"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Emitted to subscribers on every actual phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChangeEvent {
    pub from: Phase,
    pub to: Phase,
    pub trigger: PhaseTrigger,
    pub timestamp: DateTime<Utc>,
}

/// Owns the current phase and notifies listeners on transition.
///
/// The capture pipeline observes the phase through [`watch_phase`]; other
/// interested parties subscribe for discrete [`PhaseChangeEvent`]s.
///
/// [`watch_phase`]: PhaseController::watch_phase
pub struct PhaseController {
    phase_tx: watch::Sender<Phase>,
    active: bool,
    subscribers: Vec<mpsc::Sender<PhaseChangeEvent>>,
}

impl PhaseController {
    /// A controller for a not-yet-started session: inactive, in execution.
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(Phase::Execution);
        Self {
            phase_tx,
            active: false,
            subscribers: Vec::new(),
        }
    }

    pub fn current_phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Continuous view of the current phase, for rate-driven consumers.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Register for discrete transition events. A subscriber that falls
    /// behind loses events; one that goes away is dropped on next emit.
    pub fn subscribe(&mut self) -> mpsc::Receiver<PhaseChangeEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.push(tx);
        rx
    }

    /// Session start: reset to execution and open the transition gate.
    pub fn start_session(&mut self) {
        self.phase_tx.send_replace(Phase::Execution);
        self.active = true;
        debug!("phase controller started (execution)");
    }

    /// Session end: close the gate and reset to execution.
    pub fn end_session(&mut self) {
        self.active = false;
        self.phase_tx.send_replace(Phase::Execution);
        debug!("phase controller stopped");
    }

    /// Transition to `target`. A request for the current phase is a no-op
    /// with no event. A request while inactive is refused silently (logged,
    /// never raised).
    pub fn update_phase(&mut self, target: Phase, trigger: PhaseTrigger) {
        if !self.active {
            warn!(
                "phase change to {} via {} ignored: controller inactive",
                target, trigger
            );
            return;
        }
        let from = *self.phase_tx.borrow();
        if from == target {
            return;
        }
        self.phase_tx.send_replace(target);

        let event = PhaseChangeEvent {
            from,
            to: target,
            trigger,
            timestamp: Utc::now(),
        };
        self.subscribers.retain(|tx| match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("phase subscriber lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl Default for PhaseController {
    fn default() -> Self {
        Self::new()
    }
}
