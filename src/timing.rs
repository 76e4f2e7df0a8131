//! Timing supervisor.
//!
//! Owns the single deadline associated with the controller's current
//! state and turns its expiry into a synthetic [`Event`].
//!
//! ```text
//!   state entered ──▶ on_state_entered(kind) ──▶ ArmedDeadline { token, at }
//!                                                      │
//!                       (runtime timer task sleeps until `at`)
//!                                                      │
//!   DeadlineFired{token} ──▶ fire(token) ──▶ Some(Event::Timeout / ResetDue)
//!                                 │
//!                     stale token ▼
//!                               None
//! ```
//!
//! Every arm bumps the token, so a timer that raced with a state change
//! can never fire the new state's deadline.  A deadline fires at most
//! once; firing disarms it.

use embassy_time::{Duration, Instant};
use log::debug;

use crate::config::ControllerConfig;
use crate::fsm::context::{Event, TimeoutKind};

// ═══════════════════════════════════════════════════════════════
//  Deadline kinds
// ═══════════════════════════════════════════════════════════════

/// What a state waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    /// WAITING_POSITION: position report must arrive.
    PositionTimeout,
    /// FILLING: fill threshold must be reached.
    FillTimeout,
    /// COMPLETE: pause before the next can.
    Settle,
    /// FAULT: pause before the next can.
    Recovery,
}

impl DeadlineKind {
    pub fn duration(self, cfg: &ControllerConfig) -> Duration {
        match self {
            Self::PositionTimeout => cfg.position_timeout(),
            Self::FillTimeout => cfg.max_fill_time(),
            Self::Settle => cfg.settle_delay(),
            Self::Recovery => cfg.fault_recovery_delay(),
        }
    }

    /// Event delivered to the state machine when this deadline elapses.
    pub fn event(self) -> Event {
        match self {
            Self::PositionTimeout => Event::Timeout(TimeoutKind::Position),
            Self::FillTimeout => Event::Timeout(TimeoutKind::Fill),
            Self::Settle | Self::Recovery => Event::ResetDue,
        }
    }
}

/// A scheduled expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedDeadline {
    pub token: u32,
    pub kind: DeadlineKind,
    pub at: Instant,
}

// ═══════════════════════════════════════════════════════════════
//  Supervisor
// ═══════════════════════════════════════════════════════════════

/// At most one deadline is armed at a time.
pub struct TimingSupervisor {
    config: ControllerConfig,
    armed: Option<ArmedDeadline>,
    next_token: u32,
    fired: u64,
}

impl TimingSupervisor {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            armed: None,
            next_token: 1,
            fired: 0,
        }
    }

    /// Replace whatever is armed with the deadline for the state just
    /// entered.  `None` just disarms.
    pub fn on_state_entered(&mut self, kind: Option<DeadlineKind>, now: Instant) {
        match kind {
            Some(kind) => {
                self.arm(kind, now);
            }
            None => self.disarm(),
        }
    }

    /// Arm `kind` relative to `now`, superseding any armed deadline.
    pub fn arm(&mut self, kind: DeadlineKind, now: Instant) -> ArmedDeadline {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1).max(1);
        let deadline = ArmedDeadline {
            token,
            kind,
            at: now + kind.duration(&self.config),
        };
        debug!("Timing: armed {:?} #{} at {} ms", kind, token, deadline.at.as_millis());
        self.armed = Some(deadline);
        deadline
    }

    pub fn disarm(&mut self) {
        if let Some(d) = self.armed.take() {
            debug!("Timing: disarmed {:?} #{}", d.kind, d.token);
        }
    }

    pub fn armed(&self) -> Option<ArmedDeadline> {
        self.armed
    }

    /// A timer for `token` elapsed.  Returns the event to deliver, or
    /// `None` if the token is stale or already fired.
    pub fn fire(&mut self, token: u32) -> Option<Event> {
        match self.armed {
            Some(d) if d.token == token => {
                self.armed = None;
                self.fired += 1;
                Some(d.kind.event())
            }
            _ => {
                debug!("Timing: dropped stale deadline #{}", token);
                None
            }
        }
    }

    /// Fire the armed deadline if `now` has reached it.
    pub fn poll(&mut self, now: Instant) -> Option<Event> {
        let d = self.armed?;
        if now >= d.at { self.fire(d.token) } else { None }
    }

    /// Deadlines fired since construction.
    pub fn fired_count(&self) -> u64 {
        self.fired
    }
}
