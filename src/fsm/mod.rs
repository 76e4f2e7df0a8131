//! Function-pointer finite state machine for one fill cycle.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  StateTable                                                       │
//! │  ┌─────────────────┬──────────┬──────────┬──────────┬───────────┐ │
//! │  │ CycleState      │ deadline │ on_enter │ on_exit  │ on_event  │ │
//! │  ├─────────────────┼──────────┼──────────┼──────────┼───────────┤ │
//! │  │ Idle            │ -        │ fn(ctx)  │ -        │ fn(ctx,e) │ │
//! │  │ WaitingPosition │ position │ -        │ -        │ fn(ctx,e) │ │
//! │  │ Filling         │ fill     │ fn(ctx)  │ -        │ fn(ctx,e) │ │
//! │  │ ClosingValve    │ -        │ fn(ctx)  │ -        │ fn(ctx,e) │ │
//! │  │ Complete        │ settle   │ fn(ctx)  │ fn(ctx)  │ fn(ctx,e) │ │
//! │  │ Fault           │ recovery │ fn(ctx)  │ fn(ctx)  │ fn(ctx,e) │ │
//! │  └─────────────────┴──────────┴──────────┴──────────┴───────────┘ │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is event-driven rather than ticked.  [`FillController::handle`]
//! hands one [`Event`] to the current state's `on_event`, which either
//! ignores it, stays, or names a next state.  A transition runs `on_exit`
//! for the old state then `on_enter` for the new one; an `on_enter` may
//! itself name a follow-on state (CLOSING_VALVE never rests), and the
//! engine keeps chaining until a state settles.
//!
//! Handlers are pure with respect to I/O: valve commands, records and
//! faults are left in the [`Outcome`] returned to the caller.  Time is an
//! argument, never read from a clock.

pub mod context;
pub mod states;

use core::fmt;

use context::{ActiveCycle, CycleContext, Disposition, Event, Outcome, Transition};
use embassy_time::Instant;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::config::ControllerConfig;
use crate::timing::DeadlineKind;

// ---------------------------------------------------------------------------
// State identity
// ---------------------------------------------------------------------------

/// Enumeration of all controller states.
/// Must stay in sync with the table built in [`states::build_state_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CycleState {
    Idle = 0,
    WaitingPosition = 1,
    Filling = 2,
    ClosingValve = 3,
    Complete = 4,
    Fault = 5,
}

impl CycleState {
    /// Total number of states; sizes the table array.
    pub const COUNT: usize = 6;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Idle,
        Self::WaitingPosition,
        Self::Filling,
        Self::ClosingValve,
        Self::Complete,
        Self::Fault,
    ];

    /// Convert an index back to `CycleState`.  Out-of-range maps to
    /// `Fault` (asserts in debug builds).
    pub fn from_index(idx: usize) -> Self {
        if let Some(s) = Self::ALL.get(idx) {
            *s
        } else {
            debug_assert!(false, "invalid state index: {idx}");
            Self::Fault
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::WaitingPosition => "WAITING_POSITION",
            Self::Filling => "FILLING",
            Self::ClosingValve => "CLOSING_VALVE",
            Self::Complete => "COMPLETE",
            Self::Fault => "FAULT",
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Function-pointer type aliases
// ---------------------------------------------------------------------------

/// What a state's event handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Drop the event; nothing changes.
    Ignore(context::IgnoreReason),
    /// The event was applied but the state is unchanged.
    Stay,
    /// Transition to another state.
    Goto(CycleState),
}

/// Entry action.  May return a follow-on state to enter immediately.
pub type StateEnterFn = fn(&mut CycleContext) -> Option<CycleState>;

/// Exit action.  Runs exactly once per departure.
pub type StateExitFn = fn(&mut CycleContext);

/// Per-event guard and action.
pub type StateEventFn = fn(&mut CycleContext, &Event) -> Step;

// ---------------------------------------------------------------------------
// State descriptor (one row in the table)
// ---------------------------------------------------------------------------

/// Static descriptor for a single state.
pub struct StateDescriptor {
    pub id: CycleState,
    pub name: &'static str,
    /// Deadline the timing supervisor arms while this state is current.
    pub deadline: Option<DeadlineKind>,
    pub on_enter: Option<StateEnterFn>,
    pub on_exit: Option<StateExitFn>,
    pub on_event: StateEventFn,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// The fill-cycle state machine.
///
/// Owns the state table and the [`CycleContext`] threaded through every
/// handler.  Exactly one instance exists per filling station.
pub struct FillController {
    table: [StateDescriptor; CycleState::COUNT],
    current: usize,
    ctx: CycleContext,
    transitions: u64,
}

impl FillController {
    /// Construct a controller resting in IDLE with no active cycle.
    pub fn new(config: ControllerConfig, now: Instant) -> Self {
        let mut ctx = CycleContext::new(config, now);
        let table = states::build_state_table();
        let current = CycleState::Idle as usize;
        if let Some(enter) = table[current].on_enter {
            enter(&mut ctx);
        }
        info!("FSM starting in state: {}", table[current].name);
        Self {
            table,
            current,
            ctx,
            transitions: 0,
        }
    }

    /// Apply one event at time `now`.
    ///
    /// Never fails: events the current state has no guard for come back
    /// with an [`Disposition::Ignored`] outcome and leave everything as it
    /// was.
    pub fn handle(&mut self, event: &Event, now: Instant) -> Outcome {
        self.ctx.begin_step(now);
        let from = self.current_state();

        match (self.table[self.current].on_event)(&mut self.ctx, event) {
            Step::Ignore(reason) => {
                debug!("{}: ignored {} ({:?})", from, event.name(), reason);
                self.ctx.set_disposition(Disposition::Ignored(reason));
            }
            Step::Stay => {}
            Step::Goto(next) => self.transition(next),
        }

        let to = self.current_state();
        if to != from {
            self.ctx.set_transition(Transition { from, to });
        }
        self.ctx.take_outcome()
    }

    /// The current state's identity.
    pub fn current_state(&self) -> CycleState {
        CycleState::from_index(self.current)
    }

    /// Deadline the current state wants armed, if any.
    pub fn deadline_kind(&self) -> Option<DeadlineKind> {
        self.table[self.current].deadline
    }

    /// The in-flight cycle; `None` while IDLE.
    pub fn active_cycle(&self) -> Option<&ActiveCycle> {
        self.ctx.cycle.as_ref()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.ctx.config
    }

    /// Number of state entries since construction (chained hops included).
    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn transition(&mut self, first: CycleState) {
        let mut next = first;
        // Every chain ends in a state whose on_enter returns None; the bound
        // only guards against a miswired table.
        for _ in 0..CycleState::COUNT {
            let next_idx = next as usize;
            info!(
                "FSM transition: {} -> {}",
                self.table[self.current].name, self.table[next_idx].name
            );

            if let Some(exit) = self.table[self.current].on_exit {
                exit(&mut self.ctx);
            }

            self.current = next_idx;
            self.transitions += 1;

            match self.table[self.current].on_enter.and_then(|enter| enter(&mut self.ctx)) {
                Some(follow_on) => next = follow_on,
                None => return,
            }
        }
        error!(
            "FSM: transition chain did not settle, halting in {}",
            self.table[self.current].name
        );
    }
}
