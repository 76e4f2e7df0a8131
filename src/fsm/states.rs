//! Concrete state handler functions and table builder.
//!
//! ```text
//!  IDLE ──[can detected]──▶ WAITING_POSITION ──[valid, in time]──▶ FILLING
//!    ▲                            │                                   │
//!    │              [invalid | position timeout]          [level ≥ target − tol]
//!    │                            ▼                                   ▼
//!    │                          FAULT ◀──[fill timeout]───────── (FILLING)
//!    │                            ▲                                   │
//!    │                            └──────[out of band]──── CLOSING_VALVE
//!    │                                                                │
//!    │                                                          [in band]
//!    │                                                                ▼
//!    ├──────────────[recovery delay]──────── FAULT              COMPLETE
//!    └──────────────[settle delay]──────────────────────────────────┘
//! ```
//!
//! CLOSING_VALVE is transient: its `on_enter` closes the valve, freezes
//! the final level and immediately names COMPLETE or FAULT.

use embassy_time::Duration;
use log::{info, warn};

use super::context::{
    ActiveCycle, CloseReason, CycleContext, Event, FaultCode, IgnoreReason, LogRecord,
    OutcomeRecord, QualityVerdict, SensorStatus, TimeoutKind, ValveCommand, ValveState,
};
use super::{CycleState, StateDescriptor, Step};
use crate::timing::DeadlineKind;

// ═══════════════════════════════════════════════════════════════════════════
//  Table builder
// ═══════════════════════════════════════════════════════════════════════════

/// Build the state table.  Called once per controller.
pub fn build_state_table() -> [StateDescriptor; CycleState::COUNT] {
    [
        // Index 0: Idle
        StateDescriptor {
            id: CycleState::Idle,
            name: "IDLE",
            deadline: None,
            on_enter: Some(idle_enter),
            on_exit: None,
            on_event: idle_event,
        },
        // Index 1: WaitingPosition
        StateDescriptor {
            id: CycleState::WaitingPosition,
            name: "WAITING_POSITION",
            deadline: Some(DeadlineKind::PositionTimeout),
            on_enter: None,
            on_exit: None,
            on_event: waiting_position_event,
        },
        // Index 2: Filling
        StateDescriptor {
            id: CycleState::Filling,
            name: "FILLING",
            deadline: Some(DeadlineKind::FillTimeout),
            on_enter: Some(filling_enter),
            on_exit: None,
            on_event: filling_event,
        },
        // Index 3: ClosingValve
        StateDescriptor {
            id: CycleState::ClosingValve,
            name: "CLOSING_VALVE",
            deadline: None,
            on_enter: Some(closing_enter),
            on_exit: None,
            on_event: closing_event,
        },
        // Index 4: Complete
        StateDescriptor {
            id: CycleState::Complete,
            name: "COMPLETE",
            deadline: Some(DeadlineKind::Settle),
            on_enter: Some(complete_enter),
            on_exit: Some(complete_exit),
            on_event: complete_event,
        },
        // Index 5: Fault
        StateDescriptor {
            id: CycleState::Fault,
            name: "FAULT",
            deadline: Some(DeadlineKind::Recovery),
            on_enter: Some(fault_enter),
            on_exit: Some(fault_exit),
            on_event: fault_event,
        },
    ]
}

fn ms(d: Duration) -> u64 {
    d.as_millis()
}

// ═══════════════════════════════════════════════════════════════════════════
//  IDLE state
// ═══════════════════════════════════════════════════════════════════════════

fn idle_enter(ctx: &mut CycleContext) -> Option<CycleState> {
    ctx.cycle = None;
    info!("IDLE: ready for next can");
    None
}

fn idle_event(ctx: &mut CycleContext, event: &Event) -> Step {
    let Event::CanDetected { can_id } = event else {
        return Step::Ignore(IgnoreReason::NotExpectedInState);
    };

    info!("IDLE: can {} detected", can_id);
    ctx.cycle = Some(ActiveCycle::start(can_id.clone(), ctx.now));
    ctx.emit_record(LogRecord::CanDetected {
        can_id: can_id.clone(),
    });
    Step::Goto(CycleState::WaitingPosition)
}

// ═══════════════════════════════════════════════════════════════════════════
//  WAITING_POSITION state: can detected, awaiting alignment
// ═══════════════════════════════════════════════════════════════════════════

fn waiting_position_event(ctx: &mut CycleContext, event: &Event) -> Step {
    match event {
        Event::PositionReport {
            can_id,
            position_mm,
            valid,
        } => {
            if !ctx.is_current_can(can_id) {
                return Step::Ignore(IgnoreReason::CanIdMismatch);
            }
            let now = ctx.now;
            let timeout = ctx.config.position_timeout();
            let Some(cycle) = ctx.cycle.as_mut() else {
                return Step::Ignore(IgnoreReason::NotExpectedInState);
            };
            cycle.position_mm = Some(*position_mm);
            let elapsed = cycle.cycle_elapsed(now);

            // Timeout wins over validity: a late report is a timing fault
            // whatever it says.
            if elapsed > timeout {
                let description = format!(
                    "Position detection timeout ({}ms > {}ms)",
                    ms(elapsed),
                    ms(timeout)
                );
                ctx.raise_fault(
                    FaultCode::PositionTimeout,
                    description,
                    CycleState::WaitingPosition,
                );
                return Step::Goto(CycleState::Fault);
            }

            if !valid {
                let description = format!("Position out of tolerance: {:.2}mm", position_mm);
                ctx.raise_fault(
                    FaultCode::InvalidPosition,
                    description,
                    CycleState::WaitingPosition,
                );
                return Step::Goto(CycleState::Fault);
            }

            info!(
                "WAITING_POSITION: position {:.2} mm validated after {} ms",
                position_mm,
                ms(elapsed)
            );
            Step::Goto(CycleState::Filling)
        }
        Event::Timeout(TimeoutKind::Position) => {
            let description = format!(
                "Position detection timeout (no report within {}ms)",
                ctx.config.position_timeout_ms
            );
            ctx.raise_fault(
                FaultCode::PositionTimeout,
                description,
                CycleState::WaitingPosition,
            );
            Step::Goto(CycleState::Fault)
        }
        Event::CanDetected { .. } => Step::Ignore(IgnoreReason::CycleActive),
        _ => Step::Ignore(IgnoreReason::NotExpectedInState),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  FILLING state: valve open, tracking level
// ═══════════════════════════════════════════════════════════════════════════

fn filling_enter(ctx: &mut CycleContext) -> Option<CycleState> {
    let now = ctx.now;
    let Some(cycle) = ctx.cycle.as_mut() else {
        warn!("FILLING: entered without an active cycle");
        return Some(CycleState::Idle);
    };
    cycle.fill_start = Some(now);
    cycle.current_level_ml = 0.0;

    let can_id = cycle.can_id.clone();
    let position_mm = cycle.position_mm.unwrap_or_default();
    info!("FILLING: valve open for can {}", can_id);

    ctx.emit_command(ValveCommand::Open {
        can_id: can_id.clone(),
    });
    ctx.emit_record(LogRecord::FillStart {
        can_id,
        position_mm,
    });
    None
}

fn filling_event(ctx: &mut CycleContext, event: &Event) -> Step {
    match event {
        Event::LevelReport { can_id, level_ml } => {
            if !ctx.is_current_can(can_id) {
                return Step::Ignore(IgnoreReason::CanIdMismatch);
            }
            let now = ctx.now;
            let max_fill = ctx.config.max_fill_time();
            let threshold = ctx.config.fill_threshold_ml();
            let Some(cycle) = ctx.cycle.as_mut() else {
                return Step::Ignore(IgnoreReason::NotExpectedInState);
            };

            let elapsed = cycle.fill_elapsed(now);
            if elapsed > max_fill {
                let description = format!(
                    "Fill timeout ({}ms > {}ms)",
                    ms(elapsed),
                    ms(max_fill)
                );
                ctx.raise_fault(FaultCode::FillTimeout, description, CycleState::Filling);
                return Step::Goto(CycleState::Fault);
            }

            if *level_ml < cycle.current_level_ml {
                return Step::Ignore(IgnoreReason::StaleReading);
            }
            cycle.current_level_ml = *level_ml;

            if *level_ml >= threshold {
                info!(
                    "FILLING: level {:.1} ml reached threshold {:.1} ml",
                    level_ml, threshold
                );
                return Step::Goto(CycleState::ClosingValve);
            }
            Step::Stay
        }
        Event::Timeout(TimeoutKind::Fill) => {
            let level = ctx.cycle.as_ref().map_or(0.0, |c| c.current_level_ml);
            let description = format!(
                "Fill timeout (level {:.1}ml below {:.1}ml after {}ms)",
                level,
                ctx.config.fill_threshold_ml(),
                ctx.config.max_fill_time_ms
            );
            ctx.raise_fault(FaultCode::FillTimeout, description, CycleState::Filling);
            Step::Goto(CycleState::Fault)
        }
        Event::CanDetected { .. } => Step::Ignore(IgnoreReason::CycleActive),
        _ => Step::Ignore(IgnoreReason::NotExpectedInState),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  CLOSING_VALVE state: transient verification of the final level
// ═══════════════════════════════════════════════════════════════════════════

fn closing_enter(ctx: &mut CycleContext) -> Option<CycleState> {
    let Some(cycle) = ctx.cycle.as_mut() else {
        warn!("CLOSING_VALVE: entered without an active cycle");
        return Some(CycleState::Idle);
    };
    let final_level = cycle.current_level_ml;
    cycle.final_level_ml = Some(final_level);
    let can_id = cycle.can_id.clone();

    ctx.emit_command(ValveCommand::Close {
        can_id,
        reason: CloseReason::Normal,
        final_level_ml: Some(final_level),
    });

    if ctx.config.within_tolerance(final_level) {
        return Some(CycleState::Complete);
    }

    let description = format!(
        "Final level {:.1}ml outside tolerance ({}±{}ml)",
        final_level, ctx.config.target_level_ml, ctx.config.tolerance_ml
    );
    ctx.raise_fault(
        FaultCode::OutOfTolerance,
        description,
        CycleState::ClosingValve,
    );
    Some(CycleState::Fault)
}

fn closing_event(_ctx: &mut CycleContext, _event: &Event) -> Step {
    Step::Ignore(IgnoreReason::NotExpectedInState)
}

// ═══════════════════════════════════════════════════════════════════════════
//  COMPLETE state: cycle accepted, settling
// ═══════════════════════════════════════════════════════════════════════════

fn complete_enter(ctx: &mut CycleContext) -> Option<CycleState> {
    let now = ctx.now;
    let Some(cycle) = ctx.cycle.as_ref() else {
        warn!("COMPLETE: entered without an active cycle");
        return Some(CycleState::Idle);
    };

    let record = OutcomeRecord {
        can_id: cycle.can_id.clone(),
        position_mm: cycle.position_mm,
        final_level_ml: cycle.final_level_ml.unwrap_or(cycle.current_level_ml),
        cycle_time_ms: ms(cycle.cycle_elapsed(now)),
        fill_duration_ms: ms(cycle.fill_elapsed(now)),
        valve_state: ValveState::Closed,
        sensor_status: SensorStatus::Normal,
        verdict: QualityVerdict::Pass,
    };
    info!(
        "COMPLETE: can {} filled to {:.1} ml in {} ms (fill {} ms)",
        record.can_id, record.final_level_ml, record.cycle_time_ms, record.fill_duration_ms
    );
    ctx.emit_record(LogRecord::FillComplete(record));
    None
}

fn complete_exit(_ctx: &mut CycleContext) {
    info!("COMPLETE: settle delay elapsed");
}

fn complete_event(ctx: &mut CycleContext, event: &Event) -> Step {
    match event {
        Event::ResetDue => Step::Goto(CycleState::Idle),
        Event::QualityReport { can_id, passed } => {
            if !ctx.is_current_can(can_id) {
                return Step::Ignore(IgnoreReason::CanIdMismatch);
            }
            match QualityVerdict::from(*passed) {
                QualityVerdict::Pass => info!("COMPLETE: quality PASS for can {}", can_id),
                QualityVerdict::Fail => warn!("COMPLETE: quality FAIL reported for can {}", can_id),
            }
            Step::Stay
        }
        Event::CanDetected { .. } => Step::Ignore(IgnoreReason::CycleActive),
        _ => Step::Ignore(IgnoreReason::NotExpectedInState),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  FAULT state: valve forced closed, waiting out the recovery delay
// ═══════════════════════════════════════════════════════════════════════════

fn fault_enter(ctx: &mut CycleContext) -> Option<CycleState> {
    match ctx.pending_fault() {
        Some(fault) => warn!("FAULT: {} ({})", fault.code, fault.description),
        None => warn!("FAULT: entered without a fault record"),
    }

    if let Some(cycle) = ctx.cycle.as_ref() {
        let command = ValveCommand::Close {
            can_id: cycle.can_id.clone(),
            reason: CloseReason::Fault,
            final_level_ml: cycle.final_level_ml,
        };
        ctx.emit_command(command);
    }
    None
}

fn fault_exit(_ctx: &mut CycleContext) {
    info!("FAULT: recovery delay elapsed, resetting");
}

fn fault_event(_ctx: &mut CycleContext, event: &Event) -> Step {
    match event {
        Event::ResetDue => Step::Goto(CycleState::Idle),
        Event::CanDetected { .. } => Step::Ignore(IgnoreReason::CycleActive),
        _ => Step::Ignore(IgnoreReason::NotExpectedInState),
    }
}
