//! Direction-aware stepping over the replayed PHP execution.
//!
//! Every PHP statement passes through one line of the generated
//! instrumentation file (the step sentinel). Stepping works by enabling the
//! internal stepping breakpoint on that line, or by planting a temporary
//! breakpoint there whose condition compares the instrumented `level`
//! variable against the current call depth, and then continuing forward or
//! backward until gdb reports a stop.

use crate::engine::error::Error;
use crate::engine::locmap::{GENERATED_FILE, STEP_SENTINEL_LINE};
use crate::engine::{BreakpointState, Direction, EngineState, Reason, Status, STEPPING_BP_ID};
use crate::mi::StopEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
}

/// Perform one step in the given direction. On return `es.status`/`es.reason`
/// describe the new state and the stepping breakpoint is disabled again.
pub fn step(es: &mut EngineState, kind: StepKind, direction: Direction) -> Result<(), Error> {
    let result = match kind {
        StepKind::Into => step_into(es, direction),
        StepKind::Over => step_over_or_out(es, direction, false),
        StepKind::Out => step_over_or_out(es, direction, true),
    };
    let disabled = ensure_stepping_disabled(es);
    result.and(disabled)
}

/// Continue in the given direction until a user breakpoint fires or the
/// replay reaches its terminus.
pub fn run(es: &mut EngineState, direction: Direction) -> Result<(), Error> {
    let result = (|| {
        ensure_stepping_disabled(es)?;
        continue_and_wait(es, direction)
    })();
    let disabled = ensure_stepping_disabled(es);
    result.and(disabled)
}

fn step_into(es: &mut EngineState, direction: Direction) -> Result<(), Error> {
    es.gdb.send("break-enable", STEPPING_BP_ID)?;
    set_stepping_state(es, BreakpointState::Enabled);
    continue_and_wait(es, direction)
}

fn step_over_or_out(es: &mut EngineState, direction: Direction, out: bool) -> Result<(), Error> {
    let depth = current_level(es)?;
    if out && depth == 0 {
        // nothing to step out of, degenerate to a plain run
        return continue_and_wait(es, direction);
    }

    let condition = if out {
        format!("level < {depth}")
    } else {
        format!("level <= {depth}")
    };

    let payload = es.gdb.send(
        "break-insert",
        &format!("-t -f --source {GENERATED_FILE} --line {STEP_SENTINEL_LINE}"),
    )?;
    let temp_number = payload
        .get("bkpt")
        .and_then(|bkpt| bkpt.str_field("number"))
        .map(str::to_string)
        .ok_or_else(|| Error::MiParse("break-insert returned no breakpoint number".into()))?;
    es.gdb
        .send("break-condition", &format!("{temp_number} {condition}"))?;

    let result = continue_and_wait(es, direction);

    // gdb deletes a hit temporary itself; cover the user-breakpoint-first and
    // terminus paths and ignore an already-gone breakpoint
    if let Err(err) = es.gdb.send("break-delete", &temp_number) {
        log::debug!(target: "engine", "temporary breakpoint {temp_number} already gone: {err}");
    }

    result
}

fn continue_and_wait(es: &mut EngineState, direction: Direction) -> Result<(), Error> {
    let verb = match direction {
        Direction::Forward => "exec-continue",
        Direction::Reverse => "exec-reverse-continue",
    };

    es.status = Status::Running;
    es.gdb.send(verb, "")?;

    match es.gdb.recv_stop()? {
        StopEvent::Breakpoint(id) => {
            log::debug!(target: "engine", "stopped on breakpoint {id}");
            es.status = Status::Break;
            es.reason = Reason::Ok;
        }
        StopEvent::Terminus { reason } => {
            log::info!(target: "engine", "replay terminus reached: {reason}");
            es.status = Status::Stopped;
            es.reason = if reason.starts_with("exited") {
                Reason::Ok
            } else {
                Reason::Aborted
            };
        }
    }
    Ok(())
}

fn current_level(es: &mut EngineState) -> Result<u64, Error> {
    let value = es.gdb.evaluate("level")?;
    let depth: u64 = value
        .trim()
        .parse()
        .map_err(|_| Error::MiParse(format!("instrumented level is not a number: {value}")))?;
    if depth as usize >= es.locations.max_stack_depth() {
        return Err(Error::InvariantViolation(format!(
            "stack depth {depth} exceeds instrumented maximum {}",
            es.locations.max_stack_depth()
        )));
    }
    Ok(depth)
}

fn ensure_stepping_disabled(es: &mut EngineState) -> Result<(), Error> {
    es.gdb.send("break-disable", STEPPING_BP_ID)?;
    set_stepping_state(es, BreakpointState::Disabled);
    Ok(())
}

fn set_stepping_state(es: &mut EngineState, state: BreakpointState) {
    if let Some(bp) = es.breakpoints.get_mut(STEPPING_BP_ID) {
        bp.state = state;
    }
}
