//! Mapping of DBGp commands onto gdb operations and diversion sessions.

use crate::dbgp::DbgpCommand;
use crate::dbgp::xml;
use crate::engine::error::Error;
use crate::engine::locmap::GENERATED_FILE;
use crate::engine::step::{self, StepKind};
use crate::engine::{
    Breakpoint, BreakpointKind, BreakpointState, EngineState, Reason, RedirectMode, Status,
};

/// Execute one parsed DBGp command, returning the response XML.
///
/// Errors marked protocol-answerable by [`Error::is_protocol_answerable`] are
/// converted to DBGp `<error>` responses by the IDE loop; everything else
/// tears the IDE connection down. An unknown verb is a programming error on
/// the IDE side and aborts the IDE task via panic (recovered by the loop).
pub fn dispatch(es: &mut EngineState, cmd: &DbgpCommand) -> Result<String, Error> {
    es.last_seq = cmd.seq;

    match cmd.verb.as_str() {
        "feature_set" => handle_feature_set(es, cmd),
        "feature_get" => handle_feature_get(es, cmd),
        "status" => Ok(status_response(es, cmd)),
        "breakpoint_set" => handle_breakpoint_set(es, cmd),
        "breakpoint_remove" => handle_breakpoint_remove(es, cmd),
        "breakpoint_update" => handle_breakpoint_update(es, cmd),
        "step_into" => handle_step(es, cmd, Some(StepKind::Into)),
        "step_over" => handle_step(es, cmd, Some(StepKind::Over)),
        "step_out" => handle_step(es, cmd, Some(StepKind::Out)),
        "run" => handle_step(es, cmd, None),
        "stop" => handle_stop(es, cmd),
        "stdin" => handle_std_fd(es, cmd, 0),
        "stdout" => handle_std_fd(es, cmd, 1),
        "stderr" => handle_std_fd(es, cmd, 2),
        // queries that execute PHP code: user breakpoints must not fire
        "eval" | "property_get" | "property_set" | "context_get" => {
            es.run_diversion_without_breakpoints(&cmd.raw)
        }
        // read-only queries that do not advance the interpreter
        "stack_get" | "stack_depth" | "context_names" | "typemap_get" | "source"
        | "property_value" => es.run_diversion(&cmd.raw),
        verb => panic!("unimplemented DBGp command: {verb}"),
    }
}

fn status_response(es: &EngineState, cmd: &DbgpCommand) -> String {
    xml::response(
        &cmd.verb,
        cmd.seq,
        &[
            ("status", &es.status.to_string()),
            ("reason", &es.reason.to_string()),
        ],
        None,
    )
}

fn handle_feature_set(es: &mut EngineState, cmd: &DbgpCommand) -> Result<String, Error> {
    let name = required_option(cmd, 'n')?;
    let value = required_option(cmd, 'v')?;

    let success = match es.features.get_mut(name) {
        Some(feature) if !feature.read_only => {
            feature.value = value.to_string();
            "1"
        }
        _ => "0",
    };

    Ok(xml::response(
        &cmd.verb,
        cmd.seq,
        &[("feature", name), ("success", success)],
        None,
    ))
}

fn handle_feature_get(es: &mut EngineState, cmd: &DbgpCommand) -> Result<String, Error> {
    let name = required_option(cmd, 'n')?;

    let (supported, value) = match es.features.get(name) {
        Some(feature) => (if feature.supported { "1" } else { "0" }, feature.value.clone()),
        None => ("0", String::new()),
    };

    Ok(xml::response(
        &cmd.verb,
        cmd.seq,
        &[("feature_name", name), ("supported", supported)],
        Some(&xml::escape(&value)),
    ))
}

fn handle_breakpoint_set(es: &mut EngineState, cmd: &DbgpCommand) -> Result<String, Error> {
    let kind_name = required_option(cmd, 't')?;
    let kind = BreakpointKind::from_dbgp(kind_name)
        .ok_or_else(|| Error::IdeProtocol(format!("unknown breakpoint type `{kind_name}`")))?;
    if kind != BreakpointKind::Line {
        return Err(Error::BreakpointTypeUnsupported(kind_name.to_string()));
    }

    let file = required_option(cmd, 'f')?;
    let line: u32 = required_option(cmd, 'n')?
        .parse()
        .map_err(|_| Error::IdeProtocol(format!("bad line number in: {}", cmd.raw)))?;
    let disabled = cmd.option('s') == Some("disabled");
    let temporary = cmd.option('r') == Some("1");

    let break_line = es
        .locations
        .break_line_for(file)
        .ok_or_else(|| Error::BreakpointInvalid(format!("`{file}` is not part of the recording")))?;

    // one generated line per PHP source; the PHP line is selected by condition
    let mut args = String::from("-f");
    if temporary {
        args.push_str(" -t");
    }
    if disabled {
        args.push_str(" -d");
    }
    args.push_str(&format!(
        " -c \"lineno == {line}\" --source {GENERATED_FILE} --line {break_line}"
    ));

    let payload = es.gdb.send("break-insert", &args)?;
    let number = payload
        .get("bkpt")
        .and_then(|bkpt| bkpt.str_field("number"))
        .map(str::to_string)
        .ok_or_else(|| Error::MiParse("break-insert returned no breakpoint number".into()))?;

    let state = if disabled {
        BreakpointState::Disabled
    } else {
        BreakpointState::Enabled
    };
    es.breakpoints.insert(number.clone(), Breakpoint {
        id: number.clone(),
        kind,
        state,
        temporary,
        source: file.to_string(),
        line,
        function: cmd.option('m').map(str::to_string),
        condition: None,
        gdb_number: Some(number.clone()),
    });

    log::debug!(
        target: "engine",
        "breakpoint {number} set at {file}:{line} (generated line {break_line})"
    );

    let state_name = if disabled { "disabled" } else { "enabled" };
    Ok(xml::response(
        &cmd.verb,
        cmd.seq,
        &[("id", &number), ("state", state_name)],
        None,
    ))
}

fn handle_breakpoint_remove(es: &mut EngineState, cmd: &DbgpCommand) -> Result<String, Error> {
    let id = required_option(cmd, 'd')?.to_string();

    // removal is idempotent, an unknown id still gets a plain response
    if let Some(bp) = es.breakpoints.remove(&id) {
        if let Some(number) = bp.gdb_number {
            es.gdb.send("break-delete", &number)?;
        }
    }

    Ok(xml::response(&cmd.verb, cmd.seq, &[], None))
}

fn handle_breakpoint_update(es: &mut EngineState, cmd: &DbgpCommand) -> Result<String, Error> {
    let id = required_option(cmd, 'd')?.to_string();

    let (number, kind, old_state) = {
        let bp = es
            .breakpoints
            .get(&id)
            .ok_or_else(|| Error::BreakpointInvalid(format!("no breakpoint with id {id}")))?;
        (bp.gdb_number.clone(), bp.kind, bp.state)
    };

    let mut state = old_state;
    if let Some(wanted) = cmd.option('s') {
        state = match wanted {
            "enabled" => BreakpointState::Enabled,
            "disabled" => BreakpointState::Disabled,
            other => {
                return Err(Error::IdeProtocol(format!("unknown breakpoint state `{other}`")));
            }
        };
        if state != old_state {
            if let Some(number) = &number {
                let verb = match state {
                    BreakpointState::Enabled => "break-enable",
                    BreakpointState::Disabled => "break-disable",
                };
                es.gdb.send(verb, number)?;
            }
        }
    }

    let mut line = None;
    if let Some(raw_line) = cmd.option('n') {
        let new_line: u32 = raw_line
            .parse()
            .map_err(|_| Error::IdeProtocol(format!("bad line number in: {}", cmd.raw)))?;
        if kind == BreakpointKind::Line {
            if let Some(number) = &number {
                es.gdb
                    .send("break-condition", &format!("{number} lineno == {new_line}"))?;
            }
        }
        line = Some(new_line);
    }

    let bp = es.breakpoints.get_mut(&id).expect("checked above");
    bp.state = state;
    if let Some(line) = line {
        bp.line = line;
    }

    Ok(xml::response(&cmd.verb, cmd.seq, &[], None))
}

fn handle_step(
    es: &mut EngineState,
    cmd: &DbgpCommand,
    kind: Option<StepKind>,
) -> Result<String, Error> {
    match kind {
        Some(kind) => step::step(es, kind, cmd.direction)?,
        None => step::run(es, cmd.direction)?,
    }
    Ok(status_response(es, cmd))
}

fn handle_stop(es: &mut EngineState, cmd: &DbgpCommand) -> Result<String, Error> {
    es.status = Status::Stopped;
    es.reason = Reason::Ok;
    Ok(status_response(es, cmd))
}

fn handle_std_fd(es: &mut EngineState, cmd: &DbgpCommand, fd: usize) -> Result<String, Error> {
    let mode = required_option(cmd, 'c')?;
    let mode = RedirectMode::from_dbgp(mode)
        .ok_or_else(|| Error::IdeProtocol(format!("bad redirection mode in: {}", cmd.raw)))?;
    es.redirects[fd] = mode;
    Ok(xml::response(&cmd.verb, cmd.seq, &[("success", "1")], None))
}

fn required_option<'a>(cmd: &'a DbgpCommand, key: char) -> Result<&'a str, Error> {
    cmd.option(key)
        .ok_or_else(|| Error::IdeProtocol(format!("{}: missing -{key} option", cmd.verb)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::locmap::LocationMap;
    use crate::engine::{Direction, STEPPING_BP_ID};
    use crate::mi::GdbClient;
    use std::io::Cursor;
    use std::time::Duration;

    /// `retrograde_break.c` with /tmp/a.php mapped to line 42 and two levels.
    fn sample_locations() -> LocationMap {
        let mut text = String::from("//&&& Number of Files: 1\n//&&& Max Stack Depth: 2\n");
        for lineno in 3..=100u32 {
            match lineno {
                42 => text.push_str("//### /tmp/a.php\n"),
                60 | 80 => text.push_str("//$$$\n"),
                _ => text.push_str("int unused;\n"),
            }
        }
        LocationMap::parse(&text).unwrap()
    }

    /// Engine over a scripted gdb. The script always starts with the entry
    /// stop that the handshake consumes.
    fn engine_over(script: &str) -> EngineState {
        let script = format!("*stopped,reason=\"breakpoint-hit\",bkptno=\"2\"\n{script}");
        let gdb = GdbClient::from_streams(Cursor::new(script), std::io::sink());
        gdb.wait_entry_stop(Duration::from_secs(1)).unwrap();
        let mut es = EngineState::new(
            gdb,
            None,
            sample_locations(),
            "file:///tmp/a.php".to_string(),
        );
        es.status = Status::Break;
        es
    }

    fn cmd(line: &str) -> DbgpCommand {
        DbgpCommand::parse(line, Direction::Forward).unwrap()
    }

    fn cmd_reverse(line: &str) -> DbgpCommand {
        DbgpCommand::parse(line, Direction::Reverse).unwrap()
    }

    #[test]
    fn test_status() {
        let mut es = engine_over("");
        let xml = dispatch(&mut es, &cmd("status -i 7")).unwrap();
        assert!(xml.contains("command=\"status\""));
        assert!(xml.contains("transaction_id=\"7\""));
        assert!(xml.contains("status=\"break\""));
        assert!(xml.contains("reason=\"ok\""));
        assert_eq!(es.last_seq, 7);
    }

    #[test]
    fn test_feature_get_and_set() {
        let mut es = engine_over("");

        let xml = dispatch(&mut es, &cmd("feature_get -i 1 -n language_name")).unwrap();
        assert!(xml.contains("feature_name=\"language_name\""));
        assert!(xml.contains("supported=\"1\""));
        assert!(xml.contains(">PHP<"));

        let xml = dispatch(&mut es, &cmd("feature_set -i 2 -n max_children -v 100")).unwrap();
        assert!(xml.contains("success=\"1\""));
        assert_eq!(es.features["max_children"].value, "100");

        // read-only features refuse writes
        let xml = dispatch(&mut es, &cmd("feature_set -i 3 -n protocol_version -v 2")).unwrap();
        assert!(xml.contains("success=\"0\""));
        assert_eq!(es.features["protocol_version"].value, "1");

        let xml = dispatch(&mut es, &cmd("feature_get -i 4 -n no_such_feature")).unwrap();
        assert!(xml.contains("supported=\"0\""));
    }

    #[test]
    fn test_breakpoint_set_maps_to_generated_line() {
        let mut es = engine_over("^done,bkpt={number=\"3\",line=\"42\"}\n");
        let xml = dispatch(
            &mut es,
            &cmd("breakpoint_set -i 5 -t line -f file:///tmp/a.php -n 10"),
        )
        .unwrap();

        assert!(xml.contains("id=\"3\""));
        assert!(xml.contains("state=\"enabled\""));
        let bp = &es.breakpoints["3"];
        assert_eq!(bp.source, "file:///tmp/a.php");
        assert_eq!(bp.line, 10);
        assert_eq!(bp.gdb_number.as_deref(), Some("3"));
        // the stepping breakpoint is still there
        assert!(es.breakpoints.contains_key(STEPPING_BP_ID));
    }

    #[test]
    fn test_breakpoint_set_unknown_source() {
        let mut es = engine_over("");
        let err = dispatch(
            &mut es,
            &cmd("breakpoint_set -i 5 -t line -f file:///tmp/missing.php -n 1"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BreakpointInvalid(_)));
        assert_eq!(err.dbgp_code(), 200);
    }

    #[test]
    fn test_breakpoint_set_unsupported_type() {
        let mut es = engine_over("");
        let err = dispatch(
            &mut es,
            &cmd("breakpoint_set -i 5 -t watch -f file:///tmp/a.php -n 1"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BreakpointTypeUnsupported(_)));
        assert_eq!(err.dbgp_code(), 201);
    }

    #[test]
    fn test_breakpoint_remove_is_idempotent() {
        let mut es = engine_over(
            "^done,bkpt={number=\"3\"}\n\
             ^done\n",
        );
        dispatch(
            &mut es,
            &cmd("breakpoint_set -i 1 -t line -f file:///tmp/a.php -n 10"),
        )
        .unwrap();

        let xml = dispatch(&mut es, &cmd("breakpoint_remove -i 2 -d 3")).unwrap();
        assert!(xml.contains("command=\"breakpoint_remove\""));
        assert!(!es.breakpoints.contains_key("3"));

        // removing again answers the same way, without touching gdb
        let xml = dispatch(&mut es, &cmd("breakpoint_remove -i 3 -d 3")).unwrap();
        assert!(xml.contains("transaction_id=\"3\""));
    }

    #[test]
    fn test_breakpoint_update_state_and_line() {
        let mut es = engine_over(
            "^done,bkpt={number=\"3\"}\n\
             ^done\n\
             ^done\n",
        );
        dispatch(
            &mut es,
            &cmd("breakpoint_set -i 1 -t line -f file:///tmp/a.php -n 10"),
        )
        .unwrap();

        dispatch(&mut es, &cmd("breakpoint_update -i 2 -d 3 -s disabled -n 12")).unwrap();
        let bp = &es.breakpoints["3"];
        assert_eq!(bp.state, BreakpointState::Disabled);
        assert_eq!(bp.line, 12);
        // the DBGp id survives updates
        assert_eq!(bp.id, "3");
    }

    #[test]
    fn test_step_into_leaves_stepping_breakpoint_disabled() {
        let mut es = engine_over(
            "^done\n\
             ^running\n\
             *stopped,reason=\"breakpoint-hit\",bkptno=\"1\"\n\
             ^done\n",
        );
        let xml = dispatch(&mut es, &cmd("step_into -i 3")).unwrap();

        assert!(xml.contains("transaction_id=\"3\""));
        assert!(xml.contains("status=\"break\""));
        assert!(xml.contains("reason=\"ok\""));
        assert_eq!(
            es.breakpoints[STEPPING_BP_ID].state,
            BreakpointState::Disabled
        );
    }

    #[test]
    fn test_step_over_places_conditional_temporary() {
        let mut es = engine_over(
            "^done,value=\"1\"\n\
             ^done,bkpt={number=\"4\"}\n\
             ^done\n\
             ^running\n\
             *stopped,reason=\"breakpoint-hit\",bkptno=\"4\"\n\
             ^done\n\
             ^done\n",
        );
        let xml = dispatch(&mut es, &cmd("step_over -i 4")).unwrap();
        assert!(xml.contains("status=\"break\""));
        assert_eq!(
            es.breakpoints[STEPPING_BP_ID].state,
            BreakpointState::Disabled
        );
    }

    #[test]
    fn test_reverse_run_to_replay_boundary() {
        let mut es = engine_over(
            "^done\n\
             ^running\n\
             *stopped,reason=\"no-history\"\n\
             ^done\n",
        );
        let xml = dispatch(&mut es, &cmd_reverse("run -i 9")).unwrap();
        assert!(xml.contains("status=\"stopped\""));
        assert!(xml.contains("reason=\"aborted\""));
        assert_eq!(es.status, Status::Stopped);
    }

    #[test]
    fn test_stop_keeps_final_response() {
        let mut es = engine_over("");
        let xml = dispatch(&mut es, &cmd("stop -i 99")).unwrap();
        assert!(xml.contains("status=\"stopped\""));
        assert_eq!(es.status, Status::Stopped);
    }

    #[test]
    fn test_std_fd_redirection() {
        let mut es = engine_over("");
        let xml = dispatch(&mut es, &cmd("stdout -i 6 -c 1")).unwrap();
        assert!(xml.contains("success=\"1\""));
        assert_eq!(es.redirects[1], RedirectMode::Copy);

        let err = dispatch(&mut es, &cmd("stderr -i 7 -c 9")).unwrap_err();
        assert!(matches!(err, Error::IdeProtocol(_)));
    }

    #[test]
    fn test_eval_diversion_restores_breakpoints() {
        // set a breakpoint, then eval: disable, evaluate, enable
        let mut es = engine_over(
            "^done,bkpt={number=\"3\"}\n\
             ^done\n\
             ^done,value=\"0x55 \\\"<response command=\\\\\\\"eval\\\\\\\" transaction_id=\\\\\\\"11\\\\\\\"/>\\\"\"\n\
             ^done\n",
        );
        dispatch(
            &mut es,
            &cmd("breakpoint_set -i 1 -t line -f file:///tmp/a.php -n 10"),
        )
        .unwrap();

        let xml = dispatch(&mut es, &cmd("eval -i 11 -- JHg=")).unwrap();
        assert!(xml.contains("transaction_id=\"11\""));
        // flags in the table were not flipped by the disable/enable dance
        assert_eq!(es.breakpoints["3"].state, BreakpointState::Enabled);
    }

    #[test]
    fn test_stack_get_diversion_is_neutral() {
        let mut es = engine_over(
            "^done,value=\"0x55 \\\"<response command=\\\\\\\"stack_get\\\\\\\"/>\\\"\"\n",
        );
        let before_status = es.status;
        let xml = dispatch(&mut es, &cmd("stack_get -i 12")).unwrap();
        assert!(xml.contains("stack_get"));
        assert_eq!(es.status, before_status);
        assert_eq!(es.reason, Reason::Ok);
    }

    #[test]
    #[should_panic(expected = "unimplemented DBGp command")]
    fn test_unknown_verb_panics() {
        let mut es = engine_over("");
        let _ = dispatch(&mut es, &cmd("detach -i 1"));
    }
}
