//! The IDE-facing loop: connects to the DBGp-listening IDE, sends the init
//! packet and serves commands until the IDE disconnects, a protocol error
//! occurs, or a `stop` is processed. Errors and panics here end the
//! connection, never the operator console; the error is handed back to the
//! caller, which owns the session teardown.

use crate::dbgp::{self, DbgpCommand, xml};
use crate::engine::error::Error;
use crate::engine::{EngineState, Status, dispatch};
use crate::ui::{VERBOSE, lock};
use crossterm::style::Stylize;
use std::any::Any;
use std::io::{BufReader, Write};
use std::net::TcpStream;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

/// Maximum number of response bytes echoed in verbose mode.
const ECHO_LIMIT: usize = 300;

pub fn run(es: Arc<Mutex<EngineState>>, host: &str, port: u16) -> Result<(), Error> {
    let result = serve(&es, host, port);
    if let Err(err) = &result {
        if err.is_fatal() {
            eprintln!("{}", format!("retrograde: fatal: {err}").red());
        } else {
            println!("{}", format!("retrograde: IDE connection ended: {err:#}").yellow());
        }
    }
    lock(&es).close_ide();
    println!("{}", "retrograde: closing connection to IDE".yellow());
    result
}

fn serve(es: &Arc<Mutex<EngineState>>, host: &str, port: u16) -> Result<(), Error> {
    println!("{}", "retrograde: trying to connect to debugger IDE".yellow());
    let mut stream = TcpStream::connect((host, port)).map_err(|err| {
        Error::IdeProtocol(format!(
            "{err}: is your IDE listening for debugging connections from PHP?"
        ))
    })?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let direction = {
        let mut guard = lock(es);
        guard.ide = Some(stream.try_clone()?);
        let init = xml::init_packet(&guard.entry_file, std::process::id());
        stream.write_all(&dbgp::frame(&init))?;
        guard.direction.clone()
    };
    println!("{}", "retrograde: connected to PHP IDE debugger".green());

    loop {
        if lock(es).status == Status::Stopped {
            break;
        }

        let line = match dbgp::read_command(&mut reader)? {
            Some(line) => line,
            None => {
                log::debug!(target: "ide", "EOF on the IDE connection");
                break;
            }
        };
        if VERBOSE.load(Ordering::Relaxed) {
            println!("{}", format!("\nide -> retrograde: {line}").cyan());
        }

        // the direction is sampled exactly once per command
        let dir = *lock(&direction);
        let cmd = DbgpCommand::parse(&line, dir)?;

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut guard = lock(es);
            dispatch::dispatch(&mut guard, &cmd)
        }));

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) if err.is_protocol_answerable() => {
                log::warn!(target: "ide", "{} failed: {err}", cmd.verb);
                xml::error_response(&cmd.verb, cmd.seq, err.dbgp_code(), &err.to_string())
            }
            Ok(Err(err)) => return Err(err),
            Err(panic) => {
                println!("{}", panic_message(panic).red());
                println!(
                    "{}",
                    "Recovering from panic, shutting the IDE connection down. \
                     The retrograde prompt stays operable."
                        .yellow()
                );
                break;
            }
        };

        stream.write_all(&dbgp::frame(&response))?;
        if VERBOSE.load(Ordering::Relaxed) {
            let truncated = if response.len() > ECHO_LIMIT { "..." } else { "" };
            let shown = &response[..response.len().min(ECHO_LIMIT)];
            println!("{}", format!("retrograde -> ide:\n{shown}{truncated}").green());
        }
    }

    Ok(())
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic in the IDE loop".to_string()
    }
}
