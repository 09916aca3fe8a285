//! Replay supervision: starts `rr replay` under a pseudo-terminal, finds the
//! gdb endpoint it prints, attaches gdb and runs the handshake up to the
//! entry capture point.

use crate::engine::error::Error;
use crate::engine::locmap::{GENERATED_FILE, INIT_SENTINEL_LINE, LocationMap, STEP_SENTINEL_LINE};
use crate::engine::{EngineState, ReplayChild, STEPPING_BP_ID};
use crate::mi::GdbClient;
use crate::mi::parser::decode_string_literal;
use crossterm::style::Stylize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use timeout_readwrite::TimeoutReader;

const HANDSHAKE_MARKER: &str = "target extended-remote";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ReplayOptions {
    pub rr_path: String,
    pub gdb_path: String,
    /// rr trace to replay; the latest trace when absent.
    pub trace_dir: Option<PathBuf>,
    /// Port for gdb's extended-remote attach.
    pub remote_port: u16,
}

/// Start the replay session and return the initialized engine state.
pub fn start(opts: &ReplayOptions, locations: LocationMap) -> Result<EngineState, Error> {
    let pty = nix::pty::openpty(None, None).map_err(|e| Error::Syscall("openpty", e))?;
    let master = File::from(pty.master);

    let mut cmd = Command::new(&opts.rr_path);
    cmd.arg("replay").arg("-s").arg(opts.remote_port.to_string());
    if let Some(trace_dir) = &opts.trace_dir {
        cmd.arg(trace_dir);
    }
    cmd.stdin(Stdio::from(pty.slave.try_clone()?))
        .stdout(Stdio::from(pty.slave.try_clone()?))
        .stderr(Stdio::from(pty.slave));
    unsafe {
        cmd.pre_exec(|| {
            // own session so rr gets the pty as its controlling terminal
            nix::unistd::setsid()?;
            Ok(())
        });
    }

    log::info!(target: "engine", "issuing command: {cmd:?}");
    let child = cmd.spawn()?;
    println!("{}", "retrograde: successfully started replay session".green());

    let hardlink = scan_for_endpoint(master.try_clone()?)?;
    log::debug!(target: "engine", "replayed binary hardlink: {hardlink}");

    // keep forwarding replay output now that the handshake line was seen
    let tee = master.try_clone()?;
    thread::spawn(move || {
        let mut tee = tee;
        let _ = io::copy(&mut tee, &mut io::stdout());
    });

    let mut gdb = GdbClient::start(&opts.gdb_path, opts.remote_port, &hardlink)?;

    // the stepping breakpoint, disabled until a step is requested
    let payload = gdb.send(
        "break-insert",
        &format!("-f -d --source {GENERATED_FILE} --line {STEP_SENTINEL_LINE}"),
    )?;
    let number = payload
        .get("bkpt")
        .and_then(|bkpt| bkpt.str_field("number"))
        .unwrap_or_default();
    if number != STEPPING_BP_ID {
        return Err(Error::InvariantViolation(format!(
            "stepping breakpoint got gdb number {number}, expected {STEPPING_BP_ID}"
        )));
    }

    // temporary breakpoint that halts the replay right after the entry
    // filename is captured
    gdb.send(
        "break-insert",
        &format!("-t -f --source {GENERATED_FILE} --line {INIT_SENTINEL_LINE}"),
    )?;

    // gdb must not chop long value dumps
    gdb.send("gdb-set", "print elements 0")?;

    gdb.send("exec-continue", "")?;
    gdb.wait_entry_stop(HANDSHAKE_TIMEOUT)?;

    let literal = gdb.evaluate("filename")?;
    let entry_path = decode_string_literal(&literal)?;
    let entry_file = format!("file://{entry_path}");

    log::info!(
        target: "engine",
        "session ready: entry {entry_file}, {} sources, {} stack levels",
        locations.file_count(),
        locations.max_stack_depth(),
    );
    let level_lines: Vec<u32> = (0..locations.max_stack_depth())
        .filter_map(|depth| locations.level_line(depth))
        .collect();
    log::debug!(target: "engine", "per-depth break lines in {GENERATED_FILE}: {level_lines:?}");

    Ok(EngineState::new(
        gdb,
        Some(ReplayChild {
            child,
            pty_master: master,
        }),
        locations,
        entry_file,
    ))
}

/// Copy rr output to stdout until the line carrying the extended-remote
/// endpoint shows up; the suffix from the first `/` is the hardlink path gdb
/// has to load.
fn scan_for_endpoint(master: File) -> Result<String, Error> {
    let mut reader = BufReader::new(TimeoutReader::new(master, HANDSHAKE_TIMEOUT));
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                return Err(Error::ReplayHandshake(
                    "rr exited before printing the gdb endpoint",
                ));
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                return Err(Error::ReplayHandshake(
                    "rr did not print the gdb endpoint within 5 seconds",
                ));
            }
            Err(err) => return Err(err.into()),
        }

        print!("{line}");
        let _ = io::stdout().flush();

        if line.contains(HANDSHAKE_MARKER) {
            let slash = line.find('/').ok_or(Error::ReplayHandshake(
                "endpoint line carries no hardlink path",
            ))?;
            return Ok(line[slash..].trim().to_string());
        }
    }
}
