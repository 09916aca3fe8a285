//! Session state of the replay bridge: execution status, breakpoint table,
//! feature map, frozen break-location maps, handles to gdb, the rr replay
//! child and the IDE connection.

pub mod dispatch;
pub mod error;
pub mod locmap;
pub mod replay;
pub mod step;

use crate::engine::error::Error;
use crate::engine::locmap::LocationMap;
use crate::mi::parser::decode_string_literal;
use crate::mi::GdbClient;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::net::{Shutdown, TcpStream};
use std::process::Child;
use std::sync::{Arc, Mutex};

/// Reserved id of the internal stepping breakpoint, the first breakpoint gdb
/// allocates during the handshake.
pub const STEPPING_BP_ID: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Reverse => f.write_str("reverse"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Starting,
    Running,
    Break,
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Starting => f.write_str("starting"),
            Status::Running => f.write_str("running"),
            Status::Break => f.write_str("break"),
            Status::Stopped => f.write_str("stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Ok,
    Error,
    Aborted,
    Exception,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Ok => f.write_str("ok"),
            Reason::Error => f.write_str("error"),
            Reason::Aborted => f.write_str("aborted"),
            Reason::Exception => f.write_str("exception"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Line,
    Call,
    Return,
    Exception,
    Conditional,
    Watch,
    /// The stepping breakpoint; never visible to the IDE.
    Internal,
}

impl BreakpointKind {
    pub fn from_dbgp(name: &str) -> Option<BreakpointKind> {
        match name {
            "line" => Some(BreakpointKind::Line),
            "call" => Some(BreakpointKind::Call),
            "return" => Some(BreakpointKind::Return),
            "exception" => Some(BreakpointKind::Exception),
            "conditional" => Some(BreakpointKind::Conditional),
            "watch" => Some(BreakpointKind::Watch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointState {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: String,
    pub kind: BreakpointKind,
    pub state: BreakpointState,
    pub temporary: bool,
    /// `file://` URL of the PHP source, empty for the internal breakpoint.
    pub source: String,
    pub line: u32,
    pub function: Option<String>,
    pub condition: Option<String>,
    /// gdb-side breakpoint number; present for every mapped line breakpoint.
    pub gdb_number: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Feature {
    pub value: String,
    pub supported: bool,
    pub read_only: bool,
}

pub type FeatureMap = IndexMap<&'static str, Feature>;

fn feature(value: &str, supported: bool, read_only: bool) -> Feature {
    Feature {
        value: value.to_string(),
        supported,
        read_only,
    }
}

pub fn init_feature_map() -> FeatureMap {
    IndexMap::from([
        ("language_supports_threads", feature("0", true, false)),
        ("language_name", feature("PHP", true, false)),
        ("language_version", feature("7.0", true, false)),
        ("encoding", feature("iso-8859-1", true, true)),
        ("protocol_version", feature("1", true, true)),
        ("supports_async", feature("0", true, true)),
        ("data_encoding", feature("base64", true, true)),
        ("breakpoint_languages", feature("", false, true)),
        ("breakpoint_types", feature("line", true, true)),
        ("multiple_sessions", feature("0", true, false)),
        ("max_children", feature("64", true, false)),
        ("max_data", feature("2048", true, false)),
        ("max_depth", feature("1", true, false)),
        ("extended_properties", feature("0", true, false)),
        ("supports_postmortem", feature("0", true, true)),
        ("show_hidden", feature("0", true, false)),
        ("notify_ok", feature("0", true, false)),
    ])
}

/// Redirection mode of one of the replayed process std descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    #[default]
    Disabled,
    Copy,
    Redirect,
}

impl RedirectMode {
    pub fn from_dbgp(mode: &str) -> Option<RedirectMode> {
        match mode {
            "0" => Some(RedirectMode::Disabled),
            "1" => Some(RedirectMode::Copy),
            "2" => Some(RedirectMode::Redirect),
            _ => None,
        }
    }
}

/// The rr replay child and its controlling pseudo-terminal.
pub struct ReplayChild {
    pub child: Child,
    pub pty_master: File,
}

/// Shared session context, created by the replay supervisor and alive until
/// the operator quits.
pub struct EngineState {
    pub gdb: GdbClient,
    pub replay: Option<ReplayChild>,
    pub ide: Option<TcpStream>,
    /// `file://` URL of the PHP entry script, frozen after the handshake.
    pub entry_file: String,
    pub status: Status,
    pub reason: Reason,
    /// Frozen after initialization.
    pub locations: LocationMap,
    pub features: FeatureMap,
    pub breakpoints: BTreeMap<String, Breakpoint>,
    pub last_seq: u64,
    /// Toggled by the console, read by the IDE loop once per command.
    pub direction: Arc<Mutex<Direction>>,
    pub redirects: [RedirectMode; 3],
}

impl EngineState {
    pub fn new(
        gdb: GdbClient,
        replay: Option<ReplayChild>,
        locations: LocationMap,
        entry_file: String,
    ) -> EngineState {
        let mut breakpoints = BTreeMap::new();
        breakpoints.insert(STEPPING_BP_ID.to_string(), Breakpoint {
            id: STEPPING_BP_ID.to_string(),
            kind: BreakpointKind::Internal,
            state: BreakpointState::Disabled,
            temporary: false,
            source: String::new(),
            line: locmap::STEP_SENTINEL_LINE,
            function: None,
            condition: None,
            gdb_number: Some(STEPPING_BP_ID.to_string()),
        });

        EngineState {
            gdb,
            replay,
            ide: None,
            entry_file,
            status: Status::Starting,
            reason: Reason::Ok,
            locations,
            features: init_feature_map(),
            breakpoints,
            last_seq: 0,
            direction: Arc::new(Mutex::new(Direction::Forward)),
            redirects: [RedirectMode::Disabled; 3],
        }
    }

    /// Close the IDE connection if one is attached.
    pub fn close_ide(&mut self) {
        if let Some(stream) = self.ide.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// gdb numbers of all currently enabled user breakpoints. The stepping
    /// breakpoint never appears here; it is disabled outside of stepping.
    pub fn enabled_user_breakpoints(&self) -> Vec<String> {
        self.breakpoints
            .values()
            .filter(|bp| {
                bp.kind != BreakpointKind::Internal && bp.state == BreakpointState::Enabled
            })
            .filter_map(|bp| bp.gdb_number.clone())
            .collect()
    }

    /// Run one DBGp command inside the replayed process without advancing it:
    /// the command line is handed to the instrumented runtime through a gdb
    /// expression call, and the XML answer comes back as a string literal.
    pub fn run_diversion(&mut self, dbgp_line: &str) -> Result<String, Error> {
        let escaped = dbgp_line.replace('\\', "\\\\").replace('"', "\\\"");
        let literal = self
            .gdb
            .evaluate(&format!("retrograde_xdebug_cmd(\"{escaped}\")"))?;
        let xml = decode_string_literal(&literal)?;

        if let Some(crate::mi::StopEvent::Breakpoint(id)) = self.gdb.try_recv_stop() {
            if id == STEPPING_BP_ID {
                return Err(Error::InvariantViolation(
                    "stepping breakpoint fired during a diversion session".into(),
                ));
            }
            log::warn!(target: "engine", "stray stop on breakpoint {id} during diversion");
        }

        Ok(xml)
    }

    /// Diversion variant for queries that execute PHP code: all user
    /// breakpoints are disabled up front and re-enabled on every exit path.
    pub fn run_diversion_without_breakpoints(&mut self, dbgp_line: &str) -> Result<String, Error> {
        let numbers = self.enabled_user_breakpoints();
        for number in &numbers {
            self.gdb.send("break-disable", number)?;
        }

        let result = self.run_diversion(dbgp_line);

        for number in &numbers {
            if let Err(err) = self.gdb.send("break-enable", number) {
                log::error!(target: "engine", "failed to re-enable breakpoint {number}: {err}");
            }
        }

        result
    }
}

impl Drop for EngineState {
    fn drop(&mut self) {
        self.close_ide();
        self.gdb.exit();
        if let Some(replay) = self.replay.take() {
            // closing the pty master unblocks rr, then reap it
            let ReplayChild {
                mut child,
                pty_master,
            } = replay;
            drop(pty_master);
            if let Err(err) = child.wait() {
                log::warn!(target: "engine", "rr replay did not exit cleanly: {err}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_feature_map_defaults() {
        let features = init_feature_map();
        assert!(features["protocol_version"].read_only);
        assert!(!features["breakpoint_languages"].supported);
        assert_eq!(features["data_encoding"].value, "base64");
    }

    #[test]
    fn test_redirect_mode_parse() {
        assert_eq!(RedirectMode::from_dbgp("0"), Some(RedirectMode::Disabled));
        assert_eq!(RedirectMode::from_dbgp("2"), Some(RedirectMode::Redirect));
        assert_eq!(RedirectMode::from_dbgp("9"), None);
    }
}
