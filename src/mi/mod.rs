//! Client for a gdb child process speaking the MI dialect.
//!
//! Commands are synchronous: one request in flight, responses matched in
//! arrival order. Asynchronous `*stopped` records are routed by a reader
//! thread: breakpoint hits go to a single-consumer channel (the step engine
//! blocks on it), everything else to a log-only sink gated by
//! [`SHOW_GDB_NOTIFICATIONS`].

pub mod parser;

use crate::engine::error::Error;
use parser::{AsyncKind, MiRecord, MiValue, ResultClass};
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Operator toggle: when set, every non-breakpoint notification from gdb is
/// printed to the log as JSON.
pub static SHOW_GDB_NOTIFICATIONS: AtomicBool = AtomicBool::new(false);

/// A parsed response to a synchronous MI request.
#[derive(Debug)]
pub struct MiResult {
    pub class: ResultClass,
    pub payload: MiValue,
}

/// An execution stop reported by gdb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    /// `reason="breakpoint-hit"`; carries the gdb breakpoint number.
    Breakpoint(String),
    /// Any other stop: replay boundary (`no-history`), process exit, signals.
    Terminus { reason: String },
}

pub struct GdbClient {
    child: Option<Child>,
    stdin: Box<dyn Write + Send>,
    results: Receiver<MiResult>,
    stops: Receiver<StopEvent>,
    entry_stop: Receiver<String>,
    _reader: thread::JoinHandle<()>,
}

impl GdbClient {
    /// Start gdb against the extended-remote endpoint exposed by the replay,
    /// loading the hardlink binary the replayer printed.
    pub fn start(gdb_path: &str, remote_port: u16, hardlink: &str) -> Result<GdbClient, Error> {
        let mut cmd = Command::new(gdb_path);
        cmd.arg("-l")
            .arg("-1")
            .arg("-ex")
            .arg(format!("target extended-remote :{remote_port}"))
            .arg("--interpreter")
            .arg("mi")
            .arg(hardlink)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        log::info!(target: "mi", "issuing command: {cmd:?}");

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().expect("stdin is piped");
        let stdout = child.stdout.take().expect("stdout is piped");

        let mut client = Self::from_streams(stdout, stdin);
        client.child = Some(child);
        Ok(client)
    }

    /// Build a client from raw MI streams. Used by [`GdbClient::start`] and by
    /// tests that script the gdb side.
    pub fn from_streams(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> GdbClient {
        let (results_tx, results_rx) = mpsc::channel();
        let (stops_tx, stops_rx) = mpsc::channel();
        let (entry_tx, entry_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            reader_loop(BufReader::new(reader), results_tx, stops_tx, entry_tx)
        });

        GdbClient {
            child: None,
            stdin: Box::new(writer),
            results: results_rx,
            stops: stops_rx,
            entry_stop: entry_rx,
            _reader: handle,
        }
    }

    /// Send one MI command and block for its result record.
    ///
    /// `verb` is the MI name without the leading dash (`break-insert`,
    /// `exec-continue`, ...). Returns the result payload, or
    /// [`Error::NativeDbg`] for a result of class `error`.
    pub fn send(&mut self, verb: &str, args: &str) -> Result<MiValue, Error> {
        if args.is_empty() {
            log::debug!(target: "mi", "-> -{verb}");
            writeln!(self.stdin, "-{verb}")?;
        } else {
            log::debug!(target: "mi", "-> -{verb} {args}");
            writeln!(self.stdin, "-{verb} {args}")?;
        }
        self.stdin.flush()?;

        let result = self.results.recv().map_err(|_| Error::GdbClosed)?;
        match result.class {
            ResultClass::Error => {
                let msg = result
                    .payload
                    .str_field("msg")
                    .unwrap_or("unknown error")
                    .to_string();
                Err(Error::NativeDbg(msg))
            }
            _ => Ok(result.payload),
        }
    }

    /// `data-evaluate-expression`, returning the raw `value` string.
    pub fn evaluate(&mut self, expr: &str) -> Result<String, Error> {
        let payload = self.send("data-evaluate-expression", expr)?;
        payload
            .str_field("value")
            .map(str::to_string)
            .ok_or_else(|| Error::MiParse(format!("no value in evaluation of `{expr}`")))
    }

    /// Block until the temporary start-up breakpoint reports the first stop.
    /// That notification is consumed here and never reaches [`recv_stop`].
    pub fn wait_entry_stop(&self, timeout: Duration) -> Result<(), Error> {
        match self.entry_stop.recv_timeout(timeout) {
            Ok(_) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(Error::ReplayHandshake(
                "timed out waiting for the entry breakpoint",
            )),
            Err(RecvTimeoutError::Disconnected) => Err(Error::GdbClosed),
        }
    }

    /// Block until the inferior stops. Single consumer; called only from the
    /// step engine while a continuation is in flight.
    pub fn recv_stop(&self) -> Result<StopEvent, Error> {
        self.stops.recv().map_err(|_| Error::GdbClosed)
    }

    /// Drain one pending stop if any arrived. Used to check that diversion
    /// queries did not trip a breakpoint.
    pub fn try_recv_stop(&self) -> Option<StopEvent> {
        match self.stops.try_recv() {
            Ok(ev) => Some(ev),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Terminate the gdb session, best effort.
    pub fn exit(&mut self) {
        let _ = writeln!(self.stdin, "-gdb-exit");
        let _ = self.stdin.flush();
        if let Some(mut child) = self.child.take() {
            if let Ok(None) = child.try_wait() {
                thread::sleep(Duration::from_millis(200));
                if let Ok(None) = child.try_wait() {
                    let _ = child.kill();
                }
            }
            let _ = child.wait();
        }
    }
}

fn reader_loop(
    reader: impl BufRead,
    results_tx: Sender<MiResult>,
    stops_tx: Sender<StopEvent>,
    entry_tx: Sender<String>,
) {
    let mut seen_first_hit = false;

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.is_empty() {
            continue;
        }

        let record = match parser::parse_line(&line) {
            Ok(record) => record,
            Err(err) => {
                log::warn!(target: "mi", "{err}");
                continue;
            }
        };

        match record {
            MiRecord::Result { class, payload, .. } => {
                if results_tx.send(MiResult { class, payload }).is_err() {
                    break;
                }
            }
            MiRecord::Async {
                kind: AsyncKind::Exec,
                ref class,
                ref payload,
                ..
            } if class == "stopped" => {
                match payload.str_field("reason") {
                    Some("breakpoint-hit") => {
                        let id = payload.str_field("bkptno").unwrap_or_default().to_string();
                        if !seen_first_hit {
                            // the start-up breakpoint; handshake consumes it
                            seen_first_hit = true;
                            let _ = entry_tx.send(id);
                        } else if stops_tx.send(StopEvent::Breakpoint(id)).is_err() {
                            break;
                        }
                    }
                    reason => {
                        let reason = reason.unwrap_or("unknown").to_string();
                        if stops_tx.send(StopEvent::Terminus { reason }).is_err() {
                            break;
                        }
                    }
                }
            }
            other => log_notification(&other),
        }
    }

    log::debug!(target: "mi", "gdb output stream closed");
}

fn log_notification(record: &MiRecord) {
    match record {
        MiRecord::Stream { text, .. } => {
            log::debug!(target: "mi", "{}", text.trim_end());
        }
        MiRecord::Async {
            kind,
            class,
            payload,
            ..
        } => {
            if SHOW_GDB_NOTIFICATIONS.load(Ordering::Relaxed) {
                let json = serde_json::to_string_pretty(payload).unwrap_or_default();
                log::info!(target: "mi", "{kind:?} {class}: {json}");
            }
        }
        MiRecord::Prompt | MiRecord::Result { .. } => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn client_over(script: &str) -> GdbClient {
        GdbClient::from_streams(Cursor::new(script.to_string()), std::io::sink())
    }

    #[test]
    fn test_send_matches_result_in_order() {
        let mut gdb = client_over(
            "=thread-group-added,id=\"i1\"\n\
             ^done,bkpt={number=\"1\",line=\"94\"}\n\
             (gdb) \n\
             ^done,bkpt={number=\"2\",line=\"90\"}\n",
        );

        let first = gdb.send("break-insert", "-f -d --source x.c --line 94").unwrap();
        assert_eq!(first.get("bkpt").unwrap().str_field("number"), Some("1"));
        let second = gdb.send("break-insert", "-t -f --source x.c --line 90").unwrap();
        assert_eq!(second.get("bkpt").unwrap().str_field("number"), Some("2"));
    }

    #[test]
    fn test_error_result_is_surfaced() {
        let mut gdb = client_over("^error,msg=\"No symbol \\\"nothing\\\" in current context.\"\n");
        let err = gdb.send("data-evaluate-expression", "nothing").unwrap_err();
        assert!(matches!(err, Error::NativeDbg(msg) if msg.contains("No symbol")));
    }

    #[test]
    fn test_first_hit_swallowed_rest_published() {
        let gdb = client_over(
            "*stopped,reason=\"breakpoint-hit\",bkptno=\"2\"\n\
             *stopped,reason=\"breakpoint-hit\",bkptno=\"1\"\n\
             *stopped,reason=\"no-history\"\n",
        );

        gdb.wait_entry_stop(Duration::from_secs(1)).unwrap();
        assert_eq!(
            gdb.recv_stop().unwrap(),
            StopEvent::Breakpoint("1".to_string())
        );
        assert_eq!(gdb.recv_stop().unwrap(), StopEvent::Terminus {
            reason: "no-history".to_string()
        });
    }

    #[test]
    fn test_evaluate_unwraps_value() {
        let mut gdb = client_over("^done,value=\"2\"\n");
        assert_eq!(gdb.evaluate("level").unwrap(), "2");
    }
}
