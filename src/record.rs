//! Recording supervision: runs the PHP built-in server under `rr record`
//! while a trivial DBGp client keeps the debug engine inside PHP from
//! blocking, answering every packet with a `run` command.

use crate::dbgp;
use anyhow::{Context, bail};
use std::io::{self, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Command, Stdio};
use std::thread;

pub struct RecordOptions {
    pub rr_path: String,
    pub php_path: String,
    pub docroot: String,
    /// Address of the PHP built-in server being recorded.
    pub server_addr: String,
    /// Address the DBGp client listens on for connections from PHP.
    pub dbgp_listen: String,
}

pub fn run(opts: &RecordOptions) -> anyhow::Result<()> {
    start_basic_dbgp_client(&opts.dbgp_listen)?;

    let mut cmd = Command::new(&opts.rr_path);
    cmd.arg("record")
        .arg(&opts.php_path)
        .arg("-S")
        .arg(&opts.server_addr)
        .arg("-t")
        .arg(&opts.docroot)
        .stderr(Stdio::piped());

    log::info!(target: "record", "issuing command: {cmd:?}");
    let mut child = cmd.spawn().context("start rr record")?;

    println!("Successfully started recording session... Press Ctrl-C to terminate recording");
    println!(
        "PHP built in cli server is running at {} with docroot: {}",
        opts.server_addr, opts.docroot
    );

    // the server logs requests on stderr; show them while recording
    let mut stderr = child.stderr.take().expect("stderr is piped");
    let _ = io::copy(&mut stderr, &mut io::stdout());

    let status = child.wait()?;
    if !status.success() {
        bail!("rr record exited with {status}");
    }
    Ok(())
}

/// Accept DBGp connections from the recorded PHP and answer every inbound
/// packet with `run -i <seq>` so execution is never suspended.
fn start_basic_dbgp_client(listen: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .with_context(|| format!("bind DBGp client to {listen}"))?;
    println!("Retrograde DBGp debugger client is listening on {listen} for connections from PHP");

    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    thread::spawn(move || keep_running(stream));
                }
                Err(err) => log::warn!(target: "record", "accept failed: {err}"),
            }
        }
    });
    Ok(())
}

fn keep_running(stream: TcpStream) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(err) => {
            log::warn!(target: "record", "clone DBGp stream: {err}");
            return;
        }
    };
    let mut reader = BufReader::new(stream);

    let mut seq = 0u64;
    loop {
        match dbgp::read_frame(&mut reader) {
            Ok(Some(packet)) => {
                println!("<- {packet}");
                seq += 1;
                let command = format!("run -i {seq}\0");
                if writer.write_all(command.as_bytes()).is_err() {
                    break;
                }
                println!("-> {command}");
            }
            Ok(None) => break,
            Err(err) => {
                log::warn!(target: "record", "DBGp engine packet unreadable: {err}");
                break;
            }
        }
    }
}
