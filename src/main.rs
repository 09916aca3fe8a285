use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use crossterm::style::Stylize;
use retrograde::engine::locmap::LocationMap;
use retrograde::engine::replay::{self, ReplayOptions};
use retrograde::record::{self, RecordOptions};
use retrograde::{snapshot, ui};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Replay a recorded execution and serve it to a DBGp IDE, in both directions
    Replay {
        /// Directory of the PHP extension holding the generated retrograde_break.c
        #[clap(long)]
        ext_dir: PathBuf,

        /// Host on which the IDE listens for DBGp connections
        #[clap(long, default_value = "127.0.0.1")]
        ide_host: String,

        /// Port on which the IDE listens for DBGp connections
        #[clap(long, default_value_t = 9000)]
        ide_port: u16,

        /// Port used for gdb's extended-remote attach to the replay
        #[clap(long, default_value_t = 9999)]
        gdb_port: u16,

        /// Pick a saved snapshot instead of replaying the latest trace
        #[clap(long)]
        snapshot: bool,

        #[clap(long, default_value = "rr")]
        rr_path: String,

        #[clap(long, default_value = "gdb")]
        gdb_path: String,
    },
    /// Start the built in PHP server and record its execution with rr
    Record {
        /// Server docroot
        #[clap(long)]
        docroot: String,

        #[clap(long, default_value = "rr")]
        rr_path: String,

        #[clap(long, default_value = "php")]
        php_path: String,

        /// Address of the recorded PHP built-in server
        #[clap(long, default_value = "127.0.0.1:8088")]
        server_addr: String,

        /// Address the recording-side DBGp client listens on
        #[clap(long, default_value = "127.0.0.1:9000")]
        dbgp_listen: String,
    },
    /// List saved snapshots
    Snapshots,
}

fn main() -> anyhow::Result<()> {
    retrograde::log::init();

    match Cli::parse().command {
        Cmd::Replay {
            ext_dir,
            ide_host,
            ide_port,
            gdb_port,
            snapshot,
            rr_path,
            gdb_path,
        } => run_replay(ext_dir, ide_host, ide_port, gdb_port, snapshot, rr_path, gdb_path),
        Cmd::Record {
            docroot,
            rr_path,
            php_path,
            server_addr,
            dbgp_listen,
        } => record::run(&RecordOptions {
            rr_path,
            php_path,
            docroot,
            server_addr,
            dbgp_listen,
        }),
        Cmd::Snapshots => snapshot::print_listing(),
    }
}

fn run_replay(
    ext_dir: PathBuf,
    ide_host: String,
    ide_port: u16,
    gdb_port: u16,
    use_snapshot: bool,
    rr_path: String,
    gdb_path: String,
) -> anyhow::Result<()> {
    let locations = LocationMap::load(&ext_dir).context("load instrumentation break map")?;

    let trace_dir = if use_snapshot {
        match snapshot::choose_interactive()? {
            Some(snap) => {
                println!(
                    "{}",
                    format!(
                        "retrograde: using snapshot {} corresponding to rr trace: {}",
                        snap.sources_root,
                        snap.trace_dir.display()
                    )
                    .yellow()
                );
                Some(snap.trace_dir)
            }
            None => return Ok(()),
        }
    } else {
        println!("{}", "retrograde: using latest trace".yellow());
        None
    };

    let opts = ReplayOptions {
        rr_path,
        gdb_path,
        trace_dir,
        remote_port: gdb_port,
    };
    let es = replay::start(&opts, locations).context("start replay session")?;

    let es = Arc::new(Mutex::new(es));
    let ide_es = es.clone();
    let ide_handle = thread::spawn(move || ui::ide::run(ide_es, &ide_host, ide_port));

    ui::console::run(es.clone())?;

    // unblock the IDE loop, reap it, then drop the session which tears down
    // gdb, the pty and the rr child
    es.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .close_ide();
    let ide_result = ide_handle.join();
    drop(es);

    if let Ok(Err(err)) = ide_result {
        if err.is_fatal() {
            bail!("debug session failed: {err}");
        }
    }
    Ok(())
}
