//! The operator console: a readline loop with persistent history that
//! controls the debugging direction, verbosity and notification logging, and
//! forwards raw MI or DBGp commands to the session.

use crate::engine::{Direction, EngineState};
use crate::mi::SHOW_GDB_NOTIFICATIONS;
use crate::ui::{VERBOSE, lock};
use crossterm::style::Stylize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};

const PROMPT: &str = "(retrograde) ";
const HISTORY_FILE: &str = ".retrograde_history";

const HELP_TEXT: &str = r##"
h        display this help text
q        quit
r        debug in reverse mode
f        debug in forward (normal) mode
t        toggle between reverse and forward modes
v        toggle between verbose and quiet modes
n        toggle between showing and not showing gdb notifications
<enter>  will tell you whether you are in forward or reverse mode

Debugging in reverse mode can be confusing but here is a cheat sheet.
The buttons of your PHP IDE debugger mean the opposite while in reverse mode:

         step-into     becomes: step-into a PHP statement in the reverse direction

         step-over     becomes: step-over one PHP statement backwards; stops at
                                breakpoints encountered on the way, as usual

         step-out      becomes: run backwards until you are about to enter the
                                current function; stops at breakpoints on the way

         run/continue  becomes: run backwards until you hit a breakpoint

Expert usage:
* Prefix a command with "-" to send it to gdb in MI form, e.g. -thread-info
* Prefix a command with "#" to run a raw DBGp command in a diversion session,
  e.g. #stack_get -i 0 (only a subset of DBGp commands works this way)
"##;

pub fn run(es: Arc<Mutex<EngineState>>) -> anyhow::Result<()> {
    let direction = lock(&es).direction.clone();

    static CTRLC_ONCE: Once = Once::new();
    CTRLC_ONCE.call_once(|| {
        // Ctrl-C must not kill the bridge while a continuation is in flight;
        // rewriting the default handler is good enough
        ctrlc::set_handler(|| {}).expect("error setting Ctrl-C handler")
    });

    let mut editor = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    println!(
        "{}",
        "h <enter> for help. If the prompt does not display press <enter>".yellow()
    );

    loop {
        let line = match editor.readline(PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("{}", "Exiting.".yellow());
                break;
            }
            Err(err) => return Err(err.into()),
        };
        let input = line.trim();
        if !input.is_empty() {
            let _ = editor.add_history_entry(input);
        }

        if input.starts_with('q') {
            println!("{}", "Exiting.".yellow());
            break;
        } else if input.starts_with('h') {
            println!("{HELP_TEXT}");
        } else if input.starts_with('t') {
            let mut dir = lock(&direction);
            *dir = match *dir {
                Direction::Forward => Direction::Reverse,
                Direction::Reverse => Direction::Forward,
            };
            print_direction(*dir);
        } else if input.starts_with('r') {
            *lock(&direction) = Direction::Reverse;
            print_direction(Direction::Reverse);
        } else if input.starts_with('f') {
            *lock(&direction) = Direction::Forward;
            print_direction(Direction::Forward);
        } else if input.starts_with('v') {
            let on = toggle(&VERBOSE);
            crate::log::set_verbose(on);
            print_toggle(on, "Verbose mode", "Quiet mode");
        } else if input.starts_with('n') {
            print_toggle(
                toggle(&SHOW_GDB_NOTIFICATIONS),
                "Will show gdb notifications",
                "Wont show gdb notifications",
            );
        } else if let Some(mi_cmd) = input.strip_prefix('-') {
            match lock(&es).gdb.send(mi_cmd.trim(), "") {
                Ok(payload) => match serde_json::to_string_pretty(&payload) {
                    Ok(json) => println!("{json}"),
                    Err(err) => println!("{}", err.to_string().red()),
                },
                Err(err) => println!("{}", err.to_string().red()),
            }
        } else if let Some(dbgp_cmd) = input.strip_prefix('#') {
            match lock(&es).run_diversion(dbgp_cmd.trim()) {
                Ok(xml) => println!("{xml}"),
                Err(err) => println!("{}", err.to_string().red()),
            }
        } else {
            // an empty line (or anything unrecognized) reports the direction
            print_direction(*lock(&direction));
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    Ok(())
}

fn history_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(HISTORY_FILE))
}

fn toggle(flag: &AtomicBool) -> bool {
    let new = !flag.load(Ordering::Relaxed);
    flag.store(new, Ordering::Relaxed);
    new
}

fn print_toggle(on: bool, on_text: &str, off_text: &str) {
    if on {
        println!("{}", on_text.red());
    } else {
        println!("{}", off_text.green());
    }
}

fn print_direction(direction: Direction) {
    match direction {
        Direction::Reverse => println!("{}", "In reverse mode".red()),
        Direction::Forward => println!("{}", "In forward mode".green()),
    }
}
