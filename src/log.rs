//! Logging setup for the bridge. The backend is installed once; what changes
//! at runtime is the global level ceiling, so the console's `v` command can
//! turn protocol traces on and off without restarting the session.

use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

/// Level ceiling while the console is in quiet mode.
const QUIET_LEVEL: LevelFilter = LevelFilter::Info;

/// Filter configured at startup (`RUST_LOG`, or debug by default); the
/// verbose toggle restores it as the ceiling.
static CONFIGURED_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

/// Install the env_logger backend. The filter admits debug records so that
/// verbose mode has something to raise the ceiling to, but the session
/// starts quiet.
pub fn init() {
    let logger = env_logger::Builder::from_env(Env::default().default_filter_or("debug")).build();
    let configured = logger.filter();
    CONFIGURED_LEVEL
        .set(configured)
        .expect("logger initialized once");
    log::set_boxed_logger(Box::new(logger)).expect("logger initialized once");
    log::set_max_level(configured.min(QUIET_LEVEL));
}

/// Raise or drop the level ceiling. Flipped by the console `v` command.
pub fn set_verbose(verbose: bool) {
    let configured = CONFIGURED_LEVEL.get().copied().unwrap_or(QUIET_LEVEL);
    let ceiling = if verbose {
        configured
    } else {
        configured.min(QUIET_LEVEL)
    };
    log::set_max_level(ceiling);
}
