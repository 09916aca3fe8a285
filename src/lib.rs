pub mod dbgp;
pub mod engine;
pub mod log;
pub mod mi;
pub mod record;
pub mod snapshot;
pub mod ui;
