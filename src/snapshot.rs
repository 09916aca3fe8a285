//! Discovery of saved replay snapshots. A snapshot is an rr trace directory
//! containing a `retrograde-snapshot*` metadata file with a single line
//! `<php-sources-root>:<original-docroot-or-script>`.

use anyhow::Context;
use crossterm::style::Stylize;
use std::fs;
use std::io::{BufRead, Write};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SnapInfo {
    /// The rr trace directory to replay.
    pub trace_dir: PathBuf,
    /// Where the PHP sources were copied when the snapshot was taken.
    pub sources_root: String,
    /// The docroot or script that was originally recorded.
    pub original_target: String,
}

const METADATA_PREFIX: &str = "retrograde-snapshot";

/// Scan `~/.local/share/rr` for snapshot metadata. The `latest-trace` symlink
/// and empty metadata files are skipped.
pub fn discover() -> anyhow::Result<Vec<SnapInfo>> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    let rr_home = PathBuf::from(home).join(".local/share/rr");

    let mut snaps = Vec::new();
    let entries = match fs::read_dir(&rr_home) {
        Ok(entries) => entries,
        Err(_) => return Ok(snaps),
    };

    for entry in entries.flatten() {
        let trace_dir = entry.path();
        if !trace_dir.is_dir() || trace_dir.to_string_lossy().contains("latest-trace") {
            continue;
        }

        let Ok(files) = fs::read_dir(&trace_dir) else {
            continue;
        };
        for file in files.flatten() {
            if !file.file_name().to_string_lossy().starts_with(METADATA_PREFIX) {
                continue;
            }
            let Ok(metadata) = fs::read_to_string(file.path()) else {
                continue;
            };
            let metadata = metadata.trim();
            if metadata.is_empty() {
                continue;
            }
            let Some((root, target)) = metadata.split_once(':') else {
                log::warn!(target: "engine", "unreadable snapshot metadata in {}", file.path().display());
                continue;
            };
            snaps.push(SnapInfo {
                trace_dir: trace_dir.clone(),
                sources_root: root.to_string(),
                original_target: target.to_string(),
            });
        }
    }

    snaps.sort_by(|a, b| a.trace_dir.cmp(&b.trace_dir));
    Ok(snaps)
}

pub fn print_listing() -> anyhow::Result<()> {
    let snaps = discover()?;
    print_snaps(&snaps);
    Ok(())
}

fn print_snaps(snaps: &[SnapInfo]) {
    println!("Saved snapshots");
    println!("---------------");
    println!("A snapshot is the PHP sources at a point in time plus an rr execution trace");

    if snaps.is_empty() {
        println!("\nNo saved snapshots");
        return;
    }
    for (i, snap) in snaps.iter().enumerate() {
        println!(
            "[{i}] Snapshot for {} rr trace: {}\nPHP sources stored at: {}",
            snap.original_target,
            snap.trace_dir.display(),
            snap.sources_root,
        );
    }
}

/// Print the listing and let the operator pick a snapshot by number.
/// `Ok(None)` when there is nothing to pick from.
pub fn choose_interactive() -> anyhow::Result<Option<SnapInfo>> {
    let snaps = discover()?;
    print_snaps(&snaps);
    if snaps.is_empty() {
        return Ok(None);
    }

    let stdin = std::io::stdin();
    loop {
        print!("Snapshot number to replay> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        match line.trim().parse::<usize>() {
            Ok(n) if n < snaps.len() => return Ok(Some(snaps[n].clone())),
            _ => println!("{}", "Please enter a valid snapshot number".yellow()),
        }
    }
}
