//! Invocation history: one command line per run, capped at the newest 100.

use std::path::Path;

const HISTORY_CAP: usize = 100;

/// Append `line` to the history file, rewriting it to keep only the last
/// [`HISTORY_CAP`] entries.
pub fn append_history(file: &Path, line: &str) -> std::io::Result<()> {
    let mut lines: Vec<String> = std::fs::read_to_string(file)
        .map(|c| c.lines().map(str::to_string).collect())
        .unwrap_or_default();
    lines.push(line.to_string());
    if lines.len() > HISTORY_CAP {
        lines.drain(..lines.len() - HISTORY_CAP);
    }
    std::fs::write(file, lines.join("\n") + "\n")
}

pub fn read_history(file: &Path) -> Vec<String> {
    std::fs::read_to_string(file)
        .map(|c| c.lines().map(str::to_string).collect())
        .unwrap_or_default()
}
