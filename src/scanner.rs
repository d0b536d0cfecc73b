//! Repository discovery: expands configured roots into candidate directories.
//!
//! Discovery only decides *where to look*; whether a candidate is actually a
//! Git repository is the engine's problem, so emitting a non-repo directory
//! is fine. Symlinks are followed only while the target stays inside the
//! canonical root.

use regex::Regex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One ignore pattern, pre-classified so the per-entry check stays cheap.
///
/// Patterns without `/` match the entry's filename; patterns with `/` match
/// the full path. Patterns without glob metacharacters compare as plain
/// strings instead of going through the regex engine.
#[derive(Debug, Clone)]
enum PatternKind {
    LiteralName(String),
    LiteralPath(String),
    GlobName(Regex),
    GlobPath(Regex),
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<PatternKind>,
}

impl IgnoreSet {
    pub fn new(patterns: &[PathBuf]) -> Self {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pat in patterns {
            let pat = pat.to_string_lossy().replace('\\', "/");
            if pat.is_empty() {
                continue;
            }
            let has_sep = pat.contains('/');
            let has_glob = pat.contains('*') || pat.contains('?');
            let kind = match (has_glob, has_sep) {
                (false, false) => PatternKind::LiteralName(pat),
                (false, true) => PatternKind::LiteralPath(pat),
                (true, false) => match Regex::new(&glob_to_regex(&pat)) {
                    Ok(re) => PatternKind::GlobName(re),
                    Err(_) => PatternKind::LiteralName(pat),
                },
                (true, true) => match Regex::new(&glob_to_regex(&pat)) {
                    Ok(re) => PatternKind::GlobPath(re),
                    Err(_) => PatternKind::LiteralPath(pat),
                },
            };
            compiled.push(kind);
        }
        IgnoreSet { patterns: compiled }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, path: &Path) -> bool {
        let full = path.to_string_lossy().replace('\\', "/");
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.patterns.iter().any(|p| match p {
            PatternKind::LiteralName(s) => name == *s,
            PatternKind::LiteralPath(s) => full == *s,
            PatternKind::GlobName(re) => re.is_match(&name),
            PatternKind::GlobPath(re) => re.is_match(&full),
        })
    }
}

/// Translate a shell glob to an anchored regex. `**` crosses directory
/// separators, `*` and `?` do not.
fn glob_to_regex(pattern: &str) -> String {
    let mut rx = String::with_capacity(pattern.len() * 2 + 2);
    rx.push('^');
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'*' {
                    rx.push_str(".*");
                    i += 1;
                } else {
                    rx.push_str("[^/]*");
                }
            }
            b'?' => rx.push_str("[^/]"),
            c => {
                let ch = c as char;
                if ch.is_ascii_alphanumeric() || ch == '/' || ch == '_' || ch == '-' {
                    rx.push(ch);
                } else {
                    rx.push('\\');
                    rx.push(ch);
                }
            }
        }
        i += 1;
    }
    rx.push('$');
    rx
}

/// Expand roots into candidate repository directories in traversal order.
///
/// `max_depth` counts levels below each root; 0 means unbounded. When
/// `keep_first_valid` is set, expansion stops at the first root that yields
/// at least one candidate.
pub fn build_repo_list(
    roots: &[PathBuf],
    recursive: bool,
    ignore: &IgnoreSet,
    max_depth: usize,
    keep_first_valid: bool,
) -> Vec<PathBuf> {
    let mut result = Vec::new();
    for root in roots {
        if root.as_os_str().is_empty() {
            continue;
        }
        let canonical_root = fs::canonicalize(root).unwrap_or_else(|_| root.clone());
        let before = result.len();
        scan_dir(
            root,
            &canonical_root,
            1,
            if recursive { max_depth } else { 1 },
            ignore,
            &mut result,
        );
        if keep_first_valid && result.len() > before {
            break;
        }
    }
    result
}

fn scan_dir(
    dir: &Path,
    canonical_root: &Path,
    depth: usize,
    max_depth: usize,
    ignore: &IgnoreSet,
    out: &mut Vec<PathBuf>,
) {
    if max_depth > 0 && depth > max_depth {
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return, // permission denied or vanished root, skip silently
    };
    for entry in entries.flatten() {
        let mut path = entry.path();
        // Containment: a symlink may only be followed while its target stays
        // inside the canonical root.
        if path.is_symlink() {
            match fs::canonicalize(&path) {
                Ok(resolved) if resolved.starts_with(canonical_root) => path = resolved,
                _ => continue,
            }
        }
        if !path.is_dir() {
            continue;
        }
        if ignore.matches(&path) {
            continue;
        }
        out.push(path.clone());
        scan_dir(&path, canonical_root, depth + 1, max_depth, ignore, out);
    }
}

/// Read `<root>/.autogitpull.ignore`-style files: one pattern per line,
/// `#` comments and blank lines skipped.
pub fn read_ignore_file(file: &Path) -> Vec<PathBuf> {
    let Ok(contents) = fs::read_to_string(file) else {
        return Vec::new();
    };
    contents
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(PathBuf::from)
        .collect()
}

pub fn write_ignore_file(file: &Path, entries: &[PathBuf]) -> std::io::Result<()> {
    let mut f = fs::File::create(file)?;
    for e in entries {
        let s = e.to_string_lossy();
        let s = s.trim();
        if s.is_empty() {
            continue;
        }
        writeln!(f, "{}", s)?;
    }
    Ok(())
}
