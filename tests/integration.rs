//! End-to-end tests for the scan engine.
//!
//! Each test builds real git repositories (bare upstream plus working
//! clones) in a temp directory with the git CLI, then drives the engine
//! against them.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use autogitpull::config::Options;
use autogitpull::engine::{scan_repos, ScanContext, ScanState};
use autogitpull::mutant::Mutant;
use autogitpull::repo::RepoStatus;
use autogitpull::resources::Probes;

// ─── helpers ────────────────────────────────────────────────────────────────

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command failed");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command failed");
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Initialise a working repo with an identity and one commit.
fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@test.com"]);
    git(dir, &["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "# fixture").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "init"]);
}

/// Bare upstream plus a clone named `name` under `base`. Returns
/// (upstream, clone).
fn fixture(base: &Path, name: &str) -> (PathBuf, PathBuf) {
    let seed = base.join(format!("{}-seed", name));
    init_repo(&seed);
    let bare_name = format!("{}-upstream.git", name);
    git(base, &["clone", "--bare", seed.to_str().unwrap(), &bare_name]);
    git(base, &[
        "clone",
        base.join(&bare_name).to_str().unwrap(),
        name,
    ]);
    (base.join(bare_name), base.join(name))
}

/// Push one new commit to the upstream through a scratch clone; returns the
/// new tip hash. Commit timestamps are pinned a unique number of seconds in
/// the past so consecutive pushes never share an epoch second.
fn advance_upstream(base: &Path, bare: &Path, tag: &str) -> String {
    use std::sync::atomic::{AtomicI64, Ordering};
    static AGE: AtomicI64 = AtomicI64::new(600);
    let age = AGE.fetch_sub(60, Ordering::SeqCst);
    let when = format!("@{} +0000", chrono::Utc::now().timestamp() - age);

    let scratch = base.join(format!("scratch-{}", tag));
    git(base, &[
        "clone",
        bare.to_str().unwrap(),
        scratch.to_str().unwrap(),
    ]);
    git(&scratch, &["config", "user.email", "test@test.com"]);
    git(&scratch, &["config", "user.name", "Test"]);
    std::fs::write(scratch.join(format!("{}.txt", tag)), tag).unwrap();
    git(&scratch, &["add", "."]);
    let out = Command::new("git")
        .args(["commit", "-m", tag])
        .env("GIT_AUTHOR_DATE", &when)
        .env("GIT_COMMITTER_DATE", &when)
        .current_dir(&scratch)
        .output()
        .expect("git commit failed");
    assert!(out.status.success(), "{:?}", out);
    git(&scratch, &["push", "origin", "main"]);
    git_stdout(&scratch, &["rev-parse", "HEAD"])
}

fn scan_options() -> Options {
    let mut opts = Options::default();
    opts.include_private = true;
    opts.silent = true;
    opts
}

fn run_scan(paths: Vec<PathBuf>, opts: Options) -> Arc<ScanState> {
    run_scan_with(paths, opts, None)
}

fn run_scan_with(
    paths: Vec<PathBuf>,
    opts: Options,
    mutant: Option<Arc<Mutant>>,
) -> Arc<ScanState> {
    let state = Arc::new(ScanState::default());
    let ctx = Arc::new(ScanContext {
        opts,
        probes: Arc::new(Probes::default()),
        mutant,
    });
    scan_repos(Arc::new(paths), state.clone(), ctx);
    state
}

fn status_of(state: &ScanState, path: &Path) -> RepoStatus {
    state.tables.lock().unwrap().infos[path].status
}

// ─── fast-forward ───────────────────────────────────────────────────────────

#[test]
fn scan_fast_forwards_a_stale_clone() {
    let tmp = tempfile::tempdir().unwrap();
    let (bare, clone) = fixture(tmp.path(), "ff");
    let new_tip = advance_upstream(tmp.path(), &bare, "feature");

    let log_dir = tmp.path().join("pull-logs");
    let mut opts = scan_options();
    opts.logging.log_dir = log_dir.clone();
    std::fs::create_dir_all(&log_dir).unwrap();

    let state = run_scan(vec![clone.clone()], opts);

    let tables = state.tables.lock().unwrap();
    let info = &tables.infos[&clone];
    assert_eq!(info.status, RepoStatus::PullOk);
    assert!(info.pulled);
    assert_eq!(info.commit, new_tip[..7]);
    assert_eq!(info.progress, 100);
    drop(tables);

    assert_eq!(git_stdout(&clone, &["rev-parse", "HEAD"]), new_tip);
    // Exactly one pull log was written, and the status message points at it.
    let logs: Vec<_> = std::fs::read_dir(&log_dir).unwrap().flatten().collect();
    assert_eq!(logs.len(), 1);
    let state_tables = state.tables.lock().unwrap();
    assert!(state_tables.infos[&clone]
        .message
        .contains(logs[0].path().to_str().unwrap()));
}

#[test]
fn scan_reports_up_to_date_without_touching_the_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let (_bare, clone) = fixture(tmp.path(), "current");
    let before = git_stdout(&clone, &["rev-parse", "HEAD"]);

    let state = run_scan(vec![clone.clone()], scan_options());
    assert_eq!(status_of(&state, &clone), RepoStatus::UpToDate);
    assert_eq!(git_stdout(&clone, &["rev-parse", "HEAD"]), before);

    // Re-running is a no-op.
    let state = run_scan(vec![clone.clone()], scan_options());
    assert_eq!(status_of(&state, &clone), RepoStatus::UpToDate);
    assert_eq!(git_stdout(&clone, &["rev-parse", "HEAD"]), before);
}

// ─── dirty refusal ──────────────────────────────────────────────────────────

#[test]
fn dirty_tree_blocks_the_pull_byte_for_byte() {
    let tmp = tempfile::tempdir().unwrap();
    let (bare, clone) = fixture(tmp.path(), "dirty");
    advance_upstream(tmp.path(), &bare, "upstream-change");
    std::fs::write(clone.join("README.md"), "# local edit").unwrap();
    let before = git_stdout(&clone, &["rev-parse", "HEAD"]);

    let state = run_scan(vec![clone.clone()], scan_options());

    assert_eq!(status_of(&state, &clone), RepoStatus::Dirty);
    assert_eq!(git_stdout(&clone, &["rev-parse", "HEAD"]), before);
    assert_eq!(
        std::fs::read_to_string(clone.join("README.md")).unwrap(),
        "# local edit"
    );
}

#[test]
fn force_pull_discards_local_edits_and_untracked_staging() {
    let tmp = tempfile::tempdir().unwrap();
    let (bare, clone) = fixture(tmp.path(), "forced");
    let new_tip = advance_upstream(tmp.path(), &bare, "upstream-change");
    std::fs::write(clone.join("README.md"), "# local edit").unwrap();

    let mut opts = scan_options();
    opts.force_pull = true;
    let state = run_scan(vec![clone.clone()], opts);

    assert_eq!(status_of(&state, &clone), RepoStatus::PullOk);
    assert_eq!(git_stdout(&clone, &["rev-parse", "HEAD"]), new_tip);
    assert_eq!(
        std::fs::read_to_string(clone.join("README.md")).unwrap(),
        "# fixture"
    );
}

// ─── check-only and dry-run ─────────────────────────────────────────────────

#[test]
fn check_only_never_changes_head() {
    let tmp = tempfile::tempdir().unwrap();
    let (bare, clone) = fixture(tmp.path(), "checkonly");
    advance_upstream(tmp.path(), &bare, "ahead");
    let before = git_stdout(&clone, &["rev-parse", "HEAD"]);

    let mut opts = scan_options();
    opts.check_only = true;
    let state = run_scan(vec![clone.clone()], opts);

    let tables = state.tables.lock().unwrap();
    assert_eq!(tables.infos[&clone].status, RepoStatus::RemoteAhead);
    assert_eq!(tables.infos[&clone].message, "Remote ahead");
    drop(tables);
    assert_eq!(git_stdout(&clone, &["rev-parse", "HEAD"]), before);
}

#[test]
fn dry_run_reports_without_pulling() {
    let tmp = tempfile::tempdir().unwrap();
    let (bare, clone) = fixture(tmp.path(), "dryrun");
    advance_upstream(tmp.path(), &bare, "ahead");
    let before = git_stdout(&clone, &["rev-parse", "HEAD"]);

    let mut opts = scan_options();
    opts.dry_run = true;
    let state = run_scan(vec![clone.clone()], opts);

    let tables = state.tables.lock().unwrap();
    assert_eq!(tables.infos[&clone].status, RepoStatus::RemoteAhead);
    assert_eq!(tables.infos[&clone].message, "Dry run");
    drop(tables);
    assert_eq!(git_stdout(&clone, &["rev-parse", "HEAD"]), before);
}

// ─── mixed trees and concurrency ────────────────────────────────────────────

#[test]
fn mixed_tree_resolves_every_entry_to_a_terminal_status() {
    let tmp = tempfile::tempdir().unwrap();
    let (_bare, clone) = fixture(tmp.path(), "good");
    let plain = tmp.path().join("not-a-repo");
    std::fs::create_dir_all(&plain).unwrap();
    let missing = tmp.path().join("vanished");

    let mut opts = scan_options();
    opts.limits.concurrency = 3;
    let state = run_scan(vec![clone.clone(), plain.clone(), missing.clone()], opts);

    let tables = state.tables.lock().unwrap();
    assert_eq!(tables.infos[&clone].status, RepoStatus::UpToDate);
    assert_eq!(tables.infos[&plain].status, RepoStatus::NotGit);
    assert_eq!(tables.infos[&missing].status, RepoStatus::Error);
    for info in tables.infos.values() {
        assert!(!info.status.is_busy());
    }
}

#[test]
fn ten_repos_with_two_workers_all_complete() {
    let tmp = tempfile::tempdir().unwrap();
    let mut clones = Vec::new();
    for i in 0..10 {
        let (_bare, clone) = fixture(tmp.path(), &format!("r{}", i));
        clones.push(clone);
    }

    let mut opts = scan_options();
    opts.limits.concurrency = 2;
    let state = run_scan(clones.clone(), opts);

    let tables = state.tables.lock().unwrap();
    assert_eq!(tables.infos.len(), 10);
    for clone in &clones {
        assert_eq!(tables.infos[clone].status, RepoStatus::UpToDate);
    }
}

// ─── mutant mode ────────────────────────────────────────────────────────────

#[test]
fn mutant_skips_unchanged_repos_on_the_second_cycle() {
    let tmp = tempfile::tempdir().unwrap();
    let (bare, clone) = fixture(tmp.path(), "adaptive");
    advance_upstream(tmp.path(), &bare, "round-one");

    let mut opts = scan_options();
    opts.mutant_mode = true;
    opts.root = tmp.path().to_path_buf();
    let mutant = Arc::new(Mutant::apply(&mut opts).expect("mutant active"));

    let state = run_scan_with(vec![clone.clone()], opts.clone(), Some(mutant.clone()));
    assert_eq!(status_of(&state, &clone), RepoStatus::PullOk);

    // Nothing moved upstream: the gate reports "No change".
    let state = run_scan_with(vec![clone.clone()], opts.clone(), Some(mutant.clone()));
    let tables = state.tables.lock().unwrap();
    assert_eq!(tables.infos[&clone].status, RepoStatus::Skipped);
    assert_eq!(tables.infos[&clone].message, "No change");
    drop(tables);

    // A new upstream commit reopens the gate.
    advance_upstream(tmp.path(), &bare, "round-two");
    let state = run_scan_with(vec![clone.clone()], opts, Some(mutant));
    assert_eq!(status_of(&state, &clone), RepoStatus::PullOk);
}

#[test]
fn mutant_state_survives_restarts() {
    let tmp = tempfile::tempdir().unwrap();
    let (bare, clone) = fixture(tmp.path(), "persisted");
    advance_upstream(tmp.path(), &bare, "once");

    let mut opts = scan_options();
    opts.mutant_mode = true;
    opts.root = tmp.path().to_path_buf();
    let mutant = Arc::new(Mutant::apply(&mut opts).expect("mutant active"));
    let state = run_scan_with(vec![clone.clone()], opts, Some(mutant));
    assert_eq!(status_of(&state, &clone), RepoStatus::PullOk);

    // A second activation loads the stored commit time, so the unchanged
    // repo is gated immediately.
    let mut opts = scan_options();
    opts.mutant_mode = true;
    opts.root = tmp.path().to_path_buf();
    let mutant = Arc::new(Mutant::apply(&mut opts).expect("mutant active"));
    let state = run_scan_with(vec![clone.clone()], opts, Some(mutant));
    let tables = state.tables.lock().unwrap();
    assert_eq!(tables.infos[&clone].status, RepoStatus::Skipped);
    assert_eq!(tables.infos[&clone].message, "No change");
}

// ─── age gate ───────────────────────────────────────────────────────────────

#[test]
fn updated_since_window_passes_fresh_commits() {
    let tmp = tempfile::tempdir().unwrap();
    let (bare, clone) = fixture(tmp.path(), "fresh");
    advance_upstream(tmp.path(), &bare, "now");

    let mut opts = scan_options();
    // Commits were made moments ago, so a generous window lets them through.
    opts.updated_since = Duration::from_secs(3600);
    let state = run_scan(vec![clone.clone()], opts);
    assert_eq!(status_of(&state, &clone), RepoStatus::PullOk);
}

// ─── post-pull hook ─────────────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn post_pull_hook_fires_once_per_successful_pull() {
    use std::os::unix::fs::PermissionsExt;
    let tmp = tempfile::tempdir().unwrap();
    let (bare, clone) = fixture(tmp.path(), "hooked");
    advance_upstream(tmp.path(), &bare, "trigger");

    let marker = tmp.path().join("hook-ran");
    let hook = tmp.path().join("hook.sh");
    std::fs::write(
        &hook,
        format!("#!/bin/sh\necho ran >> {}\n", marker.display()),
    )
    .unwrap();
    std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut opts = scan_options();
    opts.post_pull_hook = hook;
    let state = run_scan(vec![clone.clone()], opts);

    assert_eq!(status_of(&state, &clone), RepoStatus::PullOk);
    assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 1);
}
