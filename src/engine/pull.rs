//! Pull execution: drives `git::try_pull`, maps its outcome onto the repo
//! record, writes the per-pull log file, and runs the post-pull hook.

use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::process::creds_config;
use super::{EffectiveParams, ScanContext, ScanState};
use crate::git::{self, PullOutcome, PullRequest};
use crate::repo::{RepoInfo, RepoStatus};

fn pull_log_path(log_dir: &Path, repo_name: &str) -> PathBuf {
    let ts = chrono::Local::now().format("%Y-%m-%d_%H_%M_%S");
    log_dir.join(format!("{}_{}.log", repo_name, ts))
}

/// Run the post-pull hook synchronously, waiting for it to terminate.
pub fn run_post_pull_hook(hook: &Path) {
    if hook.as_os_str().is_empty() {
        return;
    }
    match std::process::Command::new(hook).status() {
        Ok(status) if status.success() => {}
        Ok(status) => error!("post-pull hook {} exited with {}", hook.display(), status),
        Err(e) => error!("post-pull hook {} failed to start: {}", hook.display(), e),
    }
}

pub(super) fn execute_pull(
    path: &Path,
    ri: &mut RepoInfo,
    state: &ScanState,
    ctx: &ScanContext,
    eff: &EffectiveParams,
    effective_timeout: Duration,
    was_accessible: bool,
) {
    let opts = &ctx.opts;
    state.set_action(format!("Pulling {}", ri.name()));
    {
        let mut tables = state.tables.lock().unwrap();
        tables.infos.insert(path.to_path_buf(), ri.clone());
    }

    // The library timeout is process-wide and may hold a stale value from a
    // previous pull, so push the desired one before every fetch.
    if !effective_timeout.is_zero() {
        git::set_global_timeout(effective_timeout);
    }

    let progress = |pct: u8| {
        let mut tables = state.tables.lock().unwrap();
        if let Some(info) = tables.infos.get_mut(path) {
            info.progress = pct;
        }
    };
    let creds = creds_config(ctx);
    let request = PullRequest {
        remote: &opts.remote_name,
        use_credentials: opts.include_private,
        creds: &creds,
        down_limit_kbps: eff.down_limit_kbps,
        up_limit_kbps: eff.up_limit_kbps,
        disk_limit_kbps: eff.disk_limit_kbps,
        force: eff.force_pull,
        pull_ref: eff.pull_ref.as_deref(),
        probes: &ctx.probes,
    };
    let report = git::try_pull(path, &request, Some(&progress));
    ri.auth_failed = report.auth_failed;
    ri.last_pull_log = report.log.clone();
    ri.progress = 100;

    let mut log_file_path = PathBuf::new();
    if !opts.logging.log_dir.as_os_str().is_empty() {
        log_file_path = pull_log_path(&opts.logging.log_dir, &ri.name());
        if let Err(e) = std::fs::write(&log_file_path, &report.log) {
            error!("failed to write pull log {}: {}", log_file_path.display(), e);
            log_file_path = PathBuf::new();
        }
    }

    match report.outcome {
        PullOutcome::Success => {
            ri.status = RepoStatus::PullOk;
            ri.message = "Pulled successfully".to_string();
            if let Ok(hash) = git::local_hash(path) {
                ri.set_commit(hash);
            }
            ri.pulled = true;
            info!("{} pulled successfully", path.display());
        }
        PullOutcome::PkgLockFixed => {
            ri.status = RepoStatus::PkgLockFixed;
            ri.message = "package-lock.json auto-reset & pulled".to_string();
            if let Ok(hash) = git::local_hash(path) {
                ri.set_commit(hash);
            }
            ri.pulled = true;
            info!("{} package-lock reset and pulled", path.display());
        }
        PullOutcome::DirtyBlocked => {
            ri.status = RepoStatus::Dirty;
            ri.message = "Local changes present".to_string();
        }
        PullOutcome::Timeout => {
            ri.status = RepoStatus::Timeout;
            ri.message = "Pull timed out".to_string();
            error!("{} pull timed out", path.display());
            if opts.limits.skip_timeout {
                state.tables.lock().unwrap().skips.insert(path.to_path_buf());
            }
            if opts.limits.exit_on_timeout {
                state.running.store(false, Ordering::SeqCst);
            }
            if opts.cli && !opts.silent {
                println!("Timed out {}", ri.name());
            }
            if was_accessible {
                std::thread::sleep(Duration::from_secs(5));
            }
        }
        PullOutcome::RateLimited => {
            ri.status = RepoStatus::RateLimit;
            ri.message = "Rate limited".to_string();
            error!("{} rate limited", path.display());
            if opts.cli && !opts.silent {
                println!("Rate limited {}", ri.name());
            }
            if was_accessible {
                std::thread::sleep(Duration::from_secs(5));
            }
        }
        PullOutcome::Failed => {
            ri.status = RepoStatus::Error;
            ri.message = "Pull failed (see log)".to_string();
            error!("{} pull failed: {}", path.display(), report.log);
            if (opts.skip_unavailable && !was_accessible) || opts.skip_accessible_errors {
                state.tables.lock().unwrap().skips.insert(path.to_path_buf());
            } else {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    if !log_file_path.as_os_str().is_empty() {
        ri.message = format!("{} - {}", ri.message, log_file_path.display());
    }
    ri.commit_author = git::last_commit_author(path);
    ri.commit_date = git::last_commit_date(path);
    ri.commit_time = git::last_commit_time(path);
    if ri.pulled {
        run_post_pull_hook(&eff.post_pull_hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_log_names_carry_repo_and_timestamp() {
        let dir = Path::new("/var/log/pulls");
        let p = pull_log_path(dir, "myrepo");
        let name = p.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("myrepo_"));
        assert!(name.ends_with(".log"));
        // Timestamps use underscores, keeping names shell-friendly.
        assert!(!name.contains(' '));
        assert!(!name.contains(':'));
    }

    #[test]
    fn empty_hook_is_a_no_op() {
        run_post_pull_hook(Path::new(""));
    }

    #[cfg(unix)]
    #[test]
    fn hook_runs_synchronously() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("marker");
        let hook = tmp.path().join("hook.sh");
        std::fs::write(
            &hook,
            format!("#!/bin/sh\necho done > {}\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        run_post_pull_hook(&hook);
        assert!(marker.exists(), "hook must have completed before return");
    }
}
