//! Per-repository state machine: one cycle for one path.

use log::{debug, error, warn};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::pull::execute_pull;
use super::{EffectiveParams, ScanContext, ScanState};
use crate::git;
use crate::repo::{RepoInfo, RepoStatus};

/// Outcome of the validation stage.
enum Validation {
    /// Terminal status already written into `ri`.
    Stop,
    Proceed,
}

fn validate_repo(
    path: &Path,
    ri: &mut RepoInfo,
    state: &ScanState,
    ctx: &ScanContext,
    prev_pulled: bool,
) -> Validation {
    let opts = &ctx.opts;
    if !path.exists() {
        ri.status = RepoStatus::Error;
        ri.message = "Missing".to_string();
        error!("{} missing", path.display());
        return Validation::Stop;
    }
    {
        let tables = state.tables.lock().unwrap();
        if tables.skips.contains(path) {
            ri.status = RepoStatus::Skipped;
            ri.message = "Skipped after fatal error".to_string();
            warn!("{} skipped after fatal error", path.display());
            return Validation::Stop;
        }
    }
    if !path.is_dir() || !git::is_git_repo(path) {
        ri.status = RepoStatus::NotGit;
        ri.message = "Not a git repo".to_string();
        debug!("{} tagged: not a git repo", path.display());
        return Validation::Stop;
    }
    // Publish the in-progress hint so observers (and the busy guard) can see
    // the entry is owned.
    {
        let mut tables = state.tables.lock().unwrap();
        let entry = tables
            .infos
            .entry(path.to_path_buf())
            .or_insert_with(|| RepoInfo::new(path.to_path_buf()));
        entry.status = RepoStatus::Checking;
        entry.message.clear();
    }
    ri.status = RepoStatus::Checking;
    ri.message.clear();

    if let Ok(hash) = git::local_hash(path) {
        ri.set_commit(hash);
    }
    let remote_url = git::remote_url(path, &opts.remote_name).unwrap_or_default();
    if !opts.include_private {
        if !git::is_github_url(&remote_url) {
            ri.status = RepoStatus::Skipped;
            ri.message = "Non-GitHub repo (skipped)".to_string();
            debug!("{} skipped: non-GitHub repo", path.display());
            state.tables.lock().unwrap().skips.insert(path.to_path_buf());
            return Validation::Stop;
        }
        if !git::remote_accessible(path, &opts.remote_name) {
            if prev_pulled {
                ri.status = RepoStatus::TempFail;
                ri.message = "Temporarily inaccessible".to_string();
                warn!("{} temporarily inaccessible", path.display());
            } else {
                ri.status = RepoStatus::Skipped;
                ri.message = "Private or inaccessible repo".to_string();
                debug!("{} skipped: private or inaccessible", path.display());
                if opts.skip_unavailable {
                    state.tables.lock().unwrap().skips.insert(path.to_path_buf());
                }
            }
            return Validation::Stop;
        }
    }
    ri.branch = git::current_branch(path).unwrap_or_default();
    if ri.branch.is_empty() || ri.branch == "HEAD" {
        ri.status = RepoStatus::HeadProblem;
        ri.message = "Detached HEAD or branch error".to_string();
        state.tables.lock().unwrap().skips.insert(path.to_path_buf());
        return Validation::Stop;
    }
    Validation::Proceed
}

/// Decide between up-to-date, check-only reporting, and pulling. Returns
/// true when the pull stage should run.
fn determine_pull_action(
    path: &Path,
    ri: &mut RepoInfo,
    state: &ScanState,
    ctx: &ScanContext,
    eff: &EffectiveParams,
    was_accessible: bool,
) -> bool {
    let opts = &ctx.opts;
    if opts.hash_check {
        let local = git::local_hash(path).unwrap_or_default();
        let remote = match git::remote_hash(
            path,
            &opts.remote_name,
            &ri.branch,
            opts.include_private,
            &creds_config(ctx),
        ) {
            Ok(h) => h,
            Err(e) => {
                if matches!(e, git::GitError::Auth(_)) {
                    ri.auth_failed = true;
                }
                String::new()
            }
        };
        if local.is_empty() || remote.is_empty() {
            ri.status = RepoStatus::Error;
            ri.message = "Error getting hashes or remote".to_string();
            if (opts.skip_unavailable && !was_accessible) || opts.skip_accessible_errors {
                state.tables.lock().unwrap().skips.insert(path.to_path_buf());
            } else {
                std::thread::sleep(Duration::from_secs(1));
            }
            return false;
        }
        if local == remote {
            ri.status = RepoStatus::UpToDate;
            ri.message = "Up to date".to_string();
            ri.set_commit(local);
            return false;
        }
    }

    if eff.check_only {
        ri.status = RepoStatus::RemoteAhead;
        ri.message = if opts.hash_check {
            "Remote ahead".to_string()
        } else {
            "Update possible".to_string()
        };
        if let Ok(hash) = git::local_hash(path) {
            ri.set_commit(hash);
        }
        debug!("{} remote ahead", path.display());
        return false;
    }

    ri.status = RepoStatus::Pulling;
    ri.message = "Remote ahead, pulling...".to_string();
    ri.progress = 0;
    true
}

pub(super) fn creds_config(ctx: &ScanContext) -> crate::credentials::CredentialConfig {
    crate::credentials::CredentialConfig {
        ssh_public_key: ctx.opts.ssh_public_key.clone(),
        ssh_private_key: ctx.opts.ssh_private_key.clone(),
        credential_file: ctx.opts.credential_file.clone(),
    }
}

/// Run one full cycle for `path`, writing exactly one terminal status into
/// the shared map.
pub fn process_repo(path: &Path, state: &ScanState, ctx: &ScanContext, eff: &EffectiveParams) {
    if !state.running.load(Ordering::SeqCst) {
        return;
    }
    debug!("Checking repo {}", path.display());

    let mut prev_pulled = false;
    let mut was_accessible = false;
    let mut prev_status = RepoStatus::Pending;
    {
        let tables = state.tables.lock().unwrap();
        if let Some(existing) = tables.infos.get(path) {
            if existing.status == RepoStatus::NotGit {
                return;
            }
            // Re-entry guard: an entry in an in-progress state is owned by
            // another worker; leave it alone.
            if existing.status.is_busy() {
                debug!("Skipping {} - busy", path.display());
                return;
            }
            prev_pulled = existing.pulled;
            prev_status = existing.status;
            if existing.status != RepoStatus::Error && existing.status != RepoStatus::Skipped {
                was_accessible = true;
            }
        }
    }

    let mut ri = RepoInfo::new(path.to_path_buf());
    ri.pulled = prev_pulled;

    // Backoffs carried over from the previous cycle's terminal status.
    let mut effective_timeout = eff.pull_timeout;
    match prev_status {
        RepoStatus::RateLimit => std::thread::sleep(Duration::from_secs(5)),
        RepoStatus::Timeout => {
            std::thread::sleep(Duration::from_secs(5));
            effective_timeout = if effective_timeout.is_zero() {
                Duration::from_secs(5)
            } else {
                effective_timeout + Duration::from_secs(5)
            };
        }
        _ => {}
    }

    state.set_action(format!("Checking {}", ri.name()));

    if matches!(
        validate_repo(path, &mut ri, state, ctx, prev_pulled),
        Validation::Proceed
    ) {
        ri.commit_author = git::last_commit_author(path);
        ri.commit_date = git::last_commit_date(path);
        ri.commit_time = git::last_commit_time(path);

        let gate_open = if ctx.opts.updated_since.is_zero() {
            true
        } else if let Some(mutant) = &ctx.mutant {
            mutant.should_pull(
                path,
                &mut ri,
                &ctx.opts.remote_name,
                ctx.opts.include_private,
                &creds_config(ctx),
                ctx.opts.updated_since,
            )
        } else {
            let mut t = git::remote_commit_time(
                path,
                &ctx.opts.remote_name,
                &ri.branch,
                ctx.opts.include_private,
                &creds_config(ctx),
            );
            if t == 0 {
                t = git::last_commit_time(path);
            }
            let now = chrono::Utc::now().timestamp();
            if t == 0 || now - t > ctx.opts.updated_since.as_secs() as i64 {
                ri.status = RepoStatus::Skipped;
                ri.message = "Older than limit".to_string();
                false
            } else {
                true
            }
        };

        if gate_open && determine_pull_action(path, &mut ri, state, ctx, eff, was_accessible) {
            if ctx.opts.dry_run {
                ri.status = RepoStatus::RemoteAhead;
                ri.message = "Dry run".to_string();
                if let Ok(hash) = git::local_hash(path) {
                    ri.set_commit(hash);
                }
            } else {
                let start = Instant::now();
                execute_pull(path, &mut ri, state, ctx, eff, effective_timeout, was_accessible);
                if let Some(mutant) = &ctx.mutant {
                    mutant.record_result(ri.status, start.elapsed());
                }
            }
        }
    }

    {
        let mut tables = state.tables.lock().unwrap();
        tables.infos.insert(path.to_path_buf(), ri.clone());
    }

    if ctx.opts.cli && !ctx.opts.silent && ri.pulled && !prev_pulled {
        let when = if ri.commit_date.is_empty() {
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
        } else {
            ri.commit_date.clone()
        };
        let mut line = format!("Updated {} at {}", ri.name(), when);
        if ctx.opts.show_pull_author && !ri.commit_author.is_empty() {
            line.push_str(&format!(" by {}", ri.commit_author));
        }
        if !ri.commit.is_empty() {
            line.push_str(&format!(", commit {}", ri.commit));
        }
        println!("{}", line);
    }
    debug!("{} -> {}", path.display(), ri.message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::resources::Probes;
    use std::path::PathBuf;
    use std::process::Command;
    use std::sync::Arc;

    fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git failed");
        assert!(out.status.success(), "git {:?}: {:?}", args, out);
    }

    fn init_repo(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        git(dir, &["init", "-b", "main"]);
        git(dir, &["config", "user.email", "t@t"]);
        git(dir, &["config", "user.name", "T"]);
        std::fs::write(dir.join("f"), "x").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "init"]);
    }

    fn ctx_with(opts: Options) -> ScanContext {
        ScanContext {
            opts,
            probes: Arc::new(Probes::default()),
            mutant: None,
        }
    }

    fn eff(ctx: &ScanContext, path: &Path) -> EffectiveParams {
        EffectiveParams::for_path(ctx, path).0
    }

    #[test]
    fn non_repo_directory_is_tagged_not_git() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("plain");
        std::fs::create_dir_all(&dir).unwrap();
        let state = ScanState::default();
        let mut opts = Options::default();
        opts.include_private = true;
        let ctx = ctx_with(opts);
        let params = eff(&ctx, &dir);
        process_repo(&dir, &state, &ctx, &params);
        let tables = state.tables.lock().unwrap();
        assert_eq!(tables.infos[&dir].status, RepoStatus::NotGit);
    }

    #[test]
    fn missing_path_is_an_error() {
        let missing = PathBuf::from("/nonexistent/autogitpull/repo");
        let state = ScanState::default();
        let ctx = ctx_with(Options::default());
        let params = eff(&ctx, &missing);
        process_repo(&missing, &state, &ctx, &params);
        let tables = state.tables.lock().unwrap();
        assert_eq!(tables.infos[&missing].status, RepoStatus::Error);
        assert_eq!(tables.infos[&missing].message, "Missing");
    }

    #[test]
    fn non_github_remote_is_skipped_and_remembered() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("r");
        init_repo(&repo);
        git(&repo, &["remote", "add", "origin", "https://gitlab.com/x/y.git"]);

        let state = ScanState::default();
        let ctx = ctx_with(Options::default());
        let params = eff(&ctx, &repo);
        process_repo(&repo, &state, &ctx, &params);

        let tables = state.tables.lock().unwrap();
        assert_eq!(tables.infos[&repo].status, RepoStatus::Skipped);
        assert_eq!(tables.infos[&repo].message, "Non-GitHub repo (skipped)");
        assert!(tables.skips.contains(&repo));
    }

    #[test]
    fn detached_head_is_a_head_problem() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("r");
        init_repo(&repo);
        let out = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&repo)
            .output()
            .unwrap();
        let hash = String::from_utf8_lossy(&out.stdout).trim().to_string();
        git(&repo, &["checkout", "--detach", &hash]);
        git(&repo, &["remote", "add", "origin", &repo.to_string_lossy()]);

        let state = ScanState::default();
        let mut opts = Options::default();
        opts.include_private = true;
        let ctx = ctx_with(opts);
        let params = eff(&ctx, &repo);
        process_repo(&repo, &state, &ctx, &params);

        let tables = state.tables.lock().unwrap();
        assert_eq!(tables.infos[&repo].status, RepoStatus::HeadProblem);
        assert!(tables.skips.contains(&repo));
    }

    #[test]
    fn busy_entries_are_left_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("r");
        init_repo(&repo);

        let state = ScanState::default();
        {
            let mut tables = state.tables.lock().unwrap();
            let mut info = RepoInfo::new(repo.clone());
            info.status = RepoStatus::Pulling;
            info.message = "owned elsewhere".to_string();
            tables.infos.insert(repo.clone(), info);
        }
        let mut opts = Options::default();
        opts.include_private = true;
        let ctx = ctx_with(opts);
        let params = eff(&ctx, &repo);
        process_repo(&repo, &state, &ctx, &params);

        let tables = state.tables.lock().unwrap();
        assert_eq!(tables.infos[&repo].status, RepoStatus::Pulling);
        assert_eq!(tables.infos[&repo].message, "owned elsewhere");
    }

    #[test]
    fn skipped_paths_report_their_skip() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("r");
        init_repo(&repo);
        let state = ScanState::default();
        state.tables.lock().unwrap().skips.insert(repo.clone());
        let mut opts = Options::default();
        opts.include_private = true;
        let ctx = ctx_with(opts);
        let params = eff(&ctx, &repo);
        process_repo(&repo, &state, &ctx, &params);
        let tables = state.tables.lock().unwrap();
        assert_eq!(tables.infos[&repo].status, RepoStatus::Skipped);
        assert_eq!(tables.infos[&repo].message, "Skipped after fatal error");
    }

    #[test]
    fn up_to_date_clone_reports_up_to_date() {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        init_repo(&work);
        git(tmp.path(), &["clone", "--bare", "work", "up.git"]);
        git(tmp.path(), &["clone", "up.git", "clone"]);
        let clone = tmp.path().join("clone");

        let state = ScanState::default();
        let mut opts = Options::default();
        opts.include_private = true;
        let ctx = ctx_with(opts);
        let params = eff(&ctx, &clone);
        process_repo(&clone, &state, &ctx, &params);

        let tables = state.tables.lock().unwrap();
        let info = &tables.infos[&clone];
        assert_eq!(info.status, RepoStatus::UpToDate);
        assert_eq!(info.commit.len(), 7);
        assert_eq!(info.branch, "main");
    }

    #[test]
    fn check_only_reports_remote_ahead_without_touching_head() {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        init_repo(&work);
        git(tmp.path(), &["clone", "--bare", "work", "up.git"]);
        git(tmp.path(), &["clone", "up.git", "clone"]);
        let clone = tmp.path().join("clone");
        // Advance the upstream.
        git(tmp.path(), &["clone", "up.git", "pusher"]);
        let pusher = tmp.path().join("pusher");
        git(&pusher, &["config", "user.email", "t@t"]);
        git(&pusher, &["config", "user.name", "T"]);
        std::fs::write(pusher.join("g"), "y").unwrap();
        git(&pusher, &["add", "."]);
        git(&pusher, &["commit", "-m", "more"]);
        git(&pusher, &["push", "origin", "main"]);

        let before = crate::git::local_hash(&clone).unwrap();
        let state = ScanState::default();
        let mut opts = Options::default();
        opts.include_private = true;
        opts.check_only = true;
        let ctx = ctx_with(opts);
        let params = eff(&ctx, &clone);
        process_repo(&clone, &state, &ctx, &params);

        let tables = state.tables.lock().unwrap();
        assert_eq!(tables.infos[&clone].status, RepoStatus::RemoteAhead);
        drop(tables);
        assert_eq!(crate::git::local_hash(&clone).unwrap(), before);
    }
}
