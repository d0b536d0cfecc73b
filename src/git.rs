//! Capability layer over libgit2.
//!
//! Every function opens its own repository handle and closes it on return;
//! handles are never shared across threads. Network failures are classified
//! by message (timeout, rate limit, auth) so the engine can react without
//! parsing strings itself.

use git2::{
    Direction, ErrorClass, FetchOptions, ObjectType, ProxyOptions, RemoteCallbacks, Repository,
    ResetType, StatusOptions,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::credentials::{credential_callback, CredentialConfig};
use crate::resources::Probes;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("{0}")]
    Other(String),
}

impl From<git2::Error> for GitError {
    fn from(e: git2::Error) -> Self {
        classify(&e)
    }
}

pub type GitResult<T> = Result<T, GitError>;

fn classify(e: &git2::Error) -> GitError {
    let msg = e.message().to_string();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        GitError::RateLimit(msg)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        GitError::Timeout(msg)
    } else if lower.contains("auth") || e.class() == ErrorClass::Ssh {
        GitError::Auth(msg)
    } else {
        GitError::Other(msg)
    }
}

/// Outcome of one pull attempt. The numeric codes of the wire protocol this
/// replaces are noted for reference in log messages only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Up to date already, or fast-forwarded cleanly.
    Success,
    /// Pull succeeded after resetting a blocking package-lock file. Kept as
    /// a stable code-point; no path in this layer currently produces it.
    PkgLockFixed,
    /// Generic failure; details in the pull log.
    Failed,
    /// Working tree has local changes and `force` was not set.
    DirtyBlocked,
    Timeout,
    RateLimited,
}

/// Full record of one pull attempt.
#[derive(Debug)]
pub struct PullReport {
    pub outcome: PullOutcome,
    pub log: String,
    pub auth_failed: bool,
}

/// Parameters for [`try_pull`].
pub struct PullRequest<'a> {
    pub remote: &'a str,
    pub use_credentials: bool,
    pub creds: &'a CredentialConfig,
    pub down_limit_kbps: u64,
    pub up_limit_kbps: u64,
    pub disk_limit_kbps: u64,
    pub force: bool,
    pub pull_ref: Option<&'a str>,
    pub probes: &'a Probes,
}

static GLOBAL_TIMEOUT_SECS: AtomicU64 = AtomicU64::new(0);

/// Push the pull timeout into libgit2. Process-wide; a prior value leaks
/// across calls, so callers must push the desired value before every fetch
/// rather than assume a default.
pub fn set_global_timeout(timeout: Duration) {
    let secs = timeout.as_secs();
    if secs == 0 || GLOBAL_TIMEOUT_SECS.swap(secs, Ordering::SeqCst) == secs {
        return;
    }
    let ms = secs.saturating_mul(1000).min(i32::MAX as u64) as i32;
    unsafe {
        let _ = git2::opts::set_server_connect_timeout_in_milliseconds(ms);
        let _ = git2::opts::set_server_timeout_in_milliseconds(ms);
    }
}

fn global_proxy() -> &'static Mutex<String> {
    static PROXY: OnceLock<Mutex<String>> = OnceLock::new();
    PROXY.get_or_init(|| Mutex::new(String::new()))
}

/// Process-wide proxy URL applied to every fetch.
pub fn set_global_proxy(url: &str) {
    *global_proxy().lock().unwrap() = url.to_string();
}

fn proxy_options<'a>() -> ProxyOptions<'a> {
    let mut po = ProxyOptions::new();
    let url = global_proxy().lock().unwrap();
    if url.is_empty() {
        po.auto();
    } else {
        po.url(&url);
    }
    po
}

pub fn is_git_repo(path: &Path) -> bool {
    path.join(".git").is_dir()
}

pub fn is_github_url(url: &str) -> bool {
    url.contains("github.com")
}

/// 40-char hex of the local HEAD commit.
pub fn local_hash(path: &Path) -> GitResult<String> {
    let repo = Repository::open(path)?;
    let oid = repo.refname_to_id("HEAD")?;
    Ok(oid.to_string())
}

/// Short name of the checked-out branch. Detached HEAD reads as `HEAD`.
pub fn current_branch(path: &Path) -> GitResult<String> {
    let repo = Repository::open(path)?;
    let head = repo.head()?;
    let name = head.shorthand().unwrap_or("").to_string();
    if name.is_empty() {
        return Err(GitError::Other("unreadable HEAD reference".to_string()));
    }
    Ok(name)
}

pub fn remote_url(path: &Path, remote: &str) -> GitResult<String> {
    let repo = Repository::open(path)?;
    let remote = repo.find_remote(remote)?;
    remote
        .url()
        .map(str::to_string)
        .ok_or_else(|| GitError::Other("remote has no URL".to_string()))
}

/// Connect-only reachability probe; no objects are fetched.
pub fn remote_accessible(path: &Path, remote: &str) -> bool {
    let Ok(repo) = Repository::open(path) else {
        return false;
    };
    let Ok(mut remote) = repo.find_remote(remote) else {
        return false;
    };
    let ok = remote.connect(Direction::Fetch).is_ok();
    if ok {
        let _ = remote.disconnect();
    }
    ok
}

fn fetch_once(
    repo: &Repository,
    remote_name: &str,
    use_credentials: bool,
    creds: &CredentialConfig,
) -> GitResult<()> {
    let mut remote = repo.find_remote(remote_name)?;
    let mut cbs = RemoteCallbacks::new();
    if use_credentials {
        cbs.credentials(credential_callback(creds));
    }
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(cbs);
    opts.proxy_options(proxy_options());
    remote.fetch(&[] as &[&str], Some(&mut opts), None)?;
    Ok(())
}

/// Fetch, then resolve `refs/remotes/<remote>/<branch>`.
pub fn remote_hash(
    path: &Path,
    remote: &str,
    branch: &str,
    use_credentials: bool,
    creds: &CredentialConfig,
) -> GitResult<String> {
    let repo = Repository::open(path)?;
    fetch_once(&repo, remote, use_credentials, creds)?;
    let oid = repo.refname_to_id(&format!("refs/remotes/{}/{}", remote, branch))?;
    Ok(oid.to_string())
}

/// Commit time (epoch seconds) of the remote tip; 0 on any failure.
pub fn remote_commit_time(
    path: &Path,
    remote: &str,
    branch: &str,
    use_credentials: bool,
    creds: &CredentialConfig,
) -> i64 {
    let Ok(repo) = Repository::open(path) else {
        return 0;
    };
    if fetch_once(&repo, remote, use_credentials, creds).is_err() {
        return 0;
    }
    let Ok(oid) = repo.refname_to_id(&format!("refs/remotes/{}/{}", remote, branch)) else {
        return 0;
    };
    repo.find_commit(oid).map(|c| c.time().seconds()).unwrap_or(0)
}

/// True when the index or working tree differs from HEAD, untracked files
/// included. Open failures read as clean.
pub fn has_uncommitted_changes(path: &Path) -> bool {
    let Ok(repo) = Repository::open(path) else {
        return false;
    };
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).renames_head_to_index(true);
    let result = match repo.statuses(Some(&mut opts)) {
        Ok(statuses) => !statuses.is_empty(),
        Err(_) => false,
    };
    result
}

pub fn last_commit_time(path: &Path) -> i64 {
    let Ok(repo) = Repository::open(path) else {
        return 0;
    };
    let Ok(oid) = repo.refname_to_id("HEAD") else {
        return 0;
    };
    repo.find_commit(oid).map(|c| c.time().seconds()).unwrap_or(0)
}

pub fn last_commit_date(path: &Path) -> String {
    let t = last_commit_time(path);
    if t == 0 {
        return String::new();
    }
    match chrono::DateTime::from_timestamp(t, 0) {
        Some(dt) => dt
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => String::new(),
    }
}

pub fn last_commit_author(path: &Path) -> String {
    let Ok(repo) = Repository::open(path) else {
        return String::new();
    };
    let Ok(oid) = repo.refname_to_id("HEAD") else {
        return String::new();
    };
    let Ok(commit) = repo.find_commit(oid) else {
        return String::new();
    };
    let name = commit.author().name().unwrap_or("").to_string();
    name
}

/// Fetch and fast-forward one repository.
///
/// The transfer-progress callback drives both the caller's percent callback
/// and the cooperative rate caps: given the configured KB/s ceilings, it
/// computes the minimum wall time the transfer should have taken and sleeps
/// off the difference.
pub fn try_pull(
    path: &Path,
    req: &PullRequest<'_>,
    progress: Option<&(dyn Fn(u8) + Send + Sync)>,
) -> PullReport {
    let report = |outcome: PullOutcome, log: String, auth_failed: bool| {
        if let Some(cb) = progress {
            cb(100);
        }
        PullReport {
            outcome,
            log,
            auth_failed,
        }
    };
    if let Some(cb) = progress {
        cb(0);
    }

    let repo = match Repository::open(path) {
        Ok(r) => r,
        Err(_) => return report(PullOutcome::Failed, "Failed to open repository".into(), false),
    };
    let branch = match current_branch(path) {
        Ok(b) => b,
        Err(e) => return report(PullOutcome::Failed, e.to_string(), false),
    };
    let mut remote = match repo.find_remote(req.remote) {
        Ok(r) => r,
        Err(_) => {
            return report(
                PullOutcome::Failed,
                format!("No {} remote", req.remote),
                false,
            )
        }
    };

    if req.up_limit_kbps > 0 {
        req.probes.init_network_usage();
    }
    if req.disk_limit_kbps > 0 {
        req.probes.init_disk_usage();
    }

    let build_opts = || {
        let mut cbs = RemoteCallbacks::new();
        if req.use_credentials {
            cbs.credentials(credential_callback(req.creds));
        }
        let start = Instant::now();
        let down = req.down_limit_kbps;
        let up = req.up_limit_kbps;
        let disk = req.disk_limit_kbps;
        let probes = req.probes;
        cbs.transfer_progress(move |stats| {
            if let Some(cb) = progress {
                if stats.total_objects() > 0 {
                    let pct = (100 * stats.received_objects() / stats.total_objects()) as u8;
                    cb(pct.min(99));
                }
            }
            let mut expected_ms = 0.0f64;
            if down > 0 {
                let ms = stats.received_bytes() as f64 / (down as f64 * 1024.0) * 1000.0;
                expected_ms = expected_ms.max(ms);
            }
            if up > 0 {
                let net = probes.network_usage();
                let ms = net.up_bytes as f64 / (up as f64 * 1024.0) * 1000.0;
                expected_ms = expected_ms.max(ms);
            }
            if disk > 0 {
                let io = probes.disk_usage();
                let ms =
                    (io.read_bytes + io.write_bytes) as f64 / (disk as f64 * 1024.0) * 1000.0;
                expected_ms = expected_ms.max(ms);
            }
            let elapsed = start.elapsed().as_millis() as f64;
            if expected_ms > elapsed {
                std::thread::sleep(Duration::from_millis((expected_ms - elapsed) as u64));
            }
            true
        });
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(cbs);
        opts.proxy_options(proxy_options());
        opts
    };

    let mut auth_failed = false;
    if let Err(e) = remote.fetch(&[] as &[&str], Some(&mut build_opts()), None) {
        let first = classify(&e);
        if matches!(first, GitError::Auth(_)) {
            auth_failed = true;
        }
        match first {
            GitError::RateLimit(_) => {
                // One internal retry after a short backoff before reporting.
                std::thread::sleep(Duration::from_secs(2));
                if let Err(e2) = remote.fetch(&[] as &[&str], Some(&mut build_opts()), None) {
                    return match classify(&e2) {
                        GitError::Timeout(m) => report(PullOutcome::Timeout, m, auth_failed),
                        GitError::RateLimit(m) => {
                            report(PullOutcome::RateLimited, m, auth_failed)
                        }
                        GitError::Auth(m) => report(PullOutcome::Failed, m, true),
                        GitError::Other(m) => report(PullOutcome::Failed, m, auth_failed),
                    };
                }
            }
            GitError::Timeout(m) => return report(PullOutcome::Timeout, m, auth_failed),
            GitError::Auth(m) => return report(PullOutcome::Failed, m, true),
            GitError::Other(m) => return report(PullOutcome::Failed, m, auth_failed),
        }
    }

    let refname = match req.pull_ref {
        Some(r) if r.starts_with("refs/") => r.to_string(),
        Some(r) => format!("refs/remotes/{}/{}", req.remote, r),
        None => format!("refs/remotes/{}/{}", req.remote, branch),
    };
    let remote_oid = match repo.refname_to_id(&refname) {
        Ok(oid) => oid,
        Err(_) => return report(PullOutcome::Failed, "Remote branch not found".into(), auth_failed),
    };
    let local_oid = match repo.refname_to_id("HEAD") {
        Ok(oid) => oid,
        Err(_) => return report(PullOutcome::Failed, "Local HEAD not found".into(), auth_failed),
    };
    if local_oid == remote_oid {
        return report(PullOutcome::Success, "Already up to date".into(), auth_failed);
    }
    if !req.force && has_uncommitted_changes(path) {
        return report(
            PullOutcome::DirtyBlocked,
            "Local changes present".into(),
            auth_failed,
        );
    }
    let target = match repo.find_object(remote_oid, Some(ObjectType::Commit)) {
        Ok(obj) => obj,
        Err(_) => return report(PullOutcome::Failed, "Lookup failed".into(), auth_failed),
    };
    if repo.reset(&target, ResetType::Hard, None).is_err() {
        return report(PullOutcome::Failed, "Reset failed".into(), auth_failed);
    }
    report(PullOutcome::Success, "Fast-forwarded".into(), auth_failed)
}
