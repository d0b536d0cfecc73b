use serde::Serialize;
use std::path::PathBuf;

/// Terminal and in-flight states a repository can be in during a scan cycle.
///
/// `Pulling` and `Checking` are in-progress hints: an entry carrying one of
/// them is owned by a worker and must not be re-dispatched until the worker
/// writes a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RepoStatus {
    #[default]
    Pending,
    Checking,
    UpToDate,
    Pulling,
    PullOk,
    /// Pull succeeded after the package-lock auto-recovery path. The
    /// code-point is kept wired through the engine and presenters, but no
    /// current pull path produces it.
    PkgLockFixed,
    Dirty,
    RemoteAhead,
    Error,
    Skipped,
    NotGit,
    HeadProblem,
    Timeout,
    RateLimit,
    /// Previously-good repo is temporarily unreachable.
    TempFail,
}

impl RepoStatus {
    /// Short fixed-width label used by both the TUI table and the CLI lines.
    pub fn label(self) -> &'static str {
        match self {
            RepoStatus::Pending => "Pending",
            RepoStatus::Checking => "Checking",
            RepoStatus::UpToDate => "UpToDate",
            RepoStatus::Pulling => "Pulling",
            RepoStatus::PullOk => "Pulled",
            RepoStatus::PkgLockFixed => "PkgLockOk",
            RepoStatus::Dirty => "Dirty",
            RepoStatus::RemoteAhead => "RemoteUp",
            RepoStatus::Error => "Error",
            RepoStatus::Skipped => "Skipped",
            RepoStatus::NotGit => "NotGit",
            RepoStatus::HeadProblem => "HEAD/BR",
            RepoStatus::Timeout => "Timeout",
            RepoStatus::RateLimit => "RateLim",
            RepoStatus::TempFail => "TempFail",
        }
    }

    /// True while a worker owns the entry.
    pub fn is_busy(self) -> bool {
        matches!(self, RepoStatus::Pulling | RepoStatus::Checking)
    }

    /// True for the outcomes that mean a pull landed new commits.
    pub fn is_pull_success(self) -> bool {
        matches!(self, RepoStatus::PullOk | RepoStatus::PkgLockFixed)
    }
}

/// Everything the engine knows about one candidate path.
///
/// Exactly one worker mutates an entry at a time; observers read it under
/// the shared map lock and see either the pre-cycle or post-cycle value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepoInfo {
    pub path: PathBuf,
    pub status: RepoStatus,
    pub message: String,
    /// Short branch name; empty when unknown, `HEAD` means detached.
    pub branch: String,
    /// First 7 hex chars of local HEAD, or empty.
    pub commit: String,
    pub commit_author: String,
    pub commit_date: String,
    /// Epoch seconds of the local HEAD commit.
    pub commit_time: i64,
    /// Full textual log of the most recent pull attempt.
    pub last_pull_log: String,
    /// 0-100, monotonic within one pull attempt.
    pub progress: u8,
    pub auth_failed: bool,
    /// Latched true once any pull for this path has succeeded; never cleared
    /// while the entry exists.
    pub pulled: bool,
}

impl RepoInfo {
    pub fn new(path: PathBuf) -> Self {
        RepoInfo {
            path,
            message: "Pending...".to_string(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Store a commit hash, truncating to the 7-char display form.
    pub fn set_commit(&mut self, hash: impl Into<String>) {
        let mut h: String = hash.into();
        if h.len() > 7 {
            h.truncate(7);
        }
        self.commit = h;
    }
}
