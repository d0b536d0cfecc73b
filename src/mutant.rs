//! Adaptive scan mode.
//!
//! When active, the engine persists the remote tip's commit time for every
//! repository and skips repositories whose tip has not advanced since the
//! previous run. Observed pull latencies tune the pull timeout: timeouts
//! grow it, comfortably fast pulls shrink it back down.
//!
//! State file format, written synchronously after every change:
//! line 1 `<interval_seconds> <pull_timeout_seconds>`, then one
//! `<path> <last_seen_remote_commit_epoch>` line per repository.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::Options;
use crate::credentials::CredentialConfig;
use crate::git;
use crate::repo::{RepoInfo, RepoStatus};

pub const MUTANT_FILE_NAME: &str = ".autogitpull.mutant";

const TIMEOUT_STEP: Duration = Duration::from_secs(5);
const MIN_INTERVAL: Duration = Duration::from_secs(5);
const MIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, PartialEq)]
struct State {
    interval: Duration,
    pull_timeout: Duration,
    repo_times: BTreeMap<PathBuf, i64>,
}

#[derive(Debug)]
pub struct Mutant {
    path: PathBuf,
    state: Mutex<State>,
}

impl Mutant {
    /// Resolve the state file location: explicit `--mutant-config`, else
    /// `<root>/.autogitpull.mutant`.
    pub fn state_path(opts: &Options) -> PathBuf {
        if !opts.mutant_config.as_os_str().is_empty() {
            return opts.mutant_config.clone();
        }
        if opts.root.as_os_str().is_empty() {
            return PathBuf::from(MUTANT_FILE_NAME);
        }
        opts.root.join(MUTANT_FILE_NAME)
    }

    /// Activate the mode: load persisted state into `opts`, enforce the
    /// lower bounds and forced flags, and persist back.
    pub fn apply(opts: &mut Options) -> Option<Mutant> {
        if !opts.mutant_mode {
            return None;
        }
        let path = Self::state_path(opts);
        let state = load_state(&path);
        if state.interval > Duration::ZERO {
            opts.interval = state.interval;
        }
        if state.pull_timeout > Duration::ZERO {
            opts.limits.pull_timeout = state.pull_timeout;
            opts.limits.skip_timeout = false;
        }
        opts.interval = opts.interval.max(MIN_INTERVAL);
        if opts.limits.pull_timeout < MIN_TIMEOUT {
            opts.limits.pull_timeout = MIN_TIMEOUT;
            opts.limits.skip_timeout = false;
        }
        opts.retry_skipped = true;
        opts.skip_unavailable = false;
        if opts.updated_since.is_zero() {
            opts.updated_since = Duration::from_secs(3600);
        }
        let mutant = Mutant {
            path,
            state: Mutex::new(State {
                interval: opts.interval,
                pull_timeout: opts.limits.pull_timeout,
                repo_times: state.repo_times,
            }),
        };
        mutant.save();
        Some(mutant)
    }

    pub fn pull_timeout(&self) -> Duration {
        self.state.lock().unwrap().pull_timeout
    }

    /// Age-and-change gate, run in place of the plain age gate.
    ///
    /// Returns true when the repo should proceed to the pull stages; on a
    /// false return `ri` already carries the terminal skip status.
    pub fn should_pull(
        &self,
        repo: &Path,
        ri: &mut RepoInfo,
        remote: &str,
        use_credentials: bool,
        creds: &CredentialConfig,
        updated_since: Duration,
    ) -> bool {
        let mut t = git::remote_commit_time(repo, remote, &ri.branch, use_credentials, creds);
        if t == 0 {
            t = git::last_commit_time(repo);
        }
        let now = chrono::Utc::now().timestamp();
        if !updated_since.is_zero() && (t == 0 || now - t > updated_since.as_secs() as i64) {
            ri.status = RepoStatus::Skipped;
            ri.message = "Older than limit".to_string();
            return false;
        }
        {
            let mut st = self.state.lock().unwrap();
            if st.repo_times.get(repo) == Some(&t) {
                drop(st);
                ri.status = RepoStatus::Skipped;
                ri.message = "No change".to_string();
                return false;
            }
            st.repo_times.insert(repo.to_path_buf(), t);
        }
        ri.commit_time = t;
        self.save();
        true
    }

    /// Feed a pull result back into the timeout tuning.
    pub fn record_result(&self, status: RepoStatus, duration: Duration) {
        let mut st = self.state.lock().unwrap();
        let old = st.pull_timeout;
        match status {
            RepoStatus::Timeout => {
                st.pull_timeout += TIMEOUT_STEP;
            }
            s if s.is_pull_success() && !duration.is_zero() => {
                if duration >= st.pull_timeout {
                    st.pull_timeout += TIMEOUT_STEP;
                } else if duration * 2 < st.pull_timeout
                    && st.pull_timeout > Duration::from_secs(10)
                {
                    st.pull_timeout -= TIMEOUT_STEP;
                }
            }
            _ => {}
        }
        let changed = st.pull_timeout != old;
        drop(st);
        if changed {
            self.save();
        }
    }

    /// Persist the current state. IO failures are logged and otherwise
    /// ignored; the mode keeps running from memory.
    pub fn save(&self) {
        let st = self.state.lock().unwrap();
        if let Err(e) = write_state(&self.path, &st) {
            log::error!("failed to write mutant state {}: {}", self.path.display(), e);
        }
    }
}

fn load_state(path: &Path) -> State {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return State::default();
    };
    let mut lines = contents.lines();
    let mut state = State::default();
    if let Some(header) = lines.next() {
        let mut parts = header.split_whitespace();
        if let Some(Ok(secs)) = parts.next().map(str::parse::<u64>) {
            state.interval = Duration::from_secs(secs);
        }
        if let Some(Ok(secs)) = parts.next().map(str::parse::<u64>) {
            state.pull_timeout = Duration::from_secs(secs);
        }
    }
    for line in lines {
        // The epoch is the last whitespace-separated token; everything
        // before it is the path, which may itself contain spaces.
        let Some((path_part, time_part)) = line.rsplit_once(' ') else {
            continue;
        };
        let Ok(t) = time_part.trim().parse::<i64>() else {
            continue;
        };
        state.repo_times.insert(PathBuf::from(path_part), t);
    }
    state
}

fn write_state(path: &Path, state: &State) -> std::io::Result<()> {
    let mut f = std::fs::File::create(path)?;
    writeln!(
        f,
        "{} {}",
        state.interval.as_secs(),
        state.pull_timeout.as_secs()
    )?;
    for (p, t) in &state.repo_times {
        writeln!(f, "{} {}", p.display(), t)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutant_with(path: PathBuf, timeout_secs: u64) -> Mutant {
        Mutant {
            path,
            state: Mutex::new(State {
                interval: Duration::from_secs(30),
                pull_timeout: Duration::from_secs(timeout_secs),
                repo_times: BTreeMap::new(),
            }),
        }
    }

    #[test]
    fn state_file_load_save_is_a_fixpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join(MUTANT_FILE_NAME);
        std::fs::write(&file, "60 45\n/srv/a 1700000000\n/srv/b 1700000100\n").unwrap();
        let state = load_state(&file);
        assert_eq!(state.interval, Duration::from_secs(60));
        assert_eq!(state.pull_timeout, Duration::from_secs(45));
        assert_eq!(state.repo_times.len(), 2);

        write_state(&file, &state).unwrap();
        assert_eq!(load_state(&file), state);
    }

    #[test]
    fn paths_with_spaces_survive_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join(MUTANT_FILE_NAME);
        let mut state = State {
            interval: Duration::from_secs(30),
            pull_timeout: Duration::from_secs(30),
            repo_times: BTreeMap::new(),
        };
        state
            .repo_times
            .insert(PathBuf::from("/srv/my repos/app"), 1700000000);
        write_state(&file, &state).unwrap();
        assert_eq!(load_state(&file), state);
    }

    #[test]
    fn activation_enforces_bounds_and_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let mut opts = Options::default();
        opts.mutant_mode = true;
        opts.root = tmp.path().to_path_buf();
        opts.interval = Duration::from_secs(1);
        opts.skip_unavailable = true;

        let mutant = Mutant::apply(&mut opts).expect("mutant active");
        assert_eq!(opts.interval, Duration::from_secs(5));
        assert_eq!(opts.limits.pull_timeout, Duration::from_secs(30));
        assert!(!opts.limits.skip_timeout);
        assert!(opts.retry_skipped);
        assert!(!opts.skip_unavailable);
        assert_eq!(opts.updated_since, Duration::from_secs(3600));
        assert!(tmp.path().join(MUTANT_FILE_NAME).exists());
        assert_eq!(mutant.pull_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn activation_is_a_no_op_without_the_mode_flag() {
        let mut opts = Options::default();
        assert!(Mutant::apply(&mut opts).is_none());
    }

    #[test]
    fn timeouts_grow_the_timeout_stepwise() {
        let tmp = tempfile::tempdir().unwrap();
        let m = mutant_with(tmp.path().join(MUTANT_FILE_NAME), 30);
        m.record_result(RepoStatus::Timeout, Duration::ZERO);
        assert_eq!(m.pull_timeout(), Duration::from_secs(35));
        m.record_result(RepoStatus::Timeout, Duration::ZERO);
        assert_eq!(m.pull_timeout(), Duration::from_secs(40));
        // Persisted header reflects the new value.
        let state = load_state(&tmp.path().join(MUTANT_FILE_NAME));
        assert_eq!(state.pull_timeout, Duration::from_secs(40));
    }

    #[test]
    fn fast_successes_shrink_a_generous_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let m = mutant_with(tmp.path().join(MUTANT_FILE_NAME), 40);
        m.record_result(RepoStatus::PullOk, Duration::from_secs(1));
        assert_eq!(m.pull_timeout(), Duration::from_secs(35));
    }

    #[test]
    fn slow_successes_grow_the_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let m = mutant_with(tmp.path().join(MUTANT_FILE_NAME), 30);
        m.record_result(RepoStatus::PullOk, Duration::from_secs(30));
        assert_eq!(m.pull_timeout(), Duration::from_secs(35));
    }

    #[test]
    fn near_floor_timeout_is_not_shrunk() {
        let tmp = tempfile::tempdir().unwrap();
        let m = mutant_with(tmp.path().join(MUTANT_FILE_NAME), 10);
        m.record_result(RepoStatus::PullOk, Duration::from_secs(1));
        assert_eq!(m.pull_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn failures_leave_the_timeout_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let m = mutant_with(tmp.path().join(MUTANT_FILE_NAME), 30);
        m.record_result(RepoStatus::Error, Duration::from_secs(60));
        m.record_result(RepoStatus::Dirty, Duration::from_secs(1));
        assert_eq!(m.pull_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn pkg_lock_outcome_feeds_tuning_like_a_success() {
        let tmp = tempfile::tempdir().unwrap();
        let m = mutant_with(tmp.path().join(MUTANT_FILE_NAME), 40);
        m.record_result(RepoStatus::PkgLockFixed, Duration::from_secs(1));
        assert_eq!(m.pull_timeout(), Duration::from_secs(35));
    }
}
