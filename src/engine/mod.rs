//! The scan engine: a bounded worker pool driving each repository through
//! validate → age-gate → hash-compare → pull → record.

mod process;
mod pull;
mod scan;

pub use process::process_repo;
pub use scan::scan_repos;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Options;
use crate::mutant::Mutant;
use crate::repo::RepoInfo;
use crate::resources::Probes;

/// Repo table plus the skip set, guarded together: skip decisions and
/// status writes must be atomic with respect to each other.
#[derive(Debug, Default)]
pub struct ScanTables {
    pub infos: BTreeMap<PathBuf, RepoInfo>,
    pub skips: BTreeSet<PathBuf>,
}

/// State shared between the event loop and the workers of the current scan.
#[derive(Debug)]
pub struct ScanState {
    pub tables: Mutex<ScanTables>,
    /// Human-readable "what is happening right now", for the UI and the
    /// detach channel. Separate lock so rendering never waits on workers.
    pub action: Mutex<String>,
    pub running: AtomicBool,
    pub scanning: AtomicBool,
}

impl Default for ScanState {
    fn default() -> Self {
        ScanState {
            tables: Mutex::new(ScanTables::default()),
            action: Mutex::new("Idle".to_string()),
            running: AtomicBool::new(true),
            scanning: AtomicBool::new(false),
        }
    }
}

impl ScanState {
    pub fn set_action(&self, action: impl Into<String>) {
        *self.action.lock().unwrap() = action.into();
    }

    pub fn action(&self) -> String {
        self.action.lock().unwrap().clone()
    }
}

/// Immutable context handed to every worker: the options snapshot, the
/// probe handles, and the mutant handle when the adaptive mode is active.
pub struct ScanContext {
    pub opts: Options,
    pub probes: Arc<Probes>,
    pub mutant: Option<Arc<Mutant>>,
}

/// Per-path parameters after applying the override table on top of the
/// global options.
#[derive(Debug, Clone)]
pub struct EffectiveParams {
    pub check_only: bool,
    pub force_pull: bool,
    pub cpu_limit: f64,
    pub down_limit_kbps: u64,
    pub up_limit_kbps: u64,
    pub disk_limit_kbps: u64,
    pub pull_timeout: Duration,
    pub post_pull_hook: PathBuf,
    pub pull_ref: Option<String>,
}

impl EffectiveParams {
    pub fn for_path(ctx: &ScanContext, path: &std::path::Path) -> (Self, bool) {
        let opts = &ctx.opts;
        let ov = opts.overrides_for(path);
        let excluded = ov.exclude.unwrap_or(false);
        // The mutant's tuned timeout displaces the static default; a per-repo
        // override beats both, and a per-repo max-runtime caps the result.
        let base_timeout = match &ctx.mutant {
            Some(m) => m.pull_timeout(),
            None => opts.limits.pull_timeout,
        };
        let mut pull_timeout = ov.pull_timeout.unwrap_or(base_timeout);
        if let Some(max_rt) = ov.max_runtime {
            if pull_timeout.is_zero() || pull_timeout > max_rt {
                pull_timeout = max_rt;
            }
        }
        let params = EffectiveParams {
            check_only: ov.check_only.unwrap_or(opts.check_only),
            force_pull: ov.force_pull.unwrap_or(opts.force_pull),
            cpu_limit: ov.cpu_limit.unwrap_or(opts.limits.cpu_percent_limit),
            down_limit_kbps: ov
                .download_limit_kbps
                .unwrap_or(opts.limits.download_limit_kbps),
            up_limit_kbps: ov.upload_limit_kbps.unwrap_or(opts.limits.upload_limit_kbps),
            disk_limit_kbps: ov.disk_limit_kbps.unwrap_or(opts.limits.disk_limit_kbps),
            pull_timeout,
            post_pull_hook: ov
                .post_pull_hook
                .unwrap_or_else(|| opts.post_pull_hook.clone()),
            pull_ref: ov.pull_ref.or_else(|| opts.pull_ref.clone()),
        };
        (params, excluded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoOverrides;

    #[test]
    fn overrides_displace_global_defaults() {
        let mut opts = Options::default();
        opts.check_only = false;
        opts.limits.cpu_percent_limit = 10.0;
        opts.limits.pull_timeout = Duration::from_secs(30);
        let path = PathBuf::from("/srv/app");
        opts.repo_settings.insert(
            path.clone(),
            RepoOverrides {
                check_only: Some(true),
                cpu_limit: Some(55.0),
                pull_timeout: Some(Duration::from_secs(90)),
                ..RepoOverrides::default()
            },
        );
        let ctx = ScanContext {
            opts,
            probes: Arc::new(Probes::default()),
            mutant: None,
        };
        let (eff, excluded) = EffectiveParams::for_path(&ctx, &path);
        assert!(!excluded);
        assert!(eff.check_only);
        assert_eq!(eff.cpu_limit, 55.0);
        assert_eq!(eff.pull_timeout, Duration::from_secs(90));

        let (other, _) = EffectiveParams::for_path(&ctx, std::path::Path::new("/srv/other"));
        assert!(!other.check_only);
        assert_eq!(other.cpu_limit, 10.0);
        assert_eq!(other.pull_timeout, Duration::from_secs(30));
    }

    #[test]
    fn max_runtime_caps_the_pull_timeout() {
        let mut opts = Options::default();
        opts.limits.pull_timeout = Duration::from_secs(120);
        let path = PathBuf::from("/srv/slow");
        opts.repo_settings.insert(
            path.clone(),
            RepoOverrides {
                max_runtime: Some(Duration::from_secs(20)),
                ..RepoOverrides::default()
            },
        );
        let ctx = ScanContext {
            opts,
            probes: Arc::new(Probes::default()),
            mutant: None,
        };
        let (eff, _) = EffectiveParams::for_path(&ctx, &path);
        assert_eq!(eff.pull_timeout, Duration::from_secs(20));
    }

    #[test]
    fn exclusion_is_reported() {
        let mut opts = Options::default();
        let path = PathBuf::from("/srv/frozen");
        opts.repo_settings.insert(
            path.clone(),
            RepoOverrides {
                exclude: Some(true),
                ..RepoOverrides::default()
            },
        );
        let ctx = ScanContext {
            opts,
            probes: Arc::new(Probes::default()),
            mutant: None,
        };
        let (_, excluded) = EffectiveParams::for_path(&ctx, &path);
        assert!(excluded);
    }
}
