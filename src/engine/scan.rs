//! Scan orchestrator: one cycle over the full path vector.
//!
//! Workers are plain OS threads consuming a shared atomic index, so each
//! path is processed exactly once per cycle regardless of worker count.

use log::{debug, error};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{process_repo, EffectiveParams, ScanContext, ScanState};
use crate::repo::{RepoInfo, RepoStatus};

/// Reset statuses for the new cycle and apply the skip-set policy.
fn prepare_cycle(state: &ScanState, ctx: &ScanContext) {
    let opts = &ctx.opts;
    let mut tables = state.tables.lock().unwrap();
    let skips: Vec<PathBuf> = tables.skips.iter().cloned().collect();
    for (path, info) in tables.infos.iter_mut() {
        let skipped = skips.contains(path);
        if skipped {
            if opts.reset_skipped && info.status != RepoStatus::NotGit {
                info.status = RepoStatus::Pending;
                info.message = "Pending...".to_string();
                info.progress = 0;
            }
            if !opts.retry_skipped {
                continue;
            }
        }
        if info.status != RepoStatus::NotGit {
            info.status = RepoStatus::Pending;
            info.message = "Pending...".to_string();
            info.progress = 0;
        }
    }
    if opts.retry_skipped {
        tables.skips.clear();
    }
}

/// Run one scan cycle to completion. Returns when every worker has exited.
pub fn scan_repos(paths: Arc<Vec<PathBuf>>, state: Arc<ScanState>, ctx: Arc<ScanContext>) {
    let mem_before = ctx.probes.memory_mb();
    let virt_before = ctx.probes.virtual_memory_kb();

    prepare_cycle(&state, &ctx);

    let concurrency = ctx.opts.effective_concurrency().min(paths.len()).max(1);
    debug!("Scanning repositories with {} workers", concurrency);

    let next_index = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for _ in 0..concurrency {
            scope.spawn(|| {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    worker_loop(&paths, &state, &ctx, &next_index)
                }));
                if let Err(panic) = result {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("Worker thread panicked: {}", msg);
                    state.running.store(false, Ordering::SeqCst);
                }
            });
        }
    });

    if ctx.opts.debug_memory || ctx.opts.dump_state {
        let mem_after = ctx.probes.memory_mb();
        let virt_after = ctx.probes.virtual_memory_kb();
        debug!(
            "Memory before={}MB after={}MB delta={}MB vmem_before={}MB vmem_after={}MB",
            mem_before,
            mem_after,
            mem_after as i64 - mem_before as i64,
            virt_before / 1024,
            virt_after / 1024,
        );
        let tables = state.tables.lock().unwrap();
        debug!(
            "repo_infos={} entries, skip_repos={} entries",
            tables.infos.len(),
            tables.skips.len()
        );
        if ctx.opts.dump_state && tables.infos.len() > ctx.opts.dump_threshold {
            for (path, info) in &tables.infos {
                debug!("  {} [{}] {}", path.display(), info.status.label(), info.message);
            }
        }
    }

    state.scanning.store(false, Ordering::SeqCst);
    state.set_action("Idle");
    debug!("Scan complete");
}

fn worker_loop(
    paths: &[PathBuf],
    state: &ScanState,
    ctx: &ScanContext,
    next_index: &AtomicUsize,
) {
    while state.running.load(Ordering::SeqCst) {
        let idx = next_index.fetch_add(1, Ordering::SeqCst);
        if idx >= paths.len() {
            break;
        }
        let path = &paths[idx];
        {
            let tables = state.tables.lock().unwrap();
            if !ctx.opts.retry_skipped && tables.skips.contains(path) {
                continue;
            }
        }
        let (eff, excluded) = EffectiveParams::for_path(ctx, path);
        if excluded {
            let mut tables = state.tables.lock().unwrap();
            let info = tables
                .infos
                .entry(path.clone())
                .or_insert_with(|| RepoInfo::new(path.clone()));
            info.status = RepoStatus::Skipped;
            info.message = "Excluded".to_string();
            continue;
        }

        process_repo(path, state, ctx, &eff);

        let limits = &ctx.opts.limits;
        if limits.mem_limit_mb > 0 && ctx.probes.memory_mb() > limits.mem_limit_mb {
            error!("Memory limit exceeded");
            state.running.store(false, Ordering::SeqCst);
            break;
        }
        if eff.cpu_limit > 0.0 {
            let cpu = ctx.probes.cpu_percent();
            if cpu > eff.cpu_limit {
                let over = cpu / eff.cpu_limit - 1.0;
                std::thread::sleep(Duration::from_millis((over * 100.0) as u64));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Options, RepoOverrides};
    use crate::resources::Probes;
    use std::path::Path;
    use std::process::Command;

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

    fn ctx_with(opts: Options) -> Arc<ScanContext> {
        Arc::new(ScanContext {
            opts,
            probes: Arc::new(Probes::default()),
            mutant: None,
        })
    }

    #[test]
    fn every_path_is_processed_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for name in ["a", "b", "c", "d", "e"] {
            let dir = tmp.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            paths.push(dir);
        }
        let mut opts = Options::default();
        opts.include_private = true;
        opts.limits.concurrency = 3;
        let state = Arc::new(ScanState::default());
        scan_repos(Arc::new(paths.clone()), state.clone(), ctx_with(opts));

        let tables = state.tables.lock().unwrap();
        assert_eq!(tables.infos.len(), 5);
        for p in &paths {
            assert_eq!(tables.infos[p].status, RepoStatus::NotGit);
        }
    }

    #[test]
    fn no_entry_stays_busy_after_a_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("r");
        init_repo(&repo);
        let plain = tmp.path().join("plain");
        std::fs::create_dir_all(&plain).unwrap();

        let mut opts = Options::default();
        opts.include_private = true;
        opts.limits.concurrency = 2;
        let state = Arc::new(ScanState::default());
        scan_repos(
            Arc::new(vec![repo.clone(), plain.clone()]),
            state.clone(),
            ctx_with(opts),
        );

        let tables = state.tables.lock().unwrap();
        for info in tables.infos.values() {
            assert!(!info.status.is_busy(), "{:?} left busy", info.path);
        }
        assert!(!state.scanning.load(Ordering::SeqCst));
        assert_eq!(state.action(), "Idle");
    }

    #[test]
    fn excluded_repos_short_circuit() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("frozen");
        init_repo(&repo);

        let mut opts = Options::default();
        opts.include_private = true;
        opts.repo_settings.insert(
            repo.clone(),
            RepoOverrides {
                exclude: Some(true),
                ..RepoOverrides::default()
            },
        );
        let state = Arc::new(ScanState::default());
        scan_repos(Arc::new(vec![repo.clone()]), state.clone(), ctx_with(opts));

        let tables = state.tables.lock().unwrap();
        assert_eq!(tables.infos[&repo].status, RepoStatus::Skipped);
        assert_eq!(tables.infos[&repo].message, "Excluded");
    }

    #[test]
    fn skipped_paths_are_not_dispatched_without_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("r");
        init_repo(&repo);

        let mut opts = Options::default();
        opts.include_private = true;
        let state = Arc::new(ScanState::default());
        {
            let mut tables = state.tables.lock().unwrap();
            tables.skips.insert(repo.clone());
            let mut info = RepoInfo::new(repo.clone());
            info.status = RepoStatus::Skipped;
            info.message = "Skipped after fatal error".to_string();
            tables.infos.insert(repo.clone(), info);
        }
        scan_repos(Arc::new(vec![repo.clone()]), state.clone(), ctx_with(opts));

        let tables = state.tables.lock().unwrap();
        // Untouched: still the skip status, still in the skip set.
        assert_eq!(tables.infos[&repo].status, RepoStatus::Skipped);
        assert!(tables.skips.contains(&repo));
    }

    #[test]
    fn retry_skipped_clears_the_skip_set() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("plain");
        std::fs::create_dir_all(&plain).unwrap();

        let mut opts = Options::default();
        opts.include_private = true;
        opts.retry_skipped = true;
        let state = Arc::new(ScanState::default());
        state.tables.lock().unwrap().skips.insert(plain.clone());
        scan_repos(Arc::new(vec![plain.clone()]), state.clone(), ctx_with(opts));

        let tables = state.tables.lock().unwrap();
        assert!(tables.skips.is_empty());
        assert_eq!(tables.infos[&plain].status, RepoStatus::NotGit);
    }

    #[test]
    fn reset_skipped_moves_entries_back_to_pending() {
        let repo = PathBuf::from("/srv/gone");
        let mut opts = Options::default();
        opts.reset_skipped = true;
        let state = ScanState::default();
        {
            let mut tables = state.tables.lock().unwrap();
            tables.skips.insert(repo.clone());
            let mut info = RepoInfo::new(repo.clone());
            info.status = RepoStatus::HeadProblem;
            tables.infos.insert(repo.clone(), info);
        }
        let ctx = ScanContext {
            opts,
            probes: Arc::new(Probes::default()),
            mutant: None,
        };
        prepare_cycle(&state, &ctx);
        let tables = state.tables.lock().unwrap();
        assert_eq!(tables.infos[&repo].status, RepoStatus::Pending);
        // reset-skipped alone leaves the skip set in place.
        assert!(tables.skips.contains(&repo));
    }

    #[test]
    fn not_git_entries_are_never_reset_to_pending() {
        let repo = PathBuf::from("/srv/not-a-repo");
        let state = ScanState::default();
        {
            let mut tables = state.tables.lock().unwrap();
            let mut info = RepoInfo::new(repo.clone());
            info.status = RepoStatus::NotGit;
            tables.infos.insert(repo.clone(), info);
        }
        let ctx = ScanContext {
            opts: Options::default(),
            probes: Arc::new(Probes::default()),
            mutant: None,
        };
        prepare_cycle(&state, &ctx);
        let tables = state.tables.lock().unwrap();
        assert_eq!(tables.infos[&repo].status, RepoStatus::NotGit);
    }
}
