//! The tick loop that owns the repo table, spawns scan cycles, renders
//! status, and serves the detach channel.

use anyhow::{bail, Context, Result};
use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::{debug, info, warn};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{self, Options};
use crate::engine::{scan_repos, ScanContext, ScanState};
use crate::ipc::StatusServer;
use crate::lock::{self, LockGuard};
use crate::mutant::Mutant;
use crate::repo::{RepoInfo, RepoStatus};
use crate::resources::{self, Probes};
use crate::scanner::{build_repo_list, read_ignore_file, IgnoreSet};
use crate::ui::{self, StatusView, TrackerSample};

/// Expand the configured roots into the candidate path list.
pub fn discover(opts: &Options) -> Vec<PathBuf> {
    let mut patterns = opts.ignore_dirs.clone();
    if !opts.root.as_os_str().is_empty() {
        patterns.extend(read_ignore_file(&opts.root.join(".autogitpull.ignore")));
    }
    let ignore = IgnoreSet::new(&patterns);
    build_repo_list(
        &opts.roots(),
        opts.recursive_scan,
        &ignore,
        opts.max_depth,
        opts.keep_first_valid,
    )
}

/// Add newly discovered paths as `Pending` and drop entries whose path has
/// disappeared from the tree.
fn refresh_paths(state: &ScanState, discovered: &[PathBuf]) {
    let keep: BTreeSet<&PathBuf> = discovered.iter().collect();
    let mut tables = state.tables.lock().unwrap();
    for path in discovered {
        tables
            .infos
            .entry(path.clone())
            .or_insert_with(|| RepoInfo::new(path.clone()));
    }
    tables.infos.retain(|p, _| keep.contains(p));
    tables.skips.retain(|p| keep.contains(p));
}

/// Restores the terminal whether the loop exits or panics.
struct TuiGuard;

impl TuiGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode()?;
        execute!(std::io::stdout(), EnterAlternateScreen)?;
        Ok(TuiGuard)
    }
}

impl Drop for TuiGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(std::io::stdout(), LeaveAlternateScreen);
    }
}

fn acquire_root_lock(opts: &Options) -> Result<LockGuard> {
    let lock_path = opts.root.join(lock::LOCK_FILE_NAME);
    let mut guard = LockGuard::new(lock_path.clone());
    if !guard.locked {
        if let Some(pid) = lock::read_lock_pid(&lock_path) {
            if lock::process_running(pid) {
                bail!(
                    "Another instance is already running for this directory (PID {})",
                    pid
                );
            }
        }
        warn!("Stale lock file found. Removing and continuing...");
        lock::release_lock_file(&lock_path);
        guard.reacquire();
        if !guard.locked {
            bail!("Failed to acquire lock");
        }
    }
    Ok(guard)
}

fn poll_quit_key() -> bool {
    use crossterm::event::{Event, KeyCode, KeyModifiers};
    while crossterm::event::poll(Duration::ZERO).unwrap_or(false) {
        if let Ok(Event::Key(key)) = crossterm::event::read() {
            if key.code == KeyCode::Char('q')
                || (key.modifiers.contains(KeyModifiers::CONTROL)
                    && key.code == KeyCode::Char('c'))
            {
                return true;
            }
        }
    }
    false
}

/// Run the monitoring loop until shutdown. Returns the process exit code.
pub async fn run_event_loop(mut opts: Options, mutant: Option<Arc<Mutant>>) -> Result<i32> {
    // Pure client modes: stream a peer's status and leave.
    if opts.service.reattach
        || (opts.root.as_os_str().is_empty() && !opts.service.attach_name.is_empty())
    {
        let mut stdout = std::io::stdout();
        crate::ipc::attach_stream(&opts.service.attach_name, &mut stdout)
            .await
            .context("failed to connect to background instance")?;
        return Ok(0);
    }
    if opts.root.as_os_str().is_empty() {
        return Ok(0);
    }
    if !opts.root.is_dir() {
        bail!("Root path does not exist or is not a directory.");
    }

    let _lock = if opts.ignore_lock {
        None
    } else {
        Some(acquire_root_lock(&opts)?)
    };

    if opts.limits.cpu_core_mask != 0 && !resources::set_cpu_affinity(opts.limits.cpu_core_mask) {
        warn!("failed to apply cpu affinity mask {:#x}", opts.limits.cpu_core_mask);
    }
    let probes = Arc::new(Probes::new(
        Duration::from_secs(opts.limits.cpu_poll_sec),
        Duration::from_secs(opts.limits.mem_poll_sec),
        Duration::from_secs(opts.limits.thread_poll_sec),
    ));
    if opts.net_tracker {
        probes.init_network_usage();
    }
    if !opts.logging.log_file.as_os_str().is_empty() && !crate::logger::logger_initialized() {
        crate::logger::init_logger(
            &opts.logging.log_file,
            opts.logging.log_level,
            opts.logging.max_log_size,
            opts.logging.json_log,
            opts.logging.compress_logs,
        )?;
        info!("Program started");
    }
    if !opts.logging.log_dir.as_os_str().is_empty() {
        std::fs::create_dir_all(&opts.logging.log_dir)
            .with_context(|| format!("cannot create log dir {}", opts.logging.log_dir.display()))?;
    }

    let state = Arc::new(ScanState::default());
    let mut paths = Arc::new(discover(&opts));
    refresh_paths(&state, &paths);

    // SIGINT/SIGTERM flip the running flag; workers notice between paths.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            state.running.store(false, Ordering::SeqCst);
        });
    }
    #[cfg(unix)]
    {
        let state = state.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut stream) = signal(SignalKind::terminate()) {
                stream.recv().await;
                state.running.store(false, Ordering::SeqCst);
            }
        });
    }

    // Config auto-reload: a notify watcher flips a flag the loop consumes
    // between cycles.
    let reload_flag = Arc::new(AtomicBool::new(false));
    let mut _watcher = None;
    if opts.auto_reload_config && !opts.config_file.as_os_str().is_empty() {
        use notify::{RecursiveMode, Watcher};
        let flag = reload_flag.clone();
        match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if res.is_ok() {
                flag.store(true, Ordering::SeqCst);
            }
        }) {
            Ok(mut w) => {
                if w.watch(&opts.config_file, RecursiveMode::NonRecursive).is_ok() {
                    _watcher = Some(w);
                }
            }
            Err(e) => warn!("config watcher unavailable: {}", e),
        }
    }

    // The status channel runs as its own task; the loop only publishes.
    let status_server = if opts.service.attach_name.is_empty() {
        None
    } else {
        match StatusServer::bind(&opts.service.attach_name) {
            Ok(server) => Some(server),
            Err(e) => {
                warn!("failed to create status channel: {}", e);
                None
            }
        }
    };

    let tui_mode = !opts.cli && !opts.silent;
    let mut terminal = None;
    let mut _tui_guard = None;
    if tui_mode {
        match TuiGuard::enter() {
            Ok(guard) => {
                _tui_guard = Some(guard);
                terminal = Some(Terminal::new(CrosstermBackend::new(std::io::stdout()))?);
            }
            Err(e) => {
                // No usable terminal (e.g. piped output): degrade to CLI.
                warn!("TUI unavailable, falling back to CLI output: {}", e);
                opts.cli = true;
            }
        }
    }

    let start_time = Instant::now();
    let mut countdown = Duration::ZERO;
    let mut cli_countdown = Duration::ZERO;
    let mut last_rescan = Instant::now();
    let mut wait_empty_iters: u32 = 0;
    let mut scan_thread: Option<std::thread::JoinHandle<()>> = None;

    while state.running.load(Ordering::SeqCst) {
        let elapsed = start_time.elapsed();
        if !opts.runtime_limit.is_zero() && elapsed >= opts.runtime_limit {
            state.running.store(false, Ordering::SeqCst);
            break;
        }

        // Reap a finished scan.
        if !state.scanning.load(Ordering::SeqCst) {
            if let Some(handle) = scan_thread.take() {
                let _ = handle.join();
                if opts.single_run {
                    state.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        // Between cycles: config reload and periodic re-discovery.
        if !state.scanning.load(Ordering::SeqCst) {
            if reload_flag.swap(false, Ordering::SeqCst) {
                match config::load_config_file(&opts.config_file) {
                    Ok(cfg) => {
                        let mut fresh = opts.clone();
                        match config::apply_config(&mut fresh, &cfg) {
                            Ok(()) => {
                                info!("configuration reloaded from {}", opts.config_file.display());
                                opts = fresh;
                            }
                            Err(e) => warn!("config reload rejected: {:#}", e),
                        }
                    }
                    Err(e) => warn!("config reload failed: {:#}", e),
                }
            }
            if opts.rescan_new && last_rescan.elapsed() >= opts.rescan_interval {
                last_rescan = Instant::now();
                let found = discover(&opts);
                refresh_paths(&state, &found);
                paths = Arc::new(found);
                debug!("rescan found {} candidate paths", paths.len());
            }
        }

        if state.running.load(Ordering::SeqCst)
            && countdown.is_zero()
            && !state.scanning.load(Ordering::SeqCst)
        {
            if paths.is_empty() {
                let found = discover(&opts);
                if found.is_empty() {
                    if opts.wait_empty
                        && (opts.wait_empty_limit == 0 || wait_empty_iters < opts.wait_empty_limit)
                    {
                        wait_empty_iters += 1;
                        countdown = opts.interval;
                        continue;
                    }
                    if opts.wait_empty || opts.single_run {
                        state.running.store(false, Ordering::SeqCst);
                        break;
                    }
                } else {
                    refresh_paths(&state, &found);
                    paths = Arc::new(found);
                    wait_empty_iters = 0;
                }
            }
            // Clear busy states orphaned by a previous aborted cycle.
            {
                let mut tables = state.tables.lock().unwrap();
                for info in tables.infos.values_mut() {
                    if info.status.is_busy() {
                        warn!("clearing stale busy state for {}", info.path.display());
                        info.status = RepoStatus::Pending;
                        info.message = "Pending...".to_string();
                    }
                }
            }
            state.scanning.store(true, Ordering::SeqCst);
            let ctx = Arc::new(ScanContext {
                opts: opts.clone(),
                probes: probes.clone(),
                mutant: mutant.clone(),
            });
            let scan_paths = paths.clone();
            let scan_state = state.clone();
            scan_thread = Some(std::thread::spawn(move || {
                scan_repos(scan_paths, scan_state, ctx);
            }));
            countdown = opts.interval;
        }

        // Render one frame.
        let action = state.action();
        let scanning = state.scanning.load(Ordering::SeqCst);
        let seconds_left = countdown.as_secs();
        let runtime_sec = opts.show_runtime.then(|| elapsed.as_secs());
        let infos_snapshot = state.tables.lock().unwrap().infos.clone();
        let view = StatusView {
            paths: &paths,
            infos: &infos_snapshot,
            seconds_left,
            scanning,
            action: &action,
            runtime_sec,
        };
        if let Some(term) = terminal.as_mut() {
            let trackers = TrackerSample::collect(&probes, &opts);
            term.draw(|frame| ui::render(frame, &view, &opts, &trackers))?;
            if poll_quit_key() {
                state.running.store(false, Ordering::SeqCst);
            }
        } else if opts.cli && !opts.silent && cli_countdown.is_zero() {
            let block = ui::cli_status_block(&view, &opts);
            print!("{}", block);
            let _ = std::io::stdout().flush();
            cli_countdown = opts.refresh_ms;
        }

        if let Some(server) = status_server.as_ref() {
            server.publish(&action);
        }

        tokio::time::sleep(opts.refresh_ms).await;
        countdown = countdown.saturating_sub(opts.refresh_ms);
        cli_countdown = cli_countdown.saturating_sub(opts.refresh_ms);
    }

    state.running.store(false, Ordering::SeqCst);
    if let Some(handle) = scan_thread.take() {
        let _ = handle.join();
    }
    info!("Program exiting");
    log::logger().flush();
    Ok(0)
}
