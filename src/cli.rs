//! Command-line surface and its mapping onto [`Options`].
//!
//! Precedence: built-in defaults, then a config file (explicit
//! `--config-yaml`/`--config-json` or `--auto-config` discovery), then
//! explicit command-line flags.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{self, expand_home, Options};
use crate::parse;

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse::parse_duration(s).ok_or_else(|| format!("invalid duration: {}", s))
}

fn bytes_arg(s: &str) -> Result<u64, String> {
    parse::parse_bytes(s).ok_or_else(|| format!("invalid size: {}", s))
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "autogitpull",
    version,
    about = "Automatic Git puller & monitor: keeps a tree of working copies fast-forwarded",
    after_help = "Durations accept s/m/h/d/w/M suffixes; sizes accept K/M/G/T/P or KB..PB."
)]
pub struct Cli {
    /// Root folder containing the repositories to track
    #[arg(value_name = "ROOT")]
    pub root: Option<PathBuf>,

    /// Root folder (flag form)
    #[arg(long = "root", value_name = "PATH")]
    pub root_path: Option<PathBuf>,

    // ── core ────────────────────────────────────────────────────────────
    /// Delay between scans
    #[arg(short = 'i', long, value_parser = duration_arg, value_name = "DUR")]
    pub interval: Option<Duration>,

    /// UI refresh rate in milliseconds
    #[arg(short = 'r', long = "refresh-rate", value_name = "MS")]
    pub refresh_rate: Option<u64>,

    /// Run a single scan cycle and exit
    #[arg(long)]
    pub single_run: bool,

    /// Disable console output entirely
    #[arg(short = 's', long)]
    pub silent: bool,

    /// Line-oriented console output instead of the TUI
    #[arg(short = 'c', long)]
    pub cli: bool,

    /// Scan subdirectories recursively
    #[arg(long)]
    pub recursive: bool,

    /// Limit recursive scan depth (0 = unlimited)
    #[arg(short = 'D', long, value_name = "N")]
    pub max_depth: Option<usize>,

    /// Directory or glob pattern to ignore (repeatable)
    #[arg(long, value_name = "DIR")]
    pub ignore: Vec<PathBuf>,

    /// Additional root to scan (repeatable)
    #[arg(long = "include-dir", value_name = "DIR")]
    pub include_dir: Vec<PathBuf>,

    /// Remote name to pull from
    #[arg(long, value_name = "NAME")]
    pub remote: Option<String>,

    /// Explicit ref to fast-forward to instead of the tracked branch
    #[arg(long = "pull-ref", value_name = "REF")]
    pub pull_ref: Option<String>,

    /// Exit after this much wall-clock runtime
    #[arg(long = "max-runtime", value_parser = duration_arg, value_name = "DUR")]
    pub max_runtime: Option<Duration>,

    // ── access ──────────────────────────────────────────────────────────
    /// Include non-GitHub and inaccessible-remote repositories
    #[arg(short = 'p', long = "include-private")]
    pub include_private: bool,

    /// Discard local changes when pulling
    #[arg(long = "force-pull", alias = "discard-dirty")]
    pub force_pull: bool,

    /// Only report divergence; never touch HEAD
    #[arg(long = "check-only")]
    pub check_only: bool,

    /// Go through the motions without pulling
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Always attempt the pull without comparing hashes first
    #[arg(long = "no-hash-check")]
    pub no_hash_check: bool,

    // ── concurrency & resource caps ─────────────────────────────────────
    /// Number of worker threads
    #[arg(long, alias = "threads", value_name = "N")]
    pub concurrency: Option<usize>,

    /// Run with a single worker thread
    #[arg(long = "single-thread")]
    pub single_thread: bool,

    /// Hard cap on worker threads
    #[arg(long = "max-threads", value_name = "N")]
    pub max_threads: Option<usize>,

    /// Approximate CPU usage limit (0-100)
    #[arg(long = "cpu-percent", value_name = "PCT")]
    pub cpu_percent: Option<f64>,

    /// CPU affinity mask (decimal or 0x-prefixed hex)
    #[arg(long = "cpu-cores", value_name = "MASK")]
    pub cpu_cores: Option<String>,

    /// Abort the scan cycle when resident memory exceeds this
    #[arg(long = "mem-limit", value_parser = bytes_arg, value_name = "BYTES")]
    pub mem_limit: Option<u64>,

    /// Cap download rate (bytes/s)
    #[arg(long = "download-limit", value_parser = bytes_arg, value_name = "BYTES")]
    pub download_limit: Option<u64>,

    /// Cap upload rate (bytes/s)
    #[arg(long = "upload-limit", value_parser = bytes_arg, value_name = "BYTES")]
    pub upload_limit: Option<u64>,

    /// Cap disk throughput (bytes/s)
    #[arg(long = "disk-limit", value_parser = bytes_arg, value_name = "BYTES")]
    pub disk_limit: Option<u64>,

    /// Network timeout for one pull
    #[arg(long = "pull-timeout", value_parser = duration_arg, value_name = "DUR")]
    pub pull_timeout: Option<Duration>,

    /// Stop the loop when any pull times out
    #[arg(long = "exit-on-timeout")]
    pub exit_on_timeout: bool,

    // ── credentials ─────────────────────────────────────────────────────
    /// SSH public key path
    #[arg(long = "ssh-public-key", value_name = "FILE")]
    pub ssh_public_key: Option<PathBuf>,

    /// SSH private key path
    #[arg(long = "ssh-private-key", value_name = "FILE")]
    pub ssh_private_key: Option<PathBuf>,

    /// File with username and password on the first two lines
    #[arg(long = "credential-file", value_name = "FILE")]
    pub credential_file: Option<PathBuf>,

    /// Proxy URL for fetches
    #[arg(long, value_name = "URL")]
    pub proxy: Option<String>,

    // ── behavior ────────────────────────────────────────────────────────
    /// Re-dispatch repositories skipped in earlier cycles
    #[arg(long = "retry-skipped")]
    pub retry_skipped: bool,

    /// Reset skipped repositories to pending before each scan
    #[arg(long = "reset-skipped")]
    pub reset_skipped: bool,

    /// Also skip repositories that error while reachable
    #[arg(long = "skip-accessible-errors")]
    pub skip_accessible_errors: bool,

    /// Keep retrying repositories that timed out
    #[arg(long = "dont-skip-timeouts")]
    pub dont_skip_timeouts: bool,

    /// Keep retrying repositories whose remote is unavailable
    #[arg(long = "dont-skip-unavailable")]
    pub dont_skip_unavailable: bool,

    /// Stop root expansion at the first root that yields candidates
    #[arg(long = "keep-first-valid")]
    pub keep_first_valid: bool,

    /// Keep waiting when the root holds no repositories (optionally for N scans)
    #[arg(long = "wait-empty", num_args = 0..=1, default_missing_value = "0", value_name = "N")]
    pub wait_empty: Option<u32>,

    /// Only consider repositories updated within this window
    #[arg(long = "updated-since", value_parser = duration_arg, value_name = "DUR")]
    pub updated_since: Option<Duration>,

    /// Re-run discovery every N minutes to pick up new repositories
    #[arg(long = "rescan-new", num_args = 0..=1, default_missing_value = "5", value_name = "MIN")]
    pub rescan_new: Option<u64>,

    /// Command to run after a successful pull
    #[arg(long = "post-pull-hook", value_name = "CMD")]
    pub post_pull_hook: Option<PathBuf>,

    // ── persistence / supervision ───────────────────────────────────────
    /// Respawn the loop when it exits (optionally naming the attach channel)
    #[arg(long, num_args = 0..=1, default_missing_value = "", value_name = "NAME")]
    pub persist: Option<String>,

    /// Respawn allowance: <n> or <n>,<window-minutes>
    #[arg(long = "respawn-limit", value_name = "N[,MIN]")]
    pub respawn_limit: Option<String>,

    /// Base delay between respawns
    #[arg(long = "respawn-delay", value_parser = duration_arg, value_name = "DUR")]
    pub respawn_delay: Option<Duration>,

    /// Serve the status channel under this name
    #[arg(short = 'A', long, value_name = "NAME")]
    pub attach: Option<String>,

    /// Run detached from the console, serving the named status channel
    #[arg(short = 'b', long, value_name = "NAME")]
    pub background: Option<String>,

    /// Attach to a running instance's status channel and stream it
    #[arg(short = 'B', long, value_name = "NAME")]
    pub reattach: Option<String>,

    /// List running instances discovered on this machine
    #[arg(long = "list-instances")]
    pub list_instances: bool,

    /// Terminate the instance holding this root's lock
    #[arg(long = "kill-all")]
    pub kill_all: bool,

    // ── config files ────────────────────────────────────────────────────
    /// Load options from a YAML file
    #[arg(short = 'y', long = "config-yaml", value_name = "FILE")]
    pub config_yaml: Option<PathBuf>,

    /// Load options from a JSON file
    #[arg(short = 'j', long = "config-json", value_name = "FILE")]
    pub config_json: Option<PathBuf>,

    /// Look for .autogitpull.yaml/.json under the root
    #[arg(long = "auto-config")]
    pub auto_config: bool,

    /// Re-read the config file between scan cycles when it changes
    #[arg(long = "auto-reload-config")]
    pub auto_reload_config: bool,

    // ── logging & diagnostics ───────────────────────────────────────────
    /// Directory for per-pull logs
    #[arg(short = 'd', long = "log-dir", value_name = "PATH")]
    pub log_dir: Option<PathBuf>,

    /// General log file
    #[arg(short = 'l', long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(long)]
    pub verbose: bool,

    /// Rotate the log file beyond this size
    #[arg(long = "max-log-size", value_parser = bytes_arg, value_name = "BYTES")]
    pub max_log_size: Option<u64>,

    /// Write the log as JSON lines
    #[arg(long = "json-log")]
    pub json_log: bool,

    /// Gzip rotated log files
    #[arg(long = "compress-logs")]
    pub compress_logs: bool,

    /// Log per-cycle memory deltas
    #[arg(long = "debug-memory")]
    pub debug_memory: bool,

    /// Dump container contents when they grow large
    #[arg(long = "dump-state")]
    pub dump_state: bool,

    /// Threshold for --dump-state
    #[arg(long = "dump-large", value_name = "N")]
    pub dump_large: Option<usize>,

    // ── trackers ────────────────────────────────────────────────────────
    /// CPU usage polling interval (seconds)
    #[arg(long = "cpu-poll", value_name = "SEC")]
    pub cpu_poll: Option<u64>,

    /// Memory polling interval (seconds)
    #[arg(long = "mem-poll", value_name = "SEC")]
    pub mem_poll: Option<u64>,

    /// Thread-count polling interval (seconds)
    #[arg(long = "thread-poll", value_name = "SEC")]
    pub thread_poll: Option<u64>,

    /// Disable the CPU tracker readout
    #[arg(long = "no-cpu-tracker")]
    pub no_cpu_tracker: bool,

    /// Disable the memory tracker readout
    #[arg(long = "no-mem-tracker")]
    pub no_mem_tracker: bool,

    /// Disable the thread tracker readout
    #[arg(long = "no-thread-tracker")]
    pub no_thread_tracker: bool,

    /// Track cumulative network usage
    #[arg(long = "net-tracker")]
    pub net_tracker: bool,

    // ── display ─────────────────────────────────────────────────────────
    /// Show skipped repositories in the output
    #[arg(short = 'k', long = "show-skipped")]
    pub show_skipped: bool,

    /// Show non-repository directories in the output
    #[arg(long = "show-notgit")]
    pub show_notgit: bool,

    /// Display the program version in the TUI header
    #[arg(long = "show-version")]
    pub show_version: bool,

    /// Display elapsed runtime
    #[arg(long = "show-runtime")]
    pub show_runtime: bool,

    /// Show each repo's last commit date
    #[arg(long = "show-commit-date")]
    pub show_commit_date: bool,

    /// Show each repo's last commit author
    #[arg(long = "show-commit-author")]
    pub show_commit_author: bool,

    /// Name the author when reporting a pull in CLI mode
    #[arg(long = "show-pull-author")]
    pub show_pull_author: bool,

    /// Show the repository count in the status line
    #[arg(long = "show-repo-count")]
    pub show_repo_count: bool,

    /// Disable colored output
    #[arg(long = "no-colors")]
    pub no_colors: bool,

    /// Mask repository names (optionally with a custom character)
    #[arg(long = "censor-names", num_args = 0..=1, default_missing_value = "*", value_name = "CHAR")]
    pub censor_names: Option<char>,

    // ── history ─────────────────────────────────────────────────────────
    /// Record each invocation in the history file
    #[arg(long = "enable-history")]
    pub enable_history: bool,

    /// History file name (relative to the root)
    #[arg(long = "history-file", value_name = "NAME")]
    pub history_file: Option<String>,

    // ── ignore-file maintenance ─────────────────────────────────────────
    /// Add a pattern to the root's ignore file and exit
    #[arg(long = "add-ignore", value_name = "DIR")]
    pub add_ignore: Option<String>,

    /// Remove a pattern from the root's ignore file and exit
    #[arg(long = "remove-ignore", value_name = "DIR")]
    pub remove_ignore: Option<String>,

    /// Empty the root's ignore file and exit
    #[arg(long = "clear-ignores")]
    pub clear_ignores: bool,

    /// List non-repository directories that are ignore candidates and exit
    #[arg(long = "find-ignores")]
    pub find_ignores: bool,

    // ── mutant mode ─────────────────────────────────────────────────────
    /// Adaptive mode: skip unchanged repos, tune the pull timeout
    #[arg(long)]
    pub mutant: bool,

    /// Acknowledge mutant mode's persistent state file
    #[arg(long = "confirm-mutant")]
    pub confirm_mutant: bool,

    /// Reload a previous mutant state file without re-confirming
    #[arg(long = "recover-mutant")]
    pub recover_mutant: bool,

    /// Mutant state file location
    #[arg(long = "mutant-config", value_name = "FILE")]
    pub mutant_config: Option<PathBuf>,

    // ── safety ──────────────────────────────────────────────────────────
    /// Acknowledge alert-worthy settings (short intervals, force-pull)
    #[arg(long = "confirm-alert")]
    pub confirm_alert: bool,

    /// Acknowledge everything; no prompts
    #[arg(long = "sudo-su")]
    pub sudo_su: bool,

    /// Delete logs, configs, lock and history under the root
    #[arg(long = "hard-reset")]
    pub hard_reset: bool,

    /// Required confirmation for --hard-reset
    #[arg(long = "confirm-reset")]
    pub confirm_reset: bool,

    /// Remove the root's lock file and exit
    #[arg(short = 'R', long = "remove-lock")]
    pub remove_lock: bool,

    /// Start even when a lock file is present
    #[arg(long = "ignore-lock")]
    pub ignore_lock: bool,
}

/// Fold defaults, config files, and CLI flags into an [`Options`] snapshot.
pub fn build_options(cli: Cli) -> Result<Options> {
    let mut opts = Options::default();

    let root = cli
        .root
        .clone()
        .or_else(|| cli.root_path.clone())
        .map(expand_home);

    // Config files come first so explicit flags win.
    if let Some(path) = &cli.config_yaml {
        let cfg = config::load_yaml_config(&expand_home(path.clone()))?;
        config::apply_config(&mut opts, &cfg)?;
        opts.config_file = expand_home(path.clone());
    }
    if let Some(path) = &cli.config_json {
        let cfg = config::load_json_config(&expand_home(path.clone()))?;
        config::apply_config(&mut opts, &cfg)?;
        opts.config_file = expand_home(path.clone());
    }
    if cli.auto_config {
        let dir = root
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
        if let Some((path, cfg)) = config::auto_config(&dir)? {
            config::apply_config(&mut opts, &cfg)?;
            opts.config_file = path;
        }
    }
    opts.auto_config = cli.auto_config;
    opts.auto_reload_config = cli.auto_reload_config;

    if let Some(root) = root {
        opts.root = root;
    }

    if let Some(v) = cli.interval {
        opts.interval = v;
    }
    if let Some(ms) = cli.refresh_rate {
        opts.refresh_ms = Duration::from_millis(ms.max(1));
    }
    if cli.single_run {
        opts.single_run = true;
    }
    if cli.silent {
        opts.silent = true;
    }
    if cli.cli {
        opts.cli = true;
    }
    if cli.recursive {
        opts.recursive_scan = true;
    }
    if let Some(v) = cli.max_depth {
        opts.max_depth = v;
    }
    opts.ignore_dirs.extend(cli.ignore.iter().cloned());
    opts.include_dirs
        .extend(cli.include_dir.iter().cloned().map(expand_home));
    if let Some(v) = cli.remote {
        opts.remote_name = v;
    }
    if let Some(v) = cli.pull_ref {
        opts.pull_ref = Some(v);
    }
    if let Some(v) = cli.max_runtime {
        opts.runtime_limit = v;
    }

    if cli.include_private {
        opts.include_private = true;
    }
    if cli.force_pull {
        opts.force_pull = true;
    }
    if cli.check_only {
        opts.check_only = true;
    }
    if cli.dry_run {
        opts.dry_run = true;
    }
    if cli.no_hash_check {
        opts.hash_check = false;
    }

    if let Some(v) = cli.concurrency {
        if v == 0 {
            bail!("--concurrency must be at least 1");
        }
        opts.limits.concurrency = v;
    }
    if cli.single_thread {
        opts.limits.concurrency = 1;
    }
    if let Some(v) = cli.max_threads {
        opts.limits.max_threads = v;
    }
    if let Some(v) = cli.cpu_percent {
        if !(0.0..=100.0).contains(&v) {
            bail!("--cpu-percent must be between 0 and 100");
        }
        opts.limits.cpu_percent_limit = v;
    }
    if let Some(mask) = &cli.cpu_cores {
        config::apply_config_key(&mut opts, "cpu-cores", mask)?;
    }
    if let Some(v) = cli.mem_limit {
        opts.limits.mem_limit_mb = v >> 20;
    }
    if let Some(v) = cli.download_limit {
        opts.limits.download_limit_kbps = v >> 10;
    }
    if let Some(v) = cli.upload_limit {
        opts.limits.upload_limit_kbps = v >> 10;
    }
    if let Some(v) = cli.disk_limit {
        opts.limits.disk_limit_kbps = v >> 10;
    }
    if let Some(v) = cli.pull_timeout {
        opts.limits.pull_timeout = v;
    }
    if cli.exit_on_timeout {
        opts.limits.exit_on_timeout = true;
    }

    if let Some(v) = cli.ssh_public_key {
        opts.ssh_public_key = expand_home(v);
    }
    if let Some(v) = cli.ssh_private_key {
        opts.ssh_private_key = expand_home(v);
    }
    if let Some(v) = cli.credential_file {
        opts.credential_file = expand_home(v);
    }
    if let Some(v) = cli.proxy {
        opts.proxy_url = v;
    }

    if cli.retry_skipped {
        opts.retry_skipped = true;
    }
    if cli.reset_skipped {
        opts.reset_skipped = true;
    }
    if cli.skip_accessible_errors {
        opts.skip_accessible_errors = true;
    }
    if cli.dont_skip_timeouts {
        opts.limits.skip_timeout = false;
    }
    if cli.dont_skip_unavailable {
        opts.skip_unavailable = false;
    }
    if cli.keep_first_valid {
        opts.keep_first_valid = true;
    }
    if let Some(limit) = cli.wait_empty {
        opts.wait_empty = true;
        opts.wait_empty_limit = limit;
    }
    if let Some(v) = cli.updated_since {
        opts.updated_since = v;
    }
    if let Some(mins) = cli.rescan_new {
        opts.rescan_new = true;
        opts.rescan_interval = Duration::from_secs(mins.max(1) * 60);
    }
    if let Some(v) = cli.post_pull_hook {
        opts.post_pull_hook = expand_home(v);
    }

    if let Some(name) = cli.persist {
        opts.service.persist = true;
        if !name.is_empty() {
            opts.service.attach_name = name;
        }
    }
    if let Some(limit) = &cli.respawn_limit {
        let (max, mins) = parse::parse_respawn_limit(limit)
            .ok_or_else(|| anyhow::anyhow!("invalid --respawn-limit: {}", limit))?;
        opts.service.respawn_max = max;
        opts.service.respawn_window = Duration::from_secs(mins * 60);
    }
    if let Some(v) = cli.respawn_delay {
        opts.service.respawn_delay = v;
    }
    if let Some(v) = cli.attach {
        opts.service.attach_name = v;
    }
    if let Some(v) = cli.background {
        opts.service.run_background = true;
        opts.service.attach_name = v;
    }
    if let Some(v) = cli.reattach {
        opts.service.reattach = true;
        opts.service.attach_name = v;
    }
    if cli.list_instances {
        opts.service.list_instances = true;
    }
    if cli.kill_all {
        opts.service.kill_all = true;
    }

    if let Some(v) = cli.log_dir {
        opts.logging.log_dir = expand_home(v);
    }
    if let Some(v) = cli.log_file {
        opts.logging.log_file = expand_home(v);
    }
    if let Some(level) = &cli.log_level {
        opts.logging.log_level = level
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid --log-level: {}", level))?;
    }
    if cli.verbose {
        opts.logging.log_level = log::LevelFilter::Debug;
    }
    if let Some(v) = cli.max_log_size {
        opts.logging.max_log_size = v;
    }
    if cli.json_log {
        opts.logging.json_log = true;
    }
    if cli.compress_logs {
        opts.logging.compress_logs = true;
    }
    if cli.debug_memory {
        opts.debug_memory = true;
    }
    if cli.dump_state {
        opts.dump_state = true;
    }
    if let Some(v) = cli.dump_large {
        opts.dump_threshold = v;
    }

    if let Some(v) = cli.cpu_poll {
        opts.limits.cpu_poll_sec = v.max(1);
    }
    if let Some(v) = cli.mem_poll {
        opts.limits.mem_poll_sec = v.max(1);
    }
    if let Some(v) = cli.thread_poll {
        opts.limits.thread_poll_sec = v.max(1);
    }
    if cli.no_cpu_tracker {
        opts.cpu_tracker = false;
    }
    if cli.no_mem_tracker {
        opts.mem_tracker = false;
    }
    if cli.no_thread_tracker {
        opts.thread_tracker = false;
    }
    if cli.net_tracker {
        opts.net_tracker = true;
    }

    if cli.show_skipped {
        opts.show_skipped = true;
    }
    if cli.show_notgit {
        opts.show_notgit = true;
    }
    if cli.show_version {
        opts.show_version = true;
    }
    if cli.show_runtime {
        opts.show_runtime = true;
    }
    if cli.show_commit_date {
        opts.show_commit_date = true;
    }
    if cli.show_commit_author {
        opts.show_commit_author = true;
    }
    if cli.show_pull_author {
        opts.show_pull_author = true;
    }
    if cli.show_repo_count {
        opts.show_repo_count = true;
    }
    if cli.no_colors {
        opts.no_colors = true;
    }
    if let Some(ch) = cli.censor_names {
        opts.censor_names = true;
        opts.censor_char = ch;
    }

    if cli.enable_history {
        opts.enable_history = true;
    }
    if let Some(v) = cli.history_file {
        opts.history_file = v;
    }

    if cli.mutant {
        opts.mutant_mode = true;
    }
    if cli.confirm_mutant {
        opts.confirm_mutant = true;
    }
    if cli.recover_mutant {
        opts.recover_mutant = true;
    }
    if let Some(v) = cli.mutant_config {
        opts.mutant_config = expand_home(v);
    }

    if cli.confirm_alert {
        opts.confirm_alert = true;
    }
    if cli.sudo_su {
        opts.sudo_su = true;
    }
    if cli.hard_reset {
        opts.hard_reset = true;
    }
    if cli.confirm_reset {
        opts.confirm_reset = true;
    }
    if cli.remove_lock {
        opts.remove_lock = true;
    }
    if cli.ignore_lock {
        opts.ignore_lock = true;
    }

    Ok(opts)
}
