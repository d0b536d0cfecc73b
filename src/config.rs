//! Options model and configuration file loading.
//!
//! An [`Options`] value is an immutable snapshot for the duration of a scan
//! cycle. It is assembled from the CLI surface, optionally overlaid with a
//! YAML or JSON config file whose scalar keys mirror the long flag names,
//! and whose `repositories` section maps canonical paths to per-repo
//! override tables.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::parse::{parse_bytes, parse_duration, parse_respawn_limit};

/// Per-repository overrides, each falling back to the global default when
/// absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoOverrides {
    pub force_pull: Option<bool>,
    pub exclude: Option<bool>,
    pub check_only: Option<bool>,
    pub cpu_limit: Option<f64>,
    pub download_limit_kbps: Option<u64>,
    pub upload_limit_kbps: Option<u64>,
    pub disk_limit_kbps: Option<u64>,
    pub max_runtime: Option<Duration>,
    pub pull_timeout: Option<Duration>,
    pub post_pull_hook: Option<PathBuf>,
    pub pull_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub log_level: log::LevelFilter,
    pub log_dir: PathBuf,
    pub log_file: PathBuf,
    pub max_log_size: u64,
    pub json_log: bool,
    pub compress_logs: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        LoggingOptions {
            log_level: log::LevelFilter::Info,
            log_dir: PathBuf::new(),
            log_file: PathBuf::new(),
            max_log_size: 0,
            json_log: false,
            compress_logs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub cpu_poll_sec: u64,
    pub mem_poll_sec: u64,
    pub thread_poll_sec: u64,
    pub concurrency: usize,
    pub max_threads: usize,
    pub cpu_percent_limit: f64,
    pub cpu_core_mask: u64,
    pub mem_limit_mb: u64,
    pub download_limit_kbps: u64,
    pub upload_limit_kbps: u64,
    pub disk_limit_kbps: u64,
    pub pull_timeout: Duration,
    pub skip_timeout: bool,
    pub exit_on_timeout: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            cpu_poll_sec: 5,
            mem_poll_sec: 5,
            thread_poll_sec: 5,
            concurrency: 1,
            max_threads: 0,
            cpu_percent_limit: 0.0,
            cpu_core_mask: 0,
            mem_limit_mb: 0,
            download_limit_kbps: 0,
            upload_limit_kbps: 0,
            disk_limit_kbps: 0,
            pull_timeout: Duration::ZERO,
            skip_timeout: true,
            exit_on_timeout: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    pub persist: bool,
    pub respawn_max: u32,
    pub respawn_window: Duration,
    pub respawn_delay: Duration,
    pub attach_name: String,
    pub run_background: bool,
    pub reattach: bool,
    pub kill_all: bool,
    pub list_instances: bool,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub root: PathBuf,
    pub include_dirs: Vec<PathBuf>,
    pub ignore_dirs: Vec<PathBuf>,
    pub recursive_scan: bool,
    pub max_depth: usize,
    pub remote_name: String,
    pub pull_ref: Option<String>,
    pub include_private: bool,
    pub check_only: bool,
    pub dry_run: bool,
    pub hash_check: bool,
    pub force_pull: bool,

    pub interval: Duration,
    pub refresh_ms: Duration,
    pub runtime_limit: Duration,
    pub updated_since: Duration,

    pub cli: bool,
    pub silent: bool,
    pub single_run: bool,

    pub limits: ResourceLimits,
    pub logging: LoggingOptions,
    pub service: ServiceOptions,

    pub ssh_public_key: PathBuf,
    pub ssh_private_key: PathBuf,
    pub credential_file: PathBuf,
    pub proxy_url: String,

    pub retry_skipped: bool,
    pub reset_skipped: bool,
    pub skip_accessible_errors: bool,
    pub skip_unavailable: bool,
    pub wait_empty: bool,
    pub wait_empty_limit: u32,
    pub keep_first_valid: bool,
    pub rescan_new: bool,
    pub rescan_interval: Duration,
    pub post_pull_hook: PathBuf,

    // Presentation toggles consumed by the status renderers.
    pub show_skipped: bool,
    pub show_notgit: bool,
    pub show_version: bool,
    pub show_runtime: bool,
    pub show_commit_date: bool,
    pub show_commit_author: bool,
    pub show_pull_author: bool,
    pub show_repo_count: bool,
    pub no_colors: bool,
    pub censor_names: bool,
    pub censor_char: char,

    pub cpu_tracker: bool,
    pub mem_tracker: bool,
    pub thread_tracker: bool,
    pub net_tracker: bool,

    pub debug_memory: bool,
    pub dump_state: bool,
    pub dump_threshold: usize,

    pub enable_history: bool,
    pub history_file: String,

    pub config_file: PathBuf,
    pub auto_config: bool,
    pub auto_reload_config: bool,

    pub mutant_mode: bool,
    pub confirm_mutant: bool,
    pub recover_mutant: bool,
    pub mutant_config: PathBuf,

    pub confirm_alert: bool,
    pub sudo_su: bool,
    pub hard_reset: bool,
    pub confirm_reset: bool,
    pub remove_lock: bool,
    pub ignore_lock: bool,

    pub repo_settings: BTreeMap<PathBuf, RepoOverrides>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            root: PathBuf::new(),
            include_dirs: Vec::new(),
            ignore_dirs: Vec::new(),
            recursive_scan: false,
            max_depth: 0,
            remote_name: "origin".to_string(),
            pull_ref: None,
            include_private: false,
            check_only: false,
            dry_run: false,
            hash_check: true,
            force_pull: false,
            interval: Duration::from_secs(30),
            refresh_ms: Duration::from_millis(250),
            runtime_limit: Duration::ZERO,
            updated_since: Duration::ZERO,
            cli: false,
            silent: false,
            single_run: false,
            limits: ResourceLimits::default(),
            logging: LoggingOptions::default(),
            service: ServiceOptions {
                respawn_window: Duration::from_secs(600),
                respawn_delay: Duration::from_secs(1),
                ..ServiceOptions::default()
            },
            ssh_public_key: PathBuf::new(),
            ssh_private_key: PathBuf::new(),
            credential_file: PathBuf::new(),
            proxy_url: String::new(),
            retry_skipped: false,
            reset_skipped: false,
            skip_accessible_errors: false,
            skip_unavailable: true,
            wait_empty: false,
            wait_empty_limit: 0,
            keep_first_valid: false,
            rescan_new: false,
            rescan_interval: Duration::from_secs(300),
            post_pull_hook: PathBuf::new(),
            show_skipped: false,
            show_notgit: false,
            show_version: false,
            show_runtime: false,
            show_commit_date: false,
            show_commit_author: false,
            show_pull_author: false,
            show_repo_count: false,
            no_colors: false,
            censor_names: false,
            censor_char: '*',
            cpu_tracker: true,
            mem_tracker: true,
            thread_tracker: true,
            net_tracker: false,
            debug_memory: false,
            dump_state: false,
            dump_threshold: 0,
            enable_history: false,
            history_file: ".autogitpull.config".to_string(),
            config_file: PathBuf::new(),
            auto_config: false,
            auto_reload_config: false,
            mutant_mode: false,
            confirm_mutant: false,
            recover_mutant: false,
            mutant_config: PathBuf::new(),
            confirm_alert: false,
            sudo_su: false,
            hard_reset: false,
            confirm_reset: false,
            remove_lock: false,
            ignore_lock: false,
            repo_settings: BTreeMap::new(),
        }
    }
}

impl Options {
    /// All discovery roots: the primary root plus any `--include-dir`s.
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut v = Vec::with_capacity(1 + self.include_dirs.len());
        if !self.root.as_os_str().is_empty() {
            v.push(self.root.clone());
        }
        v.extend(self.include_dirs.iter().cloned());
        v
    }

    /// Worker count after applying the `--max-threads` cap.
    pub fn effective_concurrency(&self) -> usize {
        let mut c = self.limits.concurrency.max(1);
        if self.limits.max_threads > 0 {
            c = c.min(self.limits.max_threads);
        }
        c
    }

    pub fn overrides_for(&self, path: &Path) -> RepoOverrides {
        self.repo_settings.get(path).cloned().unwrap_or_default()
    }

    /// Whether alert-worthy configurations were acknowledged.
    pub fn alerts_allowed(&self) -> bool {
        self.confirm_alert || self.sudo_su
    }

    /// Combinations that can hammer remotes or destroy local work require an
    /// explicit acknowledgement before the loop starts.
    pub fn needs_alert_confirmation(&self) -> bool {
        self.interval < Duration::from_secs(15) || self.force_pull
    }
}

/// Expand `~` and `$HOME` prefixes to the user's home directory.
pub fn expand_home(path: PathBuf) -> PathBuf {
    let home = dirs::home_dir().unwrap_or_default();
    let s = path.to_string_lossy();
    if let Some(stripped) = s.strip_prefix("~/") {
        return home.join(stripped);
    }
    if s == "~" || s == "$HOME" {
        return home;
    }
    if let Some(stripped) = s.strip_prefix("$HOME/") {
        return home.join(stripped);
    }
    path
}

/// Flattened config-file contents: scalar keys plus the `repositories` map.
#[derive(Debug, Default)]
pub struct ConfigMap {
    pub scalars: BTreeMap<String, String>,
    pub repositories: BTreeMap<String, BTreeMap<String, String>>,
}

fn yaml_scalar_to_string(v: &serde_yaml::Value) -> Option<String> {
    match v {
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn json_scalar_to_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

pub fn load_yaml_config(path: &Path) -> Result<ConfigMap> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("invalid YAML in {}", path.display()))?;
    let mapping = doc
        .as_mapping()
        .ok_or_else(|| anyhow!("config root must be a mapping: {}", path.display()))?;

    let mut out = ConfigMap::default();
    for (k, v) in mapping {
        let Some(key) = k.as_str() else { continue };
        if key == "repositories" {
            if let Some(repos) = v.as_mapping() {
                for (rk, rv) in repos {
                    let Some(repo_path) = rk.as_str() else { continue };
                    let mut table = BTreeMap::new();
                    if let Some(fields) = rv.as_mapping() {
                        for (fk, fv) in fields {
                            if let (Some(name), Some(val)) =
                                (fk.as_str(), yaml_scalar_to_string(fv))
                            {
                                table.insert(name.to_string(), val);
                            }
                        }
                    }
                    out.repositories.insert(repo_path.to_string(), table);
                }
            }
            continue;
        }
        match v {
            serde_yaml::Value::Sequence(seq) => {
                // Repeatable keys (`ignore`, `include-dir`) arrive as lists;
                // join with \n and split again in the applier.
                let items: Vec<String> =
                    seq.iter().filter_map(yaml_scalar_to_string).collect();
                out.scalars.insert(key.to_string(), items.join("\n"));
            }
            other => {
                if let Some(val) = yaml_scalar_to_string(other) {
                    out.scalars.insert(key.to_string(), val);
                }
            }
        }
    }
    Ok(out)
}

pub fn load_json_config(path: &Path) -> Result<ConfigMap> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let doc: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    let obj = doc
        .as_object()
        .ok_or_else(|| anyhow!("config root must be an object: {}", path.display()))?;

    let mut out = ConfigMap::default();
    for (key, v) in obj {
        if key == "repositories" {
            if let Some(repos) = v.as_object() {
                for (repo_path, rv) in repos {
                    let mut table = BTreeMap::new();
                    if let Some(fields) = rv.as_object() {
                        for (name, fv) in fields {
                            if let Some(val) = json_scalar_to_string(fv) {
                                table.insert(name.clone(), val);
                            }
                        }
                    }
                    out.repositories.insert(repo_path.clone(), table);
                }
            }
            continue;
        }
        match v {
            serde_json::Value::Array(seq) => {
                let items: Vec<String> =
                    seq.iter().filter_map(json_scalar_to_string).collect();
                out.scalars.insert(key.clone(), items.join("\n"));
            }
            other => {
                if let Some(val) = json_scalar_to_string(other) {
                    out.scalars.insert(key.clone(), val);
                }
            }
        }
    }
    Ok(out)
}

/// Load whichever of `.autogitpull.yaml` / `.autogitpull.json` exists under
/// `dir`, if any.
pub fn auto_config(dir: &Path) -> Result<Option<(PathBuf, ConfigMap)>> {
    let yaml = dir.join(".autogitpull.yaml");
    if yaml.is_file() {
        return Ok(Some((yaml.clone(), load_yaml_config(&yaml)?)));
    }
    let json = dir.join(".autogitpull.json");
    if json.is_file() {
        return Ok(Some((json.clone(), load_json_config(&json)?)));
    }
    Ok(None)
}

/// Load a config file by extension-appropriate parser.
pub fn load_config_file(path: &Path) -> Result<ConfigMap> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => load_json_config(path),
        _ => load_yaml_config(path),
    }
}

fn truthy(value: &str) -> bool {
    !matches!(value, "false" | "0" | "no" | "off")
}

fn parse_flag(value: &str) -> bool {
    truthy(value.trim())
}

/// Apply one config-file key to the options. Keys mirror long flag names,
/// with or without the `--` prefix.
pub fn apply_config_key(opts: &mut Options, key: &str, value: &str) -> Result<()> {
    let key = key.trim_start_matches("--");
    let dur = |v: &str| {
        parse_duration(v).ok_or_else(|| anyhow!("invalid duration for {}: {}", key, v))
    };
    let bytes =
        |v: &str| parse_bytes(v).ok_or_else(|| anyhow!("invalid size for {}: {}", key, v));
    match key {
        "root" => opts.root = expand_home(PathBuf::from(value)),
        "interval" => opts.interval = dur(value)?,
        "refresh-rate" => {
            let ms: u64 = value.parse().context("invalid --refresh-rate")?;
            opts.refresh_ms = Duration::from_millis(ms.max(1));
        }
        "max-runtime" => opts.runtime_limit = dur(value)?,
        "updated-since" => opts.updated_since = dur(value)?,
        "recursive" => opts.recursive_scan = parse_flag(value),
        "max-depth" => opts.max_depth = value.parse().context("invalid --max-depth")?,
        "ignore" => {
            for line in value.lines().filter(|l| !l.trim().is_empty()) {
                opts.ignore_dirs.push(PathBuf::from(line.trim()));
            }
        }
        "include-dir" => {
            for line in value.lines().filter(|l| !l.trim().is_empty()) {
                opts.include_dirs.push(expand_home(PathBuf::from(line.trim())));
            }
        }
        "remote" => opts.remote_name = value.to_string(),
        "pull-ref" => opts.pull_ref = Some(value.to_string()),
        "include-private" => opts.include_private = parse_flag(value),
        "check-only" => opts.check_only = parse_flag(value),
        "dry-run" => opts.dry_run = parse_flag(value),
        "no-hash-check" => opts.hash_check = !parse_flag(value),
        "force-pull" | "discard-dirty" => opts.force_pull = parse_flag(value),
        "cli" => opts.cli = parse_flag(value),
        "silent" => opts.silent = parse_flag(value),
        "single-run" => opts.single_run = parse_flag(value),
        "concurrency" | "threads" => {
            opts.limits.concurrency = value.parse().context("invalid --concurrency")?
        }
        "single-thread" => {
            if parse_flag(value) {
                opts.limits.concurrency = 1;
            }
        }
        "max-threads" => opts.limits.max_threads = value.parse().context("invalid --max-threads")?,
        "cpu-percent" => {
            let pct: f64 = value.parse().context("invalid --cpu-percent")?;
            if !(0.0..=100.0).contains(&pct) {
                bail!("--cpu-percent must be between 0 and 100");
            }
            opts.limits.cpu_percent_limit = pct;
        }
        "cpu-cores" => {
            opts.limits.cpu_core_mask = match value.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).context("invalid --cpu-cores mask")?,
                None => value.parse().context("invalid --cpu-cores mask")?,
            }
        }
        "mem-limit" => opts.limits.mem_limit_mb = bytes(value)? >> 20,
        "download-limit" => opts.limits.download_limit_kbps = bytes(value)? >> 10,
        "upload-limit" => opts.limits.upload_limit_kbps = bytes(value)? >> 10,
        "disk-limit" => opts.limits.disk_limit_kbps = bytes(value)? >> 10,
        "pull-timeout" => opts.limits.pull_timeout = dur(value)?,
        "exit-on-timeout" => opts.limits.exit_on_timeout = parse_flag(value),
        "dont-skip-timeouts" => opts.limits.skip_timeout = !parse_flag(value),
        "dont-skip-unavailable" => opts.skip_unavailable = !parse_flag(value),
        "skip-accessible-errors" => opts.skip_accessible_errors = parse_flag(value),
        "retry-skipped" => opts.retry_skipped = parse_flag(value),
        "reset-skipped" => opts.reset_skipped = parse_flag(value),
        "keep-first-valid" => opts.keep_first_valid = parse_flag(value),
        "wait-empty" => {
            opts.wait_empty = true;
            if let Ok(n) = value.parse() {
                opts.wait_empty_limit = n;
            }
        }
        "rescan-new" => {
            opts.rescan_new = true;
            if let Ok(mins) = value.parse::<u64>() {
                opts.rescan_interval = Duration::from_secs(mins * 60);
            }
        }
        "post-pull-hook" => opts.post_pull_hook = expand_home(PathBuf::from(value)),
        "ssh-public-key" => opts.ssh_public_key = expand_home(PathBuf::from(value)),
        "ssh-private-key" => opts.ssh_private_key = expand_home(PathBuf::from(value)),
        "credential-file" => opts.credential_file = expand_home(PathBuf::from(value)),
        "proxy" => opts.proxy_url = value.to_string(),
        "log-dir" => opts.logging.log_dir = expand_home(PathBuf::from(value)),
        "log-file" => opts.logging.log_file = expand_home(PathBuf::from(value)),
        "log-level" => {
            opts.logging.log_level = value
                .to_ascii_uppercase()
                .parse()
                .map_err(|_| anyhow!("invalid --log-level: {}", value))?
        }
        "verbose" => {
            if parse_flag(value) {
                opts.logging.log_level = log::LevelFilter::Debug;
            }
        }
        "max-log-size" => opts.logging.max_log_size = bytes(value)?,
        "json-log" => opts.logging.json_log = parse_flag(value),
        "compress-logs" => opts.logging.compress_logs = parse_flag(value),
        "debug-memory" => opts.debug_memory = parse_flag(value),
        "dump-state" => opts.dump_state = parse_flag(value),
        "dump-large" => opts.dump_threshold = value.parse().context("invalid --dump-large")?,
        "cpu-poll" => opts.limits.cpu_poll_sec = value.parse().context("invalid --cpu-poll")?,
        "mem-poll" => opts.limits.mem_poll_sec = value.parse().context("invalid --mem-poll")?,
        "thread-poll" => {
            opts.limits.thread_poll_sec = value.parse().context("invalid --thread-poll")?
        }
        "no-cpu-tracker" => opts.cpu_tracker = !parse_flag(value),
        "no-mem-tracker" => opts.mem_tracker = !parse_flag(value),
        "no-thread-tracker" => opts.thread_tracker = !parse_flag(value),
        "net-tracker" => opts.net_tracker = parse_flag(value),
        "show-skipped" => opts.show_skipped = parse_flag(value),
        "show-notgit" => opts.show_notgit = parse_flag(value),
        "show-version" => opts.show_version = parse_flag(value),
        "show-runtime" => opts.show_runtime = parse_flag(value),
        "show-commit-date" => opts.show_commit_date = parse_flag(value),
        "show-commit-author" => opts.show_commit_author = parse_flag(value),
        "show-pull-author" => opts.show_pull_author = parse_flag(value),
        "show-repo-count" => opts.show_repo_count = parse_flag(value),
        "no-colors" => opts.no_colors = parse_flag(value),
        "censor-names" => opts.censor_names = parse_flag(value),
        "enable-history" => opts.enable_history = parse_flag(value),
        "history-file" => opts.history_file = value.to_string(),
        "persist" => {
            if value == "false" {
                opts.service.persist = false;
            } else {
                opts.service.persist = true;
                if !value.is_empty() && value != "true" {
                    opts.service.attach_name = value.to_string();
                }
            }
        }
        "respawn-limit" => {
            let (max, mins) = parse_respawn_limit(value)
                .ok_or_else(|| anyhow!("invalid --respawn-limit: {}", value))?;
            opts.service.respawn_max = max;
            opts.service.respawn_window = Duration::from_secs(mins * 60);
        }
        "respawn-delay" => opts.service.respawn_delay = dur(value)?,
        "attach" => opts.service.attach_name = value.to_string(),
        "background" => {
            opts.service.run_background = true;
            opts.service.attach_name = value.to_string();
        }
        "reattach" => {
            opts.service.reattach = true;
            opts.service.attach_name = value.to_string();
        }
        "mutant" => opts.mutant_mode = parse_flag(value),
        "confirm-mutant" => opts.confirm_mutant = parse_flag(value),
        "recover-mutant" => opts.recover_mutant = parse_flag(value),
        "mutant-config" => opts.mutant_config = expand_home(PathBuf::from(value)),
        "confirm-alert" => opts.confirm_alert = parse_flag(value),
        "sudo-su" => opts.sudo_su = parse_flag(value),
        other => bail!("unknown configuration key: {}", other),
    }
    Ok(())
}

fn apply_override_key(ov: &mut RepoOverrides, key: &str, value: &str) -> Result<()> {
    let key = key.trim_start_matches("--");
    match key {
        "force-pull" => ov.force_pull = Some(parse_flag(value)),
        "exclude" => ov.exclude = Some(parse_flag(value)),
        "check-only" => ov.check_only = Some(parse_flag(value)),
        "cpu-limit" | "cpu-percent" => {
            ov.cpu_limit = Some(value.parse().context("invalid cpu-limit")?)
        }
        "download-limit" => {
            ov.download_limit_kbps =
                Some(parse_bytes(value).ok_or_else(|| anyhow!("invalid download-limit"))? >> 10)
        }
        "upload-limit" => {
            ov.upload_limit_kbps =
                Some(parse_bytes(value).ok_or_else(|| anyhow!("invalid upload-limit"))? >> 10)
        }
        "disk-limit" => {
            ov.disk_limit_kbps =
                Some(parse_bytes(value).ok_or_else(|| anyhow!("invalid disk-limit"))? >> 10)
        }
        "max-runtime" => {
            ov.max_runtime =
                Some(parse_duration(value).ok_or_else(|| anyhow!("invalid max-runtime"))?)
        }
        "pull-timeout" => {
            ov.pull_timeout =
                Some(parse_duration(value).ok_or_else(|| anyhow!("invalid pull-timeout"))?)
        }
        "post-pull-hook" => ov.post_pull_hook = Some(expand_home(PathBuf::from(value))),
        "pull-ref" => ov.pull_ref = Some(value.to_string()),
        other => bail!("unknown repository override key: {}", other),
    }
    Ok(())
}

/// Overlay a parsed config file onto an options value.
pub fn apply_config(opts: &mut Options, cfg: &ConfigMap) -> Result<()> {
    for (key, value) in &cfg.scalars {
        apply_config_key(opts, key, value)
            .with_context(|| format!("config key {:?}", key))?;
    }
    for (repo, table) in &cfg.repositories {
        let path = expand_home(PathBuf::from(repo));
        let canonical = std::fs::canonicalize(&path).unwrap_or(path);
        let ov = opts.repo_settings.entry(canonical).or_default();
        for (key, value) in table {
            apply_override_key(ov, key, value)
                .with_context(|| format!("repository {:?}, key {:?}", repo, key))?;
        }
    }
    Ok(())
}
