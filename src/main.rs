use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use autogitpull::cli::{build_options, Cli};
use autogitpull::config::Options;
use autogitpull::history::append_history;
use autogitpull::mutant::Mutant;
use autogitpull::scanner::{read_ignore_file, write_ignore_file};
use autogitpull::supervisor::run_with_monitor;
use autogitpull::{git, lock};

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

/// One-shot ignore-file edits requested on the command line.
struct IgnoreMaintenance {
    add: Option<String>,
    remove: Option<String>,
    clear: bool,
    find: bool,
}

impl IgnoreMaintenance {
    fn requested(&self) -> bool {
        self.add.is_some() || self.remove.is_some() || self.clear || self.find
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let invocation: Vec<String> = std::env::args().skip(1).collect();
    let maintenance = IgnoreMaintenance {
        add: cli.add_ignore.clone(),
        remove: cli.remove_ignore.clone(),
        clear: cli.clear_ignores,
        find: cli.find_ignores,
    };
    let mut opts = build_options(cli)?;

    git::set_global_proxy(&opts.proxy_url);
    if !opts.limits.pull_timeout.is_zero() {
        git::set_global_timeout(opts.limits.pull_timeout);
    }

    if opts.enable_history {
        let file = history_path(&opts);
        if let Err(e) = append_history(&file, &invocation.join(" ")) {
            eprintln!("failed to record history in {}: {}", file.display(), e);
        }
    }

    if let Some(code) = handle_one_shot_commands(&opts)? {
        return Ok(code);
    }
    if let Some(code) = handle_ignore_maintenance(&opts, &maintenance)? {
        return Ok(code);
    }

    if opts.needs_alert_confirmation() && !opts.alerts_allowed() {
        if opts.interval < std::time::Duration::from_secs(15) {
            eprintln!("WARNING: --interval below 15s may overwhelm remote repositories");
        }
        if opts.force_pull {
            eprintln!("WARNING: --force-pull discards uncommitted changes and untracked files");
        }
        eprintln!("Re-run with --confirm-alert or --sudo-su to proceed");
        return Ok(1);
    }

    let mutant = if opts.mutant_mode {
        if !opts.confirm_mutant && !opts.recover_mutant {
            eprintln!("Mutant mode keeps state in {}", Mutant::state_path(&opts).display());
            eprintln!("Re-run with --confirm-mutant to proceed");
            return Ok(1);
        }
        Mutant::apply(&mut opts).map(Arc::new)
    } else {
        None
    };

    Ok(run_with_monitor(opts, mutant).await)
}

fn history_path(opts: &Options) -> PathBuf {
    if opts.root.as_os_str().is_empty() {
        PathBuf::from(&opts.history_file)
    } else {
        opts.root.join(&opts.history_file)
    }
}

/// Commands that act and exit without entering the monitoring loop.
/// Returns the exit code when one of them ran.
fn handle_one_shot_commands(opts: &Options) -> Result<Option<i32>> {
    if opts.service.list_instances {
        for (name, pid) in lock::find_running_instances() {
            println!("{} {}", name, pid);
        }
        return Ok(Some(0));
    }

    if opts.remove_lock {
        if !opts.root.as_os_str().is_empty() {
            lock::release_lock_file(&opts.root.join(lock::LOCK_FILE_NAME));
        }
        return Ok(Some(0));
    }

    if opts.service.kill_all {
        if opts.root.as_os_str().is_empty() {
            bail!("--kill-all requires a root path");
        }
        let lock_path = opts.root.join(lock::LOCK_FILE_NAME);
        match lock::read_lock_pid(&lock_path) {
            Some(pid) if lock::process_running(pid) => {
                if lock::terminate_process(pid) {
                    lock::release_lock_file(&lock_path);
                    println!("Terminated process {}", pid);
                } else {
                    eprintln!("Failed to terminate process {}", pid);
                    return Ok(Some(1));
                }
            }
            _ => println!("No running instance"),
        }
        return Ok(Some(0));
    }

    if opts.hard_reset {
        eprintln!("WARNING: --hard-reset permanently removes logs, configs, and lock files");
        if !opts.confirm_reset {
            eprintln!("Re-run with --confirm-reset to proceed");
            return Ok(Some(1));
        }
        perform_hard_reset(opts);
        println!("Reset complete");
        return Ok(Some(0));
    }

    Ok(None)
}

fn perform_hard_reset(opts: &Options) {
    if !opts.logging.log_file.as_os_str().is_empty() {
        let _ = std::fs::remove_file(&opts.logging.log_file);
    }
    if !opts.logging.log_dir.as_os_str().is_empty() {
        let _ = std::fs::remove_dir_all(&opts.logging.log_dir);
    }
    if !opts.root.as_os_str().is_empty() {
        let _ = std::fs::remove_file(opts.root.join(lock::LOCK_FILE_NAME));
        let _ = std::fs::remove_file(opts.root.join(".autogitpull.yaml"));
        let _ = std::fs::remove_file(opts.root.join(".autogitpull.json"));
        let _ = std::fs::remove_file(opts.root.join(&opts.history_file));
    }
}

fn handle_ignore_maintenance(
    opts: &Options,
    maintenance: &IgnoreMaintenance,
) -> Result<Option<i32>> {
    if !maintenance.requested() {
        return Ok(None);
    }
    if opts.root.as_os_str().is_empty() {
        bail!("ignore maintenance requires a root path");
    }
    let file = opts.root.join(".autogitpull.ignore");
    let mut entries = read_ignore_file(&file);

    if maintenance.clear {
        entries.clear();
        write_ignore_file(&file, &entries)?;
        println!("Cleared {}", file.display());
        return Ok(Some(0));
    }
    if let Some(pattern) = &maintenance.add {
        let p = PathBuf::from(pattern);
        if !entries.contains(&p) {
            entries.push(p);
            write_ignore_file(&file, &entries)?;
        }
        println!("Added {} to {}", pattern, file.display());
        return Ok(Some(0));
    }
    if let Some(pattern) = &maintenance.remove {
        let p = PathBuf::from(pattern);
        entries.retain(|e| *e != p);
        write_ignore_file(&file, &entries)?;
        println!("Removed {} from {}", pattern, file.display());
        return Ok(Some(0));
    }
    // --find-ignores: directories under the root that are not repositories,
    // the usual candidates for the ignore file.
    for path in autogitpull::event_loop::discover(opts) {
        if !git::is_git_repo(&path) {
            println!("{}", path.display());
        }
    }
    Ok(Some(0))
}
