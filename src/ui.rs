//! Status presenters: the ratatui frame for TUI mode and the line-block
//! renderer for CLI mode. Both read the same snapshot of the repo table.

use ratatui::{
    layout::{Constraint, Layout},
    style::{Color, Modifier, Style},
    widgets::{Block, Cell, Paragraph, Row, Table},
    Frame,
};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::Options;
use crate::repo::{RepoInfo, RepoStatus};
use crate::resources::{NetUsage, Probes};

/// One tick's worth of tracker readings for the footer.
#[derive(Debug, Default)]
pub struct TrackerSample {
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<u64>,
    pub thread_count: Option<u64>,
    pub net: Option<NetUsage>,
    pub affinity: String,
}

impl TrackerSample {
    pub fn collect(probes: &Probes, opts: &Options) -> Self {
        TrackerSample {
            cpu_percent: opts.cpu_tracker.then(|| probes.cpu_percent()),
            memory_mb: opts.mem_tracker.then(|| probes.memory_mb()),
            thread_count: opts.thread_tracker.then(|| probes.thread_count()),
            net: opts.net_tracker.then(|| probes.network_usage()),
            affinity: if opts.limits.cpu_core_mask != 0 {
                crate::resources::cpu_affinity_description()
            } else {
                String::new()
            },
        }
    }
}

/// Everything the presenters need for one frame, captured under the map
/// lock and rendered outside it.
pub struct StatusView<'a> {
    pub paths: &'a [PathBuf],
    pub infos: &'a BTreeMap<PathBuf, RepoInfo>,
    pub seconds_left: u64,
    pub scanning: bool,
    pub action: &'a str,
    pub runtime_sec: Option<u64>,
}

fn censor(name: &str, opts: &Options) -> String {
    if opts.censor_names {
        opts.censor_char.to_string().repeat(name.chars().count())
    } else {
        name.to_string()
    }
}

fn visible(info: &RepoInfo, opts: &Options) -> bool {
    match info.status {
        RepoStatus::Skipped => opts.show_skipped,
        RepoStatus::NotGit => opts.show_notgit,
        _ => true,
    }
}

/// Render the CLI status block: a header line plus one line per repo.
pub fn cli_status_block(view: &StatusView<'_>, opts: &Options) -> String {
    let mut out = String::new();
    out.push_str("Status: ");
    if view.scanning {
        out.push_str(view.action);
    } else {
        out.push_str("Idle");
    }
    out.push_str(&format!(" - Next scan in {}s", view.seconds_left));
    if let Some(rt) = view.runtime_sec {
        out.push_str(&format!(" - Runtime {}s", rt));
    }
    if opts.show_repo_count {
        out.push_str(&format!(" - {} repos", view.paths.len()));
    }
    out.push('\n');

    for path in view.paths {
        let fallback;
        let info = match view.infos.get(path) {
            Some(i) => i,
            None => {
                fallback = RepoInfo::new(path.clone());
                &fallback
            }
        };
        if !visible(info, opts) {
            continue;
        }
        out.push_str(&format!(
            " [{}] {}",
            info.status.label(),
            censor(&info.name(), opts)
        ));
        if !info.branch.is_empty() {
            out.push_str(&format!(" ({}", info.branch));
            if !info.commit.is_empty() {
                out.push_str(&format!("@{}", info.commit));
            }
            out.push(')');
        }
        if opts.show_commit_date && !info.commit_date.is_empty() {
            out.push_str(&format!(" [{}]", info.commit_date));
        }
        if opts.show_commit_author && !info.commit_author.is_empty() {
            out.push_str(&format!(" <{}>", info.commit_author));
        }
        if !info.message.is_empty() {
            out.push_str(&format!(" - {}", info.message));
        }
        if info.status == RepoStatus::Pulling {
            out.push_str(&format!(" ({}%)", info.progress));
        }
        if info.auth_failed {
            out.push_str(" [AUTH]");
        }
        out.push('\n');
    }
    out
}

fn status_color(status: RepoStatus) -> Color {
    match status {
        RepoStatus::UpToDate | RepoStatus::PullOk | RepoStatus::PkgLockFixed => Color::Green,
        RepoStatus::Pulling | RepoStatus::Checking | RepoStatus::Pending => Color::Cyan,
        RepoStatus::Dirty | RepoStatus::RemoteAhead => Color::Yellow,
        RepoStatus::Error
        | RepoStatus::HeadProblem
        | RepoStatus::Timeout
        | RepoStatus::RateLimit
        | RepoStatus::TempFail => Color::Red,
        RepoStatus::Skipped | RepoStatus::NotGit => Color::DarkGray,
    }
}

/// Full TUI redraw: header, repo table, tracker footer.
pub fn render(frame: &mut Frame, view: &StatusView<'_>, opts: &Options, trackers: &TrackerSample) {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Fill(1),
        Constraint::Length(1),
    ])
    .split(frame.area());

    let mut title = String::from("autogitpull");
    if opts.show_version {
        title.push_str(&format!(" v{}", env!("CARGO_PKG_VERSION")));
    }
    let mut header = format!(
        "{}\nNext scan in {}s - {}",
        title,
        view.seconds_left,
        if view.scanning { view.action } else { "Idle" }
    );
    if let Some(rt) = view.runtime_sec {
        header.push_str(&format!(" - runtime {}s", rt));
    }
    frame.render_widget(Paragraph::new(header).block(Block::bordered()), chunks[0]);

    let rows: Vec<Row> = view
        .paths
        .iter()
        .filter_map(|path| {
            let fallback;
            let info = match view.infos.get(path) {
                Some(i) => i,
                None => {
                    fallback = RepoInfo::new(path.clone());
                    &fallback
                }
            };
            if !visible(info, opts) {
                return None;
            }
            let mut message = info.message.clone();
            if info.status == RepoStatus::Pulling {
                message.push_str(&format!(" ({}%)", info.progress));
            }
            if info.auth_failed {
                message.push_str(" [AUTH]");
            }
            let style = if opts.no_colors {
                Style::default()
            } else {
                Style::default().fg(status_color(info.status))
            };
            Some(Row::new(vec![
                Cell::from(info.status.label()).style(style.add_modifier(Modifier::BOLD)),
                Cell::from(censor(&info.name(), opts)),
                Cell::from(info.branch.clone()),
                Cell::from(info.commit.clone()),
                Cell::from(message),
            ]))
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(9),
            Constraint::Length(24),
            Constraint::Length(16),
            Constraint::Length(8),
            Constraint::Fill(1),
        ],
    )
    .header(
        Row::new(vec!["STATUS", "NAME", "BRANCH", "COMMIT", "MESSAGE"])
            .style(Style::default().add_modifier(Modifier::BOLD)),
    )
    .block(Block::bordered().title(" Repositories "));
    frame.render_widget(table, chunks[1]);

    let mut footer = Vec::new();
    if let Some(cpu) = trackers.cpu_percent {
        footer.push(format!("cpu {:.1}%", cpu));
    }
    if let Some(mem) = trackers.memory_mb {
        footer.push(format!("mem {}MB", mem));
    }
    if let Some(threads) = trackers.thread_count {
        footer.push(format!("threads {}", threads));
    }
    if let Some(net) = &trackers.net {
        footer.push(format!("net ↓{}B ↑{}B", net.down_bytes, net.up_bytes));
    }
    if !trackers.affinity.is_empty() {
        footer.push(format!("cores {}", trackers.affinity));
    }
    frame.render_widget(Paragraph::new(footer.join("   ")), chunks[2]);
}
