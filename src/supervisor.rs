//! Persistence wrapper: re-invokes the event loop when it exits, with a
//! sliding respawn-count window and exponential backoff after failures.

use log::{error, info};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Options;
use crate::event_loop::run_event_loop;
use crate::mutant::Mutant;

/// Cap on the backoff shift so the delay multiplier stays bounded.
const MAX_BACKOFF_SHIFT: u32 = 16;

pub fn backoff_delay(base: Duration, fail_count: u32) -> Duration {
    base * (1u32 << fail_count.min(MAX_BACKOFF_SHIFT))
}

/// Prune starts outside the window and decide whether another respawn is
/// allowed. `starts` already contains the attempt being considered.
pub fn respawn_allowed(
    starts: &mut VecDeque<Instant>,
    now: Instant,
    window: Duration,
    max: u32,
) -> bool {
    while let Some(front) = starts.front() {
        if now.duration_since(*front) > window {
            starts.pop_front();
        } else {
            break;
        }
    }
    max == 0 || starts.len() <= max as usize
}

/// Run the event loop, re-spawning it per the persistence policy. Without
/// `--persist` this is a single pass-through invocation.
pub async fn run_with_monitor(opts: Options, mutant: Option<Arc<Mutant>>) -> i32 {
    if !opts.service.persist {
        return match run_event_loop(opts, mutant).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("{:#}", e);
                1
            }
        };
    }

    let mut starts: VecDeque<Instant> = VecDeque::new();
    let mut fail_count: u32 = 0;
    loop {
        let now = Instant::now();
        starts.push_back(now);
        if !respawn_allowed(
            &mut starts,
            now,
            opts.service.respawn_window,
            opts.service.respawn_max,
        ) {
            error!("Respawn limit reached");
            break;
        }
        let code = match run_event_loop(opts.clone(), mutant.clone()).await {
            Ok(code) => code,
            Err(e) => {
                error!("Worker failed: {:#}", e);
                1
            }
        };
        info!("Worker exited with code {}", code);
        tokio::time::sleep(backoff_delay(opts.service.respawn_delay, fail_count)).await;
        if code != 0 {
            fail_count += 1;
        } else {
            fail_count = 0;
        }
    }
    0
}
