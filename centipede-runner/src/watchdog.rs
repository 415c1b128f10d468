// SPDX-License-Identifier: Apache-2.0

//! Watchdog thread: catches a hung or memory-runaway target the way a
//! forked child's own `test_one_input` never would (it's the one thread
//! stuck). Runs only when a timeout or RSS limit is configured; polls once
//! a second and reports a failure description before exiting the process.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();
static LAST_RESET_MS: AtomicU64 = AtomicU64::new(0);

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

fn now_ms() -> u64 {
    epoch().elapsed().as_millis() as u64
}

/// Mark the start of a new `test_one_input` call; the watchdog measures
/// hangs relative to this mark.
pub fn reset_timer() {
    LAST_RESET_MS.store(now_ms(), Ordering::Relaxed);
}

fn elapsed_since_reset() -> Duration {
    Duration::from_millis(now_ms().saturating_sub(LAST_RESET_MS.load(Ordering::Relaxed)))
}

/// Resident set size of the current process in megabytes, read from
/// `/proc/self/status` (Linux-only; returns `0` if unavailable).
pub fn current_rss_mb() -> u64 {
    let mut status = String::new();
    if std::fs::File::open("/proc/self/status")
        .and_then(|mut f| f.read_to_string(&mut status))
        .is_err()
    {
        return 0;
    }
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().unwrap_or(0);
            return kb / 1024;
        }
    }
    0
}

fn write_failure_description(dir: &std::path::Path, reason: &str) {
    let _ = std::fs::create_dir_all(dir);
    let _ = std::fs::write(dir.join("watchdog_failure.txt"), reason);
}

/// Spawn the watchdog thread. Returns immediately; the thread runs for the
/// lifetime of the process. `crash_dir` is where a timeout/RSS failure
/// description is written before the process exits.
pub fn spawn(timeout_in_seconds: u64, rss_limit_mb: u64, crash_dir: std::path::PathBuf) {
    if timeout_in_seconds == 0 && rss_limit_mb == 0 {
        return;
    }
    reset_timer();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(1));
        if timeout_in_seconds > 0 && elapsed_since_reset().as_secs() >= timeout_in_seconds {
            write_failure_description(
                &crash_dir,
                &format!("timeout: no test_one_input progress for {timeout_in_seconds}s"),
            );
            std::process::exit(1);
        }
        if rss_limit_mb > 0 && current_rss_mb() >= rss_limit_mb {
            write_failure_description(
                &crash_dir,
                &format!("rss limit exceeded: >= {rss_limit_mb} MB"),
            );
            std::process::exit(1);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_timer_zeroes_elapsed() {
        reset_timer();
        assert!(elapsed_since_reset().as_millis() < 500);
    }

    #[test]
    fn current_rss_mb_is_nonzero_on_linux() {
        assert!(current_rss_mb() > 0);
    }
}
