// SPDX-License-Identifier: Apache-2.0

//! Per-input execution order: `prepare()` clears this run's feature stores,
//! the target runs, `post_process()` turns whatever it touched into a
//! feature vector. Counter features take precedence over the plain PC
//! bitset when both would otherwise fire for the same site, since the
//! bitset carries strictly less information.

use std::time::Instant;

use centipede_core::feature::{self, Domain, Feature};
use centipede_core::protocol::Stats;

use crate::callbacks::TargetCallbacks;
use crate::state::{self, global};
use crate::watchdog;

/// Instrumentation hook: record a counter increment at `pc_index`.
pub fn record_counter(pc_index: usize) {
    let counters = &global().counters;
    if let Some(c) = counters.get(pc_index % counters.len().max(1)) {
        let _ = c.fetch_update(
            std::sync::atomic::Ordering::Relaxed,
            std::sync::atomic::Ordering::Relaxed,
            |v| Some(v.saturating_add(1)),
        );
    }
}

/// Instrumentation hook: record a data-flow observation (e.g. a byte read
/// from input at some memory-access site, hashed by the caller into a
/// stable local index).
pub fn record_data_flow(local: u64) {
    global().data_flow.set((local as usize) % (1 << 18));
}

/// Instrumentation hook: record a comparison observed at `pc`.
pub fn record_cmp(pc: u64, x: u64, y: u64) {
    let f = feature::cmp_feature(pc, x, y);
    let local = feature::convert_from(Domain::Cmp, f);
    global().cmp.set((local as usize) % (1 << 18));
}

/// Instrumentation hook: record a control-flow step, updating this
/// thread's path ring buffer and the resulting `BoundedPath` bit.
pub fn record_path_step(pc_index: u64) {
    let h = state::push_path(pc_index);
    let path = &global().path;
    path.set((h as usize) % path.len());
}

fn post_process(use_pc_counters: bool) -> Vec<Feature> {
    let g = global();
    let mut out = Vec::new();

    for (i, c) in g.counters.iter().enumerate() {
        let v = c.swap(0, std::sync::atomic::Ordering::Relaxed);
        if v != 0 && use_pc_counters {
            out.push(feature::counter_feature(i as u64, v));
        }
    }
    if !use_pc_counters {
        for bit in g.pc.iter_set_bits() {
            out.push(feature::counter_feature(bit, 1));
        }
    }
    for bit in g.data_flow.iter_set_bits() {
        out.push(feature::convert_to(Domain::DataFlow, bit));
    }
    for bit in g.cmp.iter_set_bits() {
        out.push(feature::convert_to(Domain::Cmp, bit));
    }
    for bit in g.path.iter_set_bits() {
        out.push(feature::convert_to(Domain::BoundedPath, bit));
    }
    out
}

fn prepare() {
    global().clear_all();
    state::reset_path();
}

/// Run one input through `prepare → reset_timer → test_one_input →
/// post_process`, returning its feature vector (`None` if rejected) and
/// timing stats. `use_pc_counters` selects whether quantized counters or
/// the cheaper presence bitset backs `PcCounters` features.
pub fn run_one(
    callbacks: &mut impl TargetCallbacks,
    data: &[u8],
    use_pc_counters: bool,
) -> (Option<Vec<Feature>>, Stats) {
    let prep_start = Instant::now();
    prepare();
    watchdog::reset_timer();
    let prep_usec = prep_start.elapsed().as_micros() as u64;

    let exec_start = Instant::now();
    let accepted = callbacks.test_one_input(data);
    let exec_usec = exec_start.elapsed().as_micros() as u64;

    let post_start = Instant::now();
    let features = if accepted {
        Some(post_process(use_pc_counters))
    } else {
        None
    };
    let post_usec = post_start.elapsed().as_micros() as u64;

    let stats = Stats {
        prep_usec,
        exec_usec,
        post_usec,
        peak_rss_mb: watchdog::current_rss_mb(),
    };
    (features, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::AcceptAll;

    /// `prepare()` clears a single process-wide state, so tests in this
    /// module serialize on it rather than risk one test's counters leaking
    /// into another's assertions.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    struct RecordsOneCounter;

    impl TargetCallbacks for RecordsOneCounter {
        fn test_one_input(&mut self, data: &[u8]) -> bool {
            record_counter(data.first().copied().unwrap_or(0) as usize);
            true
        }
    }

    struct RejectsEverything;

    impl TargetCallbacks for RejectsEverything {
        fn test_one_input(&mut self, _data: &[u8]) -> bool {
            false
        }
    }

    #[test]
    fn accepted_input_yields_features() {
        let _guard = TEST_LOCK.lock().unwrap();
        let mut cb = RecordsOneCounter;
        let (features, _stats) = run_one(&mut cb, &[5], true);
        let features = features.unwrap();
        assert!(!features.is_empty());
        assert!(features
            .iter()
            .all(|f| feature::domain_of(*f) == Domain::PcCounters));
    }

    #[test]
    fn rejected_input_yields_no_features() {
        let _guard = TEST_LOCK.lock().unwrap();
        let mut cb = RejectsEverything;
        let (features, _stats) = run_one(&mut cb, &[1, 2, 3], true);
        assert!(features.is_none());
    }

    #[test]
    fn successive_runs_do_not_leak_counters_across_inputs() {
        let _guard = TEST_LOCK.lock().unwrap();
        let mut cb = RecordsOneCounter;
        let (f1, _) = run_one(&mut cb, &[5], true);
        let (f2, _) = run_one(&mut cb, &[9], true);
        assert_ne!(f1, f2);
    }

    #[test]
    fn accept_all_still_reports_stats() {
        let _guard = TEST_LOCK.lock().unwrap();
        let mut cb = AcceptAll;
        let (_features, stats) = run_one(&mut cb, &[1], true);
        assert_eq!(stats.peak_rss_mb, watchdog::current_rss_mb().max(stats.peak_rss_mb));
    }
}
