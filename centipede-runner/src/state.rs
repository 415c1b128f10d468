// SPDX-License-Identifier: Apache-2.0

//! Runner runtime state (§4.9): the process-wide coverage stores an
//! instrumented target writes into during `test_one_input`, plus the
//! per-thread path ring buffer and the TLS list that enumerates live
//! threads (§9 "Globals": "a process-wide singleton ... plus a per-thread
//! state struct registered into the TLS list at thread start").

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

use centipede_core::feature::PathRingBuffer;

/// Size of the data-flow/cmp/pc/path bit sets (§4.9).
const BITSET_BITS: usize = 1 << 18;
const BITSET_WORDS: usize = BITSET_BITS / 64;

/// Default number of instrumented-edge counters. A real build sizes this
/// from the linker section the sanitizer-coverage ABI emits; that ABI is
/// out of scope here (§1), so this runtime exposes a fixed-capacity table
/// instead.
pub const DEFAULT_NUM_COUNTERS: usize = 1 << 16;

/// A fixed-size, thread-safe bit set backed by atomics (§5 "concurrent
/// fixed-size bit sets").
pub struct AtomicBitSet {
    words: Vec<AtomicU64>,
}

impl AtomicBitSet {
    fn new(bits: usize) -> Self {
        let words = (0..bits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    pub fn set(&self, bit: usize) {
        let word = bit / 64;
        let mask = 1u64 << (bit % 64);
        if word < self.words.len() {
            self.words[word].fetch_or(mask, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        for w in &self.words {
            w.store(0, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.words.len() * 64
    }

    /// Iterate indices of every set bit.
    pub fn iter_set_bits(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(word_idx, w)| {
            let word = w.load(Ordering::Relaxed);
            (0..64).filter_map(move |bit| {
                if word & (1u64 << bit) != 0 {
                    Some((word_idx * 64 + bit) as u64)
                } else {
                    None
                }
            })
        })
    }
}

/// Process-wide coverage stores (§4.9). Lifetime tied to the whole process
/// (§9).
pub struct GlobalRunnerState {
    pub counters: Vec<AtomicU8>,
    pub data_flow: AtomicBitSet,
    pub cmp: AtomicBitSet,
    pub pc: AtomicBitSet,
    pub path: AtomicBitSet,
    pub thread_list: Mutex<Vec<std::thread::ThreadId>>,
}

impl GlobalRunnerState {
    fn new() -> Self {
        Self {
            counters: (0..DEFAULT_NUM_COUNTERS).map(|_| AtomicU8::new(0)).collect(),
            data_flow: AtomicBitSet::new(BITSET_BITS),
            cmp: AtomicBitSet::new(BITSET_BITS),
            pc: AtomicBitSet::new(BITSET_BITS),
            path: AtomicBitSet::new(BITSET_BITS),
            thread_list: Mutex::new(Vec::new()),
        }
    }

    pub fn register_thread(&self) {
        self.thread_list.lock().expect("lock poisoned").push(std::thread::current().id());
    }

    pub fn unregister_thread(&self) {
        let id = std::thread::current().id();
        self.thread_list
            .lock()
            .expect("lock poisoned")
            .retain(|t| *t != id);
    }

    /// Clear every feature store enabled by `enabled` flags (§4.9
    /// "prepare()").
    pub fn clear_all(&self) {
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
        self.data_flow.clear();
        self.cmp.clear();
        self.pc.clear();
        self.path.clear();
    }
}

static GLOBAL: OnceLock<GlobalRunnerState> = OnceLock::new();

pub fn global() -> &'static GlobalRunnerState {
    GLOBAL.get_or_init(GlobalRunnerState::new)
}

thread_local! {
    static PATH_RING: std::cell::RefCell<PathRingBuffer> = std::cell::RefCell::new(PathRingBuffer::new());
}

/// Per-thread runtime state registered into the TLS list at thread start
/// (§5 "TLS list").
pub struct ThreadGuard;

impl ThreadGuard {
    pub fn new() -> Self {
        global().register_thread();
        Self
    }
}

impl Default for ThreadGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        global().unregister_thread();
    }
}

/// Push `pc_index` onto this thread's path ring buffer and return the
/// resulting hash, used to derive `BoundedPath` features.
pub fn push_path(pc_index: u64) -> u64 {
    PATH_RING.with(|ring| ring.borrow_mut().push(pc_index))
}

pub fn reset_path() {
    PATH_RING.with(|ring| ring.borrow_mut().reset());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_round_trips_set_bits() {
        let set = AtomicBitSet::new(256);
        set.set(3);
        set.set(200);
        let bits: Vec<u64> = set.iter_set_bits().collect();
        assert_eq!(bits, vec![3, 200]);
    }

    #[test]
    fn clear_resets_bitset() {
        let set = AtomicBitSet::new(64);
        set.set(5);
        set.clear();
        assert!(set.iter_set_bits().next().is_none());
    }

    #[test]
    fn global_state_thread_registration() {
        let guard = ThreadGuard::new();
        assert!(global()
            .thread_list
            .lock()
            .unwrap()
            .contains(&std::thread::current().id()));
        drop(guard);
        assert!(!global()
            .thread_list
            .lock()
            .unwrap()
            .contains(&std::thread::current().id()));
    }
}
