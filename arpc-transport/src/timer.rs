use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Sweep keys for the per-subsystem connection cleanups; the role index is
/// added so client- and server-side handlers sharing one manager never
/// collide.
pub const TIMER_KEY_RELIABLE_SWEEP_BASE: u64 = 0x10;
pub const TIMER_KEY_CC_SWEEP_BASE: u64 = 0x20;
pub const TIMER_KEY_FC_SWEEP_BASE: u64 = 0x30;
pub const TIMER_KEY_REASSEMBLY_SWEEP: u64 = 0x40;
pub const TIMER_KEY_PROXY_SWEEP: u64 = 0x50;
/// Per-message retransmit timers live at `base + RPCID`.
pub const TIMER_KEY_MSG_TIMEOUT_BASE: u64 = 1 << 48;
/// Per-packet congestion timeout timers live at `base + packetID`.
pub const TIMER_KEY_CC_PACKET_TIMEOUT_BASE: u64 = 1 << 49;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerRecord {
    generation: u64,
    period: Option<Duration>,
    callback: TimerCallback,
}

struct HeapEntry {
    deadline: Instant,
    key: u64,
    generation: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    // Inverted so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.generation.cmp(&self.generation))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<HeapEntry>,
    records: HashMap<u64, TimerRecord>,
    next_generation: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// One-shot and periodic timers identified by 64-bit keys.
///
/// A single worker thread drives all callbacks; callbacks run outside the
/// manager's lock and may themselves schedule or stop timers. Installing a
/// key that already exists atomically cancels the previous timer: the old
/// heap entry is invalidated by a generation bump rather than removed.
pub struct TimerManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerManager {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("arpc-timers".to_string())
            .spawn(move || Self::worker_loop(worker_shared))
            .expect("spawning timer worker");
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn worker_loop(shared: Arc<Shared>) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            let next_deadline = state.heap.peek().map(|entry| entry.deadline);
            match next_deadline {
                None => {
                    shared.cond.wait(&mut state);
                }
                Some(deadline) if deadline > now => {
                    shared.cond.wait_until(&mut state, deadline);
                }
                Some(_) => {
                    let entry = state.heap.pop().expect("peeked entry");
                    let state_ref = &mut *state;
                    let fire = match state_ref.records.get(&entry.key) {
                        Some(record) if record.generation == entry.generation => {
                            let callback = record.callback.clone();
                            match record.period {
                                Some(period) => {
                                    state_ref.heap.push(HeapEntry {
                                        deadline: now + period,
                                        key: entry.key,
                                        generation: entry.generation,
                                    });
                                }
                                None => {
                                    state_ref.records.remove(&entry.key);
                                }
                            }
                            Some(callback)
                        }
                        _ => None, // replaced or stopped since scheduling
                    };
                    if let Some(callback) = fire {
                        drop(state);
                        trace!(key = entry.key, "timer fired");
                        callback();
                        state = shared.state.lock();
                    }
                }
            }
        }
    }

    fn install(&self, key: u64, delay: Duration, period: Option<Duration>, callback: TimerCallback) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        state.records.insert(
            key,
            TimerRecord {
                generation,
                period,
                callback,
            },
        );
        state.heap.push(HeapEntry {
            deadline: Instant::now() + delay,
            key,
            generation,
        });
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Schedules a one-shot timer, replacing any timer under the same key.
    pub fn schedule<F>(&self, key: u64, delay: Duration, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.install(key, delay, None, Arc::new(callback));
    }

    /// Schedules a periodic timer first firing after one interval.
    pub fn schedule_periodic<F>(&self, key: u64, interval: Duration, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.install(key, interval, Some(interval), Arc::new(callback));
    }

    /// Cancels the timer under `key`. Returns whether a timer existed.
    pub fn stop(&self, key: u64) -> bool {
        self.shared.state.lock().records.remove(&key).is_some()
    }

    /// Cancels everything and joins the worker, waiting out any callback
    /// currently running.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.records.clear();
            state.heap.clear();
        }
        self.shared.cond.notify_one();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_one_shot_fires_once() {
        let timers = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timers.schedule(100, Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_fires_repeatedly() {
        let timers = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timers.schedule_periodic(101, Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_stop_prevents_fire() {
        let timers = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timers.schedule(102, Duration::from_millis(40), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.stop(102));
        assert!(!timers.stop(102));
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reschedule_replaces() {
        let timers = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let first = fired.clone();
        timers.schedule(103, Duration::from_millis(20), move || {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = fired.clone();
        // Replacing cancels the first timer entirely.
        timers.schedule(103, Duration::from_millis(30), move || {
            second.fetch_add(10, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_shutdown_joins() {
        let timers = TimerManager::new();
        timers.schedule(104, Duration::from_secs(60), || {});
        timers.shutdown();
        // Second shutdown is a no-op.
        timers.shutdown();
    }
}
