//! Completion-token bookkeeping.
//!
//! Every asynchronous operation is represented by an [`EventId`] handed out by
//! [`EventLedger::next`]. The event stays *outstanding* until [`EventLedger::dispatch`] retires
//! it, at which point blocked waiters wake up and dependency joins whose watched set became
//! empty fire.
//!
//! Dispatch and join evaluation happen under one mutex so a join never observes a partially
//! updated set. Join callbacks always run after the mutex is released; they are free to call
//! back into the ledger (allocate, dispatch, register further joins).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::debug;

use crate::types::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("event {0} is not outstanding")]
    UnknownEvent(EventId),
}

type JoinCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Waiter {
    dispatched: Mutex<bool>,
    cv: Condvar,
}

struct WaiterSlot {
    waiter: Arc<Waiter>,
    waiting: usize,
}

struct Join {
    remaining: HashSet<EventId>,
    callback: JoinCallback,
}

struct LedgerState {
    next_event: u64,
    outstanding: HashSet<EventId>,
    waiters: HashMap<EventId, WaiterSlot>,
    next_join: u64,
    joins: HashMap<u64, Join>,
    joins_by_event: HashMap<EventId, Vec<u64>>,
}

pub struct EventLedger {
    state: Mutex<LedgerState>,
    throw_on_missing_event: AtomicBool,
}

impl EventLedger {
    pub fn new(throw_on_missing_event: bool) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                next_event: 1,
                outstanding: HashSet::new(),
                waiters: HashMap::new(),
                next_join: 0,
                joins: HashMap::new(),
                joins_by_event: HashMap::new(),
            }),
            throw_on_missing_event: AtomicBool::new(throw_on_missing_event),
        }
    }

    /// Switch between strict mode (dispatching an unknown event fails) and tolerant mode
    /// (it is ignored). Teardown runs in tolerant mode.
    pub fn set_throw_on_missing_event(&self, throw: bool) {
        self.throw_on_missing_event.store(throw, Ordering::Relaxed);
    }

    /// Allocate a fresh outstanding event.
    pub fn next(&self) -> EventId {
        let mut st = self.state.lock();
        let ev = EventId(st.next_event);
        st.next_event += 1;
        st.outstanding.insert(ev);
        ev
    }

    pub fn is_outstanding(&self, event: EventId) -> bool {
        self.state.lock().outstanding.contains(&event)
    }

    pub fn outstanding_count(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    pub fn pending_join_count(&self) -> usize {
        self.state.lock().joins.len()
    }

    /// Retire `event`, wake its waiters and run every join it completes.
    pub fn dispatch(&self, event: EventId) -> Result<(), LedgerError> {
        let (waiter, ready) = {
            let mut st = self.state.lock();
            if !st.outstanding.remove(&event) {
                if self.throw_on_missing_event.load(Ordering::Relaxed) {
                    return Err(LedgerError::UnknownEvent(event));
                }
                debug!(%event, "ignoring dispatch of an event that is not outstanding");
                return Ok(());
            }

            let waiter = st.waiters.remove(&event).map(|slot| slot.waiter);

            let mut ready = Vec::new();
            if let Some(ids) = st.joins_by_event.remove(&event) {
                for id in ids {
                    let complete = match st.joins.get_mut(&id) {
                        Some(join) => {
                            join.remaining.remove(&event);
                            join.remaining.is_empty()
                        }
                        None => false,
                    };
                    if complete {
                        if let Some(join) = st.joins.remove(&id) {
                            ready.push(join.callback);
                        }
                    }
                }
            }
            (waiter, ready)
        };

        if let Some(waiter) = waiter {
            *waiter.dispatched.lock() = true;
            waiter.cv.notify_all();
        }
        for callback in ready {
            callback();
        }
        Ok(())
    }

    /// Block until `event` is dispatched or `timeout` elapses. Returns `false` on timeout.
    pub fn block_until_dispatched(&self, event: EventId, timeout: Duration) -> bool {
        let waiter = {
            let mut st = self.state.lock();
            if !st.outstanding.contains(&event) {
                return true;
            }
            let slot = st.waiters.entry(event).or_insert_with(|| WaiterSlot {
                waiter: Arc::new(Waiter::default()),
                waiting: 0,
            });
            slot.waiting += 1;
            Arc::clone(&slot.waiter)
        };

        let dispatched = {
            let mut done = waiter.dispatched.lock();
            match Instant::now().checked_add(timeout) {
                Some(deadline) => {
                    while !*done {
                        if waiter.cv.wait_until(&mut done, deadline).timed_out() {
                            break;
                        }
                    }
                }
                None => {
                    while !*done {
                        waiter.cv.wait(&mut done);
                    }
                }
            }
            *done
        };

        // Dispatch already removed the slot; on timeout drop it once the last waiter leaves.
        let mut st = self.state.lock();
        if let Some(slot) = st.waiters.get_mut(&event) {
            if Arc::ptr_eq(&slot.waiter, &waiter) {
                slot.waiting -= 1;
                if slot.waiting == 0 {
                    st.waiters.remove(&event);
                }
            }
        }
        dispatched
    }

    /// Run `callback` once every event in `watched` has been dispatched.
    ///
    /// If nothing in `watched` is outstanding the callback runs immediately on the calling
    /// thread. Otherwise it runs on whichever thread dispatches the last watched event.
    pub fn add_dependency_join<I, F>(&self, watched: I, callback: F)
    where
        I: IntoIterator<Item = EventId>,
        F: FnOnce() + Send + 'static,
    {
        let mut st = self.state.lock();
        let remaining: HashSet<EventId> = watched
            .into_iter()
            .filter(|ev| st.outstanding.contains(ev))
            .collect();
        if remaining.is_empty() {
            drop(st);
            callback();
            return;
        }

        let id = st.next_join;
        st.next_join += 1;
        for ev in &remaining {
            st.joins_by_event.entry(*ev).or_default().push(id);
        }
        st.joins.insert(
            id,
            Join {
                remaining,
                callback: Box::new(callback),
            },
        );
    }

    /// Drop every pending join without running it. Returns how many were dropped.
    pub fn clear_joins(&self) -> usize {
        let dropped: Vec<Join> = {
            let mut st = self.state.lock();
            st.joins_by_event.clear();
            st.joins.drain().map(|(_, join)| join).collect()
        };
        dropped.len()
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl std::fmt::Debug for EventLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("EventLedger")
            .field("next_event", &st.next_event)
            .field("outstanding", &st.outstanding.len())
            .field("joins", &st.joins.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn next_is_strictly_increasing() {
        let ledger = EventLedger::new(true);
        let mut prev = ledger.next();
        for _ in 0..1000 {
            let ev = ledger.next();
            assert!(ev > prev);
            prev = ev;
        }
        assert_eq!(ledger.outstanding_count(), 1001);
    }

    #[test]
    fn next_is_unique_across_threads() {
        let ledger = Arc::new(EventLedger::new(true));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || (0..250).map(|_| ledger.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = HashSet::new();
        for h in handles {
            for ev in h.join().expect("thread join") {
                assert!(all.insert(ev), "duplicate {ev}");
            }
        }
        assert_eq!(all.len(), 1000);
    }

    #[test]
    fn second_dispatch_fails_in_strict_mode() {
        let ledger = EventLedger::new(true);
        let ev = ledger.next();
        ledger.dispatch(ev).unwrap();
        assert_eq!(ledger.dispatch(ev), Err(LedgerError::UnknownEvent(ev)));
        assert!(ledger.block_until_dispatched(ev, Duration::ZERO));
    }

    #[test]
    fn tolerant_mode_ignores_missing_events() {
        let ledger = EventLedger::new(false);
        ledger.dispatch(EventId(12345)).unwrap();

        ledger.set_throw_on_missing_event(true);
        assert!(ledger.dispatch(EventId(12345)).is_err());
    }

    #[test]
    fn wait_times_out_and_cleans_up_waiter() {
        let ledger = EventLedger::new(true);
        let ev = ledger.next();
        assert!(!ledger.block_until_dispatched(ev, Duration::from_millis(10)));
        assert_eq!(ledger.waiter_count(), 0);
        assert!(ledger.is_outstanding(ev));
    }

    #[test]
    fn waiter_wakes_on_dispatch_from_other_thread() {
        let ledger = Arc::new(EventLedger::new(true));
        let ev = ledger.next();
        let waiter = {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || ledger.block_until_dispatched(ev, Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        ledger.dispatch(ev).unwrap();
        assert!(waiter.join().expect("thread join"));
        assert_eq!(ledger.waiter_count(), 0);
    }

    #[test]
    fn join_fires_once_after_all_watched_events() {
        let ledger = Arc::new(EventLedger::new(true));
        let a = ledger.next();
        let b = ledger.next();
        let c = ledger.next();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        ledger.add_dependency_join([a, b, c], move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        ledger.dispatch(b).unwrap();
        ledger.dispatch(a).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        ledger.dispatch(c).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.pending_join_count(), 0);
    }

    #[test]
    fn join_over_dispatched_events_runs_immediately() {
        let ledger = EventLedger::new(true);
        let a = ledger.next();
        ledger.dispatch(a).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        ledger.add_dependency_join([a], move || flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));

        let flag = Arc::clone(&fired);
        fired.store(false, Ordering::SeqCst);
        ledger.add_dependency_join(std::iter::empty(), move || flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn join_callback_may_reenter_the_ledger() {
        let ledger = Arc::new(EventLedger::new(true));
        let first = ledger.next();
        let second = ledger.next();

        let inner = Arc::clone(&ledger);
        ledger.add_dependency_join([first], move || {
            inner.dispatch(second).unwrap();
        });
        ledger.dispatch(first).unwrap();
        assert!(!ledger.is_outstanding(second));
    }

    #[test]
    fn cleared_joins_never_fire() {
        let ledger = EventLedger::new(true);
        let a = ledger.next();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        ledger.add_dependency_join([a], move || flag.store(true, Ordering::SeqCst));

        assert_eq!(ledger.clear_joins(), 1);
        ledger.dispatch(a).unwrap();
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(ledger.pending_join_count(), 0);
    }

    #[test]
    fn join_completes_under_concurrent_dispatch() {
        let ledger = Arc::new(EventLedger::new(true));
        let leaves: Vec<_> = (0..8).map(|_| ledger.next()).collect();
        let done = ledger.next();

        let inner = Arc::clone(&ledger);
        ledger.add_dependency_join(leaves.clone(), move || inner.dispatch(done).unwrap());

        let handles: Vec<_> = leaves
            .into_iter()
            .map(|ev| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.dispatch(ev).unwrap())
            })
            .collect();
        for h in handles {
            h.join().expect("thread join");
        }
        assert!(ledger.block_until_dispatched(done, Duration::from_secs(5)));
        assert_eq!(ledger.outstanding_count(), 0);
    }
}
