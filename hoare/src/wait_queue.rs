//! First-in, first-out queues of parked callers.
//!
//! A [WaitQueue] exists for every guarded operation of a monitor and holds the callers blocked on
//! that operation.  The [EntryQueue] records, across all operations, the order in which callers
//! blocked.  Both live inside the monitor's coordination state and are only touched with its lock
//! held.

use std::collections::VecDeque;
use std::sync::Arc;

use biometrics::Counter;

use crate::condition_stack::Signal;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static WAIT_QUEUE_LINK: Counter = Counter::new("hoare.wait_queue.link");
static WAIT_QUEUE_UNLINK: Counter = Counter::new("hoare.wait_queue.unlink");
static WAIT_QUEUE_NOTIFY: Counter = Counter::new("hoare.wait_queue.notify");
static WAIT_QUEUE_NOTIFY_DROPPED: Counter = Counter::new("hoare.wait_queue.notify_dropped");

/// Register biometrics for the wait queues.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&WAIT_QUEUE_LINK);
    collector.register_counter(&WAIT_QUEUE_UNLINK);
    collector.register_counter(&WAIT_QUEUE_NOTIFY);
    collector.register_counter(&WAIT_QUEUE_NOTIFY_DROPPED);
}

///////////////////////////////////////////// WaitQueue ////////////////////////////////////////////

/// The callers blocked on one guarded operation.
///
/// `pending` counts callers from the moment they link until they [WaitQueue::unlink] after
/// waking.  A caller that has been notified but has not yet re-acquired the lock is still pending,
/// but it is no longer eligible to be notified again.
#[derive(Debug)]
pub struct WaitQueue {
    name: &'static str,
    pending: usize,
    waiters: VecDeque<Arc<Signal>>,
}

impl WaitQueue {
    /// Create an empty wait queue for the operation `name`.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: 0,
            waiters: VecDeque::new(),
        }
    }

    /// The operation this queue belongs to.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The number of callers blocked on this operation.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// True iff some caller is parked and has not been notified yet.
    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Enqueue a caller.  The caller must [Signal::wait] on the returned signal and then call
    /// [WaitQueue::unlink] once it re-acquires the lock.
    pub fn link(&mut self) -> Arc<Signal> {
        WAIT_QUEUE_LINK.click();
        let signal = Arc::new(Signal::new());
        self.pending += 1;
        self.waiters.push_back(Arc::clone(&signal));
        signal
    }

    /// Account for a woken caller leaving the queue.
    pub fn unlink(&mut self) {
        WAIT_QUEUE_UNLINK.click();
        assert!(self.pending > 0, "unlink on wait queue {} with nothing pending", self.name);
        self.pending -= 1;
    }

    /// Release the longest-waiting caller.  Returns false if nobody was parked.
    pub fn notify(&mut self) -> bool {
        match self.waiters.pop_front() {
            Some(signal) => {
                WAIT_QUEUE_NOTIFY.click();
                signal.release();
                true
            }
            None => {
                WAIT_QUEUE_NOTIFY_DROPPED.click();
                false
            }
        }
    }
}

//////////////////////////////////////////// EntryQueue ////////////////////////////////////////////

/// The arrival order of blocked callers, recorded by operation index.
#[derive(Debug, Default)]
pub struct EntryQueue {
    entries: VecDeque<usize>,
}

impl EntryQueue {
    /// Create an empty entry queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of blocked callers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True iff no caller is blocked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a caller of `operation` blocking.
    pub fn push(&mut self, operation: usize) {
        self.entries.push_back(operation);
    }

    /// The operation of the earliest blocked caller.
    pub fn front(&self) -> Option<usize> {
        self.entries.front().copied()
    }

    /// Remove the earliest entry for `operation`.  Callers of one operation wake in arrival order,
    /// so the earliest entry is always the one belonging to the woken caller.
    pub fn remove(&mut self, operation: usize) -> bool {
        match self.entries.iter().position(|op| *op == operation) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn wait_queue_is_fifo() {
        let mut wq = WaitQueue::new("push");
        assert_eq!("push", wq.name());
        let s0 = wq.link();
        let s1 = wq.link();
        let s2 = wq.link();
        assert_eq!(3, wq.pending());
        assert!(wq.notify());
        assert!(s0.is_released());
        assert!(!s1.is_released());
        assert!(!s2.is_released());
        // Notified callers stay pending until they unlink.
        assert_eq!(3, wq.pending());
        wq.unlink();
        assert_eq!(2, wq.pending());
        assert!(wq.notify());
        assert!(s1.is_released());
        assert!(!s2.is_released());
        assert!(wq.notify());
        assert!(s2.is_released());
        assert!(!wq.has_waiters());
        assert!(!wq.notify());
        wq.unlink();
        wq.unlink();
        assert_eq!(0, wq.pending());
    }

    #[test]
    #[should_panic]
    fn unlink_without_pending() {
        let mut wq = WaitQueue::new("pop");
        wq.unlink();
    }

    #[test]
    fn entry_queue_removes_earliest() {
        let mut eq = EntryQueue::new();
        assert_eq!(None, eq.front());
        eq.push(1);
        eq.push(0);
        eq.push(1);
        eq.push(2);
        assert_eq!(4, eq.len());
        assert_eq!(Some(1), eq.front());
        assert!(eq.remove(1));
        assert_eq!(Some(0), eq.front());
        assert!(eq.remove(1));
        assert!(!eq.remove(1));
        assert!(eq.remove(0));
        assert_eq!(Some(2), eq.front());
        assert!(eq.remove(2));
        assert!(eq.is_empty());
    }

    #[test]
    fn woken_in_arrival_order() {
        struct State {
            wq: WaitQueue,
            woken: Vec<usize>,
        }
        let state = std::sync::Arc::new(Mutex::new(State {
            wq: WaitQueue::new("op"),
            woken: Vec::new(),
        }));
        let mut threads = Vec::new();
        for idx in 0..8 {
            let state_p = std::sync::Arc::clone(&state);
            threads.push(std::thread::spawn(move || {
                let mut guard = state_p.lock().unwrap();
                let signal = guard.wq.link();
                let mut guard = signal.wait(guard);
                guard.wq.unlink();
                guard.woken.push(idx);
            }));
            while state.lock().unwrap().wq.pending() < idx + 1 {
                std::thread::yield_now();
            }
        }
        for idx in 0..8 {
            assert!(state.lock().unwrap().wq.notify());
            while state.lock().unwrap().woken.len() < idx + 1 {
                std::thread::yield_now();
            }
        }
        for thread in threads.into_iter() {
            thread.join().unwrap();
        }
        let state = state.lock().unwrap();
        assert_eq!((0..8).collect::<Vec<_>>(), state.woken);
        assert_eq!(0, state.wq.pending());
    }
}
