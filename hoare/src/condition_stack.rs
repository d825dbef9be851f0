//! A last-in, first-out condition built from one-shot [Signal]s.
//!
//! A [ConditionStack] lives inside the state protected by a mutex.  Linking and notifying take a
//! mutable borrow of the stack, so neither can happen without holding that mutex.  The most
//! recently linked waiter is always the first one released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, MutexGuard, PoisonError};

use biometrics::Counter;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static SIGNAL_WAIT: Counter = Counter::new("hoare.signal.wait");
static SIGNAL_SPURIOUS_WAKEUP: Counter = Counter::new("hoare.signal.spurious_wakeup");
static SIGNAL_RELEASE: Counter = Counter::new("hoare.signal.release");

static STACK_LINK: Counter = Counter::new("hoare.condition_stack.link");
static STACK_NOTIFY: Counter = Counter::new("hoare.condition_stack.notify");
static STACK_NOTIFY_DROPPED: Counter = Counter::new("hoare.condition_stack.notify_dropped");

/// Register biometrics for signals and condition stacks.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&SIGNAL_WAIT);
    collector.register_counter(&SIGNAL_SPURIOUS_WAKEUP);
    collector.register_counter(&SIGNAL_RELEASE);
    collector.register_counter(&STACK_LINK);
    collector.register_counter(&STACK_NOTIFY);
    collector.register_counter(&STACK_NOTIFY_DROPPED);
}

////////////////////////////////////////////// Signal //////////////////////////////////////////////

/// A one-shot binary signal.  A signal starts out claimed; the thread that owns it parks in
/// [Signal::wait] until some other thread releases it.  Waiting and releasing must both happen
/// under the same mutex, the one protecting the collection the signal is linked into.
#[derive(Debug, Default)]
pub struct Signal {
    cond: Condvar,
    released: AtomicBool,
}

impl Signal {
    /// Create a new, unreleased signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the signal has been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Atomically unlock `guard` and park until the signal is released.  Spurious wakeups from the
    /// underlying condition variable are absorbed; this returns only after a release.
    pub fn wait<'a, M>(&self, mut guard: MutexGuard<'a, M>) -> MutexGuard<'a, M> {
        SIGNAL_WAIT.click();
        while !self.is_released() {
            guard = self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
            if !self.is_released() {
                SIGNAL_SPURIOUS_WAKEUP.click();
            }
        }
        guard
    }

    // Call with the lock held.
    pub(crate) fn release(&self) {
        SIGNAL_RELEASE.click();
        self.released.store(true, Ordering::Release);
        self.cond.notify_one();
    }
}

////////////////////////////////////////// ConditionStack //////////////////////////////////////////

/// [ConditionStack] releases waiters in last-in, first-out order.
#[derive(Debug, Default)]
pub struct ConditionStack {
    waiters: Vec<Arc<Signal>>,
}

impl ConditionStack {
    /// Create a new, empty condition stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of parked waiters.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// True iff nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Push a fresh signal onto the stack.  The caller must subsequently [Signal::wait] on it
    /// using the guard that lent out `self`.
    pub fn link(&mut self) -> Arc<Signal> {
        STACK_LINK.click();
        let signal = Arc::new(Signal::new());
        self.waiters.push(Arc::clone(&signal));
        signal
    }

    /// Release the most recently linked waiter.  Returns false if there was nobody to release.
    pub fn notify(&mut self) -> bool {
        match self.waiters.pop() {
            Some(signal) => {
                STACK_NOTIFY.click();
                signal.release();
                true
            }
            None => {
                STACK_NOTIFY_DROPPED.click();
                false
            }
        }
    }

    /// Link a waiter onto the stack that `stack` projects out of the guarded state, then unlock
    /// and park until a [ConditionStack::notify] pops it.  The lock is re-acquired before return.
    pub fn wait<'a, M, F>(mut guard: MutexGuard<'a, M>, stack: F) -> MutexGuard<'a, M>
    where
        F: FnOnce(&mut M) -> &mut ConditionStack,
    {
        let signal = stack(&mut *guard).link();
        signal.wait(guard)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
