//! Implementation of a monitor in classic Hoare-style, with Brinch Hansen's accept.
//!
//! A [Monitor] breaks each guarded call into coordination and the critical section.  The
//! coordination lock protects only the bookkeeping: which operation may run next, who is parked
//! where.  It is never held while a body runs and never held across a blocking wait.  Exclusive
//! access to the monitor's state is instead handed from thread to thread by the entry and exit
//! protocols.
//!
//! Priority on exit is, in order:
//! 1.  the thread parked in the innermost [Guarded::accept], if the exiting operation satisfies it;
//! 2.  the longest-waiting caller of the first operation, in accept order, named by the innermost
//!     accept;
//! 3.  the longest-waiting caller overall, when no accept is outstanding.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use biometrics::Counter;

use crate::condition_stack::ConditionStack;
use crate::wait_queue::{EntryQueue, WaitQueue};
use crate::Error;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CALL: Counter = Counter::new("hoare.monitor.call");
static ENTER_IMMEDIATELY: Counter = Counter::new("hoare.monitor.enter_immediately");
static ENTER_BLOCKED: Counter = Counter::new("hoare.monitor.enter_blocked");
static EXIT_SATISFIES_ACCEPT: Counter = Counter::new("hoare.monitor.exit_satisfies_accept");
static EXIT_ACCEPT_SET: Counter = Counter::new("hoare.monitor.exit_accept_set");
static EXIT_ENTRY_QUEUE: Counter = Counter::new("hoare.monitor.exit_entry_queue");
static EXIT_IDLE: Counter = Counter::new("hoare.monitor.exit_idle");
static ACCEPT: Counter = Counter::new("hoare.monitor.accept");
static ACCEPT_HANDOFF: Counter = Counter::new("hoare.monitor.accept_handoff");
static ACCEPT_IDLE: Counter = Counter::new("hoare.monitor.accept_idle");
static BODY_PANIC: Counter = Counter::new("hoare.monitor.body_panic");
static USAGE_ERROR: Counter = Counter::new("hoare.monitor.usage_error");

/// Register biometrics for the monitor.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&CALL);
    collector.register_counter(&ENTER_IMMEDIATELY);
    collector.register_counter(&ENTER_BLOCKED);
    collector.register_counter(&EXIT_SATISFIES_ACCEPT);
    collector.register_counter(&EXIT_ACCEPT_SET);
    collector.register_counter(&EXIT_ENTRY_QUEUE);
    collector.register_counter(&EXIT_IDLE);
    collector.register_counter(&ACCEPT);
    collector.register_counter(&ACCEPT_HANDOFF);
    collector.register_counter(&ACCEPT_IDLE);
    collector.register_counter(&BODY_PANIC);
    collector.register_counter(&USAGE_ERROR);
}

/////////////////////////////////////////// Coordination ///////////////////////////////////////////

#[derive(Debug)]
struct Coordination {
    active: bool,
    sequence: u64,
    entry_queue: EntryQueue,
    wait_queues: Vec<WaitQueue>,
    accept_stack: Vec<Vec<usize>>,
    acceptors: ConditionStack,
}

impl Coordination {
    fn new(operations: &[&'static str]) -> Self {
        Self {
            active: false,
            sequence: 0,
            entry_queue: EntryQueue::new(),
            wait_queues: operations.iter().map(|op| WaitQueue::new(*op)).collect(),
            accept_stack: Vec::new(),
            acceptors: ConditionStack::new(),
        }
    }

    fn must_block(&self, op: usize) -> bool {
        self.active
            || self
                .accept_stack
                .last()
                .map(|acceptable| !acceptable.contains(&op))
                .unwrap_or(false)
    }

    fn assert_invariants(&self) {
        assert_eq!(
            self.accept_stack.len(),
            self.acceptors.len(),
            "accept stack and acceptor stack out of lock-step"
        );
    }
}

// Release the longest-waiting caller of the first operation in `ops` that has one.
fn wake_first(wait_queues: &mut [WaitQueue], ops: &[usize]) -> Option<usize> {
    ops.iter().copied().find(|op| wait_queues[*op].notify())
}

////////////////////////////////////////////// Monitor /////////////////////////////////////////////

/// Monitor provides mutual exclusion over a fixed set of named, guarded operations on a `T`.
///
/// Operations are declared once, at construction.  Calls to any of them are serialized: at most
/// one body executes at a time.  A body may call [Guarded::accept] to choose which operations are
/// allowed to run next.
pub struct Monitor<T> {
    operations: Vec<&'static str>,
    coordination: Mutex<Coordination>,
    synchronization: AtomicBool,
    state: UnsafeCell<T>,
}

impl<T> Monitor<T> {
    /// Create a new monitor over `state` with one wait queue per name in `operations`.
    pub fn new(state: T, operations: &[&'static str]) -> Result<Self, Error> {
        for (idx, op) in operations.iter().enumerate() {
            if operations[..idx].contains(op) {
                USAGE_ERROR.click();
                return Err(Error::DuplicateOperation {
                    name: op.to_string(),
                });
            }
        }
        Ok(Self {
            operations: operations.to_vec(),
            coordination: Mutex::new(Coordination::new(operations)),
            synchronization: AtomicBool::new(false),
            state: UnsafeCell::new(state),
        })
    }

    /// The guarded operations, in declaration order.
    pub fn operations(&self) -> &[&'static str] {
        &self.operations
    }

    /// Run `body` as the guarded operation `operation`.
    ///
    /// Blocks until the entry protocol admits the call, runs the body with exclusive access to
    /// the state, and then runs the exit protocol to hand the monitor to the next caller.  If the
    /// body panics, the exit protocol still runs and the panic then resumes on this thread.
    pub fn call<R, F>(&self, operation: &str, body: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Guarded<'_, T>) -> R,
    {
        let op = self.lookup(operation)?;
        CALL.click();
        let sequence = self.enter(op);
        let mut guarded = Guarded {
            monitor: self,
            op,
            sequence,
            _not_send: PhantomData,
        };
        self.begin_critical_section();
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&mut guarded)));
        self.end_critical_section();
        self.exit(op);
        match result {
            Ok(r) => Ok(r),
            Err(payload) => {
                BODY_PANIC.click();
                panic::resume_unwind(payload)
            }
        }
    }

    /// The number of callers currently blocked on `operation`.
    pub fn pending(&self, operation: &str) -> Result<usize, Error> {
        let op = self.lookup(operation)?;
        Ok(self.lock().wait_queues[op].pending())
    }

    /// True iff some guarded body currently holds the monitor.  A body parked in accept does not
    /// hold it.
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// The number of outstanding accepts.
    pub fn accept_depth(&self) -> usize {
        self.lock().accept_stack.len()
    }

    /// Exclusive access to the state without going through the protocol.
    pub fn get_mut(&mut self) -> &mut T {
        self.state.get_mut()
    }

    /// Consume the monitor and return its state.
    pub fn into_inner(self) -> T {
        self.state.into_inner()
    }

    fn lookup(&self, operation: &str) -> Result<usize, Error> {
        match self.operations.iter().position(|op| *op == operation) {
            Some(op) => Ok(op),
            None => {
                USAGE_ERROR.click();
                Err(Error::UndeclaredOperation {
                    name: operation.to_string(),
                })
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Coordination> {
        self.coordination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Entry protocol.  Returns the arrival sequence of the call.
    fn enter(&self, op: usize) -> u64 {
        let mut coord = self.lock();
        coord.sequence += 1;
        let sequence = coord.sequence;
        if coord.must_block(op) {
            ENTER_BLOCKED.click();
            coord.entry_queue.push(op);
            let signal = coord.wait_queues[op].link();
            coord = signal.wait(coord);
            coord.wait_queues[op].unlink();
            coord.entry_queue.remove(op);
        } else {
            ENTER_IMMEDIATELY.click();
        }
        coord.active = true;
        sequence
    }

    // Exit protocol.
    fn exit(&self, op: usize) {
        let mut coord = self.lock();
        coord.assert_invariants();
        let coord = &mut *coord;
        match coord.accept_stack.last() {
            Some(acceptable) if acceptable.contains(&op) => {
                EXIT_SATISFIES_ACCEPT.click();
                coord.accept_stack.pop();
                coord.acceptors.notify();
            }
            Some(acceptable) => {
                EXIT_ACCEPT_SET.click();
                if wake_first(&mut coord.wait_queues, acceptable).is_none() {
                    coord.active = false;
                }
            }
            None => {
                let woke = match coord.entry_queue.front() {
                    Some(next) => coord.wait_queues[next].notify(),
                    None => false,
                };
                if woke {
                    EXIT_ENTRY_QUEUE.click();
                } else {
                    EXIT_IDLE.click();
                    coord.active = false;
                }
            }
        }
        coord.assert_invariants();
    }

    fn begin_critical_section(&self) {
        if self.synchronization.swap(true, Ordering::Acquire) {
            panic!("synchronization invariant violated: the entry protocol should only allow one thread at a time in the critical section");
        }
    }

    fn end_critical_section(&self) {
        self.synchronization.store(false, Ordering::Release);
    }
}

impl<T> std::fmt::Debug for Monitor<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let coord = self.lock();
        fmt.debug_struct("Monitor")
            .field("operations", &self.operations)
            .field("active", &coord.active)
            .field("entry_queue", &coord.entry_queue.len())
            .field("accept_depth", &coord.accept_stack.len())
            .finish()
    }
}

unsafe impl<T: Send> Sync for Monitor<T> {}

////////////////////////////////////////////// Guarded /////////////////////////////////////////////

/// The view of the monitor given to a guarded body.  Dereferences to the monitor's state.
pub struct Guarded<'a, T> {
    monitor: &'a Monitor<T>,
    op: usize,
    sequence: u64,
    // Two threads sharing a Guarded would share the state without T: Sync.
    _not_send: PhantomData<*mut T>,
}

impl<T> Guarded<'_, T> {
    /// The operation this body is running as.
    pub fn operation(&self) -> &'static str {
        self.monitor.operations[self.op]
    }

    /// The arrival sequence stamped on this call by the entry protocol.  Sequences increase
    /// monotonically per monitor.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The number of callers currently blocked on `operation`.
    pub fn pending(&self, operation: &str) -> Result<usize, Error> {
        self.monitor.pending(operation)
    }

    /// Allow only `operations` to run next and park until one of them completes.
    ///
    /// If a caller of one of `operations` is already blocked, the monitor is handed to the first
    /// such caller in the order given; otherwise the monitor goes idle until one arrives.  On
    /// return this body once again has exclusive access to the state.  Accepts nest: an accept
    /// issued by a body that is itself satisfying an outer accept is resolved first.
    pub fn accept(&mut self, operations: &[&str]) -> Result<(), Error> {
        if operations.is_empty() {
            USAGE_ERROR.click();
            return Err(Error::EmptyAccept);
        }
        let ops = operations
            .iter()
            .map(|op| self.monitor.lookup(op))
            .collect::<Result<Vec<_>, Error>>()?;
        ACCEPT.click();
        self.monitor.end_critical_section();
        let mut coord = self.monitor.lock();
        if wake_first(&mut coord.wait_queues, &ops).is_some() {
            ACCEPT_HANDOFF.click();
            coord.active = true;
        } else {
            ACCEPT_IDLE.click();
            coord.active = false;
        }
        coord.accept_stack.push(ops);
        let coord = ConditionStack::wait(coord, |c| &mut c.acceptors);
        coord.assert_invariants();
        drop(coord);
        self.monitor.begin_critical_section();
        Ok(())
    }
}

impl<T> Deref for Guarded<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a Guarded exists only while its body holds the monitor, and accept takes
        // &mut self, so no reference outlives the body's turn.
        unsafe { &*self.monitor.state.get() }
    }
}

impl<T> DerefMut for Guarded<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see deref.
        unsafe { &mut *self.monitor.state.get() }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn wait_until<T, F: Fn(&Monitor<T>) -> bool>(monitor: &Monitor<T>, pred: F) {
        while !pred(monitor) {
            std::thread::yield_now();
        }
    }

    #[test]
    fn call_returns_body_result() {
        let monitor = Monitor::new(vec![1u64, 2, 3], &["sum", "push"]).unwrap();
        monitor.call("push", |v| v.push(4)).unwrap();
        assert_eq!(10, monitor.call("sum", |v| v.iter().sum::<u64>()).unwrap());
        assert!(!monitor.is_active());
        assert_eq!(vec![1, 2, 3, 4], monitor.into_inner());
    }

    #[test]
    fn operation_and_sequence() {
        let monitor = Monitor::new((), &["a", "b"]).unwrap();
        assert_eq!(&["a", "b"], monitor.operations());
        let (op, seq) = monitor.call("b", |g| (g.operation(), g.sequence())).unwrap();
        assert_eq!(("b", 1), (op, seq));
        let (op, seq) = monitor.call("a", |g| (g.operation(), g.sequence())).unwrap();
        assert_eq!(("a", 2), (op, seq));
    }

    #[test]
    fn duplicate_operation() {
        assert_eq!(
            Error::DuplicateOperation {
                name: "push".to_string()
            },
            Monitor::new((), &["push", "pop", "push"]).unwrap_err()
        );
    }

    #[test]
    fn undeclared_operation() {
        let monitor = Monitor::new(0u64, &["push"]).unwrap();
        assert_eq!(
            Err(Error::UndeclaredOperation {
                name: "pop".to_string()
            }),
            monitor.call("pop", |_| ())
        );
        assert_eq!(
            Err(Error::UndeclaredOperation {
                name: "pop".to_string()
            }),
            monitor.pending("pop")
        );
        assert!(!monitor.is_active());
    }

    #[test]
    fn accept_usage_errors_leave_bookkeeping_alone() {
        let monitor = Monitor::new(0u64, &["push", "pop"]).unwrap();
        let (empty, undeclared, depth) = monitor
            .call("push", |g| {
                let empty = g.accept(&[]);
                let undeclared = g.accept(&["pop", "peek"]);
                **g += 1;
                (empty, undeclared, g.monitor.lock().accept_stack.len())
            })
            .unwrap();
        assert_eq!(Err(Error::EmptyAccept), empty);
        assert_eq!(
            Err(Error::UndeclaredOperation {
                name: "peek".to_string()
            }),
            undeclared
        );
        assert_eq!(0, depth);
        assert_eq!(0, monitor.accept_depth());
        assert!(!monitor.is_active());
        assert_eq!(1, monitor.into_inner());
    }

    #[test]
    fn accept_then_satisfied() {
        let monitor = Arc::new(Monitor::new(Vec::new(), &["waiter", "wake"]).unwrap());
        let monitor_p = Arc::clone(&monitor);
        let waiter = std::thread::spawn(move || {
            monitor_p
                .call("waiter", |g| {
                    g.push("waiter parks");
                    g.accept(&["wake"]).unwrap();
                    g.push("waiter resumes");
                })
                .unwrap();
        });
        wait_until(&*monitor, |m| m.accept_depth() == 1);
        // Parked in accept with nobody to hand to, the monitor goes idle.
        assert!(!monitor.is_active());
        monitor.call("wake", |g| g.push("wake")).unwrap();
        waiter.join().unwrap();
        let monitor = Arc::try_unwrap(monitor).unwrap();
        assert_eq!(0, monitor.accept_depth());
        assert_eq!(
            vec!["waiter parks", "wake", "waiter resumes"],
            monitor.into_inner()
        );
    }

    #[test]
    fn get_mut_bypasses_protocol() {
        let mut monitor = Monitor::new(5u64, &["read"]).unwrap();
        *monitor.get_mut() += 1;
        assert_eq!(6, monitor.call("read", |g| **g).unwrap());
    }

    #[test]
    fn debug_shows_operations() {
        let monitor = Monitor::new((), &["push", "pop"]).unwrap();
        let debug = format!("{:?}", monitor);
        assert!(debug.contains("\"push\""));
        assert!(debug.contains("active: false"));
    }
}
