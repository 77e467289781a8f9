//! Cooperative Scheduler and Event Delivery Discipline
//!
//! All secure-connect timers (reconnect delays, address-resolution waits,
//! cache freshness) are deadlines polled from one place: the [`Runloop`], a
//! background thread that invokes registered callbacks at a fixed tick.
//! Components register a tick callback on start and unregister on stop.
//!
//! The second half of this module is [`EventPump`], the delivery discipline
//! for owner-facing events. Components mutate their state under a lock but
//! never invoke the owner's event callback while holding it; emitted events
//! are queued in FIFO order and drained by exactly one thread at a time
//! once the lock is released. This preserves the ordering guarantees of
//! the original serialized design (per-component events are totally
//! ordered, per-socket events keep arrival order) while making it legal
//! for an event callback to re-enter any public operation of the
//! component that emitted it.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, trace};

/// Default runloop tick interval.
pub const RUNLOOP_TICK: Duration = Duration::from_millis(100);

type TickFn = Box<dyn FnMut() + Send>;

/// Identifier returned by [`Runloop::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunloopId(u64);

struct TickEntry {
    id: u64,
    func: TickFn,
}

#[derive(Default)]
struct CallbackTable {
    next_id: u64,
    entries: Vec<TickEntry>,
    /// Ids unregistered while a tick pass had the entries checked out.
    removed: Vec<u64>,
    ticking: bool,
}

struct RunloopShared {
    callbacks: Mutex<CallbackTable>,
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

/// Periodic tick scheduler driving every secure-connect timer.
///
/// The runloop owns one background thread. Registered callbacks are
/// invoked in registration order on every tick; callbacks may freely
/// register or unregister (including themselves) from within a tick.
/// Cloning the handle shares the same runloop.
#[derive(Clone)]
pub struct Runloop {
    shared: Arc<RunloopShared>,
}

impl Runloop {
    /// Start a runloop with the given tick interval.
    pub fn start(tick: Duration) -> Runloop {
        let shared = Arc::new(RunloopShared {
            callbacks: Mutex::new(CallbackTable::default()),
            stopped: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let weak: Weak<RunloopShared> = Arc::downgrade(&shared);
        thread::Builder::new()
            .name("bsc-runloop".into())
            .spawn(move || runloop_thread(weak, tick))
            .expect("spawning the runloop thread");
        debug!("runloop started, tick {:?}", tick);
        Runloop { shared }
    }

    /// Start a runloop with the default tick interval.
    pub fn start_default() -> Runloop {
        Self::start(RUNLOOP_TICK)
    }

    /// Register a tick callback. The callback runs on the runloop thread
    /// on every tick until unregistered.
    pub fn register<F>(&self, func: F) -> RunloopId
    where
        F: FnMut() + Send + 'static,
    {
        let mut table = self.shared.callbacks.lock().unwrap();
        let id = table.next_id;
        table.next_id += 1;
        table.entries.push(TickEntry {
            id,
            func: Box::new(func),
        });
        trace!("runloop callback {} registered", id);
        RunloopId(id)
    }

    /// Unregister a tick callback. After return the callback will not be
    /// invoked again, except at most once if a tick pass is already in
    /// flight on another thread.
    pub fn unregister(&self, id: RunloopId) {
        let mut table = self.shared.callbacks.lock().unwrap();
        table.entries.retain(|entry| entry.id != id.0);
        if table.ticking {
            table.removed.push(id.0);
        }
        trace!("runloop callback {} unregistered", id.0);
    }

    /// Stop the runloop thread. Callbacks registered at this point are
    /// dropped without being invoked again.
    pub fn stop(&self) {
        let mut stopped = self.shared.stopped.lock().unwrap();
        *stopped = true;
        self.shared.wakeup.notify_all();
        debug!("runloop stopped");
    }
}

fn runloop_thread(weak: Weak<RunloopShared>, tick: Duration) {
    loop {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        {
            let stopped = shared.stopped.lock().unwrap();
            let (stopped, _) = shared
                .wakeup
                .wait_timeout_while(stopped, tick, |stop| !*stop)
                .unwrap();
            if *stopped {
                return;
            }
        }
        run_tick_pass(&shared);
        // Drop the strong reference before sleeping so an abandoned
        // runloop (all handles gone, stop() never called) terminates.
        drop(shared);
    }
}

fn run_tick_pass(shared: &RunloopShared) {
    // Check the entries out of the table so callbacks can re-enter
    // register/unregister without deadlocking.
    let mut current = {
        let mut table = shared.callbacks.lock().unwrap();
        table.ticking = true;
        mem::take(&mut table.entries)
    };
    for entry in &mut current {
        (entry.func)();
    }
    let mut table = shared.callbacks.lock().unwrap();
    table.ticking = false;
    let added = mem::take(&mut table.entries);
    current.extend(added);
    let removed = mem::take(&mut table.removed);
    current.retain(|entry| !removed.contains(&entry.id));
    table.entries = current;
}

/// FIFO owner-event queue with single-drainer delivery.
///
/// `push` is called while the emitting component still holds its state
/// lock; `deliver` is called after the lock is released. `deliver`
/// guarantees that events are handed to `func` in push order, that only
/// one thread delivers at a time, and that a delivery re-entered from
/// inside `func` (a callback calling back into the component) returns
/// immediately instead of deadlocking, leaving the outer drainer to pick
/// the new events up.
pub struct EventPump<E> {
    queue: Mutex<VecDeque<E>>,
    delivering: Mutex<()>,
}

impl<E> EventPump<E> {
    pub fn new() -> Self {
        EventPump {
            queue: Mutex::new(VecDeque::new()),
            delivering: Mutex::new(()),
        }
    }

    /// Queue an event for delivery.
    pub fn push(&self, event: E) {
        self.queue.lock().unwrap().push_back(event);
    }

    /// Drain queued events into `func`, one drainer at a time.
    pub fn deliver(&self, func: &dyn Fn(E)) {
        loop {
            if self.queue.lock().unwrap().is_empty() {
                return;
            }
            let Ok(_guard) = self.delivering.try_lock() else {
                // Another drain is in flight (possibly our own caller);
                // it will observe the queued events after its current
                // callback returns.
                return;
            };
            loop {
                let event = self.queue.lock().unwrap().pop_front();
                match event {
                    Some(event) => func(event),
                    None => break,
                }
            }
            // The guard is released before looping: an event pushed by a
            // thread whose try_lock just failed is picked up here.
        }
    }
}

impl<E> Default for EventPump<E> {
    fn default() -> Self {
        Self::new()
    }
}
