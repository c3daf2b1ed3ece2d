//! Clock and timer primitives.
//!
//! Every timer in the SDK (heartbeats, reconnect backoff, typing TTLs, the
//! typing reporter) and every deferred store notification goes through a
//! [`Scheduler`]. Production code uses [`TokioScheduler`]; tests drive a
//! [`VirtualScheduler`] by hand.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + 'static>;

/// Identifies a pending timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

pub trait Scheduler {
    /// Current wall-clock time as seen by this scheduler.
    fn now(&self) -> DateTime<Utc>;

    /// Run `task` once after `delay`.
    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a pending timer. Unknown or already-fired ids are ignored.
    fn clear_timeout(&self, id: TimerId);

    /// Run `task` after the current call stack unwinds, before any timer.
    fn defer(&self, task: Task);
}

/// Time elapsed between two instants, clamped at zero.
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}

// =========================================
// Tokio (production)
// =========================================

/// Scheduler backed by `tokio::task::spawn_local`.
///
/// Must be used from inside a [`tokio::task::LocalSet`]; the SDK is
/// single-threaded and its callbacks are not `Send`.
#[derive(Default)]
pub struct TokioScheduler {
    timers: Rc<RefCell<HashMap<TimerId, tokio::task::JoinHandle<()>>>>,
    next_id: Cell<u64>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId {
        let id = TimerId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let timers = Rc::downgrade(&self.timers);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(timers) = timers.upgrade() {
                timers.borrow_mut().remove(&id);
            }
            task();
        });
        self.timers.borrow_mut().insert(id, handle);
        id
    }

    fn clear_timeout(&self, id: TimerId) {
        if let Some(handle) = self.timers.borrow_mut().remove(&id) {
            handle.abort();
        }
    }

    fn defer(&self, task: Task) {
        tokio::task::spawn_local(async move { task() });
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.timers.borrow_mut().drain() {
            handle.abort();
        }
    }
}

// =========================================
// Virtual clock (tests)
// =========================================

/// Deterministic scheduler: time only moves when [`advance`] is called.
///
/// [`advance`]: VirtualScheduler::advance
pub struct VirtualScheduler {
    state: RefCell<VirtualState>,
}

struct VirtualState {
    epoch: DateTime<Utc>,
    elapsed: Duration,
    next_id: u64,
    timers: BTreeMap<(Duration, u64), Task>,
    due: HashMap<u64, Duration>,
    microtasks: VecDeque<Task>,
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualScheduler {
    /// Start the clock at 2026-01-01T00:00:00Z.
    pub fn new() -> Self {
        let epoch = Utc
            .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::starting_at(epoch)
    }

    pub fn starting_at(epoch: DateTime<Utc>) -> Self {
        Self {
            state: RefCell::new(VirtualState {
                epoch,
                elapsed: Duration::ZERO,
                next_id: 0,
                timers: BTreeMap::new(),
                due: HashMap::new(),
                microtasks: VecDeque::new(),
            }),
        }
    }

    /// Move the clock forward, firing every timer that falls due in order.
    /// Deferred tasks are drained before and after each timer.
    pub fn advance(&self, by: Duration) {
        let target = self.state.borrow().elapsed + by;
        self.run_microtasks();

        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                match state.timers.first_key_value().map(|(key, _)| *key) {
                    Some(key) if key.0 <= target => {
                        state.due.remove(&key.1);
                        state.elapsed = state.elapsed.max(key.0);
                        state.timers.remove(&key)
                    }
                    _ => None,
                }
            };
            match next {
                Some(task) => {
                    task();
                    self.run_microtasks();
                }
                None => break,
            }
        }

        {
            let mut state = self.state.borrow_mut();
            state.elapsed = state.elapsed.max(target);
        }
        self.run_microtasks();
    }

    /// Drain deferred tasks, including any they enqueue.
    pub fn run_microtasks(&self) {
        loop {
            let task = self.state.borrow_mut().microtasks.pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }

    pub fn elapsed(&self) -> Duration {
        self.state.borrow().elapsed
    }
}

impl Scheduler for VirtualScheduler {
    fn now(&self) -> DateTime<Utc> {
        let state = self.state.borrow();
        state.epoch + TimeDelta::from_std(state.elapsed).unwrap_or(TimeDelta::zero())
    }

    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        let due = state.elapsed + delay;
        state.timers.insert((due, id), task);
        state.due.insert(id, due);
        TimerId(id)
    }

    fn clear_timeout(&self, id: TimerId) {
        let mut state = self.state.borrow_mut();
        if let Some(due) = state.due.remove(&id.0) {
            state.timers.remove(&(due, id.0));
        }
    }

    fn defer(&self, task: Task) {
        self.state.borrow_mut().microtasks.push_back(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_for_task = log.clone();
        let make = move |label: &'static str| -> Task {
            let log = log_for_task.clone();
            Box::new(move || log.borrow_mut().push(label))
        };
        (log, make)
    }

    #[test]
    fn timers_fire_in_due_order() {
        let scheduler = VirtualScheduler::new();
        let (log, task) = recorder();

        scheduler.set_timeout(Duration::from_millis(300), task("late"));
        scheduler.set_timeout(Duration::from_millis(100), task("early"));
        scheduler.set_timeout(Duration::from_millis(100), task("early-second"));

        scheduler.advance(Duration::from_millis(99));
        assert!(log.borrow().is_empty());

        scheduler.advance(Duration::from_millis(250));
        assert_eq!(*log.borrow(), vec!["early", "early-second", "late"]);
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn cleared_timer_never_fires() {
        let scheduler = VirtualScheduler::new();
        let (log, task) = recorder();

        let id = scheduler.set_timeout(Duration::from_millis(10), task("cancelled"));
        scheduler.clear_timeout(id);
        scheduler.clear_timeout(id);
        scheduler.advance(Duration::from_secs(1));

        assert!(log.borrow().is_empty());
    }

    #[test]
    fn clock_reflects_timer_due_time_inside_callbacks() {
        let scheduler = Rc::new(VirtualScheduler::new());
        let start = scheduler.now();
        let seen = Rc::new(Cell::new(Duration::ZERO));

        let sched = scheduler.clone();
        let seen_in_task = seen.clone();
        scheduler.set_timeout(
            Duration::from_millis(1500),
            Box::new(move || seen_in_task.set(elapsed_between(start, sched.now()))),
        );
        scheduler.advance(Duration::from_secs(5));

        assert_eq!(seen.get(), Duration::from_millis(1500));
        assert_eq!(elapsed_between(start, scheduler.now()), Duration::from_secs(5));
    }

    #[test]
    fn microtasks_run_before_timers_and_chain() {
        let scheduler = Rc::new(VirtualScheduler::new());
        let (log, task) = recorder();

        let sched = scheduler.clone();
        let chained = task("chained");
        scheduler.defer(Box::new(move || sched.defer(chained)));
        scheduler.set_timeout(Duration::ZERO, task("timer"));
        scheduler.defer(task("first"));

        scheduler.advance(Duration::ZERO);
        assert_eq!(*log.borrow(), vec!["first", "chained", "timer"]);
    }

    #[test]
    fn timers_scheduled_from_timers_respect_the_target() {
        let scheduler = Rc::new(VirtualScheduler::new());
        let count = Rc::new(Cell::new(0));

        fn tick(scheduler: Rc<VirtualScheduler>, count: Rc<Cell<u32>>) {
            count.set(count.get() + 1);
            let next = scheduler.clone();
            scheduler.set_timeout(
                Duration::from_millis(100),
                Box::new(move || tick(next, count)),
            );
        }

        let first = scheduler.clone();
        let counter = count.clone();
        scheduler.set_timeout(
            Duration::from_millis(100),
            Box::new(move || tick(first, counter)),
        );
        scheduler.advance(Duration::from_millis(450));

        assert_eq!(count.get(), 4);
        assert_eq!(scheduler.pending_timers(), 1);
    }
}
