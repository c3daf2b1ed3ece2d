//! Minimal reactive state container.
//!
//! A [`Store`] holds one immutable snapshot behind an `Rc`. Updates are pure
//! functions from the previous snapshot to the next one; returning the same
//! `Rc` means "nothing changed" and suppresses notification. Listeners are
//! called from a deferred task, so several updates in the same tick reach
//! them as one call carrying the final state.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::scheduler::Scheduler;

type Listener<S> = Rc<dyn Fn(&Rc<S>)>;

/// Handle returned by `subscribe`. Dropping it keeps the subscription;
/// call [`Unsubscribe::unsubscribe`] to end it.
#[must_use = "keep the handle to be able to unsubscribe later"]
pub struct Unsubscribe(Option<Box<dyn FnOnce()>>);

impl Unsubscribe {
    pub(crate) fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.0.is_some())
            .finish()
    }
}

pub struct Store<S> {
    inner: Rc<StoreInner<S>>,
}

struct StoreInner<S> {
    state: RefCell<Rc<S>>,
    listeners: RefCell<Vec<(u64, Listener<S>)>>,
    next_listener_id: Cell<u64>,
    batch_depth: Cell<u32>,
    dirty: Cell<bool>,
    flush_scheduled: Cell<bool>,
    scheduler: Rc<dyn Scheduler>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: 'static> Store<S> {
    pub fn new(initial: S, scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            inner: Rc::new(StoreInner {
                state: RefCell::new(Rc::new(initial)),
                listeners: RefCell::new(Vec::new()),
                next_listener_id: Cell::new(0),
                batch_depth: Cell::new(0),
                dirty: Cell::new(false),
                flush_scheduled: Cell::new(false),
                scheduler,
            }),
        }
    }

    pub fn get_state(&self) -> Rc<S> {
        self.inner.state.borrow().clone()
    }

    /// Apply `updater` to the current snapshot. Returns whether the snapshot
    /// was replaced.
    pub fn set_state(&self, updater: impl FnOnce(&Rc<S>) -> Rc<S>) -> bool {
        let previous = self.get_state();
        let next = updater(&previous);
        if Rc::ptr_eq(&previous, &next) {
            return false;
        }

        *self.inner.state.borrow_mut() = next;
        self.inner.dirty.set(true);
        if self.inner.batch_depth.get() == 0 {
            self.schedule_flush();
        }
        true
    }

    pub fn subscribe(&self, listener: impl Fn(&Rc<S>) + 'static) -> Unsubscribe {
        let id = self.inner.next_listener_id.get();
        self.inner.next_listener_id.set(id + 1);
        self.inner
            .listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));

        let inner = Rc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.listeners.borrow_mut().retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Run `f` with notifications held back; at most one notification is
    /// scheduled once the outermost batch returns.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.batch_depth.set(self.inner.batch_depth.get() + 1);
        let result = f();
        let depth = self.inner.batch_depth.get() - 1;
        self.inner.batch_depth.set(depth);
        if depth == 0 && self.inner.dirty.get() {
            self.schedule_flush();
        }
        result
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    fn schedule_flush(&self) {
        if self.inner.flush_scheduled.replace(true) {
            return;
        }
        let inner = Rc::downgrade(&self.inner);
        self.inner.scheduler.defer(Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.flush();
            }
        }));
    }
}

impl<S> StoreInner<S> {
    fn flush(&self) {
        self.flush_scheduled.set(false);
        if !self.dirty.replace(false) {
            return;
        }
        let state = self.state.borrow().clone();
        let listeners: Vec<Listener<S>> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::VirtualScheduler;

    fn store_with_counter(
        initial: u32,
    ) -> (Rc<VirtualScheduler>, Store<u32>, Rc<RefCell<Vec<u32>>>) {
        let scheduler = Rc::new(VirtualScheduler::new());
        let store = Store::new(initial, scheduler.clone());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_for_listener = seen.clone();
        let _sub = store.subscribe(move |state| seen_for_listener.borrow_mut().push(**state));
        (scheduler, store, seen)
    }

    #[test]
    fn same_reference_does_not_notify() {
        let (scheduler, store, seen) = store_with_counter(1);

        assert!(!store.set_state(|state| state.clone()));
        scheduler.run_microtasks();

        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn notifications_are_deferred_and_coalesced() {
        let (scheduler, store, seen) = store_with_counter(0);

        store.set_state(|s| Rc::new(**s + 1));
        store.set_state(|s| Rc::new(**s + 1));
        store.set_state(|s| Rc::new(**s + 1));
        assert!(seen.borrow().is_empty());

        scheduler.run_microtasks();
        assert_eq!(*seen.borrow(), vec![3]);
        assert_eq!(*store.get_state(), 3);
    }

    #[test]
    fn batch_collapses_nested_updates() {
        let (scheduler, store, seen) = store_with_counter(0);

        let returned = store.batch(|| {
            store.set_state(|s| Rc::new(**s + 1));
            store.batch(|| store.set_state(|s| Rc::new(**s + 10)));
            "done"
        });
        assert_eq!(returned, "done");

        scheduler.run_microtasks();
        assert_eq!(*seen.borrow(), vec![11]);
    }

    #[test]
    fn unsubscribed_listener_is_not_called() {
        let scheduler = Rc::new(VirtualScheduler::new());
        let store = Store::new(0u32, scheduler.clone());
        let calls = Rc::new(Cell::new(0));
        let calls_for_listener = calls.clone();
        let sub = store.subscribe(move |_| calls_for_listener.set(calls_for_listener.get() + 1));
        assert_eq!(store.listener_count(), 1);

        sub.unsubscribe();
        store.set_state(|_| Rc::new(5));
        scheduler.run_microtasks();

        assert_eq!(calls.get(), 0);
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn updates_from_listeners_schedule_a_second_notification() {
        let scheduler = Rc::new(VirtualScheduler::new());
        let store = Store::new(0u32, scheduler.clone());
        let seen = Rc::new(RefCell::new(Vec::new()));

        let store_in_listener = store.clone();
        let seen_in_listener = seen.clone();
        let _sub = store.subscribe(move |state| {
            seen_in_listener.borrow_mut().push(**state);
            if **state == 1 {
                store_in_listener.set_state(|_| Rc::new(2));
            }
        });

        store.set_state(|_| Rc::new(1));
        scheduler.run_microtasks();

        assert_eq!(*seen.borrow(), vec![1, 2]);
    }
}
