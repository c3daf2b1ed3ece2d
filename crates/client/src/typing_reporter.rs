//! Outgoing typing indicator.
//!
//! Turns a stream of input changes into throttled `is_typing` signals: a
//! start is sent on the first keystroke, updates at most once per
//! `send_interval`, a keep-alive while the user keeps typing, and a stop
//! after `inactivity_timeout` without input or on submit.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::scheduler::{elapsed_between, Scheduler, TimerId};

/// Longest preview forwarded to the backend, in characters.
pub const MAX_PREVIEW_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct TypingReporterConfig {
    pub send_interval: Duration,
    pub keep_alive: Duration,
    pub inactivity_timeout: Duration,
}

impl Default for TypingReporterConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_millis(800),
            keep_alive: Duration::from_secs(4),
            inactivity_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub is_typing: bool,
    pub preview: Option<String>,
}

type SendFn = Rc<dyn Fn(TypingSignal)>;

#[derive(Clone)]
pub struct TypingReporter {
    inner: Rc<ReporterInner>,
}

struct ReporterInner {
    config: TypingReporterConfig,
    scheduler: Rc<dyn Scheduler>,
    send: SendFn,
    state: RefCell<ReporterState>,
    this: Weak<ReporterInner>,
}

#[derive(Default)]
struct ReporterState {
    is_active: bool,
    last_sent_at: Option<DateTime<Utc>>,
    latest_preview: Option<String>,
    inactivity_timer: Option<TimerId>,
    keep_alive_timer: Option<TimerId>,
    disposed: bool,
}

fn truncate_preview(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_PREVIEW_CHARS).collect())
}

impl TypingReporter {
    pub fn new(
        config: TypingReporterConfig,
        scheduler: Rc<dyn Scheduler>,
        send: impl Fn(TypingSignal) + 'static,
    ) -> Self {
        let inner = Rc::new_cyclic(|this| ReporterInner {
            config,
            scheduler,
            send: Rc::new(send),
            state: RefCell::new(ReporterState::default()),
            this: this.clone(),
        });
        Self { inner }
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.borrow().is_active
    }

    /// Report the current composer contents. Clearing the composer while
    /// active counts as a stop.
    pub fn handle_input_change(&self, text: &str) {
        if self.inner.state.borrow().disposed {
            return;
        }
        let Some(preview) = truncate_preview(text) else {
            if self.is_active() {
                self.inner.stop();
            } else {
                self.inner.clear_timers();
            }
            return;
        };

        let now = self.inner.scheduler.now();
        let (should_send, starting) = {
            let mut state = self.inner.state.borrow_mut();
            state.latest_preview = Some(preview.clone());
            let starting = !state.is_active;
            let throttled = !starting
                && state.last_sent_at.is_some_and(|last| {
                    elapsed_between(last, now) < self.inner.config.send_interval
                });
            if throttled {
                (false, false)
            } else {
                state.is_active = true;
                state.last_sent_at = Some(now);
                (true, starting)
            }
        };

        if should_send {
            (self.inner.send)(TypingSignal {
                is_typing: true,
                preview: Some(preview),
            });
        }
        if starting {
            self.inner.arm_keep_alive();
        }
        self.inner.arm_inactivity();
    }

    /// The message was sent: stop immediately.
    pub fn handle_submit(&self) {
        self.inner.stop();
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stop and ignore all further input.
    pub fn dispose(&self) {
        if self.inner.state.borrow().disposed {
            return;
        }
        self.inner.stop();
        self.inner.state.borrow_mut().disposed = true;
    }
}

impl ReporterInner {
    fn clear_timers(&self) {
        let timers = {
            let mut state = self.state.borrow_mut();
            [state.inactivity_timer.take(), state.keep_alive_timer.take()]
        };
        for id in timers.into_iter().flatten() {
            self.scheduler.clear_timeout(id);
        }
    }

    fn stop(&self) {
        if self.state.borrow().disposed {
            return;
        }
        self.clear_timers();
        {
            let mut state = self.state.borrow_mut();
            state.is_active = false;
            state.last_sent_at = None;
            state.latest_preview = None;
        }
        (self.send)(TypingSignal {
            is_typing: false,
            preview: None,
        });
    }

    fn arm_inactivity(&self) {
        let this = self.this.clone();
        let id = self.scheduler.set_timeout(
            self.config.inactivity_timeout,
            Box::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.state.borrow_mut().inactivity_timer = None;
                    inner.stop();
                }
            }),
        );
        let previous = self.state.borrow_mut().inactivity_timer.replace(id);
        if let Some(previous) = previous {
            self.scheduler.clear_timeout(previous);
        }
    }

    fn arm_keep_alive(&self) {
        let this = self.this.clone();
        let id = self.scheduler.set_timeout(
            self.config.keep_alive,
            Box::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.keep_alive_tick();
                }
            }),
        );
        let previous = self.state.borrow_mut().keep_alive_timer.replace(id);
        if let Some(previous) = previous {
            self.scheduler.clear_timeout(previous);
        }
    }

    fn keep_alive_tick(&self) {
        let now = self.scheduler.now();
        let preview = {
            let mut state = self.state.borrow_mut();
            state.keep_alive_timer = None;
            if !state.is_active || state.disposed {
                return;
            }
            state.last_sent_at = Some(now);
            state.latest_preview.clone()
        };
        (self.send)(TypingSignal {
            is_typing: true,
            preview,
        });
        self.arm_keep_alive();
    }
}

impl Drop for ReporterInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for id in [state.inactivity_timer.take(), state.keep_alive_timer.take()]
            .into_iter()
            .flatten()
        {
            self.scheduler.clear_timeout(id);
        }
    }
}
