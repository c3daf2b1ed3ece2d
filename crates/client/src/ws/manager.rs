//! Connection manager: owns the single realtime channel, its heartbeat,
//! reconnect backoff and presence pings, and fans inbound events out to
//! subscribers.
//!
//! All transitions funnel through [`ChannelListener::on_channel_event`];
//! timers and public methods only ever read or replace the runtime state
//! and never hold a borrow while calling user code.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use supportkit_shared::{
    close_code, decode_inbound, is_permanent_close, EventDecodeError, InboundMessage,
    RealtimeEvent, PING_FRAME, PRESENCE_PING_FRAME,
};

use super::auth::{build_connection_url, ConnectionAuth, ResolvedAuth};
use super::connection::{
    Channel, ChannelEvent, ChannelListener, ChannelSink, ConnectionConfig, ConnectionError,
    ConnectionState, ConnectionStatus, InboundFrame, Transport,
};
use crate::scheduler::{elapsed_between, Scheduler, TimerId};
use crate::store::{Store, Unsubscribe};

/// Structured event subscriber. An `Err` is reported through `on_error`
/// and does not stop delivery to the other subscribers.
pub type EventHandler = Rc<dyn Fn(&RealtimeEvent) -> anyhow::Result<()>>;
/// Receives every inbound frame as text, before decoding.
pub type RawHandler = Rc<dyn Fn(&str)>;

type Callback = Rc<dyn Fn()>;
type ErrorCallback = Rc<dyn Fn(&ConnectionError)>;

/// Handle to the connection manager. Clones share the same channel.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Rc<ManagerInner>,
}

struct ManagerInner {
    config: ConnectionConfig,
    base_url: String,
    transport: Rc<dyn Transport>,
    scheduler: Rc<dyn Scheduler>,
    state: Store<ConnectionState>,
    runtime: RefCell<Runtime>,
    on_connect: RefCell<Option<Callback>>,
    on_disconnect: RefCell<Option<Callback>>,
    on_error: RefCell<Option<ErrorCallback>>,
    handlers: RefCell<Vec<(u64, EventHandler)>>,
    raw_handlers: RefCell<Vec<(u64, RawHandler)>>,
    next_handler_id: Cell<u64>,
    this: Weak<ManagerInner>,
}

#[derive(Default)]
struct Runtime {
    auth: Option<ResolvedAuth>,
    channel: Option<ActiveChannel>,
    generation: u64,
    attempt: u32,
    last_heartbeat: Option<DateTime<Utc>>,
    heartbeat_timer: Option<TimerId>,
    reconnect_timer: Option<TimerId>,
    presence: PresenceRuntime,
    destroyed: bool,
}

#[derive(Default)]
struct PresenceRuntime {
    interval: Option<Duration>,
    paused: bool,
    timer: Option<TimerId>,
}

struct ActiveChannel {
    generation: u64,
    handle: Rc<dyn Channel>,
    open: bool,
}

impl ConnectionManager {
    pub fn new(
        base_url: impl Into<String>,
        config: ConnectionConfig,
        transport: Rc<dyn Transport>,
        scheduler: Rc<dyn Scheduler>,
    ) -> Self {
        let base_url = base_url.into();
        let inner = Rc::new_cyclic(|this| ManagerInner {
            config,
            base_url,
            transport,
            state: Store::new(ConnectionState::default(), scheduler.clone()),
            scheduler,
            runtime: RefCell::new(Runtime::default()),
            on_connect: RefCell::new(None),
            on_disconnect: RefCell::new(None),
            on_error: RefCell::new(None),
            handlers: RefCell::new(Vec::new()),
            raw_handlers: RefCell::new(Vec::new()),
            next_handler_id: Cell::new(0),
            this: this.clone(),
        });
        Self { inner }
    }

    // --- Observation ---

    /// Store holding the observable [`ConnectionState`].
    pub fn state(&self) -> Store<ConnectionState> {
        self.inner.state.clone()
    }

    pub fn get_state(&self) -> Rc<ConnectionState> {
        self.inner.state.get_state()
    }

    pub fn is_connected(&self) -> bool {
        self.get_state().is_connected()
    }

    /// Identity the manager is currently connected (or connecting) with.
    pub fn current_auth(&self) -> Option<ResolvedAuth> {
        self.inner.runtime.borrow().auth.clone()
    }

    pub fn on_connect(&self, f: impl Fn() + 'static) {
        *self.inner.on_connect.borrow_mut() = Some(Rc::new(f));
    }

    pub fn on_disconnect(&self, f: impl Fn() + 'static) {
        *self.inner.on_disconnect.borrow_mut() = Some(Rc::new(f));
    }

    pub fn on_error(&self, f: impl Fn(&ConnectionError) + 'static) {
        *self.inner.on_error.borrow_mut() = Some(Rc::new(f));
    }

    pub fn subscribe(
        &self,
        handler: impl Fn(&RealtimeEvent) -> anyhow::Result<()> + 'static,
    ) -> Unsubscribe {
        let id = self.inner.next_handler_id();
        self.inner
            .handlers
            .borrow_mut()
            .push((id, Rc::new(handler)));
        let inner = self.inner.this.clone();
        Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.handlers.borrow_mut().retain(|(hid, _)| *hid != id);
            }
        })
    }

    pub fn subscribe_raw(&self, handler: impl Fn(&str) + 'static) -> Unsubscribe {
        let id = self.inner.next_handler_id();
        self.inner
            .raw_handlers
            .borrow_mut()
            .push((id, Rc::new(handler)));
        let inner = self.inner.this.clone();
        Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.raw_handlers.borrow_mut().retain(|(hid, _)| *hid != id);
            }
        })
    }

    // --- Lifecycle ---

    /// Connect with `auth`. A blank identity disconnects; an identity equal
    /// to the current one is a no-op.
    pub fn connect(&self, auth: ConnectionAuth) {
        if self.inner.runtime.borrow().destroyed {
            crate::log_warn!("connect() called on a destroyed connection manager");
            return;
        }
        let Some(resolved) = auth.resolve() else {
            crate::log_warn!("connect() called without a usable identity");
            self.disconnect();
            return;
        };

        let reconnect_timer = {
            let mut rt = self.inner.runtime.borrow_mut();
            if rt.auth.as_ref() == Some(&resolved) {
                return;
            }
            rt.auth = Some(resolved);
            rt.attempt = 0;
            rt.reconnect_timer.take()
        };
        if let Some(id) = reconnect_timer {
            self.inner.scheduler.clear_timeout(id);
        }

        self.inner
            .force_close(close_code::NORMAL, "identity changed");
        self.inner.open_channel();
    }

    /// Close the channel, cancel every timer and forget the identity.
    pub fn disconnect(&self) {
        let reconnect_timer = {
            let mut rt = self.inner.runtime.borrow_mut();
            rt.auth = None;
            rt.attempt = 0;
            rt.reconnect_timer.take()
        };
        if let Some(id) = reconnect_timer {
            self.inner.scheduler.clear_timeout(id);
        }
        self.inner.force_close(close_code::NORMAL, "client disconnect");
        self.inner.update_state(|state| {
            state.status = ConnectionStatus::Disconnected;
            state.connection_id = None;
        });
    }

    /// Disconnect and drop every callback and subscriber. Idempotent; the
    /// manager cannot be reconnected afterwards.
    pub fn destroy(&self) {
        if self.inner.runtime.borrow().destroyed {
            return;
        }
        self.disconnect();
        self.inner.runtime.borrow_mut().destroyed = true;
        self.inner.handlers.borrow_mut().clear();
        self.inner.raw_handlers.borrow_mut().clear();
        self.inner.on_connect.borrow_mut().take();
        self.inner.on_disconnect.borrow_mut().take();
        self.inner.on_error.borrow_mut().take();
        crate::log_debug!("Connection manager destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.runtime.borrow().destroyed
    }

    // --- Outbound ---

    pub fn send(&self, event: &RealtimeEvent) -> Result<(), ConnectionError> {
        let text =
            serde_json::to_string(event).map_err(|e| ConnectionError::Serialize(e.to_string()))?;
        self.send_raw(&text)
    }

    pub fn send_raw(&self, text: &str) -> Result<(), ConnectionError> {
        let handle = self
            .inner
            .open_channel_handle()
            .ok_or(ConnectionError::NotConnected)?;
        handle.send_text(text)
    }

    // --- Presence ---

    /// Send `presence:ping` every `interval` while connected and not paused.
    pub fn enable_presence(&self, interval: Duration) {
        let timer = {
            let mut rt = self.inner.runtime.borrow_mut();
            rt.presence.interval = Some(interval);
            rt.presence.timer.take()
        };
        if let Some(id) = timer {
            self.inner.scheduler.clear_timeout(id);
        }
        self.inner.start_presence();
    }

    pub fn disable_presence(&self) {
        let timer = {
            let mut rt = self.inner.runtime.borrow_mut();
            rt.presence.interval = None;
            rt.presence.timer.take()
        };
        if let Some(id) = timer {
            self.inner.scheduler.clear_timeout(id);
        }
    }

    pub fn pause_presence(&self) {
        let timer = {
            let mut rt = self.inner.runtime.borrow_mut();
            rt.presence.paused = true;
            rt.presence.timer.take()
        };
        if let Some(id) = timer {
            self.inner.scheduler.clear_timeout(id);
        }
    }

    /// Unpause and send one presence ping right away.
    pub fn resume_presence(&self) {
        let enabled = {
            let mut rt = self.inner.runtime.borrow_mut();
            rt.presence.paused = false;
            rt.presence.interval.is_some()
        };
        if !enabled {
            return;
        }
        if let Some(handle) = self.inner.open_channel_handle() {
            let _ = handle.send_text(PRESENCE_PING_FRAME);
        }
        self.inner.start_presence();
    }
}

impl ManagerInner {
    fn next_handler_id(&self) -> u64 {
        let id = self.next_handler_id.get();
        self.next_handler_id.set(id + 1);
        id
    }

    fn update_state(&self, f: impl FnOnce(&mut ConnectionState)) {
        self.state.set_state(|previous| {
            let mut next = ConnectionState::clone(previous);
            f(&mut next);
            if next == **previous {
                previous.clone()
            } else {
                Rc::new(next)
            }
        });
    }

    fn open_channel_handle(&self) -> Option<Rc<dyn Channel>> {
        let rt = self.runtime.borrow();
        rt.channel
            .as_ref()
            .filter(|channel| channel.open)
            .map(|channel| channel.handle.clone())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.runtime
            .borrow()
            .channel
            .as_ref()
            .is_some_and(|channel| channel.generation == generation)
    }

    // --- Callbacks ---

    fn emit_connect(&self) {
        let callback = self.on_connect.borrow().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn emit_disconnect(&self) {
        let callback = self.on_disconnect.borrow().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn emit_error(&self, error: &ConnectionError) {
        let callback = self.on_error.borrow().clone();
        if let Some(callback) = callback {
            callback(error);
        }
    }

    // --- Channel lifetime ---

    fn open_channel(&self) {
        let (auth, generation) = {
            let mut rt = self.runtime.borrow_mut();
            let Some(auth) = rt.auth.clone() else {
                return;
            };
            if rt.destroyed {
                return;
            }
            rt.generation += 1;
            (auth, rt.generation)
        };

        let url = match build_connection_url(&self.base_url, &auth) {
            Ok(url) => url,
            Err(e) => {
                crate::log_error!("Cannot build connection url: {}", e);
                self.update_state(|state| {
                    state.status = ConnectionStatus::Disconnected;
                    state.error = Some(e.clone());
                });
                self.emit_error(&e);
                return;
            }
        };

        self.update_state(|state| state.status = ConnectionStatus::Connecting);
        crate::log_info!("Opening realtime channel (generation {})", generation);

        let listener: Weak<dyn ChannelListener> = self.this.clone();
        match self.transport.open(&url, ChannelSink::new(listener, generation)) {
            Ok(handle) => {
                self.runtime.borrow_mut().channel = Some(ActiveChannel {
                    generation,
                    handle: Rc::from(handle),
                    open: false,
                });
            }
            Err(e) => {
                crate::log_error!("Failed to open realtime channel: {}", e);
                self.update_state(|state| {
                    state.status = ConnectionStatus::Disconnected;
                    state.error = Some(e.clone());
                });
                self.emit_error(&e);
                self.schedule_reconnect();
            }
        }
    }

    /// Drop the current channel so its late callbacks are ignored, then ask
    /// it to close.
    fn force_close(&self, code: u16, reason: &str) {
        let (channel, timers) = {
            let mut rt = self.runtime.borrow_mut();
            let channel = rt.channel.take();
            let timers = [rt.heartbeat_timer.take(), rt.presence.timer.take()];
            (channel, timers)
        };
        for id in timers.into_iter().flatten() {
            self.scheduler.clear_timeout(id);
        }
        let Some(channel) = channel else {
            return;
        };
        channel.handle.close(code, reason);
        if channel.open {
            self.update_state(|state| {
                state.status = ConnectionStatus::Disconnected;
                state.connection_id = None;
            });
            self.emit_disconnect();
        }
    }

    fn handle_open(&self) {
        let now = self.scheduler.now();
        let reconnect_timer = {
            let mut rt = self.runtime.borrow_mut();
            if let Some(channel) = rt.channel.as_mut() {
                channel.open = true;
            }
            rt.attempt = 0;
            rt.last_heartbeat = Some(now);
            rt.reconnect_timer.take()
        };
        if let Some(id) = reconnect_timer {
            self.scheduler.clear_timeout(id);
        }

        crate::log_info!("Realtime channel connected");
        self.start_heartbeat();
        self.update_state(|state| {
            state.status = ConnectionStatus::Connected;
            state.error = None;
        });
        self.start_presence();
        self.emit_connect();
    }

    fn handle_frame(&self, frame: InboundFrame) {
        let text = frame.into_text();

        let raw_handlers: Vec<RawHandler> = self
            .raw_handlers
            .borrow()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in raw_handlers {
            handler(&text);
        }

        match decode_inbound(&text) {
            InboundMessage::Pong => self.touch_heartbeat(),
            InboundMessage::ConnectionEstablished { connection_id } => {
                self.touch_heartbeat();
                crate::log_debug!("Connection established: {:?}", connection_id);
                self.update_state(|state| state.connection_id = connection_id);
            }
            InboundMessage::ServerError { message } => {
                crate::log_warn!("Server reported an error: {}", message);
                let error = ConnectionError::Server { message };
                self.update_state(|state| state.error = Some(error.clone()));
                self.emit_error(&error);
            }
            InboundMessage::Event {
                event_type,
                payload,
            } => match RealtimeEvent::from_parts(event_type, payload) {
                Ok(event) => {
                    self.touch_heartbeat();
                    self.dispatch(&event);
                }
                Err(e @ EventDecodeError::MissingField { .. }) => {
                    crate::log_warn!("Dropping realtime event: {}", e);
                }
                Err(e @ EventDecodeError::Schema { .. }) => {
                    crate::log_warn!("Dropping invalid realtime event: {}", e);
                }
            },
            InboundMessage::Invalid => {
                crate::log_debug!("Ignoring unrecognized frame ({} bytes)", text.len());
            }
        }
    }

    fn dispatch(&self, event: &RealtimeEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .borrow()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            if let Err(e) = handler(event) {
                crate::log_error!("Handler for `{}` failed: {:#}", event.event_type(), e);
                self.emit_error(&ConnectionError::Handler(format!("{e:#}")));
            }
        }
    }

    fn handle_close(&self, code: u16, reason: String) {
        let timers = {
            let mut rt = self.runtime.borrow_mut();
            rt.channel = None;
            [rt.heartbeat_timer.take(), rt.presence.timer.take()]
        };
        for id in timers.into_iter().flatten() {
            self.scheduler.clear_timeout(id);
        }

        let permanent = is_permanent_close(code);
        let error = permanent.then(|| ConnectionError::PermanentClose {
            code,
            reason: reason.clone(),
        });
        self.update_state(|state| {
            state.status = ConnectionStatus::Disconnected;
            state.connection_id = None;
            if let Some(error) = &error {
                state.error = Some(error.clone());
            }
        });
        self.emit_disconnect();

        match error {
            Some(error) => {
                crate::log_error!("Realtime channel rejected ({}): {}", code, reason);
                self.emit_error(&error);
            }
            None => {
                crate::log_info!("Realtime channel closed ({}): {}", code, reason);
                self.schedule_reconnect();
            }
        }
    }

    fn handle_transport_error(&self, message: String) {
        crate::log_warn!("Realtime channel error: {}", message);
        let error = ConnectionError::Transport(message);
        self.update_state(|state| state.error = Some(error.clone()));
        self.emit_error(&error);
    }

    // --- Timers ---

    fn schedule_reconnect(&self) {
        let (delay, attempt) = {
            let mut rt = self.runtime.borrow_mut();
            if rt.destroyed || rt.auth.is_none() || rt.reconnect_timer.is_some() {
                return;
            }
            let delay = self.config.reconnect_delay(rt.attempt);
            rt.attempt += 1;
            (delay, rt.attempt)
        };
        crate::log_info!(
            "Reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            attempt
        );

        let this = self.this.clone();
        let id = self.scheduler.set_timeout(
            delay,
            Box::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.runtime.borrow_mut().reconnect_timer = None;
                    if inner.runtime.borrow().channel.is_none() {
                        inner.open_channel();
                    }
                }
            }),
        );
        self.runtime.borrow_mut().reconnect_timer = Some(id);
    }

    fn touch_heartbeat(&self) {
        let now = self.scheduler.now();
        self.runtime.borrow_mut().last_heartbeat = Some(now);
    }

    fn start_heartbeat(&self) {
        let this = self.this.clone();
        let id = self.scheduler.set_timeout(
            self.config.heartbeat_interval,
            Box::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.heartbeat_tick();
                }
            }),
        );
        let previous = self.runtime.borrow_mut().heartbeat_timer.replace(id);
        if let Some(previous) = previous {
            self.scheduler.clear_timeout(previous);
        }
    }

    fn heartbeat_tick(&self) {
        let (handle, last) = {
            let mut rt = self.runtime.borrow_mut();
            rt.heartbeat_timer = None;
            let Some(channel) = rt.channel.as_ref().filter(|channel| channel.open) else {
                return;
            };
            (channel.handle.clone(), rt.last_heartbeat)
        };

        let now = self.scheduler.now();
        let silent_for = last.map(|last| elapsed_between(last, now)).unwrap_or_default();
        if silent_for > self.config.heartbeat_timeout {
            crate::log_warn!(
                "No heartbeat for {}s, closing realtime channel",
                silent_for.as_secs()
            );
            handle.close(close_code::HEARTBEAT_TIMEOUT, "heartbeat timeout");
            self.handle_close(close_code::HEARTBEAT_TIMEOUT, "heartbeat timeout".to_string());
            return;
        }

        let _ = handle.send_text(PING_FRAME);
        self.start_heartbeat();
    }

    fn start_presence(&self) {
        let interval = {
            let rt = self.runtime.borrow();
            let open = rt.channel.as_ref().is_some_and(|channel| channel.open);
            match rt.presence.interval {
                Some(interval) if open && !rt.presence.paused && rt.presence.timer.is_none() => {
                    interval
                }
                _ => return,
            }
        };

        let this = self.this.clone();
        let id = self.scheduler.set_timeout(
            interval,
            Box::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.presence_tick();
                }
            }),
        );
        self.runtime.borrow_mut().presence.timer = Some(id);
    }

    fn presence_tick(&self) {
        self.runtime.borrow_mut().presence.timer = None;
        if let Some(handle) = self.open_channel_handle() {
            let _ = handle.send_text(PRESENCE_PING_FRAME);
        }
        self.start_presence();
    }
}

impl ChannelListener for ManagerInner {
    fn on_channel_event(&self, generation: u64, event: ChannelEvent) {
        if !self.is_current(generation) {
            crate::log_debug!("Ignoring event from stale channel {}", generation);
            return;
        }
        match event {
            ChannelEvent::Opened => self.handle_open(),
            ChannelEvent::Frame(frame) => self.handle_frame(frame),
            ChannelEvent::Closed { code, reason } => self.handle_close(code, reason),
            ChannelEvent::Errored(message) => self.handle_transport_error(message),
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let rt = self.runtime.get_mut();
        let timers = [
            rt.heartbeat_timer.take(),
            rt.reconnect_timer.take(),
            rt.presence.timer.take(),
        ];
        for id in timers.into_iter().flatten() {
            self.scheduler.clear_timeout(id);
        }
        if let Some(channel) = rt.channel.take() {
            channel.handle.close(close_code::NORMAL, "client dropped");
        }
    }
}
