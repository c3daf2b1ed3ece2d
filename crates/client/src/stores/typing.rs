//! Typing-indicator store.
//!
//! Entries expire on their own: every `is_typing = true` (re)arms a TTL
//! timer for that actor, and the timer deletes the entry if nothing
//! refreshed it. Timers go through the injected [`Scheduler`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use supportkit_shared::{Actor, ActorType, ConversationTypingPayload};

use crate::scheduler::{Scheduler, TimerId};
use crate::store::{Store, Unsubscribe};

pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(6);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub actor: Actor,
    pub preview: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub type ConversationTyping = HashMap<Actor, TypingEntry>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypingState {
    pub conversations: HashMap<String, Rc<ConversationTyping>>,
}

impl TypingState {
    pub fn entries(&self, conversation_id: &str) -> Option<&Rc<ConversationTyping>> {
        self.conversations.get(conversation_id)
    }

    pub fn is_typing(&self, conversation_id: &str, actor: &Actor) -> bool {
        self.conversations
            .get(conversation_id)
            .is_some_and(|entries| entries.contains_key(actor))
    }
}

type TimerKey = (String, Actor);

#[derive(Clone)]
pub struct TypingStore {
    inner: Rc<TypingInner>,
}

struct TypingInner {
    store: Store<TypingState>,
    scheduler: Rc<dyn Scheduler>,
    ttl: Duration,
    timers: RefCell<HashMap<TimerKey, TimerId>>,
    this: Weak<TypingInner>,
}

impl TypingStore {
    pub fn new(scheduler: Rc<dyn Scheduler>, ttl: Duration) -> Self {
        let inner = Rc::new_cyclic(|this| TypingInner {
            store: Store::new(TypingState::default(), scheduler.clone()),
            scheduler,
            ttl,
            timers: RefCell::new(HashMap::new()),
            this: this.clone(),
        });
        Self { inner }
    }

    pub fn store(&self) -> &Store<TypingState> {
        &self.inner.store
    }

    pub fn get_state(&self) -> Rc<TypingState> {
        self.inner.store.get_state()
    }

    pub fn subscribe(&self, listener: impl Fn(&Rc<TypingState>) + 'static) -> Unsubscribe {
        self.inner.store.subscribe(listener)
    }

    pub fn set_typing(
        &self,
        conversation_id: &str,
        actor: &Actor,
        is_typing: bool,
        preview: Option<&str>,
    ) {
        let key = (conversation_id.to_string(), actor.clone());
        self.inner.cancel_timer(&key);

        if !is_typing {
            self.inner.store.set_state(|state| {
                remove_entries(state, conversation_id, |entry_actor| entry_actor == actor)
            });
            return;
        }

        let entry = TypingEntry {
            actor: actor.clone(),
            preview: preview.map(str::to_string),
            updated_at: self.inner.scheduler.now(),
        };
        self.inner.store.set_state(|state| {
            let current = state.conversations.get(conversation_id);
            if current.and_then(|entries| entries.get(actor)) == Some(&entry) {
                return state.clone();
            }
            let mut entries = current
                .map(|entries| ConversationTyping::clone(entries))
                .unwrap_or_default();
            entries.insert(actor.clone(), entry);
            let mut next = TypingState::clone(state);
            next.conversations
                .insert(conversation_id.to_string(), Rc::new(entries));
            Rc::new(next)
        });

        let this = self.inner.this.clone();
        let expired = key.clone();
        let id = self.inner.scheduler.set_timeout(
            self.inner.ttl,
            Box::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.expire(expired);
                }
            }),
        );
        self.inner.timers.borrow_mut().insert(key, id);
    }

    pub fn apply_realtime(&self, payload: &ConversationTypingPayload) {
        let Some(actor) = payload.actor() else {
            crate::log_debug!(
                "Ignoring conversationTyping without an actor for {}",
                payload.conversation_id
            );
            return;
        };
        self.set_typing(
            &payload.conversation_id,
            &actor,
            payload.is_typing,
            payload.visitor_preview.as_deref(),
        );
    }

    /// A new item arrived from `sender`. A human item clears every typing
    /// entry in the conversation; an AI agent's item clears everyone except
    /// that agent.
    pub fn clear_for_new_item(&self, conversation_id: &str, sender: Option<&Actor>) {
        let keep = sender.filter(|actor| actor.actor_type == ActorType::AiAgent);
        let removed: Vec<Actor> = match self.get_state().entries(conversation_id) {
            Some(entries) => entries
                .keys()
                .filter(|actor| Some(*actor) != keep)
                .cloned()
                .collect(),
            None => return,
        };
        if removed.is_empty() {
            return;
        }

        for actor in &removed {
            self.inner
                .cancel_timer(&(conversation_id.to_string(), actor.clone()));
        }
        self.inner.store.set_state(|state| {
            remove_entries(state, conversation_id, |actor| removed.contains(actor))
        });
    }

    pub fn clear_conversation(&self, conversation_id: &str) {
        let timers: Vec<TimerId> = {
            let mut timers = self.inner.timers.borrow_mut();
            let keys: Vec<TimerKey> = timers
                .keys()
                .filter(|(conversation, _)| conversation == conversation_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| timers.remove(key)).collect()
        };
        for id in timers {
            self.inner.scheduler.clear_timeout(id);
        }
        self.inner.store.set_state(|state| {
            if !state.conversations.contains_key(conversation_id) {
                return state.clone();
            }
            let mut next = TypingState::clone(state);
            next.conversations.remove(conversation_id);
            Rc::new(next)
        });
    }

    pub fn clear_all(&self) {
        let timers: Vec<TimerId> = self
            .inner
            .timers
            .borrow_mut()
            .drain()
            .map(|(_, id)| id)
            .collect();
        for id in timers {
            self.inner.scheduler.clear_timeout(id);
        }
        self.inner.store.set_state(|state| {
            if state.conversations.is_empty() {
                state.clone()
            } else {
                Rc::new(TypingState::default())
            }
        });
    }
}

impl TypingInner {
    fn cancel_timer(&self, key: &TimerKey) {
        let id = self.timers.borrow_mut().remove(key);
        if let Some(id) = id {
            self.scheduler.clear_timeout(id);
        }
    }

    fn expire(&self, key: TimerKey) {
        self.timers.borrow_mut().remove(&key);
        let (conversation_id, actor) = key;
        self.store.set_state(|state| {
            remove_entries(state, &conversation_id, |entry_actor| *entry_actor == actor)
        });
    }
}

impl Drop for TypingInner {
    fn drop(&mut self) {
        for (_, id) in self.timers.get_mut().drain() {
            self.scheduler.clear_timeout(id);
        }
    }
}

fn remove_entries(
    state: &Rc<TypingState>,
    conversation_id: &str,
    matches: impl Fn(&Actor) -> bool,
) -> Rc<TypingState> {
    let Some(entries) = state.conversations.get(conversation_id) else {
        return state.clone();
    };
    if !entries.keys().any(&matches) {
        return state.clone();
    }

    let remaining: ConversationTyping = entries
        .iter()
        .filter(|(actor, _)| !matches(*actor))
        .map(|(actor, entry)| (actor.clone(), entry.clone()))
        .collect();
    let mut next = TypingState::clone(state);
    if remaining.is_empty() {
        next.conversations.remove(conversation_id);
    } else {
        next.conversations
            .insert(conversation_id.to_string(), Rc::new(remaining));
    }
    Rc::new(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::VirtualScheduler;

    fn setup() -> (Rc<VirtualScheduler>, TypingStore) {
        let scheduler = Rc::new(VirtualScheduler::new());
        let store = TypingStore::new(scheduler.clone(), DEFAULT_TYPING_TTL);
        (scheduler, store)
    }

    #[test]
    fn entries_expire_after_the_ttl() {
        let (scheduler, store) = setup();
        let visitor = Actor::visitor("v1");
        store.set_typing("conv", &visitor, true, Some("hel"));

        scheduler.advance(Duration::from_millis(5_999));
        assert!(store.get_state().is_typing("conv", &visitor));

        scheduler.advance(Duration::from_millis(2));
        assert!(!store.get_state().is_typing("conv", &visitor));
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn refreshing_rearms_the_timer() {
        let (scheduler, store) = setup();
        let visitor = Actor::visitor("v1");
        store.set_typing("conv", &visitor, true, Some("h"));
        scheduler.advance(Duration::from_secs(4));
        store.set_typing("conv", &visitor, true, Some("hello"));
        scheduler.advance(Duration::from_secs(4));

        let state = store.get_state();
        let entry = state.entries("conv").unwrap().get(&visitor).unwrap();
        assert_eq!(entry.preview.as_deref(), Some("hello"));
        assert_eq!(scheduler.pending_timers(), 1);
    }

    #[test]
    fn repeated_typing_event_keeps_the_snapshot() {
        let (scheduler, store) = setup();
        let visitor = Actor::visitor("v1");

        store.set_typing("conv", &visitor, true, Some("hi"));
        let first = store.get_state();
        store.set_typing("conv", &visitor, true, Some("hi"));
        assert!(Rc::ptr_eq(&first, &store.get_state()));

        scheduler.advance(Duration::from_millis(5_000));
        store.set_typing("conv", &visitor, true, Some("hi"));
        scheduler.advance(Duration::from_millis(5_000));
        assert!(store.get_state().is_typing("conv", &visitor));
    }

    #[test]
    fn stop_typing_removes_immediately() {
        let (scheduler, store) = setup();
        let user = Actor::user("u1");
        store.set_typing("conv", &user, true, None);
        store.set_typing("conv", &user, false, None);

        assert!(store.get_state().entries("conv").is_none());
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn human_item_clears_the_whole_conversation() {
        let (scheduler, store) = setup();
        store.set_typing("conv", &Actor::user("u1"), true, None);
        store.set_typing("conv", &Actor::ai_agent("ai"), true, None);
        store.set_typing("other", &Actor::visitor("v1"), true, None);

        store.clear_for_new_item("conv", Some(&Actor::visitor("v1")));

        let state = store.get_state();
        assert!(state.entries("conv").is_none());
        assert!(state.is_typing("other", &Actor::visitor("v1")));
        assert_eq!(scheduler.pending_timers(), 1);
    }

    #[test]
    fn ai_item_keeps_only_its_own_indicator() {
        let (_scheduler, store) = setup();
        let ai = Actor::ai_agent("ai");
        store.set_typing("conv", &Actor::user("u1"), true, None);
        store.set_typing("conv", &ai, true, None);

        store.clear_for_new_item("conv", Some(&ai));

        let state = store.get_state();
        assert!(state.is_typing("conv", &ai));
        assert!(!state.is_typing("conv", &Actor::user("u1")));
    }

    #[test]
    fn clearing_a_conversation_cancels_its_timers_first() {
        let (scheduler, store) = setup();
        let visitor = Actor::visitor("v1");
        store.set_typing("conv", &visitor, true, None);
        store.clear_conversation("conv");
        assert_eq!(scheduler.pending_timers(), 0);

        let snapshot = store.get_state();
        scheduler.advance(Duration::from_secs(10));
        assert!(Rc::ptr_eq(&snapshot, &store.get_state()));
    }

    #[test]
    fn realtime_payload_uses_the_resolved_actor() {
        let (_scheduler, store) = setup();
        store.apply_realtime(&ConversationTypingPayload {
            organization_id: "org".into(),
            website_id: "ws".into(),
            conversation_id: "conv".into(),
            user_id: None,
            visitor_id: Some("v1".into()),
            ai_agent_id: Some("ai".into()),
            is_typing: true,
            visitor_preview: None,
        });
        let state = store.get_state();
        assert!(state.is_typing("conv", &Actor::ai_agent("ai")));
        assert!(!state.is_typing("conv", &Actor::visitor("v1")));
    }
}
