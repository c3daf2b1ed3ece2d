//! Seen-receipt store. Timestamps only ever move forward.

use std::collections::HashMap;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use supportkit_shared::{Actor, ConversationSeenEntry, ConversationSeenPayload};

use crate::scheduler::Scheduler;
use crate::store::{Store, Unsubscribe};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenEntry {
    pub actor: Actor,
    pub last_seen_at: DateTime<Utc>,
}

pub type ConversationSeen = HashMap<Actor, SeenEntry>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeenState {
    pub conversations: HashMap<String, Rc<ConversationSeen>>,
}

impl SeenState {
    pub fn entries(&self, conversation_id: &str) -> Option<&Rc<ConversationSeen>> {
        self.conversations.get(conversation_id)
    }

    pub fn last_seen_at(&self, conversation_id: &str, actor: &Actor) -> Option<DateTime<Utc>> {
        self.conversations
            .get(conversation_id)
            .and_then(|entries| entries.get(actor))
            .map(|entry| entry.last_seen_at)
    }
}

/// Apply each `(actor, timestamp)` if it is newer than what is stored.
fn apply_writes(
    state: &Rc<SeenState>,
    conversation_id: &str,
    writes: impl IntoIterator<Item = (Actor, DateTime<Utc>)>,
) -> Rc<SeenState> {
    let current = state.conversations.get(conversation_id);
    let mut entries: Option<ConversationSeen> = None;

    for (actor, last_seen_at) in writes {
        let stored = entries
            .as_ref()
            .or(current.map(|c| c.as_ref()))
            .and_then(|e| e.get(&actor))
            .map(|entry| entry.last_seen_at);
        if stored.is_some_and(|stored| stored >= last_seen_at) {
            continue;
        }
        entries
            .get_or_insert_with(|| current.map(|c| ConversationSeen::clone(c)).unwrap_or_default())
            .insert(actor.clone(), SeenEntry { actor, last_seen_at });
    }

    let Some(entries) = entries else {
        return state.clone();
    };
    let mut next = SeenState::clone(state);
    next.conversations
        .insert(conversation_id.to_string(), Rc::new(entries));
    Rc::new(next)
}

// --- Pure transitions ---

pub fn upsert_seen(
    state: &Rc<SeenState>,
    conversation_id: &str,
    actor: &Actor,
    last_seen_at: DateTime<Utc>,
) -> Rc<SeenState> {
    apply_writes(state, conversation_id, [(actor.clone(), last_seen_at)])
}

/// Merge a REST snapshot. Entries without a resolvable actor are skipped.
pub fn hydrate(
    state: &Rc<SeenState>,
    conversation_id: &str,
    entries: &[ConversationSeenEntry],
) -> Rc<SeenState> {
    let writes = entries.iter().filter_map(|entry| {
        let actor = entry.actor();
        if actor.is_none() {
            crate::log_debug!("Skipping seen entry without an actor in {}", conversation_id);
        }
        actor.map(|actor| (actor, entry.last_seen_at))
    });
    apply_writes(state, conversation_id, writes)
}

pub fn apply_realtime(state: &Rc<SeenState>, payload: &ConversationSeenPayload) -> Rc<SeenState> {
    match payload.actor() {
        Some(actor) => upsert_seen(state, &payload.conversation_id, &actor, payload.last_seen_at),
        None => {
            crate::log_debug!(
                "Ignoring conversationSeen without an actor for {}",
                payload.conversation_id
            );
            state.clone()
        }
    }
}

pub fn clear_conversation(state: &Rc<SeenState>, conversation_id: &str) -> Rc<SeenState> {
    if !state.conversations.contains_key(conversation_id) {
        return state.clone();
    }
    let mut next = SeenState::clone(state);
    next.conversations.remove(conversation_id);
    Rc::new(next)
}

// --- Store ---

#[derive(Clone)]
pub struct SeenStore {
    store: Store<SeenState>,
}

impl SeenStore {
    pub fn new(scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            store: Store::new(SeenState::default(), scheduler),
        }
    }

    pub fn store(&self) -> &Store<SeenState> {
        &self.store
    }

    pub fn get_state(&self) -> Rc<SeenState> {
        self.store.get_state()
    }

    pub fn subscribe(&self, listener: impl Fn(&Rc<SeenState>) + 'static) -> Unsubscribe {
        self.store.subscribe(listener)
    }

    pub fn upsert_seen(
        &self,
        conversation_id: &str,
        actor: &Actor,
        last_seen_at: DateTime<Utc>,
    ) -> bool {
        self.store
            .set_state(|state| upsert_seen(state, conversation_id, actor, last_seen_at))
    }

    pub fn hydrate(&self, conversation_id: &str, entries: &[ConversationSeenEntry]) -> bool {
        self.store
            .set_state(|state| hydrate(state, conversation_id, entries))
    }

    pub fn apply_realtime(&self, payload: &ConversationSeenPayload) -> bool {
        self.store.set_state(|state| apply_realtime(state, payload))
    }

    pub fn clear_conversation(&self, conversation_id: &str) -> bool {
        self.store
            .set_state(|state| clear_conversation(state, conversation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::at;
    use supportkit_shared::ActorType;

    fn entry(user_id: Option<&str>, visitor_id: Option<&str>, seconds: i64) -> ConversationSeenEntry {
        ConversationSeenEntry {
            conversation_id: "c1".into(),
            actor_type: None,
            actor_id: None,
            user_id: user_id.map(str::to_string),
            visitor_id: visitor_id.map(str::to_string),
            ai_agent_id: None,
            last_seen_at: at(seconds),
        }
    }

    #[test]
    fn seen_is_monotonic() {
        let visitor = Actor::visitor("vis_1");
        let state = Rc::new(SeenState::default());
        let state = upsert_seen(&state, "c1", &visitor, at(20));

        let older = upsert_seen(&state, "c1", &visitor, at(10));
        assert!(Rc::ptr_eq(&state, &older));
        let same = upsert_seen(&state, "c1", &visitor, at(20));
        assert!(Rc::ptr_eq(&state, &same));

        let newer = upsert_seen(&state, "c1", &visitor, at(30));
        assert_eq!(newer.last_seen_at("c1", &visitor), Some(at(30)));
    }

    #[test]
    fn hydrate_resolves_actors_and_skips_unknown() {
        let state = Rc::new(SeenState::default());
        let mut explicit = entry(None, Some("vis_1"), 5);
        explicit.actor_type = Some(ActorType::AiAgent);
        explicit.actor_id = Some("ai_1".into());

        let state = hydrate(
            &state,
            "c1",
            &[
                entry(Some("usr_1"), Some("vis_1"), 10),
                entry(None, Some("vis_1"), 12),
                entry(None, None, 99),
                explicit,
            ],
        );

        let entries = state.entries("c1").unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(state.last_seen_at("c1", &Actor::user("usr_1")), Some(at(10)));
        assert_eq!(state.last_seen_at("c1", &Actor::visitor("vis_1")), Some(at(12)));
        assert_eq!(state.last_seen_at("c1", &Actor::ai_agent("ai_1")), Some(at(5)));
    }

    #[test]
    fn hydrate_never_moves_backwards() {
        let visitor = Actor::visitor("vis_1");
        let state = upsert_seen(&Rc::new(SeenState::default()), "c1", &visitor, at(50));
        let hydrated = hydrate(&state, "c1", &[entry(None, Some("vis_1"), 40)]);
        assert!(Rc::ptr_eq(&state, &hydrated));
    }

    #[test]
    fn clearing_one_conversation_leaves_others() {
        let visitor = Actor::visitor("vis_1");
        let state = Rc::new(SeenState::default());
        let state = upsert_seen(&state, "c1", &visitor, at(1));
        let state = upsert_seen(&state, "c2", &visitor, at(1));
        let other = state.entries("c2").cloned().unwrap();

        let cleared = clear_conversation(&state, "c1");
        assert!(cleared.entries("c1").is_none());
        assert!(Rc::ptr_eq(&other, cleared.entries("c2").unwrap()));
    }
}
