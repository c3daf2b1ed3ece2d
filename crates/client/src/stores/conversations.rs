//! Conversation store.
//!
//! Conversations are normalized into a map keyed by id plus an ordered id
//! list. The list follows the server's listing order: page 1 defines the
//! head, later pages extend the tail, and ids learned from elsewhere are
//! kept behind the page they were not part of.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use supportkit_shared::{Conversation, ConversationsPagination, TimelineItem};

use crate::scheduler::Scheduler;
use crate::store::{Store, Unsubscribe};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationsState {
    pub by_id: HashMap<String, Conversation>,
    pub ids: Vec<String>,
    pub pagination: Option<ConversationsPagination>,
}

impl ConversationsState {
    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.by_id.get(id)
    }

    /// Conversations in list order.
    pub fn ordered(&self) -> impl Iterator<Item = &Conversation> {
        self.ids.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// --- Pure transitions ---

pub fn ingest_page(
    state: &Rc<ConversationsState>,
    conversations: &[Conversation],
    pagination: Option<&ConversationsPagination>,
) -> Rc<ConversationsState> {
    let mut next: Option<ConversationsState> = None;

    for conversation in conversations {
        let stored = next
            .as_ref()
            .map_or(&state.by_id, |next| &next.by_id)
            .get(&conversation.id);
        if stored != Some(conversation) {
            next.get_or_insert_with(|| ConversationsState::clone(state))
                .by_id
                .insert(conversation.id.clone(), conversation.clone());
        }
    }

    let mut page_ids = Vec::with_capacity(conversations.len());
    let mut in_page = HashSet::with_capacity(conversations.len());
    for conversation in conversations {
        if in_page.insert(conversation.id.as_str()) {
            page_ids.push(conversation.id.clone());
        }
    }

    let first_page = pagination.map_or(true, |p| p.page <= 1);
    let ids: Vec<String> = if first_page {
        let rest = state
            .ids
            .iter()
            .filter(|id| !in_page.contains(id.as_str()))
            .cloned();
        page_ids.into_iter().chain(rest).collect()
    } else {
        let known: HashSet<&str> = state.ids.iter().map(String::as_str).collect();
        let fresh = page_ids
            .into_iter()
            .filter(|id| !known.contains(id.as_str()));
        state.ids.iter().cloned().chain(fresh).collect()
    };
    if ids != state.ids {
        next.get_or_insert_with(|| ConversationsState::clone(state)).ids = ids;
    }

    if let Some(pagination) = pagination {
        if state.pagination.as_ref() != Some(pagination) {
            next.get_or_insert_with(|| ConversationsState::clone(state))
                .pagination = Some(pagination.clone());
        }
    }

    match next {
        Some(next) => Rc::new(next),
        None => state.clone(),
    }
}

/// Insert or replace one conversation; unknown ids go to the front.
pub fn ingest_single(
    state: &Rc<ConversationsState>,
    conversation: &Conversation,
) -> Rc<ConversationsState> {
    match state.by_id.get(&conversation.id) {
        Some(existing) if existing == conversation => state.clone(),
        existing => {
            let is_new = existing.is_none();
            let mut next = ConversationsState::clone(state);
            next.by_id
                .insert(conversation.id.clone(), conversation.clone());
            if is_new {
                next.ids.insert(0, conversation.id.clone());
            }
            Rc::new(next)
        }
    }
}

/// Record `item` as the conversation's latest item unless an item at least
/// as recent is already there.
pub fn apply_timeline_item(
    state: &Rc<ConversationsState>,
    conversation_id: &str,
    item: &TimelineItem,
) -> Rc<ConversationsState> {
    let Some(conversation) = state.by_id.get(conversation_id) else {
        return state.clone();
    };
    let is_newer = match &conversation.last_item {
        Some(last) if last.id == item.id => last != item,
        Some(last) => item.created_at > last.created_at,
        None => true,
    };
    if !is_newer {
        return state.clone();
    }

    let mut updated = conversation.clone();
    updated.updated_at = updated.updated_at.max(item.created_at);
    updated.last_item = Some(item.clone());
    with_conversation(state, updated)
}

/// `item` is the server's copy of the optimistic item `optimistic_id`. While
/// the optimistic item is still the latest one, `item` takes its place
/// whatever its timestamp.
pub fn replace_last_item(
    state: &Rc<ConversationsState>,
    conversation_id: &str,
    optimistic_id: &str,
    item: &TimelineItem,
) -> Rc<ConversationsState> {
    let Some(conversation) = state.by_id.get(conversation_id) else {
        return state.clone();
    };
    if !last_item_is(conversation, optimistic_id) {
        return apply_timeline_item(state, conversation_id, item);
    }

    let mut updated = conversation.clone();
    updated.updated_at = updated.updated_at.max(item.created_at);
    updated.last_item = Some(item.clone());
    with_conversation(state, updated)
}

/// Undo the optimistic item `optimistic_id`: if it is still the latest item,
/// `last_item` and `updated_at` go back to what `previous` had.
pub fn revert_last_item(
    state: &Rc<ConversationsState>,
    optimistic_id: &str,
    previous: &Conversation,
) -> Rc<ConversationsState> {
    let Some(conversation) = state.by_id.get(&previous.id) else {
        return state.clone();
    };
    if !last_item_is(conversation, optimistic_id) {
        return state.clone();
    }

    let mut reverted = conversation.clone();
    reverted.last_item = previous.last_item.clone();
    reverted.updated_at = previous.updated_at;
    with_conversation(state, reverted)
}

fn last_item_is(conversation: &Conversation, item_id: &str) -> bool {
    conversation
        .last_item
        .as_ref()
        .is_some_and(|last| last.id == item_id)
}

fn with_conversation(
    state: &Rc<ConversationsState>,
    conversation: Conversation,
) -> Rc<ConversationsState> {
    let mut next = ConversationsState::clone(state);
    next.by_id.insert(conversation.id.clone(), conversation);
    Rc::new(next)
}

pub fn remove(state: &Rc<ConversationsState>, conversation_id: &str) -> Rc<ConversationsState> {
    if !state.by_id.contains_key(conversation_id) && !state.ids.iter().any(|id| id == conversation_id)
    {
        return state.clone();
    }
    let mut next = ConversationsState::clone(state);
    next.by_id.remove(conversation_id);
    next.ids.retain(|id| id != conversation_id);
    Rc::new(next)
}

pub fn clear(state: &Rc<ConversationsState>) -> Rc<ConversationsState> {
    if **state == ConversationsState::default() {
        state.clone()
    } else {
        Rc::new(ConversationsState::default())
    }
}

// --- Store ---

#[derive(Clone)]
pub struct ConversationStore {
    store: Store<ConversationsState>,
}

impl ConversationStore {
    pub fn new(scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            store: Store::new(ConversationsState::default(), scheduler),
        }
    }

    pub fn store(&self) -> &Store<ConversationsState> {
        &self.store
    }

    pub fn get_state(&self) -> Rc<ConversationsState> {
        self.store.get_state()
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.store.get_state().get(conversation_id).cloned()
    }

    pub fn subscribe(&self, listener: impl Fn(&Rc<ConversationsState>) + 'static) -> Unsubscribe {
        self.store.subscribe(listener)
    }

    pub fn ingest_page(
        &self,
        conversations: &[Conversation],
        pagination: Option<&ConversationsPagination>,
    ) -> bool {
        self.store
            .set_state(|state| ingest_page(state, conversations, pagination))
    }

    pub fn ingest_single(&self, conversation: &Conversation) -> bool {
        self.store
            .set_state(|state| ingest_single(state, conversation))
    }

    pub fn apply_timeline_item(&self, conversation_id: &str, item: &TimelineItem) -> bool {
        self.store
            .set_state(|state| apply_timeline_item(state, conversation_id, item))
    }

    pub fn replace_last_item(
        &self,
        conversation_id: &str,
        optimistic_id: &str,
        item: &TimelineItem,
    ) -> bool {
        self.store.set_state(|state| {
            replace_last_item(state, conversation_id, optimistic_id, item)
        })
    }

    pub fn revert_last_item(&self, optimistic_id: &str, previous: &Conversation) -> bool {
        self.store
            .set_state(|state| revert_last_item(state, optimistic_id, previous))
    }

    pub fn remove(&self, conversation_id: &str) -> bool {
        self.store.set_state(|state| remove(state, conversation_id))
    }

    pub fn clear(&self) -> bool {
        self.store.set_state(clear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::{conversation, message};

    fn pagination(page: u32) -> ConversationsPagination {
        ConversationsPagination {
            page,
            limit: 2,
            total: 10,
            has_more: true,
        }
    }

    fn ids(state: &ConversationsState) -> Vec<&str> {
        state.ids.iter().map(String::as_str).collect()
    }

    #[test]
    fn ingesting_the_same_page_twice_keeps_the_reference() {
        let empty = Rc::new(ConversationsState::default());
        let page = [conversation("c1", 10), conversation("c2", 5)];

        let once = ingest_page(&empty, &page, Some(&pagination(1)));
        let twice = ingest_page(&once, &page, Some(&pagination(1)));

        assert!(!Rc::ptr_eq(&empty, &once));
        assert!(Rc::ptr_eq(&once, &twice));

        let without_pagination = ingest_page(&twice, &page, None);
        assert!(Rc::ptr_eq(&twice, &without_pagination));
    }

    #[test]
    fn first_page_replaces_the_head_and_keeps_unlisted_ids() {
        let state = Rc::new(ConversationsState::default());
        let state = ingest_page(
            &state,
            &[conversation("c1", 10), conversation("c2", 5)],
            Some(&pagination(1)),
        );
        let state = ingest_single(&state, &conversation("local", 20));
        assert_eq!(ids(&state), vec!["local", "c1", "c2"]);

        let state = ingest_page(
            &state,
            &[conversation("c3", 30), conversation("c1", 10)],
            Some(&pagination(1)),
        );
        assert_eq!(ids(&state), vec!["c3", "c1", "local", "c2"]);
    }

    #[test]
    fn later_pages_append_only_unseen_ids() {
        let state = Rc::new(ConversationsState::default());
        let state = ingest_page(
            &state,
            &[conversation("c1", 10), conversation("c2", 5)],
            Some(&pagination(1)),
        );
        let state = ingest_page(
            &state,
            &[conversation("c2", 5), conversation("c3", 1)],
            Some(&pagination(2)),
        );
        assert_eq!(ids(&state), vec!["c1", "c2", "c3"]);
        assert_eq!(state.pagination.as_ref().map(|p| p.page), Some(2));
    }

    #[test]
    fn timeline_item_only_moves_forward() {
        let state = ingest_single(
            &Rc::new(ConversationsState::default()),
            &conversation("c1", 0),
        );
        let newer = message("m2", "c1", 20);
        let older = message("m1", "c1", 10);

        let state = apply_timeline_item(&state, "c1", &newer);
        let conv = state.get("c1").unwrap();
        assert_eq!(conv.last_item.as_ref().map(|i| i.id.as_str()), Some("m2"));
        assert_eq!(conv.updated_at, newer.created_at);

        let after_older = apply_timeline_item(&state, "c1", &older);
        assert!(Rc::ptr_eq(&state, &after_older));

        let unknown = apply_timeline_item(&state, "nope", &newer);
        assert!(Rc::ptr_eq(&state, &unknown));
    }

    #[test]
    fn server_copy_replaces_the_optimistic_last_item() {
        let state = ingest_single(
            &Rc::new(ConversationsState::default()),
            &conversation("c1", 0),
        );
        let optimistic = message("tmp", "c1", 20);
        let state = apply_timeline_item(&state, "c1", &optimistic);

        let mut confirmed = message("srv", "c1", 15);
        confirmed.text = optimistic.text.clone();
        let replaced = replace_last_item(&state, "c1", "tmp", &confirmed);
        let conv = replaced.get("c1").unwrap();
        assert_eq!(conv.last_item.as_ref().map(|i| i.id.as_str()), Some("srv"));

        let again = replace_last_item(&replaced, "c1", "tmp", &confirmed);
        assert!(Rc::ptr_eq(&replaced, &again));
    }

    #[test]
    fn newer_item_is_kept_when_the_server_copy_arrives() {
        let state = ingest_single(
            &Rc::new(ConversationsState::default()),
            &conversation("c1", 0),
        );
        let state = apply_timeline_item(&state, "c1", &message("tmp", "c1", 20));
        let state = apply_timeline_item(&state, "c1", &message("reply", "c1", 30));

        let after = replace_last_item(&state, "c1", "tmp", &message("srv", "c1", 20));
        assert!(Rc::ptr_eq(&state, &after));
    }

    #[test]
    fn reverting_restores_the_previous_last_item() {
        let state = ingest_single(
            &Rc::new(ConversationsState::default()),
            &conversation("c1", 0),
        );
        let state = apply_timeline_item(&state, "c1", &message("m0", "c1", 5));
        let previous = state.get("c1").cloned().unwrap();

        let optimistic = apply_timeline_item(&state, "c1", &message("tmp", "c1", 20));
        let reverted = revert_last_item(&optimistic, "tmp", &previous);
        assert_eq!(reverted.get("c1"), Some(&previous));

        let untouched = revert_last_item(&state, "tmp", &previous);
        assert!(Rc::ptr_eq(&state, &untouched));
    }

    #[test]
    fn remove_and_clear() {
        let state = ingest_single(
            &Rc::new(ConversationsState::default()),
            &conversation("c1", 0),
        );
        assert!(Rc::ptr_eq(&state, &remove(&state, "missing")));

        let removed = remove(&state, "c1");
        assert!(removed.is_empty());
        assert!(removed.get("c1").is_none());

        let cleared = clear(&removed);
        assert!(Rc::ptr_eq(&removed, &cleared));
    }
}
