//! Timeline-item store: per-conversation item lists kept sorted by
//! `created_at`, merged by id.
//!
//! Every transition returns the original snapshot when it would not change
//! anything, and only the touched conversation's timeline is replaced, so
//! subscribers can compare by pointer at either level.

use std::collections::HashMap;
use std::rc::Rc;

use supportkit_shared::{TimelineItem, TimelineItemPayload, TimelinePage};

use crate::scheduler::Scheduler;
use crate::store::{Store, Unsubscribe};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationTimeline {
    /// Sorted ascending by `created_at`; ties keep insertion order.
    pub items: Vec<TimelineItem>,
    pub has_next_page: bool,
    pub next_cursor: Option<String>,
}

impl ConversationTimeline {
    pub fn get(&self, item_id: &str) -> Option<&TimelineItem> {
        self.items.iter().find(|item| item.id == item_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelineItemsState {
    pub conversations: HashMap<String, Rc<ConversationTimeline>>,
}

impl TimelineItemsState {
    pub fn timeline(&self, conversation_id: &str) -> Option<&Rc<ConversationTimeline>> {
        self.conversations.get(conversation_id)
    }

    pub fn items(&self, conversation_id: &str) -> &[TimelineItem] {
        self.conversations
            .get(conversation_id)
            .map(|timeline| timeline.items.as_slice())
            .unwrap_or_default()
    }
}

/// Overlay `incoming` onto `existing` by id (incoming wins) and re-sort.
/// `None` when every incoming item is already present and equal.
fn merge_items(existing: &[TimelineItem], incoming: &[TimelineItem]) -> Option<Vec<TimelineItem>> {
    let mut items = existing.to_vec();
    let mut index: HashMap<String, usize> = items
        .iter()
        .enumerate()
        .map(|(position, item)| (item.id.clone(), position))
        .collect();
    let mut changed = false;

    for item in incoming {
        match index.get(&item.id) {
            Some(&position) => {
                if items[position] != *item {
                    items[position] = item.clone();
                    changed = true;
                }
            }
            None => {
                index.insert(item.id.clone(), items.len());
                items.push(item.clone());
                changed = true;
            }
        }
    }

    if !changed {
        return None;
    }
    items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Some(items)
}

fn with_timeline(
    state: &Rc<TimelineItemsState>,
    conversation_id: &str,
    timeline: ConversationTimeline,
) -> Rc<TimelineItemsState> {
    let mut next = TimelineItemsState::clone(state);
    next.conversations
        .insert(conversation_id.to_string(), Rc::new(timeline));
    Rc::new(next)
}

// --- Pure transitions ---

pub fn ingest_page(
    state: &Rc<TimelineItemsState>,
    conversation_id: &str,
    page: &TimelinePage,
) -> Rc<TimelineItemsState> {
    let current = state.conversations.get(conversation_id);
    let existing = current.map(|t| t.items.as_slice()).unwrap_or_default();
    let merged = merge_items(existing, &page.items);

    let cursor_changed = current.map_or(true, |t| {
        t.has_next_page != page.has_next_page || t.next_cursor != page.next_cursor
    });
    if merged.is_none() && !cursor_changed {
        return state.clone();
    }

    let items = merged.unwrap_or_else(|| existing.to_vec());
    with_timeline(
        state,
        conversation_id,
        ConversationTimeline {
            items,
            has_next_page: page.has_next_page,
            next_cursor: page.next_cursor.clone(),
        },
    )
}

pub fn ingest_single(
    state: &Rc<TimelineItemsState>,
    conversation_id: &str,
    item: &TimelineItem,
) -> Rc<TimelineItemsState> {
    let current = state.conversations.get(conversation_id);
    let existing = current.map(|t| t.items.as_slice()).unwrap_or_default();
    let Some(items) = merge_items(existing, std::slice::from_ref(item)) else {
        return state.clone();
    };
    let mut timeline = current.map(|t| ConversationTimeline::clone(t)).unwrap_or_default();
    timeline.items = items;
    with_timeline(state, conversation_id, timeline)
}

pub fn remove(
    state: &Rc<TimelineItemsState>,
    conversation_id: &str,
    item_id: &str,
) -> Rc<TimelineItemsState> {
    let Some(current) = state.conversations.get(conversation_id) else {
        return state.clone();
    };
    if current.get(item_id).is_none() {
        return state.clone();
    }
    let mut timeline = ConversationTimeline::clone(current);
    timeline.items.retain(|item| item.id != item_id);
    with_timeline(state, conversation_id, timeline)
}

/// Replace an optimistic item with the server's copy in one transition.
pub fn finalize(
    state: &Rc<TimelineItemsState>,
    conversation_id: &str,
    optimistic_id: &str,
    item: &TimelineItem,
) -> Rc<TimelineItemsState> {
    let current = state.conversations.get(conversation_id);
    let existing = current.map(|t| t.items.as_slice()).unwrap_or_default();

    let had_optimistic = optimistic_id != item.id && existing.iter().any(|i| i.id == optimistic_id);
    let without_optimistic: Vec<TimelineItem> = if had_optimistic {
        existing
            .iter()
            .filter(|i| i.id != optimistic_id)
            .cloned()
            .collect()
    } else {
        existing.to_vec()
    };

    let items = match merge_items(&without_optimistic, std::slice::from_ref(item)) {
        Some(items) => items,
        None if had_optimistic => without_optimistic,
        None => return state.clone(),
    };
    let mut timeline = current.map(|t| ConversationTimeline::clone(t)).unwrap_or_default();
    timeline.items = items;
    with_timeline(state, conversation_id, timeline)
}

pub fn clear_conversation(
    state: &Rc<TimelineItemsState>,
    conversation_id: &str,
) -> Rc<TimelineItemsState> {
    if !state.conversations.contains_key(conversation_id) {
        return state.clone();
    }
    let mut next = TimelineItemsState::clone(state);
    next.conversations.remove(conversation_id);
    Rc::new(next)
}

// --- Store ---

#[derive(Clone)]
pub struct TimelineItemStore {
    store: Store<TimelineItemsState>,
}

impl TimelineItemStore {
    pub fn new(scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            store: Store::new(TimelineItemsState::default(), scheduler),
        }
    }

    pub fn store(&self) -> &Store<TimelineItemsState> {
        &self.store
    }

    pub fn get_state(&self) -> Rc<TimelineItemsState> {
        self.store.get_state()
    }

    pub fn items(&self, conversation_id: &str) -> Vec<TimelineItem> {
        self.store.get_state().items(conversation_id).to_vec()
    }

    pub fn subscribe(&self, listener: impl Fn(&Rc<TimelineItemsState>) + 'static) -> Unsubscribe {
        self.store.subscribe(listener)
    }

    pub fn ingest_page(&self, conversation_id: &str, page: &TimelinePage) -> bool {
        self.store
            .set_state(|state| ingest_page(state, conversation_id, page))
    }

    pub fn ingest_single(&self, conversation_id: &str, item: &TimelineItem) -> bool {
        self.store
            .set_state(|state| ingest_single(state, conversation_id, item))
    }

    /// Merge an item pushed over the realtime channel and hand it back.
    pub fn ingest_realtime(&self, payload: &TimelineItemPayload) -> TimelineItem {
        self.ingest_single(&payload.conversation_id, &payload.item);
        payload.item.clone()
    }

    pub fn remove(&self, conversation_id: &str, item_id: &str) -> bool {
        self.store
            .set_state(|state| remove(state, conversation_id, item_id))
    }

    pub fn finalize(&self, conversation_id: &str, optimistic_id: &str, item: &TimelineItem) -> bool {
        self.store
            .set_state(|state| finalize(state, conversation_id, optimistic_id, item))
    }

    pub fn clear_conversation(&self, conversation_id: &str) -> bool {
        self.store
            .set_state(|state| clear_conversation(state, conversation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::VirtualScheduler;
    use crate::testing::fixtures::message;
    use std::cell::Cell;

    fn page(items: Vec<TimelineItem>) -> TimelinePage {
        TimelinePage {
            items,
            has_next_page: false,
            next_cursor: None,
        }
    }

    fn ids(state: &TimelineItemsState, conversation_id: &str) -> Vec<String> {
        state
            .items(conversation_id)
            .iter()
            .map(|item| item.id.clone())
            .collect()
    }

    #[test]
    fn merge_is_idempotent() {
        let empty = Rc::new(TimelineItemsState::default());
        let items = page(vec![message("a", "c1", 1), message("b", "c1", 2)]);

        let first = ingest_page(&empty, "c1", &items);
        let second = ingest_page(&first, "c1", &items);
        assert!(Rc::ptr_eq(&first, &second));

        let single = ingest_single(&first, "c1", &message("a", "c1", 1));
        assert!(Rc::ptr_eq(&first, &single));
    }

    #[test]
    fn items_stay_sorted_with_stable_ties() {
        let state = Rc::new(TimelineItemsState::default());
        let state = ingest_page(
            &state,
            "c1",
            &page(vec![
                message("late", "c1", 30),
                message("tie-1", "c1", 10),
                message("early", "c1", 5),
                message("tie-2", "c1", 10),
            ]),
        );
        assert_eq!(ids(&state, "c1"), vec!["early", "tie-1", "tie-2", "late"]);
    }

    #[test]
    fn incoming_item_wins_and_other_timelines_keep_their_reference() {
        let state = Rc::new(TimelineItemsState::default());
        let state = ingest_single(&state, "c1", &message("a", "c1", 1));
        let state = ingest_single(&state, "c2", &message("x", "c2", 1));
        let other_before = state.timeline("c2").cloned().unwrap();

        let mut edited = message("a", "c1", 1);
        edited.text = Some("edited".into());
        let next = ingest_single(&state, "c1", &edited);

        assert_eq!(next.items("c1")[0].text.as_deref(), Some("edited"));
        assert!(Rc::ptr_eq(&other_before, next.timeline("c2").unwrap()));
    }

    #[test]
    fn finalize_swaps_in_one_transition() {
        let scheduler = Rc::new(VirtualScheduler::new());
        let store = TimelineItemStore::new(scheduler.clone());
        store.ingest_single("c1", &message("m0", "c1", 0));
        store.ingest_single("c1", &message("tmp", "c1", 10));
        scheduler.run_microtasks();

        let notifications = Rc::new(Cell::new(0));
        let counter = notifications.clone();
        let _sub = store.subscribe(move |_| counter.set(counter.get() + 1));

        assert!(store.finalize("c1", "tmp", &message("srv", "c1", 11)));
        scheduler.run_microtasks();

        assert_eq!(notifications.get(), 1);
        assert_eq!(ids(&store.get_state(), "c1"), vec!["m0", "srv"]);
    }

    #[test]
    fn remove_unknown_item_is_a_no_op() {
        let state = ingest_single(
            &Rc::new(TimelineItemsState::default()),
            "c1",
            &message("a", "c1", 1),
        );
        assert!(Rc::ptr_eq(&state, &remove(&state, "c1", "zzz")));
        assert!(Rc::ptr_eq(&state, &remove(&state, "c9", "a")));
        assert!(remove(&state, "c1", "a").items("c1").is_empty());
    }

    #[test]
    fn page_cursor_is_tracked() {
        let state = Rc::new(TimelineItemsState::default());
        let mut first = page(vec![message("b", "c1", 2)]);
        first.has_next_page = true;
        first.next_cursor = Some("cursor-1".into());
        let state = ingest_page(&state, "c1", &first);

        let older = page(vec![message("a", "c1", 1)]);
        let state = ingest_page(&state, "c1", &older);
        let timeline = state.timeline("c1").unwrap();
        assert_eq!(ids(&state, "c1"), vec!["a", "b"]);
        assert!(!timeline.has_next_page);
        assert_eq!(timeline.next_cursor, None);
    }
}
