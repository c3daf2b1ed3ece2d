//! Normalized entity stores.
//!
//! Each store wraps a [`Store`](crate::store::Store) and exposes its
//! transitions both as pure functions over the snapshot and as methods on
//! the store handle.

pub mod conversations;
pub mod seen;
pub mod timeline;
pub mod typing;

pub use conversations::{ConversationStore, ConversationsState};
pub use seen::{SeenEntry, SeenState, SeenStore};
pub use timeline::{ConversationTimeline, TimelineItemStore, TimelineItemsState};
pub use typing::{TypingEntry, TypingState, TypingStore, DEFAULT_TYPING_TTL};
