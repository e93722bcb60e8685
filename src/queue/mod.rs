//! Persisted, reorderable download queue.
//!
//! # Overview
//!
//! - [`QueueItem`] - one requested download, keyed by its content hash
//! - [`QueueStatus`] - item lifecycle states
//! - [`QueueStore`] - JSON-array file rewritten atomically after every change
//! - [`QueueError`] - load/save failures
//!
//! The list order is the processing order: the head is the only item that
//! may be active.

mod error;
mod item;
mod store;

pub use error::QueueError;
pub use item::{QueueItem, QueueStatus, content_hash};
pub use store::{AtomicWriteError, QueueStore, write_json_atomic};

/// Re-sequences `items` by `order` (a list of content hashes).
///
/// Hashes in `order` come first in the given order; unknown or repeated
/// hashes are ignored. Items `order` does not mention keep their relative
/// order after them.
#[must_use]
pub fn apply_order(items: Vec<QueueItem>, order: &[String]) -> Vec<QueueItem> {
    let mut remaining: Vec<Option<QueueItem>> = items.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(remaining.len());
    for hash in order {
        if let Some(slot) = remaining
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|item| &item.content_hash == hash))
            && let Some(item) = slot.take()
        {
            ordered.push(item);
        }
    }
    ordered.extend(remaining.into_iter().flatten());
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(names: &[&str]) -> Vec<QueueItem> {
        names
            .iter()
            .map(|n| QueueItem::new(&format!("https://x.test/{n}"), n, "test"))
            .collect()
    }

    fn aliases(items: &[QueueItem]) -> Vec<&str> {
        items.iter().map(|i| i.display_alias.as_str()).collect()
    }

    #[test]
    fn test_full_reorder() {
        let list = items(&["a", "b", "c"]);
        let order = vec![list[2].content_hash.clone(), list[0].content_hash.clone(), list[1].content_hash.clone()];
        assert_eq!(aliases(&apply_order(list, &order)), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_partial_order_keeps_rest() {
        let list = items(&["a", "b", "c", "d"]);
        let order = vec![list[3].content_hash.clone(), "unknown".to_string(), list[3].content_hash.clone()];
        assert_eq!(aliases(&apply_order(list, &order)), vec!["d", "a", "b", "c"]);
    }
}
