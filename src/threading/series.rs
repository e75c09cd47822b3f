//! Series navigation and completeness rules.

use crate::models::{Message, MessageKey};
use crate::storage::{Store, StoreError};
use std::collections::{HashMap, HashSet};

/// Walk `in_reply_to` links upward until a message that owns a topic.
///
/// Returns `None` for orphans, dangling parents and reply cycles.
pub fn series_head(store: &dyn Store, message: &Message) -> Result<Option<Message>, StoreError> {
    let mut visited = HashSet::new();
    let mut current = message.clone();
    loop {
        if current.is_series_head() {
            return Ok(Some(current));
        }
        if !visited.insert(current.message_id.clone()) {
            log::warn!("reply cycle detected at {}", current.key());
            return Ok(None);
        }
        let Some(parent_id) = current.in_reply_to.as_ref() else {
            return Ok(None);
        };
        match store.get(&MessageKey::new(current.project, parent_id.clone()))? {
            Some(parent) => current = parent,
            None => return Ok(None),
        }
    }
}

/// Patches of a series in position order: the head itself when it is a
/// patch, followed by its direct patch replies.
pub fn series_patches(store: &dyn Store, head: &Message) -> Result<Vec<Message>, StoreError> {
    let mut patches = Vec::new();
    if head.is_patch {
        patches.push(head.clone());
    }
    patches.extend(
        store
            .replies(&head.key())?
            .into_iter()
            .filter(|reply| reply.is_patch),
    );
    Ok(patches)
}

/// Outcome of evaluating a series against its numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completeness {
    pub num_patches: u32,
    pub complete: bool,
}

/// A series is complete when its head is a stand-alone patch (`N/N`), or
/// when every position `1..=total` is present exactly once among the
/// patches. Duplicated or missing positions keep it incomplete.
pub fn completeness(head: &Message, patches: &[Message]) -> Completeness {
    let (position, total) = head.numbering();
    let num_patches = u32::try_from(patches.len()).unwrap_or(u32::MAX);

    if head.is_patch && position == total {
        return Completeness {
            num_patches,
            complete: true,
        };
    }

    let mut seen: HashMap<u32, usize> = HashMap::new();
    for patch in patches {
        let (index, of) = patch.numbering();
        if of == total && (1..=total).contains(&index) {
            *seen.entry(index).or_default() += 1;
        }
    }

    let complete = total > 0
        && seen.len() == total as usize
        && seen.values().all(|count| *count == 1);
    Completeness {
        num_patches,
        complete,
    }
}
