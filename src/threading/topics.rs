//! Topic resolution: grouping revisions of a series.

use crate::models::{Message, ProjectId, Topic, TopicId};
use crate::storage::{Store, StoreError};

/// Topic of the most recent series head with this stripped subject in the
/// project, or a freshly stored topic when there is none.
///
/// Callers must hold the subject lock for `(project, stripped_subject)`.
pub fn for_stripped_subject(
    store: &dyn Store,
    project: ProjectId,
    stripped_subject: &str,
) -> Result<Topic, StoreError> {
    let latest = store
        .series_heads_by_subject(project, stripped_subject)?
        .into_iter()
        .filter(|head| head.topic.is_some())
        .max_by(|a, b| a.date.cmp(&b.date).then_with(|| a.message_id.cmp(&b.message_id)));

    if let Some(topic) = latest.and_then(|head| head.topic) {
        if let Some(topic) = store.topic(topic)? {
            return Ok(topic);
        }
    }

    let topic = Topic::new(project);
    store.put_topic(topic.clone())?;
    log::debug!("created topic {} for \"{}\"", topic.id, stripped_subject);
    Ok(topic)
}

/// Move every member of `topic` into `into` and delete `topic`.
pub fn merge_into(store: &dyn Store, topic: TopicId, into: TopicId) -> Result<usize, StoreError> {
    if topic == into {
        return Ok(0);
    }
    let moved = store.reassign_topic(topic, into)?;
    store.delete_topic(topic)?;
    refresh_latest(store, into)?;
    log::info!("merged topic {} into {} ({} heads)", topic, into, moved);
    Ok(moved)
}

/// Point the topic's `latest` at its newest head (by date).
pub fn refresh_latest(store: &dyn Store, topic: TopicId) -> Result<Option<Topic>, StoreError> {
    let Some(mut current) = store.topic(topic)? else {
        return Ok(None);
    };
    let newest: Option<Message> = store
        .topic_members(topic)?
        .into_iter()
        .max_by(|a, b| a.date.cmp(&b.date).then_with(|| a.message_id.cmp(&b.message_id)));
    let latest = newest.map(|head| head.message_id);
    if current.latest != latest {
        current.latest = latest;
        store.put_topic(current.clone())?;
    }
    Ok(Some(current))
}
