//! Series threading.
//!
//! Messages are indexed per project. A message that starts a series (a
//! cover letter, a stand-alone patch, or the first patch of a series sent
//! without a cover) owns a [`Topic`](crate::models::Topic); every other
//! message hangs off its `in_reply_to` parent and is attributed to the
//! series by walking upward until a topic owner is found.
//!
//! ## Concurrency
//!
//! - topic creation is serialized per `(project, stripped subject)`
//! - series mutations are serialized per series head
//! - locks are always taken subject first, then series
//!
//! Registered [`MessageHook`]s run inside the series lock, in registration
//! order, after the message is stored and the series record refreshed.

pub mod locks;
pub mod series;
pub mod topics;

use crate::error::TrackerError;
use crate::events::{Event, EventBus};
use crate::models::{Message, MessageKey, Project, ProjectId, Topic};
use crate::storage::{Inserted, Store};
use crate::sync::parser::ParsedMessage;
use locks::KeyedLocks;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Post-ingestion step run for every newly stored message.
pub trait MessageHook: Send + Sync {
    fn name(&self) -> &str;

    /// `series` is the head the message belongs to, if any.
    fn message_added(&self, message: &Message, series: Option<&Message>) -> Result<(), TrackerError>;
}

pub struct ThreadIndex {
    store: Arc<dyn Store>,
    bus: EventBus,
    series_locks: KeyedLocks<MessageKey>,
    subject_locks: KeyedLocks<(ProjectId, String)>,
    hooks: RwLock<Vec<Arc<dyn MessageHook>>>,
}

impl ThreadIndex {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            series_locks: KeyedLocks::new(),
            subject_locks: KeyedLocks::new(),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Append a hook; hooks run in the order they were registered.
    pub fn register_hook(&self, hook: Arc<dyn MessageHook>) {
        log::debug!("registered message hook {}", hook.name());
        self.hooks.write().push(hook);
    }

    pub fn hook_names(&self) -> Vec<String> {
        self.hooks.read().iter().map(|h| h.name().to_string()).collect()
    }

    /// Store a parsed message in `project` and update its series.
    ///
    /// Ingesting a message id that already exists in the project returns
    /// the stored message and changes nothing.
    pub fn ingest(&self, project: &Project, parsed: &ParsedMessage) -> Result<Message, TrackerError> {
        let key = MessageKey::new(project.id, parsed.message_id.clone());
        if let Some(existing) = self.store.get(&key)? {
            log::debug!("{} already indexed", key);
            return Ok(existing);
        }

        let parent = match &parsed.in_reply_to {
            Some(parent_id) => self
                .store
                .get(&MessageKey::new(project.id, parent_id.clone()))?,
            None => None,
        };
        let starts_series = parent.is_none() && parsed.is_series_head();

        let _subject_guard = starts_series
            .then(|| self.subject_locks.lock(&(project.id, parsed.stripped_subject.clone())));
        let lock_key = if starts_series {
            key.clone()
        } else {
            self.series_lock_key(&key, parsed, parent.as_ref())?
        };
        let _series_guard = self.series_locks.lock(&lock_key);

        // Lost a race with a concurrent ingest of the same message.
        if let Some(existing) = self.store.get(&key)? {
            return Ok(existing);
        }

        let topic = if starts_series {
            Some(self.resolve_topic(project, parsed)?)
        } else {
            None
        };
        let message = Message::from_parsed(project.id, parsed, topic.as_ref().map(|t| t.id));
        let message = match self.store.insert_if_absent(message)? {
            Inserted::Existing(existing) => return Ok(existing),
            Inserted::New(message) => message,
        };
        if let Some(topic) = &topic {
            topics::refresh_latest(&*self.store, topic.id)?;
        }
        log::debug!(
            "indexed {} (patch: {}, head: {})",
            key,
            message.is_patch,
            message.is_series_head()
        );

        self.bus.emit(Event::MessageAdded {
            message: message.clone(),
        });
        let series = self.update_series(&message)?;
        self.run_hooks(&message, series.as_ref());

        Ok(self.store.get(&key)?.unwrap_or(message))
    }

    fn series_lock_key(
        &self,
        key: &MessageKey,
        parsed: &ParsedMessage,
        parent: Option<&Message>,
    ) -> Result<MessageKey, TrackerError> {
        if let Some(parent) = parent {
            let head = series::series_head(&*self.store, parent)?;
            return Ok(head.map(|h| h.key()).unwrap_or_else(|| parent.key()));
        }
        Ok(parsed
            .in_reply_to
            .as_ref()
            .map(|parent_id| MessageKey::new(key.project, parent_id.clone()))
            .unwrap_or_else(|| key.clone()))
    }

    /// Topic for a new series head. Caller holds the subject lock.
    fn resolve_topic(&self, project: &Project, parsed: &ParsedMessage) -> Result<Topic, TrackerError> {
        let store = &*self.store;
        let topic = topics::for_stripped_subject(store, project.id, &parsed.stripped_subject)?;

        let Some(superseded_id) = &parsed.supersedes else {
            return Ok(topic);
        };
        let superseded_topic = store
            .get(&MessageKey::new(project.id, superseded_id.clone()))?
            .and_then(|message| message.topic);
        let Some(superseded_topic) = superseded_topic.filter(|id| *id != topic.id) else {
            return Ok(topic);
        };
        let Some(target) = store.topic(superseded_topic)? else {
            return Ok(topic);
        };

        if store.topic_members(topic.id)?.is_empty() {
            store.delete_topic(topic.id)?;
        } else {
            topics::merge_into(store, topic.id, target.id)?;
        }
        log::info!(
            "{} supersedes {}, joining topic {}",
            parsed.message_id,
            superseded_id,
            target.id
        );
        Ok(target)
    }

    fn run_hooks(&self, message: &Message, series: Option<&Message>) {
        let hooks: Vec<Arc<dyn MessageHook>> = self.hooks.read().clone();
        for hook in hooks {
            if let Err(err) = hook.message_added(message, series) {
                log::warn!("hook {} failed for {}: {}", hook.name(), message.key(), err);
            }
        }
    }

    /// Head of the series `message` belongs to.
    pub fn get_series_head(&self, message: &Message) -> Result<Option<Message>, TrackerError> {
        Ok(series::series_head(&*self.store, message)?)
    }

    /// Fold `message` into its series: reply dates, patch count and
    /// completeness. Returns the refreshed head.
    pub fn update_series(&self, message: &Message) -> Result<Option<Message>, TrackerError> {
        let Some(head) = series::series_head(&*self.store, message)? else {
            return Ok(None);
        };
        let head = self
            .store
            .update(&head.key(), &mut |series| {
                if series.last_reply_date.is_none_or(|date| date < message.date) {
                    series.last_reply_date = Some(message.date);
                }
                if series.sender.address != message.sender.address
                    && series.last_comment_date.is_none_or(|date| date < message.date)
                {
                    series.last_comment_date = Some(message.date);
                }
            })?
            .unwrap_or(head);
        Ok(Some(self.refresh_completeness(&head)?))
    }

    /// Recount patches and latch `is_complete`. `SeriesComplete` is emitted
    /// exactly once per series, by whichever call flips the flag.
    pub fn refresh_completeness(&self, head: &Message) -> Result<Message, TrackerError> {
        let patches = series::series_patches(&*self.store, head)?;
        let result = series::completeness(head, &patches);

        let mut newly_complete = false;
        let updated = self
            .store
            .update(&head.key(), &mut |series| {
                series.num_patches = Some(result.num_patches);
                if result.complete && !series.is_complete {
                    series.is_complete = true;
                    newly_complete = true;
                }
            })?
            .ok_or_else(|| TrackerError::MessageNotFound(head.key()))?;

        if newly_complete {
            log::info!(
                "series {} complete with {} patches",
                updated.key(),
                result.num_patches
            );
            self.bus.emit(Event::SeriesComplete {
                project: updated.project,
                series: updated.clone(),
            });
        }
        Ok(updated)
    }

    /// Patches of the series headed by `key`, in position order.
    pub fn get_patches(&self, key: &MessageKey) -> Result<Vec<Message>, TrackerError> {
        let head = self
            .store
            .get(key)?
            .ok_or_else(|| TrackerError::MessageNotFound(key.clone()))?;
        if !head.is_series_head() {
            return Err(TrackerError::NotSeriesHead(key.clone()));
        }
        Ok(series::series_patches(&*self.store, &head)?)
    }

    /// Replace the maintainer list of a series head. Returns whether it
    /// changed.
    pub fn set_maintainers(
        &self,
        key: &MessageKey,
        maintainers: Vec<String>,
    ) -> Result<bool, TrackerError> {
        let mut maintainers = maintainers;
        maintainers.sort();
        maintainers.dedup();

        let mut changed = false;
        self.store
            .update(key, &mut |series| {
                if series.maintainers != maintainers {
                    series.maintainers = maintainers.clone();
                    changed = true;
                }
            })?
            .ok_or_else(|| TrackerError::MessageNotFound(key.clone()))?;
        if changed {
            log::debug!("maintainers of {}: {}", key, maintainers.join(", "));
        }
        Ok(changed)
    }

    /// Delete a message and every reply below it.
    ///
    /// Topics left without members are removed.
    pub fn merge_subthread_delete(&self, key: &MessageKey) -> Result<Vec<Message>, TrackerError> {
        let Some(root) = self.store.get(key)? else {
            return Ok(Vec::new());
        };
        let lock_key = series::series_head(&*self.store, &root)?
            .map(|head| head.key())
            .unwrap_or_else(|| key.clone());
        let _series_guard = self.series_locks.lock(&lock_key);

        let deleted = self.store.delete_subtree(key)?;
        let orphaned: BTreeSet<_> = deleted.iter().filter_map(|m| m.topic).collect();
        for topic in orphaned {
            if self.store.topic_members(topic)?.is_empty() {
                self.store.delete_topic(topic)?;
            } else {
                topics::refresh_latest(&*self.store, topic)?;
            }
        }
        log::info!("deleted {} messages below {}", deleted.len(), key);
        Ok(deleted)
    }

    /// Mark messages (patches or heads) as merged. A series becomes merged
    /// once all of its patches are, emitting `SeriesMerged` once.
    ///
    /// Returns the series that became merged.
    pub fn mark_merged(
        &self,
        project: ProjectId,
        message_ids: &[&str],
    ) -> Result<Vec<Message>, TrackerError> {
        // head key -> whether the series was already merged before this call
        let mut affected: BTreeMap<MessageKey, bool> = BTreeMap::new();
        for raw_id in message_ids {
            let message_id = raw_id
                .strip_prefix('<')
                .and_then(|id| id.strip_suffix('>'))
                .unwrap_or(raw_id);
            let key = MessageKey::new(project, message_id);

            let mut flipped = false;
            let updated = self.store.update(&key, &mut |message| {
                if !message.is_merged {
                    message.is_merged = true;
                    flipped = true;
                }
            })?;
            let Some(message) = updated.filter(|_| flipped) else {
                log::debug!("{} unknown or already merged", key);
                continue;
            };
            if let Some(head) = series::series_head(&*self.store, &message)? {
                let was_merged = head.message_id != message.message_id && head.is_merged;
                affected.entry(head.key()).or_insert(was_merged);
            }
        }

        let mut merged = Vec::new();
        for (head_key, was_merged) in affected {
            if was_merged {
                continue;
            }
            let _series_guard = self.series_locks.lock(&head_key);
            let Some(head) = self.store.get(&head_key)? else {
                continue;
            };
            let patches = series::series_patches(&*self.store, &head)?;
            if !patches.iter().all(|patch| patch.is_merged) {
                continue;
            }
            let Some(series) = self.store.update(&head_key, &mut |series| {
                series.is_merged = true;
            })?
            else {
                continue;
            };
            log::info!("series {} merged", head_key);
            self.bus.emit(Event::SeriesMerged {
                project,
                series: series.clone(),
            });
            merged.push(series);
        }
        Ok(merged)
    }
}
