//! Series level review state: tags, reviewers and revision obsolescence.

use super::tags::{self, BASED_ON, TagMatcher};
use crate::error::TrackerError;
use crate::events::{Event, EventBus};
use crate::models::{Address, Message, MessageKey};
use crate::properties::{names, write_message_property};
use crate::storage::Store;
use crate::threading::MessageHook;
use crate::threading::series::series_patches;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewSummary {
    pub reviewed: bool,
    pub reviewers: Vec<Address>,
    pub reviewed_patches: u32,
    pub expected_patches: u32,
}

/// `newer` obsoletes `older` when it has a higher version and is not older.
pub fn obsoletes(newer: &Message, older: &Message) -> bool {
    newer.version > older.version && newer.date >= older.date
}

pub struct ReviewStateEngine {
    store: Arc<dyn Store>,
    bus: EventBus,
    matcher: TagMatcher,
}

impl ReviewStateEngine {
    pub fn new(store: Arc<dyn Store>, bus: EventBus, matcher: TagMatcher) -> Self {
        Self {
            store,
            bus,
            matcher,
        }
    }

    pub fn matcher(&self) -> &TagMatcher {
        &self.matcher
    }

    fn load(&self, key: &MessageKey) -> Result<Message, TrackerError> {
        self.store
            .get(key)?
            .ok_or_else(|| TrackerError::MessageNotFound(key.clone()))
    }

    pub fn extract_tags(&self, message: &Message) -> Vec<String> {
        self.matcher.extract(&message.body)
    }

    pub fn collect_tags(&self, message: &Message) -> Result<Vec<String>, TrackerError> {
        Ok(tags::collect_tags(&*self.store, &self.matcher, message)?)
    }

    /// Recollect the tags of `key`; returns whether the stored set changed.
    pub fn update_tags(&self, key: &MessageKey) -> Result<bool, TrackerError> {
        let message = self.load(key)?;
        let collected = self.collect_tags(&message)?;

        let stored: HashSet<&String> = message.tags.iter().collect();
        let fresh: HashSet<&String> = collected.iter().collect();
        if stored == fresh {
            return Ok(false);
        }

        log::debug!(
            "tags of {} changed: {} -> {}",
            key,
            message.tags.len(),
            collected.len()
        );
        self.store.update(key, &mut |message| {
            message.tags = collected.clone();
        })?;
        Ok(true)
    }

    /// Recompute `is_reviewed` and the reviewer set of a series.
    ///
    /// A series is reviewed when every expected patch has a reviewer, or
    /// when its cover letter carries reviewer tags. Not latched: losing
    /// tags clears the flag again.
    pub fn aggregate_review_state(&self, head_key: &MessageKey) -> Result<ReviewSummary, TrackerError> {
        let head = self.load(head_key)?;
        if !head.is_series_head() {
            return Err(TrackerError::NotSeriesHead(head_key.clone()));
        }

        let (head_position, expected_patches) = head.numbering();
        let standalone = head.is_patch && head_position == expected_patches;

        let mut all_reviewers: Vec<Address> = Vec::new();
        let mut reviewed_positions: BTreeSet<u32> = BTreeSet::new();
        for patch in series_patches(&*self.store, &head)? {
            let patch_reviewers = tags::reviewers(&patch.tags);
            if !patch_reviewers.is_empty() {
                let (position, total) = patch.numbering();
                if standalone && patch.message_id == head.message_id {
                    reviewed_positions.insert(head_position);
                } else if total == expected_patches && (1..=total).contains(&position) {
                    reviewed_positions.insert(position);
                }
            }
            merge_addresses(&mut all_reviewers, patch_reviewers);
        }

        let cover_reviewers = if head.is_patch {
            Vec::new()
        } else {
            tags::reviewers(&head.tags)
        };
        let cover_reviewed = !cover_reviewers.is_empty();
        merge_addresses(&mut all_reviewers, cover_reviewers);
        all_reviewers.sort();

        // Positions, not messages: a resent 1/2 does not stand in for 2/2.
        let every_patch_reviewed = if standalone {
            reviewed_positions.contains(&head_position)
        } else {
            expected_patches > 0
                && (1..=expected_patches).all(|position| reviewed_positions.contains(&position))
        };
        let reviewed = cover_reviewed || every_patch_reviewed;
        let reviewed_patches = u32::try_from(reviewed_positions.len()).unwrap_or(u32::MAX);

        let mut flag_changed = false;
        self.store.update(head_key, &mut |series| {
            if series.is_reviewed != reviewed {
                series.is_reviewed = reviewed;
                flag_changed = true;
            }
        })?;
        if flag_changed {
            log::info!("series {} reviewed: {}", head_key, reviewed);
        }

        write_message_property(
            &*self.store,
            &self.bus,
            head_key,
            names::REVIEWED,
            reviewed.then_some(serde_json::Value::Bool(true)),
        )?;
        let reviewers_value = if all_reviewers.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&all_reviewers)?)
        };
        write_message_property(
            &*self.store,
            &self.bus,
            head_key,
            names::REVIEWERS,
            reviewers_value,
        )?;

        Ok(ReviewSummary {
            reviewed,
            reviewers: all_reviewers,
            reviewed_patches,
            expected_patches,
        })
    }

    /// Mark older revisions in the topic of `head_key` as obsoleted by the
    /// newest revision that obsoletes them.
    ///
    /// Returns `(obsoleted, obsoleted_by)` pairs that changed.
    pub fn detect_obsolescence(
        &self,
        head_key: &MessageKey,
    ) -> Result<Vec<(MessageKey, String)>, TrackerError> {
        let head = self.load(head_key)?;
        let Some(topic) = head.topic else {
            return Err(TrackerError::NotSeriesHead(head_key.clone()));
        };
        let revisions: Vec<Message> = self
            .store
            .topic_members(topic)?
            .into_iter()
            .filter(|revision| revision.project == head.project)
            .collect();

        let mut changed = Vec::new();
        for older in &revisions {
            let newest = revisions
                .iter()
                .filter(|candidate| obsoletes(candidate, older))
                .max_by(|a, b| {
                    (a.version, a.date, &a.message_id).cmp(&(b.version, b.date, &b.message_id))
                });
            let Some(newest) = newest else {
                continue;
            };

            let key = older.key();
            let mut became_obsolete = false;
            self.store.update(&key, &mut |message| {
                if !message.is_obsolete {
                    message.is_obsolete = true;
                    became_obsolete = true;
                }
            })?;
            let pointer_changed = write_message_property(
                &*self.store,
                &self.bus,
                &key,
                names::OBSOLETED_BY,
                Some(serde_json::Value::String(newest.message_id.clone())),
            )?;
            if became_obsolete || pointer_changed {
                log::info!("{} obsoleted by {}", key, newest.message_id);
                changed.push((key, newest.message_id.clone()));
            }
        }
        Ok(changed)
    }

    /// Full refresh of a series: obsolescence, tags of the head and its
    /// patches, review state. Emits `TagsUpdate` when any tag set changed.
    pub fn refresh_series(&self, head_key: &MessageKey) -> Result<bool, TrackerError> {
        let head = self.load(head_key)?;
        if !head.is_series_head() {
            return Err(TrackerError::NotSeriesHead(head_key.clone()));
        }

        self.detect_obsolescence(head_key)?;

        let mut updated = self.update_tags(head_key)?;
        for patch in series_patches(&*self.store, &head)? {
            if patch.message_id == head.message_id {
                continue;
            }
            updated |= self.update_tags(&patch.key())?;
        }
        self.aggregate_review_state(head_key)?;

        if updated {
            let series = self.load(head_key)?;
            self.bus.emit(Event::TagsUpdate { series });
        }
        Ok(updated)
    }

    /// Series named by the first `Based-on:` tag of `series`.
    pub fn based_on(&self, series: &Message) -> Result<Option<Message>, TrackerError> {
        let Some(value) = series
            .tags
            .iter()
            .find_map(|tag| tags::tag_value(tag, BASED_ON))
        else {
            return Ok(None);
        };
        let message_id = value.trim_start_matches('<').trim_end_matches('>');
        let base = self
            .store
            .get(&MessageKey::new(series.project, message_id))?
            .filter(Message::is_series_head);
        Ok(base)
    }
}

fn merge_addresses(into: &mut Vec<Address>, from: Vec<Address>) {
    for address in from {
        if !into.contains(&address) {
            into.push(address);
        }
    }
}

impl MessageHook for ReviewStateEngine {
    fn name(&self) -> &str {
        "review"
    }

    fn message_added(&self, _message: &Message, series: Option<&Message>) -> Result<(), TrackerError> {
        match series {
            Some(series) => self.refresh_series(&series.key()).map(|_| ()),
            None => Ok(()),
        }
    }
}
