//! In-memory [`Store`] backed by concurrent hash maps.
//!
//! Each table is a `DashMap`, so independent records can be read and written
//! from many threads. Single-record updates run under the owning shard lock,
//! which is what makes [`Store::update`] and [`Store::insert_if_absent`]
//! atomic. The whole store can be snapshotted to disk with bincode.

use super::{Inserted, QueryOptions, Scope, Store, StoreCapabilities, StoreError};
use crate::models::{
    Message, MessageKey, Project, ProjectId, QueuedSeries, ResultOwner, ResultRecord, Topic,
    TopicId, WatchedQuery,
};
use crate::search::{Candidate, Predicate};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

/// Candidates examined between deadline checks.
const DEADLINE_CHECK_INTERVAL: usize = 64;

pub struct MemoryStore {
    capabilities: StoreCapabilities,
    next_project_id: AtomicI32,
    projects: DashMap<ProjectId, Project>,
    messages: DashMap<MessageKey, Message>,
    /// (project, in-reply-to id) -> ids of direct replies
    reply_index: DashMap<MessageKey, BTreeSet<String>>,
    topics: DashMap<TopicId, Topic>,
    results: DashMap<ResultOwner, Vec<ResultRecord>>,
    queues: DashMap<MessageKey, Vec<QueuedSeries>>,
    watched: DashMap<String, WatchedQuery>,
}

/// Serializable form of the whole store.
#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    version: u32,
    full_text_search: bool,
    next_project_id: i32,
    projects: Vec<Project>,
    messages: Vec<Message>,
    topics: Vec<Topic>,
    results: Vec<ResultRecord>,
    queues: Vec<QueuedSeries>,
    watched: Vec<WatchedQuery>,
}

impl MemoryStore {
    /// Current snapshot format version
    const SNAPSHOT_VERSION: u32 = 2;

    pub fn new(capabilities: StoreCapabilities) -> Self {
        Self {
            capabilities,
            next_project_id: AtomicI32::new(1),
            projects: DashMap::new(),
            messages: DashMap::new(),
            reply_index: DashMap::new(),
            topics: DashMap::new(),
            results: DashMap::new(),
            queues: DashMap::new(),
            watched: DashMap::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: StoreCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    fn snapshot_path(dir: &Path) -> PathBuf {
        dir.join(format!("series_tracker_v{}.bin", Self::SNAPSHOT_VERSION))
    }

    fn parent_key(message: &Message) -> Option<MessageKey> {
        message
            .in_reply_to
            .as_ref()
            .map(|parent| MessageKey::new(message.project, parent.clone()))
    }

    fn index_reply(&self, message: &Message) {
        if let Some(parent) = Self::parent_key(message) {
            self.reply_index
                .entry(parent)
                .or_default()
                .insert(message.message_id.clone());
        }
    }

    fn unindex_reply(&self, message: &Message) {
        if let Some(parent) = Self::parent_key(message) {
            if let Some(mut children) = self.reply_index.get_mut(&parent) {
                children.remove(&message.message_id);
            }
            self.reply_index.remove_if(&parent, |_, children| children.is_empty());
        }
    }

    fn candidate_context(
        &self,
        message: &Message,
    ) -> (Option<Project>, Option<Project>, Vec<ResultRecord>, Vec<QueuedSeries>) {
        let project = self.projects.get(&message.project).map(|p| p.value().clone());
        let parent = project
            .as_ref()
            .and_then(|p| p.parent)
            .and_then(|id| self.projects.get(&id).map(|p| p.value().clone()));
        let key = message.key();
        let results = self
            .results
            .get(&ResultOwner::Message(key.clone()))
            .map(|r| r.value().clone())
            .unwrap_or_default();
        let queues = self
            .queues
            .get(&key)
            .map(|q| q.value().clone())
            .unwrap_or_default();
        (project, parent, results, queues)
    }

    /// Write the whole store to `{dir}/series_tracker_v2.bin`.
    pub fn save_to_disk(&self, dir: &Path) -> Result<PathBuf, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io(e.to_string()))?;

        let snapshot = StoredSnapshot {
            version: Self::SNAPSHOT_VERSION,
            full_text_search: self.capabilities.full_text_search,
            next_project_id: self.next_project_id.load(Ordering::SeqCst),
            projects: self.projects.iter().map(|e| e.value().clone()).collect(),
            messages: self.messages.iter().map(|e| e.value().clone()).collect(),
            topics: self.topics.iter().map(|e| e.value().clone()).collect(),
            results: self
                .results
                .iter()
                .flat_map(|e| e.value().clone())
                .collect(),
            queues: self.queues.iter().flat_map(|e| e.value().clone()).collect(),
            watched: self.watched.iter().map(|e| e.value().clone()).collect(),
        };

        let bytes =
            bincode::serialize(&snapshot).map_err(|e| StoreError::Serialize(e.to_string()))?;
        let path = Self::snapshot_path(dir);
        std::fs::write(&path, bytes).map_err(|e| StoreError::Io(e.to_string()))?;

        log::info!(
            "saved snapshot to {}: {} projects, {} messages",
            path.display(),
            snapshot.projects.len(),
            snapshot.messages.len()
        );
        Ok(path)
    }

    /// Load a store previously written by [`MemoryStore::save_to_disk`].
    ///
    /// ## Errors
    ///
    /// Returns `StoreError::NotFound` if no snapshot exists in `dir` and
    /// `StoreError::VersionMismatch` if it was written by another format.
    pub fn load_from_disk(dir: &Path) -> Result<Self, StoreError> {
        let path = Self::snapshot_path(dir);
        if !path.exists() {
            return Err(StoreError::NotFound);
        }

        let bytes = std::fs::read(&path).map_err(|e| StoreError::Io(e.to_string()))?;
        let stored: StoredSnapshot =
            bincode::deserialize(&bytes).map_err(|e| StoreError::Deserialize(e.to_string()))?;

        if stored.version != Self::SNAPSHOT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: Self::SNAPSHOT_VERSION,
                found: stored.version,
            });
        }

        let store = Self::new(StoreCapabilities {
            full_text_search: stored.full_text_search,
        });
        store
            .next_project_id
            .store(stored.next_project_id, Ordering::SeqCst);
        for project in stored.projects {
            store.projects.insert(project.id, project);
        }
        for message in stored.messages {
            store.index_reply(&message);
            store.messages.insert(message.key(), message);
        }
        for topic in stored.topics {
            store.topics.insert(topic.id, topic);
        }
        for record in stored.results {
            store
                .results
                .entry(record.owner.clone())
                .or_default()
                .push(record);
        }
        for entry in stored.queues {
            store
                .queues
                .entry(entry.message.clone())
                .or_default()
                .push(entry);
        }
        for query in stored.watched {
            store.watched.insert(query.user.clone(), query);
        }

        log::info!(
            "loaded snapshot from {}: {} projects, {} messages",
            path.display(),
            store.projects.len(),
            store.messages.len()
        );
        Ok(store)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreCapabilities::default())
    }
}

impl Store for MemoryStore {
    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    fn insert_project(&self, mut project: Project) -> Result<Project, StoreError> {
        if self.projects.iter().any(|p| p.value().name == project.name) {
            return Err(StoreError::DuplicateProject(project.name));
        }
        project.id = self.next_project_id.fetch_add(1, Ordering::SeqCst);
        self.projects.insert(project.id, project.clone());
        Ok(project)
    }

    fn update_project(
        &self,
        id: ProjectId,
        f: &mut dyn FnMut(&mut Project),
    ) -> Result<Option<Project>, StoreError> {
        Ok(self.projects.get_mut(&id).map(|mut project| {
            f(project.value_mut());
            project.value().clone()
        }))
    }

    fn project(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        Ok(self.projects.get(&id).map(|p| p.value().clone()))
    }

    fn project_by_name(&self, name: &str) -> Result<Option<Project>, StoreError> {
        Ok(self
            .projects
            .iter()
            .find(|p| p.value().name == name)
            .map(|p| p.value().clone()))
    }

    fn projects(&self) -> Result<Vec<Project>, StoreError> {
        let mut projects: Vec<Project> = self.projects.iter().map(|p| p.value().clone()).collect();
        projects.sort_by_key(|p| p.id);
        Ok(projects)
    }

    fn get(&self, key: &MessageKey) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.get(key).map(|m| m.value().clone()))
    }

    fn insert_if_absent(&self, message: Message) -> Result<Inserted, StoreError> {
        let inserted = match self.messages.entry(message.key()) {
            Entry::Occupied(existing) => return Ok(Inserted::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(message.clone());
                message
            }
        };
        self.index_reply(&inserted);
        Ok(Inserted::New(inserted))
    }

    fn put(&self, message: Message) -> Result<(), StoreError> {
        if let Some(previous) = self.messages.insert(message.key(), message.clone()) {
            if previous.in_reply_to != message.in_reply_to {
                self.unindex_reply(&previous);
            }
        }
        self.index_reply(&message);
        Ok(())
    }

    fn update(
        &self,
        key: &MessageKey,
        f: &mut dyn FnMut(&mut Message),
    ) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.get_mut(key).map(|mut message| {
            f(message.value_mut());
            message.value().clone()
        }))
    }

    fn replies(&self, key: &MessageKey) -> Result<Vec<Message>, StoreError> {
        let ids: Vec<String> = self
            .reply_index
            .get(key)
            .map(|children| children.iter().cloned().collect())
            .unwrap_or_default();

        let mut replies: Vec<Message> = ids
            .into_iter()
            .filter_map(|id| {
                self.messages
                    .get(&MessageKey::new(key.project, id))
                    .map(|m| m.value().clone())
            })
            .collect();
        replies.sort_by(|a, b| {
            a.numbering()
                .0
                .cmp(&b.numbering().0)
                .then_with(|| a.date.cmp(&b.date))
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(replies)
    }

    fn series_heads_by_subject(
        &self,
        project: ProjectId,
        stripped_subject: &str,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .messages
            .iter()
            .filter(|e| {
                let message = e.value();
                message.project == project
                    && message.is_series_head()
                    && message.stripped_subject == stripped_subject
            })
            .map(|e| e.value().clone())
            .collect())
    }

    fn topic_members(&self, topic: TopicId) -> Result<Vec<Message>, StoreError> {
        let mut members: Vec<Message> = self
            .messages
            .iter()
            .filter(|e| e.value().topic == Some(topic))
            .map(|e| e.value().clone())
            .collect();
        members.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.message_id.cmp(&b.message_id)));
        Ok(members)
    }

    fn query(
        &self,
        scope: &Scope,
        predicate: &Predicate,
        options: &QueryOptions,
    ) -> Result<Vec<Message>, StoreError> {
        let candidates: Vec<Message> = match scope {
            Scope::SeriesHeads { projects } => self
                .messages
                .iter()
                .filter(|e| {
                    let message = e.value();
                    message.is_series_head()
                        && projects
                            .as_ref()
                            .is_none_or(|ids| ids.contains(&message.project))
                })
                .map(|e| e.value().clone())
                .collect(),
            Scope::Messages(keys) => keys
                .iter()
                .filter_map(|key| self.messages.get(key).map(|m| m.value().clone()))
                .collect(),
        };

        let mut matched = Vec::new();
        for (examined, message) in candidates.into_iter().enumerate() {
            if examined % DEADLINE_CHECK_INTERVAL == 0 && options.expired() {
                log::warn!("query aborted after examining {} candidates", examined);
                return Err(StoreError::Timeout);
            }
            let (project, parent, results, queues) = self.candidate_context(&message);
            let candidate = Candidate {
                message: &message,
                project: project.as_ref(),
                parent_project: parent.as_ref(),
                results: &results,
                queues: &queues,
            };
            if predicate.matches(&candidate) {
                matched.push(message);
            }
        }

        matched.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(matched)
    }

    fn delete(&self, key: &MessageKey) -> Result<Option<Message>, StoreError> {
        let Some((_, message)) = self.messages.remove(key) else {
            return Ok(None);
        };
        self.unindex_reply(&message);
        self.results.remove(&ResultOwner::Message(key.clone()));
        self.queues.remove(key);
        Ok(Some(message))
    }

    fn topic(&self, id: TopicId) -> Result<Option<Topic>, StoreError> {
        Ok(self.topics.get(&id).map(|t| t.value().clone()))
    }

    fn put_topic(&self, topic: Topic) -> Result<(), StoreError> {
        self.topics.insert(topic.id, topic);
        Ok(())
    }

    fn delete_topic(&self, id: TopicId) -> Result<Option<Topic>, StoreError> {
        Ok(self.topics.remove(&id).map(|(_, topic)| topic))
    }

    fn reassign_topic(&self, from: TopicId, to: TopicId) -> Result<usize, StoreError> {
        let mut moved = 0;
        for mut entry in self.messages.iter_mut() {
            if entry.value().topic == Some(from) {
                entry.value_mut().topic = Some(to);
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn put_result(&self, record: ResultRecord) -> Result<Option<ResultRecord>, StoreError> {
        let mut records = self.results.entry(record.owner.clone()).or_default();
        let previous = records
            .iter()
            .position(|existing| existing.name == record.name)
            .map(|index| records.remove(index));
        records.push(record);
        Ok(previous)
    }

    fn results(&self, owner: &ResultOwner) -> Result<Vec<ResultRecord>, StoreError> {
        let mut records = self
            .results
            .get(owner)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn enqueue(&self, entry: QueuedSeries) -> Result<bool, StoreError> {
        let mut entries = self.queues.entry(entry.message.clone()).or_default();
        if entries.contains(&entry) {
            return Ok(false);
        }
        entries.push(entry);
        Ok(true)
    }

    fn dequeue(
        &self,
        user: Option<&str>,
        message: &MessageKey,
        names: &[&str],
    ) -> Result<Vec<QueuedSeries>, StoreError> {
        let Some(mut entries) = self.queues.get_mut(message) else {
            return Ok(Vec::new());
        };
        let (removed, kept): (Vec<QueuedSeries>, Vec<QueuedSeries>) =
            entries.drain(..).partition(|entry| {
                user.is_none_or(|user| entry.user == user) && names.contains(&entry.name.as_str())
            });
        *entries = kept;
        Ok(removed)
    }

    fn queued(&self, message: &MessageKey) -> Result<Vec<QueuedSeries>, StoreError> {
        Ok(self
            .queues
            .get(message)
            .map(|q| q.value().clone())
            .unwrap_or_default())
    }

    fn user_queue(&self, user: &str, name: &str) -> Result<Vec<QueuedSeries>, StoreError> {
        let mut entries: Vec<QueuedSeries> = self
            .queues
            .iter()
            .flat_map(|e| e.value().clone())
            .filter(|entry| entry.user == user && entry.name == name)
            .collect();
        entries.sort_by(|a, b| a.message.cmp(&b.message));
        Ok(entries)
    }

    fn watched_queries(&self) -> Result<Vec<WatchedQuery>, StoreError> {
        let mut queries: Vec<WatchedQuery> =
            self.watched.iter().map(|e| e.value().clone()).collect();
        queries.sort_by(|a, b| a.user.cmp(&b.user));
        Ok(queries)
    }

    fn set_watched_query(
        &self,
        user: &str,
        email: Option<&str>,
        query: Option<String>,
    ) -> Result<(), StoreError> {
        match query {
            Some(query) => {
                self.watched.insert(
                    user.to_string(),
                    WatchedQuery {
                        user: user.to_string(),
                        email: email.map(str::to_string),
                        query,
                    },
                );
            }
            None => {
                self.watched.remove(user);
            }
        }
        Ok(())
    }
}
