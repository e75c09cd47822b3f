//! Persistence seam.
//!
//! Everything above this module talks to a [`Store`] trait object, so the
//! in-memory backend can be swapped for another one without touching the
//! threading, review or search code.

pub mod memory;

pub use memory::MemoryStore;

use crate::models::{
    Message, MessageKey, Project, ProjectId, QueuedSeries, ResultOwner, ResultRecord, Topic,
    TopicId, WatchedQuery,
};
use crate::search::Predicate;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query deadline exceeded")]
    Timeout,
    #[error("snapshot not found")]
    NotFound,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialize(String),
    #[error("deserialization error: {0}")]
    Deserialize(String),
    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("project `{0}` already exists")]
    DuplicateProject(String),
}

/// Optional backend features the query layer may rely on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCapabilities {
    pub full_text_search: bool,
}

/// Candidate set for a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    /// Series heads, optionally restricted to a set of projects.
    SeriesHeads { projects: Option<Vec<ProjectId>> },
    /// Exactly these messages.
    Messages(Vec<MessageKey>),
}

impl Scope {
    pub fn all_series() -> Self {
        Scope::SeriesHeads { projects: None }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub deadline: Option<Instant>,
}

impl QueryOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Outcome of [`Store::insert_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum Inserted {
    New(Message),
    Existing(Message),
}

pub trait Store: Send + Sync {
    fn capabilities(&self) -> StoreCapabilities;

    // ----- projects -----

    /// Insert a project, assigning its id.
    fn insert_project(&self, project: Project) -> Result<Project, StoreError>;
    fn update_project(
        &self,
        id: ProjectId,
        f: &mut dyn FnMut(&mut Project),
    ) -> Result<Option<Project>, StoreError>;
    fn project(&self, id: ProjectId) -> Result<Option<Project>, StoreError>;
    fn project_by_name(&self, name: &str) -> Result<Option<Project>, StoreError>;
    fn projects(&self) -> Result<Vec<Project>, StoreError>;

    // ----- messages -----

    fn get(&self, key: &MessageKey) -> Result<Option<Message>, StoreError>;
    /// Atomically insert unless a message with the same key exists.
    fn insert_if_absent(&self, message: Message) -> Result<Inserted, StoreError>;
    fn put(&self, message: Message) -> Result<(), StoreError>;
    /// Atomic read-modify-write of a single message.
    fn update(
        &self,
        key: &MessageKey,
        f: &mut dyn FnMut(&mut Message),
    ) -> Result<Option<Message>, StoreError>;
    /// Direct replies, ordered by patch position, then date.
    fn replies(&self, key: &MessageKey) -> Result<Vec<Message>, StoreError>;
    fn series_heads_by_subject(
        &self,
        project: ProjectId,
        stripped_subject: &str,
    ) -> Result<Vec<Message>, StoreError>;
    fn topic_members(&self, topic: TopicId) -> Result<Vec<Message>, StoreError>;
    fn query(
        &self,
        scope: &Scope,
        predicate: &Predicate,
        options: &QueryOptions,
    ) -> Result<Vec<Message>, StoreError>;
    fn delete(&self, key: &MessageKey) -> Result<Option<Message>, StoreError>;

    /// Delete a message and everything replying to it, children first.
    ///
    /// Traversal is iterative and tracks visited keys, so reply cycles and
    /// deep threads are both safe.
    fn delete_subtree(&self, key: &MessageKey) -> Result<Vec<Message>, StoreError> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(key.clone(), false)];

        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            stack.push((current.clone(), true));
            for reply in self.replies(&current)? {
                stack.push((reply.key(), false));
            }
        }

        let mut deleted = Vec::with_capacity(order.len());
        for key in &order {
            if let Some(message) = self.delete(key)? {
                deleted.push(message);
            }
        }
        Ok(deleted)
    }

    // ----- topics -----

    fn topic(&self, id: TopicId) -> Result<Option<Topic>, StoreError>;
    fn put_topic(&self, topic: Topic) -> Result<(), StoreError>;
    fn delete_topic(&self, id: TopicId) -> Result<Option<Topic>, StoreError>;
    /// Move every member of `from` into `to`, returning how many moved.
    fn reassign_topic(&self, from: TopicId, to: TopicId) -> Result<usize, StoreError>;

    // ----- results -----

    /// Store a result, returning the one it replaced (same owner and name).
    fn put_result(&self, record: ResultRecord) -> Result<Option<ResultRecord>, StoreError>;
    fn results(&self, owner: &ResultOwner) -> Result<Vec<ResultRecord>, StoreError>;

    // ----- queues -----

    /// Returns `false` if the entry was already present.
    fn enqueue(&self, entry: QueuedSeries) -> Result<bool, StoreError>;
    /// Remove matching entries; `None` matches any user.
    fn dequeue(
        &self,
        user: Option<&str>,
        message: &MessageKey,
        names: &[&str],
    ) -> Result<Vec<QueuedSeries>, StoreError>;
    fn queued(&self, message: &MessageKey) -> Result<Vec<QueuedSeries>, StoreError>;
    fn user_queue(&self, user: &str, name: &str) -> Result<Vec<QueuedSeries>, StoreError>;

    fn watched_queries(&self) -> Result<Vec<WatchedQuery>, StoreError>;
    /// One watched query per user; `None` clears it.
    fn set_watched_query(
        &self,
        user: &str,
        email: Option<&str>,
        query: Option<String>,
    ) -> Result<(), StoreError>;
}
