//! Per-user series queues and watched queries.

use crate::error::TrackerError;
use crate::events::{Event, EventBus, EventObserver};
use crate::models::{Caller, Message, MessageKey, QueuedSeries, ResultOwner, ResultStatus, queue_names};
use crate::results::GIT_RESULT;
use crate::search::{QueryExecutor, compile};
use crate::storage::Store;
use regex::Regex;
use std::sync::{Arc, OnceLock};

fn queue_name_regex() -> &'static Regex {
    static QUEUE_NAME: OnceLock<Regex> = OnceLock::new();
    QUEUE_NAME.get_or_init(|| Regex::new(r"^[_a-zA-Z0-9-]+$").expect("valid queue name regex"))
}

pub fn is_valid_queue_name(name: &str) -> bool {
    queue_name_regex().is_match(name)
}

#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn Store>,
    bus: EventBus,
    executor: QueryExecutor,
}

impl QueueManager {
    pub fn new(store: Arc<dyn Store>, bus: EventBus, executor: QueryExecutor) -> Self {
        Self {
            store,
            bus,
            executor,
        }
    }

    /// Put `message` in `user`'s queue `name`. Returns `false` if it was
    /// already there.
    pub fn add_to_queue(
        &self,
        user: &str,
        message: &MessageKey,
        name: &str,
    ) -> Result<bool, TrackerError> {
        if !is_valid_queue_name(name) {
            return Err(TrackerError::InvalidQueueName(name.to_string()));
        }
        let entry = QueuedSeries {
            user: user.to_string(),
            message: message.clone(),
            name: name.to_string(),
        };
        if !self.store.enqueue(entry.clone())? {
            return Ok(false);
        }
        log::debug!("{} queued in {}/{}", message, user, name);
        self.bus.emit(Event::MessageQueued { entry });
        Ok(true)
    }

    /// Remove `message` from `user`'s queue `name`. Returns `false` if it
    /// was not there.
    pub fn drop_from_queue(
        &self,
        user: &str,
        message: &MessageKey,
        name: &str,
    ) -> Result<bool, TrackerError> {
        let dropped = self.drop_entries(Some(user), message, &[name])?;
        Ok(dropped > 0)
    }

    fn drop_entries(
        &self,
        user: Option<&str>,
        message: &MessageKey,
        names: &[&str],
    ) -> Result<usize, TrackerError> {
        let dropped = self.store.dequeue(user, message, names)?;
        let count = dropped.len();
        for entry in dropped {
            log::debug!("{} dropped from {}/{}", entry.message, entry.user, entry.name);
            self.bus.emit(Event::MessageDropped { entry });
        }
        Ok(count)
    }

    /// Accept `message` for `user`, withdrawing any rejection.
    pub fn mark_accepted(&self, user: &str, message: &MessageKey) -> Result<(), TrackerError> {
        self.drop_from_queue(user, message, queue_names::REJECT)?;
        self.add_to_queue(user, message, queue_names::ACCEPT)?;
        Ok(())
    }

    /// Reject `message` for `user`, withdrawing any acceptance.
    pub fn mark_rejected(&self, user: &str, message: &MessageKey) -> Result<(), TrackerError> {
        self.drop_from_queue(user, message, queue_names::ACCEPT)?;
        self.add_to_queue(user, message, queue_names::REJECT)?;
        Ok(())
    }

    pub fn clear_review(&self, user: &str, message: &MessageKey) -> Result<(), TrackerError> {
        self.drop_entries(
            Some(user),
            message,
            &[queue_names::ACCEPT, queue_names::REJECT],
        )?;
        Ok(())
    }

    /// Messages in `user`'s queue `name`.
    pub fn queue(&self, user: &str, name: &str) -> Result<Vec<Message>, TrackerError> {
        let mut messages = Vec::new();
        for entry in self.store.user_queue(user, name)? {
            if let Some(message) = self.store.get(&entry.message)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Set or clear the query that fills `user`'s `watched` queue.
    ///
    /// The query is compiled first so that a bad query is rejected here
    /// rather than on every later series update.
    pub fn set_watched_query(
        &self,
        user: &str,
        email: Option<&str>,
        query: Option<&str>,
    ) -> Result<(), TrackerError> {
        let query = query.map(str::trim).filter(|query| !query.is_empty());
        if let Some(query) = query {
            compile(query, &Caller::user(user, email))?;
        }
        self.store
            .set_watched_query(user, email, query.map(str::to_string))?;
        Ok(())
    }

    /// Re-run every watched query against `series`, adding it to or
    /// dropping it from each owner's `watched` queue.
    pub fn update_watch_queue(&self, series: &Message) -> Result<(), TrackerError> {
        let key = series.key();
        for watched in self.store.watched_queries()? {
            let caller = Caller::user(watched.user.clone(), watched.email.as_deref());
            let matches = match self.executor.query_test_message(&watched.query, series, &caller) {
                Ok(matches) => matches,
                Err(err) => {
                    log::warn!("watched query of {} failed: {}", watched.user, err);
                    continue;
                }
            };
            if matches {
                self.add_to_queue(&watched.user, &key, queue_names::WATCHED)?;
            } else {
                self.drop_from_queue(&watched.user, &key, queue_names::WATCHED)?;
            }
        }
        Ok(())
    }
}

/// Keeps watched queues current as series change state.
pub struct WatchQueueObserver {
    queues: QueueManager,
}

impl WatchQueueObserver {
    pub fn new(queues: QueueManager) -> Self {
        Self { queues }
    }

    fn series_merged(&self, series: &Message) -> Result<(), TrackerError> {
        self.queues.drop_entries(
            None,
            &series.key(),
            &[queue_names::ACCEPT, queue_names::REJECT],
        )?;
        self.queues.update_watch_queue(series)
    }

    fn reload_and_update(&self, key: &MessageKey) -> Result<(), TrackerError> {
        match self.queues.store.get(key)? {
            Some(series) if series.is_series_head() => self.queues.update_watch_queue(&series),
            _ => Ok(()),
        }
    }
}

impl EventObserver for WatchQueueObserver {
    fn on_event(&self, event: &Event) {
        let outcome = match event {
            Event::SeriesMerged { series, .. } => self.series_merged(series),
            Event::ResultUpdate {
                owner: ResultOwner::Message(key),
                name,
                status,
                ..
            } if name == GIT_RESULT && *status != ResultStatus::Pending => {
                self.reload_and_update(key)
            }
            Event::TagsUpdate { series } => self.reload_and_update(&series.key()),
            _ => Ok(()),
        };
        if let Err(err) = outcome {
            log::warn!("watch queue update after {} failed: {}", event.name(), err);
        }
    }
}
