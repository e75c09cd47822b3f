//! Named results (git apply, test runs) attached to projects and messages.

use crate::error::TrackerError;
use crate::events::{Event, EventBus, EventObserver};
use crate::models::{LogEntry, Message, MessageKey, ResultOwner, ResultRecord, ResultStatus};
use crate::storage::Store;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;

/// Name of the result recording whether a series applies to the project tree.
pub const GIT_RESULT: &str = "git";
/// Results under this family decide `is_tested`.
pub const TESTING_FAMILY: &str = "testing";

#[derive(Clone)]
pub struct ResultService {
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl ResultService {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Record a result, replacing any previous result of the same owner and
    /// name, and emit `ResultUpdate`.
    pub fn set_result(
        &self,
        owner: ResultOwner,
        name: &str,
        status: ResultStatus,
        data: Value,
        log: Option<&str>,
    ) -> Result<ResultRecord, TrackerError> {
        let log_entry = log.map(LogEntry::compress).transpose()?;
        let record = ResultRecord {
            owner: owner.clone(),
            name: name.to_string(),
            status,
            last_update: Utc::now(),
            data,
            log: log_entry,
        };
        let previous = self.store.put_result(record.clone())?;
        let old_status = previous.map(|previous| previous.status);
        log::debug!("result {} of {:?}: {:?} -> {}", name, owner, old_status, status);

        if let ResultOwner::Message(key) = &owner {
            if is_testing_result(name) {
                self.refresh_tested(key)?;
            }
        }

        self.bus.emit(Event::ResultUpdate {
            owner,
            name: name.to_string(),
            old_status,
            status,
        });
        Ok(record)
    }

    pub fn results(&self, owner: &ResultOwner) -> Result<Vec<ResultRecord>, TrackerError> {
        Ok(self.store.results(owner)?)
    }

    pub fn result(
        &self,
        owner: &ResultOwner,
        name: &str,
    ) -> Result<Option<ResultRecord>, TrackerError> {
        Ok(self
            .results(owner)?
            .into_iter()
            .find(|record| record.name == name))
    }

    /// Recompute `is_tested`: at least one `testing.*` result, all successful.
    pub fn refresh_tested(&self, key: &MessageKey) -> Result<bool, TrackerError> {
        let owner = ResultOwner::Message(key.clone());
        let testing: Vec<ResultStatus> = self
            .store
            .results(&owner)?
            .into_iter()
            .filter(|record| is_testing_result(&record.name))
            .map(|record| record.status)
            .collect();
        let tested = !testing.is_empty() && testing.iter().all(|s| *s == ResultStatus::Success);

        self.store.update(key, &mut |message| {
            message.is_tested = tested;
        })?;
        Ok(tested)
    }

    /// Ask for `series` to be applied: record a pending `git` result.
    pub fn request_apply(&self, series: &Message) -> Result<ResultRecord, TrackerError> {
        let repo = self
            .store
            .project(series.project)?
            .and_then(|project| project.git);
        let data = match repo {
            Some(repo) => json!({ "repo": repo }),
            None => json!({}),
        };
        log::info!("series {} queued for git apply", series.key());
        self.set_result(
            ResultOwner::Message(series.key()),
            GIT_RESULT,
            ResultStatus::Pending,
            data,
            None,
        )
    }
}

fn is_testing_result(name: &str) -> bool {
    name.strip_prefix(TESTING_FAMILY)
        .is_some_and(|rest| rest.starts_with('.'))
}

/// Requests a git apply whenever a series becomes complete or a complete
/// series receives new tags.
pub struct GitApplyObserver {
    results: ResultService,
}

impl GitApplyObserver {
    pub fn new(results: ResultService) -> Self {
        Self { results }
    }

    fn complete_series(&self, series: &Message) -> Option<Message> {
        match self.results.store.get(&series.key()) {
            Ok(Some(current)) if current.is_complete => Some(current),
            Ok(_) => None,
            Err(err) => {
                log::warn!("cannot reload series {}: {}", series.key(), err);
                None
            }
        }
    }
}

impl EventObserver for GitApplyObserver {
    fn on_event(&self, event: &Event) {
        let series = match event {
            Event::SeriesComplete { series, .. } => Some(series.clone()),
            Event::TagsUpdate { series } => self.complete_series(series),
            _ => None,
        };
        let Some(series) = series else {
            return;
        };
        if let Err(err) = self.results.request_apply(&series) {
            log::warn!("failed to request apply of {}: {}", series.key(), err);
        }
    }
}
