use super::error::SearchError;
use super::query::{self, CompiledQuery};
use crate::models::{Caller, Message, ProjectId};
use crate::storage::{QueryOptions, Scope, Store};
use std::sync::Arc;
use std::time::Duration;

/// Runs compiled queries against a [`Store`].
#[derive(Clone)]
pub struct QueryExecutor {
    store: Arc<dyn Store>,
    timeout: Option<Duration>,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            timeout: None,
        }
    }

    /// Abort searches that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn options(&self) -> QueryOptions {
        self.timeout
            .map(QueryOptions::with_timeout)
            .unwrap_or_default()
    }

    /// Series heads matching `query`, newest activity first.
    ///
    /// `project_scope` restricts the search to a project and its
    /// sub-projects; an unknown project yields no results.
    pub fn execute(
        &self,
        project_scope: Option<&str>,
        query: &str,
        caller: &Caller,
    ) -> Result<Vec<Message>, SearchError> {
        let compiled = query::compile(query, caller)?;
        let scope = match project_scope {
            Some(name) => match self.project_family(name)? {
                Some(ids) => Scope::SeriesHeads {
                    projects: Some(ids),
                },
                None => {
                    log::debug!("search scoped to unknown project {}", name);
                    return Ok(Vec::new());
                }
            },
            None => Scope::all_series(),
        };
        self.execute_in(&scope, compiled, &self.options())
    }

    /// Run an already compiled query over an explicit candidate set.
    pub fn execute_in(
        &self,
        scope: &Scope,
        compiled: CompiledQuery,
        options: &QueryOptions,
    ) -> Result<Vec<Message>, SearchError> {
        let predicate = compiled.into_predicate(self.store.capabilities());
        let started = std::time::Instant::now();
        let found = self.store.query(scope, &predicate, options)?;
        log::debug!(
            "query matched {} messages in {:?}",
            found.len(),
            started.elapsed()
        );
        Ok(found)
    }

    /// Whether `message` alone satisfies `query`.
    pub fn query_test_message(
        &self,
        query: &str,
        message: &Message,
        caller: &Caller,
    ) -> Result<bool, SearchError> {
        let compiled = query::compile(query, caller)?;
        let scope = Scope::Messages(vec![message.key()]);
        let found = self.execute_in(&scope, compiled, &self.options())?;
        Ok(!found.is_empty())
    }

    /// Ids of `name` and its direct sub-projects.
    fn project_family(&self, name: &str) -> Result<Option<Vec<ProjectId>>, SearchError> {
        let Some(project) = self.store.project_by_name(name)? else {
            return Ok(None);
        };
        let mut ids = vec![project.id];
        ids.extend(
            self.store
                .projects()?
                .into_iter()
                .filter(|candidate| candidate.parent == Some(project.id))
                .map(|candidate| candidate.id),
        );
        Ok(Some(ids))
    }
}
