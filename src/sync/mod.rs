//! Message import.
//!
//! Raw RFC 822 messages (one at a time, or split out of an mbox) are parsed,
//! routed to the projects that recognise them, and handed to the
//! [`ThreadIndex`] for ingestion.
//!
//! Batch imports parse on a Rayon pool sized by configuration. Ingestion
//! runs on the same pool, one task per thread of the batch; each task
//! ingests its messages in date order so replies find their parents.

pub mod mbox;
pub mod parser;
pub mod routing;

use crate::error::TrackerError;
use crate::models::{Message, MessageKey, Project};
use crate::storage::Store;
use crate::threading::ThreadIndex;
use parser::{ParsedMessage, parse_message};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use mbox::{MboxReader, split_mbox};

/// Counters for one batch import.
#[derive(Debug, Default)]
pub struct ImportStats {
    pub parsed: AtomicUsize,
    pub parse_errors: AtomicUsize,
    pub imported: AtomicUsize,
    pub duplicates: AtomicUsize,
    pub unrouted: AtomicUsize,
    pub ingest_errors: AtomicUsize,
}

impl ImportStats {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ImportSummary {
        ImportSummary {
            parsed: self.parsed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            imported: self.imported.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            ingest_errors: self.ingest_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub parsed: usize,
    pub parse_errors: usize,
    pub imported: usize,
    pub duplicates: usize,
    pub unrouted: usize,
    pub ingest_errors: usize,
}

pub struct Importer {
    store: Arc<dyn Store>,
    index: Arc<ThreadIndex>,
    threads: usize,
}

impl Importer {
    pub fn new(store: Arc<dyn Store>, index: Arc<ThreadIndex>, threads: usize) -> Self {
        Self {
            store,
            index,
            threads: threads.max(1),
        }
    }

    /// Parse and ingest one raw message.
    ///
    /// With `project_name` the message goes to that project only; otherwise
    /// it is ingested once into every project that recognises it.
    pub fn import(&self, raw: &[u8], project_name: Option<&str>) -> Result<Vec<Message>, TrackerError> {
        let parsed = parse_message(raw)?;
        let projects = self.target_projects(&parsed, project_name)?;
        if projects.is_empty() {
            log::debug!("no project recognises {}", parsed.message_id);
        }
        projects
            .iter()
            .map(|project| self.index.ingest(project, &parsed))
            .collect()
    }

    /// Import every message of an mbox stream.
    pub fn import_mbox<R: BufRead>(
        &self,
        reader: R,
        project_name: Option<&str>,
    ) -> Result<ImportSummary, TrackerError> {
        let raws = MboxReader::new(reader).collect::<Result<Vec<_>, _>>()?;
        self.import_batch(&raws, project_name)
    }

    pub fn import_batch<B>(&self, raws: &[B], project_name: Option<&str>) -> Result<ImportSummary, TrackerError>
    where
        B: AsRef<[u8]> + Sync,
    {
        let named = match project_name {
            Some(name) => Some(
                self.store
                    .project_by_name(name)?
                    .ok_or_else(|| TrackerError::UnknownProject(name.to_string()))?,
            ),
            None => None,
        };
        let all_projects = self.store.projects()?;

        log::info!("importing {} messages with {} threads", raws.len(), self.threads);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| TrackerError::ThreadPool(e.to_string()))?;
        let stats = ImportStats::default();

        let mut parsed: Vec<ParsedMessage> = pool.install(|| {
            raws.par_iter()
                .filter_map(|raw| match parse_message(raw.as_ref()) {
                    Ok(message) => {
                        ImportStats::bump(&stats.parsed);
                        Some(message)
                    }
                    Err(err) => {
                        ImportStats::bump(&stats.parse_errors);
                        log::warn!("skipping unparseable message: {}", err);
                        None
                    }
                })
                .collect()
        });
        parsed.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.message_id.cmp(&b.message_id)));
        let threads = group_by_thread(parsed);

        pool.install(|| {
            threads.par_iter().for_each(|thread| {
                for message in thread {
                    let projects: Vec<&Project> = match &named {
                        Some(project) => vec![project],
                        None => all_projects
                            .iter()
                            .filter(|project| project.recognizes(message))
                            .collect(),
                    };
                    if projects.is_empty() {
                        ImportStats::bump(&stats.unrouted);
                    }
                    for project in projects {
                        self.ingest_counted(project, message, &stats);
                    }
                }
            })
        });

        let summary = stats.snapshot();
        log::info!(
            "import complete: {} imported, {} duplicates, {} unrouted, {} errors",
            summary.imported,
            summary.duplicates,
            summary.unrouted,
            summary.parse_errors + summary.ingest_errors
        );
        Ok(summary)
    }

    fn ingest_counted(&self, project: &Project, message: &ParsedMessage, stats: &ImportStats) {
        match self.store.get(&MessageKey::new(project.id, message.message_id.clone())) {
            Ok(Some(_)) => {
                ImportStats::bump(&stats.duplicates);
                return;
            }
            Ok(None) => {}
            Err(err) => log::debug!("duplicate check failed for {}: {}", message.message_id, err),
        }
        match self.index.ingest(project, message) {
            Ok(_) => ImportStats::bump(&stats.imported),
            Err(err) => {
                ImportStats::bump(&stats.ingest_errors);
                log::warn!("failed to ingest {} into {}: {}", message.message_id, project.name, err);
            }
        }
    }

    fn target_projects(
        &self,
        parsed: &ParsedMessage,
        project_name: Option<&str>,
    ) -> Result<Vec<Project>, TrackerError> {
        if let Some(name) = project_name {
            let project = self
                .store
                .project_by_name(name)?
                .ok_or_else(|| TrackerError::UnknownProject(name.to_string()))?;
            return Ok(vec![project]);
        }
        Ok(self
            .store
            .projects()?
            .into_iter()
            .filter(|project| project.recognizes(parsed))
            .collect())
    }
}

/// Split date-ordered messages into threads: messages whose reply chains
/// meet inside the batch share a thread. Order within a thread is kept.
fn group_by_thread(messages: Vec<ParsedMessage>) -> Vec<Vec<ParsedMessage>> {
    let parents: HashMap<&str, &str> = messages
        .iter()
        .filter_map(|m| Some((m.message_id.as_str(), m.in_reply_to.as_deref()?)))
        .collect();

    let roots: Vec<String> = messages
        .iter()
        .map(|message| {
            let mut current = message.message_id.as_str();
            let mut visited = HashSet::new();
            while let Some(parent) = parents.get(current) {
                if !visited.insert(current) {
                    break;
                }
                current = *parent;
            }
            current.to_string()
        })
        .collect();

    let mut threads: Vec<Vec<ParsedMessage>> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();
    for (message, root) in messages.into_iter().zip(roots) {
        let slot = *slots.entry(root).or_insert_with(|| {
            threads.push(Vec::new());
            threads.len() - 1
        });
        threads[slot].push(message);
    }
    threads
}
