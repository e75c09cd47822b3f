//! Top-level wiring of the tracker components.

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::events::{EventBus, EventObserver};
use crate::models::{Caller, Message, Project};
use crate::queues::{QueueManager, WatchQueueObserver};
use crate::results::{GitApplyObserver, ResultService};
use crate::review::{ReviewStateEngine, TagMatcher};
use crate::search::QueryExecutor;
use crate::storage::{MemoryStore, StoreCapabilities, Store, StoreError};
use crate::sync::Importer;
use crate::threading::ThreadIndex;
use std::path::PathBuf;
use std::sync::Arc;

/// One tracker instance: a store plus every service operating on it.
///
/// Components are constructed once here and shared by reference; nothing is
/// looked up through globals.
pub struct Tracker {
    config: TrackerConfig,
    store: Arc<dyn Store>,
    memory: Option<Arc<MemoryStore>>,
    bus: EventBus,
    index: Arc<ThreadIndex>,
    review: Arc<ReviewStateEngine>,
    results: ResultService,
    queues: QueueManager,
    executor: QueryExecutor,
    importer: Importer,
}

impl Tracker {
    /// Wire a tracker around `store`.
    ///
    /// The review engine runs as a message hook; the git apply and watch
    /// queue observers are registered on the event bus in that order.
    pub fn new(config: TrackerConfig, store: Arc<dyn Store>) -> Result<Self, TrackerError> {
        let bus = EventBus::new();
        let matcher = TagMatcher::new(config.tag_names.as_slice())?;
        log::debug!("recognised tags: {:?}", matcher.names());

        let index = Arc::new(ThreadIndex::new(store.clone(), bus.clone()));
        let review = Arc::new(ReviewStateEngine::new(store.clone(), bus.clone(), matcher));
        index.register_hook(review.clone());

        let results = ResultService::new(store.clone(), bus.clone());
        let executor = QueryExecutor::new(store.clone()).with_timeout(config.query_timeout);
        let queues = QueueManager::new(store.clone(), bus.clone(), executor.clone());
        bus.register(Arc::new(GitApplyObserver::new(results.clone())));
        bus.register(Arc::new(WatchQueueObserver::new(queues.clone())));

        let importer = Importer::new(store.clone(), index.clone(), config.import_threads);

        Ok(Self {
            config,
            store,
            memory: None,
            bus,
            index,
            review,
            results,
            queues,
            executor,
            importer,
        })
    }

    /// Tracker over a fresh in-memory store.
    pub fn in_memory(config: TrackerConfig) -> Result<Self, TrackerError> {
        let memory = Arc::new(MemoryStore::new(StoreCapabilities {
            full_text_search: config.full_text_search,
        }));
        Self::with_memory_store(config, memory)
    }

    fn with_memory_store(config: TrackerConfig, memory: Arc<MemoryStore>) -> Result<Self, TrackerError> {
        let mut tracker = Self::new(config, memory.clone())?;
        tracker.memory = Some(memory);
        Ok(tracker)
    }

    /// Configure logging and the tracker from `TRACKER_*` variables,
    /// resuming from the snapshot in the snapshot directory when present.
    pub fn from_env() -> Result<Self, TrackerError> {
        crate::init_logger();
        Self::open(TrackerConfig::from_env())
    }

    /// Tracker resumed from the snapshot in `config.snapshot_dir`, or an
    /// empty one. The configured capabilities win over the stored ones.
    pub fn open(config: TrackerConfig) -> Result<Self, TrackerError> {
        match MemoryStore::load_from_disk(&config.snapshot_dir) {
            Ok(memory) => {
                let configured = StoreCapabilities {
                    full_text_search: config.full_text_search,
                };
                if memory.capabilities() != configured {
                    log::warn!(
                        "snapshot full text search {} overridden by configuration ({})",
                        memory.capabilities().full_text_search,
                        configured.full_text_search
                    );
                }
                let memory = memory.with_capabilities(configured);
                Self::with_memory_store(config, Arc::new(memory))
            }
            Err(StoreError::NotFound) => {
                log::info!("no snapshot in {}, starting empty", config.snapshot_dir.display());
                Self::in_memory(config)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Write the in-memory store to the snapshot directory. Returns `None`
    /// when the tracker runs on another store.
    pub fn save_snapshot(&self) -> Result<Option<PathBuf>, TrackerError> {
        match &self.memory {
            Some(memory) => Ok(Some(memory.save_to_disk(&self.config.snapshot_dir)?)),
            None => Ok(None),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn index(&self) -> &ThreadIndex {
        &self.index
    }

    pub fn review(&self) -> &ReviewStateEngine {
        &self.review
    }

    pub fn results(&self) -> &ResultService {
        &self.results
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn importer(&self) -> &Importer {
        &self.importer
    }

    pub fn register_observer(&self, observer: Arc<dyn EventObserver>) {
        self.bus.register(observer);
    }

    pub fn create_project(&self, project: Project) -> Result<Project, TrackerError> {
        let project = self.store.insert_project(project)?;
        log::info!("created project {} ({})", project.name, project.id);
        Ok(project)
    }

    pub fn import(&self, raw: &[u8], project_name: Option<&str>) -> Result<Vec<Message>, TrackerError> {
        self.importer.import(raw, project_name)
    }

    pub fn search(
        &self,
        project_scope: Option<&str>,
        query: &str,
        caller: &Caller,
    ) -> Result<Vec<Message>, TrackerError> {
        Ok(self.executor.execute(project_scope, query, caller)?)
    }
}
