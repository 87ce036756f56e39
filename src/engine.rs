use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        Mutex,
        PoisonError,
        RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use arc_swap::ArcSwapOption;
use tracing::{error, info, warn};

use crate::{
    assembler::assemble,
    batch_store::BatchStore,
    config::EngineConfig,
    context,
    coordinator::{self, Coordinator},
    data_dir::DataDir,
    embedding::{Embedder, embed_query},
    error::{Error, Result},
    index::AssembledIndex,
    openai::OpenAiEmbedder,
    progress::BatchProgress,
    search::{self, QueryVector, RetrievedChunk},
    state_db::StateDb,
    status::{self, BuildPhase, BuildStatus},
};

/// How chunks are turned into searchable vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStrategy {
    /// Dense vectors from an embedding service, built in resumable batches.
    Embedding,
    /// TF-IDF over the whole corpus, rebuilt in memory on every load.
    Statistical,
}

/// Per-call build settings.
#[derive(Default)]
pub struct BuildOptions<'a> {
    /// Stop after this many batches, leaving the build resumable.
    pub max_batches: Option<u64>,
    /// Called with a fresh status after every progress transition.
    pub on_progress: Option<&'a dyn Fn(&BuildStatus)>,
}

/// Clears the build flag when dropped.
struct BuildGuard(Arc<AtomicBool>);

impl BuildGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::BuildInProgress)?;
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the durable state of one data directory and the index built
/// from it. A finished build swaps a complete index in atomically.
pub struct Engine {
    config: EngineConfig,
    strategy: IndexStrategy,
    state: StateDb,
    store: BatchStore,
    embedder: Mutex<Option<Arc<dyn Embedder>>>,
    index: ArcSwapOption<AssembledIndex>,
    progress: RwLock<Option<BatchProgress>>,
    last_error: RwLock<Option<String>>,
    /// First completed batch that could not be assembled.
    assembly_gap: RwLock<Option<(u64, String)>>,
    building: Arc<AtomicBool>,
}

impl Engine {
    /// Open an engine over `data_dir`, resolving configuration from the
    /// environment and stored settings.
    pub fn open(data_dir: &DataDir, strategy: IndexStrategy) -> Result<Self> {
        let state = StateDb::open(&data_dir.state_db())?;
        let config = EngineConfig::resolve(&state)?;
        Self::from_parts(data_dir, state, config, strategy)
    }

    /// Open an engine with an explicit configuration.
    pub fn open_with(
        data_dir: &DataDir,
        config: EngineConfig,
        strategy: IndexStrategy,
    ) -> Result<Self> {
        config.validate()?;
        let state = StateDb::open(&data_dir.state_db())?;
        Self::from_parts(data_dir, state, config, strategy)
    }

    fn from_parts(
        data_dir: &DataDir,
        state: StateDb,
        config: EngineConfig,
        strategy: IndexStrategy,
    ) -> Result<Self> {
        let store = BatchStore::new(data_dir.batches_dir()?);
        let engine = Self {
            config,
            strategy,
            state,
            store,
            embedder: Mutex::new(None),
            index: ArcSwapOption::empty(),
            progress: RwLock::new(None),
            last_error: RwLock::new(None),
            assembly_gap: RwLock::new(None),
            building: Arc::new(AtomicBool::new(false)),
        };

        if strategy == IndexStrategy::Embedding
            && let Some(progress) =
                engine.state.list_progress()?.into_iter().next()
        {
            engine.install_dense(progress.completed_batches);
            *write(&engine.progress) = Some(progress);
        }

        Ok(engine)
    }

    /// Use `embedder` instead of the configured embedding service.
    pub fn with_embedder(self, embedder: Arc<dyn Embedder>) -> Self {
        *lock(&self.embedder) = Some(embedder);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn strategy(&self) -> IndexStrategy {
        self.strategy
    }

    /// Build or resume the index for `corpus`, blocking until done.
    pub fn load_corpus(&self, corpus: &Path) -> Result<BuildStatus> {
        self.load_corpus_with(corpus, BuildOptions::default())
    }

    /// Like [`Engine::load_corpus`], with options.
    ///
    /// Fails with [`Error::BuildInProgress`] while another build runs.
    /// Build errors are recorded for [`Engine::build_status`] and returned.
    pub fn load_corpus_with(
        &self,
        corpus: &Path,
        options: BuildOptions<'_>,
    ) -> Result<BuildStatus> {
        let guard = BuildGuard::acquire(&self.building)?;
        let result = self.run_build(corpus, options);
        drop(guard);
        result.map(|()| self.build_status())
    }

    /// Start a build on a background thread and return immediately.
    ///
    /// The in-progress check happens before this returns. Failures of the
    /// background build only update the status.
    pub fn spawn_build(
        self: &Arc<Self>,
        corpus: PathBuf,
        max_batches: Option<u64>,
    ) -> Result<JoinHandle<()>> {
        let guard = BuildGuard::acquire(&self.building)?;
        let engine = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("memdex-build".to_string())
            .spawn(move || {
                let _guard = guard;
                let options = BuildOptions {
                    max_batches,
                    on_progress: None,
                };
                // Already recorded in the status.
                let _ = engine.run_build(&corpus, options);
            })?;
        Ok(handle)
    }

    fn run_build(
        &self,
        corpus: &Path,
        options: BuildOptions<'_>,
    ) -> Result<()> {
        *write(&self.last_error) = None;
        info!(
            corpus = %corpus.display(),
            strategy = ?self.strategy,
            "Building index"
        );

        let mut publish = |p: &BatchProgress| {
            *write(&self.progress) = Some(p.clone());
            if let Some(observer) = options.on_progress {
                observer(&self.build_status());
            }
        };

        let result = match self.strategy {
            IndexStrategy::Embedding => {
                self.build_embedding(corpus, options.max_batches, &mut publish)
            }
            IndexStrategy::Statistical => {
                self.build_statistical(corpus, &mut publish)
            }
        };

        if let Err(e) = &result {
            error!(error = %e, "Index build failed");
            *write(&self.last_error) = Some(e.to_string());
        }
        result
    }

    fn build_embedding(
        &self,
        corpus: &Path,
        max_batches: Option<u64>,
        publish: &mut dyn FnMut(&BatchProgress),
    ) -> Result<()> {
        let embedder = self.embedder()?;
        let coordinator = Coordinator {
            config: &self.config,
            state: &self.state,
            store: &self.store,
            embedder: embedder.as_ref(),
        };
        let progress = coordinator.run(corpus, max_batches, publish)?;
        let Some((batch, _)) = self.install_dense(progress.completed_batches)
        else {
            return Ok(());
        };

        // Redo the unreadable batch and everything after it.
        warn!(batch, "Rebuilding batches that could not be assembled");
        let (chunks, embeddings) = self
            .index
            .load_full()
            .map_or((0, 0), |i| (i.len() as u64, i.entries() as u64));
        coordinator.rewind(corpus, batch, chunks, embeddings)?;
        let progress = coordinator.run(corpus, max_batches, publish)?;
        self.install_dense(progress.completed_batches);
        Ok(())
    }

    fn build_statistical(
        &self,
        corpus: &Path,
        publish: &mut dyn FnMut(&BatchProgress),
    ) -> Result<()> {
        let (index, _) =
            coordinator::build_statistical(corpus, &self.config, publish)?;
        info!(chunks = index.len(), "Statistical index ready");
        *write(&self.assembly_gap) = None;
        self.index.store(Some(Arc::new(index)));
        Ok(())
    }

    /// Assemble completed batches and swap the result in. Returns the
    /// first batch that could not be loaded, if any.
    fn install_dense(
        &self,
        completed_batches: u64,
    ) -> Option<(u64, String)> {
        let (index, report) = assemble(&self.store, completed_batches);
        if let Some((batch, reason)) = &report.stopped_at {
            warn!(
                batch,
                reason = %reason,
                "Index assembled without later batches"
            );
        }
        info!(
            chunks = index.len(),
            batches = report.batches_loaded,
            "Index assembled"
        );
        self.index.store(Some(Arc::new(index)));
        *write(&self.assembly_gap) = report.stopped_at.clone();
        report.stopped_at
    }

    fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        let mut slot = lock(&self.embedder);
        if let Some(embedder) = slot.as_ref() {
            return Ok(Arc::clone(embedder));
        }
        let embedder: Arc<dyn Embedder> =
            Arc::new(OpenAiEmbedder::from_env(&self.config.embedding)?);
        *slot = Some(Arc::clone(&embedder));
        Ok(embedder)
    }

    /// Whether there is a non-empty index to query.
    pub fn is_ready(&self) -> bool {
        self.index.load_full().is_some_and(|i| !i.is_empty())
    }

    /// The top `k` chunks for `query`, optionally restricted to categories
    /// containing `category`.
    ///
    /// Returns an empty list while no index is ready.
    pub fn retrieve(
        &self,
        query: &str,
        k: usize,
        category: Option<&str>,
    ) -> Result<Vec<RetrievedChunk>> {
        let Some(index) = self.index.load_full() else {
            return Ok(Vec::new());
        };
        if index.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = match index.as_ref() {
            AssembledIndex::Dense { vectors, .. } => {
                let embedder = self.embedder()?;
                let q = embed_query(embedder.as_ref(), query)?;
                if q.len() != vectors.dimension() {
                    return Err(Error::Config(format!(
                        "query embedding has {} dimensions but the index has \
                         {}; rebuild the index or fix embedding_dimension",
                        q.len(),
                        vectors.dimension()
                    )));
                }
                QueryVector::Dense(q)
            }
            AssembledIndex::Sparse { vectorizer, .. } => {
                QueryVector::Sparse(vectorizer.transform(query))
            }
        };
        let scores = search::score_all(&index, &query_vector);
        Ok(search::top_k(&index, &scores, k, category))
    }

    /// Retrieve and render results as a prompt context block.
    ///
    /// Empty when nothing is retrieved.
    pub fn context_for_query(
        &self,
        query: &str,
        k: usize,
        category: Option<&str>,
        max_chars: usize,
    ) -> Result<String> {
        let results = self.retrieve(query, k, category)?;
        Ok(context::format_context(&results, max_chars))
    }

    /// Current build status. Safe to call while a build runs.
    pub fn build_status(&self) -> BuildStatus {
        let building = self.building.load(Ordering::Acquire);
        let progress = read(&self.progress).clone();
        let index = self.index.load_full();
        let gap = read(&self.assembly_gap).clone();
        let mut status = status::report(
            progress.as_ref(),
            index.as_deref(),
            gap.as_ref(),
            building,
        );

        if !building
            && status.status != BuildPhase::Failed
            && let Some(error) = read(&self.last_error).clone()
        {
            status.status = BuildPhase::Failed;
            status.progress = "Build failed".to_string();
            status.error = Some(error);
        }
        status
    }

    /// Delete all progress and batch files and drop the in-memory index.
    pub fn reset(&self) -> Result<()> {
        let _guard = BuildGuard::acquire(&self.building)?;
        self.state.clear_progress()?;
        self.store.clear()?;
        self.index.store(None);
        *write(&self.progress) = None;
        *write(&self.last_error) = None;
        *write(&self.assembly_gap) = None;
        info!("Index reset");
        Ok(())
    }

    /// Stored setting values, for `config show`.
    pub fn state(&self) -> &StateDb {
        &self.state
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("strategy", &self.strategy)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
