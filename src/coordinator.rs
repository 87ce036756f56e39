use std::{ops::Range, path::Path};

use tracing::{debug, info, warn};

use crate::{
    batch_store::{BatchStore, ChunkFile},
    chunking::{Chunk, chunk_with},
    config::EngineConfig,
    corpus::{self, CorpusLines},
    embedding::{Embedder, embed_sub_batch},
    error::Result,
    index::AssembledIndex,
    normalizer,
    progress::{BatchProgress, BuildState, EmbeddingSpace},
    state_db::StateDb,
    tfidf::TfidfVectorizer,
};

/// Key under which a corpus's progress is stored.
pub fn corpus_key(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// Drives an embedding build against durable state.
pub struct Coordinator<'a> {
    pub config: &'a EngineConfig,
    pub state: &'a StateDb,
    pub store: &'a BatchStore,
    pub embedder: &'a dyn Embedder,
}

impl Coordinator<'_> {
    /// Build or resume the index for `corpus`.
    ///
    /// `publish` sees the progress record after every persisted
    /// transition. At most `max_batches` batches run when set. On failure
    /// the record is stored in the `Failed` state with the error message,
    /// `completed_batches` unchanged, and the error is returned.
    pub fn run(
        &self,
        corpus: &Path,
        max_batches: Option<u64>,
        publish: &mut dyn FnMut(&BatchProgress),
    ) -> Result<BatchProgress> {
        let fingerprint = corpus::fingerprint(corpus)?;
        let key = corpus_key(corpus);
        let space = EmbeddingSpace {
            model: self.embedder.model_id().to_string(),
            dimension: self.embedder.dimension(),
        };

        let mut progress = match self.state.load_progress(&key)? {
            Some(p)
                if p.is_resumable_for(
                    &key,
                    fingerprint,
                    self.config.batch_size,
                    Some(&space),
                ) =>
            {
                info!(
                    corpus = %key,
                    completed = p.completed_batches,
                    total = ?p.total_batches,
                    "Resuming build"
                );
                p
            }
            _ => {
                info!(corpus = %key, "Starting fresh build");
                self.state.clear_progress()?;
                self.store.clear()?;
                BatchProgress::new(key, fingerprint, self.config.batch_size)
                    .with_embedding(space)
            }
        };
        progress.resume()?;

        match self.drive(corpus, &mut progress, max_batches, publish) {
            Ok(()) => Ok(progress),
            Err(e) => {
                progress.fail(e.to_string());
                if let Err(save) = self.state.save_progress(&progress) {
                    warn!(error = %save, "Could not record build failure");
                }
                publish(&progress);
                Err(e)
            }
        }
    }

    /// Mark `batch` and every later batch of `corpus` as not done, so the
    /// next [`Coordinator::run`] rebuilds them.
    ///
    /// `chunks` and `embeddings` are the totals held by earlier batches.
    pub fn rewind(
        &self,
        corpus: &Path,
        batch: u64,
        chunks: u64,
        embeddings: u64,
    ) -> Result<()> {
        let key = corpus_key(corpus);
        let Some(mut progress) = self.state.load_progress(&key)? else {
            return Ok(());
        };
        progress.rewind_to(batch, chunks, embeddings)?;
        self.state.save_progress(&progress)?;
        info!(corpus = %key, batch, "Rewound build");
        Ok(())
    }

    fn drive(
        &self,
        corpus: &Path,
        progress: &mut BatchProgress,
        max_batches: Option<u64>,
        publish: &mut dyn FnMut(&BatchProgress),
    ) -> Result<()> {
        if matches!(
            progress.state,
            BuildState::Uninitialized | BuildState::Counting
        ) {
            progress.begin_counting()?;
            self.persist(progress, publish)?;

            let lines = corpus::count_lines(corpus)?;
            progress.set_total_lines(lines)?;
            self.persist(progress, publish)?;
            info!(
                lines,
                batches = ?progress.total_batches,
                batch_size = progress.batch_size,
                "Counted corpus"
            );
        }

        let total = progress.total_batches.unwrap_or(0);
        let mut ran = 0;
        while progress.completed_batches < total {
            if max_batches.is_some_and(|max| ran >= max) {
                info!(
                    completed = progress.completed_batches,
                    total, "Stopping after requested number of batches"
                );
                break;
            }

            let batch = progress.completed_batches;
            let (chunks, embeddings) =
                self.process_batch(corpus, progress, batch)?;
            progress.complete_batch(chunks, embeddings)?;
            self.persist(progress, publish)?;
            ran += 1;

            info!(
                batch = batch + 1,
                total,
                chunks,
                percentage = progress.percentage(),
                "Batch complete"
            );
        }

        Ok(())
    }

    fn process_batch(
        &self,
        corpus: &Path,
        progress: &BatchProgress,
        batch: u64,
    ) -> Result<(u64, u64)> {
        let range = progress.batch_range(batch);
        self.store.reset_batch(batch)?;

        let chunks = chunk_range(
            corpus,
            range,
            batch,
            progress.next_chunk_id(),
            self.config,
        )?;
        let file = ChunkFile {
            batch,
            sub_batch_size: self.config.sub_batch_size,
            chunks,
        };
        self.store.write_chunks(&file)?;

        let mut embeddings = 0;
        for (sub_batch, slice) in
            file.chunks.chunks(self.config.sub_batch_size.max(1)).enumerate()
        {
            let out = embed_sub_batch(self.embedder, slice)?;
            self.store.write_embeddings(batch, sub_batch, &out.block)?;
            embeddings += out.block.len() as u64;
            debug!(
                batch,
                sub_batch,
                items = out.block.len(),
                fallback = out.fallback_used,
                zeroed = out.zeroed,
                "Sub-batch written"
            );
        }

        Ok((file.chunks.len() as u64, embeddings))
    }

    fn persist(
        &self,
        progress: &BatchProgress,
        publish: &mut dyn FnMut(&BatchProgress),
    ) -> Result<()> {
        self.state.save_progress(progress)?;
        publish(progress);
        Ok(())
    }
}

/// Normalize and chunk the non-empty lines of `corpus` within `range`.
///
/// Chunk ids start at `first_id` and increase in line order. Lines that
/// are not UTF-8 or not JSON are logged and skipped.
pub fn chunk_range(
    corpus: &Path,
    range: Range<u64>,
    batch: u64,
    first_id: u64,
    config: &EngineConfig,
) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let mut next_id = first_id;
    let mut skipped = 0u64;

    for line in CorpusLines::open(corpus)? {
        let line = line?;
        if line.index < range.start {
            continue;
        }
        if line.index >= range.end {
            break;
        }
        let line_no = line.index + 1;

        let Some(text) = line.text() else {
            warn!(line = line_no, "Skipping line that is not valid UTF-8");
            skipped += 1;
            continue;
        };
        let doc = match normalizer::parse_line(text, &config.normalizer) {
            Ok(Some(doc)) => doc,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed JSON line");
                skipped += 1;
                continue;
            }
        };

        let source = if doc.source.is_empty() {
            format!("line_{line_no}")
        } else {
            doc.source
        };
        for text in chunk_with(&doc.text, &config.chunking) {
            chunks.push(Chunk {
                id: next_id,
                text,
                source: source.clone(),
                line: line.index,
                batch,
                title: doc.title.clone(),
                category: doc.category.clone(),
            });
            next_id += 1;
        }
    }

    if skipped > 0 {
        warn!(batch, skipped, "Skipped unreadable lines");
    }
    Ok(chunks)
}

/// Build the statistical index over the whole corpus in one pass.
///
/// Nothing is persisted. The returned progress describes the build as a
/// single batch so status reporting works the same for both variants.
pub fn build_statistical(
    corpus: &Path,
    config: &EngineConfig,
    publish: &mut dyn FnMut(&BatchProgress),
) -> Result<(AssembledIndex, BatchProgress)> {
    let fingerprint = corpus::fingerprint(corpus)?;
    let lines = corpus::count_lines(corpus)?;
    let mut progress =
        BatchProgress::new(corpus_key(corpus), fingerprint, lines.max(1));
    progress.begin_counting()?;
    progress.set_total_lines(lines)?;
    publish(&progress);

    let chunks = chunk_range(corpus, 0..lines, 0, 0, config)?;
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    let (vectorizer, rows) = TfidfVectorizer::fit_transform(&texts, config.tfidf);
    info!(
        chunks = chunks.len(),
        vocabulary = vectorizer.vocabulary_len(),
        "Fitted statistical index"
    );

    if lines > 0 {
        progress.complete_batch(chunks.len() as u64, rows.len() as u64)?;
    }
    publish(&progress);

    Ok((
        AssembledIndex::Sparse {
            chunks,
            vectorizer,
            rows,
        },
        progress,
    ))
}
