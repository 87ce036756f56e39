use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where a build currently stands. `Failed` is reachable from any running
/// state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildState {
    Uninitialized,
    Counting,
    Building { batch: u64 },
    Complete,
    Failed { batch: Option<u64>, error: String },
}

/// Size and modification time of a corpus file when its build started.
///
/// A build only resumes against the exact same file; anything else starts
/// over from line 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusFingerprint {
    pub size: u64,
    pub mtime: u64,
}

/// The vector space a dense build writes into.
///
/// Vectors from different models or dimensions cannot share one index,
/// so a build only resumes with the same space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSpace {
    pub model: String,
    pub dimension: usize,
}

/// Progress of one build against one corpus file.
///
/// # Examples
///
/// ```
/// use memdex::progress::{BatchProgress, CorpusFingerprint};
///
/// let fp = CorpusFingerprint { size: 10, mtime: 1 };
/// let mut progress = BatchProgress::new("corpus.jsonl", fp, 5_000);
/// progress.begin_counting().unwrap();
/// progress.set_total_lines(12_500).unwrap();
/// assert_eq!(progress.total_batches, Some(3));
/// assert_eq!(progress.batch_range(2), 10_000..12_500);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub corpus_path: String,
    pub fingerprint: CorpusFingerprint,
    pub batch_size: u64,
    pub total_lines: Option<u64>,
    pub total_batches: Option<u64>,
    pub completed_batches: u64,
    pub total_chunks_processed: u64,
    pub total_embeddings_created: u64,
    /// Embedding space of the stored vectors. `None` for builds that
    /// store none.
    #[serde(default)]
    pub embedding: Option<EmbeddingSpace>,
    pub state: BuildState,
}

impl BatchProgress {
    pub fn new(
        corpus_path: impl Into<String>,
        fingerprint: CorpusFingerprint,
        batch_size: u64,
    ) -> Self {
        Self {
            corpus_path: corpus_path.into(),
            fingerprint,
            batch_size,
            total_lines: None,
            total_batches: None,
            completed_batches: 0,
            total_chunks_processed: 0,
            total_embeddings_created: 0,
            embedding: None,
            state: BuildState::Uninitialized,
        }
    }

    pub fn with_embedding(mut self, space: EmbeddingSpace) -> Self {
        self.embedding = Some(space);
        self
    }

    /// Whether this record describes a build of the same corpus with the
    /// same batch geometry and embedding space, so it can be resumed.
    pub fn is_resumable_for(
        &self,
        corpus_path: &str,
        fingerprint: CorpusFingerprint,
        batch_size: u64,
        embedding: Option<&EmbeddingSpace>,
    ) -> bool {
        self.corpus_path == corpus_path
            && self.fingerprint == fingerprint
            && self.batch_size == batch_size
            && self.embedding.as_ref() == embedding
    }

    pub fn begin_counting(&mut self) -> Result<()> {
        match self.state {
            BuildState::Uninitialized | BuildState::Counting => {
                self.state = BuildState::Counting;
                Ok(())
            }
            _ => Err(self.illegal("begin counting")),
        }
    }

    /// Fix the line count, and with it the batch count, for this build.
    pub fn set_total_lines(&mut self, total_lines: u64) -> Result<()> {
        if self.state != BuildState::Counting {
            return Err(self.illegal("set line totals"));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }

        let total_batches = total_lines.div_ceil(self.batch_size);
        self.total_lines = Some(total_lines);
        self.total_batches = Some(total_batches);
        self.state = if total_batches == 0 {
            BuildState::Complete
        } else {
            BuildState::Building { batch: 0 }
        };
        Ok(())
    }

    /// Re-enter the running state after a failure or a restart.
    pub fn resume(&mut self) -> Result<()> {
        if self.state == BuildState::Complete {
            return Ok(());
        }
        let next = match self.total_batches {
            None => BuildState::Counting,
            Some(total) if self.completed_batches >= total => {
                BuildState::Complete
            }
            Some(_) => BuildState::Building {
                batch: self.completed_batches,
            },
        };
        self.state = next;
        Ok(())
    }

    /// Record that the current batch and all of its embedding sub-batches
    /// are durably written.
    pub fn complete_batch(
        &mut self,
        chunks: u64,
        embeddings: u64,
    ) -> Result<()> {
        let total = self
            .total_batches
            .ok_or_else(|| self.illegal("complete a batch before counting"))?;
        match self.state {
            BuildState::Building { batch }
                if batch == self.completed_batches =>
            {
                self.completed_batches += 1;
                self.total_chunks_processed += chunks;
                self.total_embeddings_created += embeddings;
                self.state = if self.completed_batches >= total {
                    BuildState::Complete
                } else {
                    BuildState::Building {
                        batch: self.completed_batches,
                    }
                };
                Ok(())
            }
            _ => Err(self.illegal("complete a batch")),
        }
    }

    /// Mark batches from `batch` on as not done. `chunks` and
    /// `embeddings` are the totals of the batches before it.
    pub fn rewind_to(
        &mut self,
        batch: u64,
        chunks: u64,
        embeddings: u64,
    ) -> Result<()> {
        if batch > self.completed_batches {
            return Err(self.illegal("rewind past the completed batches"));
        }
        self.completed_batches = batch;
        self.total_chunks_processed = chunks;
        self.total_embeddings_created = embeddings;
        self.state = BuildState::Building { batch };
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        let batch = match self.state {
            BuildState::Building { batch } => Some(batch),
            BuildState::Failed { batch, .. } => batch,
            _ => None,
        };
        self.state = BuildState::Failed {
            batch,
            error: error.into(),
        };
    }

    /// First chunk id the next batch assigns.
    pub fn next_chunk_id(&self) -> u64 {
        self.total_chunks_processed
    }

    /// Half-open range of non-empty corpus line indexes covered by `batch`.
    pub fn batch_range(&self, batch: u64) -> Range<u64> {
        let start = batch.saturating_mul(self.batch_size);
        let end = start.saturating_add(self.batch_size);
        match self.total_lines {
            Some(total) => start.min(total)..end.min(total),
            None => start..end,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, BuildState::Complete)
            || self
                .total_batches
                .is_some_and(|total| self.completed_batches >= total)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            BuildState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Completed share of batches, truncated to a whole percent.
    pub fn percentage(&self) -> u8 {
        match self.total_batches {
            Some(0) => 100,
            Some(total) => {
                (self.completed_batches.min(total) * 100 / total) as u8
            }
            None => 0,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Returns `None` when the stored bytes are not a progress record.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    fn illegal(&self, action: &str) -> Error {
        Error::Corrupt(format!(
            "cannot {action} while build is {:?}",
            self.state
        ))
    }
}
