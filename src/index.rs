use crate::{
    batch_store::EmbeddingBlock,
    chunking::Chunk,
    error::{Error, Result},
    tfidf::{SparseVector, TfidfVectorizer},
};

/// Row-major matrix of dense vectors, one row per chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DenseMatrix {
    dimension: usize,
    data: Vec<f32>,
}

impl DenseMatrix {
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn rows(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dimension..(i + 1) * self.dimension]
    }

    /// Drop every row from `rows` on.
    pub fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows * self.dimension);
    }

    /// Append a sub-batch. All blocks must share one dimension.
    pub fn push_block(&mut self, block: &EmbeddingBlock) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        if block.dimension == 0
            || block.data.len() != block.len() * block.dimension
        {
            return Err(Error::Corrupt(format!(
                "{} ids with {} values at dimension {}",
                block.len(),
                block.data.len(),
                block.dimension
            )));
        }
        if self.data.is_empty() {
            self.dimension = block.dimension;
        } else if block.dimension != self.dimension {
            return Err(Error::Corrupt(format!(
                "embedding dimension {} does not match index dimension {}",
                block.dimension, self.dimension
            )));
        }
        self.data.extend_from_slice(&block.data);
        Ok(())
    }
}

/// The in-memory searchable collection, swapped in as a unit.
#[derive(Debug, Clone)]
pub enum AssembledIndex {
    /// Learned embeddings: row `i` of `vectors` embeds `chunks[i]`.
    Dense {
        chunks: Vec<Chunk>,
        vectors: DenseMatrix,
    },
    /// TF-IDF rows fitted over `chunks`.
    Sparse {
        chunks: Vec<Chunk>,
        vectorizer: TfidfVectorizer,
        rows: Vec<SparseVector>,
    },
}

impl AssembledIndex {
    pub fn chunks(&self) -> &[Chunk] {
        match self {
            Self::Dense { chunks, .. } | Self::Sparse { chunks, .. } => chunks,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks().is_empty()
    }

    /// Number of index entries paired with chunks.
    pub fn entries(&self) -> usize {
        match self {
            Self::Dense { vectors, .. } => vectors.rows(),
            Self::Sparse { rows, .. } => rows.len(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dense { .. } => "embedding",
            Self::Sparse { .. } => "statistical",
        }
    }
}
