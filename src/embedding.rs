//! Dense embedding of chunk text.
//!
//! The [`Embedder`] trait is the seam to the external embedding service.
//! [`embed_sub_batch`] wraps it with the two-tier failure policy: one
//! batched call, then per-item calls, then zero vectors, so every chunk in
//! a sub-batch ends up with exactly one vector of the right dimension.

use tracing::{debug, warn};

use crate::{
    batch_store::EmbeddingBlock,
    chunking::Chunk,
    error::{Error, Result},
};

/// A service that maps strings to fixed-length vectors.
pub trait Embedder: Send + Sync {
    /// Identifier of the underlying model.
    fn model_id(&self) -> &str;

    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;

    /// Embed `texts`, returning one vector per input in input order.
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
}

/// Result of embedding one sub-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SubBatchEmbeddings {
    pub block: EmbeddingBlock,
    /// Whether the batched call failed and items were embedded one by one.
    pub fallback_used: bool,
    /// Items that received a zero vector.
    pub zeroed: usize,
}

/// Error for vectors whose length is not the configured dimension.
///
/// A service that answers with the wrong shape will keep doing so, so this
/// fails the build instead of zero-filling every item.
fn dimension_mismatch(returned: usize, dimension: usize) -> Error {
    Error::Config(format!(
        "embedding service returned {returned}-dimensional vectors but \
         embedding_dimension is {dimension}"
    ))
}

/// Embed a sub-batch of chunks, never dropping an item.
///
/// The returned block has one vector per chunk, in chunk order, each of
/// `embedder.dimension()` values. Items whose call fails get a zero
/// vector. Vectors of the wrong length and [`Error::Config`] failures
/// are returned as errors.
pub fn embed_sub_batch(
    embedder: &dyn Embedder,
    chunks: &[Chunk],
) -> Result<SubBatchEmbeddings> {
    let dimension = embedder.dimension();
    let ids: Vec<u64> = chunks.iter().map(|c| c.id).collect();
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();

    let batched = match embedder.embed(&texts) {
        Ok(vectors) if vectors.len() == texts.len() => {
            if let Some(v) = vectors.iter().find(|v| v.len() != dimension) {
                return Err(dimension_mismatch(v.len(), dimension));
            }
            Some(vectors)
        }
        Ok(vectors) => {
            warn!(
                expected = texts.len(),
                returned = vectors.len(),
                "Embedding call returned the wrong number of vectors, \
                 retrying items individually"
            );
            None
        }
        Err(e @ Error::Config(_)) => return Err(e),
        Err(e) => {
            warn!(
                items = texts.len(),
                error = %e,
                "Embedding call failed, retrying items individually"
            );
            None
        }
    };

    if let Some(vectors) = batched {
        return Ok(SubBatchEmbeddings {
            block: EmbeddingBlock::from_vectors(ids, vectors)?,
            fallback_used: false,
            zeroed: 0,
        });
    }

    let mut vectors = Vec::with_capacity(texts.len());
    let mut zeroed = 0;
    for (id, text) in ids.iter().zip(&texts) {
        match embed_one(embedder, text, dimension)? {
            Some(vector) => vectors.push(vector),
            None => {
                debug!(chunk_id = id, "Substituting zero vector");
                zeroed += 1;
                vectors.push(vec![0.0; dimension]);
            }
        }
    }
    if zeroed > 0 {
        warn!(zeroed, items = texts.len(), "Chunks left with zero vectors");
    }

    Ok(SubBatchEmbeddings {
        block: EmbeddingBlock::from_vectors(ids, vectors)?,
        fallback_used: true,
        zeroed,
    })
}

fn embed_one(
    embedder: &dyn Embedder,
    text: &str,
    dimension: usize,
) -> Result<Option<Vec<f32>>> {
    match embedder.embed(&[text]) {
        Ok(mut vectors) if vectors.len() == 1 => match vectors.pop() {
            Some(v) if v.len() != dimension => {
                Err(dimension_mismatch(v.len(), dimension))
            }
            v => Ok(v),
        },
        Ok(_) => Ok(None),
        Err(e @ Error::Config(_)) => Err(e),
        Err(e) => {
            debug!(error = %e, "Single-item embedding failed");
            Ok(None)
        }
    }
}

/// Embed a search query, checking the vector's shape.
pub fn embed_query(embedder: &dyn Embedder, query: &str) -> Result<Vec<f32>> {
    let mut vectors = embedder.embed(&[query])?;
    match vectors.pop() {
        Some(v) if vectors.is_empty() && v.len() == embedder.dimension() => {
            Ok(v)
        }
        _ => Err(Error::Embedding(
            "embedding service returned a malformed query vector".into(),
        )),
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::FakeEmbedder, *};

    fn chunks(n: u64) -> Vec<Chunk> {
        (0..n)
            .map(|id| Chunk {
                id,
                text: format!("chunk text {id}"),
                source: format!("line_{}", id + 1),
                line: id,
                batch: 0,
                title: String::new(),
                category: String::new(),
            })
            .collect()
    }

    #[test]
    fn batched_call_succeeds() {
        let embedder = FakeEmbedder::new(8);
        let out = embed_sub_batch(&embedder, &chunks(5)).unwrap();
        assert_eq!(out.block.len(), 5);
        assert_eq!(out.block.ids, vec![0, 1, 2, 3, 4]);
        assert!(!out.fallback_used);
        assert_eq!(embedder.calls(), 1);
    }

    #[test]
    fn failed_batch_falls_back_to_single_calls() {
        let embedder = FakeEmbedder {
            fail_batches: true,
            ..FakeEmbedder::new(8)
        };
        let out = embed_sub_batch(&embedder, &chunks(50)).unwrap();

        assert!(out.fallback_used);
        assert_eq!(out.zeroed, 0);
        assert_eq!(out.block.len(), 50);
        assert_eq!(embedder.calls(), 51);
        assert!(out.block.vector(3).iter().any(|x| *x > 0.0));
    }

    #[test]
    fn all_failing_items_get_zero_vectors() {
        let embedder = FakeEmbedder {
            fail_batches: true,
            poison: Some("chunk".into()),
            ..FakeEmbedder::new(4)
        };
        let input = chunks(50);
        let out = embed_sub_batch(&embedder, &input).unwrap();

        assert_eq!(out.block.len(), 50);
        assert_eq!(out.zeroed, 50);
        assert_eq!(
            out.block.ids,
            input.iter().map(|c| c.id).collect::<Vec<_>>()
        );
        assert!(out.block.data.iter().all(|x| *x == 0.0));
        assert_eq!(out.block.dimension, 4);
    }

    #[test]
    fn only_poisoned_items_are_zeroed() {
        let embedder = FakeEmbedder {
            poison: Some("text 2".into()),
            ..FakeEmbedder::new(4)
        };
        let out = embed_sub_batch(&embedder, &chunks(4)).unwrap();
        assert!(out.fallback_used);
        assert_eq!(out.zeroed, 1);
        assert!(out.block.vector(2).iter().all(|x| *x == 0.0));
        assert!(out.block.vector(1).iter().any(|x| *x != 0.0));
    }

    #[test]
    fn wrong_dimension_fails_the_sub_batch() {
        let embedder = FakeEmbedder {
            returned_dimension: Some(3),
            ..FakeEmbedder::new(4)
        };
        let err = embed_sub_batch(&embedder, &chunks(5)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("3-dimensional"));
        assert_eq!(embedder.calls(), 1);
    }

    #[test]
    fn wrong_dimension_on_single_items_fails_too() {
        let embedder = FakeEmbedder {
            fail_batches: true,
            returned_dimension: Some(5),
            ..FakeEmbedder::new(4)
        };
        let err = embed_sub_batch(&embedder, &chunks(5)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(embedder.calls(), 2);
    }

    #[test]
    fn config_errors_are_not_zero_filled() {
        struct Unconfigured;
        impl Embedder for Unconfigured {
            fn model_id(&self) -> &str {
                "none"
            }
            fn dimension(&self) -> usize {
                4
            }
            fn embed(&self, _: &[&str]) -> Result<Vec<Vec<f32>>> {
                Err(Error::Config("no key".into()))
            }
        }
        let err = embed_sub_batch(&Unconfigured, &chunks(3)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn query_embedding_checks_shape() {
        let embedder = FakeEmbedder::new(6);
        assert_eq!(embed_query(&embedder, "hello").unwrap().len(), 6);

        let broken = FakeEmbedder {
            poison: Some("x".into()),
            ..FakeEmbedder::new(6)
        };
        assert!(embed_query(&broken, "x").is_err());
    }
}
