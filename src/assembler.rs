//! Reconstitution of the dense index from completed batch files.

use tracing::{debug, warn};

use crate::{
    batch_store::{BatchStore, EmbeddingBlock},
    chunking::Chunk,
    error::{Error, Result},
    index::{AssembledIndex, DenseMatrix},
};

/// What an assembly pass loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyReport {
    pub batches_loaded: u64,
    /// First batch that could not be loaded, with the reason.
    pub stopped_at: Option<(u64, String)>,
}

/// Concatenate batches `0..completed_batches` in order.
///
/// A batch is only added once its chunk file and every embedding
/// sub-batch file have loaded and agree on ids, leaving exactly one
/// vector per chunk. The first batch that fails
/// stops assembly; everything before it is kept and the failure is
/// reported, never raised.
pub fn assemble(
    store: &BatchStore,
    completed_batches: u64,
) -> (AssembledIndex, AssemblyReport) {
    let mut chunks = Vec::new();
    let mut vectors = DenseMatrix::default();
    let mut report = AssemblyReport {
        batches_loaded: 0,
        stopped_at: None,
    };

    for batch in 0..completed_batches {
        let loaded = load_batch(store, batch).and_then(|(c, blocks)| {
            check_dimensions(&vectors, &blocks, batch)?;
            Ok((c, blocks))
        });
        let rows_before = vectors.rows();
        let appended = loaded.and_then(|(batch_chunks, blocks)| {
            for block in &blocks {
                vectors.push_block(block)?;
            }
            let rows = vectors.rows();
            let expected = chunks.len() + batch_chunks.len();
            if rows != expected {
                return Err(Error::Corrupt(format!(
                    "batch {batch} leaves {rows} vectors for {expected} chunks"
                )));
            }
            Ok(batch_chunks)
        });

        match appended {
            Ok(batch_chunks) => {
                debug!(batch, chunks = batch_chunks.len(), "Loaded batch");
                chunks.extend(batch_chunks);
                report.batches_loaded += 1;
            }
            Err(e) => {
                vectors.truncate(rows_before);
                warn!(
                    batch,
                    error = %e,
                    "Stopping index assembly at unreadable batch"
                );
                report.stopped_at = Some((batch, e.to_string()));
                break;
            }
        }
    }

    (AssembledIndex::Dense { chunks, vectors }, report)
}

fn load_batch(
    store: &BatchStore,
    batch: u64,
) -> Result<(Vec<Chunk>, Vec<EmbeddingBlock>)> {
    let file = store.read_chunks(batch)?;
    let step = file.sub_batch_size.max(1);

    let mut blocks = Vec::with_capacity(file.sub_batch_count());
    for (sub_batch, slice) in file.chunks.chunks(step).enumerate() {
        let block = store.read_embeddings(batch, sub_batch)?;
        let expected = slice.iter().map(|c| c.id);
        if block.len() != slice.len() || !block.ids.iter().copied().eq(expected)
        {
            return Err(Error::Corrupt(format!(
                "batch {batch} sub-batch {sub_batch}: embedding ids do not \
                 match chunk ids"
            )));
        }
        blocks.push(block);
    }

    Ok((file.chunks, blocks))
}

fn check_dimensions(
    current: &DenseMatrix,
    blocks: &[EmbeddingBlock],
    batch: u64,
) -> Result<()> {
    let mut dimension = (current.rows() > 0).then(|| current.dimension());
    for block in blocks.iter().filter(|b| !b.is_empty()) {
        match dimension {
            Some(d) if d != block.dimension => {
                return Err(Error::Corrupt(format!(
                    "batch {batch} has dimension {}, expected {d}",
                    block.dimension
                )));
            }
            _ => dimension = Some(block.dimension),
        }
    }
    Ok(())
}
