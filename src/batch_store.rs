use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    chunking::Chunk,
    error::{Error, Result},
};

/// Header size: 4 bytes vector count + 4 bytes dimension.
const HEADER_SIZE: usize = 8;

const CHUNKS_FILE: &str = "chunks.json";

/// Contents of a batch's chunk file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFile {
    pub batch: u64,
    /// Chunks per embedding sub-batch file.
    pub sub_batch_size: usize,
    pub chunks: Vec<Chunk>,
}

impl ChunkFile {
    /// Number of embedding sub-batch files the batch should have.
    pub fn sub_batch_count(&self) -> usize {
        self.chunks.len().div_ceil(self.sub_batch_size.max(1))
    }
}

/// Dense vectors for one sub-batch, paired with the chunk ids they embed.
///
/// Binary format:
/// - 4 bytes: vector count N (u32 LE)
/// - 4 bytes: dimension D (u32 LE)
/// - N * 8 bytes: chunk ids (u64 LE)
/// - N * D * 4 bytes: f32 LE values, one vector after another
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBlock {
    pub ids: Vec<u64>,
    pub dimension: usize,
    pub data: Vec<f32>,
}

impl EmbeddingBlock {
    /// Build a block from per-chunk vectors of equal length.
    pub fn from_vectors(ids: Vec<u64>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if ids.len() != vectors.len() {
            return Err(Error::Corrupt(format!(
                "{} ids for {} vectors",
                ids.len(),
                vectors.len()
            )));
        }
        let dimension = vectors.first().map_or(0, Vec::len);
        if vectors.iter().any(|v| v.len() != dimension) {
            return Err(Error::Corrupt(
                "vectors in one sub-batch differ in dimension".into(),
            ));
        }
        if !ids.is_empty() && dimension == 0 {
            return Err(Error::Corrupt("vectors have dimension 0".into()));
        }
        let data = vectors.into_iter().flatten().collect();
        Ok(Self {
            ids,
            dimension,
            data,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The `i`-th vector.
    pub fn vector(&self, i: usize) -> &[f32] {
        &self.data[i * self.dimension..(i + 1) * self.dimension]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            HEADER_SIZE
                + std::mem::size_of_val(self.ids.as_slice())
                + std::mem::size_of_val(self.data.as_slice()),
        );
        bytes.extend_from_slice(&(self.ids.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(bytemuck::cast_slice(&self.ids));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.data));
        bytes
    }

    /// Decode a sub-batch file. Any length mismatch is corruption.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Corrupt("embedding file header truncated".into()));
        }
        let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            as usize;
        let dimension =
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])
                as usize;

        if count > 0 && dimension == 0 {
            return Err(Error::Corrupt(format!(
                "embedding file holds {count} vectors of dimension 0"
            )));
        }

        let expected_len = count
            .checked_mul(8)
            .and_then(|ids| ids.checked_add(HEADER_SIZE))
            .and_then(|ids_end| {
                count
                    .checked_mul(dimension)?
                    .checked_mul(4)?
                    .checked_add(ids_end)
                    .map(|total| (ids_end, total))
            });
        let Some((ids_end, expected_len)) = expected_len else {
            return Err(Error::Corrupt(format!(
                "embedding file header is out of range: {count} vectors of \
                 dimension {dimension}"
            )));
        };
        if bytes.len() != expected_len {
            return Err(Error::Corrupt(format!(
                "embedding file is {} bytes, expected {expected_len}",
                bytes.len()
            )));
        }

        let ids: Vec<u64> =
            bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..ids_end]);
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[ids_end..]);

        Ok(Self {
            ids,
            dimension,
            data,
        })
    }
}

/// File-backed store of batch outputs, one directory per batch:
///
/// ```text
/// batches/
///   batch_00000/
///     chunks.json          chunk list for the batch
///     embeddings_0000.bin  vectors for chunks [0, sub_batch_size)
///     embeddings_0001.bin  ...
/// ```
///
/// Files are renamed into place after writing, so each is either absent
/// or complete.
#[derive(Debug, Clone)]
pub struct BatchStore {
    root: PathBuf,
}

impl BatchStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn batch_dir(&self, batch: u64) -> PathBuf {
        self.root.join(format!("batch_{batch:05}"))
    }

    /// Remove anything a previous attempt left for `batch` and recreate
    /// its empty directory.
    pub fn reset_batch(&self, batch: u64) -> Result<()> {
        let dir = self.batch_dir(batch);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        Ok(())
    }

    pub fn write_chunks(&self, file: &ChunkFile) -> Result<()> {
        let bytes = serde_json::to_vec(file)?;
        write_atomic(&self.batch_dir(file.batch).join(CHUNKS_FILE), &bytes)
    }

    pub fn read_chunks(&self, batch: u64) -> Result<ChunkFile> {
        let path = self.batch_dir(batch).join(CHUNKS_FILE);
        let bytes = read_file(&path)?;
        let file: ChunkFile = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Corrupt(format!("{}: {e}", path.display()))
        })?;
        if file.batch != batch {
            return Err(Error::Corrupt(format!(
                "{} belongs to batch {}",
                path.display(),
                file.batch
            )));
        }
        Ok(file)
    }

    pub fn write_embeddings(
        &self,
        batch: u64,
        sub_batch: usize,
        block: &EmbeddingBlock,
    ) -> Result<()> {
        write_atomic(&self.embeddings_path(batch, sub_batch), &block.to_bytes())
    }

    pub fn read_embeddings(
        &self,
        batch: u64,
        sub_batch: usize,
    ) -> Result<EmbeddingBlock> {
        let path = self.embeddings_path(batch, sub_batch);
        EmbeddingBlock::from_bytes(&read_file(&path)?).map_err(|e| match e {
            Error::Corrupt(msg) => {
                Error::Corrupt(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Delete every batch directory.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn embeddings_path(&self, batch: u64, sub_batch: usize) -> PathBuf {
        self.batch_dir(batch)
            .join(format!("embeddings_{sub_batch:04}.bin"))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound {
                kind: "batch file",
                name: path.display().to_string(),
            }
        } else {
            Error::Io(e)
        }
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: u64, batch: u64) -> Chunk {
        Chunk {
            id,
            text: format!("chunk number {id}"),
            source: format!("line_{}", id + 1),
            line: id,
            batch,
            title: String::new(),
            category: String::new(),
        }
    }

    fn store() -> (tempfile::TempDir, BatchStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = BatchStore::new(tmp.path().join("batches"));
        store.clear().unwrap();
        (tmp, store)
    }

    #[test]
    fn chunk_file_roundtrip() {
        let (_tmp, store) = store();
        store.reset_batch(2).unwrap();
        let file = ChunkFile {
            batch: 2,
            sub_batch_size: 2,
            chunks: (0..5).map(|i| chunk(i, 2)).collect(),
        };
        store.write_chunks(&file).unwrap();

        let loaded = store.read_chunks(2).unwrap();
        assert_eq!(loaded, file);
        assert_eq!(loaded.sub_batch_count(), 3);
    }

    #[test]
    fn embedding_block_roundtrip() {
        let (_tmp, store) = store();
        store.reset_batch(0).unwrap();
        let block = EmbeddingBlock::from_vectors(
            vec![10, 11],
            vec![vec![1.0, 0.0, -1.5], vec![0.25, 2.0, 3.0]],
        )
        .unwrap();
        store.write_embeddings(0, 0, &block).unwrap();

        let loaded = store.read_embeddings(0, 0).unwrap();
        assert_eq!(loaded, block);
        assert_eq!(loaded.vector(1), &[0.25, 2.0, 3.0]);
    }

    #[test]
    fn empty_block_roundtrip() {
        let block = EmbeddingBlock::from_vectors(vec![], vec![]).unwrap();
        let decoded = EmbeddingBlock::from_bytes(&block.to_bytes()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn truncated_embedding_file_is_corrupt() {
        let block = EmbeddingBlock::from_vectors(
            vec![1, 2],
            vec![vec![1.0; 4], vec![2.0; 4]],
        )
        .unwrap();
        let bytes = block.to_bytes();

        for len in [0, 4, bytes.len() - 1] {
            assert!(matches!(
                EmbeddingBlock::from_bytes(&bytes[..len]),
                Err(Error::Corrupt(_))
            ));
        }
    }

    fn header(count: u32, dimension: u32) -> Vec<u8> {
        let mut bytes = count.to_le_bytes().to_vec();
        bytes.extend_from_slice(&dimension.to_le_bytes());
        bytes
    }

    #[test]
    fn zero_dimension_with_vectors_is_corrupt() {
        let mut bytes = header(2, 0);
        bytes.extend_from_slice(bytemuck::cast_slice(&[0u64, 1]));
        assert!(matches!(
            EmbeddingBlock::from_bytes(&bytes),
            Err(Error::Corrupt(_))
        ));
        assert!(
            EmbeddingBlock::from_vectors(vec![0, 1], vec![vec![], vec![]])
                .is_err()
        );
    }

    #[test]
    fn oversized_header_is_corrupt_not_a_panic() {
        for (count, dimension) in
            [(u32::MAX, u32::MAX), (u32::MAX, 1), (1, u32::MAX)]
        {
            let mut bytes = header(count, dimension);
            bytes.extend_from_slice(&[0u8; 64]);
            assert!(matches!(
                EmbeddingBlock::from_bytes(&bytes),
                Err(Error::Corrupt(_))
            ));
        }
    }

    #[test]
    fn mismatched_vectors_are_rejected() {
        assert!(
            EmbeddingBlock::from_vectors(vec![1], vec![vec![1.0], vec![2.0]])
                .is_err()
        );
        assert!(
            EmbeddingBlock::from_vectors(
                vec![1, 2],
                vec![vec![1.0], vec![2.0, 3.0]]
            )
            .is_err()
        );
    }

    #[test]
    fn missing_files_are_not_found() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.read_chunks(0),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            store.read_embeddings(0, 0),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn reset_batch_removes_stale_files() {
        let (_tmp, store) = store();
        store.reset_batch(1).unwrap();
        let stale = store.batch_dir(1).join("embeddings_0007.bin");
        std::fs::write(&stale, b"junk").unwrap();

        store.reset_batch(1).unwrap();
        assert!(!stale.exists());
        assert!(store.batch_dir(1).is_dir());
    }

    #[test]
    fn clear_removes_all_batches() {
        let (_tmp, store) = store();
        store.reset_batch(0).unwrap();
        store.reset_batch(1).unwrap();
        store.clear().unwrap();
        assert!(!store.batch_dir(0).exists());
        assert!(store.root().is_dir());
    }
}
