use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use memdex::{
    BuildOptions,
    BuildPhase,
    Chunk,
    DataDir,
    Embedder,
    Engine,
    EngineConfig,
    Error,
    IndexStrategy,
    Result,
    RetrievedChunk,
    embedding::embed_sub_batch,
};

const DIMENSION: usize = 8;

/// Deterministic embedder: vectors are byte-frequency histograms.
///
/// Batched calls fail when `fail_batches` is set, and any text containing
/// `poison` fails even alone. `wide` doubles the dimension.
#[derive(Default)]
struct HistogramEmbedder {
    fail_batches: bool,
    poison: Option<&'static str>,
    wide: bool,
    calls: AtomicUsize,
}

impl Embedder for HistogramEmbedder {
    fn model_id(&self) -> &str {
        "histogram"
    }

    fn dimension(&self) -> usize {
        if self.wide { 2 * DIMENSION } else { DIMENSION }
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_batches && texts.len() > 1 {
            return Err(Error::Embedding("batch rejected".into()));
        }
        texts
            .iter()
            .map(|text| {
                if self.poison.is_some_and(|p| text.contains(p)) {
                    return Err(Error::Embedding("item rejected".into()));
                }
                let dimension = self.dimension();
                let mut v = vec![0.0; dimension];
                for b in text.bytes() {
                    v[b as usize % dimension] += 1.0;
                }
                Ok(v)
            })
            .collect()
    }
}

fn write_corpus(path: &Path, lines: usize) {
    let body: String = (0..lines)
        .map(|i| {
            format!(
                "{{\"title\": \"Note {i}\", \"project\": \"P{}\", \"content\": \"Entry {i} records what happened on day {} of the garden diary.\"}}\n",
                i % 3,
                i % 365
            )
        })
        .collect();
    std::fs::write(path, body).unwrap();
}

fn config(batch_size: u64) -> EngineConfig {
    EngineConfig {
        batch_size,
        sub_batch_size: 50,
        ..EngineConfig::default()
    }
}

fn engine(root: &Path, batch_size: u64) -> Engine {
    let data_dir = DataDir::resolve(Some(root)).unwrap();
    Engine::open_with(&data_dir, config(batch_size), IndexStrategy::Embedding)
        .unwrap()
        .with_embedder(Arc::new(HistogramEmbedder::default()))
}

/// Every indexed chunk, ordered by id.
fn all_chunks(engine: &Engine) -> Vec<RetrievedChunk> {
    let mut all = engine.retrieve("garden diary", usize::MAX, None).unwrap();
    all.sort_by_key(|r| r.id);
    all
}

struct Fixture {
    tmp: tempfile::TempDir,
    corpus: PathBuf,
}

fn fixture(lines: usize) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let corpus = tmp.path().join("memory.jsonl");
    write_corpus(&corpus, lines);
    Fixture { tmp, corpus }
}

#[test]
fn fresh_engine_retrieves_nothing() {
    let f = fixture(10);
    let engine = engine(&f.tmp.path().join("data"), 5);
    assert!(!engine.is_ready());
    assert!(engine.retrieve("garden", 5, None).unwrap().is_empty());
    assert_eq!(engine.build_status().status, BuildPhase::NotStarted);
}

#[test]
fn interrupted_build_resumes_to_the_same_index() {
    let f = fixture(12_500);
    let data = f.tmp.path().join("data");

    let first = engine(&data, 5_000);
    let status = first
        .load_corpus_with(
            &f.corpus,
            BuildOptions {
                max_batches: Some(1),
                on_progress: None,
            },
        )
        .unwrap();
    assert_eq!(status.batches_completed, 1);
    assert_eq!(status.total_batches, 3);
    assert_eq!(status.percentage, 33);
    assert_eq!(status.chunks_processed, 5_000);
    assert_eq!(all_chunks(&first).len(), 5_000);
    drop(first);

    // Leftovers of a crash in the middle of batch 1.
    let stale = data.join("batches").join("batch_00001");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("embeddings_0000.bin"), b"garbage").unwrap();

    let resumed = engine(&data, 5_000);
    assert_eq!(resumed.build_status().batches_completed, 1);
    let status = resumed.load_corpus(&f.corpus).unwrap();
    assert_eq!(status.status, BuildPhase::Complete);
    assert_eq!(status.percentage, 100);
    assert_eq!(status.chunks_processed, 12_500);

    let uninterrupted = engine(&f.tmp.path().join("other"), 5_000);
    uninterrupted.load_corpus(&f.corpus).unwrap();

    let resumed_chunks = all_chunks(&resumed);
    let reference = all_chunks(&uninterrupted);
    assert_eq!(resumed_chunks.len(), 12_500);

    let ids: Vec<u64> = resumed_chunks.iter().map(|r| r.id).collect();
    assert_eq!(ids, (0..12_500).collect::<Vec<_>>());

    for (a, b) in resumed_chunks.iter().zip(&reference) {
        assert_eq!((a.id, &a.text, &a.source), (b.id, &b.text, &b.source));
        assert_eq!(a.score, b.score);
    }
}

#[test]
fn completed_build_is_not_redone() {
    let f = fixture(20);
    let data = f.tmp.path().join("data");
    engine(&data, 8).load_corpus(&f.corpus).unwrap();

    let embedder = Arc::new(HistogramEmbedder::default());
    let data_dir = DataDir::resolve(Some(&data)).unwrap();
    let again =
        Engine::open_with(&data_dir, config(8), IndexStrategy::Embedding)
            .unwrap()
            .with_embedder(embedder.clone());
    let status = again.load_corpus(&f.corpus).unwrap();

    assert_eq!(status.status, BuildPhase::Complete);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn changed_corpus_starts_a_fresh_build() {
    let f = fixture(10);
    let data = f.tmp.path().join("data");
    let engine = engine(&data, 4);
    engine.load_corpus(&f.corpus).unwrap();
    assert_eq!(all_chunks(&engine).len(), 10);

    write_corpus(&f.corpus, 14);
    let status = engine.load_corpus(&f.corpus).unwrap();
    assert_eq!(status.status, BuildPhase::Complete);
    assert_eq!(status.total_batches, 4);

    let ids: Vec<u64> = all_chunks(&engine).iter().map(|r| r.id).collect();
    assert_eq!(ids, (0..14).collect::<Vec<_>>());
}

#[test]
fn truncated_embedding_file_stops_assembly_at_that_batch() {
    let f = fixture(30);
    let data = f.tmp.path().join("data");
    engine(&data, 10).load_corpus(&f.corpus).unwrap();

    let file = data
        .join("batches")
        .join("batch_00002")
        .join("embeddings_0000.bin");
    let bytes = std::fs::read(&file).unwrap();
    std::fs::write(&file, &bytes[..bytes.len() / 2]).unwrap();

    let reopened = engine(&data, 10);
    assert!(reopened.is_ready());
    let chunks = all_chunks(&reopened);
    assert_eq!(chunks.len(), 20);
    assert!(chunks.iter().all(|r| r.id < 20));

    let status = reopened.build_status();
    assert_eq!(status.status, BuildPhase::Failed);
    assert_eq!(status.unreadable_batch, Some(2));

    let status = reopened.load_corpus(&f.corpus).unwrap();
    assert_eq!(status.status, BuildPhase::Complete);
    assert_eq!(status.chunks_processed, 30);
    let ids: Vec<u64> = all_chunks(&reopened).iter().map(|r| r.id).collect();
    assert_eq!(ids, (0..30).collect::<Vec<_>>());
}

#[test]
fn resume_with_a_different_embedder_starts_over() {
    let f = fixture(30);
    let data = f.tmp.path().join("data");
    let status = engine(&data, 10)
        .load_corpus_with(
            &f.corpus,
            BuildOptions {
                max_batches: Some(1),
                on_progress: None,
            },
        )
        .unwrap();
    assert_eq!(status.batches_completed, 1);

    let wide = Arc::new(HistogramEmbedder {
        wide: true,
        ..HistogramEmbedder::default()
    });
    let data_dir = DataDir::resolve(Some(&data)).unwrap();
    let resumed =
        Engine::open_with(&data_dir, config(10), IndexStrategy::Embedding)
            .unwrap()
            .with_embedder(wide.clone());
    let status = resumed.load_corpus(&f.corpus).unwrap();
    assert_eq!(status.status, BuildPhase::Complete);
    assert_eq!(status.chunks_processed, 30);
    assert_eq!(status.unreadable_batch, None);

    // Every batch was embedded again in the new space.
    let ids: Vec<u64> = all_chunks(&resumed).iter().map(|r| r.id).collect();
    assert_eq!(ids, (0..30).collect::<Vec<_>>());
    assert!(wide.calls.load(Ordering::SeqCst) >= 3);
}

#[test]
fn failing_batches_fall_back_to_single_items() {
    let embedder = HistogramEmbedder {
        fail_batches: true,
        poison: Some("poison"),
        ..HistogramEmbedder::default()
    };
    let chunks: Vec<Chunk> = (0..50)
        .map(|id| Chunk {
            id,
            text: if id == 7 {
                "this one is poison".to_string()
            } else {
                format!("ordinary chunk {id}")
            },
            source: format!("line_{}", id + 1),
            line: id,
            batch: 0,
            title: String::new(),
            category: String::new(),
        })
        .collect();

    let out = embed_sub_batch(&embedder, &chunks).unwrap();
    assert_eq!(out.block.len(), 50);
    assert!(out.fallback_used);
    assert_eq!(out.zeroed, 1);
    assert!(out.block.vector(7).iter().all(|&x| x == 0.0));
    assert!(out.block.vector(8).iter().any(|&x| x != 0.0));
    assert_eq!(out.block.ids, (0..50).collect::<Vec<_>>());
    // One batched attempt, then one call per item.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 51);
}

#[test]
fn category_filter_applies_before_truncation() {
    let f = fixture(30);
    let engine = engine(&f.tmp.path().join("data"), 10);
    engine.load_corpus(&f.corpus).unwrap();

    let results = engine.retrieve("garden diary", 5, Some("p1")).unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.category == "P1"));
    let ranks: Vec<usize> = results.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
}

#[test]
fn statistical_engine_answers_without_embeddings() {
    let f = fixture(30);
    let data_dir = DataDir::resolve(Some(&f.tmp.path().join("data"))).unwrap();
    let engine =
        Engine::open_with(&data_dir, config(10), IndexStrategy::Statistical)
            .unwrap();
    let status = engine.load_corpus(&f.corpus).unwrap();
    assert_eq!(status.status, BuildPhase::Complete);
    assert_eq!(status.chunks_processed, 30);

    let results = engine.retrieve("Entry 17 records", 1, None).unwrap();
    assert_eq!(results[0].title, "Note 17");
}
