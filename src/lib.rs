//! memdex - resumable, memory-bounded indexing and retrieval over a
//! personal chat-memory corpus.
//!
//! memdex reads a JSON-lines corpus (optionally gzipped), normalizes each
//! record into a searchable document, splits documents into word-bounded
//! chunks and builds a similarity index over them. Builds run in batches
//! whose results are persisted to disk, so an interrupted build resumes at
//! the next unfinished batch instead of starting over.
//!
//! Two index strategies exist: dense vectors from an OpenAI-compatible
//! embedding service (resumable), and an in-memory TF-IDF index that needs
//! no network access.
//!
//! # Quick start
//!
//! ```no_run
//! use std::path::Path;
//!
//! use memdex::{DataDir, Engine, IndexStrategy};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let engine = Engine::open(&data_dir, IndexStrategy::Embedding).unwrap();
//!
//! let status = engine.load_corpus(Path::new("memory.jsonl.gz")).unwrap();
//! println!("{}: {}%", status.status, status.percentage);
//!
//! for r in engine.retrieve("sourdough starter", 5, None).unwrap() {
//!     println!("{} {:.3} {}", r.rank, r.score, r.title);
//! }
//! ```

pub mod assembler;
pub mod batch_store;
pub mod chunking;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod corpus;
pub mod data_dir;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod mcp;
pub mod normalizer;
pub mod openai;
pub mod progress;
pub mod search;
pub mod state_db;
pub mod status;
pub mod tfidf;

pub use chunking::Chunk;
pub use config::EngineConfig;
pub use data_dir::DataDir;
pub use embedding::Embedder;
pub use engine::{BuildOptions, Engine, IndexStrategy};
pub use error::{Error, Result};
pub use search::RetrievedChunk;
pub use state_db::StateDb;
pub use status::{BuildPhase, BuildStatus};
