//! docfuse - a local hybrid document retrieval engine.
//!
//! Documents are split into sentence chunks, embedded, and stored in a
//! [Tantivy](https://github.com/quickwit-oss/tantivy) index together with
//! their chunk vectors. A search narrows the corpus with BM25, picks each
//! candidate document's closest chunks with an ephemeral vector index, and
//! ranks the pooled chunks with a cross-encoder. The [`rag`] module feeds
//! the ranked chunks to a completion provider.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docfuse::{ModelManager, RetrievalEngine};
//! use docfuse::ingestion::{IdPolicy, NewDocument};
//! use docfuse::lexical_index::IndexSchema;
//! use docfuse::search::SearchParams;
//!
//! let mut engine = RetrievalEngine::new(Arc::new(ModelManager::new()));
//! engine
//!     .open_or_create("index".as_ref(), IndexSchema::default())
//!     .unwrap();
//! engine
//!     .add_documents(
//!         vec![NewDocument::with_id("paris", "Paris is the capital of France.")],
//!         &IdPolicy::Auto,
//!     )
//!     .unwrap();
//!
//! for r in engine.search_and_rank(&SearchParams::new("capital of France", 5)).unwrap() {
//!     println!("{} (score: {:.3}): {}", r.doc_id, r.score, r.chunk);
//! }
//! ```

pub mod chunking;
pub mod data_dir;
pub mod doc_id;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod index_meta;
pub mod ingestion;
pub mod lexical_index;
pub mod model_manager;
pub mod rag;
pub mod reranker;
pub mod search;
pub mod vector_index;
pub mod walker;

pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use engine::RetrievalEngine;
pub use error::{Error, Result};
pub use model_manager::ModelManager;
