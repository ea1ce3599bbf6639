use std::{
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use rayon::prelude::*;

use crate::{
    chunking::Chunker,
    doc_id::{DEFAULT_SHARED_ID, DocumentId},
    embedding::Embedder,
    error::{Error, Result},
    extract,
    lexical_index::Document,
    walker,
};

/// Chunks embedded per call to the embedder.
const EMBED_BATCH_SIZE: usize = 32;

/// A document to ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument {
    pub id: Option<String>,
    pub content: String,
}

impl NewDocument {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
        }
    }

    pub fn with_id(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            content: content.into(),
        }
    }
}

/// How ingested documents get their ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IdPolicy {
    /// The caller's id when given, otherwise a generated UUID.
    #[default]
    Auto,
    /// A fresh UUID for every document, ignoring caller ids.
    Generated,
    /// Every document of the batch under one id.
    Shared(String),
}

impl IdPolicy {
    pub fn shared() -> Self {
        IdPolicy::Shared(DEFAULT_SHARED_ID.to_string())
    }

    pub fn assign(&self, caller_id: Option<&str>) -> String {
        match self {
            IdPolicy::Auto => caller_id
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| DocumentId::generate().into_string()),
            IdPolicy::Generated => DocumentId::generate().into_string(),
            IdPolicy::Shared(id) => id.clone(),
        }
    }
}

/// Turns raw text into stored [`Document`]s: chunk, then embed.
pub struct DocumentBuilder<'a> {
    chunker: &'a Chunker,
    embedder: &'a dyn Embedder,
}

impl<'a> DocumentBuilder<'a> {
    pub fn new(chunker: &'a Chunker, embedder: &'a dyn Embedder) -> Self {
        Self { chunker, embedder }
    }

    pub fn build(&self, id: String, content: String) -> Result<Document> {
        let chunks = self.chunker.chunk(&content);
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<&str> = batch.iter().map(String::as_str).collect();
            vectors.extend(self.embedder.embed_batch(&texts)?);
        }

        Ok(Document {
            id,
            content,
            chunks,
            vectors,
        })
    }

    /// Build every `(id, content)` pair in parallel, preserving order.
    pub fn build_all(&self, items: Vec<(String, String)>) -> Result<Vec<Document>> {
        items
            .into_par_iter()
            .map(|(id, content)| self.build(id, content))
            .collect()
    }
}

/// Read `(id, content)` pairs from a CSV file with a header row.
///
/// Fails with [`Error::NotFound`] when either column is missing.
pub fn read_dataset(
    path: &Path,
    id_column: &str,
    content_column: &str,
) -> Result<Vec<(String, String)>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| Error::NotFound {
                kind: "column",
                name: name.to_string(),
            })
    };
    let id_idx = position(id_column)?;
    let content_idx = position(content_column)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let id = record.get(id_idx).unwrap_or_default().to_string();
        let content = record.get(content_idx).unwrap_or_default().to_string();
        rows.push((id, content));
    }
    Ok(rows)
}

/// Extract every supported document under `dir`.
///
/// Ids are derived from each file's relative path. Files that fail to
/// extract are logged and skipped. `progress` is called with
/// `(completed, total)` after each file.
pub fn read_directory(
    dir: &Path,
    progress: &(dyn Fn(usize, usize) + Sync),
) -> Result<Vec<(String, String)>> {
    let files = walker::discover_files(dir)?;
    let total = files.len();
    let completed = AtomicUsize::new(0);
    tracing::debug!(dir = %dir.display(), files = total, "discovered documents");

    let loaded: Vec<(String, String)> = files
        .par_iter()
        .filter_map(|file| {
            let text = extract::extract_as(&file.absolute_path, file.format);
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            progress(done, total);
            match text {
                Ok(text) => {
                    let rel = file.relative_path.to_string_lossy();
                    Some((DocumentId::for_path(&rel).into_string(), text))
                }
                Err(e) => {
                    tracing::warn!(
                        path = %file.relative_path.display(),
                        error = %e,
                        "skipping document"
                    );
                    None
                }
            }
        })
        .collect();

    Ok(loaded)
}
