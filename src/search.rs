use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use rayon::prelude::*;
use serde::Serialize;

use crate::{
    error::{Error, Result},
    lexical_index::SearchHit,
    reranker::CrossEncoder,
    vector_index::{DEFAULT_TREES, VectorIndex},
};

/// Documents taken from the lexical stage, and chunks kept per document,
/// when the caller does not say.
pub const DEFAULT_K: usize = 5;

/// Parameters of a search.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    /// Fields searched by the lexical stage; `None` searches all text fields.
    pub fields: Option<Vec<String>>,
    /// Documents taken from the lexical stage and chunks kept per document.
    pub k: usize,
    pub timeout: Option<Duration>,
}

impl SearchParams {
    pub fn new(query: impl Into<String>, k: usize) -> Self {
        Self {
            query: query.into(),
            fields: None,
            k,
            timeout: None,
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A chunk selected by vector similarity within its document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMatch {
    pub doc_id: String,
    pub chunk: String,
    #[serde(skip)]
    pub vector: Vec<f32>,
}

/// A chunk ranked by the fusion stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub doc_id: String,
    pub chunk: String,
    pub score: f32,
}

/// Wall-clock budget of one search call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    start: Instant,
    timeout: Option<Duration>,
}

impl Deadline {
    pub(crate) fn start(timeout: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        match self.timeout {
            Some(timeout) if self.start.elapsed() > timeout => {
                Err(Error::SearchTimeout {
                    elapsed: self.start.elapsed(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Split flattened lexical hits back into per-document groups, keeping
/// lexical rank order.
pub(crate) fn group_by_document(hits: &[SearchHit]) -> Vec<&[SearchHit]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=hits.len() {
        if i == hits.len() || hits[i].position == 0 {
            if i > start {
                groups.push(&hits[start..i]);
            }
            start = i;
        }
    }
    groups
}

/// The `k` chunks of one document closest to `query_vector`.
fn rerank_document(
    group: &[SearchHit],
    query_vector: &[f32],
    k: usize,
) -> Result<Vec<ChunkMatch>> {
    let Some(first) = group.first() else {
        return Ok(Vec::new());
    };

    let mut index = VectorIndex::new(first.vector.len());
    for (i, hit) in group.iter().enumerate() {
        index.add_item(i, &hit.vector)?;
    }
    index.build(DEFAULT_TREES);

    Ok(index
        .query(query_vector, k)?
        .into_iter()
        .map(|i| ChunkMatch {
            doc_id: group[i].doc_id.clone(),
            chunk: group[i].chunk.clone(),
            vector: group[i].vector.clone(),
        })
        .collect())
}

/// Vector stage: rerank each document's chunks against the query vector.
///
/// Documents are processed in parallel; the result keeps lexical order.
pub(crate) fn vector_rerank(
    groups: &[&[SearchHit]],
    query_vector: &[f32],
    k: usize,
    deadline: &Deadline,
) -> Result<Vec<ChunkMatch>> {
    let per_document: Vec<Vec<ChunkMatch>> = groups
        .par_iter()
        .map(|group| {
            deadline.check()?;
            rerank_document(group, query_vector, k)
        })
        .collect::<Result<_>>()?;
    Ok(per_document.into_iter().flatten().collect())
}

/// Fusion candidates: lexically matching chunks, then vector-selected
/// chunks, each `(doc_id, chunk)` pair kept once.
pub(crate) fn fusion_pool(
    hits: &[SearchHit],
    reranked: &[ChunkMatch],
) -> Vec<(String, String)> {
    let lexical = hits
        .iter()
        .filter(|h| h.lexical_score.is_some())
        .map(|h| (&h.doc_id, &h.chunk));
    let vector = reranked.iter().map(|m| (&m.doc_id, &m.chunk));

    let mut seen = HashSet::new();
    let mut pool = Vec::new();
    for (doc_id, chunk) in lexical.chain(vector) {
        if seen.insert((doc_id.as_str(), chunk.as_str())) {
            pool.push((doc_id.clone(), chunk.clone()));
        }
    }
    pool
}

/// Candidates scored per cross-encoder call during fusion.
const FUSION_BATCH_SIZE: usize = 32;

/// Fusion stage: score the pool jointly with the query, best first.
///
/// Scoring runs in batches and the deadline is checked between them, so
/// a large pool cannot overrun the timeout by more than one batch.
pub(crate) fn fuse(
    cross_encoder: &dyn CrossEncoder,
    query: &str,
    pool: Vec<(String, String)>,
    deadline: &Deadline,
) -> Result<Vec<RankedResult>> {
    let texts: Vec<&str> = pool.iter().map(|(_, chunk)| chunk.as_str()).collect();
    let mut scores = Vec::with_capacity(texts.len());
    for batch in texts.chunks(FUSION_BATCH_SIZE) {
        deadline.check()?;
        let batch_scores = cross_encoder.score(query, batch)?;
        if batch_scores.len() != batch.len() {
            return Err(Error::Model(format!(
                "cross-encoder returned {} scores for {} candidates",
                batch_scores.len(),
                batch.len()
            )));
        }
        scores.extend(batch_scores);
    }
    deadline.check()?;

    let mut ranked: Vec<RankedResult> = pool
        .into_iter()
        .zip(scores)
        .map(|((doc_id, chunk), score)| RankedResult {
            doc_id,
            chunk,
            score,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(ranked)
}

/// Print chunk matches for a terminal.
pub fn format_matches_human(results: &[ChunkMatch]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, r) in results.iter().enumerate() {
        println!("{:>3}. {}", i + 1, r.doc_id);
        println!("     {}", r.chunk);
    }
    println!("\n{} result(s)", results.len());
}

/// Print ranked results for a terminal.
pub fn format_ranked_human(results: &[RankedResult]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, r) in results.iter().enumerate() {
        println!("{:>3}. [{:.3}] {}", i + 1, r.score, r.doc_id);
        println!("     {}", r.chunk);
    }
    println!("\n{} result(s)", results.len());
}

#[derive(Serialize)]
struct JsonOutput<'a, T> {
    query: &'a str,
    result_count: usize,
    results: &'a [T],
}

/// Serialize results as one JSON object.
pub fn to_json<T: Serialize>(query: &str, results: &[T]) -> Result<String> {
    Ok(serde_json::to_string(&JsonOutput {
        query,
        result_count: results.len(),
        results,
    })?)
}
