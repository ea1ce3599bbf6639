use std::{path::Path, sync::Arc};

use serde::Serialize;

use crate::{
    chunking::Chunker,
    error::{Error, Result},
    ingestion::{self, DocumentBuilder, IdPolicy, NewDocument},
    lexical_index::{Analyzer, IndexSchema, LexicalIndex, SearchHit},
    model_manager::ModelManager,
    search::{self, ChunkMatch, Deadline, RankedResult, SearchParams},
};

/// Lifecycle state of a [`RetrievalEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Building,
    Loading,
    Ready,
}

/// Summary of an open index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub dir: String,
    pub analyzer: Analyzer,
    pub documents: u64,
    pub dimension: Option<usize>,
    pub embedder: Option<String>,
    pub cross_encoder: Option<String>,
    pub format_version: Option<u32>,
}

/// Hybrid retrieval over one index directory.
///
/// Search runs in three stages: BM25 selects candidate documents, an
/// ephemeral per-document vector index picks each document's closest
/// chunks, and a cross-encoder ranks the pooled chunks against the query.
pub struct RetrievalEngine {
    models: Arc<ModelManager>,
    chunker: Chunker,
    state: EngineState,
    index: Option<LexicalIndex>,
}

impl RetrievalEngine {
    pub fn new(models: Arc<ModelManager>) -> Self {
        Self {
            models,
            chunker: Chunker::new(),
            state: EngineState::Uninitialized,
            index: None,
        }
    }

    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    /// Create a new index in `dir` and make it the engine's index.
    pub fn create(&mut self, dir: &Path, schema: IndexSchema, overwrite: bool) -> Result<()> {
        self.state = EngineState::Building;
        self.index = None;
        match self.create_index(dir, schema, overwrite) {
            Ok(index) => {
                self.index = Some(index);
                self.state = EngineState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = EngineState::Uninitialized;
                Err(e)
            }
        }
    }

    fn create_index(
        &self,
        dir: &Path,
        schema: IndexSchema,
        overwrite: bool,
    ) -> Result<LexicalIndex> {
        let index = LexicalIndex::create(dir, schema, overwrite)?;
        let meta = index.meta();
        meta.set_embedder(&self.models.embedder_spec().to_string())?;
        meta.set_cross_encoder(&self.models.cross_encoder_spec().to_string())?;
        Ok(index)
    }

    /// Load the index stored in `dir`.
    pub fn load(&mut self, dir: &Path) -> Result<()> {
        self.state = EngineState::Loading;
        self.index = None;
        match LexicalIndex::load(dir) {
            Ok(index) => {
                self.warn_on_model_change(&index)?;
                self.index = Some(index);
                self.state = EngineState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = EngineState::Uninitialized;
                Err(e)
            }
        }
    }

    /// Load the index in `dir`, creating it with `schema` if there is none.
    pub fn open_or_create(&mut self, dir: &Path, schema: IndexSchema) -> Result<()> {
        if LexicalIndex::exists(dir)? {
            self.load(dir)
        } else {
            self.create(dir, schema, false)
        }
    }

    fn warn_on_model_change(&self, index: &LexicalIndex) -> Result<()> {
        let current = self.models.embedder_spec().to_string();
        if let Some(stored) = index.meta().embedder()?
            && stored != current
        {
            tracing::warn!(
                stored = %stored,
                current = %current,
                "index was built with a different embedder"
            );
        }
        Ok(())
    }

    fn ready_index(&self) -> Result<&LexicalIndex> {
        match (&self.index, self.state) {
            (Some(index), EngineState::Ready) => Ok(index),
            _ => Err(Error::IndexNotReady),
        }
    }

    /// Chunk, embed, and store `documents` as one batch.
    ///
    /// Returns the assigned ids in input order. Stored documents sharing an
    /// id with the batch are replaced.
    pub fn add_documents(
        &self,
        documents: Vec<NewDocument>,
        policy: &IdPolicy,
    ) -> Result<Vec<String>> {
        let items = documents
            .into_iter()
            .map(|doc| (policy.assign(doc.id.as_deref()), doc.content))
            .collect();
        self.store(items)
    }

    /// Ingest the rows of a CSV dataset. Empty ids are replaced by
    /// generated ones.
    pub fn ingest_dataset(
        &self,
        path: &Path,
        id_column: &str,
        content_column: &str,
    ) -> Result<usize> {
        self.ready_index()?;
        let rows = ingestion::read_dataset(path, id_column, content_column)?;
        let documents = rows
            .into_iter()
            .map(|(id, content)| NewDocument::with_id(id, content))
            .collect();
        let ids = self.add_documents(documents, &IdPolicy::Auto)?;
        tracing::info!(path = %path.display(), documents = ids.len(), "ingested dataset");
        Ok(ids.len())
    }

    /// Ingest every supported document under `dir`.
    ///
    /// `progress` receives `(completed, total)` as files are extracted.
    pub fn ingest_directory(
        &self,
        dir: &Path,
        progress: &(dyn Fn(usize, usize) + Sync),
    ) -> Result<usize> {
        self.ready_index()?;
        let items = ingestion::read_directory(dir, progress)?;
        let ids = self.store(items)?;
        tracing::info!(dir = %dir.display(), documents = ids.len(), "ingested directory");
        Ok(ids.len())
    }

    fn store(&self, items: Vec<(String, String)>) -> Result<Vec<String>> {
        let index = self.ready_index()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let embedder = self.models.embedder()?;
        let documents =
            DocumentBuilder::new(&self.chunker, embedder.as_ref()).build_all(items)?;
        let ids = documents.iter().map(|d| d.id.clone()).collect();
        index.add(&documents)?;
        Ok(ids)
    }

    /// Lexical stage. A malformed query is logged and yields no hits.
    fn lexical_hits(&self, index: &LexicalIndex, params: &SearchParams) -> Result<Vec<SearchHit>> {
        match index.search(&params.query, params.fields.as_deref(), params.k) {
            Ok(hits) => {
                tracing::debug!(hits = hits.len(), "lexical stage");
                Ok(hits)
            }
            Err(Error::QuerySyntax(reason)) => {
                tracing::warn!(query = %params.query, reason = %reason, "ignoring malformed query");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn vector_stage(
        &self,
        hits: &[SearchHit],
        params: &SearchParams,
        deadline: &Deadline,
    ) -> Result<Vec<ChunkMatch>> {
        let query_vector = self.models.embedder()?.embed_one(&params.query)?;
        deadline.check()?;

        let groups = search::group_by_document(hits);
        let matches = search::vector_rerank(&groups, &query_vector, params.k, deadline)?;
        tracing::debug!(documents = groups.len(), chunks = matches.len(), "vector stage");
        Ok(matches)
    }

    /// Up to `k` chunks from each of the `k` best lexical documents,
    /// chosen by vector similarity and listed in lexical document order.
    pub fn search(&self, params: &SearchParams) -> Result<Vec<ChunkMatch>> {
        let index = self.ready_index()?;
        let deadline = Deadline::start(params.timeout);

        let hits = self.lexical_hits(index, params)?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        deadline.check()?;
        let matches = self.vector_stage(&hits, params, &deadline)?;
        deadline.check()?;
        Ok(matches)
    }

    /// Chunks of the lexical and vector stages ranked by the cross-encoder,
    /// best first.
    pub fn search_and_rank(&self, params: &SearchParams) -> Result<Vec<RankedResult>> {
        let index = self.ready_index()?;
        if params.k == 0 {
            return Ok(Vec::new());
        }
        let deadline = Deadline::start(params.timeout);

        let hits = self.lexical_hits(index, params)?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        deadline.check()?;

        let reranked = self.vector_stage(&hits, params, &deadline)?;
        let pool = search::fusion_pool(&hits, &reranked);

        let cross_encoder = self.models.cross_encoder()?;
        let ranked = search::fuse(cross_encoder.as_ref(), &params.query, pool, &deadline)?;
        tracing::debug!(candidates = ranked.len(), "fusion stage");
        Ok(ranked)
    }

    pub fn status(&self) -> Result<IndexStatus> {
        let index = self.ready_index()?;
        let meta = index.meta();
        Ok(IndexStatus {
            dir: index.dir().display().to_string(),
            analyzer: index.analyzer(),
            documents: index.num_docs()?,
            dimension: meta.dimension()?,
            embedder: meta.embedder()?,
            cross_encoder: meta.cross_encoder()?,
            format_version: meta.format_version()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RetrievalEngine {
        RetrievalEngine::new(Arc::new(ModelManager::offline(32)))
    }

    fn ready(dir: &Path) -> RetrievalEngine {
        let mut engine = engine();
        engine.create(dir, IndexSchema::default(), false).unwrap();
        engine
    }

    #[test]
    fn operations_require_ready() {
        let engine = engine();
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(matches!(
            engine.search(&SearchParams::new("x", 1)),
            Err(Error::IndexNotReady)
        ));
        assert!(matches!(
            engine.search_and_rank(&SearchParams::new("x", 1)),
            Err(Error::IndexNotReady)
        ));
        assert!(matches!(
            engine.add_documents(vec![NewDocument::new("x y z")], &IdPolicy::Auto),
            Err(Error::IndexNotReady)
        ));
    }

    #[test]
    fn failed_load_leaves_engine_uninitialized() {
        let tmp = tempfile::tempdir().unwrap();
        let mut engine = engine();
        let err = engine.load(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "index", .. }));
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[test]
    fn create_records_models() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ready(tmp.path());
        let status = engine.status().unwrap();
        assert_eq!(status.embedder.as_deref(), Some("hash:32"));
        assert_eq!(status.cross_encoder.as_deref(), Some("overlap"));
        assert_eq!(status.documents, 0);
        assert_eq!(status.dimension, None);
    }

    #[test]
    fn search_returns_chunks_of_matching_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ready(tmp.path());
        engine
            .add_documents(
                vec![
                    NewDocument::with_id(
                        "paris",
                        "Paris is the capital of France. The Seine flows through it.",
                    ),
                    NewDocument::with_id("berlin", "Berlin is the capital of Germany."),
                ],
                &IdPolicy::Auto,
            )
            .unwrap();

        let matches = engine.search(&SearchParams::new("Seine", 5)).unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.doc_id == "paris"));
        assert!(matches.iter().all(|m| m.vector.len() == 32));
    }

    #[test]
    fn expired_timeout_fails_both_searches() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ready(tmp.path());
        engine
            .add_documents(
                vec![NewDocument::new("Paris is the capital of France.")],
                &IdPolicy::Auto,
            )
            .unwrap();

        let params = SearchParams::new("capital", 5).with_timeout(std::time::Duration::ZERO);
        assert!(matches!(
            engine.search(&params),
            Err(Error::SearchTimeout { .. })
        ));
        assert!(matches!(
            engine.search_and_rank(&params),
            Err(Error::SearchTimeout { .. })
        ));

        let generous = SearchParams::new("capital", 5)
            .with_timeout(std::time::Duration::from_secs(60));
        assert!(!engine.search_and_rank(&generous).unwrap().is_empty());
    }

    #[test]
    fn rank_with_zero_k_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ready(tmp.path());
        engine
            .add_documents(vec![NewDocument::new("Some text to find.")], &IdPolicy::Auto)
            .unwrap();
        assert!(engine
            .search_and_rank(&SearchParams::new("text", 0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn malformed_query_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ready(tmp.path());
        engine
            .add_documents(vec![NewDocument::new("Some text to find.")], &IdPolicy::Auto)
            .unwrap();
        let params = SearchParams::new("\"unbalanced", 3);
        assert!(engine.search(&params).unwrap().is_empty());
        assert!(engine.search_and_rank(&params).unwrap().is_empty());
    }

    #[test]
    fn add_returns_assigned_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ready(tmp.path());
        let ids = engine
            .add_documents(
                vec![
                    NewDocument::new("First document text."),
                    NewDocument::new("Second document text."),
                ],
                &IdPolicy::shared(),
            )
            .unwrap();
        assert_eq!(ids, vec!["shared", "shared"]);
        assert_eq!(engine.status().unwrap().documents, 2);
    }

    #[test]
    fn ingests_dataset() {
        let tmp = tempfile::tempdir().unwrap();
        let index_dir = tmp.path().join("index");
        let engine = ready(&index_dir);
        let csv = tmp.path().join("data.csv");
        std::fs::write(
            &csv,
            "id,text\nparis,Paris is the capital of France.\n,An anonymous row of text.\n",
        )
        .unwrap();

        assert_eq!(engine.ingest_dataset(&csv, "id", "text").unwrap(), 2);
        let matches = engine.search(&SearchParams::new("France", 5)).unwrap();
        assert_eq!(matches[0].doc_id, "paris");
    }

    #[test]
    fn reingesting_directory_replaces_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let index_dir = tmp.path().join("index");
        let docs = tmp.path().join("docs");
        std::fs::create_dir(&docs).unwrap();
        std::fs::write(docs.join("a.txt"), "Alpha document about rivers.").unwrap();
        std::fs::write(docs.join("b.txt"), "Beta document about mountains.").unwrap();

        let engine = ready(&index_dir);
        assert_eq!(engine.ingest_directory(&docs, &|_, _| {}).unwrap(), 2);
        assert_eq!(engine.ingest_directory(&docs, &|_, _| {}).unwrap(), 2);
        assert_eq!(engine.status().unwrap().documents, 2);
    }

    #[test]
    fn open_or_create_reuses_existing_index() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let engine = ready(tmp.path());
            engine
                .add_documents(vec![NewDocument::new("Persisted text here.")], &IdPolicy::Auto)
                .unwrap();
        }

        let mut engine = engine();
        engine.open_or_create(tmp.path(), IndexSchema::default()).unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.status().unwrap().documents, 1);
    }
}
