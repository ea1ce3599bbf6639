//! Tantivy-backed lexical index holding every document with its chunks and
//! chunk vectors.
//!
//! An index directory contains the tantivy segments under `lexical/` and the
//! [`IndexMeta`] settings database next to them. Chunks are stored joined by
//! [`CHUNK_SEPARATOR`]; vectors are stored as one binary blob per document:
//!
//! - 4 bytes: chunk count N (u32 LE)
//! - 4 bytes: dimension D (u32 LE)
//! - N * D * 4 bytes: f32 LE values in row-major order

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    ReloadPolicy,
    TantivyDocument,
    Term,
    collector::TopDocs,
    directory::MmapDirectory,
    doc,
    query::{Query, QueryParser},
    schema::*,
    tokenizer::{
        AsciiFoldingFilter,
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        StopWordFilter,
        TextAnalyzer,
        WhitespaceTokenizer,
    },
};

use crate::{
    chunking::CHUNK_SEPARATOR,
    error::{Error, Result},
    index_meta::IndexMeta,
};

/// Field names used in the schema.
pub mod fields {
    pub const ID: &str = "id";
    pub const CONTENT: &str = "content";
    pub const CHUNKS: &str = "chunks";
    pub const VECTORS: &str = "vectors";
}

const LEXICAL_DIR: &str = "lexical";
const META_FILE: &str = "index_meta.redb";
const WRITER_MEMORY_BUDGET: usize = 50_000_000;

/// Header size: 4 bytes chunk count + 4 bytes dimension.
const VECTOR_HEADER_SIZE: usize = 8;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "for", "from",
    "have", "if", "in", "is", "it", "may", "not", "of", "on", "or", "tbd",
    "that", "the", "this", "to", "us", "we", "when", "will", "with", "yet",
    "you", "your",
];

/// Text analysis applied to `content` and `chunks`.
///
/// Chosen once when the index is created. The analyzer's tokenizer name is
/// written into the tantivy schema, so a loaded index analyzes queries the
/// same way it analyzed documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Analyzer {
    /// Whitespace-separated tokens, case preserved.
    Keyword,
    /// Word tokens, lowercased, English stop words removed.
    #[default]
    Standard,
    /// [`Analyzer::Standard`] with accents folded to ASCII.
    Fancy,
    /// [`Analyzer::Standard`] with English stemming.
    Language,
}

impl Analyzer {
    pub const ALL: [Analyzer; 4] = [
        Analyzer::Keyword,
        Analyzer::Standard,
        Analyzer::Fancy,
        Analyzer::Language,
    ];

    pub fn tokenizer_name(self) -> &'static str {
        match self {
            Analyzer::Keyword => "docfuse_keyword",
            Analyzer::Standard => "docfuse_standard",
            Analyzer::Fancy => "docfuse_fancy",
            Analyzer::Language => "docfuse_en_stem",
        }
    }

    pub fn from_tokenizer_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.tokenizer_name() == name)
    }

    fn text_analyzer(self) -> TextAnalyzer {
        let stop_words = || StopWordFilter::remove(STOP_WORDS.iter().map(|w| w.to_string()));
        match self {
            Analyzer::Keyword => TextAnalyzer::builder(WhitespaceTokenizer::default())
                .filter(RemoveLongFilter::limit(40))
                .build(),
            Analyzer::Standard => TextAnalyzer::builder(SimpleTokenizer::default())
                .filter(RemoveLongFilter::limit(40))
                .filter(LowerCaser)
                .filter(stop_words())
                .build(),
            Analyzer::Fancy => TextAnalyzer::builder(SimpleTokenizer::default())
                .filter(RemoveLongFilter::limit(40))
                .filter(LowerCaser)
                .filter(AsciiFoldingFilter)
                .filter(stop_words())
                .build(),
            Analyzer::Language => TextAnalyzer::builder(SimpleTokenizer::default())
                .filter(RemoveLongFilter::limit(40))
                .filter(LowerCaser)
                .filter(stop_words())
                .filter(Stemmer::new(tantivy::tokenizer::Language::English))
                .build(),
        }
    }
}

impl std::str::FromStr for Analyzer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "keyword" => Ok(Analyzer::Keyword),
            "standard" => Ok(Analyzer::Standard),
            "fancy" => Ok(Analyzer::Fancy),
            "language" => Ok(Analyzer::Language),
            other => Err(Error::Config(format!(
                "unknown analyzer '{other}' (expected keyword, standard, fancy or language)"
            ))),
        }
    }
}

impl std::fmt::Display for Analyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Analyzer::Keyword => "keyword",
            Analyzer::Standard => "standard",
            Analyzer::Fancy => "fancy",
            Analyzer::Language => "language",
        })
    }
}

/// Options fixed when an index is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSchema {
    pub analyzer: Analyzer,
    /// Vector dimension; when `None` it is taken from the first stored
    /// vector.
    pub dimension: Option<usize>,
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
struct SchemaFields {
    id: Field,
    content: Field,
    chunks: Field,
    vectors: Field,
}

impl SchemaFields {
    fn resolve(schema: &Schema) -> Result<Self> {
        Ok(Self {
            id: schema.get_field(fields::ID)?,
            content: schema.get_field(fields::CONTENT)?,
            chunks: schema.get_field(fields::CHUNKS)?,
            vectors: schema.get_field(fields::VECTORS)?,
        })
    }
}

fn build_schema(analyzer: Analyzer) -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field(fields::ID, STRING | STORED);

    let text_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(analyzer.tokenizer_name())
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    builder.add_text_field(fields::CONTENT, text_opts.clone());
    builder.add_text_field(fields::CHUNKS, text_opts);

    builder.add_bytes_field(fields::VECTORS, STORED);

    builder.build()
}

fn register_tokenizers(index: &Index) {
    for analyzer in Analyzer::ALL {
        index
            .tokenizers()
            .register(analyzer.tokenizer_name(), analyzer.text_analyzer());
    }
}

/// The analyzer recorded for the `content` field of a stored schema.
fn schema_analyzer(schema: &Schema, content: Field) -> Result<Analyzer> {
    let tokenizer = match schema.get_field_entry(content).field_type() {
        FieldType::Str(opts) => opts
            .get_indexing_options()
            .map(|o| o.tokenizer().to_string()),
        _ => None,
    };
    let tokenizer = tokenizer.ok_or_else(|| {
        Error::Config("content field is not an indexed text field".into())
    })?;
    Analyzer::from_tokenizer_name(&tokenizer).ok_or_else(|| {
        Error::Config(format!("index uses unknown tokenizer '{tokenizer}'"))
    })
}

/// A stored document: its text, chunks, and one vector per chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub chunks: Vec<String>,
    pub vectors: Vec<Vec<f32>>,
}

impl Document {
    /// Vector dimension, or `None` when the document has no chunks.
    pub fn dimension(&self) -> Option<usize> {
        self.vectors.first().map(Vec::len)
    }
}

/// A document returned by the lexical stage with its BM25 score.
#[derive(Debug, Clone)]
pub struct DocumentMatch {
    pub score: f32,
    pub document: Document,
}

/// One chunk of a lexically matching document.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub doc_id: String,
    pub chunk: String,
    pub vector: Vec<f32>,
    /// Position of the chunk within its document.
    pub position: usize,
    /// The document's BM25 score, present only when this chunk contains an
    /// analyzed query term.
    pub lexical_score: Option<f32>,
}

fn encode_vectors(vectors: &[Vec<f32>]) -> Vec<u8> {
    let dimension = vectors.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(
        VECTOR_HEADER_SIZE + vectors.len() * dimension * 4,
    );
    out.extend_from_slice(&(vectors.len() as u32).to_le_bytes());
    out.extend_from_slice(&(dimension as u32).to_le_bytes());
    for v in vectors {
        out.extend_from_slice(bytemuck::cast_slice(v));
    }
    out
}

fn decode_vectors(bytes: &[u8]) -> Option<Vec<Vec<f32>>> {
    if bytes.len() < VECTOR_HEADER_SIZE {
        return None;
    }
    let count = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
    let dimension = u32::from_le_bytes(bytes[4..8].try_into().ok()?) as usize;
    let body = &bytes[VECTOR_HEADER_SIZE..];
    if body.len() != count * dimension * 4 {
        return None;
    }

    let values: Vec<f32> = match bytemuck::try_cast_slice::<u8, f32>(body) {
        Ok(aligned) => aligned.to_vec(),
        Err(_) => body
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    };
    if dimension == 0 {
        return Some(vec![Vec::new(); count]);
    }
    Some(values.chunks(dimension).map(<[f32]>::to_vec).collect())
}

/// Reject malformed queries tantivy would otherwise parse leniently.
fn check_balanced(query: &str) -> Result<()> {
    let mut in_quotes = false;
    let mut depth: i32 = 0;
    for c in query.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::QuerySyntax(format!(
                        "unbalanced parenthesis in {query:?}"
                    )));
                }
            }
            _ => {}
        }
    }
    if in_quotes {
        return Err(Error::QuerySyntax(format!("unbalanced quote in {query:?}")));
    }
    if depth != 0 {
        return Err(Error::QuerySyntax(format!(
            "unbalanced parenthesis in {query:?}"
        )));
    }
    Ok(())
}

/// Manages the on-disk lexical index of an index directory.
pub struct LexicalIndex {
    dir: PathBuf,
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
    analyzer: Analyzer,
    meta: IndexMeta,
}

impl LexicalIndex {
    /// Whether `dir` holds a valid index.
    pub fn exists(dir: &Path) -> Result<bool> {
        let lexical = dir.join(LEXICAL_DIR);
        if !lexical.is_dir() {
            return Ok(false);
        }
        let mmap_dir = MmapDirectory::open(&lexical)?;
        Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()).into())
    }

    /// Create a new, empty index in `dir`.
    ///
    /// Fails with [`Error::AlreadyExists`] if `dir` already holds an index,
    /// unless `overwrite` is set, in which case the old index is removed.
    pub fn create(dir: &Path, schema: IndexSchema, overwrite: bool) -> Result<Self> {
        if Self::exists(dir)? {
            if !overwrite {
                return Err(Error::AlreadyExists {
                    path: dir.to_path_buf(),
                });
            }
            tracing::info!(dir = %dir.display(), "removing existing index");
        }

        let lexical = dir.join(LEXICAL_DIR);
        if lexical.exists() {
            std::fs::remove_dir_all(&lexical)?;
        }
        let meta_path = dir.join(META_FILE);
        if meta_path.exists() {
            std::fs::remove_file(&meta_path)?;
        }
        std::fs::create_dir_all(&lexical)?;

        let mmap_dir = MmapDirectory::open(&lexical)?;
        let index = Index::create(
            mmap_dir,
            build_schema(schema.analyzer),
            tantivy::IndexSettings::default(),
        )?;

        let meta = IndexMeta::open(&meta_path)?;
        if let Some(dimension) = schema.dimension {
            meta.set_dimension(dimension)?;
        }

        tracing::info!(
            dir = %dir.display(),
            analyzer = %schema.analyzer,
            "created index"
        );
        Self::from_parts(dir, index, meta)
    }

    /// Load an existing index from `dir`.
    ///
    /// Fails with [`Error::NotFound`] when `dir` does not hold an index.
    pub fn load(dir: &Path) -> Result<Self> {
        if !Self::exists(dir)? {
            return Err(Error::NotFound {
                kind: "index",
                name: dir.display().to_string(),
            });
        }

        let mmap_dir = MmapDirectory::open(dir.join(LEXICAL_DIR))?;
        let index = Index::open(mmap_dir)?;
        let meta = IndexMeta::open(&dir.join(META_FILE))?;

        tracing::debug!(dir = %dir.display(), "loaded index");
        Self::from_parts(dir, index, meta)
    }

    fn from_parts(dir: &Path, index: Index, meta: IndexMeta) -> Result<Self> {
        register_tokenizers(&index);
        let schema = index.schema();
        let fields = SchemaFields::resolve(&schema)?;
        let analyzer = schema_analyzer(&schema, fields.content)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            dir: dir.to_path_buf(),
            index,
            reader,
            fields,
            analyzer,
            meta,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn analyzer(&self) -> Analyzer {
        self.analyzer
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    /// Vector dimension, once established.
    pub fn dimension(&self) -> Result<Option<usize>> {
        self.meta.dimension()
    }

    /// Number of stored documents.
    pub fn num_docs(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }

    /// Validate a batch before anything is written, returning the dimension
    /// it establishes.
    fn validate(&self, documents: &[Document]) -> Result<Option<usize>> {
        let mut expected = self.meta.dimension()?;

        for doc in documents {
            if doc.id.is_empty() {
                return Err(Error::InvalidDocument {
                    id: doc.id.clone(),
                    reason: "empty id".into(),
                });
            }
            if doc.chunks.len() != doc.vectors.len() {
                return Err(Error::InvalidDocument {
                    id: doc.id.clone(),
                    reason: format!(
                        "{} chunks but {} vectors",
                        doc.chunks.len(),
                        doc.vectors.len()
                    ),
                });
            }
            if doc.chunks.iter().any(|c| c.is_empty()) {
                return Err(Error::InvalidDocument {
                    id: doc.id.clone(),
                    reason: "empty chunk".into(),
                });
            }
            if doc.chunks.iter().any(|c| c.contains(CHUNK_SEPARATOR)) {
                return Err(Error::InvalidDocument {
                    id: doc.id.clone(),
                    reason: "chunk contains a line break".into(),
                });
            }
            for vector in &doc.vectors {
                match expected {
                    None => expected = Some(vector.len()),
                    Some(d) if d != vector.len() => {
                        return Err(Error::DimensionMismatch {
                            expected: d,
                            actual: vector.len(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(expected)
    }

    /// Add a batch of documents as one commit.
    ///
    /// Every stored document sharing an id with the batch is replaced. The
    /// whole batch is validated first; if anything fails, nothing is
    /// written.
    pub fn add(&self, documents: &[Document]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let dimension = self.validate(documents)?;

        let mut writer: IndexWriter = self.index.writer(WRITER_MEMORY_BUDGET)?;
        let f = self.fields;

        let mut seen = HashSet::new();
        for doc in documents {
            if seen.insert(doc.id.as_str()) {
                writer.delete_term(Term::from_field_text(f.id, &doc.id));
            }
        }

        for doc in documents {
            let chunks = doc.chunks.join(&CHUNK_SEPARATOR.to_string());
            let added = writer.add_document(doc!(
                f.id => doc.id.as_str(),
                f.content => doc.content.as_str(),
                f.chunks => chunks,
                f.vectors => encode_vectors(&doc.vectors),
            ));
            if let Err(e) = added {
                writer.rollback()?;
                return Err(e.into());
            }
        }

        if let Err(e) = writer.commit() {
            writer.rollback()?;
            return Err(e.into());
        }

        if let Some(d) = dimension
            && self.meta.dimension()?.is_none()
        {
            self.meta.set_dimension(d)?;
        }

        self.reader.reload()?;
        tracing::debug!(count = documents.len(), "committed documents");
        Ok(())
    }

    fn parse_query(
        &self,
        query: &str,
        field_names: Option<&[String]>,
    ) -> Result<Box<dyn Query>> {
        check_balanced(query)?;

        let search_fields = match field_names {
            None => vec![self.fields.content, self.fields.chunks],
            Some(names) => names
                .iter()
                .map(|name| match name.as_str() {
                    fields::CONTENT => Ok(self.fields.content),
                    fields::CHUNKS => Ok(self.fields.chunks),
                    other => Err(Error::NotFound {
                        kind: "field",
                        name: other.to_string(),
                    }),
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let parser = QueryParser::for_index(&self.index, search_fields);
        parser
            .parse_query(query)
            .map_err(|e| Error::QuerySyntax(e.to_string()))
    }

    /// BM25 search over `content` and `chunks` (or the named `fields`),
    /// returning up to `limit` whole documents.
    pub fn search_documents(
        &self,
        query: &str,
        fields: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<DocumentMatch>> {
        let parsed = self.parse_query(query, fields)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.run_query(&*parsed, limit)
    }

    fn run_query(&self, query: &dyn Query, limit: usize) -> Result<Vec<DocumentMatch>> {
        self.reader.reload()?;
        let searcher = self.reader.searcher();
        let top_docs = searcher.search(query, &TopDocs::with_limit(limit))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            results.push(DocumentMatch {
                score,
                document: self.extract_document(&doc)?,
            });
        }
        Ok(results)
    }

    /// Like [`search_documents`](Self::search_documents), flattened to one
    /// hit per chunk in document rank order.
    pub fn search(
        &self,
        query: &str,
        fields: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let parsed = self.parse_query(query, fields)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let matches = self.run_query(&*parsed, limit)?;
        let terms = self.query_terms(&*parsed);
        let mut analyzer = self.analyzer.text_analyzer();

        let mut hits = Vec::new();
        for DocumentMatch { score, document } in matches {
            for (position, (chunk, vector)) in document
                .chunks
                .into_iter()
                .zip(document.vectors)
                .enumerate()
            {
                let lexical_score =
                    contains_any(&mut analyzer, &chunk, &terms).then_some(score);
                hits.push(SearchHit {
                    doc_id: document.id.clone(),
                    chunk,
                    vector,
                    position,
                    lexical_score,
                });
            }
        }
        Ok(hits)
    }

    /// Analyzed terms of `query` targeting the text fields.
    fn query_terms(&self, query: &dyn Query) -> HashSet<String> {
        let mut terms = HashSet::new();
        let text_fields = [self.fields.content, self.fields.chunks];
        query.query_terms(&mut |term, _| {
            if text_fields.contains(&term.field())
                && let Some(text) = term.value().as_str()
            {
                terms.insert(text.to_string());
            }
        });
        terms
    }

    /// The first stored document with `id`.
    pub fn document(&self, id: &str) -> Result<Option<Document>> {
        let query = tantivy::query::TermQuery::new(
            Term::from_field_text(self.fields.id, id),
            IndexRecordOption::Basic,
        );
        Ok(self
            .run_query(&query, 1)?
            .into_iter()
            .next()
            .map(|m| m.document))
    }

    fn extract_document(&self, doc: &TantivyDocument) -> Result<Document> {
        let f = self.fields;
        let id = extract_text(doc, f.id);
        let chunks_blob = extract_text(doc, f.chunks);
        let chunks: Vec<String> = if chunks_blob.is_empty() {
            Vec::new()
        } else {
            chunks_blob
                .split(CHUNK_SEPARATOR)
                .map(str::to_string)
                .collect()
        };

        let vectors = doc
            .get_first(f.vectors)
            .and_then(|v| v.as_bytes())
            .and_then(decode_vectors)
            .ok_or_else(|| Error::InvalidDocument {
                id: id.clone(),
                reason: "stored vectors are corrupt".into(),
            })?;
        if vectors.len() != chunks.len() {
            return Err(Error::InvalidDocument {
                id,
                reason: "stored chunks and vectors are misaligned".into(),
            });
        }

        Ok(Document {
            content: extract_text(doc, f.content),
            id,
            chunks,
            vectors,
        })
    }
}

impl std::fmt::Debug for LexicalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LexicalIndex")
            .field("dir", &self.dir)
            .field("analyzer", &self.analyzer)
            .finish_non_exhaustive()
    }
}

fn contains_any(
    analyzer: &mut TextAnalyzer,
    chunk: &str,
    terms: &HashSet<String>,
) -> bool {
    if terms.is_empty() {
        return false;
    }
    let mut stream = analyzer.token_stream(chunk);
    while stream.advance() {
        if terms.contains(&stream.token().text) {
            return true;
        }
    }
    false
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, chunks: &[&str], vectors: &[&[f32]]) -> Document {
        Document {
            id: id.to_string(),
            content: chunks.join(" "),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            vectors: vectors.iter().map(|v| v.to_vec()).collect(),
        }
    }

    fn new_index(analyzer: Analyzer) -> (tempfile::TempDir, LexicalIndex) {
        let tmp = tempfile::tempdir().unwrap();
        let schema = IndexSchema {
            analyzer,
            dimension: None,
        };
        let index = LexicalIndex::create(tmp.path(), schema, false).unwrap();
        (tmp, index)
    }

    fn paris_berlin() -> Vec<Document> {
        vec![
            doc(
                "paris",
                &["Paris is the capital of France.", "It has the Eiffel tower."],
                &[&[1.0, 0.0], &[0.0, 1.0]],
            ),
            doc(
                "berlin",
                &["Berlin is the capital of Germany."],
                &[&[0.5, 0.5]],
            ),
        ]
    }

    #[test]
    fn add_and_search_documents() {
        let (_tmp, index) = new_index(Analyzer::Standard);
        index.add(&paris_berlin()).unwrap();
        assert_eq!(index.num_docs().unwrap(), 2);

        let results = index.search_documents("France", None, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document.id, "paris");
        assert!(results[0].score > 0.0);
    }

    #[test]
    fn chunks_and_vectors_roundtrip() {
        let (_tmp, index) = new_index(Analyzer::Standard);
        let docs = paris_berlin();
        index.add(&docs).unwrap();

        let stored = index.document("paris").unwrap().unwrap();
        assert_eq!(stored, docs[0]);
        assert!(index.document("rome").unwrap().is_none());
    }

    #[test]
    fn flattened_hits_mark_matching_chunks() {
        let (_tmp, index) = new_index(Analyzer::Standard);
        index.add(&paris_berlin()).unwrap();

        let hits = index.search("France", None, 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk, "Paris is the capital of France.");
        assert_eq!(hits[0].position, 0);
        assert_eq!(hits[0].vector, vec![1.0, 0.0]);
        assert!(hits[0].lexical_score.is_some());
        assert_eq!(hits[1].position, 1);
        assert!(hits[1].lexical_score.is_none());
    }

    #[test]
    fn zero_limit_is_empty() {
        let (_tmp, index) = new_index(Analyzer::Standard);
        index.add(&paris_berlin()).unwrap();
        assert!(index.search("capital", None, 0).unwrap().is_empty());
        assert!(index.search_documents("capital", None, 0).unwrap().is_empty());
    }

    #[test]
    fn field_selection() {
        let (_tmp, index) = new_index(Analyzer::Standard);
        index.add(&paris_berlin()).unwrap();

        let fields = vec![fields::CHUNKS.to_string()];
        let results = index.search_documents("Germany", Some(&fields), 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document.id, "berlin");

        let unknown = vec!["title".to_string()];
        let err = index.search_documents("Germany", Some(&unknown), 10).unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "field", .. }));
    }

    #[test]
    fn malformed_queries_are_rejected() {
        let (_tmp, index) = new_index(Analyzer::Standard);
        index.add(&paris_berlin()).unwrap();

        for query in ["\"capital of", "(capital", "capital)"] {
            let err = index.search(query, None, 10).unwrap_err();
            assert!(matches!(err, Error::QuerySyntax(_)), "{query}: {err}");
        }
    }

    #[test]
    fn phrase_queries_are_accepted() {
        let (_tmp, index) = new_index(Analyzer::Standard);
        index.add(&paris_berlin()).unwrap();
        let results = index.search_documents("\"Eiffel tower\"", None, 10).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn adding_same_id_replaces() {
        let (_tmp, index) = new_index(Analyzer::Standard);
        index.add(&paris_berlin()).unwrap();
        index.add(&paris_berlin()).unwrap();
        assert_eq!(index.num_docs().unwrap(), 2);

        index
            .add(&[doc("paris", &["Paris hosts the Louvre museum."], &[&[0.0, 1.0]])])
            .unwrap();
        assert_eq!(index.num_docs().unwrap(), 2);
        assert!(index.search_documents("Eiffel", None, 10).unwrap().is_empty());
    }

    #[test]
    fn shared_id_batch_is_kept_whole() {
        let (_tmp, index) = new_index(Analyzer::Standard);
        let batch = vec![
            doc("group", &["First member of the group."], &[&[1.0, 0.0]]),
            doc("group", &["Second member of the group."], &[&[0.0, 1.0]]),
        ];
        index.add(&batch).unwrap();
        assert_eq!(index.num_docs().unwrap(), 2);
        index.add(&batch).unwrap();
        assert_eq!(index.num_docs().unwrap(), 2);
    }

    #[test]
    fn dimension_is_established_and_enforced() {
        let (_tmp, index) = new_index(Analyzer::Standard);
        assert_eq!(index.dimension().unwrap(), None);
        index.add(&paris_berlin()).unwrap();
        assert_eq!(index.dimension().unwrap(), Some(2));

        let err = index
            .add(&[doc("rome", &["Rome is the capital of Italy."], &[&[1.0, 0.0, 0.0]])])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert_eq!(index.num_docs().unwrap(), 2);
    }

    #[test]
    fn invalid_batch_writes_nothing() {
        let (_tmp, index) = new_index(Analyzer::Standard);
        let mut batch = paris_berlin();
        batch.push(doc("broken", &["one chunk", "two chunks"], &[&[1.0, 0.0]]));
        let err = index.add(&batch).unwrap_err();
        assert!(matches!(err, Error::InvalidDocument { .. }));
        assert_eq!(index.num_docs().unwrap(), 0);

        let newline = doc("nl", &["line one\nline two"], &[&[1.0, 0.0]]);
        assert!(matches!(
            index.add(&[newline]),
            Err(Error::InvalidDocument { .. })
        ));

        let blank = doc("blank", &[""], &[&[1.0, 0.0]]);
        assert!(matches!(
            index.add(&[blank]),
            Err(Error::InvalidDocument { .. })
        ));
        assert_eq!(index.num_docs().unwrap(), 0);

        index.add(&paris_berlin()).unwrap();
        assert_eq!(index.search("Paris", None, 10).unwrap().len(), 2);
    }

    #[test]
    fn configured_dimension_rejects_first_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let schema = IndexSchema {
            analyzer: Analyzer::Standard,
            dimension: Some(3),
        };
        let index = LexicalIndex::create(tmp.path(), schema, false).unwrap();
        assert!(matches!(
            index.add(&paris_berlin()),
            Err(Error::DimensionMismatch { expected: 3, .. })
        ));
    }

    #[test]
    fn create_and_load_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("index");

        let err = LexicalIndex::load(&dir).unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "index", .. }));

        {
            let index = LexicalIndex::create(&dir, IndexSchema::default(), false).unwrap();
            index.add(&paris_berlin()).unwrap();
        }

        let err = LexicalIndex::create(&dir, IndexSchema::default(), false).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));

        let loaded = LexicalIndex::load(&dir).unwrap();
        assert_eq!(loaded.num_docs().unwrap(), 2);
        assert_eq!(loaded.dimension().unwrap(), Some(2));
        drop(loaded);

        let fresh = LexicalIndex::create(&dir, IndexSchema::default(), true).unwrap();
        assert_eq!(fresh.num_docs().unwrap(), 0);
        assert_eq!(fresh.dimension().unwrap(), None);
    }

    #[test]
    fn index_can_be_loaded_twice() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let index = LexicalIndex::create(tmp.path(), IndexSchema::default(), false).unwrap();
            index.add(&paris_berlin()).unwrap();
        }

        let first = LexicalIndex::load(tmp.path()).unwrap();
        let second = LexicalIndex::load(tmp.path()).unwrap();
        for index in [&first, &second] {
            let hits = index.search("Germany", None, 10).unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].doc_id, "berlin");
            assert_eq!(index.dimension().unwrap(), Some(2));
        }

        first.add(&[doc("rome", &["Rome is the capital of Italy."], &[&[0.0, 1.0]])]).unwrap();
        assert_eq!(second.num_docs().unwrap(), 3);
    }

    #[test]
    fn analyzer_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let schema = IndexSchema {
                analyzer: Analyzer::Language,
                dimension: None,
            };
            let index = LexicalIndex::create(tmp.path(), schema, false).unwrap();
            index
                .add(&[doc("run", &["The runners were running quickly."], &[&[1.0]])])
                .unwrap();
        }

        let index = LexicalIndex::load(tmp.path()).unwrap();
        assert_eq!(index.analyzer(), Analyzer::Language);
        assert_eq!(index.search_documents("run", None, 10).unwrap().len(), 1);
    }

    #[test]
    fn fancy_analyzer_folds_accents() {
        let (_tmp, index) = new_index(Analyzer::Fancy);
        index
            .add(&[doc("cafe", &["A café in the old town."], &[&[1.0]])])
            .unwrap();
        assert_eq!(index.search_documents("cafe", None, 10).unwrap().len(), 1);
    }

    #[test]
    fn keyword_analyzer_is_case_sensitive() {
        let (_tmp, index) = new_index(Analyzer::Keyword);
        index
            .add(&[doc("k", &["Rust Programming Language"], &[&[1.0]])])
            .unwrap();
        assert_eq!(index.search_documents("Rust", None, 10).unwrap().len(), 1);
        assert!(index.search_documents("rust", None, 10).unwrap().is_empty());
    }

    #[test]
    fn parse_analyzer_names() {
        assert_eq!("Fancy".parse::<Analyzer>().unwrap(), Analyzer::Fancy);
        assert!("snowball".parse::<Analyzer>().is_err());
        for analyzer in Analyzer::ALL {
            assert_eq!(
                Analyzer::from_tokenizer_name(analyzer.tokenizer_name()),
                Some(analyzer)
            );
        }
    }

    #[test]
    fn vector_blob_layout() {
        let blob = encode_vectors(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(&blob[0..4], &2u32.to_le_bytes());
        assert_eq!(&blob[4..8], &2u32.to_le_bytes());
        assert_eq!(&blob[8..12], &1.0f32.to_le_bytes());
        assert_eq!(blob.len(), 8 + 16);

        assert!(decode_vectors(&blob[..10]).is_none());
        assert_eq!(decode_vectors(&encode_vectors(&[])).unwrap().len(), 0);
    }
}
