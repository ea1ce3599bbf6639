use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use candle_core::Device;

use crate::{
    embedding::{Embedder, HashingEmbedder, SentenceEmbedder},
    error::{Error, Result},
    reranker::{BertCrossEncoder, CrossEncoder, TermOverlapRanker},
};

pub const DEFAULT_EMBED_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_RERANK_MODEL: &str = "cross-encoder/ms-marco-MiniLM-L6-v2";
pub const EMBED_MODEL_ENV_VAR: &str = "DOCFUSE_EMBED_MODEL";
pub const RERANK_MODEL_ENV_VAR: &str = "DOCFUSE_RERANK_MODEL";

/// Dimension used by `hash` when no explicit size is given.
pub const DEFAULT_HASH_DIMENSION: usize = 384;

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
pub(crate) fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Resolve `file` for a model that is either a local directory or a
/// Hugging Face Hub id, downloading into the hub cache when needed.
pub(crate) fn fetch_model_file(model_id: &str, file: &str) -> Result<PathBuf> {
    let local = Path::new(model_id);
    if local.is_dir() {
        let path = local.join(file);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(Error::ModelUnavailable {
                model: model_id.to_string(),
                hint: format!("{} is missing from the model directory", file),
            })
        };
    }

    let api = hf_hub::api::sync::Api::new().map_err(|e| {
        Error::ModelUnavailable {
            model: model_id.to_string(),
            hint: format!("could not initialise the Hugging Face client: {e}"),
        }
    })?;
    api.model(model_id.to_string()).get(file).map_err(|e| {
        Error::ModelUnavailable {
            model: model_id.to_string(),
            hint: format!(
                "could not fetch {file} ({e}); check network access or point \
                 {EMBED_MODEL_ENV_VAR}/{RERANK_MODEL_ENV_VAR} at a local model \
                 directory"
            ),
        }
    })
}

/// Which embedder backs an index.
///
/// Parsed from strings: `hash` or `hash:<dim>` selects the offline
/// [`HashingEmbedder`]; anything else is a sentence-transformer model id or
/// local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedderSpec {
    Hashing { dimension: usize },
    Sentence { model_id: String },
}

impl EmbedderSpec {
    /// Resolve from `DOCFUSE_EMBED_MODEL`, falling back to the default model.
    pub fn from_env() -> Self {
        std::env::var(EMBED_MODEL_ENV_VAR)
            .ok()
            .and_then(|v| parse_env_spec(EMBED_MODEL_ENV_VAR, &v))
            .unwrap_or_else(|| EmbedderSpec::Sentence {
                model_id: DEFAULT_EMBED_MODEL.to_string(),
            })
    }
}

/// Parse a model name taken from the environment, logging values that do
/// not parse instead of failing.
fn parse_env_spec<T: std::str::FromStr<Err = Error>>(var: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(spec) => Some(spec),
        Err(e) => {
            tracing::warn!(var, value, error = %e, "ignoring invalid model setting");
            None
        }
    }
}

impl std::str::FromStr for EmbedderSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty embedder name".into()));
        }
        if s == "hash" {
            return Ok(EmbedderSpec::Hashing {
                dimension: DEFAULT_HASH_DIMENSION,
            });
        }
        if let Some(dim) = s.strip_prefix("hash:") {
            let dimension = dim.parse::<usize>().map_err(|_| {
                Error::Config(format!("invalid hash embedder dimension: {dim}"))
            })?;
            if dimension == 0 {
                return Err(Error::Config(
                    "hash embedder dimension must be positive".into(),
                ));
            }
            return Ok(EmbedderSpec::Hashing { dimension });
        }
        Ok(EmbedderSpec::Sentence {
            model_id: s.to_string(),
        })
    }
}

impl std::fmt::Display for EmbedderSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbedderSpec::Hashing { dimension } => write!(f, "hash:{dimension}"),
            EmbedderSpec::Sentence { model_id } => f.write_str(model_id),
        }
    }
}

/// Which cross-encoder performs fusion ranking.
///
/// `overlap` selects the offline [`TermOverlapRanker`]; anything else is a
/// cross-encoder model id or local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrossEncoderSpec {
    TermOverlap,
    Bert { model_id: String },
}

impl CrossEncoderSpec {
    /// Resolve from `DOCFUSE_RERANK_MODEL`, falling back to the default model.
    pub fn from_env() -> Self {
        std::env::var(RERANK_MODEL_ENV_VAR)
            .ok()
            .and_then(|v| parse_env_spec(RERANK_MODEL_ENV_VAR, &v))
            .unwrap_or_else(|| CrossEncoderSpec::Bert {
                model_id: DEFAULT_RERANK_MODEL.to_string(),
            })
    }
}

impl std::str::FromStr for CrossEncoderSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(Error::Config("empty cross-encoder name".into())),
            "overlap" => Ok(CrossEncoderSpec::TermOverlap),
            other => Ok(CrossEncoderSpec::Bert {
                model_id: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for CrossEncoderSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrossEncoderSpec::TermOverlap => f.write_str("overlap"),
            CrossEncoderSpec::Bert { model_id } => f.write_str(model_id),
        }
    }
}

/// Owns the embedding and fusion models, loading each on first use.
///
/// Loaded models are shared read-only through [`Arc`]; a `ModelManager` is
/// typically wrapped in an `Arc` itself and handed to every engine and
/// session in the process.
pub struct ModelManager {
    embedder_spec: EmbedderSpec,
    cross_encoder_spec: CrossEncoderSpec,
    embedder: Mutex<Option<Arc<dyn Embedder>>>,
    cross_encoder: Mutex<Option<Arc<dyn CrossEncoder>>>,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelManager {
    /// Creates a `ModelManager` from the `DOCFUSE_EMBED_MODEL` and
    /// `DOCFUSE_RERANK_MODEL` environment variables, or the default models.
    ///
    /// Nothing is loaded until [`embedder`](Self::embedder) or
    /// [`cross_encoder`](Self::cross_encoder) is first called.
    pub fn new() -> Self {
        Self::with_specs(EmbedderSpec::from_env(), CrossEncoderSpec::from_env())
    }

    pub fn with_specs(
        embedder_spec: EmbedderSpec,
        cross_encoder_spec: CrossEncoderSpec,
    ) -> Self {
        Self {
            embedder_spec,
            cross_encoder_spec,
            embedder: Mutex::new(None),
            cross_encoder: Mutex::new(None),
        }
    }

    /// Offline models: hashing embedder and term-overlap fusion ranker.
    pub fn offline(dimension: usize) -> Self {
        Self::with_specs(
            EmbedderSpec::Hashing { dimension },
            CrossEncoderSpec::TermOverlap,
        )
    }

    pub fn embedder_spec(&self) -> &EmbedderSpec {
        &self.embedder_spec
    }

    pub fn cross_encoder_spec(&self) -> &CrossEncoderSpec {
        &self.cross_encoder_spec
    }

    /// Returns `true` if the embedder has already been loaded.
    pub fn is_embedder_loaded(&self) -> bool {
        self.embedder.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Returns `true` if the cross-encoder has already been loaded.
    pub fn is_cross_encoder_loaded(&self) -> bool {
        self.cross_encoder
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }

    /// The shared embedder, loading it on first call.
    pub fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        let mut slot = self
            .embedder
            .lock()
            .map_err(|_| Error::Model("embedder lock poisoned".into()))?;
        if let Some(model) = slot.as_ref() {
            return Ok(Arc::clone(model));
        }

        let model: Arc<dyn Embedder> = match &self.embedder_spec {
            EmbedderSpec::Hashing { dimension } => {
                Arc::new(HashingEmbedder::new(*dimension))
            }
            EmbedderSpec::Sentence { model_id } => {
                tracing::info!(model = %model_id, "loading embedding model");
                Arc::new(SentenceEmbedder::load(model_id, default_device())?)
            }
        };
        *slot = Some(Arc::clone(&model));
        Ok(model)
    }

    /// The shared cross-encoder, loading it on first call.
    pub fn cross_encoder(&self) -> Result<Arc<dyn CrossEncoder>> {
        let mut slot = self
            .cross_encoder
            .lock()
            .map_err(|_| Error::Model("cross-encoder lock poisoned".into()))?;
        if let Some(model) = slot.as_ref() {
            return Ok(Arc::clone(model));
        }

        let model: Arc<dyn CrossEncoder> = match &self.cross_encoder_spec {
            CrossEncoderSpec::TermOverlap => Arc::new(TermOverlapRanker),
            CrossEncoderSpec::Bert { model_id } => {
                tracing::info!(model = %model_id, "loading cross-encoder model");
                Arc::new(BertCrossEncoder::load(model_id, default_device())?)
            }
        };
        *slot = Some(Arc::clone(&model));
        Ok(model)
    }
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("embedder", &self.embedder_spec)
            .field("cross_encoder", &self.cross_encoder_spec)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_env_values_are_skipped() {
        assert_eq!(
            parse_env_spec::<EmbedderSpec>(EMBED_MODEL_ENV_VAR, "hash:abc"),
            None
        );
        assert_eq!(
            parse_env_spec::<EmbedderSpec>(EMBED_MODEL_ENV_VAR, "hash:8"),
            Some(EmbedderSpec::Hashing { dimension: 8 })
        );
        assert_eq!(
            parse_env_spec::<CrossEncoderSpec>(RERANK_MODEL_ENV_VAR, "  "),
            None
        );
        assert_eq!(
            parse_env_spec::<CrossEncoderSpec>(RERANK_MODEL_ENV_VAR, "overlap"),
            Some(CrossEncoderSpec::TermOverlap)
        );
    }

    #[test]
    fn parse_embedder_specs() {
        assert_eq!(
            "hash".parse::<EmbedderSpec>().unwrap(),
            EmbedderSpec::Hashing {
                dimension: DEFAULT_HASH_DIMENSION
            }
        );
        assert_eq!(
            "hash:16".parse::<EmbedderSpec>().unwrap(),
            EmbedderSpec::Hashing { dimension: 16 }
        );
        assert_eq!(
            "custom/model".parse::<EmbedderSpec>().unwrap(),
            EmbedderSpec::Sentence {
                model_id: "custom/model".into()
            }
        );
        assert!("hash:0".parse::<EmbedderSpec>().is_err());
        assert!("hash:abc".parse::<EmbedderSpec>().is_err());
    }

    #[test]
    fn specs_display_round_trip() {
        for s in ["hash:32", "custom/model"] {
            assert_eq!(s.parse::<EmbedderSpec>().unwrap().to_string(), s);
        }
        for s in ["overlap", "cross/model"] {
            assert_eq!(s.parse::<CrossEncoderSpec>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn models_not_loaded_by_default() {
        let manager = ModelManager::offline(8);
        assert!(!manager.is_embedder_loaded());
        assert!(!manager.is_cross_encoder_loaded());
    }

    #[test]
    fn loaded_models_are_shared() {
        let manager = ModelManager::offline(8);
        let a = manager.embedder().unwrap();
        let b = manager.embedder().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(manager.is_embedder_loaded());

        let c = manager.cross_encoder().unwrap();
        let d = manager.cross_encoder().unwrap();
        assert!(Arc::ptr_eq(&c, &d));
    }

    #[test]
    fn local_model_dir_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = fetch_model_file(&dir.path().to_string_lossy(), "config.json")
            .unwrap_err();
        assert!(matches!(err, Error::ModelUnavailable { .. }));
    }

    #[test]
    fn local_model_dir_resolves_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let path =
            fetch_model_file(&dir.path().to_string_lossy(), "config.json")
                .unwrap();
        assert_eq!(path, dir.path().join("config.json"));
    }
}
