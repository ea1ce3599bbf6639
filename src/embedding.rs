use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    error::{Error, Result},
    model_manager::fetch_model_file,
};

/// Longest input, in model tokens, fed to a transformer.
pub(crate) const MAX_SEQUENCE_LENGTH: usize = 256;

/// Turns text into dense vectors of a fixed dimension.
///
/// Implementations must be deterministic: the same input always produces
/// the same vector.
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Embed each text, returning one vector per input in input order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed `chunks`, pairing each chunk with its vector.
    fn embed(&self, chunks: &[String]) -> Result<Vec<(String, Vec<f32>)>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let vectors = self.embed_batch(&texts)?;
        Ok(chunks.iter().cloned().zip(vectors).collect())
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .pop()
            .ok_or_else(|| Error::Model("embedder returned no vector".into()))
    }
}

/// Load a tokenizer that pads each batch to its longest member and
/// truncates to [`MAX_SEQUENCE_LENGTH`].
pub(crate) fn load_batch_tokenizer(model_id: &str) -> Result<Tokenizer> {
    let path = fetch_model_file(model_id, "tokenizer.json")?;
    let mut tokenizer = Tokenizer::from_file(&path).map_err(|e| {
        Error::ModelUnavailable {
            model: model_id.to_string(),
            hint: format!("failed to read {}: {e}", path.display()),
        }
    })?;
    tokenizer.with_padding(Some(PaddingParams::default()));
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: MAX_SEQUENCE_LENGTH,
            ..Default::default()
        }))
        .map_err(|e| Error::Model(format!("invalid truncation settings: {e}")))?;
    Ok(tokenizer)
}

/// Load BERT weights, preferring safetensors over a PyTorch checkpoint.
pub(crate) fn load_var_builder(
    model_id: &str,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    match fetch_model_file(model_id, "model.safetensors") {
        Ok(path) => {
            // SAFETY: the weights file is not modified while mapped.
            let vb = unsafe {
                VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)?
            };
            Ok(vb)
        }
        Err(_) => {
            let path = fetch_model_file(model_id, "pytorch_model.bin")?;
            Ok(VarBuilder::from_pth(&path, DType::F32, device)?)
        }
    }
}

pub(crate) fn load_bert_config(model_id: &str) -> Result<BertConfig> {
    let path = fetch_model_file(model_id, "config.json")?;
    read_config(model_id, &path)
}

fn read_config(model_id: &str, path: &Path) -> Result<BertConfig> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| Error::ModelUnavailable {
        model: model_id.to_string(),
        hint: format!("config.json is not a BERT config: {e}"),
    })
}

/// Stack the encodings of a padded batch into `[batch, seq]` id and mask
/// tensors.
pub(crate) fn batch_tensors(
    encodings: &[tokenizers::Encoding],
    device: &Device,
) -> Result<(Tensor, Tensor, Tensor)> {
    let mut ids = Vec::with_capacity(encodings.len());
    let mut type_ids = Vec::with_capacity(encodings.len());
    let mut masks = Vec::with_capacity(encodings.len());
    for enc in encodings {
        ids.push(Tensor::new(enc.get_ids(), device)?);
        type_ids.push(Tensor::new(enc.get_type_ids(), device)?);
        masks.push(Tensor::new(enc.get_attention_mask(), device)?);
    }
    Ok((
        Tensor::stack(&ids, 0)?,
        Tensor::stack(&type_ids, 0)?,
        Tensor::stack(&masks, 0)?,
    ))
}

/// Mean of the token states where `mask` is set, scaled to unit length.
///
/// `hidden` is `[batch, seq, hidden]`, `mask` is `[batch, seq]`.
fn masked_mean_l2(hidden: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let lengths = mask.sum(1)?;
    let mean = summed.broadcast_div(&lengths)?;
    let norm = (mean.sqr()?.sum_keepdim(1)?.sqrt()? + 1e-12)?;
    Ok(mean.broadcast_div(&norm)?)
}

/// Sentence-transformer embedder backed by a BERT encoder.
pub struct SentenceEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

impl SentenceEmbedder {
    /// Load `model_id` (Hub id or local directory) onto `device`.
    pub fn load(model_id: &str, device: Device) -> Result<Self> {
        let config = load_bert_config(model_id)?;
        let tokenizer = load_batch_tokenizer(model_id)?;
        let vb = load_var_builder(model_id, &device)?;
        let model = BertModel::load(vb, &config).map_err(|e| {
            Error::ModelUnavailable {
                model: model_id.to_string(),
                hint: format!("weights do not match a BERT encoder: {e}"),
            }
        })?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dimension: config.hidden_size,
        })
    }
}

impl Embedder for SentenceEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| Error::Model(format!("tokenization failed: {e}")))?;
        let (ids, type_ids, mask) = batch_tensors(&encodings, &self.device)?;

        let hidden = self.model.forward(&ids, &type_ids, Some(&mask))?;
        let pooled = masked_mean_l2(&hidden, &mask)?;
        Ok(pooled.to_device(&Device::Cpu)?.to_vec2::<f32>()?)
    }
}

/// Feature-hashing bag-of-words embedder.
///
/// Each lowercased word is hashed into one of `dimension` buckets and the
/// counts are L2-normalised. Texts sharing words get close vectors, which
/// is enough for offline use and tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        for word in words(text) {
            let bucket = (xxh3_64(word.as_bytes()) % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Lowercased alphanumeric words of `text`.
pub(crate) fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn hashing_is_deterministic() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_one("Paris is the capital of France.").unwrap();
        let b = embedder.embed_one("Paris is the capital of France.").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn hashing_buckets_use_a_fixed_hash() {
        let embedder = HashingEmbedder::new(64);
        let v = embedder.embed_one("Paris").unwrap();
        let bucket = (xxh3_64(b"paris") % 64) as usize;
        assert_eq!(v[bucket], 1.0);
        assert_eq!(v.iter().filter(|x| **x != 0.0).count(), 1);
    }

    #[test]
    fn hashing_vectors_are_unit_length() {
        let embedder = HashingEmbedder::new(32);
        let v = embedder.embed_one("some words here").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_ignores_case_and_punctuation() {
        let embedder = HashingEmbedder::new(32);
        let a = embedder.embed_one("Capital, France!").unwrap();
        let b = embedder.embed_one("capital france").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn shared_words_are_closer() {
        let embedder = HashingEmbedder::new(256);
        let query = embedder.embed_one("capital of France").unwrap();
        let paris = embedder
            .embed_one("Paris is the capital of France.")
            .unwrap();
        let dogs = embedder.embed_one("Dogs bark loudly at night.").unwrap();
        assert!(cosine(&query, &paris) > cosine(&query, &dogs));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        let v = embedder.embed_one("").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn embed_pairs_chunks_with_vectors() {
        let embedder = HashingEmbedder::new(16);
        let chunks = vec!["first chunk".to_string(), "second chunk".to_string()];
        let out = embedder.embed(&chunks).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, "first chunk");
        assert_eq!(out[1].0, "second chunk");
        assert!(out.iter().all(|(_, v)| v.len() == 16));
        assert!(embedder.embed(&[]).unwrap().is_empty());
    }

    #[test]
    fn masked_mean_ignores_padding() {
        let hidden = Tensor::new(
            &[[[1f32, 0.0], [3.0, 0.0], [100.0, 100.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let mask = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu).unwrap();
        let pooled = masked_mean_l2(&hidden, &mask).unwrap();
        let v = pooled.to_vec2::<f32>().unwrap();
        assert!((v[0][0] - 1.0).abs() < 1e-5);
        assert!(v[0][1].abs() < 1e-5);
    }

    #[test]
    fn missing_model_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = SentenceEmbedder::load(&dir.path().to_string_lossy(), Device::Cpu)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ModelUnavailable { .. }));
    }
}
