use std::collections::HashSet;

use candle_core::Device;
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::BertModel;
use rayon::prelude::*;
use tokenizers::Tokenizer;

use crate::{
    embedding::{
        batch_tensors,
        load_batch_tokenizer,
        load_bert_config,
        load_var_builder,
        words,
    },
    error::{Error, Result},
};

/// Candidate pairs scored per forward pass.
const SCORE_BATCH_SIZE: usize = 16;

/// A candidate with its fusion score.
///
/// `index` is the candidate's position in the slice passed to
/// [`CrossEncoder::rank`].
#[derive(Debug, Clone, PartialEq)]
pub struct Ranked {
    pub index: usize,
    pub text: String,
    pub score: f32,
}

/// Scores (query, candidate) pairs jointly.
pub trait CrossEncoder: Send + Sync {
    /// One relevance score per candidate, in input order. Higher is better.
    fn score(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>>;

    /// Candidates sorted by descending score.
    ///
    /// Ties keep their input order. An empty candidate list yields an empty
    /// result.
    fn rank(&self, query: &str, candidates: &[&str]) -> Result<Vec<Ranked>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let scores = self.score(query, candidates)?;
        if scores.len() != candidates.len() {
            return Err(Error::Model(format!(
                "cross-encoder returned {} scores for {} candidates",
                scores.len(),
                candidates.len()
            )));
        }

        let mut ranked: Vec<Ranked> = candidates
            .iter()
            .zip(scores)
            .enumerate()
            .map(|(index, (text, score))| Ranked {
                index,
                text: text.to_string(),
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
}

/// BERT sequence classifier scoring query/passage pairs, as trained for
/// MS MARCO passage ranking.
pub struct BertCrossEncoder {
    bert: BertModel,
    pooler: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
}

impl BertCrossEncoder {
    pub fn load(model_id: &str, device: Device) -> Result<Self> {
        let config = load_bert_config(model_id)?;
        let tokenizer = load_batch_tokenizer(model_id)?;
        let vb = load_var_builder(model_id, &device)?;

        let unavailable = |e: candle_core::Error| Error::ModelUnavailable {
            model: model_id.to_string(),
            hint: format!("weights do not match a BERT cross-encoder: {e}"),
        };
        let bert = BertModel::load(vb.pp("bert"), &config).map_err(unavailable)?;
        let pooler = linear(&vb, "bert.pooler.dense", config.hidden_size, config.hidden_size)
            .map_err(unavailable)?;
        let classifier =
            linear(&vb, "classifier", config.hidden_size, 1).map_err(unavailable)?;

        Ok(Self {
            bert,
            pooler,
            classifier,
            tokenizer,
            device,
        })
    }

    fn score_batch(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>> {
        let pairs: Vec<(&str, &str)> =
            candidates.iter().map(|c| (query, *c)).collect();
        let encodings = self
            .tokenizer
            .encode_batch(pairs, true)
            .map_err(|e| Error::Model(format!("tokenization failed: {e}")))?;
        let (ids, type_ids, mask) = batch_tensors(&encodings, &self.device)?;

        let hidden = self.bert.forward(&ids, &type_ids, Some(&mask))?;
        let cls = hidden.narrow(1, 0, 1)?.squeeze(1)?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        let logits = self.classifier.forward(&pooled)?.squeeze(1)?;
        let scores = candle_nn::ops::sigmoid(&logits)?;

        Ok(scores.to_device(&Device::Cpu)?.to_vec1::<f32>()?)
    }
}

fn linear(
    vb: &VarBuilder,
    prefix: &str,
    in_dim: usize,
    out_dim: usize,
) -> candle_core::Result<Linear> {
    candle_nn::linear(in_dim, out_dim, vb.pp(prefix))
}

impl CrossEncoder for BertCrossEncoder {
    fn score(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>> {
        // Batches are independent forward passes; run them in parallel and
        // keep input order when flattening.
        let batches: Vec<Vec<f32>> = candidates
            .par_chunks(SCORE_BATCH_SIZE)
            .map(|batch| self.score_batch(query, batch))
            .collect::<Result<_>>()?;
        Ok(batches.into_iter().flatten().collect())
    }
}

/// Scores a candidate by the share of query terms it contains.
///
/// Longer candidates pay a small penalty so that, at equal coverage, the
/// tighter passage wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermOverlapRanker;

const LENGTH_PENALTY: f32 = 0.01;

impl TermOverlapRanker {
    fn score_one(query_terms: &HashSet<String>, candidate: &str) -> f32 {
        let terms: Vec<String> = words(candidate).collect();
        if query_terms.is_empty() || terms.is_empty() {
            return 0.0;
        }
        let present: HashSet<&str> = terms.iter().map(String::as_str).collect();
        let matched = query_terms
            .iter()
            .filter(|t| present.contains(t.as_str()))
            .count();
        let coverage = matched as f32 / query_terms.len() as f32;
        coverage - LENGTH_PENALTY * (terms.len() as f32).ln_1p() / 10.0
    }
}

impl CrossEncoder for TermOverlapRanker {
    fn score(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>> {
        let query_terms: HashSet<String> = words(query).collect();
        Ok(candidates
            .iter()
            .map(|c| Self::score_one(&query_terms, c))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<f32>);

    impl CrossEncoder for Fixed {
        fn score(&self, _query: &str, _candidates: &[&str]) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn rank_empty_candidates() {
        let ranked = TermOverlapRanker.rank("anything", &[]).unwrap();
        assert!(ranked.is_empty());
    }

    #[test]
    fn rank_sorts_descending_and_keeps_index() {
        let ranker = Fixed(vec![0.1, 0.9, 0.5]);
        let ranked = ranker.rank("q", &["a", "b", "c"]).unwrap();
        let order: Vec<usize> = ranked.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert_eq!(ranked[0].text, "b");
    }

    #[test]
    fn ties_keep_input_order() {
        let ranker = Fixed(vec![0.5, 0.7, 0.5, 0.5]);
        let ranked = ranker.rank("q", &["a", "b", "c", "d"]).unwrap();
        let order: Vec<usize> = ranked.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![1, 0, 2, 3]);
    }

    #[test]
    fn score_count_mismatch_is_error() {
        let ranker = Fixed(vec![0.5]);
        assert!(ranker.rank("q", &["a", "b"]).is_err());
    }

    #[test]
    fn overlap_prefers_full_coverage() {
        let ranked = TermOverlapRanker
            .rank(
                "capital of France",
                &[
                    "Berlin is the capital of Germany.",
                    "Paris is the capital of France.",
                ],
            )
            .unwrap();
        assert_eq!(ranked[0].index, 1);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn overlap_penalises_length_at_equal_coverage() {
        let scores = TermOverlapRanker
            .score(
                "france",
                &[
                    "France.",
                    "France has many regions and a long and complicated history.",
                ],
            )
            .unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn overlap_no_terms_scores_zero() {
        let scores = TermOverlapRanker.score("", &["text"]).unwrap();
        assert_eq!(scores, vec![0.0]);
    }
}
