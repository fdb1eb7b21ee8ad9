//! Topic coherence of a set of tokens
//!
//! Corpus coherence counts in how many evaluation sentences each topic token
//! (and each pair) occurs and averages pointwise mutual information over
//! token pairs. Embedding coherence compares the tokens' input embeddings.
//! The silhouette variant clusters the embeddings with k-means.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use crate::cluster::{kmeans_labels, silhouette_score};
use crate::evaluators::EvalContext;
use crate::extractors::to_array2;

/// Score of an empty topic
pub const EMPTY_TOPIC_SCORE: f64 = -20.0;
const EPSILON: f64 = 1e-10;

/// Which token pairs enter the average
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairMask {
    /// `i < j`
    Upper,
    /// `i != j`
    OffDiagonal,
}

/// PMI coherence of `topic` over `sentences` (both already lowercased).
///
/// `uci`: `log((P(i, j) + eps) / (P(i) P(j)))`;
/// `umass`: `log((P(i, j) + eps) / P(j))`. Zero marginal frequencies are
/// clamped to `eps`.
pub fn pmi_coherence(
    sentences: &[String],
    topic: &[String],
    pmi_type: &str,
    mask: PairMask,
) -> Result<f64> {
    anyhow::ensure!(
        matches!(pmi_type, "uci" | "umass"),
        "PMI type '{pmi_type}' not supported, choose from [\"uci\", \"umass\"]"
    );
    if topic.is_empty() {
        return Ok(EMPTY_TOPIC_SCORE);
    }
    anyhow::ensure!(!sentences.is_empty(), "No sentences to count tokens in");

    let corpus_len = sentences.len() as f64;
    let inclusion: Vec<Vec<bool>> = topic
        .iter()
        .map(|token| sentences.iter().map(|s| s.contains(token.as_str())).collect())
        .collect();
    let freq: Vec<f64> = inclusion
        .iter()
        .map(|row| row.iter().filter(|&&x| x).count() as f64 / corpus_len)
        .collect();

    let n = topic.len();
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..n {
        for j in 0..n {
            let included = match mask {
                PairMask::Upper => i < j,
                PairMask::OffDiagonal => i != j,
            };
            if !included {
                continue;
            }
            let joint = inclusion[i]
                .iter()
                .zip(&inclusion[j])
                .filter(|(&a, &b)| a && b)
                .count() as f64
                / corpus_len;
            let denom = match pmi_type {
                "uci" => freq[i] * freq[j],
                _ => freq[j],
            };
            total += ((joint + EPSILON) / denom.max(EPSILON)).ln();
            pairs += 1;
        }
    }
    Ok(total / pairs as f64)
}

/// Mean pairwise distance (`emb_dist`) or cosine similarity (`emb_cos`) of
/// the rows of `embeddings` (`[n, d]`)
pub fn embedding_coherence(embeddings: &Tensor, pmi_type: &str) -> Result<f64> {
    let (n, _) = embeddings.dims2()?;
    let (single, empty) = match pmi_type {
        "emb_dist" => (0.0, -2.0),
        "emb_cos" => (1.0, -1.0),
        other => anyhow::bail!(
            "PMI type '{other}' not supported, choose from [\"emb_dist\", \"emb_cos\"]"
        ),
    };
    match n {
        0 => return Ok(empty),
        1 => return Ok(single),
        _ => {}
    }

    let x: Vec<Vec<f32>> = embeddings.to_dtype(DType::F32)?.to_vec2()?;
    let norms: Vec<f64> = x
        .iter()
        .map(|r| r.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>().sqrt())
        .collect();
    let mut total = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            total += if pmi_type == "emb_dist" {
                x[i].iter()
                    .zip(&x[j])
                    .map(|(&a, &b)| (f64::from(a) - f64::from(b)).powi(2))
                    .sum::<f64>()
                    .sqrt()
            } else {
                let dot: f64 = x[i].iter().zip(&x[j]).map(|(&a, &b)| f64::from(a) * f64::from(b)).sum();
                dot / (norms[i] * norms[j])
            };
        }
    }
    Ok(total / (n * (n - 1) / 2) as f64)
}

impl EvalContext<'_> {
    /// Corpus PMI coherence of `topic` over the rows of `eval_tokens`;
    /// `uci` averages over `i < j`, `umass` over `i != j`
    pub fn topic_coherence(
        &self,
        eval_tokens: &Tensor,
        topic: &[String],
        pmi_type: &str,
    ) -> Result<f64> {
        if topic.is_empty() {
            return Ok(EMPTY_TOPIC_SCORE);
        }
        let mask = if pmi_type == "uci" {
            PairMask::Upper
        } else {
            PairMask::OffDiagonal
        };
        pmi_coherence(&self.sentences(eval_tokens)?, topic, pmi_type, mask)
    }

    /// Embedding coherence of the tokens `ids`
    pub fn embedding_topic_coherence(&self, ids: &[u32], pmi_type: &str) -> Result<f64> {
        if ids.is_empty() {
            let empty = Tensor::zeros((0, self.model.d_model()), DType::F32, &Device::Cpu)?;
            return embedding_coherence(&empty, pmi_type);
        }
        embedding_coherence(&self.embeddings(ids)?, pmi_type)
    }

    /// Best k-means clustering of the embeddings of `ids` by silhouette
    /// score, as `(n_clusters, score)`
    pub fn silhouette_score(&self, ids: &[u32]) -> Result<(f64, f64)> {
        let mut unique = ids.to_vec();
        unique.sort_unstable();
        unique.dedup();
        let n_unique = unique.len();
        match n_unique {
            0 => return Ok((1.0, 2.0)),
            1 | 2 => return Ok((n_unique as f64, 2.0 - n_unique as f64)),
            _ => {}
        }

        let points = to_array2(&self.embeddings(ids)?)?;
        let (mut best_num, mut best_score) = (1.0, -2.0);
        for k in 2..ids.len().min(6) {
            let labels = kmeans_labels(&points, k, 0)?;
            let Some(score) = silhouette_score(&points, &labels) else {
                debug!("Skipping {k} clusters: degenerate labelling");
                continue;
            };
            info!("Number of clusters: {k}, silhouette score: {score:.4}");
            if score > best_score {
                (best_num, best_score) = (k as f64, score);
            }
        }
        info!("Best number of clusters: {best_num}, best silhouette score: {best_score:.4}");
        Ok((best_num, best_score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_uci_independent_tokens() {
        // "a" in 2 of 4 sentences, "b" in 2 of 4, together in 1
        let sentences = strings(&["a b", "a", "b", "c"]);
        let score = pmi_coherence(&sentences, &strings(&["a", "b"]), "uci", PairMask::Upper).unwrap();
        assert!(score.abs() < 1e-8);
    }

    #[test]
    fn test_uci_cooccurring_tokens() {
        let sentences = strings(&["x y", "x y", "z", "z"]);
        let score = pmi_coherence(&sentences, &strings(&["x", "y"]), "uci", PairMask::Upper).unwrap();
        assert!((score - 2f64.ln()).abs() < 1e-8);
    }

    #[test]
    fn test_umass_masks() {
        // P(p) = 1/2, P(q) = 1/4, P(p, q) = 1/4
        let sentences = strings(&["p q", "p", "r", "s"]);
        let topic = strings(&["p", "q"]);
        let upper = pmi_coherence(&sentences, &topic, "umass", PairMask::Upper).unwrap();
        // log(P(p, q) / P(q))
        assert!(upper.abs() < 1e-8);
        let both = pmi_coherence(&sentences, &topic, "umass", PairMask::OffDiagonal).unwrap();
        // mean of log(1) and log(1/2)
        assert!((both - 0.5f64.ln() / 2.0).abs() < 1e-8);
    }

    #[test]
    fn test_missing_token_is_finite() {
        let sentences = strings(&["a", "b"]);
        let score = pmi_coherence(&sentences, &strings(&["a", "zzz"]), "uci", PairMask::Upper).unwrap();
        assert!(score.is_finite());
    }

    #[test]
    fn test_empty_topic_and_bad_type() {
        let sentences = strings(&["a"]);
        assert_eq!(
            pmi_coherence(&sentences, &[], "uci", PairMask::Upper).unwrap(),
            EMPTY_TOPIC_SCORE
        );
        assert!(pmi_coherence(&sentences, &strings(&["a"]), "npmi", PairMask::Upper).is_err());
    }

    #[test]
    fn test_embedding_coherence() {
        let x = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [1.0, 0.0]], &Device::Cpu).unwrap();
        let cos = embedding_coherence(&x, "emb_cos").unwrap();
        // pairs: 0, 1, 0
        assert!((cos - 1.0 / 3.0).abs() < 1e-6);
        let dist = embedding_coherence(&x, "emb_dist").unwrap();
        assert!((dist - 2.0 * 2f64.sqrt() / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_coherence_degenerate() {
        let one = Tensor::new(&[[1f32, 2.0]], &Device::Cpu).unwrap();
        let none = Tensor::zeros((0, 2), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(embedding_coherence(&one, "emb_cos").unwrap(), 1.0);
        assert_eq!(embedding_coherence(&one, "emb_dist").unwrap(), 0.0);
        assert_eq!(embedding_coherence(&none, "emb_cos").unwrap(), -1.0);
        assert_eq!(embedding_coherence(&none, "emb_dist").unwrap(), -2.0);
        assert!(embedding_coherence(&one, "uci").is_err());
    }
}
