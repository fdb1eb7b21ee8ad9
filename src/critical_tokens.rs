//! Perturbation sweep for the tokens most critical to a concept
//!
//! Each position of each row is masked in turn with the pad token. The drop
//! in the concept's activation measures how much the masked token matters:
//! to its own position, and as context for the other positions of the row.
//! Tokens are ranked by the largest drop they cause anywhere.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use tracing::{debug, info};

use crate::evaluators::{minibatches, EvalContext};
use crate::extractors::Concept;

/// Rows kept from each minibatch before the global ranking
const PER_BATCH_TOP: usize = 50;

/// Ranked critical tokens
#[derive(Debug, Clone, Default, Serialize)]
pub struct CriticalTokens {
    /// Lowercased, stripped unless stripping leaves nothing
    pub tokens: Vec<String>,
    pub ids: Vec<u32>,
    pub importances: Vec<f64>,
    /// Token text as decoded
    pub raw: Vec<String>,
}

impl CriticalTokens {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// One ranked row: token text, importance, token id
#[derive(Debug, Clone, PartialEq)]
struct Entry {
    token: String,
    imp: f64,
    id: u32,
}

/// Group by token text, keeping the largest importance and the largest id
fn group_max(entries: impl IntoIterator<Item = Entry>) -> Vec<Entry> {
    let mut groups: HashMap<String, (f64, u32)> = HashMap::new();
    for e in entries {
        groups
            .entry(e.token)
            .and_modify(|(imp, id)| {
                *imp = imp.max(e.imp);
                *id = (*id).max(e.id);
            })
            .or_insert((e.imp, e.id));
    }
    groups
        .into_iter()
        .map(|(token, (imp, id))| Entry { token, imp, id })
        .collect()
}

/// Descending importance, ties broken by token text
fn sort_desc(entries: &mut [Entry]) {
    entries.sort_by(|a, b| b.imp.total_cmp(&a.imp).then_with(|| a.token.cmp(&b.token)));
}

/// Per-position sweep state for one minibatch
struct Sweep {
    /// Largest drop seen at each position when another position was masked
    context_imp: Vec<f64>,
    /// Token whose masking caused `context_imp`
    context_id: Vec<u32>,
    /// Drop at each position when that position itself was masked
    self_imp: Vec<f64>,
}

impl Sweep {
    fn new(n: usize) -> Self {
        Self {
            context_imp: vec![0.0; n],
            context_id: vec![0; n],
            self_imp: vec![0.0; n],
        }
    }

    /// Record the drops `diff` (`rows * seq`) caused by masking `masked` in
    /// every row of `ids`
    fn update(&mut self, ids: &[u32], diff: &[f64], seq: usize, masked: usize) {
        for (k, &d) in diff.iter().enumerate() {
            let (row, pos) = (k / seq, k % seq);
            let d = if pos == masked {
                self.self_imp[k] = d;
                0.0
            } else {
                d
            };
            if !(self.context_imp[k] > d) {
                self.context_imp[k] = d;
                self.context_id[k] = ids[row * seq + masked];
            }
        }
    }
}

impl EvalContext<'_> {
    fn decode_cached(&self, ids: &[u32], cache: &mut HashMap<u32, String>) -> Result<Vec<String>> {
        for &id in ids {
            if !cache.contains_key(&id) {
                let text = self.model.to_str_tokens(&[id])?.concat();
                cache.insert(id, text);
            }
        }
        Ok(ids.iter().map(|id| cache[id].clone()).collect())
    }

    /// Run the masking sweep over `eval_tokens` (`[B, T]`) and return the
    /// `topic_len` most critical tokens for `concept`
    pub fn most_critical_tokens(
        &self,
        eval_tokens: &Tensor,
        concept: &Concept,
    ) -> Result<CriticalTokens> {
        let eval_tokens = eval_tokens.to_dtype(DType::U32)?.to_device(&Device::Cpu)?;
        let pad = self.model.pad_token_id();
        let mut texts: HashMap<u32, String> = HashMap::new();
        let mut kept: Vec<Entry> = Vec::new();

        let batches = minibatches(&eval_tokens, self.cfg.concept_eval_batchsize)?;
        let n_batches = batches.len();
        for (b, tokens) in batches.into_iter().enumerate() {
            let (rows, seq) = tokens.dims2()?;
            let ids: Vec<u32> = tokens.flatten_all()?.to_vec1()?;
            let origin: Vec<f32> = self
                .concept_activations(&tokens, concept)?
                .flatten_all()?
                .to_vec1()?;

            let mut sweep = Sweep::new(rows * seq);
            for masked in 0..seq {
                let mut masked_ids = ids.clone();
                for row in 0..rows {
                    masked_ids[row * seq + masked] = pad;
                }
                let masked_tokens = Tensor::from_vec(masked_ids, (rows, seq), &Device::Cpu)?;
                let acts: Vec<f32> = self
                    .concept_activations(&masked_tokens, concept)?
                    .flatten_all()?
                    .to_vec1()?;
                let diff: Vec<f64> = origin
                    .iter()
                    .zip(&acts)
                    .map(|(&o, &a)| f64::from(o) - f64::from(a))
                    .collect();
                sweep.update(&ids, &diff, seq, masked);
            }

            let own = self.decode_cached(&ids, &mut texts)?;
            let ctx = self.decode_cached(&sweep.context_id, &mut texts)?;
            let own = group_max(own.into_iter().zip(&ids).zip(&sweep.self_imp).map(
                |((token, &id), &imp)| Entry { token, imp, id },
            ));
            let ctx = group_max(ctx.into_iter().zip(&sweep.context_id).zip(&sweep.context_imp).map(
                |((token, &id), &imp)| Entry { token, imp, id },
            ));

            let mut merged: Vec<Entry> = own.into_iter().chain(ctx).collect();
            sort_desc(&mut merged);
            let mut seen = std::collections::HashSet::new();
            merged.retain(|e| seen.insert(e.token.clone()));
            merged.truncate(PER_BATCH_TOP);
            debug!("Minibatch {}/{n_batches}: {} candidate tokens", b + 1, merged.len());
            kept.extend(merged);
        }

        let mut ranked = group_max(kept);
        sort_desc(&mut ranked);
        ranked.truncate(self.cfg.topic_len);

        let mut result = CriticalTokens::default();
        for e in ranked {
            let lower = e.token.to_lowercase();
            let stripped = lower.trim().to_string();
            result
                .tokens
                .push(if stripped.is_empty() { lower } else { stripped });
            result.ids.push(e.id);
            result.importances.push(e.imp);
            result.raw.push(e.token);
        }
        info!(
            "Most critical tokens for concept {}: {}",
            concept.idx,
            result
                .tokens
                .iter()
                .map(|t| format!("{t:?}"))
                .collect::<Vec<_>>()
                .join(" ")
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(token: &str, imp: f64, id: u32) -> Entry {
        Entry {
            token: token.to_string(),
            imp,
            id,
        }
    }

    #[test]
    fn test_group_max_is_per_column() {
        let mut g = group_max(vec![entry("a", 1.0, 7), entry("a", 3.0, 2), entry("b", 0.5, 1)]);
        sort_desc(&mut g);
        assert_eq!(g, vec![entry("a", 3.0, 7), entry("b", 0.5, 1)]);
    }

    #[test]
    fn test_sort_breaks_ties_by_token() {
        let mut v = vec![entry("z", 1.0, 0), entry("m", 1.0, 0), entry("q", 2.0, 0)];
        sort_desc(&mut v);
        let order: Vec<&str> = v.iter().map(|e| e.token.as_str()).collect();
        assert_eq!(order, vec!["q", "m", "z"]);
    }

    #[test]
    fn test_sweep_tracks_self_and_context() {
        // one row of three tokens
        let ids = [10, 11, 12];
        let mut sweep = Sweep::new(3);
        // masking position 0 drops position 1 by 2.0, itself by 5.0
        sweep.update(&ids, &[5.0, 2.0, -1.0], 3, 0);
        // masking position 1 drops position 2 by 0.5, itself by 1.0
        sweep.update(&ids, &[0.0, 1.0, 0.5], 3, 1);

        assert_eq!(sweep.self_imp, vec![5.0, 1.0, 0.0]);
        assert_eq!(sweep.context_imp[1], 2.0);
        assert_eq!(sweep.context_id[1], 10);
        assert_eq!(sweep.context_imp[2], 0.5);
        assert_eq!(sweep.context_id[2], 11);
    }
}
