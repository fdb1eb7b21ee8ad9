//! TCAV: concept activation vectors from linear probes
//!
//! Each concept is a word list. Token positions whose text matches one of
//! the words are positives, a seeded reservoir sample of positions matching
//! no concept supplies the negatives, and a logistic regression probe
//! separates the two. The unit-norm probe weight, oriented so positives
//! project higher, is the concept vector.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use candle_core::{Device, Tensor};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::config::Config;
use crate::dataloader::TokenLoader;
use crate::extractors::{project, read_checkpoint, take_tensor, Concept, ConceptExtractor};
use crate::hooks::HookPoint;
use crate::model::HookedModel;
use crate::probe::ProbeTrainer;

/// Fewest positives a concept needs for its probe
const MIN_POSITIVES: usize = 5;

pub struct Tcav {
    hook: HookPoint,
    act_size: usize,
    words: Vec<HashSet<String>>,
    max_samples: usize,
    seed: u64,
    concepts: Option<Tensor>,
}

fn normalize_token(token: &str) -> String {
    token.trim().to_lowercase()
}

impl Tcav {
    pub fn new(cfg: &Config) -> Result<Self> {
        anyhow::ensure!(!cfg.tcav_concepts.is_empty(), "tcav_concepts is empty");
        let words = cfg
            .tcav_concepts
            .iter()
            .map(|list| list.iter().map(|w| normalize_token(w)).collect())
            .collect();
        Ok(Self {
            hook: cfg.hook_point()?,
            act_size: cfg.act_size()?,
            words,
            max_samples: cfg.tcav_max_samples,
            seed: cfg.seed,
            concepts: None,
        })
    }

    pub fn load(dir: &Path, cfg: &Config, device: &Device) -> Result<Self> {
        let (meta, mut tensors) = read_checkpoint(dir, "tcav", device)?;
        let mut tcav = Self::new(&Config {
            act_name: Some(meta.act_name.clone()),
            act_size: Some(meta.act_size),
            ..cfg.clone()
        })?;
        let concepts = take_tensor(&mut tensors, "concepts")?;
        if concepts.dims()[0] != tcav.words.len() {
            warn!(
                "Checkpoint has {} concepts, tcav_concepts lists {}",
                concepts.dims()[0],
                tcav.words.len()
            );
        }
        tcav.concepts = Some(concepts);
        Ok(tcav)
    }

    /// Concepts whose word list contains `token`
    fn matches(&self, token: &str) -> Vec<usize> {
        let token = normalize_token(token);
        self.words
            .iter()
            .enumerate()
            .filter(|(_, words)| words.contains(&token))
            .map(|(i, _)| i)
            .collect()
    }

    /// Unit vector along `weights`, flipped so `positives` score above
    /// `negatives`
    fn orient(weights: &Array1<f64>, positives: &[Vec<f32>], negatives: &[Vec<f32>]) -> Vec<f32> {
        let norm = weights.dot(weights).sqrt().max(1e-12);
        let unit: Vec<f64> = weights.iter().map(|w| w / norm).collect();
        let mean_score = |rows: &[Vec<f32>]| {
            rows.iter()
                .map(|r| r.iter().zip(&unit).map(|(&x, w)| f64::from(x) * w).sum::<f64>())
                .sum::<f64>()
                / rows.len().max(1) as f64
        };
        let sign = if mean_score(positives) >= mean_score(negatives) {
            1.0
        } else {
            -1.0
        };
        unit.iter().map(|&w| (sign * w) as f32).collect()
    }
}

impl ConceptExtractor for Tcav {
    fn code(&self) -> &'static str {
        "tcav"
    }

    fn hook(&self) -> &HookPoint {
        &self.hook
    }

    fn extract_concepts(&mut self, model: &HookedModel, loader: &mut TokenLoader) -> Result<()> {
        let n_concepts = self.words.len();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut positives: Vec<Vec<Vec<f32>>> = vec![Vec::new(); n_concepts];
        let mut negatives: Vec<Vec<f32>> = Vec::new();
        let mut seen_negatives = 0usize;
        let mut token_text: HashMap<u32, Vec<usize>> = HashMap::new();

        loader.reset();
        for _ in 0..loader.len() {
            if positives.iter().all(|p| p.len() >= self.max_samples) {
                break;
            }
            let tokens = loader.pointer_batch()?;
            loader.advance();
            let hidden = model.hidden_states(&tokens, &self.hook)?;
            let (b, t, d) = hidden.dims3()?;
            let rows: Vec<Vec<f32>> = hidden
                .reshape((b * t, d))?
                .to_device(&Device::Cpu)?
                .to_vec2()?;
            let ids: Vec<u32> = tokens.flatten_all()?.to_vec1()?;

            for (row, id) in rows.into_iter().zip(ids) {
                if !token_text.contains_key(&id) {
                    let text = model.to_str_tokens(&[id])?.concat();
                    token_text.insert(id, self.matches(&text));
                }
                let hits = &token_text[&id];
                if hits.is_empty() {
                    // reservoir sampling over non-concept positions
                    seen_negatives += 1;
                    if negatives.len() < self.max_samples {
                        negatives.push(row);
                    } else {
                        let j = rng.gen_range(0..seen_negatives);
                        if j < self.max_samples {
                            negatives[j] = row;
                        }
                    }
                } else {
                    for &c in hits {
                        if positives[c].len() < self.max_samples {
                            positives[c].push(row.clone());
                        }
                    }
                }
            }
        }

        let trainer = ProbeTrainer::new(self.seed);
        let mut flat = Vec::with_capacity(n_concepts * self.act_size);
        for (c, pos) in positives.iter().enumerate() {
            anyhow::ensure!(
                pos.len() >= MIN_POSITIVES,
                "Concept {c} matched only {} tokens, need at least {MIN_POSITIVES}",
                pos.len()
            );
            let n = pos.len().min(negatives.len());
            anyhow::ensure!(n >= MIN_POSITIVES, "Only {} negative samples", negatives.len());

            let data: Vec<(Vec<f32>, bool)> = pos[..n]
                .iter()
                .map(|r| (r.clone(), true))
                .chain(negatives[..n].iter().map(|r| (r.clone(), false)))
                .collect();
            let probe = trainer.fit(data)?;
            info!(
                "TCAV concept {c}: {n} positives, probe accuracy {:.3}, f1 {:.3}",
                probe.results.accuracy,
                probe.results.f1()
            );
            flat.extend(Self::orient(&probe.weights, &pos[..n], &negatives[..n]));
        }

        self.concepts = Some(Tensor::from_vec(
            flat,
            (n_concepts, self.act_size),
            model.device(),
        )?);
        Ok(())
    }

    fn concepts(&self) -> Result<Tensor> {
        self.concepts
            .clone()
            .ok_or_else(|| anyhow::anyhow!("TCAV has no concepts yet, run extract_concepts"))
    }

    fn n_concepts(&self) -> usize {
        self.concepts
            .as_ref()
            .map_or(self.words.len(), |c| c.dims()[0])
    }

    fn act_size(&self) -> usize {
        self.act_size
    }

    fn activations_from_hidden(&self, hidden: &Tensor, concept: &Concept) -> Result<Tensor> {
        project(hidden, &concept.vector)
    }

    fn tensors(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([("concepts".to_string(), self.concepts()?)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcav() -> Tcav {
        let cfg = Config {
            act_size: Some(2),
            tcav_concepts: vec![
                vec!["He".into(), "she".into()],
                vec!["one".into(), "two".into()],
            ],
            ..Config::default()
        };
        Tcav::new(&cfg).unwrap()
    }

    #[test]
    fn test_token_matching_ignores_case_and_space() {
        let t = tcav();
        assert_eq!(t.matches(" he"), vec![0]);
        assert_eq!(t.matches("Two "), vec![1]);
        assert!(t.matches("three").is_empty());
    }

    #[test]
    fn test_orient_points_at_positives() {
        let weights = Array1::from(vec![-3.0, 4.0]);
        let pos = vec![vec![-1.0f32, 0.0]];
        let neg = vec![vec![1.0f32, 0.0]];
        let v = Tcav::orient(&weights, &pos, &neg);
        assert!((v[0] + 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let v = Tcav::orient(&weights, &neg, &pos);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }
}
