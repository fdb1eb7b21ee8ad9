//! Metric evaluators: how do the concept metrics relate to each other?
//!
//! Every evaluator scores every concept, giving a `[n_metrics, n_concepts]`
//! matrix. Evaluators that measure the same thing share work: the `itc`
//! variants reuse one critical-token sweep per concept, and
//! `replace-ablation-*` reuses the effects of `replace-*` and `ablation-*`
//! when those ran earlier.
//!
//! * `vr` (validity relevance): pairwise Pearson and Kendall correlation
//!   of the metric rows across concepts.
//! * `rc` (reliability consistency): the matrix is computed on both halves
//!   of the evaluation rows, and each metric's two rows are correlated.
//!
//! Matrices are dumped as `.npy` files under `<output_dir>/vr_data/` or
//! `<output_dir>/rc_data/`, prefixed with a timestamp.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use serde::Serialize;
use tracing::info;

use crate::config::{Config, METRIC_EVALUATOR_CODES};
use crate::critical_tokens::CriticalTokens;
use crate::evaluators::{ConceptEvaluator, EvaluatorCode, Priors};
use crate::extractors::Concept;
use crate::stats::{correlation_matrix, kendall_tau, pearson};

/// Result of a metric evaluation
#[derive(Debug, Clone, Serialize)]
pub struct MetricReport {
    pub code: String,
    pub evaluators: Vec<String>,
    pub concept_idxs: Vec<usize>,
    /// Raw metrics, `[n_metrics, n_concepts]`; for `rc` the first-half
    /// rows followed by the second-half rows
    pub metrics: Vec<Vec<f64>>,
    /// `[n_metrics, n_metrics]` for `vr`, `[1, n_metrics]` for `rc`
    pub pearson: Vec<Vec<f64>>,
    pub pearson_p: Vec<Vec<f64>>,
    pub kendall: Vec<Vec<f64>>,
    pub kendall_p: Vec<Vec<f64>>,
}

pub trait MetricEvaluator {
    /// `vr` or `rc`
    fn code(&self) -> &'static str;

    /// Score `concepts` with every evaluator on `eval_tokens` and relate the
    /// resulting metrics
    fn evaluate<'e>(
        &mut self,
        eval_tokens: &Tensor,
        evaluators: &mut [Box<dyn ConceptEvaluator + 'e>],
        concepts: &[Concept],
    ) -> Result<MetricReport>;
}

/// Build the metric evaluator for `cfg.metric_evaluator`
pub fn metric_evaluator_factory(cfg: &Config) -> Result<Box<dyn MetricEvaluator>> {
    let out_dir = PathBuf::from(&cfg.output_dir);
    match cfg.metric_evaluator.as_str() {
        "vr" => Ok(Box::new(ValidityRelevance::new(out_dir))),
        "rc" => Ok(Box::new(ReliabilityConsistency::new(out_dir))),
        other => anyhow::bail!(
            "Unknown metric evaluator '{other}', choose from {METRIC_EVALUATOR_CODES:?}"
        ),
    }
}

/// `[n_metrics, n_concepts]` matrix of every evaluator on every concept
pub fn metric_matrix(
    eval_tokens: &Tensor,
    evaluators: &mut [Box<dyn ConceptEvaluator + '_>],
    concepts: &[Concept],
) -> Result<Vec<Vec<f64>>> {
    info!("Metric evaluation ...");
    let mut topics: Vec<Option<CriticalTokens>> = vec![None; concepts.len()];
    // (code, variant, concept idx) -> (effects, activations)
    let mut effects: HashMap<(EvaluatorCode, String, usize), (Vec<f64>, Vec<f64>)> =
        HashMap::new();

    let mut metrics = Vec::with_capacity(evaluators.len());
    for evaluator in evaluators.iter_mut() {
        let name = evaluator.name().clone();
        info!("Evaluating {name} ...");
        let mut row = Vec::with_capacity(concepts.len());
        for (j, concept) in concepts.iter().enumerate() {
            evaluator.update_concept(concept.clone());
            let priors = match name.code {
                EvaluatorCode::Itc => Priors {
                    topic: topics[j].clone(),
                    effects: None,
                },
                EvaluatorCode::ReplaceAblation => {
                    let key = |code| (code, name.variant.clone(), concept.idx);
                    let summed = match (
                        effects.get(&key(EvaluatorCode::Replace)),
                        effects.get(&key(EvaluatorCode::Ablation)),
                    ) {
                        // ablation effects are already negated
                        (Some((rep, _)), Some((abl, acts))) => Some((
                            rep.iter().zip(abl).map(|(r, a)| r + a).collect(),
                            acts.clone(),
                        )),
                        _ => None,
                    };
                    Priors {
                        topic: None,
                        effects: summed,
                    }
                }
                _ => Priors::default(),
            };

            let out = evaluator.evaluate(eval_tokens, &priors)?;
            match name.code {
                EvaluatorCode::Itc if topics[j].is_none() => topics[j] = out.topic,
                EvaluatorCode::Replace | EvaluatorCode::Ablation => {
                    if let (Some(e), Some(a)) = (out.effects, out.activations) {
                        effects.insert((name.code, name.variant.clone(), concept.idx), (e, a));
                    }
                }
                _ => {}
            }
            row.push(out.value);
        }
        metrics.push(row);
    }
    Ok(metrics)
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Write a matrix as an F64 `.npy` file
fn write_npy(path: &Path, rows: &[Vec<f64>]) -> Result<()> {
    let n_cols = rows.first().map_or(0, Vec::len);
    anyhow::ensure!(
        rows.iter().all(|r| r.len() == n_cols),
        "Ragged matrix for {}",
        path.display()
    );
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (rows.len(), n_cols), &Device::Cpu)?
        .write_npy(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Write `files` (suffix, matrix) under `dir` with a shared timestamp prefix
fn dump(dir: &Path, files: &[(&str, &Vec<Vec<f64>>)]) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let stamp = timestamp();
    for (suffix, rows) in files {
        write_npy(&dir.join(format!("{stamp}{suffix}.npy")), rows)?;
    }
    info!("Saved metric matrices to {}/{stamp}*.npy", dir.display());
    Ok(())
}

fn fmt_matrix(rows: &[Vec<f64>]) -> String {
    rows.iter()
        .map(|r| {
            let cells: Vec<String> = r.iter().map(|v| format!("{v:>8.4}")).collect();
            format!("[{}]", cells.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn evaluator_names(evaluators: &[Box<dyn ConceptEvaluator + '_>]) -> Vec<String> {
    evaluators.iter().map(|e| e.name().to_string()).collect()
}

/// Pairwise correlation of the metrics across concepts
pub struct ValidityRelevance {
    out_dir: PathBuf,
}

impl ValidityRelevance {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: output_dir.into().join("vr_data"),
        }
    }
}

impl MetricEvaluator for ValidityRelevance {
    fn code(&self) -> &'static str {
        "vr"
    }

    fn evaluate<'e>(
        &mut self,
        eval_tokens: &Tensor,
        evaluators: &mut [Box<dyn ConceptEvaluator + 'e>],
        concepts: &[Concept],
    ) -> Result<MetricReport> {
        anyhow::ensure!(
            concepts.len() >= 2,
            "Validity relevance needs at least two concepts, got {}",
            concepts.len()
        );
        let metrics = metric_matrix(eval_tokens, evaluators, concepts)?;
        let (pearson_r, pearson_p) = correlation_matrix(&metrics, pearson)?;
        let (kendall_r, kendall_p) = correlation_matrix(&metrics, kendall_tau)?;

        dump(
            &self.out_dir,
            &[
                ("pearsonr_metrics", &pearson_r),
                ("kendalltau_metrics", &kendall_r),
                ("pearson_p_metrics", &pearson_p),
                ("kendall_p_metrics", &kendall_p),
                ("origin_metrics", &metrics),
            ],
        )?;

        let names = evaluator_names(evaluators);
        info!("Metrics: {names:?}");
        info!("Metric Validity Relevance (pearsonr):\n{}", fmt_matrix(&pearson_r));
        info!("Metric Validity Relevance (kendalltau):\n{}", fmt_matrix(&kendall_r));
        info!("P-value (pearsonr):\n{}", fmt_matrix(&pearson_p));
        info!("P-value (kendalltau):\n{}", fmt_matrix(&kendall_p));

        Ok(MetricReport {
            code: self.code().to_string(),
            evaluators: names,
            concept_idxs: concepts.iter().map(|c| c.idx).collect(),
            metrics,
            pearson: pearson_r,
            pearson_p,
            kendall: kendall_r,
            kendall_p,
        })
    }
}

/// Agreement of each metric between two halves of the evaluation rows
pub struct ReliabilityConsistency {
    out_dir: PathBuf,
}

impl ReliabilityConsistency {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: output_dir.into().join("rc_data"),
        }
    }
}

/// Correlate row `i` of `a` with row `i` of `b`; returns `[1, n]` matrices
/// of coefficients and p-values
fn rowwise(
    a: &[Vec<f64>],
    b: &[Vec<f64>],
    func: fn(&[f64], &[f64]) -> Result<crate::stats::Correlation>,
) -> Result<(Vec<Vec<f64>>, Vec<Vec<f64>>)> {
    let mut r = Vec::with_capacity(a.len());
    let mut p = Vec::with_capacity(a.len());
    for (x, y) in a.iter().zip(b) {
        let c = func(x, y)?;
        r.push(c.r);
        p.push(c.p);
    }
    Ok((vec![r], vec![p]))
}

impl MetricEvaluator for ReliabilityConsistency {
    fn code(&self) -> &'static str {
        "rc"
    }

    fn evaluate<'e>(
        &mut self,
        eval_tokens: &Tensor,
        evaluators: &mut [Box<dyn ConceptEvaluator + 'e>],
        concepts: &[Concept],
    ) -> Result<MetricReport> {
        anyhow::ensure!(
            concepts.len() >= 2,
            "Reliability consistency needs at least two concepts, got {}",
            concepts.len()
        );
        let rows = eval_tokens.dim(0)?;
        anyhow::ensure!(rows >= 2, "Need at least two evaluation rows, got {rows}");
        let half = rows / 2;
        let first = eval_tokens.narrow(0, 0, half)?;
        let second = eval_tokens.narrow(0, half, rows - half)?;

        info!("First half ({half} rows)");
        let metrics_a = metric_matrix(&first, evaluators, concepts)?;
        info!("Second half ({} rows)", rows - half);
        let metrics_b = metric_matrix(&second, evaluators, concepts)?;

        let (pearson_r, pearson_p) = rowwise(&metrics_a, &metrics_b, pearson)?;
        let (kendall_r, kendall_p) = rowwise(&metrics_a, &metrics_b, kendall_tau)?;
        let metrics: Vec<Vec<f64>> = metrics_a.into_iter().chain(metrics_b).collect();

        dump(
            &self.out_dir,
            &[
                ("pearsonr_metrics", &pearson_r),
                ("kendalltau_metrics", &kendall_r),
                ("pearson_p_metrics", &pearson_p),
                ("kendall_p_metrics", &kendall_p),
                ("origin_metrics", &metrics),
            ],
        )?;

        let names = evaluator_names(evaluators);
        info!("Metrics: {names:?}");
        info!("Metric Reliability Consistency (pearsonr):\n{}", fmt_matrix(&pearson_r));
        info!("Metric Reliability Consistency (kendalltau):\n{}", fmt_matrix(&kendall_r));
        info!("P-value (pearsonr):\n{}", fmt_matrix(&pearson_p));
        info!("P-value (kendalltau):\n{}", fmt_matrix(&kendall_p));

        Ok(MetricReport {
            code: self.code().to_string(),
            evaluators: names,
            concept_idxs: concepts.iter().map(|c| c.idx).collect(),
            metrics,
            pearson: pearson_r,
            pearson_p,
            kendall: kendall_r,
            kendall_p,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluators::{EvaluatorName, MetricOutput};
    use candle_core::DType;

    /// Scores concept `idx` as `scale * idx`
    struct FakeEvaluator {
        name: EvaluatorName,
        scale: f64,
        concept: usize,
    }

    impl FakeEvaluator {
        fn boxed(name: &str, scale: f64) -> Box<dyn ConceptEvaluator> {
            Box::new(Self {
                name: EvaluatorName::parse(name).unwrap(),
                scale,
                concept: 0,
            })
        }
    }

    impl ConceptEvaluator for FakeEvaluator {
        fn name(&self) -> &EvaluatorName {
            &self.name
        }

        fn update_concept(&mut self, concept: Concept) {
            self.concept = concept.idx;
        }

        fn evaluate(&mut self, _eval_tokens: &Tensor, priors: &Priors) -> Result<MetricOutput> {
            let value = self.scale * self.concept as f64;
            Ok(match (self.name.code, &priors.effects) {
                (EvaluatorCode::ReplaceAblation, Some((e, _))) => MetricOutput {
                    value: e.iter().sum(),
                    ..MetricOutput::default()
                },
                (EvaluatorCode::Replace | EvaluatorCode::Ablation, _) => MetricOutput {
                    value,
                    effects: Some(vec![value]),
                    activations: Some(vec![1.0]),
                    topic: None,
                },
                _ => MetricOutput {
                    value,
                    ..MetricOutput::default()
                },
            })
        }
    }

    fn concepts(n: usize) -> Vec<Concept> {
        (0..n)
            .map(|idx| Concept {
                idx,
                vector: Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap(),
            })
            .collect()
    }

    fn tokens(rows: usize) -> Tensor {
        Tensor::zeros((rows, 4), DType::U32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_replace_ablation_reuses_effects() {
        let mut evaluators = vec![
            FakeEvaluator::boxed("replace-loss", 1.0),
            FakeEvaluator::boxed("ablation-loss", 2.0),
            FakeEvaluator::boxed("replace-ablation-loss", 0.0),
        ];
        let m = metric_matrix(&tokens(2), &mut evaluators, &concepts(3)).unwrap();
        assert_eq!(m[0], vec![0.0, 1.0, 2.0]);
        assert_eq!(m[1], vec![0.0, 2.0, 4.0]);
        // sum of the reused replace and ablation effects
        assert_eq!(m[2], vec![0.0, 3.0, 6.0]);
    }

    #[test]
    fn test_vr_writes_matrices() {
        let dir = tempfile::tempdir().unwrap();
        let mut evaluators = vec![
            FakeEvaluator::boxed("itc-uci", 1.0),
            FakeEvaluator::boxed("otc-emb_cos", -1.0),
        ];
        let mut vr = ValidityRelevance::new(dir.path());
        let report = vr
            .evaluate(&tokens(2), &mut evaluators, &concepts(3))
            .unwrap();
        assert_eq!(report.evaluators, vec!["itc-uci", "otc-emb_cos"]);
        assert!((report.pearson[0][1] + 1.0).abs() < 1e-12);
        assert!((report.kendall[0][0] - 1.0).abs() < 1e-12);

        let files: Vec<String> = std::fs::read_dir(dir.path().join("vr_data"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 5);
        assert!(files.iter().any(|f| f.ends_with("origin_metrics.npy")));
    }

    #[test]
    fn test_rc_splits_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut evaluators = vec![FakeEvaluator::boxed("gradient-loss", 1.0)];
        let mut rc = ReliabilityConsistency::new(dir.path());
        let report = rc
            .evaluate(&tokens(5), &mut evaluators, &concepts(3))
            .unwrap();
        // both halves agree exactly
        assert_eq!(report.pearson.len(), 1);
        assert!((report.pearson[0][0] - 1.0).abs() < 1e-12);
        assert_eq!(report.metrics.len(), 2);
    }

    #[test]
    fn test_needs_two_concepts() {
        let dir = tempfile::tempdir().unwrap();
        let mut evaluators = vec![FakeEvaluator::boxed("itc", 1.0)];
        let mut vr = ValidityRelevance::new(dir.path());
        assert!(vr
            .evaluate(&tokens(2), &mut evaluators, &concepts(1))
            .is_err());
    }

    #[test]
    fn test_factory_rejects_unknown_code() {
        let cfg = Config {
            metric_evaluator: "xx".to_string(),
            ..Config::default()
        };
        assert!(metric_evaluator_factory(&cfg).is_err());
    }
}
