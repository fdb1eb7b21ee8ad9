//! Linear probing with linfa
//!
//! Trains a logistic regression probe separating concept tokens from other
//! tokens; its weight vector is the concept activation vector.

use anyhow::{Context, Result};
use linfa::prelude::*;
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

/// Results from evaluating a probe on held-out samples
#[derive(Debug, Clone)]
pub struct ProbeResults {
    /// Classification accuracy on test set
    pub accuracy: f64,
    /// Number of correct predictions
    pub correct: usize,
    /// Total number of test samples
    pub total: usize,
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl ProbeResults {
    /// Precision with concept tokens as the positive class
    pub fn precision(&self) -> f64 {
        let denom = self.true_positives + self.false_positives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    /// Recall with concept tokens as the positive class
    pub fn recall(&self) -> f64 {
        let denom = self.true_positives + self.false_negatives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

/// A fitted probe
#[derive(Debug, Clone)]
pub struct Probe {
    /// Weight per input feature
    pub weights: Array1<f64>,
    pub intercept: f64,
    pub results: ProbeResults,
}

/// Trainer for linear probes
pub struct ProbeTrainer {
    max_iterations: u64,
    test_fraction: f64,
    seed: u64,
}

impl ProbeTrainer {
    pub fn new(seed: u64) -> Self {
        Self {
            max_iterations: 100,
            test_fraction: 0.2,
            seed,
        }
    }

    /// Shuffle `data`, hold out the test fraction, train on the rest
    pub fn fit(&self, mut data: Vec<(Vec<f32>, bool)>) -> Result<Probe> {
        anyhow::ensure!(data.len() >= 4, "Need at least 4 samples, got {}", data.len());
        data.shuffle(&mut StdRng::seed_from_u64(self.seed));
        let n_test = ((data.len() as f64 * self.test_fraction).round() as usize).max(1);
        let train = data.split_off(n_test);
        self.train_and_evaluate(train, data)
    }

    /// Train a probe and evaluate on test data
    pub fn train_and_evaluate(
        &self,
        train_data: Vec<(Vec<f32>, bool)>,
        test_data: Vec<(Vec<f32>, bool)>,
    ) -> Result<Probe> {
        let (train_x, train_y) = self.prepare_data(&train_data)?;
        let (test_x, test_y) = self.prepare_data(&test_data)?;

        debug!(
            "Training probe: {} samples, {} features",
            train_x.nrows(),
            train_x.ncols()
        );

        let train_dataset = Dataset::new(train_x, train_y);
        let model = LogisticRegression::default()
            .max_iterations(self.max_iterations)
            .fit(&train_dataset)
            .context("Failed to train logistic regression")?;

        let predictions = model.predict(&test_x);
        let results = self.compute_metrics(&predictions, &test_y);

        Ok(Probe {
            weights: model.params().clone(),
            intercept: model.intercept(),
            results,
        })
    }

    fn prepare_data(&self, data: &[(Vec<f32>, bool)]) -> Result<(Array2<f64>, Array1<usize>)> {
        if data.is_empty() {
            anyhow::bail!("Empty dataset");
        }

        let n_samples = data.len();
        let n_features = data[0].0.len();

        let flat: Vec<f64> = data
            .iter()
            .flat_map(|(features, _)| features.iter().map(|&f| f64::from(f)))
            .collect();

        let x = Array2::from_shape_vec((n_samples, n_features), flat)
            .context("Failed to create feature matrix")?;

        // 1 = concept token, 0 = other
        let y: Array1<usize> = data
            .iter()
            .map(|(_, positive)| usize::from(*positive))
            .collect();

        Ok((x, y))
    }

    fn compute_metrics(&self, predictions: &Array1<usize>, labels: &Array1<usize>) -> ProbeResults {
        let mut tp = 0;
        let mut tn = 0;
        let mut fp = 0;
        let mut r#fn = 0;

        for (pred, label) in predictions.iter().zip(labels.iter()) {
            match (*pred, *label) {
                (1, 1) => tp += 1,
                (0, 0) => tn += 1,
                (1, 0) => fp += 1,
                (0, 1) => r#fn += 1,
                _ => {}
            }
        }

        let correct = tp + tn;
        let total = predictions.len();
        let accuracy = correct as f64 / total as f64;

        ProbeResults {
            accuracy,
            correct,
            total,
            true_positives: tp,
            true_negatives: tn,
            false_positives: fp,
            false_negatives: r#fn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_results_metrics() {
        let results = ProbeResults {
            accuracy: 0.8,
            correct: 8,
            total: 10,
            true_positives: 4,
            true_negatives: 4,
            false_positives: 1,
            false_negatives: 1,
        };

        assert!((results.precision() - 0.8).abs() < 0.01);
        assert!((results.recall() - 0.8).abs() < 0.01);
        assert!((results.f1() - 0.8).abs() < 0.01);
    }

    #[test]
    fn test_probe_separates_on_first_feature() {
        let data: Vec<(Vec<f32>, bool)> = (0..40)
            .map(|i| {
                let positive = i % 2 == 0;
                let x = if positive { 2.0 } else { -2.0 };
                (vec![x + (i as f32) * 0.01, 0.1 * (i % 3) as f32], positive)
            })
            .collect();
        let probe = ProbeTrainer::new(0).fit(data).unwrap();
        assert_eq!(probe.weights.len(), 2);
        assert!(probe.results.accuracy > 0.9);
        assert!(probe.weights[0].abs() > probe.weights[1].abs());
    }
}
