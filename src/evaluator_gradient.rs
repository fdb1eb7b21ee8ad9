//! Gradient faithfulness
//!
//! The directional derivative of the loss (`loss`) or of a class logit
//! (`logit`) along the concept at every token, combined with the concept
//! activations by `return_type`. The loss derivative is negated: a concept
//! whose direction lowers the loss scores high.

use anyhow::Result;
use candle_core::{DType, Tensor};
use tracing::info;

use crate::evaluators::{
    combine_effects, minibatches, to_f64_vec, ConceptEvaluator, EvalContext, EvaluatorName,
    MetricOutput, Priors,
};
use crate::extractors::Concept;

pub struct GradientEvaluator<'a> {
    ctx: EvalContext<'a>,
    name: EvaluatorName,
    concept: Option<Concept>,
}

/// `grad · concept` at every token: `[B, T, d] -> [B, T]`
fn directional_derivative(grad: &Tensor, concept: &Tensor) -> Result<Tensor> {
    crate::extractors::project(
        &grad.to_dtype(DType::F32)?,
        &concept.to_device(grad.device())?,
    )
}

impl<'a> GradientEvaluator<'a> {
    pub fn new(ctx: EvalContext<'a>, name: EvaluatorName) -> Self {
        Self {
            ctx,
            name,
            concept: None,
        }
    }
}

impl ConceptEvaluator for GradientEvaluator<'_> {
    fn name(&self) -> &EvaluatorName {
        &self.name
    }

    fn update_concept(&mut self, concept: Concept) {
        self.concept = Some(concept);
    }

    fn evaluate(&mut self, eval_tokens: &Tensor, _priors: &Priors) -> Result<MetricOutput> {
        let concept = self
            .concept
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No concept set, call update_concept first"))?;

        let mut effects = Vec::new();
        let mut acts = Vec::new();
        for tokens in minibatches(eval_tokens, self.ctx.cfg.concept_eval_batchsize)? {
            let (grad, hidden) = match self.name.variant.as_str() {
                "loss" => self.ctx.loss_gradient(&tokens)?,
                _ => self
                    .ctx
                    .class_logit_gradient(&tokens, self.ctx.cfg.logit_class_idx, None)?,
            };
            let mut effect = directional_derivative(&grad, &concept.vector)?;
            if self.name.variant == "loss" {
                effect = effect.neg()?;
            }
            effects.extend(to_f64_vec(&effect)?);
            acts.extend(to_f64_vec(
                &self.ctx.extractor.activations_from_hidden(&hidden, concept)?,
            )?);
        }

        let value = combine_effects(&self.ctx.cfg.return_type, &effects, &acts)?;
        info!(
            "Gradient Metric ({}, {}): {value:.4}",
            self.name.variant, self.ctx.cfg.return_type
        );
        Ok(MetricOutput {
            value,
            effects: Some(effects),
            activations: Some(acts),
            topic: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_directional_derivative() {
        let grad = Tensor::new(&[[[1f32, 2.0], [3.0, -1.0]]], &Device::Cpu).unwrap();
        let concept = Tensor::new(&[0.5f32, 1.0], &Device::Cpu).unwrap();
        let d: Vec<Vec<f32>> = directional_derivative(&grad, &concept)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(d, vec![vec![2.5, 0.5]]);
    }
}
