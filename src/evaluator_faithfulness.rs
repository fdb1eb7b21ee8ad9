//! Faithfulness: does intervening on a concept change the model's output?
//!
//! * `replace`: every hidden state is replaced by the concept, renormalised
//!   to the token's own mean and std.
//! * `ablation`: the concept's contribution `act * concept` is removed from
//!   every hidden state.
//! * `replace-ablation`: the sum of the two effects.
//!
//! The per-token effect is one of
//! * `loss`: clean loss minus disturbed loss,
//! * `logit`: disturbed minus clean class logit (`logit_class_idx`),
//! * `pearson` / `KL_div` / `openai_var`: agreement of the disturbed and
//!   clean next-token distributions (`logit_topk` restricts them).
//!
//! Ablation effects are negated so that a concept the model relies on
//! scores high under both interventions. The effects of the first `T - 1`
//! positions are combined with the concept activations there according to
//! `return_type`.

use anyhow::Result;
use candle_core::Tensor;
use tracing::{debug, info};

use crate::evaluators::{
    combine_effects, minibatches, to_f64_vec, ConceptEvaluator, EvalContext, EvaluatorCode,
    EvaluatorName, MetricOutput, Priors,
};
use crate::extractors::Concept;
use crate::hooks::Intervention;

pub struct FaithfulnessEvaluator<'a> {
    ctx: EvalContext<'a>,
    name: EvaluatorName,
    concept: Option<Concept>,
}

impl<'a> FaithfulnessEvaluator<'a> {
    pub fn new(ctx: EvalContext<'a>, name: EvaluatorName) -> Self {
        Self {
            ctx,
            name,
            concept: None,
        }
    }

    fn concept(&self) -> Result<&Concept> {
        self.concept
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No concept set, call update_concept first"))
    }

    /// Per-token effect `[b, T-1]` of `intervention` on `tokens`
    fn effect(&self, tokens: &Tensor, intervention: &Intervention) -> Result<Tensor> {
        let seq = tokens.dim(1)?;
        match self.name.variant.as_str() {
            "loss" => Ok(self.ctx.loss_diff(tokens, intervention)?.neg()?),
            "logit" => self
                .ctx
                .class_logit_diff(tokens, intervention, self.ctx.cfg.logit_class_idx),
            corr => Ok(self
                .ctx
                .logit_distribution_corr(tokens, intervention, self.ctx.cfg.logit_topk, corr)?
                .narrow(1, 0, seq - 1)?),
        }
    }

    /// Flattened `(effects, activations)` of one intervention over
    /// `eval_tokens`, in minibatches of `concept_eval_batchsize`
    pub fn effects(
        &self,
        eval_tokens: &Tensor,
        code: EvaluatorCode,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let concept = self.concept()?;
        let seq = eval_tokens.dim(1)?;
        anyhow::ensure!(seq > 1, "Need at least two tokens per row");

        let mut effects = Vec::new();
        let mut acts = Vec::new();
        for tokens in minibatches(eval_tokens, self.ctx.cfg.concept_eval_batchsize)? {
            let batch_acts = self.ctx.concept_activations(&tokens, concept)?;
            let (intervention, sign) = match code {
                EvaluatorCode::Replace => {
                    (Intervention::ReplaceWithConcept(concept.vector.clone()), 1.0)
                }
                EvaluatorCode::Ablation => (
                    Intervention::AblateConcept {
                        activations: batch_acts.clone(),
                        concept: concept.vector.clone(),
                    },
                    -1.0,
                ),
                other => anyhow::bail!("{} has no single intervention", other.as_str()),
            };
            let effect = (self.effect(&tokens, &intervention)? * sign)?;
            effects.extend(to_f64_vec(&effect)?);
            acts.extend(to_f64_vec(&batch_acts.narrow(1, 0, seq - 1)?)?);
        }
        debug!("{}: {} token effects", self.name, effects.len());
        Ok((effects, acts))
    }
}

impl ConceptEvaluator for FaithfulnessEvaluator<'_> {
    fn name(&self) -> &EvaluatorName {
        &self.name
    }

    fn update_concept(&mut self, concept: Concept) {
        self.concept = Some(concept);
    }

    fn evaluate(&mut self, eval_tokens: &Tensor, priors: &Priors) -> Result<MetricOutput> {
        let (effects, acts) = match (self.name.code, &priors.effects) {
            (EvaluatorCode::ReplaceAblation, Some(prior)) => prior.clone(),
            (EvaluatorCode::ReplaceAblation, None) => {
                let (replace, _) = self.effects(eval_tokens, EvaluatorCode::Replace)?;
                let (ablation, acts) = self.effects(eval_tokens, EvaluatorCode::Ablation)?;
                let sum = replace.iter().zip(&ablation).map(|(r, a)| r + a).collect();
                (sum, acts)
            }
            (code, _) => self.effects(eval_tokens, code)?,
        };

        let value = combine_effects(&self.ctx.cfg.return_type, &effects, &acts)?;
        info!(
            "Faithfulness Metric ({}, {}): {value:.4}",
            self.name, self.ctx.cfg.return_type
        );
        Ok(MetricOutput {
            value,
            effects: Some(effects),
            activations: Some(acts),
            topic: None,
        })
    }
}
