//! Output topic coherence
//!
//! Replacing the hidden states with a concept should push the model towards
//! a coherent set of predictions. The concept's preferred predictions are
//! scored by corpus PMI (`uci`, `umass`) or embedding similarity
//! (`emb_dist`, `emb_cos`).

use anyhow::Result;
use candle_core::Tensor;
use tracing::info;

use crate::evaluators::{ConceptEvaluator, EvalContext, EvaluatorName, MetricOutput, Priors};
use crate::extractors::Concept;

pub struct OtcEvaluator<'a> {
    ctx: EvalContext<'a>,
    name: EvaluatorName,
    concept: Option<Concept>,
}

impl<'a> OtcEvaluator<'a> {
    pub fn new(ctx: EvalContext<'a>, name: EvaluatorName) -> Self {
        Self {
            ctx,
            name,
            concept: None,
        }
    }

    pub fn update_pmi_type(&mut self, pmi_type: &str) -> Result<()> {
        self.name = self.name.with_variant(pmi_type)?;
        Ok(())
    }
}

impl ConceptEvaluator for OtcEvaluator<'_> {
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
        let (tokens, ids) = self.ctx.preferred_predictions(eval_tokens, concept)?;
        info!(
            "Preferred predictions of concept {}: {}",
            concept.idx,
            tokens
                .iter()
                .map(|t| format!("{t:?}"))
                .collect::<Vec<_>>()
                .join(" ")
        );

        let value = match self.name.variant.as_str() {
            pmi @ ("uci" | "umass") => self.ctx.topic_coherence(eval_tokens, &tokens, pmi)?,
            emb => self.ctx.embedding_topic_coherence(&ids, emb)?,
        };
        info!(
            "Output Topic Coherence Metric ({}): {value:.4}",
            self.name.variant
        );
        Ok(MetricOutput {
            value,
            ..MetricOutput::default()
        })
    }
}
