//! Input topic coherence
//!
//! The critical tokens of a concept should form a topic: they should occur
//! together in the evaluation corpus (`uci`, `umass`) or sit close together
//! in embedding space (`silhouette`).

use anyhow::Result;
use candle_core::Tensor;
use tracing::info;

use crate::coherence::{pmi_coherence, PairMask};
use crate::evaluators::{ConceptEvaluator, EvalContext, EvaluatorName, MetricOutput, Priors};
use crate::extractors::Concept;

/// Token text of undecodable byte fragments
const REPLACEMENT_CHAR: &str = "\u{fffd}";

pub struct ItcEvaluator<'a> {
    ctx: EvalContext<'a>,
    name: EvaluatorName,
    concept: Option<Concept>,
}

impl<'a> ItcEvaluator<'a> {
    pub fn new(ctx: EvalContext<'a>, name: EvaluatorName) -> Self {
        Self {
            ctx,
            name,
            concept: None,
        }
    }

    /// Switch between `uci`, `umass` and `silhouette`
    pub fn update_pmi_type(&mut self, pmi_type: &str) -> Result<()> {
        self.name = self.name.with_variant(pmi_type)?;
        Ok(())
    }

    /// Coherence of a topic given as critical tokens and their ids
    pub fn score_topic(
        &self,
        eval_tokens: &Tensor,
        tokens: &[String],
        ids: &[u32],
    ) -> Result<f64> {
        let (mut tokens, mut ids): (Vec<String>, Vec<u32>) = tokens
            .iter()
            .zip(ids)
            .filter(|(t, _)| t.as_str() != REPLACEMENT_CHAR)
            .map(|(t, &id)| (t.clone(), id))
            .unzip();
        if tokens.len() == 1 {
            tokens.push(tokens[0].clone());
            ids.push(ids[0]);
        }

        match self.name.variant.as_str() {
            "silhouette" => {
                let (best_num, best_score) = self.ctx.silhouette_score(&ids)?;
                Ok(best_score / best_num)
            }
            pmi_type => {
                if tokens.is_empty() {
                    return Ok(crate::coherence::EMPTY_TOPIC_SCORE);
                }
                let sentences = self.ctx.sentences(eval_tokens)?;
                pmi_coherence(&sentences, &tokens, pmi_type, PairMask::Upper)
            }
        }
    }
}

impl ConceptEvaluator for ItcEvaluator<'_> {
    fn name(&self) -> &EvaluatorName {
        &self.name
    }

    fn update_concept(&mut self, concept: Concept) {
        self.concept = Some(concept);
    }

    fn evaluate(&mut self, eval_tokens: &Tensor, priors: &Priors) -> Result<MetricOutput> {
        let concept = self
            .concept
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No concept set, call update_concept first"))?;
        let topic = match &priors.topic {
            Some(topic) => topic.clone(),
            None => self.ctx.most_critical_tokens(eval_tokens, concept)?,
        };
        let value = self.score_topic(eval_tokens, &topic.tokens, &topic.ids)?;
        info!(
            "Input Topic Coherence Metric ({}): {value:.4}",
            self.name.variant
        );
        Ok(MetricOutput {
            value,
            topic: Some(topic),
            ..MetricOutput::default()
        })
    }
}
