//! Concept evaluators
//!
//! [`EvalContext`] bundles the config, the interpreted model and the
//! extractor, and provides the measurements every evaluator is built from:
//! loss and logit differences under an intervention, gradients at the hook
//! point, output-distribution agreement, and preferred predictions. Topic
//! coherence lives in [`crate::coherence`] and the perturbation sweep in
//! [`crate::critical_tokens`].
//!
//! Evaluators are named `<code>[-<variant>]`, e.g. `itc-umass`,
//! `replace-ablation-KL_div` or `gradient-logit`.

use std::fmt;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, Var, D};
use serde::Serialize;

use crate::config::Config;
use crate::critical_tokens::CriticalTokens;
use crate::evaluator_faithfulness::FaithfulnessEvaluator;
use crate::evaluator_gradient::GradientEvaluator;
use crate::evaluator_itc::ItcEvaluator;
use crate::evaluator_otc::OtcEvaluator;
use crate::extractors::{Concept, ConceptExtractor};
use crate::hooks::{apply_intervention, HookPoint, Intervention};
use crate::model::{loss_per_token_from_logits, HookedModel};

pub const CORR_FUNCS: [&str; 3] = ["pearson", "KL_div", "openai_var"];
pub const ITC_VARIANTS: [&str; 3] = ["uci", "umass", "silhouette"];
pub const OTC_VARIANTS: [&str; 4] = ["uci", "umass", "emb_dist", "emb_cos"];
pub const FAITHFULNESS_VARIANTS: [&str; 5] = ["loss", "logit", "pearson", "KL_div", "openai_var"];
pub const GRADIENT_VARIANTS: [&str; 2] = ["loss", "logit"];

/// Evaluator family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvaluatorCode {
    Itc,
    Otc,
    Replace,
    Ablation,
    ReplaceAblation,
    Gradient,
}

impl EvaluatorCode {
    /// Longest code first so `replace-ablation` wins over `replace`
    const PARSE_ORDER: [EvaluatorCode; 6] = [
        EvaluatorCode::ReplaceAblation,
        EvaluatorCode::Replace,
        EvaluatorCode::Ablation,
        EvaluatorCode::Gradient,
        EvaluatorCode::Itc,
        EvaluatorCode::Otc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Itc => "itc",
            Self::Otc => "otc",
            Self::Replace => "replace",
            Self::Ablation => "ablation",
            Self::ReplaceAblation => "replace-ablation",
            Self::Gradient => "gradient",
        }
    }

    pub fn default_variant(&self) -> &'static str {
        match self {
            Self::Itc => "uci",
            Self::Otc => "emb_cos",
            Self::Replace | Self::Ablation | Self::ReplaceAblation | Self::Gradient => "loss",
        }
    }

    pub fn variants(&self) -> &'static [&'static str] {
        match self {
            Self::Itc => &ITC_VARIANTS,
            Self::Otc => &OTC_VARIANTS,
            Self::Replace | Self::Ablation | Self::ReplaceAblation => &FAITHFULNESS_VARIANTS,
            Self::Gradient => &GRADIENT_VARIANTS,
        }
    }
}

/// Parsed `<code>[-<variant>]` evaluator name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EvaluatorName {
    pub code: EvaluatorCode,
    pub variant: String,
}

impl EvaluatorName {
    pub fn parse(name: &str) -> Result<Self> {
        for code in EvaluatorCode::PARSE_ORDER {
            let variant = if name == code.as_str() {
                code.default_variant()
            } else if let Some(rest) = name
                .strip_prefix(code.as_str())
                .and_then(|rest| rest.strip_prefix('-'))
            {
                rest
            } else {
                continue;
            };
            anyhow::ensure!(
                code.variants().contains(&variant),
                "Unsupported variant '{variant}' for {}, choose from {:?}",
                code.as_str(),
                code.variants()
            );
            return Ok(Self {
                code,
                variant: variant.to_string(),
            });
        }
        let codes: Vec<&str> = EvaluatorCode::PARSE_ORDER.iter().map(|c| c.as_str()).collect();
        anyhow::bail!("Unknown evaluator '{name}', choose from {codes:?}")
    }

    /// Same family with another variant
    pub fn with_variant(&self, variant: &str) -> Result<Self> {
        Self::parse(&format!("{}-{variant}", self.code.as_str()))
    }
}

impl fmt::Display for EvaluatorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.code.as_str(), self.variant)
    }
}

/// What an evaluation produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricOutput {
    pub value: f64,
    /// Per-token effects, for the faithfulness evaluators
    pub effects: Option<Vec<f64>>,
    /// Concept activations aligned with `effects`
    pub activations: Option<Vec<f64>>,
    /// Critical tokens, for input topic coherence
    pub topic: Option<CriticalTokens>,
}

/// Results of earlier evaluations an evaluator may reuse
#[derive(Debug, Clone, Default)]
pub struct Priors {
    pub topic: Option<CriticalTokens>,
    /// `(effects, activations)`
    pub effects: Option<(Vec<f64>, Vec<f64>)>,
}

pub trait ConceptEvaluator {
    fn name(&self) -> &EvaluatorName;

    fn code(&self) -> &'static str {
        self.name().code.as_str()
    }

    fn update_concept(&mut self, concept: Concept);

    /// Score the current concept on `eval_tokens` (`[B, T]`)
    fn evaluate(&mut self, eval_tokens: &Tensor, priors: &Priors) -> Result<MetricOutput>;
}

/// Build the evaluator called `name`
pub fn evaluator_factory<'a>(
    name: &str,
    ctx: EvalContext<'a>,
) -> Result<Box<dyn ConceptEvaluator + 'a>> {
    let name = EvaluatorName::parse(name)?;
    let evaluator: Box<dyn ConceptEvaluator + 'a> = match name.code {
        EvaluatorCode::Itc => Box::new(ItcEvaluator::new(ctx, name)),
        EvaluatorCode::Otc => Box::new(OtcEvaluator::new(ctx, name)),
        EvaluatorCode::Replace | EvaluatorCode::Ablation | EvaluatorCode::ReplaceAblation => {
            Box::new(FaithfulnessEvaluator::new(ctx, name))
        }
        EvaluatorCode::Gradient => Box::new(GradientEvaluator::new(ctx, name)),
    };
    Ok(evaluator)
}

/// Config, model and extractor shared by the evaluators
#[derive(Clone)]
pub struct EvalContext<'a> {
    pub cfg: &'a Config,
    pub model: &'a HookedModel,
    pub extractor: &'a dyn ConceptExtractor,
    pub hook: HookPoint,
}

impl<'a> EvalContext<'a> {
    pub fn new(cfg: &'a Config, model: &'a HookedModel, extractor: &'a dyn ConceptExtractor) -> Self {
        Self {
            cfg,
            model,
            extractor,
            hook: extractor.hook().clone(),
        }
    }

    /// Activations at the extractor's hook point, `[B, T, act_size]`
    pub fn hidden_states(&self, tokens: &Tensor) -> Result<Tensor> {
        self.model.hidden_states(tokens, &self.hook)
    }

    /// Activation of `concept` at each token, `[B, T]`
    pub fn concept_activations(&self, tokens: &Tensor, concept: &Concept) -> Result<Tensor> {
        Ok(self
            .extractor
            .activations(self.model, tokens, concept)?
            .to_dtype(DType::F32)?)
    }

    fn logits(&self, tokens: &Tensor, intervention: Option<&Intervention>) -> Result<Tensor> {
        let hooks: Vec<(HookPoint, Intervention)> = intervention
            .map(|i| vec![(self.hook.clone(), i.clone())])
            .unwrap_or_default();
        Ok(self.model.run_with_hooks(tokens, &hooks)?.to_dtype(DType::F32)?)
    }

    /// Per-token loss under `intervention` minus the clean loss, `[B, T-1]`
    pub fn loss_diff(&self, tokens: &Tensor, intervention: &Intervention) -> Result<Tensor> {
        let tokens = tokens.to_device(self.model.device())?;
        let clean = loss_per_token_from_logits(&self.logits(&tokens, None)?, &tokens)?;
        let disturbed =
            loss_per_token_from_logits(&self.logits(&tokens, Some(intervention))?, &tokens)?;
        Ok((disturbed - clean)?)
    }

    /// Index tensor `[B, T-1, 1]` picking the class logit at each position.
    ///
    /// `-1` is the clean argmax, `-2` the true next token, anything else a
    /// fixed vocabulary id.
    fn class_indices(&self, tokens: &Tensor, clean: &Tensor, class_idx: i64) -> Result<Tensor> {
        let (b, t, vocab) = clean.dims3()?;
        match class_idx {
            -1 => Ok(clean.argmax_keepdim(D::Minus1)?),
            -2 => Ok(tokens
                .i((.., 1..))?
                .to_dtype(DType::U32)?
                .contiguous()?
                .unsqueeze(D::Minus1)?),
            idx if idx >= 0 && (idx as usize) < vocab => Ok(Tensor::full(
                idx as u32,
                (b, t, 1),
                clean.device(),
            )?),
            idx => anyhow::bail!(
                "logit_class_idx {idx} out of range, use -1, -2 or an id below {vocab}"
            ),
        }
    }

    /// Class logit under `intervention` minus the clean one, `[B, T-1]`
    pub fn class_logit_diff(
        &self,
        tokens: &Tensor,
        intervention: &Intervention,
        class_idx: i64,
    ) -> Result<Tensor> {
        let tokens = tokens.to_device(self.model.device())?;
        let seq = tokens.dim(1)?;
        anyhow::ensure!(seq > 1, "Need at least two tokens per row");
        let clean = self.logits(&tokens, None)?.narrow(1, 0, seq - 1)?.contiguous()?;
        let disturbed = self
            .logits(&tokens, Some(intervention))?
            .narrow(1, 0, seq - 1)?
            .contiguous()?;
        let idx = self.class_indices(&tokens, &clean, class_idx)?;
        let clean = clean.gather(&idx, D::Minus1)?.squeeze(D::Minus1)?;
        let disturbed = disturbed.gather(&idx, D::Minus1)?.squeeze(D::Minus1)?;
        Ok((disturbed - clean)?)
    }

    /// Gradient of `objective(logits)` with respect to the hooked hidden
    /// states, optionally after applying `intervention` to them. Returns
    /// `(grad, hidden)`, both `[B, T, act_size]`.
    fn hook_gradient<F>(
        &self,
        tokens: &Tensor,
        intervention: Option<&Intervention>,
        objective: F,
    ) -> Result<(Tensor, Tensor)>
    where
        F: FnOnce(&Tensor, &Tensor) -> Result<Tensor>,
    {
        let tokens = tokens.to_device(self.model.device())?;
        let mut hidden = self.hidden_states(&tokens)?;
        if let Some(intervention) = intervention {
            hidden = apply_intervention(&hidden, intervention)?;
        }
        let var = Var::from_tensor(&hidden)?;
        let logits = self.model.run_with_hooks(
            &tokens,
            &[(self.hook.clone(), Intervention::Replace(var.as_tensor().clone()))],
        )?;
        let target = objective(&logits.to_dtype(DType::F32)?, &tokens)?;
        let grads = target.backward()?;
        let grad = grads
            .get(var.as_tensor())
            .context("No gradient reached the hook point")?
            .clone();
        Ok((grad, hidden))
    }

    /// Gradient of the mean next-token loss at the hook point
    pub fn loss_gradient(&self, tokens: &Tensor) -> Result<(Tensor, Tensor)> {
        self.hook_gradient(tokens, None, |logits, tokens| {
            Ok(loss_per_token_from_logits(logits, tokens)?.mean_all()?)
        })
    }

    /// Gradient of the summed class logit (see [`Self::class_logit_diff`]
    /// for `class_idx`) at the hook point
    pub fn class_logit_gradient(
        &self,
        tokens: &Tensor,
        class_idx: i64,
        intervention: Option<&Intervention>,
    ) -> Result<(Tensor, Tensor)> {
        self.hook_gradient(tokens, intervention, |logits, tokens| {
            let seq = logits.dim(1)?;
            let logits = logits.narrow(1, 0, seq - 1)?.contiguous()?;
            let idx = self.class_indices(tokens, &logits, class_idx)?;
            Ok(logits.gather(&idx, D::Minus1)?.sum_all()?)
        })
    }

    /// Agreement between the clean and disturbed next-token distributions at
    /// every position, `[B, T]`.
    ///
    /// With `topk` only the clean top-k logits (and the disturbed logits of
    /// the same tokens) are compared.
    pub fn logit_distribution_corr(
        &self,
        tokens: &Tensor,
        intervention: &Intervention,
        topk: Option<usize>,
        corr_func: &str,
    ) -> Result<Tensor> {
        anyhow::ensure!(
            CORR_FUNCS.contains(&corr_func),
            "Correlation type '{corr_func}' not supported, choose from {CORR_FUNCS:?}"
        );
        let origin = self.logits(tokens, None)?.to_device(&Device::Cpu)?;
        let disturbed = self
            .logits(tokens, Some(intervention))?
            .to_device(&Device::Cpu)?;

        let (origin, disturbed) = match topk {
            Some(k) => {
                let vocab = origin.dim(D::Minus1)?;
                anyhow::ensure!(k > 0 && k <= vocab, "logit_topk {k} not in 1..={vocab}");
                let idx = origin
                    .arg_sort_last_dim(false)?
                    .narrow(D::Minus1, 0, k)?
                    .contiguous()?;
                (
                    origin.gather(&idx, D::Minus1)?,
                    disturbed.gather(&idx, D::Minus1)?,
                )
            }
            None => (origin, disturbed),
        };

        let p = (candle_nn::ops::softmax(&origin, D::Minus1)? + 1e-10)?;
        let q = (candle_nn::ops::softmax(&disturbed, D::Minus1)? + 1e-10)?;

        let corr = match corr_func {
            "pearson" => {
                let pc = p.broadcast_sub(&p.mean_keepdim(D::Minus1)?)?;
                let qc = q.broadcast_sub(&q.mean_keepdim(D::Minus1)?)?;
                let dot = (&pc * &qc)?.sum(D::Minus1)?;
                let norm = (pc.sqr()?.sum(D::Minus1)?.sqrt()? * qc.sqr()?.sum(D::Minus1)?.sqrt()?)?;
                dot.div(&(norm + 1e-8)?)?
            }
            "KL_div" => (&p * (p.log()? - q.log()?)?)?.sum(D::Minus1)?.neg()?,
            _ => {
                let n = p.dim(D::Minus1)?;
                anyhow::ensure!(n > 1, "openai_var needs at least two classes");
                let mse = (&q - &p)?.sqr()?.mean(D::Minus1)?;
                let centred = p.broadcast_sub(&p.mean_keepdim(D::Minus1)?)?;
                let var = (centred.sqr()?.sum(D::Minus1)? / (n - 1) as f64)?;
                (mse.div(&var)?.neg()? + 1.0)?
            }
        };
        Ok(corr)
    }

    /// Tokens the model predicts most when every position of the first rows
    /// is replaced by `concept`: the top `topic_len` logits of the first
    /// position of the first row, stripped and lowercased, with their ids.
    pub fn preferred_predictions(
        &self,
        tokens: &Tensor,
        concept: &Concept,
    ) -> Result<(Vec<String>, Vec<u32>)> {
        let rows = tokens.dim(0)?.min(2);
        let logits = self.logits(
            &tokens.narrow(0, 0, rows)?,
            Some(&Intervention::ReplaceWithConcept(concept.vector.clone())),
        )?;
        let first: Vec<f32> = logits.i((0, 0))?.to_vec1()?;

        let mut order: Vec<u32> = (0..first.len() as u32).collect();
        order.sort_by(|&a, &b| first[b as usize].total_cmp(&first[a as usize]));
        order.truncate(self.cfg.topic_len);

        let tokens = self
            .model
            .to_str_tokens(&order)?
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .collect();
        Ok((tokens, order))
    }

    /// Rows of the token embedding matrix for `ids`, `[n, d_model]`
    pub fn embeddings(&self, ids: &[u32]) -> Result<Tensor> {
        let idx = Tensor::new(ids, &Device::Cpu)?;
        Ok(self
            .model
            .embedding_matrix()
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .index_select(&idx, 0)?)
    }

    /// Decoded rows of `eval_tokens` without their first token, lowercased
    pub fn sentences(&self, eval_tokens: &Tensor) -> Result<Vec<String>> {
        Ok(self
            .model
            .to_string(&eval_tokens.i((.., 1..))?)?
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect())
    }
}

/// Split `[B, ...]` into chunks of at most `size` rows
pub fn minibatches(tokens: &Tensor, size: usize) -> Result<Vec<Tensor>> {
    anyhow::ensure!(size > 0, "Minibatch size must be positive");
    let rows = tokens.dim(0)?;
    let mut out = Vec::with_capacity(rows.div_ceil(size));
    let mut start = 0;
    while start < rows {
        let len = size.min(rows - start);
        out.push(tokens.narrow(0, start, len)?);
        start += len;
    }
    Ok(out)
}

/// Combine per-token effects with concept activations.
///
/// * `weighted`: activation-weighted mean effect, `sum(a * e) / sum(|a|)`
/// * `mean`: plain mean effect
/// * `corr`: Pearson correlation between activations and effects
pub fn combine_effects(return_type: &str, effects: &[f64], acts: &[f64]) -> Result<f64> {
    anyhow::ensure!(
        effects.len() == acts.len(),
        "{} effects for {} activations",
        effects.len(),
        acts.len()
    );
    anyhow::ensure!(!effects.is_empty(), "No effects to combine");
    match return_type {
        "weighted" => {
            let total: f64 = acts.iter().map(|a| a.abs()).sum();
            if total == 0.0 {
                return Ok(0.0);
            }
            Ok(acts.iter().zip(effects).map(|(a, e)| a * e).sum::<f64>() / total)
        }
        "mean" => Ok(crate::stats::mean(effects)),
        "corr" => Ok(crate::stats::pearson(acts, effects)?.r),
        other => anyhow::bail!(
            "Unknown return_type '{other}', choose from {:?}",
            crate::config::RETURN_TYPES
        ),
    }
}

/// Flatten a tensor into f64 values
pub fn to_f64_vec(t: &Tensor) -> Result<Vec<f64>> {
    let v: Vec<f32> = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    Ok(v.into_iter().map(f64::from).collect())
}
