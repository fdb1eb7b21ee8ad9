//! Pipeline runner
//!
//! Coordinates dataset loading, concept extraction, the critical-token sweep
//! and the optional metric evaluation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::config::{process_cfg, Config};
use crate::critical_tokens::CriticalTokens;
use crate::dataloader::TokenLoader;
use crate::dataset::{dataset_factory, TokenDataset};
use crate::evaluators::{evaluator_factory, EvalContext, MetricOutput, Priors};
use crate::extractors::{extractor_factory, load_extractor, ConceptExtractor};
use crate::metric_evaluators::{metric_evaluator_factory, MetricReport};
use crate::model::HookedModel;

pub const SUMMARY_FILE: &str = "run_summary.json";

/// What a run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub model: String,
    pub extractor: String,
    pub act_name: String,
    pub n_concepts: usize,
    pub concept_idx: usize,
    pub critical_tokens: CriticalTokens,
    /// `cfg.evaluator` on `concept_idx`
    pub evaluator: String,
    pub evaluation: MetricOutput,
    pub metric_report: Option<MetricReport>,
}

/// Main pipeline runner
pub struct Pipeline {
    cfg: Config,
    model: HookedModel,
}

impl Pipeline {
    /// Fill the model-derived config keys and validate the result
    pub fn new(mut cfg: Config, model: HookedModel) -> Result<Self> {
        process_cfg(&mut cfg, &model)?;
        cfg.validate()?;
        Ok(Self { cfg, model })
    }

    /// Load the configured model, then [`Self::new`]
    pub fn load(cfg: Config) -> Result<Self> {
        let model = HookedModel::load(&cfg)?;
        info!(
            "Loaded model: {} layers, d_model {}",
            model.n_layers(),
            model.d_model()
        );
        Self::new(cfg, model)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn model(&self) -> &HookedModel {
        &self.model
    }

    /// Run on the configured dataset and save the summary
    pub fn run(&self) -> Result<RunSummary> {
        let dataset = dataset_factory(&self.cfg, &self.model)?;
        info!("Dataset: {} rows x {} tokens", dataset.len(), dataset.seq_len());
        let summary = self.run_with_dataset(&dataset)?;
        self.save_summary(&summary)?;
        Ok(summary)
    }

    fn extractor(&self, loader: &mut TokenLoader) -> Result<Box<dyn ConceptExtractor>> {
        let cfg = &self.cfg;
        if cfg.load_extractor {
            info!("Loading extractor...");
            return load_extractor(
                &cfg.extractor,
                Path::new(&cfg.load_path),
                cfg,
                self.model.device(),
            );
        }
        info!("Extracting concepts...");
        let mut extractor = extractor_factory(cfg, self.model.device())?;
        extractor.extract_concepts(&self.model, loader)?;
        extractor.save(&Path::new(&cfg.output_dir).join(extractor.code()))?;
        Ok(extractor)
    }

    /// Extract (or load) concepts from `dataset` and evaluate them
    pub fn run_with_dataset(&self, dataset: &TokenDataset) -> Result<RunSummary> {
        let cfg = &self.cfg;
        let mut loader =
            TokenLoader::new(dataset, cfg.model_batch_size, cfg.metric_eval_batchsize)?;

        let extractor = self.extractor(&mut loader)?;
        info!(
            "{} concepts of width {} at {}",
            extractor.n_concepts(),
            extractor.act_size(),
            extractor.hook()
        );
        info!("Concept vectors: {}", extractor.concepts()?);

        let ctx = EvalContext::new(cfg, &self.model, extractor.as_ref());
        let eval_tokens = loader.processed_batch()?;
        let concept = extractor.concept(cfg.concept_idx)?;
        let critical_tokens = ctx.most_critical_tokens(&eval_tokens, &concept)?;

        let mut evaluator = evaluator_factory(&cfg.evaluator, ctx.clone())?;
        evaluator.update_concept(concept);
        let priors = Priors {
            topic: Some(critical_tokens.clone()),
            effects: None,
        };
        let evaluation = evaluator.evaluate(&eval_tokens, &priors)?;

        let metric_report = if cfg.run_metric_eval {
            let mut evaluators = cfg
                .evaluators
                .iter()
                .map(|name| evaluator_factory(name, ctx.clone()))
                .collect::<Result<Vec<_>>>()?;
            let concepts = cfg
                .concept_idxs
                .iter()
                .map(|&idx| extractor.concept(idx))
                .collect::<Result<Vec<_>>>()?;
            let mut metric = metric_evaluator_factory(cfg)?;
            info!(
                "Running {} over {} evaluators and {} concepts",
                metric.code(),
                evaluators.len(),
                concepts.len()
            );
            Some(metric.evaluate(&eval_tokens, &mut evaluators, &concepts)?)
        } else {
            None
        };

        Ok(RunSummary {
            model: cfg.model_to_interpret.clone(),
            extractor: extractor.code().to_string(),
            act_name: extractor.hook().to_string(),
            n_concepts: extractor.n_concepts(),
            concept_idx: cfg.concept_idx,
            critical_tokens,
            evaluator: evaluator.name().to_string(),
            evaluation,
            metric_report,
        })
    }

    /// Write `summary` as JSON into `output_dir`
    pub fn save_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let dir = PathBuf::from(&self.cfg.output_dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(SUMMARY_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(summary)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Summary saved to {}", path.display());
        Ok(path)
    }
}
