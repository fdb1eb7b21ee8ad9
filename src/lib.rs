// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // HookedModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &usize for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! concept-eval: extraction and evaluation of concepts in transformer
//! language models
//!
//! Concepts are directions in the hidden activations at one hook point of
//! an interpreted model. Extractors learn them, evaluators score them, and
//! metric evaluators relate the scores of several evaluators to each other.
//!
//! ## Architecture
//!
//! - `config`: Run configuration, defaults, JSON file and flag overrides
//! - `model`: `HookedModel` wrapper with capture and intervention hooks
//! - `hooks`: Hook points, interventions and activation caches
//! - `forward_gpt2`: GPT-2 forward pass with hooks
//! - `forward_neox`: GPT-NeoX (Pythia) forward pass with hooks
//! - `forward_llama`: LLaMA-2 forward pass with hooks
//! - `masks`, `norm`, `rotary`: Shared transformer building blocks
//! - `dataset`: Tokenized fixed-length rows, cached as safetensors
//! - `dataloader`: Row batching and the autoencoder activation buffer
//! - `extractors`: `ConceptExtractor` trait, checkpoints and factory
//! - `extractor_ae`: Sparse autoencoder dictionary
//! - `extractor_tcav`: Linear probes on word lists (TCAV)
//! - `extractor_conceptx`: Ward clustering of token activations (ConceptX)
//! - `extractor_neuron`: Individual neurons as concepts
//! - `probe`: Logistic regression probes with linfa
//! - `evaluators`: `ConceptEvaluator` trait and shared measurements
//! - `critical_tokens`: Masking sweep for the tokens a concept depends on
//! - `coherence`: PMI and embedding topic coherence
//! - `evaluator_itc`, `evaluator_otc`: Input and output topic coherence
//! - `evaluator_faithfulness`: Replacement and ablation effects
//! - `evaluator_gradient`: Gradient faithfulness
//! - `metric_evaluators`: Validity relevance and reliability consistency
//! - `stats`: Pearson and Kendall correlation with p-values
//! - `cluster`: Ward, k-means and silhouette helpers
//! - `pipeline`: End-to-end runner used by the binary

pub mod cluster;
pub mod coherence;
pub mod config;
pub mod critical_tokens;
pub mod dataloader;
pub mod dataset;
pub mod evaluator_faithfulness;
pub mod evaluator_gradient;
pub mod evaluator_itc;
pub mod evaluator_otc;
pub mod evaluators;
pub mod extractor_ae;
pub mod extractor_conceptx;
pub mod extractor_neuron;
pub mod extractor_tcav;
pub mod extractors;
pub mod forward_gpt2;
pub mod forward_llama;
pub mod forward_neox;
pub mod hooks;
pub mod masks;
pub mod metric_evaluators;
pub mod model;
pub mod norm;
pub mod pipeline;
pub mod probe;
pub mod rotary;
pub mod stats;

pub use config::{process_cfg, Config, Site};
pub use critical_tokens::CriticalTokens;
pub use dataloader::{ActivationBuffer, TokenLoader};
pub use dataset::{dataset_factory, TokenDataset};
pub use evaluators::{
    evaluator_factory, ConceptEvaluator, EvalContext, EvaluatorCode, EvaluatorName, MetricOutput,
    Priors,
};
pub use extractors::{extractor_factory, load_extractor, Concept, ConceptExtractor};
pub use forward_gpt2::{Gpt2Config, HookedGpt2};
pub use forward_llama::{HookedLlama, LlamaConfig};
pub use forward_neox::{HookedNeox, NeoxConfig};
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention};
pub use masks::{clear_mask_caches, create_causal_mask};
pub use metric_evaluators::{metric_evaluator_factory, MetricEvaluator, MetricReport};
pub use model::{HookedBackend, HookedModel, ModelFiles, ModelKind};
pub use pipeline::{Pipeline, RunSummary};
pub use stats::Correlation;
