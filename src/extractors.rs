//! Concept extractors
//!
//! An extractor turns the hidden states at one hook point into a set of
//! concept vectors, each of length `act_size`, and defines how strongly a
//! concept is active at every token.
//!
//! # Checkpoint layout
//!
//! ```text
//! <dir>/extractor.json       ExtractorMeta
//! <dir>/concepts.safetensors extractor tensors ("concepts", or the autoencoder weights)
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use ndarray::Array2;
use tracing::{debug, info};

use crate::config::{Config, EXTRACTOR_CODES};
use crate::dataloader::TokenLoader;
use crate::extractor_ae::AutoEncoder;
use crate::extractor_conceptx::ConceptX;
use crate::extractor_neuron::Neuron;
use crate::extractor_tcav::Tcav;
use crate::hooks::HookPoint;
use crate::model::HookedModel;

pub const META_FILE: &str = "extractor.json";
pub const TENSORS_FILE: &str = "concepts.safetensors";

/// One concept vector and its index in the extractor
#[derive(Debug, Clone)]
pub struct Concept {
    pub idx: usize,
    /// `[act_size]`, F32
    pub vector: Tensor,
}

/// Metadata written next to the extractor tensors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorMeta {
    pub code: String,
    pub act_name: String,
    pub act_size: usize,
    pub n_concepts: usize,
}

pub trait ConceptExtractor {
    /// Extractor code (`ae`, `tcav`, `conceptx`, `neuron`)
    fn code(&self) -> &'static str;

    /// Hook point whose activations the concepts live in
    fn hook(&self) -> &HookPoint;

    /// Learn the concepts from the data behind `loader`
    fn extract_concepts(&mut self, model: &HookedModel, loader: &mut TokenLoader) -> Result<()>;

    /// All concepts, `[n_concepts, act_size]`
    fn concepts(&self) -> Result<Tensor>;

    fn n_concepts(&self) -> usize;

    /// Width of the hooked activations
    fn act_size(&self) -> usize;

    /// Activation of `concept` at each token given the hooked hidden states
    /// `[B, T, act_size]`; returns `[B, T]`.
    fn activations_from_hidden(&self, hidden: &Tensor, concept: &Concept) -> Result<Tensor>;

    /// Tensors to persist, keyed by name
    fn tensors(&self) -> Result<HashMap<String, Tensor>>;

    fn concept(&self, idx: usize) -> Result<Concept> {
        let n = self.n_concepts();
        anyhow::ensure!(idx < n, "Concept index {idx} out of range ({n} concepts)");
        let vector = self.concepts()?.i(idx)?.to_dtype(DType::F32)?;
        Ok(Concept { idx, vector })
    }

    /// Activation of `concept` on `tokens` (`[B, T]`)
    fn activations(&self, model: &HookedModel, tokens: &Tensor, concept: &Concept) -> Result<Tensor> {
        let hidden = model.hidden_states(tokens, self.hook())?;
        self.activations_from_hidden(&hidden, concept)
    }

    fn meta(&self) -> ExtractorMeta {
        ExtractorMeta {
            code: self.code().to_string(),
            act_name: self.hook().to_string(),
            act_size: self.act_size(),
            n_concepts: self.n_concepts(),
        }
    }

    fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let meta = self.meta();
        std::fs::write(dir.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;
        let tensors: HashMap<String, Tensor> = self
            .tensors()?
            .into_iter()
            .map(|(k, v)| Ok((k, v.to_device(&Device::Cpu)?.contiguous()?)))
            .collect::<Result<_>>()?;
        candle_core::safetensors::save(&tensors, dir.join(TENSORS_FILE))?;
        info!(
            "Saved {} extractor ({} concepts) to {}",
            meta.code,
            meta.n_concepts,
            dir.display()
        );
        Ok(())
    }
}

/// Projection of each hidden state on `vector`: `[B, T, d] -> [B, T]`
pub fn project(hidden: &Tensor, vector: &Tensor) -> Result<Tensor> {
    let (b, t, d) = hidden.dims3()?;
    anyhow::ensure!(
        vector.elem_count() == d,
        "Concept has {} entries, hidden states have {d}",
        vector.elem_count()
    );
    let v = vector
        .to_device(hidden.device())?
        .to_dtype(hidden.dtype())?
        .reshape((d, 1))?;
    Ok(hidden.reshape((b * t, d))?.matmul(&v)?.reshape((b, t))?)
}

/// Hidden states at `hook` for up to `max_rows` token positions, read batch
/// by batch from the start of `loader`; returns `[N, d]` on the CPU with the
/// token id of each row. The loader is left after the last batch read.
pub fn collect_hidden(
    model: &HookedModel,
    loader: &mut TokenLoader,
    hook: &HookPoint,
    max_rows: usize,
) -> Result<(Tensor, Vec<u32>)> {
    loader.reset();
    let mut parts = Vec::new();
    let mut ids = Vec::new();
    let mut have = 0;
    for _ in 0..loader.len() {
        if have >= max_rows {
            break;
        }
        let tokens = loader.pointer_batch()?;
        loader.advance();
        let hidden = model.hidden_states(&tokens, hook)?;
        let (b, t, d) = hidden.dims3()?;
        let take = (b * t).min(max_rows - have);
        parts.push(
            hidden
                .reshape((b * t, d))?
                .narrow(0, 0, take)?
                .to_device(&Device::Cpu)?,
        );
        let flat: Vec<u32> = tokens.flatten_all()?.to_vec1()?;
        ids.extend_from_slice(&flat[..take]);
        have += take;
    }
    anyhow::ensure!(!parts.is_empty(), "No hidden states collected");
    debug!("Collected {have} hidden states at {hook}");
    Ok((Tensor::cat(&parts, 0)?, ids))
}

/// `[N, d]` tensor as an f64 array
pub fn to_array2(t: &Tensor) -> Result<Array2<f64>> {
    let (n, d) = t.dims2()?;
    let flat: Vec<f32> = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    Ok(Array2::from_shape_vec(
        (n, d),
        flat.into_iter().map(f64::from).collect(),
    )?)
}

/// Read a checkpoint directory, checking it holds a `code` extractor
pub fn read_checkpoint(
    dir: &Path,
    code: &str,
    device: &Device,
) -> Result<(ExtractorMeta, HashMap<String, Tensor>)> {
    let meta_path = dir.join(META_FILE);
    let meta: ExtractorMeta = serde_json::from_str(
        &std::fs::read_to_string(&meta_path)
            .with_context(|| format!("Failed to read {}", meta_path.display()))?,
    )
    .with_context(|| format!("Failed to parse {}", meta_path.display()))?;
    anyhow::ensure!(
        meta.code == code,
        "{} holds a '{}' extractor, expected '{code}'",
        dir.display(),
        meta.code
    );
    let tensors = candle_core::safetensors::load(dir.join(TENSORS_FILE), device)
        .with_context(|| format!("Failed to load tensors from {}", dir.display()))?;
    Ok((meta, tensors))
}

pub fn take_tensor(tensors: &mut HashMap<String, Tensor>, name: &str) -> Result<Tensor> {
    tensors
        .remove(name)
        .ok_or_else(|| anyhow::anyhow!("Checkpoint has no '{name}' tensor"))
}

fn check_code(code: &str) -> Result<()> {
    anyhow::ensure!(
        EXTRACTOR_CODES.contains(&code),
        "Unknown extractor '{code}', choose from {EXTRACTOR_CODES:?}"
    );
    Ok(())
}

/// Load a saved extractor of kind `code` from `dir`
pub fn load_extractor(
    code: &str,
    dir: &Path,
    cfg: &Config,
    device: &Device,
) -> Result<Box<dyn ConceptExtractor>> {
    check_code(code)?;
    info!("Loading {code} extractor from {}", dir.display());
    let extractor: Box<dyn ConceptExtractor> = match code {
        "ae" => Box::new(AutoEncoder::load(dir, cfg, device)?),
        "tcav" => Box::new(Tcav::load(dir, cfg, device)?),
        "conceptx" => Box::new(ConceptX::load(dir, cfg, device)?),
        _ => Box::new(Neuron::load(dir, cfg, device)?),
    };
    Ok(extractor)
}

/// Fresh extractor for `cfg.extractor`; `process_cfg` must have run
pub fn extractor_factory(cfg: &Config, device: &Device) -> Result<Box<dyn ConceptExtractor>> {
    check_code(&cfg.extractor)?;
    let extractor: Box<dyn ConceptExtractor> = match cfg.extractor.as_str() {
        "ae" => Box::new(AutoEncoder::new(cfg, device)?),
        "tcav" => Box::new(Tcav::new(cfg)?),
        "conceptx" => Box::new(ConceptX::new(cfg)?),
        _ => Box::new(Neuron::new(cfg, device)?),
    };
    Ok(extractor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project() {
        let hidden = Tensor::new(&[[[1f32, 0.0], [0.0, 2.0], [3.0, 4.0]]], &Device::Cpu).unwrap();
        let v = Tensor::new(&[1f32, 1.0], &Device::Cpu).unwrap();
        let acts: Vec<Vec<f32>> = project(&hidden, &v).unwrap().to_vec2().unwrap();
        assert_eq!(acts, vec![vec![1.0, 2.0, 7.0]]);
    }

    #[test]
    fn test_project_width_mismatch() {
        let hidden = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let v = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        assert!(project(&hidden, &v).is_err());
    }

    #[test]
    fn test_unknown_extractor_code() {
        let cfg = Config {
            extractor: "pca".into(),
            ..Config::default()
        };
        assert!(extractor_factory(&cfg, &Device::Cpu).is_err());
    }
}
