//! Neuron baseline: every unit of the hooked site is its own concept

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};

use crate::config::Config;
use crate::dataloader::TokenLoader;
use crate::extractors::{read_checkpoint, Concept, ConceptExtractor};
use crate::hooks::HookPoint;
use crate::model::HookedModel;

pub struct Neuron {
    hook: HookPoint,
    act_size: usize,
    device: Device,
}

impl Neuron {
    pub fn new(cfg: &Config, device: &Device) -> Result<Self> {
        Ok(Self {
            hook: cfg.hook_point()?,
            act_size: cfg.act_size()?,
            device: device.clone(),
        })
    }

    pub fn load(dir: &Path, _cfg: &Config, device: &Device) -> Result<Self> {
        let (meta, _) = read_checkpoint(dir, "neuron", device)?;
        Ok(Self {
            hook: meta.act_name.parse()?,
            act_size: meta.act_size,
            device: device.clone(),
        })
    }
}

impl ConceptExtractor for Neuron {
    fn code(&self) -> &'static str {
        "neuron"
    }

    fn hook(&self) -> &HookPoint {
        &self.hook
    }

    fn extract_concepts(&mut self, _model: &HookedModel, _loader: &mut TokenLoader) -> Result<()> {
        Ok(())
    }

    fn concepts(&self) -> Result<Tensor> {
        Ok(Tensor::eye(self.act_size, DType::F32, &self.device)?)
    }

    fn n_concepts(&self) -> usize {
        self.act_size
    }

    fn act_size(&self) -> usize {
        self.act_size
    }

    fn concept(&self, idx: usize) -> Result<Concept> {
        anyhow::ensure!(
            idx < self.act_size,
            "Neuron {idx} out of range ({} neurons)",
            self.act_size
        );
        let mut one_hot = vec![0f32; self.act_size];
        one_hot[idx] = 1.0;
        Ok(Concept {
            idx,
            vector: Tensor::from_vec(one_hot, self.act_size, &self.device)?,
        })
    }

    fn activations_from_hidden(&self, hidden: &Tensor, concept: &Concept) -> Result<Tensor> {
        Ok(hidden.i((.., .., concept.idx))?.contiguous()?)
    }

    fn tensors(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::new())
    }
}
