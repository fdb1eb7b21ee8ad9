//! Hook points, interventions and captured activations
//!
//! A forward pass takes a [`HookSpec`] naming the hook points to capture and
//! the interventions to apply, and returns a [`HookCache`] with the output
//! logits plus every captured tensor. Hook names follow the
//! `blocks.{layer}.hook_resid_post` convention so configs written for other
//! interpretability tooling can be reused verbatim.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Tensor, D};

/// Named location in a forward pass
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Token embedding (plus positional embedding where the model has one)
    Embed,
    /// Residual stream entering layer `i`
    ResidPre(usize),
    /// Attention block output of layer `i`
    AttnOut(usize),
    /// Residual stream between attention and MLP of layer `i`
    ResidMid(usize),
    /// MLP pre-activation of layer `i`
    MlpPre(usize),
    /// MLP post-activation (the neurons) of layer `i`
    MlpPost(usize),
    /// MLP output of layer `i`
    MlpOut(usize),
    /// Residual stream leaving layer `i`
    ResidPost(usize),
    /// After the final norm
    FinalNorm,
}

impl HookPoint {
    /// Layer the hook point belongs to, if any
    pub fn layer(&self) -> Option<usize> {
        match self {
            Self::Embed | Self::FinalNorm => None,
            Self::ResidPre(i)
            | Self::AttnOut(i)
            | Self::ResidMid(i)
            | Self::MlpPre(i)
            | Self::MlpPost(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpPre(i) => write!(f, "blocks.{i}.mlp.hook_pre"),
            Self::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "hook_final_norm"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hook_embed" => return Ok(Self::Embed),
            "hook_final_norm" | "ln_final.hook_normalized" => return Ok(Self::FinalNorm),
            _ => {}
        }

        let parsed = s.strip_prefix("blocks.").and_then(|rest| {
            let (layer, suffix) = rest.split_once('.')?;
            let layer: usize = layer.parse().ok()?;
            match suffix {
                "hook_resid_pre" => Some(Self::ResidPre(layer)),
                "hook_attn_out" => Some(Self::AttnOut(layer)),
                "hook_resid_mid" => Some(Self::ResidMid(layer)),
                "mlp.hook_pre" => Some(Self::MlpPre(layer)),
                "mlp.hook_post" => Some(Self::MlpPost(layer)),
                "hook_mlp_out" => Some(Self::MlpOut(layer)),
                "hook_resid_post" => Some(Self::ResidPost(layer)),
                _ => None,
            }
        });

        parsed.ok_or_else(|| anyhow::anyhow!("Unknown hook point '{s}'"))
    }
}

/// A modification applied to the activation at a hook point
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Replace the activation with the given tensor (broadcast to its shape)
    Replace(Tensor),
    /// Add a vector to every position
    Add(Tensor),
    /// Multiply by a constant
    Scale(f64),
    /// Zero the activation
    Zero,
    /// Remove a concept's contribution: `h - a ⊗ c` where `a` holds one
    /// activation per token (`[batch, seq]`) and `c` is the concept (`[d]`)
    AblateConcept {
        activations: Tensor,
        concept: Tensor,
    },
    /// Replace every position by the concept, renormalised to the position's
    /// own mean and standard deviation over the hidden dimension
    ReplaceWithConcept(Tensor),
}

/// Apply a single intervention to `[batch, seq, d]` activations.
pub fn apply_intervention(hidden: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    let dtype = hidden.dtype();
    match intervention {
        Intervention::Replace(t) => Ok(t.to_dtype(dtype)?.broadcast_as(hidden.shape())?.contiguous()?),
        Intervention::Add(t) => Ok(hidden.broadcast_add(&t.to_dtype(dtype)?)?),
        Intervention::Scale(factor) => Ok((hidden * *factor)?),
        Intervention::Zero => Ok(hidden.zeros_like()?),
        Intervention::AblateConcept {
            activations,
            concept,
        } => {
            let (b, t, d) = hidden.dims3()?;
            let acts = activations.to_dtype(dtype)?.reshape((b * t, 1))?;
            let concept = concept.to_dtype(dtype)?.reshape((1, d))?;
            let contribution = acts.matmul(&concept)?.reshape((b, t, d))?;
            Ok((hidden - contribution)?)
        }
        Intervention::ReplaceWithConcept(concept) => {
            let h = hidden.to_dtype(DType::F32)?;
            let origin_mean = h.mean_keepdim(D::Minus1)?;
            let origin_std = std_keepdim(&h)?;

            let c = concept.to_dtype(DType::F32)?.flatten_all()?;
            let c_mean = c.mean_keepdim(D::Minus1)?;
            let c_std = std_keepdim(&c)?;
            let renormed = c.broadcast_sub(&c_mean)?.broadcast_div(&c_std)?;

            let out = renormed
                .reshape((1, 1, ()))?
                .broadcast_mul(&origin_std)?
                .broadcast_add(&origin_mean)?;
            Ok(out.to_dtype(dtype)?)
        }
    }
}

/// Unbiased standard deviation over the last dimension, keeping it
pub(crate) fn std_keepdim(x: &Tensor) -> Result<Tensor> {
    let n = x.dim(D::Minus1)?;
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let denom = n.saturating_sub(1).max(1) as f64;
    let var = (centered.sqr()?.sum_keepdim(D::Minus1)? / denom)?;
    Ok(var.sqrt()?)
}

/// Which activations to capture and which interventions to apply
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    captures: HashSet<HookPoint>,
    interventions: Vec<(HookPoint, Intervention)>,
    stop_at_layer: Option<usize>,
}

impl HookSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at `hook`
    pub fn capture(&mut self, hook: HookPoint) -> &mut Self {
        self.captures.insert(hook);
        self
    }

    /// Register an intervention at `hook`
    pub fn intervene(&mut self, hook: HookPoint, intervention: Intervention) -> &mut Self {
        self.interventions.push((hook, intervention));
        self
    }

    /// Stop the forward pass before layer `layer` runs.
    ///
    /// The returned cache's output is then the residual stream entering
    /// `layer` instead of logits.
    pub fn stop_at_layer(&mut self, layer: usize) -> &mut Self {
        self.stop_at_layer = Some(layer);
        self
    }

    pub fn stop_layer(&self) -> Option<usize> {
        self.stop_at_layer
    }

    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    pub fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty() && self.stop_at_layer.is_none()
    }

    /// Run the hook at `hook`: apply registered interventions in order, then
    /// store the result in `cache` if it was requested.
    pub fn apply(&self, hook: HookPoint, tensor: Tensor, cache: &mut HookCache) -> Result<Tensor> {
        let mut tensor = tensor;
        for (point, intervention) in &self.interventions {
            if *point == hook {
                tensor = apply_intervention(&tensor, intervention)?;
            }
        }
        if self.captures.contains(&hook) {
            cache.store(hook, tensor.clone());
        }
        Ok(tensor)
    }
}

/// Output of a hooked forward pass
#[derive(Debug)]
pub struct HookCache {
    output: Option<Tensor>,
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    pub fn new() -> Self {
        Self {
            output: None,
            captures: HashMap::new(),
        }
    }

    /// Logits, or the residual stream when the pass stopped early
    pub fn output(&self) -> Result<&Tensor> {
        self.output
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Forward pass produced no output"))
    }

    pub fn into_output(self) -> Result<Tensor> {
        self.output
            .ok_or_else(|| anyhow::anyhow!("Forward pass produced no output"))
    }

    pub fn set_output(&mut self, output: Tensor) {
        self.output = Some(output);
    }

    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Captured tensor, or an error naming the missing hook
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| anyhow::anyhow!("Hook point '{hook}' was not captured"))
    }

    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

impl Default for HookCache {
    fn default() -> Self {
        Self::new()
    }
}
