//! GPT-2 forward pass with hook points
//!
//! Learned absolute position embeddings, pre-LayerNorm blocks, Conv1D
//! projections (weights stored `[in, out]`), tanh-approximated GELU and an
//! unembedding tied to the token embedding.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, Embedding, Init, VarBuilder};
use tracing::info;

use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::masks::create_causal_mask;
use crate::model::HookedBackend;
use crate::norm::LayerNorm;

/// Subset of the HuggingFace `config.json` for GPT-2
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_positions: usize,
    pub vocab_size: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub n_inner: Option<usize>,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    pub fn d_mlp(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }
}

const WEIGHT_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.02,
};

/// `y = x W + b` with `W` stored `[in, out]`
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn load(n_in: usize, n_out: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((n_in, n_out), "weight", WEIGHT_INIT)?;
        let bias = vb.get_with_hints(n_out, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

struct Attention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        Ok(Self {
            c_attn: Conv1D::load(config.n_embd, 3 * config.n_embd, vb.pp("c_attn"))?,
            c_proj: Conv1D::load(config.n_embd, config.n_embd, vb.pp("c_proj"))?,
            n_head: config.n_head,
            head_dim: config.n_embd / config.n_head,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, seq_len, d) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;

        let split = |offset: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(2, offset, d)?
                .reshape((b, seq_len, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let k = split(d)?;
        let v = split(2 * d)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let mask = create_causal_mask(seq_len, x.device(), scores.dtype())?;
        let scores = scores.broadcast_add(&mask)?;
        let pattern = candle_nn::ops::softmax(&scores, candle_core::D::Minus1)?;

        let z = pattern
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, d))?;
        self.c_proj.forward(&z)
    }
}

struct Mlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        Ok(Self {
            c_fc: Conv1D::load(config.n_embd, config.d_mlp(), vb.pp("c_fc"))?,
            c_proj: Conv1D::load(config.d_mlp(), config.n_embd, vb.pp("c_proj"))?,
        })
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            ln_1: LayerNorm::load(config.n_embd, eps, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_2: LayerNorm::load(config.n_embd, eps, vb.pp("ln_2"))?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
        })
    }

    fn forward(
        &self,
        layer: usize,
        resid_pre: Tensor,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let resid_pre = hooks.apply(HookPoint::ResidPre(layer), resid_pre, cache)?;

        let attn_out = self.attn.forward(&self.ln_1.forward(&resid_pre)?)?;
        let attn_out = hooks.apply(HookPoint::AttnOut(layer), attn_out, cache)?;
        let resid_mid = (&resid_pre + attn_out)?;
        let resid_mid = hooks.apply(HookPoint::ResidMid(layer), resid_mid, cache)?;

        let pre = self.mlp.c_fc.forward(&self.ln_2.forward(&resid_mid)?)?;
        let pre = hooks.apply(HookPoint::MlpPre(layer), pre, cache)?;
        let post = hooks.apply(HookPoint::MlpPost(layer), pre.gelu()?, cache)?;
        let mlp_out = self.mlp.c_proj.forward(&post)?;
        let mlp_out = hooks.apply(HookPoint::MlpOut(layer), mlp_out, cache)?;

        let resid_post = (&resid_mid + mlp_out)?;
        hooks.apply(HookPoint::ResidPost(layer), resid_post, cache)
    }
}

/// GPT-2 with TransformerLens-style hook points
pub struct HookedGpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    config: Gpt2Config,
}

impl HookedGpt2 {
    /// Build from a VarBuilder rooted at the checkpoint.
    ///
    /// Accepts both the bare layout (`wte.weight`, `h.0...`) of the
    /// `openai-community/gpt2` safetensors and the `transformer.`-prefixed
    /// layout of `GPT2LMHeadModel` exports.
    pub fn load(vb: VarBuilder, config: Gpt2Config) -> Result<Self> {
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::load(vb.pp(format!("h.{i}")), &config)?);
        }
        let ln_f = LayerNorm::load(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        info!(
            "GPT-2 loaded: {} layers, d_model={}, d_mlp={}",
            config.n_layer,
            config.n_embd,
            config.d_mlp()
        );

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            config,
        })
    }

    /// Convenience for loading from weight files on disk
    pub fn from_files(
        config: Gpt2Config,
        weights: &[std::path::PathBuf],
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights, dtype, device)? };
        Self::load(vb, config)
    }
}

impl HookedBackend for HookedGpt2 {
    fn n_layers(&self) -> usize {
        self.config.n_layer
    }

    fn d_model(&self) -> usize {
        self.config.n_embd
    }

    fn d_mlp(&self) -> usize {
        self.config.d_mlp()
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let mut cache = HookCache::new();
        let (_b, seq_len) = input_ids.dims2()?;
        anyhow::ensure!(
            seq_len <= self.config.n_positions,
            "Sequence length {seq_len} exceeds n_positions {}",
            self.config.n_positions
        );

        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let embed = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;
        let mut hidden = hooks.apply(HookPoint::Embed, embed, &mut cache)?;

        for (i, block) in self.blocks.iter().enumerate() {
            if hooks.stop_layer() == Some(i) {
                cache.set_output(hidden);
                return Ok(cache);
            }
            hidden = block.forward(i, hidden, hooks, &mut cache)?;
        }
        if hooks.stop_layer().is_some() {
            cache.set_output(hidden);
            return Ok(cache);
        }

        let normed = hooks.apply(HookPoint::FinalNorm, self.ln_f.forward(&hidden)?, &mut cache)?;
        let logits = normed.broadcast_matmul(&self.wte.embeddings().t()?)?;
        cache.set_output(logits);
        Ok(cache)
    }

    fn embedding_matrix(&self) -> Tensor {
        self.wte.embeddings().clone()
    }
}
