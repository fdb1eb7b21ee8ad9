//! GPT-NeoX (Pythia) forward pass with hook points
//!
//! Partial rotary embeddings (`rotary_pct` of each head), fused QKV laid out
//! per head, exact GELU, separate unembedding, and the parallel residual
//! `x + attn(ln1(x)) + mlp(ln2(x))` when `use_parallel_residual` is set.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, linear, linear_no_bias, Embedding, Linear, VarBuilder};
use tracing::info;

use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::masks::create_causal_mask;
use crate::model::HookedBackend;
use crate::norm::LayerNorm;
use crate::rotary::RotaryEmbedding;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NeoxConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rotary_pct")]
    pub rotary_pct: f64,
    #[serde(default = "default_rotary_emb_base")]
    pub rotary_emb_base: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_true")]
    pub use_parallel_residual: bool,
}

fn default_rotary_pct() -> f64 {
    0.25
}

fn default_rotary_emb_base() -> f64 {
    10_000.0
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_true() -> bool {
    true
}

impl NeoxConfig {
    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    fn rot_dims(&self) -> usize {
        (self.head_dim() as f64 * self.rotary_pct) as usize
    }
}

struct Attention {
    query_key_value: Linear,
    dense: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &NeoxConfig) -> Result<Self> {
        let h = config.hidden_size;
        Ok(Self {
            query_key_value: linear(h, 3 * h, vb.pp("query_key_value"))?,
            dense: linear(h, h, vb.pp("dense"))?,
            n_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (b, seq_len, d) = x.dims3()?;

        // [b, t, heads, 3 * head_dim], q/k/v interleaved per head
        let qkv = self
            .query_key_value
            .forward(x)?
            .reshape((b, seq_len, self.n_heads, 3 * self.head_dim))?;
        let part = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, i * self.head_dim, self.head_dim)?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let (q, k) = rotary.apply(&part(0)?, &part(1)?)?;
        let v = part(2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.contiguous()?.matmul(&k.t()?.contiguous()?)? * scale)?;
        let mask = create_causal_mask(seq_len, x.device(), scores.dtype())?;
        let pattern = candle_nn::ops::softmax(&scores.broadcast_add(&mask)?, D::Minus1)?;

        let z = pattern.matmul(&v)?.transpose(1, 2)?.reshape((b, seq_len, d))?;
        Ok(self.dense.forward(&z)?)
    }
}

struct Layer {
    input_layernorm: LayerNorm,
    post_attention_layernorm: LayerNorm,
    attention: Attention,
    dense_h_to_4h: Linear,
    dense_4h_to_h: Linear,
    parallel: bool,
}

impl Layer {
    fn load(vb: VarBuilder, config: &NeoxConfig) -> Result<Self> {
        let h = config.hidden_size;
        let eps = config.layer_norm_eps;
        Ok(Self {
            input_layernorm: LayerNorm::load(h, eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: LayerNorm::load(h, eps, vb.pp("post_attention_layernorm"))?,
            attention: Attention::load(vb.pp("attention"), config)?,
            dense_h_to_4h: linear(h, config.intermediate_size, vb.pp("mlp").pp("dense_h_to_4h"))?,
            dense_4h_to_h: linear(config.intermediate_size, h, vb.pp("mlp").pp("dense_4h_to_h"))?,
            parallel: config.use_parallel_residual,
        })
    }

    fn forward(
        &self,
        layer: usize,
        resid_pre: Tensor,
        rotary: &RotaryEmbedding,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let resid_pre = hooks.apply(HookPoint::ResidPre(layer), resid_pre, cache)?;

        let attn_out = self
            .attention
            .forward(&self.input_layernorm.forward(&resid_pre)?, rotary)?;
        let attn_out = hooks.apply(HookPoint::AttnOut(layer), attn_out, cache)?;
        let resid_mid = (&resid_pre + &attn_out)?;
        let resid_mid = hooks.apply(HookPoint::ResidMid(layer), resid_mid, cache)?;

        // Parallel residual: the MLP reads the block input, not resid_mid
        let mlp_in = if self.parallel {
            self.post_attention_layernorm.forward(&resid_pre)?
        } else {
            self.post_attention_layernorm.forward(&resid_mid)?
        };
        let pre = hooks.apply(HookPoint::MlpPre(layer), self.dense_h_to_4h.forward(&mlp_in)?, cache)?;
        let post = hooks.apply(HookPoint::MlpPost(layer), pre.gelu_erf()?, cache)?;
        let mlp_out = hooks.apply(HookPoint::MlpOut(layer), self.dense_4h_to_h.forward(&post)?, cache)?;

        let resid_post = (&resid_mid + mlp_out)?;
        hooks.apply(HookPoint::ResidPost(layer), resid_post, cache)
    }
}

/// GPT-NeoX / Pythia with hook points
pub struct HookedNeox {
    embed_in: Embedding,
    layers: Vec<Layer>,
    final_layer_norm: LayerNorm,
    embed_out: Linear,
    rotary: RotaryEmbedding,
    config: NeoxConfig,
}

impl HookedNeox {
    pub fn load(vb: VarBuilder, config: NeoxConfig, device: &Device, dtype: DType) -> Result<Self> {
        let vb_model = vb.pp("gpt_neox");
        let embed_in = embedding(config.vocab_size, config.hidden_size, vb_model.pp("embed_in"))?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(Layer::load(vb_model.pp(format!("layers.{i}")), &config)?);
        }

        let final_layer_norm = LayerNorm::load(
            config.hidden_size,
            config.layer_norm_eps,
            vb_model.pp("final_layer_norm"),
        )?;
        let embed_out = linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("embed_out"))?;

        let rotary = RotaryEmbedding::new(
            config.rot_dims(),
            config.max_position_embeddings,
            config.rotary_emb_base,
            device,
            dtype,
        )?;

        info!(
            "GPT-NeoX loaded: {} layers, d_model={}, d_mlp={}, rotary dims={}",
            config.num_hidden_layers,
            config.hidden_size,
            config.intermediate_size,
            config.rot_dims()
        );

        Ok(Self {
            embed_in,
            layers,
            final_layer_norm,
            embed_out,
            rotary,
            config,
        })
    }
}

impl HookedBackend for HookedNeox {
    fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn d_mlp(&self) -> usize {
        self.config.intermediate_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let mut cache = HookCache::new();
        let embed = self.embed_in.forward(input_ids)?;
        let mut hidden = hooks.apply(HookPoint::Embed, embed, &mut cache)?;

        for (i, layer) in self.layers.iter().enumerate() {
            if hooks.stop_layer() == Some(i) {
                cache.set_output(hidden);
                return Ok(cache);
            }
            hidden = layer.forward(i, hidden, &self.rotary, hooks, &mut cache)?;
        }
        if hooks.stop_layer().is_some() {
            cache.set_output(hidden);
            return Ok(cache);
        }

        let normed = self.final_layer_norm.forward(&hidden)?;
        let normed = hooks.apply(HookPoint::FinalNorm, normed, &mut cache)?;
        cache.set_output(self.embed_out.forward(&normed)?);
        Ok(cache)
    }

    fn embedding_matrix(&self) -> Tensor {
        self.embed_in.embeddings().clone()
    }
}
