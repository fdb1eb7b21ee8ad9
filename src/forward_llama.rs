//! LLaMA forward pass with hook points
//!
//! Llama-2 architecture:
//! - No bias on any projection (Q, K, V, O, MLP)
//! - RMSNorm before attention and MLP
//! - SwiGLU MLP, hooked after `silu(gate) * up`
//! - Grouped-query attention when `num_key_value_heads < num_attention_heads`

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use tracing::info;

use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::masks::create_causal_mask;
use crate::model::HookedBackend;
use crate::norm::RmsNorm;
use crate::rotary::RotaryEmbedding;

/// Model configuration (matches HuggingFace config.json for Llama-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let kv_dim = config.num_kv_heads() * head_dim;
        Ok(Self {
            q_proj: linear_no_bias(config.hidden_size, config.num_attention_heads * head_dim, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(config.hidden_size, kv_dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(config.hidden_size, kv_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(config.num_attention_heads * head_dim, config.hidden_size, vb.pp("o_proj"))?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads(),
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let mask = create_causal_mask(seq_len, x.device(), scores.dtype())?;
        let pattern = candle_nn::ops::softmax(&scores.broadcast_add(&mask)?, D::Minus1)?;

        let z = pattern.matmul(&v)?.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&z)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x
        .unsqueeze(2)?
        .expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let h = config.hidden_size;
        let eps = config.rms_norm_eps;
        let vb_mlp = vb.pp("mlp");
        Ok(Self {
            input_layernorm: RmsNorm::load(h, eps, vb.pp("input_layernorm"))?,
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            post_attention_layernorm: RmsNorm::load(h, eps, vb.pp("post_attention_layernorm"))?,
            gate_proj: linear_no_bias(h, config.intermediate_size, vb_mlp.pp("gate_proj"))?,
            up_proj: linear_no_bias(h, config.intermediate_size, vb_mlp.pp("up_proj"))?,
            down_proj: linear_no_bias(config.intermediate_size, h, vb_mlp.pp("down_proj"))?,
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
            .self_attn
            .forward(&self.input_layernorm.forward(&resid_pre)?, rotary)?;
        let attn_out = hooks.apply(HookPoint::AttnOut(layer), attn_out, cache)?;
        let resid_mid = hooks.apply(HookPoint::ResidMid(layer), (&resid_pre + attn_out)?, cache)?;

        let normed = self.post_attention_layernorm.forward(&resid_mid)?;
        let gate = self.gate_proj.forward(&normed)?;
        let gate = hooks.apply(HookPoint::MlpPre(layer), gate, cache)?;
        let post = (gate.silu()? * self.up_proj.forward(&normed)?)?;
        let post = hooks.apply(HookPoint::MlpPost(layer), post, cache)?;
        let mlp_out = hooks.apply(HookPoint::MlpOut(layer), self.down_proj.forward(&post)?, cache)?;

        hooks.apply(HookPoint::ResidPost(layer), (&resid_mid + mlp_out)?, cache)
    }
}

/// Llama-2 with hook points
pub struct HookedLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    config: LlamaConfig,
}

impl HookedLlama {
    pub fn load(vb: VarBuilder, config: LlamaConfig, device: &Device, dtype: DType) -> Result<Self> {
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb_model.pp("embed_tokens"))?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(vb_model.pp(format!("layers.{i}")), &config)?);
        }

        let norm = RmsNorm::load(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
            dtype,
        )?;

        info!(
            "LLaMA loaded: {} layers, d_model={}, d_mlp={}, kv_heads={}",
            config.num_hidden_layers,
            config.hidden_size,
            config.intermediate_size,
            config.num_kv_heads()
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config,
        })
    }
}

impl HookedBackend for HookedLlama {
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
        let embed = self.embed_tokens.forward(input_ids)?;
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

        let normed = hooks.apply(HookPoint::FinalNorm, self.norm.forward(&hidden)?, &mut cache)?;
        let logits = self.lm_head.forward(&normed)?.to_dtype(DType::F32)?;
        cache.set_output(logits);
        Ok(cache)
    }

    fn embedding_matrix(&self) -> Tensor {
        self.embed_tokens.embeddings().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use serial_test::serial;

    fn tiny(num_key_value_heads: Option<usize>) -> HookedLlama {
        let config = LlamaConfig {
            hidden_size: 16,
            intermediate_size: 24,
            num_attention_heads: 4,
            num_key_value_heads,
            num_hidden_layers: 2,
            vocab_size: 13,
            rope_theta: 10_000.0,
            rms_norm_eps: 1e-5,
            max_position_embeddings: 32,
            tie_word_embeddings: false,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        HookedLlama::load(vb, config, &Device::Cpu, DType::F32).unwrap()
    }

    #[test]
    #[serial]
    fn test_llama_forward_shapes() {
        let model = tiny(None);
        let ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();
        let mut hooks = HookSpec::new();
        hooks.capture(HookPoint::MlpPost(0)).capture(HookPoint::ResidPost(1));
        let cache = model.forward(&ids, &hooks).unwrap();

        assert_eq!(cache.output().unwrap().dims(), &[2, 3, 13]);
        assert_eq!(cache.require(&HookPoint::MlpPost(0)).unwrap().dims(), &[2, 3, 24]);
        assert_eq!(cache.require(&HookPoint::ResidPost(1)).unwrap().dims(), &[2, 3, 16]);
        assert_eq!(model.d_mlp(), 24);
    }

    #[test]
    #[serial]
    fn test_grouped_query_attention() {
        let model = tiny(Some(2));
        let ids = Tensor::new(&[[7u32, 8, 9, 10]], &Device::Cpu).unwrap();
        let cache = model.forward(&ids, &HookSpec::new()).unwrap();
        assert_eq!(cache.output().unwrap().dims(), &[1, 4, 13]);
    }

    #[test]
    fn test_repeat_kv() {
        let x = Tensor::arange(0f32, 8.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 2, 2))
            .unwrap();
        let y = repeat_kv(x, 2).unwrap();
        assert_eq!(y.dims(), &[1, 4, 2, 2]);
        let heads: Vec<Vec<Vec<f32>>> = y.squeeze(0).unwrap().to_vec3().unwrap();
        assert_eq!(heads[0], heads[1]);
        assert_eq!(heads[2], heads[3]);
        assert_ne!(heads[0], heads[2]);
    }
}
