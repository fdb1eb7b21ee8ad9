//! HookedModel wrapper around the hooked backends
//!
//! Supports three interpreted models (GPT-NeoX/Pythia, Llama-2, GPT-2) behind
//! one interface modelled on `run_with_cache` / `run_with_hooks`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::config::Config;
use crate::forward_gpt2::{Gpt2Config, HookedGpt2};
use crate::forward_llama::{HookedLlama, LlamaConfig};
use crate::forward_neox::{HookedNeox, NeoxConfig};
use crate::hooks::{HookCache, HookPoint, HookSpec, Intervention};

/// Supported interpreted models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// EleutherAI Pythia-70m (GPT-NeoX)
    Pythia70M,
    /// Meta Llama-2-7b-chat
    Llama2Chat7B,
    /// OpenAI GPT-2 small
    Gpt2Small,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::Pythia70M,
        ModelKind::Llama2Chat7B,
        ModelKind::Gpt2Small,
    ];

    /// Code used in the `model_to_interpret` config key
    pub fn code(&self) -> &'static str {
        match self {
            ModelKind::Pythia70M => "pythia-70m",
            ModelKind::Llama2Chat7B => "llama-2-7b-chat",
            ModelKind::Gpt2Small => "gpt2-small",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        ModelKind::ALL
            .iter()
            .find(|kind| kind.code() == code)
            .copied()
            .ok_or_else(|| {
                let choices: Vec<&str> = ModelKind::ALL.iter().map(ModelKind::code).collect();
                anyhow::anyhow!("Unknown model '{code}', choose from {choices:?}")
            })
    }

    /// HuggingFace repository holding the weights
    pub fn repo_id(&self) -> &'static str {
        match self {
            ModelKind::Pythia70M => "EleutherAI/pythia-70m",
            ModelKind::Llama2Chat7B => "meta-llama/Llama-2-7b-chat-hf",
            ModelKind::Gpt2Small => "openai-community/gpt2",
        }
    }

    /// Name of the tokenized dataset cache matching this model's tokenizer
    pub fn dataset_cache_name(&self) -> &'static str {
        match self {
            ModelKind::Pythia70M => "pile",
            ModelKind::Llama2Chat7B => "pile-by-llama2",
            ModelKind::Gpt2Small => "pile-by-gpt2",
        }
    }
}

/// Unified backend trait for the hooked forward passes.
pub trait HookedBackend {
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn d_mlp(&self) -> usize;
    fn vocab_size(&self) -> usize;

    /// Run `input_ids` (`[batch, seq]`, u32) through the model, applying and
    /// capturing what `hooks` asks for.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    /// Token embedding matrix `[vocab, d_model]`
    fn embedding_matrix(&self) -> Tensor;
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Files making up a checkpoint
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Use a local directory laid out like a HuggingFace snapshot
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let index_path = dir.join("model.safetensors.index.json");
        let weights = if index_path.exists() {
            let index_str =
                std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;
            shard_names(&index)
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            vec![dir.join("model.safetensors")]
        };
        for path in &weights {
            anyhow::ensure!(path.exists(), "Missing weight file {}", path.display());
        }
        Ok(Self {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights,
        })
    }

    /// Download (or reuse from the hub cache) the files of `repo_id`
    pub fn from_hub(repo_id: &str) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));

        let config = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let tokenizer = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;

        // Check for sharded vs single safetensors
        let weights = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            info!("Model is sharded, loading index...");
            let index_str =
                std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;
            let names = shard_names(&index);
            info!("Downloading {} shard files...", names.len());
            let mut paths = Vec::with_capacity(names.len());
            for name in &names {
                let path = repo
                    .get(name)
                    .with_context(|| format!("Failed to download {name}"))?;
                paths.push(path);
            }
            paths
        } else {
            vec![repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?]
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

fn shard_names(index: &SafetensorsIndex) -> Vec<String> {
    let mut names: Vec<String> = index.weight_map.values().cloned().collect();
    names.sort();
    names.dedup();
    names
}

/// Parse `cpu` or `cuda:N`
pub fn parse_device(spec: &str) -> Result<Device> {
    if spec == "cpu" {
        return Ok(Device::Cpu);
    }
    let ordinal = match spec.strip_prefix("cuda") {
        Some("") => 0,
        Some(rest) => rest
            .trim_start_matches(':')
            .parse::<usize>()
            .with_context(|| format!("Bad device '{spec}'"))?,
        None => anyhow::bail!("Unknown device '{spec}', use 'cpu' or 'cuda:N'"),
    };
    let device = Device::cuda_if_available(ordinal)?;
    if !device.is_cuda() {
        info!("CUDA not available, using CPU");
    }
    Ok(device)
}

/// Interpreted model plus tokenizer
pub struct HookedModel {
    backend: Box<dyn HookedBackend>,
    tokenizer: Tokenizer,
    device: Device,
    kind: ModelKind,
}

impl HookedModel {
    /// Load the model named by `model_to_interpret` on `device`.
    ///
    /// A `model_dir` holding `config.json` is used as is; otherwise the
    /// checkpoint comes from the HuggingFace hub.
    pub fn load(cfg: &Config) -> Result<Self> {
        let kind = ModelKind::from_code(&cfg.model_to_interpret)?;
        let device = parse_device(&cfg.device)?;

        let local = Path::new(&cfg.model_dir);
        let files = if local.join("config.json").exists() {
            info!("Loading {} from {}", kind.code(), local.display());
            ModelFiles::from_dir(local)?
        } else {
            info!("Loading {} from {}", kind.code(), kind.repo_id());
            ModelFiles::from_hub(kind.repo_id())?
        };
        Self::from_files(kind, &files, device)
    }

    pub fn from_files(kind: ModelKind, files: &ModelFiles, device: Device) -> Result<Self> {
        // Llama-2 is trained in bfloat16; the small models stay in F32
        let dtype = match kind {
            ModelKind::Llama2Chat7B if device.is_cuda() => DType::BF16,
            _ => DType::F32,
        };
        info!("Device: {:?}, dtype: {:?}", device, dtype);

        let config_str =
            std::fs::read_to_string(&files.config).context("Failed to read config")?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        info!("Loading weights from {} file(s)...", files.weights.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };

        let backend: Box<dyn HookedBackend> = match kind {
            ModelKind::Pythia70M => {
                let config: NeoxConfig = serde_json::from_str(&config_str)?;
                Box::new(HookedNeox::load(vb, config, &device, dtype)?)
            }
            ModelKind::Llama2Chat7B => {
                let config: LlamaConfig = serde_json::from_str(&config_str)?;
                Box::new(HookedLlama::load(vb, config, &device, dtype)?)
            }
            ModelKind::Gpt2Small => {
                let config: Gpt2Config = serde_json::from_str(&config_str)?;
                Box::new(HookedGpt2::load(vb, config)?)
            }
        };

        Ok(Self::from_parts(backend, tokenizer, device, kind))
    }

    /// Assemble from an already built backend
    pub fn from_parts(
        backend: Box<dyn HookedBackend>,
        tokenizer: Tokenizer,
        device: Device,
        kind: ModelKind,
    ) -> Self {
        Self {
            backend,
            tokenizer,
            device,
            kind,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    pub fn d_mlp(&self) -> usize {
        self.backend.d_mlp()
    }

    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    pub fn embedding_matrix(&self) -> Tensor {
        self.backend.embedding_matrix()
    }

    /// Forward pass capturing `names`; stops before `stop_at_layer` if given
    pub fn run_with_cache(
        &self,
        tokens: &Tensor,
        names: &[HookPoint],
        stop_at_layer: Option<usize>,
    ) -> Result<HookCache> {
        let mut spec = HookSpec::new();
        for name in names {
            spec.capture(name.clone());
        }
        if let Some(layer) = stop_at_layer {
            spec.stop_at_layer(layer);
        }
        self.run(tokens, &spec)
    }

    /// Forward pass with interventions, returning logits `[batch, seq, vocab]`
    pub fn run_with_hooks(
        &self,
        tokens: &Tensor,
        hooks: &[(HookPoint, Intervention)],
    ) -> Result<Tensor> {
        let mut spec = HookSpec::new();
        for (point, intervention) in hooks {
            spec.intervene(point.clone(), intervention.clone());
        }
        self.run(tokens, &spec)?.into_output()
    }

    /// Forward pass with an arbitrary hook specification
    pub fn run(&self, tokens: &Tensor, spec: &HookSpec) -> Result<HookCache> {
        let tokens = tokens.to_device(&self.device)?;
        self.backend.forward(&tokens, spec)
    }

    /// Activations at `hook`, skipping the layers after it
    pub fn hidden_states(&self, tokens: &Tensor, hook: &HookPoint) -> Result<Tensor> {
        let stop = hook.layer().map(|layer| layer + 1);
        let cache = self.run_with_cache(tokens, std::slice::from_ref(hook), stop)?;
        Ok(cache.require(hook)?.to_dtype(DType::F32)?)
    }

    /// Next-token cross-entropy per position, `[batch, seq - 1]`
    pub fn loss_per_token(
        &self,
        tokens: &Tensor,
        hooks: &[(HookPoint, Intervention)],
    ) -> Result<Tensor> {
        let logits = self.run_with_hooks(tokens, hooks)?;
        loss_per_token_from_logits(&logits, &tokens.to_device(&self.device)?)
    }

    /// Text of each token id, decoded on its own
    pub fn to_str_tokens(&self, ids: &[u32]) -> Result<Vec<String>> {
        ids.iter()
            .map(|&id| {
                self.tokenizer
                    .decode(&[id], false)
                    .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
            })
            .collect()
    }

    /// Decode each row of a `[batch, seq]` token tensor
    pub fn to_string(&self, rows: &Tensor) -> Result<Vec<String>> {
        let rows: Vec<Vec<u32>> = rows.to_dtype(DType::U32)?.to_vec2()?;
        rows.iter()
            .map(|row| {
                self.tokenizer
                    .decode(row, false)
                    .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
            })
            .collect()
    }

    /// Tokenize text without special tokens
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Id used to mask a position: the unknown token, falling back to the
    /// end-of-text markers.
    pub fn pad_token_id(&self) -> u32 {
        let vocab = self.tokenizer.get_vocab(true);
        ["<unk>", "<|endoftext|>", "</s>"]
            .iter()
            .find_map(|t| vocab.get(*t).copied())
            .unwrap_or(0)
    }

    /// Separator appended between documents when packing a corpus
    pub fn eos_token_id(&self) -> Option<u32> {
        let vocab = self.tokenizer.get_vocab(true);
        ["<|endoftext|>", "</s>"]
            .iter()
            .find_map(|t| vocab.get(*t).copied())
    }
}

/// Cross-entropy of `tokens[:, 1:]` under `logits[:, :-1]`
pub fn loss_per_token_from_logits(logits: &Tensor, tokens: &Tensor) -> Result<Tensor> {
    let (_b, seq_len, _v) = logits.dims3()?;
    anyhow::ensure!(seq_len > 1, "Need at least two tokens to compute a loss");
    let logits = logits.i((.., ..seq_len - 1, ..))?.to_dtype(DType::F32)?;
    let targets = tokens.i((.., 1..))?.to_dtype(DType::U32)?.contiguous()?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?;
    Ok(picked.squeeze(D::Minus1)?.neg()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_codes_roundtrip() {
        for kind in ModelKind::ALL {
            assert_eq!(ModelKind::from_code(kind.code()).unwrap(), kind);
        }
        assert!(ModelKind::from_code("gpt-j").is_err());
        assert_eq!(ModelKind::Gpt2Small.dataset_cache_name(), "pile-by-gpt2");
    }

    #[test]
    fn test_parse_device() {
        assert!(parse_device("cpu").unwrap().is_cpu());
        assert!(parse_device("tpu:0").is_err());
        assert!(parse_device("cuda:x").is_err());
    }

    #[test]
    fn test_loss_per_token_uniform_logits() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::new(&[[0u32, 1, 2]], &Device::Cpu).unwrap();
        let loss: Vec<Vec<f32>> = loss_per_token_from_logits(&logits, &tokens)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(loss[0].len(), 2);
        for l in &loss[0] {
            assert!((l - 4f32.ln()).abs() < 1e-5);
        }
    }
}
