//! Tokenized corpora
//!
//! A dataset is a `[rows, seq_len]` u32 tensor of token ids kept on the CPU.
//! Each model reads its own cache (`pile`, `pile-by-llama2`, `pile-by-gpt2`)
//! stored as `<data_dir>/<name>.safetensors`. Missing caches are built from
//! a JSONL corpus, either downloaded from a HuggingFace dataset repository
//! or found locally as `<data_dir>/<dataset_name>.jsonl`.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use safetensors::SafeTensors;
use serde::Deserialize;
use tracing::info;

use crate::config::Config;
use crate::model::HookedModel;

const TOKENS_KEY: &str = "tokens";

/// One JSONL record: raw text, or token ids when the corpus is pre-tokenized
#[derive(Debug, Deserialize)]
struct Record {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "input_ids")]
    tokens: Option<Vec<u32>>,
}

/// Fixed-length rows of token ids
#[derive(Debug, Clone)]
pub struct TokenDataset {
    tokens: Tensor,
}

impl TokenDataset {
    pub fn new(tokens: Tensor) -> Result<Self> {
        anyhow::ensure!(
            tokens.rank() == 2,
            "Token dataset must be [rows, seq_len], got {:?}",
            tokens.dims()
        );
        Ok(Self {
            tokens: tokens.to_dtype(DType::U32)?.to_device(&Device::Cpu)?,
        })
    }

    /// Pack flat ids into rows of `seq_len`, dropping the ragged tail
    pub fn from_ids(ids: Vec<u32>, seq_len: usize) -> Result<Self> {
        anyhow::ensure!(seq_len > 0, "seq_len must be positive");
        let rows = ids.len() / seq_len;
        anyhow::ensure!(
            rows > 0,
            "Corpus has {} tokens, fewer than one row of {seq_len}",
            ids.len()
        );
        let mut ids = ids;
        ids.truncate(rows * seq_len);
        Self::new(Tensor::from_vec(ids, (rows, seq_len), &Device::Cpu)?)
    }

    /// Build from a JSONL file.
    ///
    /// With `tokenized` the `tokens` (or `input_ids`) of a record are used
    /// when present; otherwise its `text` is encoded and documents are joined
    /// with the end-of-text token. Reading stops once `num_tokens` ids are
    /// collected.
    pub fn from_jsonl(
        path: &Path,
        model: &HookedModel,
        seq_len: usize,
        tokenized: bool,
        num_tokens: usize,
    ) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let separator = model.eos_token_id();

        let mut ids: Vec<u32> = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line)
                .with_context(|| format!("Bad record on line {}", line_no + 1))?;
            match (record.tokens, record.text) {
                (Some(tokens), _) if tokenized => ids.extend(tokens),
                (_, Some(text)) => {
                    ids.extend(model.encode(&text)?);
                    ids.extend(separator);
                }
                (Some(tokens), None) => ids.extend(tokens),
                (None, None) => {
                    anyhow::bail!("Line {} has neither 'tokens' nor 'text'", line_no + 1)
                }
            }
            if ids.len() >= num_tokens {
                ids.truncate(num_tokens);
                break;
            }
        }

        info!("Read {} tokens from {}", ids.len(), path.display());
        Self::from_ids(ids, seq_len)
    }

    /// Load a cache written by [`TokenDataset::save`]
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let view = tensors
            .tensor(TOKENS_KEY)
            .with_context(|| format!("No '{TOKENS_KEY}' tensor in {}", path.display()))?;
        anyhow::ensure!(
            view.dtype() == safetensors::Dtype::U32,
            "Expected u32 tokens, found {:?}",
            view.dtype()
        );
        let shape = view.shape().to_vec();
        anyhow::ensure!(shape.len() == 2, "Expected [rows, seq_len], found {shape:?}");

        let ids: Vec<u32> = view
            .data()
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Self::new(Tensor::from_vec(ids, (shape[0], shape[1]), &Device::Cpu)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tensors = HashMap::from([(TOKENS_KEY.to_string(), self.tokens.clone())]);
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    pub fn tokens(&self) -> &Tensor {
        &self.tokens
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.tokens.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seq_len(&self) -> usize {
        self.tokens.dims()[1]
    }
}

/// Cache path for the configured model
pub fn cache_path(cfg: &Config, model: &HookedModel) -> PathBuf {
    Path::new(&cfg.data_dir).join(format!("{}.safetensors", model.kind().dataset_cache_name()))
}

fn download_jsonl(cfg: &Config) -> Result<PathBuf> {
    info!(
        "Downloading {} from dataset {}",
        cfg.hf_dataset_file, cfg.hf_dataset_repo
    );
    let api = Api::new()?;
    let repo = api.repo(Repo::new(cfg.hf_dataset_repo.clone(), RepoType::Dataset));
    repo.get(&cfg.hf_dataset_file)
        .with_context(|| format!("Failed to download {}", cfg.hf_dataset_file))
}

/// Load (building it on first use) the tokenized dataset for this run
pub fn dataset_factory(cfg: &Config, model: &HookedModel) -> Result<TokenDataset> {
    let cache = cache_path(cfg, model);
    if cache.exists() {
        info!("Loading dataset cache {}", cache.display());
        let data = TokenDataset::load(&cache)?;
        anyhow::ensure!(
            data.seq_len() == cfg.seq_len,
            "Cached dataset has seq_len {}, config asks for {}",
            data.seq_len(),
            cfg.seq_len
        );
        return Ok(data);
    }

    let local = Path::new(&cfg.data_dir).join(format!("{}.jsonl", cfg.dataset_name));
    let source = if local.exists() {
        local
    } else if cfg.data_from_hf {
        download_jsonl(cfg)?
    } else {
        anyhow::bail!(
            "No dataset at {} or {} and data_from_hf is off",
            cache.display(),
            local.display()
        );
    };

    let data = TokenDataset::from_jsonl(&source, model, cfg.seq_len, cfg.tokenized, cfg.num_tokens)?;
    data.save(&cache)?;
    info!(
        "Saved {} rows x {} tokens to {}",
        data.len(),
        data.seq_len(),
        cache.display()
    );
    Ok(data)
}
