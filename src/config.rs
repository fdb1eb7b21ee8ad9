//! Run configuration
//!
//! A single flat namespace of hyperparameters. Values are layered: built-in
//! defaults, then an optional JSON file, then `--<key> <value>` flags. Keys
//! left as `None` are derived from the loaded model by [`process_cfg`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::hooks::HookPoint;
use crate::model::HookedModel;

/// Part of a transformer block whose activations are explained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Site {
    ResidPre,
    ResidMid,
    ResidPost,
    AttnOut,
    MlpPre,
    MlpPost,
    MlpOut,
}

impl Site {
    pub const ALL: [Site; 7] = [
        Site::ResidPre,
        Site::ResidMid,
        Site::ResidPost,
        Site::AttnOut,
        Site::MlpPre,
        Site::MlpPost,
        Site::MlpOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Site::ResidPre => "resid_pre",
            Site::ResidMid => "resid_mid",
            Site::ResidPost => "resid_post",
            Site::AttnOut => "attn_out",
            Site::MlpPre => "mlp_pre",
            Site::MlpPost => "mlp_post",
            Site::MlpOut => "mlp_out",
        }
    }

    pub fn hook_point(&self, layer: usize) -> HookPoint {
        match self {
            Site::ResidPre => HookPoint::ResidPre(layer),
            Site::ResidMid => HookPoint::ResidMid(layer),
            Site::ResidPost => HookPoint::ResidPost(layer),
            Site::AttnOut => HookPoint::AttnOut(layer),
            Site::MlpPre => HookPoint::MlpPre(layer),
            Site::MlpPost => HookPoint::MlpPost(layer),
            Site::MlpOut => HookPoint::MlpOut(layer),
        }
    }

    /// Width of the activation at this site
    pub fn width(&self, d_model: usize, d_mlp: usize) -> usize {
        match self {
            Site::MlpPre | Site::MlpPost => d_mlp,
            _ => d_model,
        }
    }

    /// Coarse family of the site: `resid`, `attn` or `mlp`
    pub fn layer_type(&self) -> &'static str {
        match self {
            Site::ResidPre | Site::ResidMid | Site::ResidPost => "resid",
            Site::AttnOut => "attn",
            Site::MlpPre | Site::MlpPost | Site::MlpOut => "mlp",
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Site {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Site::ALL
            .iter()
            .find(|site| site.as_str() == s)
            .copied()
            .ok_or_else(|| {
                let choices: Vec<&str> = Site::ALL.iter().map(Site::as_str).collect();
                anyhow::anyhow!("Unknown site '{s}', choose from {choices:?}")
            })
    }
}

pub const EXTRACTOR_CODES: [&str; 4] = ["ae", "tcav", "conceptx", "neuron"];
pub const RETURN_TYPES: [&str; 3] = ["weighted", "mean", "corr"];
pub const METRIC_EVALUATOR_CODES: [&str; 2] = ["vr", "rc"];
pub const INIT_TYPES: [&str; 2] = ["kaiming_uniform", "xavier_uniform"];

/// Accept `true`/`false` as well as the `0`/`1` integers used on the
/// command line.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        Value::String(s) => match s.as_str() {
            "1" | "true" | "True" => Ok(true),
            "0" | "false" | "False" => Ok(false),
            other => Err(serde::de::Error::custom(format!("expected a flag, got '{other}'"))),
        },
        other => Err(serde::de::Error::custom(format!("expected a flag, got {other}"))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    // global
    pub seed: u64,
    pub extractor: String,
    pub model_to_interpret: String,
    pub load_path: String,
    #[serde(deserialize_with = "flag")]
    pub load_extractor: bool,

    // autoencoder
    pub dict_mult: usize,
    pub d_mlp: Option<usize>,
    pub d_model: Option<usize>,
    pub val_freq: usize,
    pub data_dir: String,
    pub dataset_name: String,
    pub output_dir: String,
    pub model_dir: String,
    #[serde(deserialize_with = "flag")]
    pub reinit: bool,
    pub init_type: String,
    #[serde(deserialize_with = "flag")]
    pub remove_parallel: bool,
    #[serde(deserialize_with = "flag")]
    pub tied_enc_dec: bool,
    pub epoch: usize,

    // ConceptX
    #[serde(rename = "ConceptX_max_token")]
    pub conceptx_max_token: usize,
    #[serde(rename = "ConceptX_clusters")]
    pub conceptx_clusters: usize,

    // TCAV
    pub tcav_concepts: Vec<Vec<String>>,
    pub tcav_max_samples: usize,

    // training
    pub num_batches: Option<usize>,
    pub device: String,
    pub batch_size: usize,
    pub l1_coeff: f64,

    // concept evaluation
    pub evaluator: String,
    pub concept_eval_batchsize: usize,
    pub return_type: String,
    pub topic_len: usize,
    pub concept_idx: usize,
    pub logit_class_idx: i64,
    pub logit_topk: Option<usize>,

    // metric evaluation
    pub metric_evaluator: String,
    pub metric_eval_batchsize: usize,
    #[serde(deserialize_with = "flag")]
    pub run_metric_eval: bool,
    pub evaluators: Vec<String>,
    pub concept_idxs: Vec<usize>,

    // activation buffer
    pub buffer_size: Option<usize>,
    pub buffer_mult: usize,
    pub act_size: Option<usize>,
    pub buffer_batches: Option<usize>,
    pub model_batch_size: usize,

    // dataset
    pub num_tokens: usize,
    pub seq_len: usize,
    #[serde(deserialize_with = "flag")]
    pub tokenized: bool,
    #[serde(deserialize_with = "flag")]
    pub data_from_hf: bool,
    pub hf_dataset_repo: String,
    pub hf_dataset_file: String,

    // explained location
    pub layer: usize,
    pub site: Site,
    pub layer_type: Option<String>,
    pub act_name: Option<String>,

    // optimizer
    pub beta1: f64,
    pub beta2: f64,
    pub lr: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 49,
            extractor: "conceptx".into(),
            model_to_interpret: "pythia-70m".into(),
            load_path: "./best_reconstruct".into(),
            load_extractor: false,

            dict_mult: 8,
            d_mlp: None,
            d_model: None,
            val_freq: 100,
            data_dir: "./data".into(),
            dataset_name: "pile-tokenized-10b".into(),
            output_dir: "./output".into(),
            model_dir: "Pythia-70m".into(),
            reinit: true,
            init_type: "kaiming_uniform".into(),
            remove_parallel: true,
            tied_enc_dec: false,
            epoch: 1,

            conceptx_max_token: 5000,
            conceptx_clusters: 10,

            tcav_concepts: vec![
                vec!["he".into(), "she".into(), "him".into(), "her".into(), "they".into()],
                vec!["one".into(), "two".into(), "three".into(), "four".into(), "five".into()],
                vec!["monday".into(), "tuesday".into(), "friday".into(), "sunday".into()],
            ],
            tcav_max_samples: 2000,

            num_batches: None,
            device: "cuda:0".into(),
            batch_size: 8192,
            l1_coeff: 0.5,

            evaluator: "itc".into(),
            concept_eval_batchsize: 128,
            return_type: "weighted".into(),
            topic_len: 10,
            concept_idx: 0,
            logit_class_idx: -1,
            logit_topk: None,

            metric_evaluator: "rc".into(),
            metric_eval_batchsize: 128 * 5,
            run_metric_eval: false,
            evaluators: vec![
                "itc-uci".into(),
                "itc-umass".into(),
                "otc-emb_cos".into(),
                "replace-loss".into(),
                "ablation-loss".into(),
                "replace-ablation-loss".into(),
                "gradient-loss".into(),
            ],
            concept_idxs: vec![0, 1, 2, 3, 4],

            buffer_size: None,
            buffer_mult: 400,
            act_size: None,
            buffer_batches: None,
            model_batch_size: 64,

            num_tokens: 1_363_348_000,
            seq_len: 128,
            tokenized: true,
            data_from_hf: true,
            hf_dataset_repo: "NeelNanda/pile-10k".into(),
            hf_dataset_file: "pile-10k.jsonl".into(),

            layer: 0,
            site: Site::ResidPost,
            layer_type: None,
            act_name: None,

            beta1: 0.9,
            beta2: 0.99,
            lr: 0.001,
        }
    }
}

impl Config {
    /// Every key accepted by the configuration, sorted
    pub fn keys() -> Vec<String> {
        match serde_json::to_value(Config::default()) {
            Ok(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Defaults overlaid with the keys of a JSON object file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        let Value::Object(map) = value else {
            anyhow::bail!("Config file {} must hold a JSON object", path.display());
        };
        let mut cfg = Config::default();
        cfg.merge(map)?;
        Ok(cfg)
    }

    /// Apply `(key, raw value)` pairs from the command line.
    ///
    /// A raw value is read as JSON when it parses and fits the key's type,
    /// otherwise as a plain string.
    pub fn apply_overrides(&mut self, pairs: &[(String, String)]) -> Result<()> {
        let known = Config::keys();
        for (key, raw) in pairs {
            anyhow::ensure!(
                known.iter().any(|k| k == key),
                "Unknown config key '{key}'"
            );
            let as_json = serde_json::from_str::<Value>(raw).ok();
            let mut candidates: Vec<Value> = as_json.into_iter().collect();
            candidates.push(Value::String(raw.clone()));

            let mut last_err = None;
            let mut applied = false;
            for value in candidates {
                let mut map = Map::new();
                map.insert(key.clone(), value);
                match self.clone().merged(map) {
                    Ok(cfg) => {
                        *self = cfg;
                        applied = true;
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            if !applied {
                let err = last_err.unwrap_or_else(|| anyhow::anyhow!("no value"));
                return Err(err.context(format!("Invalid value '{raw}' for '{key}'")));
            }
            debug!("Override {key} = {raw}");
        }
        Ok(())
    }

    fn merged(mut self, map: Map<String, Value>) -> Result<Self> {
        self.merge(map)?;
        Ok(self)
    }

    fn merge(&mut self, map: Map<String, Value>) -> Result<()> {
        let Value::Object(mut current) = serde_json::to_value(&*self)? else {
            anyhow::bail!("Config did not serialize to an object");
        };
        for (key, value) in map {
            anyhow::ensure!(current.contains_key(&key), "Unknown config key '{key}'");
            current.insert(key, value);
        }
        *self = serde_json::from_value(Value::Object(current))?;
        Ok(())
    }

    /// Check enumerated choices and positive sizes
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            EXTRACTOR_CODES.contains(&self.extractor.as_str()),
            "Unknown extractor '{}', choose from {EXTRACTOR_CODES:?}",
            self.extractor
        );
        crate::model::ModelKind::from_code(&self.model_to_interpret)?;
        anyhow::ensure!(
            RETURN_TYPES.contains(&self.return_type.as_str()),
            "Unknown return_type '{}', choose from {RETURN_TYPES:?}",
            self.return_type
        );
        anyhow::ensure!(
            METRIC_EVALUATOR_CODES.contains(&self.metric_evaluator.as_str()),
            "Unknown metric_evaluator '{}', choose from {METRIC_EVALUATOR_CODES:?}",
            self.metric_evaluator
        );
        anyhow::ensure!(
            INIT_TYPES.contains(&self.init_type.as_str()),
            "Unknown init_type '{}', choose from {INIT_TYPES:?}",
            self.init_type
        );
        crate::evaluators::EvaluatorName::parse(&self.evaluator)?;
        for name in &self.evaluators {
            crate::evaluators::EvaluatorName::parse(name)?;
        }
        for (key, value) in [
            ("concept_eval_batchsize", self.concept_eval_batchsize),
            ("metric_eval_batchsize", self.metric_eval_batchsize),
            ("model_batch_size", self.model_batch_size),
            ("batch_size", self.batch_size),
            ("seq_len", self.seq_len),
            ("topic_len", self.topic_len),
            ("ConceptX_clusters", self.conceptx_clusters),
            ("dict_mult", self.dict_mult),
            ("val_freq", self.val_freq),
        ] {
            anyhow::ensure!(value > 0, "'{key}' must be positive");
        }
        Ok(())
    }

    /// Hook point named by `act_name`, once [`process_cfg`] has run
    pub fn hook_point(&self) -> Result<HookPoint> {
        match &self.act_name {
            Some(name) => name.parse(),
            None => Ok(self.site.hook_point(self.layer)),
        }
    }

    /// `act_size`, once [`process_cfg`] has run
    pub fn act_size(&self) -> Result<usize> {
        self.act_size
            .ok_or_else(|| anyhow::anyhow!("act_size is unset, run process_cfg first"))
    }
}

/// Fill the model-derived keys
pub fn process_cfg(cfg: &mut Config, model: &HookedModel) -> Result<()> {
    anyhow::ensure!(
        cfg.layer < model.n_layers(),
        "layer {} out of range, model has {} layers",
        cfg.layer,
        model.n_layers()
    );
    cfg.d_model = Some(model.d_model());
    cfg.d_mlp = Some(model.d_mlp());
    cfg.act_name = Some(cfg.site.hook_point(cfg.layer).to_string());
    cfg.act_size = Some(cfg.site.width(model.d_model(), model.d_mlp()));
    cfg.layer_type = Some(cfg.site.layer_type().to_string());

    let buffer_size = cfg.batch_size * cfg.buffer_mult;
    cfg.buffer_size = Some(buffer_size);
    cfg.buffer_batches = Some(buffer_size / cfg.seq_len);
    cfg.num_batches = Some(cfg.num_tokens / cfg.batch_size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_run() {
        let cfg = Config::default();
        assert_eq!(cfg.seed, 49);
        assert_eq!(cfg.conceptx_clusters, 10);
        assert_eq!(cfg.metric_eval_batchsize, 640);
        assert_eq!(cfg.site, Site::ResidPost);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_keys_use_original_spelling() {
        let keys = Config::keys();
        assert!(keys.contains(&"ConceptX_max_token".to_string()));
        assert!(keys.contains(&"dict_mult".to_string()));
        assert!(!keys.contains(&"conceptx_max_token".to_string()));
    }

    #[test]
    fn test_overrides_parse_json_then_string() {
        let mut cfg = Config::default();
        cfg.apply_overrides(&[
            ("dict_mult".into(), "2".into()),
            ("site".into(), "mlp_post".into()),
            ("reinit".into(), "0".into()),
            ("load_path".into(), "123".into()),
            ("concept_idxs".into(), "[3, 7]".into()),
            ("lr".into(), "1e-4".into()),
        ])
        .unwrap();
        assert_eq!(cfg.dict_mult, 2);
        assert_eq!(cfg.site, Site::MlpPost);
        assert!(!cfg.reinit);
        assert_eq!(cfg.load_path, "123");
        assert_eq!(cfg.concept_idxs, vec![3, 7]);
        assert!((cfg.lr - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_override_rejected() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_overrides(&[("dict_multiplier".into(), "2".into())])
            .unwrap_err();
        assert!(err.to_string().contains("dict_multiplier"));
    }

    #[test]
    fn test_bad_value_rejected() {
        let mut cfg = Config::default();
        assert!(cfg
            .apply_overrides(&[("dict_mult".into(), "many".into())])
            .is_err());
        assert_eq!(cfg.dict_mult, 8);
    }

    #[test]
    fn test_validate_rejects_unknown_choices() {
        let mut cfg = Config::default();
        cfg.extractor = "spine".into();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.return_type = "median".into();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.evaluators = vec!["itc-cosine".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_site_hook_points() {
        assert_eq!(Site::MlpPost.hook_point(3).to_string(), "blocks.3.mlp.hook_post");
        assert_eq!(Site::MlpPost.width(512, 2048), 2048);
        assert_eq!(Site::ResidMid.width(512, 2048), 512);
        assert!("resid".parse::<Site>().is_err());
    }
}
