//! Integration tests for concept-eval
//!
//! The pipeline tests run on a tiny randomly initialised GPT-2 with a
//! word-level tokenizer, so they need no network access.
//! Tests marked with #[ignore] download real checkpoints.
//! Run them explicitly with: cargo test --ignored

use std::io::Write;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use concept_eval::{
    evaluator_factory, extractor_factory, load_extractor, Config, EvalContext, Gpt2Config,
    HookPoint, HookedGpt2, HookedModel, Intervention, ModelKind, Pipeline, Priors, TokenDataset,
    TokenLoader,
};
use serial_test::serial;
use tempfile::{NamedTempFile, TempDir};
use tokenizers::Tokenizer;

const WORDS: [&str; 22] = [
    "<unk>",
    "<|endoftext|>",
    "the",
    "a",
    "cat",
    "dog",
    "sat",
    "ran",
    "on",
    "to",
    "red",
    "blue",
    "green",
    "mat",
    "house",
    "tree",
    "and",
    "big",
    "small",
    "river",
    "saw",
    "near",
];

const SEQ_LEN: usize = 8;

fn tokenizer() -> Tokenizer {
    let vocab: serde_json::Map<String, serde_json::Value> = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), serde_json::json!(i)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    });
    Tokenizer::from_bytes(json.to_string().as_bytes()).unwrap()
}

fn tiny_model() -> HookedModel {
    let config = Gpt2Config {
        n_embd: 16,
        n_head: 2,
        n_layer: 2,
        n_positions: 32,
        vocab_size: WORDS.len(),
        layer_norm_epsilon: 1e-5,
        n_inner: None,
    };
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let backend = HookedGpt2::load(vb, config).unwrap();
    HookedModel::from_parts(
        Box::new(backend),
        tokenizer(),
        Device::Cpu,
        ModelKind::Gpt2Small,
    )
}

/// JSONL corpus of short sentences built from the tokenizer's words
fn corpus_file() -> NamedTempFile {
    let subjects = ["cat", "dog"];
    let colours = ["red", "blue", "green"];
    let places = ["mat", "house", "tree", "river"];
    let mut file = NamedTempFile::new().unwrap();
    for i in 0..24 {
        let text = format!(
            "the {} sat near the {} {} and a {} dog saw the big {}",
            subjects[i % 2],
            colours[i % 3],
            places[i % 4],
            if i % 2 == 0 { "small" } else { "big" },
            places[(i + 1) % 4],
        );
        writeln!(file, "{}", serde_json::json!({ "text": text })).unwrap();
    }
    file
}

fn dataset(model: &HookedModel) -> TokenDataset {
    let file = corpus_file();
    TokenDataset::from_jsonl(file.path(), model, SEQ_LEN, true, 10_000).unwrap()
}

fn base_config(out: &Path) -> Config {
    Config {
        model_to_interpret: "gpt2-small".to_string(),
        device: "cpu".to_string(),
        output_dir: out.to_string_lossy().into_owned(),
        layer: 0,
        seq_len: SEQ_LEN,
        model_batch_size: 4,
        metric_eval_batchsize: 4,
        concept_eval_batchsize: 2,
        topic_len: 5,
        concept_idx: 1,
        evaluator: "itc-uci".to_string(),
        batch_size: 16,
        buffer_mult: 4,
        num_tokens: 64,
        epoch: 1,
        val_freq: 2,
        run_metric_eval: false,
        ..Config::default()
    }
}

/// Test config layering: file first, then flag overrides
#[test]
fn test_config_file_and_overrides() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"extractor": "ae", "dict_mult": 4, "evaluators": ["itc-umass", "replace-KL_div"]}}"#
    )
    .unwrap();

    let mut cfg = Config::from_json_file(file.path()).unwrap();
    assert_eq!(cfg.extractor, "ae");
    assert_eq!(cfg.dict_mult, 4);
    assert_eq!(cfg.seed, 49);

    cfg.apply_overrides(&[("dict_mult".to_string(), "2".to_string())])
        .unwrap();
    assert_eq!(cfg.dict_mult, 2);
    assert!(cfg.validate().is_ok());
}

/// Test that config files cannot introduce unknown keys
#[test]
fn test_config_file_rejects_unknown_key() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"dictionary_multiplier": 4}}"#).unwrap();
    assert!(Config::from_json_file(file.path()).is_err());
}

/// Test dataset packing from JSONL text
#[test]
fn test_dataset_from_jsonl() {
    let model = tiny_model();
    let data = dataset(&model);
    assert_eq!(data.seq_len(), SEQ_LEN);
    // 24 documents of 15 words plus a separator each
    assert_eq!(data.len(), 24 * 16 / SEQ_LEN);

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pile.safetensors");
    data.save(&path).unwrap();
    let again = TokenDataset::load(&path).unwrap();
    assert_eq!(again.len(), data.len());
}

/// Test hooked capture on the tiny model
#[test]
#[serial]
fn test_hidden_states_shape() {
    let model = tiny_model();
    let tokens = Tensor::new(&[[2u32, 4, 6, 8], [3, 5, 7, 9]], &Device::Cpu).unwrap();
    let hidden = model
        .hidden_states(&tokens, &HookPoint::ResidPost(0))
        .unwrap();
    assert_eq!(hidden.dims(), &[2, 4, 16]);
    assert_eq!(model.to_str_tokens(&[4]).unwrap(), vec!["cat".to_string()]);
}

/// Neuron concepts through every evaluator and validity relevance
#[test]
#[serial]
fn test_pipeline_neuron_vr() {
    let out = TempDir::new().unwrap();
    let model = tiny_model();
    let data = dataset(&model);

    let cfg = Config {
        extractor: "neuron".to_string(),
        run_metric_eval: true,
        metric_evaluator: "vr".to_string(),
        evaluators: [
            "itc-uci",
            "itc-umass",
            "otc-emb_cos",
            "replace-loss",
            "ablation-loss",
            "replace-ablation-loss",
            "replace-KL_div",
            "gradient-logit",
        ]
        .iter()
        .map(ToString::to_string)
        .collect(),
        concept_idxs: vec![0, 1, 2],
        ..base_config(out.path())
    };
    let pipeline = Pipeline::new(cfg, model).unwrap();
    assert_eq!(pipeline.config().act_size, Some(16));

    let summary = pipeline.run_with_dataset(&data).unwrap();
    assert_eq!(summary.n_concepts, 16);
    assert!(summary.critical_tokens.len() <= 5);
    assert!(!summary.critical_tokens.is_empty());
    assert!(summary.evaluation.value.is_finite());

    let report = summary.metric_report.as_ref().unwrap();
    assert_eq!(report.metrics.len(), 8);
    assert!(report.metrics.iter().all(|row| row.len() == 3));
    assert_eq!(report.pearson.len(), 8);
    for row in &report.pearson {
        for r in row.iter().filter(|r| !r.is_nan()) {
            assert!((-1.0..=1.0).contains(r));
        }
    }
    let dumps = std::fs::read_dir(out.path().join("vr_data")).unwrap().count();
    assert_eq!(dumps, 5);

    let path = pipeline.save_summary(&summary).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["extractor"], "neuron");
    assert!(json["critical_tokens"]["tokens"].is_array());
}

/// ConceptX clustering, checkpoint reload and reliability consistency
#[test]
#[serial]
fn test_pipeline_conceptx_rc() {
    let out = TempDir::new().unwrap();
    let model = tiny_model();
    let data = dataset(&model);

    let cfg = Config {
        extractor: "conceptx".to_string(),
        conceptx_max_token: 40,
        conceptx_clusters: 3,
        concept_idx: 0,
        evaluator: "otc-uci".to_string(),
        run_metric_eval: true,
        metric_evaluator: "rc".to_string(),
        evaluators: vec!["itc-uci".to_string(), "gradient-loss".to_string()],
        concept_idxs: vec![0, 1, 2],
        ..base_config(out.path())
    };
    let pipeline = Pipeline::new(cfg, model).unwrap();
    let summary = pipeline.run_with_dataset(&data).unwrap();
    assert_eq!(summary.n_concepts, 3);

    let report = summary.metric_report.as_ref().unwrap();
    assert_eq!(report.code, "rc");
    // two halves of two metrics
    assert_eq!(report.metrics.len(), 4);
    assert_eq!(report.pearson[0].len(), 2);
    assert!(out.path().join("rc_data").is_dir());

    let loaded = load_extractor(
        "conceptx",
        &out.path().join("conceptx"),
        pipeline.config(),
        &Device::Cpu,
    )
    .unwrap();
    assert_eq!(loaded.n_concepts(), 3);
    let a: Vec<Vec<f32>> = loaded.concepts().unwrap().to_vec2().unwrap();
    let reloaded = Config {
        load_extractor: true,
        load_path: out.path().join("conceptx").to_string_lossy().into_owned(),
        ..pipeline.config().clone()
    };
    let again = Pipeline::new(reloaded, tiny_model())
        .unwrap()
        .run_with_dataset(&data)
        .unwrap();
    assert_eq!(again.n_concepts, 3);
    assert_eq!(a.len(), 3);
    assert!(a.iter().all(|row| row.len() == 16));
}

/// TCAV probes on word lists
#[test]
#[serial]
fn test_pipeline_tcav() {
    let out = TempDir::new().unwrap();
    let model = tiny_model();
    let data = dataset(&model);

    let cfg = Config {
        extractor: "tcav".to_string(),
        tcav_concepts: vec![
            vec!["cat".to_string(), "dog".to_string()],
            vec!["red".to_string(), "Blue ".to_string(), "green".to_string()],
        ],
        tcav_max_samples: 60,
        concept_idx: 1,
        evaluator: "ablation-logit".to_string(),
        ..base_config(out.path())
    };
    let pipeline = Pipeline::new(cfg, model).unwrap();
    let summary = pipeline.run_with_dataset(&data).unwrap();
    assert_eq!(summary.n_concepts, 2);
    assert_eq!(summary.evaluator, "ablation-logit");
    assert!(out.path().join("tcav").join("extractor.json").exists());
}

/// Extraction leaves the loader after its rows, so evaluation reads new ones
#[test]
#[serial]
fn test_conceptx_extraction_advances_loader() {
    let out = TempDir::new().unwrap();
    let model = tiny_model();
    let data = dataset(&model);
    let cfg = Config {
        extractor: "conceptx".to_string(),
        conceptx_max_token: 40,
        conceptx_clusters: 3,
        ..base_config(out.path())
    };
    let pipeline = Pipeline::new(cfg, model).unwrap();
    let cfg = pipeline.config();

    let mut extractor = extractor_factory(cfg, &Device::Cpu).unwrap();
    let mut loader =
        TokenLoader::new(&data, cfg.model_batch_size, cfg.metric_eval_batchsize).unwrap();
    extractor
        .extract_concepts(pipeline.model(), &mut loader)
        .unwrap();
    // 40 positions span two batches of 4 rows x 8 tokens
    assert_eq!(loader.pointer(), 8);

    let eval: Vec<Vec<u32>> = loader.processed_batch().unwrap().to_vec2().unwrap();
    let expected: Vec<Vec<u32>> = data.tokens().narrow(0, 8, 4).unwrap().to_vec2().unwrap();
    assert_eq!(eval, expected);
}

/// Neuron pipeline on the tiny model, for driving evaluators by hand
fn neuron_pipeline(out: &Path) -> Pipeline {
    let cfg = Config {
        extractor: "neuron".to_string(),
        ..base_config(out)
    };
    Pipeline::new(cfg, tiny_model()).unwrap()
}

/// An identity intervention leaves the output distribution unchanged
#[test]
#[serial]
fn test_logit_distribution_corr_identity() {
    let out = TempDir::new().unwrap();
    let pipeline = neuron_pipeline(out.path());
    let data = dataset(pipeline.model());
    let extractor = extractor_factory(pipeline.config(), &Device::Cpu).unwrap();
    let ctx = EvalContext::new(pipeline.config(), pipeline.model(), extractor.as_ref());
    let tokens = data.tokens().narrow(0, 0, 2).unwrap();
    let same = Intervention::Scale(1.0);

    let values = |topk: Option<usize>, corr_func: &str| -> Vec<f32> {
        let corr = ctx
            .logit_distribution_corr(&tokens, &same, topk, corr_func)
            .unwrap();
        assert_eq!(corr.dims(), &[2, SEQ_LEN]);
        corr.flatten_all().unwrap().to_vec1().unwrap()
    };
    assert!(values(None, "pearson").iter().all(|v| (v - 1.0).abs() < 1e-3));
    assert!(values(Some(5), "pearson").iter().all(|v| (v - 1.0).abs() < 1e-3));
    assert!(values(None, "KL_div").iter().all(|v| v.abs() < 1e-5));
    assert!(values(None, "openai_var").iter().all(|v| (v - 1.0).abs() < 1e-4));

    let err = ctx
        .logit_distribution_corr(&tokens, &same, None, "spearman")
        .unwrap_err()
        .to_string();
    for name in ["pearson", "KL_div", "openai_var"] {
        assert!(err.contains(name), "{err}");
    }
}

/// Topics with fewer than three distinct tokens skip clustering
#[test]
#[serial]
fn test_silhouette_small_topics() {
    let out = TempDir::new().unwrap();
    let pipeline = neuron_pipeline(out.path());
    let extractor = extractor_factory(pipeline.config(), &Device::Cpu).unwrap();
    let ctx = EvalContext::new(pipeline.config(), pipeline.model(), extractor.as_ref());

    assert_eq!(ctx.silhouette_score(&[]).unwrap(), (1.0, 2.0));
    assert_eq!(ctx.silhouette_score(&[4, 4]).unwrap(), (1.0, 1.0));
    assert_eq!(ctx.silhouette_score(&[4, 5, 4]).unwrap(), (2.0, 0.0));

    let (k, score) = ctx.silhouette_score(&[4, 5, 10, 11, 13, 14]).unwrap();
    assert!((1.0..=5.0).contains(&k));
    assert!((-2.0..=1.0).contains(&score));
}

/// Embedding-space variants of input and output topic coherence
#[test]
#[serial]
fn test_embedding_coherence_evaluators() {
    let out = TempDir::new().unwrap();
    let pipeline = neuron_pipeline(out.path());
    let data = dataset(pipeline.model());
    let extractor = extractor_factory(pipeline.config(), &Device::Cpu).unwrap();
    let ctx = EvalContext::new(pipeline.config(), pipeline.model(), extractor.as_ref());
    let tokens = data.tokens().narrow(0, 0, 4).unwrap();
    let concept = extractor.concept(1).unwrap();

    let mut itc = evaluator_factory("itc-silhouette", ctx.clone()).unwrap();
    itc.update_concept(concept.clone());
    let result = itc.evaluate(&tokens, &Priors::default()).unwrap();
    assert!(result.value.is_finite());
    assert!(result.topic.is_some());

    let mut otc = evaluator_factory("otc-emb_dist", ctx).unwrap();
    otc.update_concept(concept);
    let result = otc.evaluate(&tokens, &Priors::default()).unwrap();
    assert!(result.value.is_finite());
    assert!(result.value >= 0.0);
}

/// Autoencoder training end to end
#[test]
#[serial]
fn test_pipeline_autoencoder() {
    let out = TempDir::new().unwrap();
    let model = tiny_model();
    let data = dataset(&model);

    let cfg = Config {
        extractor: "ae".to_string(),
        dict_mult: 2,
        concept_idx: 3,
        evaluator: "replace-pearson".to_string(),
        ..base_config(out.path())
    };
    let pipeline = Pipeline::new(cfg, model).unwrap();
    let summary = pipeline.run_with_dataset(&data).unwrap();
    assert_eq!(summary.n_concepts, 32);
    assert!(out.path().join("ae").join("concepts.safetensors").exists());
    assert!(out.path().join("best_reconstruct").join("extractor.json").exists());

    let ae = load_extractor("ae", &out.path().join("ae"), pipeline.config(), &Device::Cpu).unwrap();
    let norms: Vec<f32> = ae
        .concepts()
        .unwrap()
        .sqr()
        .unwrap()
        .sum(1)
        .unwrap()
        .to_vec1()
        .unwrap();
    assert!(norms.iter().all(|n| (n - 1.0).abs() < 1e-4));
}

/// Test loading Pythia-70m from the hub
#[test]
#[ignore = "requires model download"]
#[serial]
fn test_pythia_loading() {
    let cfg = Config {
        device: "cpu".to_string(),
        ..Config::default()
    };
    let model = HookedModel::load(&cfg).unwrap();
    assert_eq!(model.n_layers(), 6);
    assert_eq!(model.d_model(), 512);

    let ids = model.encode("The quick brown fox").unwrap();
    let tokens = Tensor::new(ids.as_slice(), &Device::Cpu)
        .unwrap()
        .unsqueeze(0)
        .unwrap();
    let hidden = model
        .hidden_states(&tokens, &HookPoint::ResidPost(0))
        .unwrap();
    assert_eq!(hidden.dims(), &[1, ids.len(), 512]);
}

/// Test the critical-token sweep on GPT-2 small
#[test]
#[ignore = "requires model download"]
#[serial]
fn test_gpt2_neuron_critical_tokens() {
    let out = TempDir::new().unwrap();
    let cfg = Config {
        model_to_interpret: "gpt2-small".to_string(),
        extractor: "neuron".to_string(),
        ..base_config(out.path())
    };
    let model = HookedModel::load(&cfg).unwrap();
    let data = dataset_from_text(&model);
    let summary = Pipeline::new(cfg, model)
        .unwrap()
        .run_with_dataset(&data)
        .unwrap();
    assert_eq!(summary.n_concepts, 768);
    assert!(summary.critical_tokens.len() <= 5);
}

fn dataset_from_text(model: &HookedModel) -> TokenDataset {
    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.extend(
            model
                .encode("The cat sat on the mat while the dog ran to the river.")
                .unwrap(),
        );
    }
    TokenDataset::from_ids(ids, SEQ_LEN).unwrap()
}
