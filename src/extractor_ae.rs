//! Sparse autoencoder over hooked activations
//!
//! ```text
//! acts  = ReLU((x - b_dec) @ W_enc + b_enc)      [B, d_hidden]
//! x_hat = acts @ W_dec + b_dec                   [B, act_size]
//! loss  = sum((x_hat - x)^2, -1).mean() + l1_coeff * sum(|acts|)
//! ```
//!
//! `d_hidden = act_size * dict_mult`. Decoder rows are kept at unit norm and
//! are the concepts; the activation of concept `i` is feature `i` of `acts`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::config::Config;
use crate::dataloader::{ActivationBuffer, TokenLoader};
use crate::extractors::{read_checkpoint, take_tensor, Concept, ConceptExtractor};
use crate::hooks::HookPoint;
use crate::model::HookedModel;

const BEST_DIR: &str = "best_reconstruct";

/// Optimisation settings copied out of the config
#[derive(Debug, Clone)]
struct TrainSettings {
    l1_coeff: f64,
    lr: f64,
    beta1: f64,
    beta2: f64,
    batch_size: usize,
    buffer_size: usize,
    steps: usize,
    val_freq: usize,
    reinit: bool,
    remove_parallel: bool,
    init_type: String,
    seed: u64,
    output_dir: PathBuf,
}

impl TrainSettings {
    fn from_config(cfg: &Config) -> Result<Self> {
        let num_batches = cfg
            .num_batches
            .ok_or_else(|| anyhow::anyhow!("num_batches is unset, run process_cfg first"))?;
        let buffer_size = cfg
            .buffer_size
            .ok_or_else(|| anyhow::anyhow!("buffer_size is unset, run process_cfg first"))?;
        Ok(Self {
            l1_coeff: cfg.l1_coeff,
            lr: cfg.lr,
            beta1: cfg.beta1,
            beta2: cfg.beta2,
            batch_size: cfg.batch_size,
            buffer_size,
            steps: cfg.epoch * num_batches,
            val_freq: cfg.val_freq,
            reinit: cfg.reinit,
            remove_parallel: cfg.remove_parallel,
            init_type: cfg.init_type.clone(),
            seed: cfg.seed,
            output_dir: PathBuf::from(&cfg.output_dir),
        })
    }
}

/// Loss terms of one batch
struct AeOutput {
    loss: Tensor,
    l2_loss: Tensor,
    l1_loss: Tensor,
    acts: Tensor,
}

pub struct AutoEncoder {
    hook: HookPoint,
    act_size: usize,
    d_hidden: usize,
    /// `[act_size, d_hidden]`; `None` when tied to the decoder
    w_enc: Option<Var>,
    b_enc: Var,
    /// `[d_hidden, act_size]`
    w_dec: Var,
    b_dec: Var,
    settings: Option<TrainSettings>,
    rng: StdRng,
}

/// Uniform init in the manner of `kaiming_uniform_` / `xavier_uniform_`
/// for a `[rows, cols]` weight
fn init_weight(
    init_type: &str,
    (rows, cols): (usize, usize),
    rng: &mut StdRng,
    device: &Device,
) -> Result<Tensor> {
    let bound = match init_type {
        "kaiming_uniform" => (6.0 / cols as f64).sqrt(),
        "xavier_uniform" => (6.0 / (rows + cols) as f64).sqrt(),
        other => anyhow::bail!(
            "Unknown init_type '{other}', choose from [\"kaiming_uniform\", \"xavier_uniform\"]"
        ),
    };
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-bound..bound) as f32)
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

fn normalize_rows(w: &Tensor) -> Result<Tensor> {
    let norm = (w.sqr()?.sum_keepdim(1)?.sqrt()? + 1e-12)?;
    Ok(w.broadcast_div(&norm)?)
}

impl AutoEncoder {
    pub fn new(cfg: &Config, device: &Device) -> Result<Self> {
        let act_size = cfg.act_size()?;
        let d_hidden = act_size * cfg.dict_mult;
        let settings = TrainSettings::from_config(cfg)?;
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let w_enc = init_weight(&cfg.init_type, (act_size, d_hidden), &mut rng, device)?;
        let w_dec = init_weight(&cfg.init_type, (d_hidden, act_size), &mut rng, device)?;
        let w_dec = normalize_rows(&w_dec)?;

        let w_enc = if cfg.tied_enc_dec {
            None
        } else {
            Some(Var::from_tensor(&w_enc)?)
        };
        info!(
            "Autoencoder: {act_size} -> {d_hidden} features{}",
            if w_enc.is_none() { " (tied)" } else { "" }
        );

        Ok(Self {
            hook: cfg.hook_point()?,
            act_size,
            d_hidden,
            w_enc,
            b_enc: Var::zeros(d_hidden, DType::F32, device)?,
            w_dec: Var::from_tensor(&w_dec)?,
            b_dec: Var::zeros(act_size, DType::F32, device)?,
            settings: Some(settings),
            rng,
        })
    }

    pub fn load(dir: &Path, cfg: &Config, device: &Device) -> Result<Self> {
        let (meta, mut tensors) = read_checkpoint(dir, "ae", device)?;
        let w_enc = take_tensor(&mut tensors, "W_enc")?.to_dtype(DType::F32)?;
        let w_dec = take_tensor(&mut tensors, "W_dec")?.to_dtype(DType::F32)?;
        let (act_size, d_hidden) = w_enc.dims2()?;
        anyhow::ensure!(
            w_dec.dims2()? == (d_hidden, act_size) && act_size == meta.act_size,
            "Inconsistent autoencoder shapes: W_enc {:?}, W_dec {:?}",
            w_enc.dims(),
            w_dec.dims()
        );
        Ok(Self {
            hook: meta.act_name.parse()?,
            act_size,
            d_hidden,
            w_enc: Some(Var::from_tensor(&w_enc)?),
            b_enc: Var::from_tensor(&take_tensor(&mut tensors, "b_enc")?.to_dtype(DType::F32)?)?,
            w_dec: Var::from_tensor(&w_dec)?,
            b_dec: Var::from_tensor(&take_tensor(&mut tensors, "b_dec")?.to_dtype(DType::F32)?)?,
            settings: TrainSettings::from_config(cfg).ok(),
            rng: StdRng::seed_from_u64(cfg.seed),
        })
    }

    fn encoder_weight(&self) -> Result<Tensor> {
        match &self.w_enc {
            Some(w) => Ok(w.as_tensor().clone()),
            None => Ok(self.w_dec.as_tensor().t()?),
        }
    }

    fn vars(&self) -> Vec<Var> {
        let mut vars = vec![self.b_enc.clone(), self.w_dec.clone(), self.b_dec.clone()];
        if let Some(w) = &self.w_enc {
            vars.push(w.clone());
        }
        vars
    }

    /// Feature activations `[B, d_hidden]` of `x` (`[B, act_size]`)
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let centred = x.broadcast_sub(self.b_dec.as_tensor())?;
        Ok(centred
            .matmul(&self.encoder_weight()?)?
            .broadcast_add(self.b_enc.as_tensor())?
            .relu()?)
    }

    pub fn decode(&self, acts: &Tensor) -> Result<Tensor> {
        Ok(acts
            .matmul(self.w_dec.as_tensor())?
            .broadcast_add(self.b_dec.as_tensor())?)
    }

    fn forward(&self, x: &Tensor, l1_coeff: f64) -> Result<AeOutput> {
        let x = x.to_dtype(DType::F32)?;
        let acts = self.encode(&x)?;
        let recon = self.decode(&acts)?;
        let l2_loss = (recon - &x)?.sqr()?.sum(1)?.mean(0)?;
        let l1_loss = (acts.abs()?.sum_all()? * l1_coeff)?;
        let loss = (&l2_loss + &l1_loss)?;
        Ok(AeOutput {
            loss,
            l2_loss,
            l1_loss,
            acts,
        })
    }

    /// Drop the component of the decoder gradient along each decoder row
    fn remove_parallel_component(&self, grads: &mut GradStore) -> Result<()> {
        let w_dec = self.w_dec.as_tensor();
        let Some(grad) = grads.get(w_dec).cloned() else {
            return Ok(());
        };
        let normed = normalize_rows(w_dec)?;
        let parallel = (&grad * &normed)?.sum_keepdim(1)?;
        let cleaned = (grad - parallel.broadcast_mul(&normed)?)?;
        grads.insert(w_dec, cleaned);
        Ok(())
    }

    /// Fresh weights for the features flagged in `dead` (u8, `[d_hidden]`)
    fn reinit_dead(&mut self, dead: &Tensor, init_type: &str) -> Result<()> {
        let device = self.w_dec.device().clone();
        let fresh_dec = normalize_rows(&init_weight(
            init_type,
            (self.d_hidden, self.act_size),
            &mut self.rng,
            &device,
        )?)?;
        let row_mask = dead
            .reshape((self.d_hidden, 1))?
            .broadcast_as((self.d_hidden, self.act_size))?
            .contiguous()?;
        self.w_dec
            .set(&row_mask.where_cond(&fresh_dec, self.w_dec.as_tensor())?)?;

        if let Some(w_enc) = &self.w_enc {
            let fresh_enc = init_weight(
                init_type,
                (self.act_size, self.d_hidden),
                &mut self.rng,
                &device,
            )?;
            let col_mask = dead
                .reshape((1, self.d_hidden))?
                .broadcast_as((self.act_size, self.d_hidden))?
                .contiguous()?;
            w_enc.set(&col_mask.where_cond(&fresh_enc, w_enc.as_tensor())?)?;
        }

        let zeros = self.b_enc.as_tensor().zeros_like()?;
        self.b_enc
            .set(&dead.where_cond(&zeros, self.b_enc.as_tensor())?)?;
        Ok(())
    }

    /// Train on activations streamed from `model`
    pub fn fit(&mut self, model: &HookedModel, loader: &mut TokenLoader) -> Result<()> {
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Autoencoder has no training settings"))?;
        anyhow::ensure!(settings.steps > 0, "Autoencoder training has zero steps");

        let mut buffer = ActivationBuffer::new(
            self.hook.clone(),
            settings.buffer_size,
            settings.batch_size,
            settings.seed,
        )?;
        let params = ParamsAdamW {
            lr: settings.lr,
            beta1: settings.beta1,
            beta2: settings.beta2,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let mut opt = AdamW::new(self.vars(), params)?;
        let device = self.w_dec.device().clone();
        let best_dir = settings.output_dir.join(BEST_DIR);

        let mut freq = Tensor::zeros(self.d_hidden, DType::F32, &device)?;
        let (mut window, mut window_l2, mut window_l1) = (0usize, 0f64, 0f64);
        let mut best_l2 = f64::INFINITY;

        info!("Training autoencoder for {} steps", settings.steps);
        for step in 1..=settings.steps {
            let x = buffer.next_batch(model, loader)?;
            let out = self.forward(&x, settings.l1_coeff)?;

            let mut grads = out.loss.backward()?;
            if settings.remove_parallel {
                self.remove_parallel_component(&mut grads)?;
            }
            opt.step(&grads)?;
            self.w_dec.set(&normalize_rows(self.w_dec.as_tensor())?)?;

            freq = (freq + out.acts.gt(0f32)?.to_dtype(DType::F32)?.sum(0)?)?;
            window += 1;
            window_l2 += f64::from(out.l2_loss.to_scalar::<f32>()?);
            window_l1 += f64::from(out.l1_loss.to_scalar::<f32>()?);

            if step % settings.val_freq == 0 || step == settings.steps {
                let dead = freq.eq(0f32)?;
                let n_dead = dead.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()? as usize;
                let l2 = window_l2 / window as f64;
                info!(
                    "step {step}/{}: l2 {l2:.5}, l1 {:.5}, dead features {n_dead}/{}",
                    settings.steps,
                    window_l1 / window as f64,
                    self.d_hidden
                );

                if l2 < best_l2 {
                    best_l2 = l2;
                    self.save(&best_dir)?;
                    debug!("New best reconstruction {l2:.5}");
                }
                if settings.reinit && n_dead > 0 && step < settings.steps {
                    self.reinit_dead(&dead, &settings.init_type)?;
                    debug!("Re-initialised {n_dead} dead features");
                }

                freq = freq.zeros_like()?;
                (window, window_l2, window_l1) = (0, 0.0, 0.0);
            }
        }
        Ok(())
    }
}

impl ConceptExtractor for AutoEncoder {
    fn code(&self) -> &'static str {
        "ae"
    }

    fn hook(&self) -> &HookPoint {
        &self.hook
    }

    fn extract_concepts(&mut self, model: &HookedModel, loader: &mut TokenLoader) -> Result<()> {
        self.fit(model, loader)
    }

    fn concepts(&self) -> Result<Tensor> {
        Ok(self.w_dec.as_tensor().clone())
    }

    fn n_concepts(&self) -> usize {
        self.d_hidden
    }

    fn act_size(&self) -> usize {
        self.act_size
    }

    fn activations_from_hidden(&self, hidden: &Tensor, concept: &Concept) -> Result<Tensor> {
        anyhow::ensure!(
            concept.idx < self.d_hidden,
            "Feature {} out of range ({} features)",
            concept.idx,
            self.d_hidden
        );
        let (b, t, d) = hidden.dims3()?;
        let w = self.encoder_weight()?.narrow(1, concept.idx, 1)?;
        let bias = self.b_enc.as_tensor().narrow(0, concept.idx, 1)?;
        let x = hidden
            .to_dtype(DType::F32)?
            .reshape((b * t, d))?
            .broadcast_sub(self.b_dec.as_tensor())?;
        Ok(x.matmul(&w)?.broadcast_add(&bias)?.relu()?.reshape((b, t))?)
    }

    fn tensors(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([
            ("W_enc".to_string(), self.encoder_weight()?.contiguous()?),
            ("b_enc".to_string(), self.b_enc.as_tensor().clone()),
            ("W_dec".to_string(), self.w_dec.as_tensor().clone()),
            ("b_dec".to_string(), self.b_dec.as_tensor().clone()),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tied: bool) -> Config {
        Config {
            act_size: Some(4),
            dict_mult: 2,
            tied_enc_dec: tied,
            num_batches: Some(1),
            buffer_size: Some(16),
            batch_size: 8,
            ..Config::default()
        }
    }

    #[test]
    fn test_decoder_rows_unit_norm() {
        let ae = AutoEncoder::new(&config(false), &Device::Cpu).unwrap();
        let norms: Vec<f32> = ae
            .concepts()
            .unwrap()
            .sqr()
            .unwrap()
            .sum(1)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(norms.len(), 8);
        for n in norms {
            assert!((n - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_init_is_seeded() {
        let a = AutoEncoder::new(&config(false), &Device::Cpu).unwrap();
        let b = AutoEncoder::new(&config(false), &Device::Cpu).unwrap();
        let wa: Vec<Vec<f32>> = a.concepts().unwrap().to_vec2().unwrap();
        let wb: Vec<Vec<f32>> = b.concepts().unwrap().to_vec2().unwrap();
        assert_eq!(wa, wb);
    }

    #[test]
    fn test_bad_init_type() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(init_weight("orthogonal", (2, 2), &mut rng, &Device::Cpu).is_err());
    }

    #[test]
    fn test_feature_activation_matches_encode() {
        let ae = AutoEncoder::new(&config(true), &Device::Cpu).unwrap();
        let hidden = Tensor::new(
            &[[[1f32, -2.0, 0.5, 3.0], [0.0, 1.0, 1.0, -1.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let full: Vec<Vec<f32>> = ae
            .encode(&hidden.reshape((2, 4)).unwrap())
            .unwrap()
            .to_vec2()
            .unwrap();
        let c = ae.concept(3).unwrap();
        let one: Vec<Vec<f32>> = ae
            .activations_from_hidden(&hidden, &c)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert!((one[0][0] - full[0][3]).abs() < 1e-6);
        assert!((one[0][1] - full[1][3]).abs() < 1e-6);
    }

    #[test]
    fn test_remove_parallel_leaves_orthogonal_gradient() {
        let ae = AutoEncoder::new(&config(false), &Device::Cpu).unwrap();
        let x = Tensor::new(&[[1f32, 2.0, 3.0, 4.0], [-1.0, 0.5, 0.0, 2.0]], &Device::Cpu).unwrap();
        let out = ae.forward(&x, 0.1).unwrap();
        let mut grads = out.loss.backward().unwrap();
        ae.remove_parallel_component(&mut grads).unwrap();

        let grad = grads.get(ae.w_dec.as_tensor()).unwrap();
        let dots: Vec<f32> = (grad * ae.w_dec.as_tensor())
            .unwrap()
            .sum(1)
            .unwrap()
            .to_vec1()
            .unwrap();
        for d in dots {
            assert!(d.abs() < 1e-4);
        }
    }

    #[test]
    fn test_reinit_touches_only_dead_features() {
        let mut ae = AutoEncoder::new(&config(false), &Device::Cpu).unwrap();
        ae.b_enc
            .set(&Tensor::ones(8, DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let before: Vec<Vec<f32>> = ae.concepts().unwrap().to_vec2().unwrap();
        let dead = Tensor::new(&[1u8, 0, 0, 0, 0, 0, 0, 0], &Device::Cpu).unwrap();
        ae.reinit_dead(&dead, "kaiming_uniform").unwrap();

        let after: Vec<Vec<f32>> = ae.concepts().unwrap().to_vec2().unwrap();
        assert_ne!(before[0], after[0]);
        assert_eq!(before[1..], after[1..]);
        let b_enc: Vec<f32> = ae.b_enc.as_tensor().to_vec1().unwrap();
        assert_eq!(b_enc[0], 0.0);
        assert_eq!(b_enc[1], 1.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let ae = AutoEncoder::new(&config(true), &Device::Cpu).unwrap();
        ae.save(dir.path()).unwrap();
        let loaded = AutoEncoder::load(dir.path(), &config(false), &Device::Cpu).unwrap();
        assert_eq!(loaded.n_concepts(), 8);
        assert_eq!(loaded.act_size(), 4);
        let a: Vec<Vec<f32>> = ae.encoder_weight().unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = loaded.encoder_weight().unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
    }
}
