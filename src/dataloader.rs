//! Batching over a token dataset, and the shuffled activation buffer that
//! feeds autoencoder training.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::dataset::TokenDataset;
use crate::hooks::HookPoint;
use crate::model::HookedModel;

/// Cursor over the rows of a [`TokenDataset`]
pub struct TokenLoader {
    tokens: Tensor,
    batch_size: usize,
    eval_batch_size: usize,
    pointer: usize,
}

impl TokenLoader {
    /// `batch_size` rows per model batch, `eval_batch_size` rows per
    /// processed (evaluation) batch
    pub fn new(dataset: &TokenDataset, batch_size: usize, eval_batch_size: usize) -> Result<Self> {
        anyhow::ensure!(!dataset.is_empty(), "Dataset is empty");
        anyhow::ensure!(
            batch_size > 0 && eval_batch_size > 0,
            "Batch sizes must be positive"
        );
        Ok(Self {
            tokens: dataset.tokens().clone(),
            batch_size,
            eval_batch_size,
            pointer: 0,
        })
    }

    /// Number of model batches in one pass over the data
    pub fn len(&self) -> usize {
        self.n_rows().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    pub fn n_rows(&self) -> usize {
        self.tokens.dims()[0]
    }

    pub fn pointer(&self) -> usize {
        self.pointer
    }

    /// Rows `[pointer, pointer + batch_size)`, clipped at the end of the data
    pub fn pointer_batch(&self) -> Result<Tensor> {
        let len = self.batch_size.min(self.n_rows() - self.pointer);
        Ok(self.tokens.narrow(0, self.pointer, len)?)
    }

    /// Move to the next model batch, wrapping to the start
    pub fn advance(&mut self) {
        self.pointer += self.batch_size;
        if self.pointer >= self.n_rows() {
            self.pointer = 0;
        }
    }

    /// The next `eval_batch_size` rows from the pointer, wrapping around the
    /// data; the pointer moves past them.
    pub fn processed_batch(&mut self) -> Result<Tensor> {
        let n = self.n_rows();
        let idx: Vec<u32> = (0..self.eval_batch_size)
            .map(|i| ((self.pointer + i) % n) as u32)
            .collect();
        let idx = Tensor::new(idx.as_slice(), &Device::Cpu)?;
        let batch = self.tokens.index_select(&idx, 0)?;
        self.pointer = (self.pointer + self.eval_batch_size) % n;
        Ok(batch)
    }

    pub fn reset(&mut self) {
        self.pointer = 0;
    }
}

/// Shuffled store of hooked activations for autoencoder training
pub struct ActivationBuffer {
    buffer: Option<Tensor>,
    hook: HookPoint,
    buffer_size: usize,
    batch_size: usize,
    pointer: usize,
    rng: StdRng,
}

impl ActivationBuffer {
    pub fn new(hook: HookPoint, buffer_size: usize, batch_size: usize, seed: u64) -> Result<Self> {
        anyhow::ensure!(
            batch_size > 0 && batch_size <= buffer_size,
            "batch_size {batch_size} must be in 1..={buffer_size}"
        );
        Ok(Self {
            buffer: None,
            hook,
            buffer_size,
            batch_size,
            pointer: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Keep the unread rows, top up from the model and reshuffle
    fn refresh(&mut self, model: &HookedModel, loader: &mut TokenLoader) -> Result<()> {
        let mut parts = Vec::new();
        let mut have = 0;
        if let Some(buffer) = &self.buffer {
            let rest = buffer.dims()[0] - self.pointer;
            if rest > 0 {
                parts.push(buffer.narrow(0, self.pointer, rest)?);
                have = rest;
            }
        }

        while have < self.buffer_size {
            let tokens = loader.pointer_batch()?;
            loader.advance();
            let acts = model.hidden_states(&tokens, &self.hook)?;
            let (b, t, d) = acts.dims3()?;
            let acts = acts.reshape((b * t, d))?.to_device(&Device::Cpu)?;
            let take = (b * t).min(self.buffer_size - have);
            parts.push(acts.narrow(0, 0, take)?);
            have += take;
        }

        let all = Tensor::cat(&parts, 0)?.to_dtype(DType::F32)?;
        let mut order: Vec<u32> = (0..have as u32).collect();
        order.shuffle(&mut self.rng);
        let order = Tensor::new(order.as_slice(), &Device::Cpu)?;
        self.buffer = Some(all.index_select(&order, 0)?);
        self.pointer = 0;
        debug!("Refreshed activation buffer with {have} rows");
        Ok(())
    }

    /// `batch_size` activation rows on the model's device
    pub fn next_batch(&mut self, model: &HookedModel, loader: &mut TokenLoader) -> Result<Tensor> {
        if self.buffer.is_none() || self.pointer + self.batch_size > self.buffer_size / 2 {
            self.refresh(model, loader)?;
        }
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Activation buffer is empty"))?;
        let batch = buffer.narrow(0, self.pointer, self.batch_size)?;
        self.pointer += self.batch_size;
        Ok(batch.to_device(model.device())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(rows: u32) -> TokenDataset {
        TokenDataset::from_ids((0..rows * 2).collect(), 2).unwrap()
    }

    #[test]
    fn test_pointer_batches_cover_data() {
        let data = dataset(5);
        let mut loader = TokenLoader::new(&data, 2, 3).unwrap();
        assert_eq!(loader.len(), 3);

        let mut firsts = Vec::new();
        for _ in 0..loader.len() {
            let batch: Vec<Vec<u32>> = loader.pointer_batch().unwrap().to_vec2().unwrap();
            firsts.push(batch[0][0]);
            loader.advance();
        }
        assert_eq!(firsts, vec![0, 4, 8]);
        assert_eq!(loader.pointer(), 0);
    }

    #[test]
    fn test_last_pointer_batch_is_clipped() {
        let data = dataset(5);
        let mut loader = TokenLoader::new(&data, 2, 3).unwrap();
        loader.advance();
        loader.advance();
        assert_eq!(loader.pointer_batch().unwrap().dims(), &[1, 2]);
    }

    #[test]
    fn test_processed_batch_wraps() {
        let data = dataset(4);
        let mut loader = TokenLoader::new(&data, 2, 3).unwrap();
        let first: Vec<Vec<u32>> = loader.processed_batch().unwrap().to_vec2().unwrap();
        assert_eq!(first.iter().map(|r| r[0]).collect::<Vec<_>>(), vec![0, 2, 4]);

        let second: Vec<Vec<u32>> = loader.processed_batch().unwrap().to_vec2().unwrap();
        assert_eq!(second.iter().map(|r| r[0]).collect::<Vec<_>>(), vec![6, 0, 2]);

        loader.reset();
        assert_eq!(loader.pointer(), 0);
    }
}
