//! Rotary position embeddings (rotate-half layout used by GPT-NeoX and LLaMA)

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};

pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    rot_dims: usize,
}

impl RotaryEmbedding {
    /// `rot_dims` leading dimensions of each head are rotated; the rest pass
    /// through unchanged (GPT-NeoX `rotary_pct`).
    pub fn new(
        rot_dims: usize,
        max_seq_len: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..rot_dims)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / rot_dims as f64)) as f32)
            .collect();
        let n_freq = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, n_freq), device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;

        // [seq, rot_dims/2] -> [seq, rot_dims]
        let freqs = positions.matmul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: emb.cos()?.to_dtype(dtype)?,
            sin: emb.sin()?.to_dtype(dtype)?,
            rot_dims,
        })
    }

    /// Rotate `q` and `k` of shape `[batch, heads, seq, head_dim]`
    pub fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        anyhow::ensure!(
            seq_len <= self.cos.dim(0)?,
            "Sequence length {seq_len} exceeds rotary table ({})",
            self.cos.dim(0)?
        );
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        Ok((self.rotate(q, &cos, &sin)?, self.rotate(k, &cos, &sin)?))
    }

    fn rotate(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let head_dim = x.dim(D::Minus1)?;
        let x_rot = x.narrow(D::Minus1, 0, self.rot_dims)?;
        let rotated = (x_rot.broadcast_mul(cos)? + rotate_half(&x_rot)?.broadcast_mul(sin)?)?;
        if self.rot_dims == head_dim {
            return Ok(rotated);
        }
        let x_pass = x.narrow(D::Minus1, self.rot_dims, head_dim - self.rot_dims)?;
        Ok(Tensor::cat(&[&rotated, &x_pass], D::Minus1)?)
    }
}

fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}
