use anyhow::Result;
use candle_core::{DType, Tensor};

/// Mean of the unmasked token states followed by L2 normalization.
///
/// `hidden` is `[B,T,H]`, `attention_mask` is `[B,T]` (any numeric dtype).
pub fn masked_mean_l2(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let dims = hidden.dims();
    anyhow::ensure!(dims.len() == 3, "hidden shape must be [B,T,H], got {:?}", dims);
    let (batch, hidden_dim) = (dims[0], dims[2]);

    let mask = attention_mask.to_device(hidden.device())?.to_dtype(hidden.dtype())?;
    let summed = hidden.broadcast_mul(&mask.unsqueeze(2)?)?.sum(1)?;
    let lengths = mask.sum_keepdim(1)?;
    let mean = summed.broadcast_div(&lengths)?;

    let eps_val = match hidden.dtype() { DType::F16 => 1e-6f64, _ => 1e-12f64 };
    let norm = (mean.sqr()?.sum_keepdim(1)?.sqrt()? + eps_val)?;
    let out = mean.broadcast_div(&norm)?;
    anyhow::ensure!(out.dims() == [batch, hidden_dim], "pooled shape mismatch: {:?}", out.dims());
    Ok(out)
}
