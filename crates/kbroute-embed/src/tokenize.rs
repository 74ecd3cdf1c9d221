use anyhow::{Result, anyhow};
use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

/// Encode one text into `(input_ids, token_type_ids, attention_mask)`, each `[1,T]`.
///
/// Sequences longer than `max_len` are truncated. A single query needs no padding.
pub fn tokenize_on_device(tokenizer: &Tokenizer, text: &str, max_len: usize, device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
    let enc = tokenizer.encode(text, true).map_err(|e| anyhow!("Tokenization failed: {}", e))?;
    let mut ids = enc.get_ids().to_vec();
    let mut mask = enc.get_attention_mask().to_vec();
    if ids.len() > max_len { ids.truncate(max_len); mask.truncate(max_len); }
    if ids.is_empty() { return Err(anyhow!("Tokenizer produced no tokens")); }
    let input_ids = Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?;
    let token_type_ids = input_ids.zeros_like()?;
    let attention_mask = Tensor::new(mask.as_slice(), device)?.unsqueeze(0)?;
    Ok((input_ids, token_type_ids, attention_mask))
}
