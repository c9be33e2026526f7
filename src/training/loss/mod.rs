//! Loss functions for causal language model fine-tuning

use anyhow::Result;
use candle_core::{DType, Tensor};

/// Shifted next-token cross-entropy
///
/// Position `t` of `logits` predicts `labels[t + 1]`, i.e. the loss is taken
/// between `logits[:, :-1]` and `labels[:, 1:]`, averaged over every
/// position. Padding ids in `labels` are scored like any other token.
///
/// # Arguments
/// * `logits` - `[batch, seq, vocab]`
/// * `labels` - `[batch, seq]` u32 token ids
pub fn causal_lm_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    let (label_batch, label_len) = labels.dims2()?;
    if batch != label_batch || seq_len != label_len {
        anyhow::bail!(
            "Logits [{}, {}, _] and labels [{}, {}] disagree",
            batch,
            seq_len,
            label_batch,
            label_len
        );
    }
    if seq_len < 2 {
        anyhow::bail!("Need at least 2 positions for a shifted loss, got {}", seq_len);
    }

    let shifted_logits = logits
        .narrow(1, 0, seq_len - 1)?
        .to_dtype(DType::F32)?
        .contiguous()?
        .reshape((batch * (seq_len - 1), vocab))?;
    let shifted_labels = labels
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::U32)?
        .contiguous()?
        .flatten_all()?;

    Ok(candle_nn::loss::cross_entropy(&shifted_logits, &shifted_labels)?)
}
