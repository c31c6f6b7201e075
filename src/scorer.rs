//! Per-token log-probabilities of a causal language model

use crate::error::{DpoError, DpoResult};
use candle_core::{bail, Device, ModuleT, Result, Tensor, D};
use candle_nn::ops::log_softmax;

/// Anything that can score token sequences
///
/// `token_logprobs` maps `(batch, seq)` token ids to `(batch, seq - 1)` where
/// entry `t` is `log p(token[t + 1] | token[..=t])`.
pub trait Scorer {
    fn token_logprobs(&self, input_ids: &Tensor) -> Result<Tensor>;
}

impl<S: Scorer + ?Sized> Scorer for &S {
    fn token_logprobs(&self, input_ids: &Tensor) -> Result<Tensor> {
        (**self).token_logprobs(input_ids)
    }
}

/// Log-softmax over the vocabulary followed by a gather of the next tokens
pub fn token_logprobs_from_logits(logits: &Tensor, input_ids: &Tensor) -> Result<Tensor> {
    let (_b, seq_len, _vocab_size) = logits.dims3()?;
    if seq_len < 2 {
        bail!("scoring needs at least two tokens per sequence, got {seq_len}")
    }
    let logits = logits.narrow(1, 0, seq_len - 1)?;
    let log_probas = log_softmax(&logits, D::Minus1)?;
    let targets = input_ids
        .narrow(1, 1, seq_len - 1)?
        .contiguous()?
        .unsqueeze(D::Minus1)?;
    log_probas.gather(&targets, D::Minus1)?.squeeze(D::Minus1)
}

/// Adapts a logits-producing model into a `Scorer`
///
/// The model always runs in inference mode (`train = false`).
pub struct LogitsScorer<'a, M: ModuleT> {
    model: &'a M,
}

impl<'a, M: ModuleT> LogitsScorer<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self { model }
    }
}

impl<M: ModuleT> Scorer for LogitsScorer<'_, M> {
    fn token_logprobs(&self, input_ids: &Tensor) -> Result<Tensor> {
        let logits = self.model.forward_t(input_ids, false)?;
        token_logprobs_from_logits(&logits, input_ids)
    }
}

/// Detaches the output of the wrapped scorer from the gradient graph
///
/// Wraps the separate-copy reference, whose variables are never handed to an
/// optimizer.
pub struct FrozenScorer<S> {
    inner: S,
}

impl<S: Scorer> FrozenScorer<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: Scorer> Scorer for FrozenScorer<S> {
    fn token_logprobs(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.inner.token_logprobs(input_ids)?.detach())
    }
}

/// Sum of `log p(token[t] | token[..t])` over the completion region of a
/// single sequence
///
/// Scored positions are `max(prompt_length, 1)..tokens.len()`; an empty region
/// scores 0.
pub fn completion_logprob<S: Scorer + ?Sized>(
    scorer: &S,
    tokens: &[u32],
    prompt_length: usize,
    device: &Device,
) -> DpoResult<f64> {
    if prompt_length > tokens.len() {
        return Err(DpoError::MisalignedInput {
            index: 0,
            prompt_length,
            sequence: "scored",
            sequence_length: tokens.len(),
        });
    }
    let first_scored = std::cmp::max(prompt_length, 1);
    if first_scored >= tokens.len() {
        return Ok(0_f64);
    }

    let input_ids = Tensor::new(tokens, device)?.unsqueeze(0)?;
    let logprobs = scorer.token_logprobs(&input_ids)?;
    // target t + 1 lives at column t
    let region = logprobs.narrow(1, first_scored - 1, tokens.len() - first_scored)?;
    let total = region.sum_all()?.to_dtype(candle_core::DType::F64)?;
    Ok(total.to_scalar::<f64>()?)
}
