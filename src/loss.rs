//! The DPO objective
//!
//! For every pair the implicit rewards are
//! `r_chosen = beta * (policy_chosen - reference_chosen)` and
//! `r_rejected = beta * (policy_rejected - reference_rejected)`, and the
//! per-example loss is `softplus(-(r_chosen - r_rejected))`, i.e.
//! `-log sigmoid(z)`. The batch loss is the mean over examples.
//!
//! Batch statistics are accumulated in a canonical (sorted) order, so
//! permuting a batch gives bit-identical `loss`, `accuracy` and `margin`.

use crate::config::DpoConfig;
use crate::error::{DpoError, DpoResult};
use crate::pairs::{PreferenceCollator, TokenizedPair};
use crate::scorer::{completion_logprob, Scorer};
use candle_core::{Device, Tensor};
use itertools::Itertools;

/// Overflow-safe `ln(1 + e^x)`
pub fn softplus(x: f64) -> f64 {
    if x > 0_f64 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Element-wise `relu(x) + ln(1 + e^-|x|)`, differentiable and overflow-safe
pub fn softplus_tensor(xs: &Tensor) -> candle_core::Result<Tensor> {
    let tail = ((xs.abs()?.neg()?.exp()? + 1_f64)?).log()?;
    xs.relu()? + tail
}

/// Completion-region log-probability sums for one example
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogProbPair {
    pub policy_chosen: f64,
    pub policy_rejected: f64,
    pub reference_chosen: f64,
    pub reference_rejected: f64,
}

impl LogProbPair {
    pub fn new(
        policy_chosen: f64,
        policy_rejected: f64,
        reference_chosen: f64,
        reference_rejected: f64,
    ) -> Self {
        Self {
            policy_chosen,
            policy_rejected,
            reference_chosen,
            reference_rejected,
        }
    }
}

/// Batch-mean loss and diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct DpoLossOutput {
    pub loss: f64,
    /// Mean implicit reward of the chosen completions
    pub rewards_chosen: f64,
    /// Mean implicit reward of the rejected completions
    pub rewards_rejected: f64,
    /// Fraction of examples with `r_chosen > r_rejected`; ties count one half
    pub accuracy: f64,
    /// Mean of `r_chosen - r_rejected`
    pub margin: f64,
    /// Indices of examples whose chosen or rejected completion region is empty
    pub empty_completions: Vec<usize>,
}

/// Output of the tensor path: a differentiable loss plus its statistics
#[derive(Debug)]
pub struct DpoStepOutput {
    /// Scalar mean loss, connected to the policy's variables
    pub loss: Tensor,
    pub stats: DpoLossOutput,
}

/// Sums in ascending order, independent of the input order
fn canonical_mean(values: &[f64]) -> f64 {
    let total: f64 = values.iter().copied().sorted_by(f64::total_cmp).sum();
    total / values.len() as f64
}

pub struct PreferenceLossEngine {
    config: DpoConfig,
}

impl PreferenceLossEngine {
    pub fn new(config: DpoConfig) -> DpoResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn beta(&self) -> f64 {
        self.config.beta
    }

    /// Loss and diagnostics from precomputed log-probability sums
    pub fn compute(&self, batch: &[LogProbPair]) -> DpoResult<DpoLossOutput> {
        self.summarize(batch, Vec::new())
    }

    /// Scores every sequence on its own through `completion_logprob`
    pub fn compute_from_scorers<P: Scorer + ?Sized, R: Scorer + ?Sized>(
        &self,
        policy: &P,
        reference: &R,
        pairs: &[TokenizedPair],
        device: &Device,
    ) -> DpoResult<DpoLossOutput> {
        let empty_completions = check_pairs(pairs)?;
        let log_probs = pairs
            .iter()
            .map(|pair| {
                let prompt_length = pair.prompt_length();
                let (chosen, rejected) = (pair.chosen_tokens(), pair.rejected_tokens());
                Ok(LogProbPair::new(
                    completion_logprob(policy, chosen, prompt_length, device)?,
                    completion_logprob(policy, rejected, prompt_length, device)?,
                    completion_logprob(reference, chosen, prompt_length, device)?,
                    completion_logprob(reference, rejected, prompt_length, device)?,
                ))
            })
            .collect::<DpoResult<Vec<_>>>()?;
        self.summarize(&log_probs, empty_completions)
    }

    /// Batched forward passes of policy and reference and a differentiable loss
    ///
    /// The reference output is detached whatever scorer is passed in.
    pub fn compute_batch<P: Scorer + ?Sized, R: Scorer + ?Sized>(
        &self,
        policy: &P,
        reference: &R,
        pairs: &[TokenizedPair],
        collator: &PreferenceCollator,
    ) -> DpoResult<DpoStepOutput> {
        let empty_completions = check_pairs(pairs)?;
        let batch_size = pairs.len();
        let batch = collator.collate(pairs)?;

        let policy_logprobs = policy.token_logprobs(&batch.input_ids)?;
        let reference_logprobs = reference.token_logprobs(&batch.input_ids)?.detach();
        let policy_sums = (policy_logprobs * &batch.completion_mask)?.sum(1)?;
        let reference_sums = (reference_logprobs * &batch.completion_mask)?.sum(1)?;

        let chosen = |sums: &Tensor| sums.narrow(0, 0, batch_size);
        let rejected = |sums: &Tensor| sums.narrow(0, batch_size, batch_size);
        let rewards_chosen =
            ((chosen(&policy_sums)? - chosen(&reference_sums)?)? * self.config.beta)?;
        let rewards_rejected =
            ((rejected(&policy_sums)? - rejected(&reference_sums)?)? * self.config.beta)?;
        let z = (rewards_chosen - rewards_rejected)?;
        let loss = softplus_tensor(&z.neg()?)?.mean_all()?;

        let policy_values = policy_sums.to_dtype(candle_core::DType::F64)?.to_vec1::<f64>()?;
        let reference_values = reference_sums
            .to_dtype(candle_core::DType::F64)?
            .to_vec1::<f64>()?;
        let log_probs = (0..batch_size)
            .map(|ix| {
                LogProbPair::new(
                    policy_values[ix],
                    policy_values[batch_size + ix],
                    reference_values[ix],
                    reference_values[batch_size + ix],
                )
            })
            .collect::<Vec<_>>();
        let stats = self.summarize(&log_probs, empty_completions)?;
        Ok(DpoStepOutput { loss, stats })
    }

    fn summarize(
        &self,
        batch: &[LogProbPair],
        empty_completions: Vec<usize>,
    ) -> DpoResult<DpoLossOutput> {
        if batch.is_empty() {
            return Err(DpoError::InvalidConfiguration(
                "the batch must contain at least one example".to_string(),
            ));
        }
        let beta = self.config.beta;
        let n = batch.len();
        let mut rewards_chosen = Vec::with_capacity(n);
        let mut rewards_rejected = Vec::with_capacity(n);
        let mut margins = Vec::with_capacity(n);
        let mut losses = Vec::with_capacity(n);
        let mut votes = 0_usize;

        for (index, lp) in batch.iter().enumerate() {
            let r_chosen = beta * (lp.policy_chosen - lp.reference_chosen);
            let r_rejected = beta * (lp.policy_rejected - lp.reference_rejected);
            let z = r_chosen - r_rejected;
            let loss = softplus(-z);
            if !loss.is_finite() {
                tracing::warn!(index, value = loss, ?lp, "non-finite DPO loss");
                return Err(DpoError::NumericInstability { index, value: loss });
            }
            // two votes for a win, one for a tie
            votes += match z.partial_cmp(&0_f64) {
                Some(std::cmp::Ordering::Greater) => 2,
                Some(std::cmp::Ordering::Equal) => 1,
                _ => 0,
            };
            rewards_chosen.push(r_chosen);
            rewards_rejected.push(r_rejected);
            margins.push(z);
            losses.push(loss);
        }

        Ok(DpoLossOutput {
            loss: canonical_mean(&losses),
            rewards_chosen: canonical_mean(&rewards_chosen),
            rewards_rejected: canonical_mean(&rewards_rejected),
            accuracy: votes as f64 / (2 * n) as f64,
            margin: canonical_mean(&margins),
            empty_completions,
        })
    }
}

/// Rejects misaligned pairs and returns the indices with an empty completion
fn check_pairs(pairs: &[TokenizedPair]) -> DpoResult<Vec<usize>> {
    if pairs.is_empty() {
        return Err(DpoError::InvalidConfiguration(
            "the batch must contain at least one example".to_string(),
        ));
    }
    let mut empty = vec![];
    for (index, pair) in pairs.iter().enumerate() {
        for (sequence, tokens) in [
            ("chosen", pair.chosen_tokens()),
            ("rejected", pair.rejected_tokens()),
        ] {
            if pair.prompt_length() > tokens.len() {
                return Err(DpoError::MisalignedInput {
                    index,
                    prompt_length: pair.prompt_length(),
                    sequence,
                    sequence_length: tokens.len(),
                });
            }
        }
        if pair.has_empty_completion() {
            tracing::debug!(index, "pair has an empty completion region");
            empty.push(index);
        }
    }
    Ok(empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::{AdapterDisabledScorer, AdapterSwitch, LoraConfig};
    use crate::model::{frozen_copy, CausalLm, LoraAttachment, ModelConfig};
    use crate::scorer::{FrozenScorer, LogitsScorer};
    use anyhow::Result;
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
    use rstest::*;
    use std::f64::consts::LN_2;

    #[fixture]
    fn engine() -> PreferenceLossEngine {
        PreferenceLossEngine::new(DpoConfig::new(0.1)).unwrap()
    }

    #[fixture]
    fn mixed_batch() -> Vec<LogProbPair> {
        vec![
            LogProbPair::new(-10., -11., -12., -9.),
            LogProbPair::new(-3.5, -2.25, -3.0, -2.0),
            LogProbPair::new(-7.125, -7.125, -7.0, -7.0),
            LogProbPair::new(-40.0, -55.5, -41.0, -50.0),
            LogProbPair::new(-1.0, -1.0, -1.0, -1.0),
            LogProbPair::new(-0.3, -9.1, -0.7, -2.6),
        ]
    }

    #[fixture]
    fn toy_pairs() -> Vec<TokenizedPair> {
        vec![
            TokenizedPair::from_parts(vec![1, 2, 3, 4, 5], vec![1, 2, 3, 9], 3),
            TokenizedPair::from_parts(vec![7, 8, 10, 11], vec![7, 8, 12, 13, 14, 15], 2),
            TokenizedPair::from_parts(vec![20, 21, 22], vec![20, 23, 24], 1),
        ]
    }

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() < tol,
            "expected {expected}, got {actual}"
        );
    }

    #[rstest]
    #[case(0_f64)]
    #[case(-1_f64)]
    fn test_engine_rejects_non_positive_beta(#[case] beta: f64) {
        assert!(matches!(
            PreferenceLossEngine::new(DpoConfig::new(beta)),
            Err(DpoError::InvalidConfiguration(_))
        ));
    }

    #[rstest]
    fn test_empty_batch_is_invalid(engine: PreferenceLossEngine) {
        assert!(matches!(
            engine.compute(&[]),
            Err(DpoError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            engine.compute_batch(
                &FrozenScorer::new(ZeroScorer),
                &ZeroScorer,
                &[],
                &PreferenceCollator::new()
            ),
            Err(DpoError::InvalidConfiguration(_))
        ));
    }

    #[rstest]
    fn test_reference_scenario(engine: PreferenceLossEngine) -> Result<()> {
        let out = engine.compute(&[LogProbPair::new(-10., -11., -12., -9.)])?;

        assert_close(out.rewards_chosen, 0.2, 1e-12);
        assert_close(out.rewards_rejected, -0.2, 1e-12);
        assert_close(out.margin, 0.4, 1e-12);
        assert_close(out.loss, 0.5130, 1e-4);
        assert_eq!(out.accuracy, 1_f64);
        assert!(out.empty_completions.is_empty());
        Ok(())
    }

    #[rstest]
    #[case(-1.0, -2.0)]
    #[case(-150.0, -3.0)]
    #[case(-0.001, -900.0)]
    fn test_policy_equal_to_reference(
        engine: PreferenceLossEngine,
        #[case] chosen: f64,
        #[case] rejected: f64,
    ) -> Result<()> {
        let out = engine.compute(&[
            LogProbPair::new(chosen, rejected, chosen, rejected),
            LogProbPair::new(rejected, chosen, rejected, chosen),
        ])?;

        assert_eq!(out.margin, 0_f64);
        assert_close(out.loss, LN_2, 1e-15);
        assert_eq!(out.accuracy, 0.5_f64);
        Ok(())
    }

    #[rstest]
    fn test_loss_monotone_in_margin(engine: PreferenceLossEngine) -> Result<()> {
        let mut previous: Option<DpoLossOutput> = None;
        for policy_chosen in [-20.0, -15.0, -12.0, -10.0, -5.0, 0.0] {
            let out = engine.compute(&[LogProbPair::new(policy_chosen, -11., -12., -9.)])?;
            if let Some(prev) = previous {
                assert!(out.margin > prev.margin);
                assert!(out.loss < prev.loss);
            }
            previous = Some(out);
        }
        Ok(())
    }

    #[rstest]
    #[case(1e4_f64)]
    #[case(-1e4_f64)]
    #[case(800_f64)]
    #[case(-800_f64)]
    fn test_large_margins_stay_finite(#[case] diff: f64) -> Result<()> {
        let engine = PreferenceLossEngine::new(DpoConfig::new(1.))?;
        let out = engine.compute(&[LogProbPair::new(diff, 0., 0., 0.)])?;

        assert!(out.loss.is_finite());
        assert_close(out.loss, softplus(-diff), 1e-9);
        if diff > 0. {
            assert!(out.loss < 1e-300 || out.loss == 0.);
        } else {
            assert_close(out.loss, -diff, 1e-9);
        }
        Ok(())
    }

    #[rstest]
    fn test_softplus_matches_naive_form() {
        for x in [-30.0_f64, -2.0, -0.5, 0.0, 0.5, 2.0, 30.0] {
            assert_close(softplus(x), (1. + x.exp()).ln(), 1e-12);
        }
    }

    #[rstest]
    fn test_softplus_tensor() -> Result<()> {
        let xs = [-1000_f32, -2.0, 0.0, 3.0, 1000.0];
        let out = softplus_tensor(&Tensor::new(&xs, &Device::Cpu)?)?.to_vec1::<f32>()?;
        for (x, y) in xs.iter().zip(out.iter()) {
            assert!(y.is_finite());
            assert_close(*y as f64, softplus(*x as f64), 1e-4);
        }
        Ok(())
    }

    #[rstest]
    fn test_order_invariance(engine: PreferenceLossEngine, mixed_batch: Vec<LogProbPair>) -> Result<()> {
        let expected = engine.compute(&mixed_batch)?;

        let mut reversed = mixed_batch.clone();
        reversed.reverse();
        let out = engine.compute(&reversed)?;
        assert_eq!(out.loss.to_bits(), expected.loss.to_bits());
        assert_eq!(out.accuracy.to_bits(), expected.accuracy.to_bits());
        assert_eq!(out.margin.to_bits(), expected.margin.to_bits());

        let mut rng = StdRng::seed_from_u64(123_u64);
        for _ in 0..10 {
            let mut shuffled = mixed_batch.clone();
            shuffled.shuffle(&mut rng);
            let out = engine.compute(&shuffled)?;
            assert_eq!(out.loss.to_bits(), expected.loss.to_bits());
            assert_eq!(out.accuracy.to_bits(), expected.accuracy.to_bits());
            assert_eq!(out.margin.to_bits(), expected.margin.to_bits());
        }
        Ok(())
    }

    #[rstest]
    fn test_non_finite_loss_reports_index(engine: PreferenceLossEngine) {
        let batch = [
            LogProbPair::new(-1., -2., -1., -2.),
            LogProbPair::new(f64::NAN, -2., -1., -2.),
        ];
        assert!(matches!(
            engine.compute(&batch),
            Err(DpoError::NumericInstability { index: 1, .. })
        ));
    }

    /// Every token gets log-probability zero
    struct ZeroScorer;

    impl Scorer for ZeroScorer {
        fn token_logprobs(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
            let (b, s) = input_ids.dims2()?;
            Tensor::zeros((b, s - 1), DType::F32, input_ids.device())
        }
    }

    #[rstest]
    fn test_misaligned_pair(engine: PreferenceLossEngine) {
        let pairs = [
            TokenizedPair::from_parts(vec![1, 2, 3], vec![1, 2, 4], 2),
            TokenizedPair::from_parts(vec![1, 2, 3], vec![1, 2], 3),
        ];
        let expected = |result: DpoResult<DpoLossOutput>| {
            matches!(
                result,
                Err(DpoError::MisalignedInput {
                    index: 1,
                    prompt_length: 3,
                    sequence: "rejected",
                    sequence_length: 2,
                })
            )
        };
        assert!(expected(engine.compute_from_scorers(
            &ZeroScorer,
            &ZeroScorer,
            &pairs,
            &Device::Cpu
        )));
        assert!(expected(
            engine
                .compute_batch(&ZeroScorer, &ZeroScorer, &pairs, &PreferenceCollator::new())
                .map(|step| step.stats)
        ));
    }

    #[rstest]
    fn test_empty_completion_is_flagged(engine: PreferenceLossEngine) -> Result<()> {
        let pairs = [
            TokenizedPair::from_parts(vec![1, 2, 3], vec![1, 2, 4], 2),
            TokenizedPair::from_parts(vec![5, 6], vec![5, 6, 7], 2),
        ];
        let out = engine.compute_from_scorers(&ZeroScorer, &ZeroScorer, &pairs, &Device::Cpu)?;
        assert_eq!(out.empty_completions, vec![1_usize]);
        assert_close(out.loss, LN_2, 1e-15);
        Ok(())
    }

    #[rstest]
    fn test_tensor_path_matches_scalar_path(
        engine: PreferenceLossEngine,
        toy_pairs: Vec<TokenizedPair>,
    ) -> Result<()> {
        let dev = Device::Cpu;
        let policy_map = VarMap::new();
        let reference_map = VarMap::new();
        let cfg = ModelConfig::tiny_test();
        let policy = CausalLm::new(cfg, VarBuilder::from_varmap(&policy_map, DType::F32, &dev), None)?;
        let reference =
            CausalLm::new(cfg, VarBuilder::from_varmap(&reference_map, DType::F32, &dev), None)?;
        let policy_scorer = LogitsScorer::new(&policy);
        let reference_scorer = FrozenScorer::new(LogitsScorer::new(&reference));

        let step = engine.compute_batch(
            &policy_scorer,
            &reference_scorer,
            &toy_pairs,
            &PreferenceCollator::new().pad_token_id(0),
        )?;
        let scalar = engine.compute_from_scorers(&policy_scorer, &reference_scorer, &toy_pairs, &dev)?;

        assert_close(step.stats.loss, scalar.loss, 1e-4);
        assert_close(step.stats.margin, scalar.margin, 1e-4);
        assert_close(step.loss.to_scalar::<f32>()? as f64, scalar.loss, 1e-4);
        assert_eq!(step.stats.accuracy, scalar.accuracy);
        Ok(())
    }

    #[rstest]
    fn test_reference_modes_agree_at_init(
        engine: PreferenceLossEngine,
        toy_pairs: Vec<TokenizedPair>,
    ) -> Result<()> {
        let dev = Device::Cpu;
        let cfg = ModelConfig::tiny_test();
        let base_map = VarMap::new();
        let adapter_map = VarMap::new();
        let attachment = LoraAttachment {
            config: LoraConfig::new(4, 8.),
            vb: VarBuilder::from_varmap(&adapter_map, DType::F32, &dev),
            switch: AdapterSwitch::new(),
        };
        let policy = CausalLm::new(
            cfg,
            VarBuilder::from_varmap(&base_map, DType::F32, &dev),
            Some(&attachment),
        )?;

        // separate copy of the initial weights
        let copy_map = frozen_copy(&base_map)?;
        let copy = CausalLm::new(cfg, VarBuilder::from_varmap(&copy_map, DType::F32, &dev), None)?;
        let separate_copy = FrozenScorer::new(LogitsScorer::new(&copy));
        // the policy with its adapters switched off
        let adapter_toggle =
            AdapterDisabledScorer::new(LogitsScorer::new(&policy), attachment.switch.clone());

        let collator = PreferenceCollator::new().pad_token_id(0);
        let batch = collator.collate(&toy_pairs)?;
        assert_eq!(
            separate_copy.token_logprobs(&batch.input_ids)?.to_vec2::<f32>()?,
            adapter_toggle.token_logprobs(&batch.input_ids)?.to_vec2::<f32>()?
        );
        assert!(attachment.switch.is_enabled());

        let policy_scorer = LogitsScorer::new(&policy);
        for reference in [&separate_copy as &dyn Scorer, &adapter_toggle as &dyn Scorer] {
            let step = engine.compute_batch(&policy_scorer, reference, &toy_pairs, &collator)?;
            assert_eq!(step.stats.margin, 0_f64);
            assert_eq!(step.stats.accuracy, 0.5_f64);
            assert_close(step.stats.loss, LN_2, 1e-12);
            assert_close(step.loss.to_scalar::<f32>()? as f64, LN_2, 1e-6);
        }
        Ok(())
    }
}
