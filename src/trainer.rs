//! DPO training loop and evaluation

use crate::config::TrainingConfig;
use crate::error::{DpoError, DpoResult};
use crate::loss::PreferenceLossEngine;
use crate::pairs::{PreferenceCollator, PreferenceDataLoader};
use crate::scorer::Scorer;
use candle_nn::Optimizer;

/// Averages of the engine's statistics over a number of batches
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DpoEvaluation {
    pub loss: f64,
    pub rewards_chosen: f64,
    pub rewards_rejected: f64,
    pub reward_margin: f64,
    pub accuracy: f64,
}

impl DpoEvaluation {
    fn nan() -> Self {
        Self {
            loss: f64::NAN,
            rewards_chosen: f64::NAN,
            rewards_rejected: f64::NAN,
            reward_margin: f64::NAN,
            accuracy: f64::NAN,
        }
    }
}

/// Metrics recorded at every evaluation
#[derive(Debug, Default, Clone)]
pub struct DpoTrainingHistory {
    pub train_losses: Vec<f64>,
    pub val_losses: Vec<f64>,
    pub train_reward_margins: Vec<f64>,
    pub val_reward_margins: Vec<f64>,
    pub train_accuracies: Vec<f64>,
    pub val_accuracies: Vec<f64>,
    pub track_tokens_seen: Vec<usize>,
    /// Batches dropped because of a non-finite loss
    pub skipped_batches: usize,
    pub steps: usize,
}

impl DpoTrainingHistory {
    fn record(&mut self, train: &DpoEvaluation, val: &DpoEvaluation, tokens_seen: usize) {
        self.train_losses.push(train.loss);
        self.val_losses.push(val.loss);
        self.train_reward_margins.push(train.reward_margin);
        self.val_reward_margins.push(val.reward_margin);
        self.train_accuracies.push(train.accuracy);
        self.val_accuracies.push(val.accuracy);
        self.track_tokens_seen.push(tokens_seen);
    }
}

/// Mean statistics over the first `num_batches` batches of `data_loader`
///
/// Returns NaN everywhere when the loader yields no batch.
pub fn calc_dpo_loss_loader<P: Scorer + ?Sized, R: Scorer + ?Sized>(
    engine: &PreferenceLossEngine,
    policy: &P,
    reference: &R,
    data_loader: &PreferenceDataLoader,
    collator: &PreferenceCollator,
    num_batches: Option<usize>,
) -> DpoResult<DpoEvaluation> {
    let num_batches = match num_batches {
        Some(n) => std::cmp::min(n, data_loader.len()),
        None => data_loader.len(),
    };
    if num_batches == 0 {
        return Ok(DpoEvaluation::nan());
    }

    let mut totals = [0_f64; 5];
    for pairs in data_loader.batcher(0).take(num_batches) {
        let stats = engine.compute_batch(policy, reference, &pairs, collator)?.stats;
        for (total, value) in totals.iter_mut().zip([
            stats.loss,
            stats.rewards_chosen,
            stats.rewards_rejected,
            stats.margin,
            stats.accuracy,
        ]) {
            *total += value;
        }
    }
    let [loss, rewards_chosen, rewards_rejected, reward_margin, accuracy] =
        totals.map(|total| total / num_batches as f64);
    Ok(DpoEvaluation {
        loss,
        rewards_chosen,
        rewards_rejected,
        reward_margin,
        accuracy,
    })
}

/// Evaluates on `eval_iter` batches of both loaders
pub fn evaluate_dpo_model<P: Scorer + ?Sized, R: Scorer + ?Sized>(
    engine: &PreferenceLossEngine,
    policy: &P,
    reference: &R,
    train_loader: &PreferenceDataLoader,
    val_loader: &PreferenceDataLoader,
    collator: &PreferenceCollator,
    eval_iter: usize,
) -> DpoResult<(DpoEvaluation, DpoEvaluation)> {
    let train = calc_dpo_loss_loader(
        engine,
        policy,
        reference,
        train_loader,
        collator,
        Some(eval_iter),
    )?;
    let val = calc_dpo_loss_loader(
        engine,
        policy,
        reference,
        val_loader,
        collator,
        Some(eval_iter),
    )?;
    Ok((train, val))
}

/// Learning rate after `step` optimizer updates under linear warmup
pub fn warmup_learning_rate(base_lr: f64, step: usize, warmup_steps: usize) -> f64 {
    if warmup_steps == 0 || step >= warmup_steps {
        base_lr
    } else {
        base_lr * (step + 1) as f64 / warmup_steps as f64
    }
}

/// Trains `policy` with the DPO objective
///
/// The optimizer must only hold the trainable variables; `reference` is never
/// updated. Batches whose loss is non-finite are skipped, any other error
/// aborts training.
#[allow(clippy::too_many_arguments)]
pub fn train_model_dpo<P: Scorer + ?Sized, R: Scorer + ?Sized, O: Optimizer>(
    engine: &PreferenceLossEngine,
    policy: &P,
    reference: &R,
    train_loader: &PreferenceDataLoader,
    val_loader: &PreferenceDataLoader,
    mut optimizer: O,
    collator: &PreferenceCollator,
    cfg: &TrainingConfig,
) -> anyhow::Result<DpoTrainingHistory> {
    cfg.validate()?;
    let mut history = DpoTrainingHistory::default();
    let mut tokens_seen = 0_usize;
    let base_lr = cfg.learning_rate;
    tracing::info!(
        train_pairs = train_loader.dataset().len(),
        val_pairs = val_loader.dataset().len(),
        batch_size = train_loader.batch_size(),
        batches_per_epoch = train_loader.len(),
        beta = engine.beta(),
        "starting DPO training"
    );

    for epoch in 0..cfg.num_epochs {
        for pairs in train_loader.batcher(epoch) {
            optimizer.set_learning_rate(warmup_learning_rate(
                base_lr,
                history.steps,
                cfg.warmup_steps,
            ));
            let step = match engine.compute_batch(policy, reference, &pairs, collator) {
                Ok(step) => step,
                Err(DpoError::NumericInstability { index, value }) => {
                    tracing::warn!(epoch, index, value, "skipping batch with non-finite loss");
                    history.skipped_batches += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            optimizer.backward_step(&step.loss)?;
            tokens_seen += pairs.iter().map(|p| p.num_tokens()).sum::<usize>();
            history.steps += 1;

            if history.steps % cfg.eval_freq == 0 {
                let (train, val) = evaluate_dpo_model(
                    engine,
                    policy,
                    reference,
                    train_loader,
                    val_loader,
                    collator,
                    cfg.eval_iter,
                )?;
                history.record(&train, &val, tokens_seen);
                tracing::info!(
                    epoch = epoch + 1,
                    step = history.steps,
                    train_loss = train.loss,
                    val_loss = val.loss,
                    train_margin = train.reward_margin,
                    val_margin = val.reward_margin,
                    train_accuracy = train.accuracy,
                    val_accuracy = val.accuracy,
                    "evaluation"
                );
            }
        }
    }
    Ok(history)
}
