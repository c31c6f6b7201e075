//! End-to-end DPO fine-tuning driven by a `RunConfig`

use crate::config::{ReferenceMode, RunConfig};
use crate::data::{load_from_source, partition_data, PreferenceExample};
use crate::loss::PreferenceLossEngine;
use crate::lora::{AdapterDisabledScorer, AdapterSwitch, WithoutAdapters};
use crate::model::{frozen_copy, generate_greedy, num_parameters, CausalLm, LoraAttachment};
use crate::pairs::{PreferenceCollator, PreferenceDataLoader, PreferenceDataset};
use crate::scorer::{FrozenScorer, LogitsScorer, Scorer};
use crate::tokenizer::{load_tokenizer, prompt_formatter_for, PromptFormatter, TextTokenizer};
use crate::trainer::{train_model_dpo, DpoTrainingHistory};
use anyhow::{anyhow, Context};
use candle_core::{DType, Device, ModuleT};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use std::fs;

/// File name of the saved trainable weights inside `output_dir`
pub const WEIGHTS_FILE: &str = "trainable.safetensors";
pub const RUN_CONFIG_FILE: &str = "run_config.json";

const COMPARISON_PROMPTS: usize = 3;
const COMPARISON_MAX_NEW_TOKENS: usize = 40;

/// Loads data, builds policy and reference, trains, saves and reports
pub fn run_training(cfg: &RunConfig) -> anyhow::Result<DpoTrainingHistory> {
    cfg.validate()?;
    let device = Device::cuda_if_available(0)?;

    // data
    let examples = load_from_source(&cfg.dataset)?;
    if examples.is_empty() {
        return Err(anyhow!("the dataset contains no valid preference examples"));
    }
    let (train_data, val_data) =
        partition_data(examples, cfg.training.held_out_fraction, cfg.training.seed)?;
    tracing::info!(
        train = train_data.len(),
        held_out = val_data.len(),
        "partitioned preference data"
    );

    let tokenizer = load_tokenizer(&cfg.tokenizer)?;
    if tokenizer.eos_token_id() as usize >= cfg.model.vocab_size {
        return Err(anyhow!(
            "EOS token id {} is outside the model vocabulary of {}",
            tokenizer.eos_token_id(),
            cfg.model.vocab_size
        ));
    }
    let formatter = prompt_formatter_for(cfg.training.prompt_style);
    let comparison_prompts = val_data
        .iter()
        .chain(train_data.iter())
        .take(COMPARISON_PROMPTS)
        .map(|example| example.prompt().to_string())
        .collect::<Vec<_>>();

    let build_dataset = |data: Vec<PreferenceExample>| {
        PreferenceDataset::new(
            data,
            tokenizer.as_ref(),
            formatter.as_ref(),
            &cfg.dpo,
            cfg.training.append_eos,
        )
    };
    let train_loader = PreferenceDataLoader::new(
        build_dataset(train_data)?,
        cfg.training.batch_size,
        true,
        false,
        cfg.training.seed,
    );
    let val_loader = PreferenceDataLoader::new(
        build_dataset(val_data)?,
        cfg.training.batch_size,
        false,
        false,
        cfg.training.seed,
    );
    let collator = PreferenceCollator::new()
        .pad_token_id(tokenizer.eos_token_id())
        .device(device.clone());

    // models
    let mut base_map = VarMap::new();
    let base_vb = VarBuilder::from_varmap(&base_map, DType::F32, &device);
    // creates the base variables so a checkpoint can be loaded into them
    let _ = CausalLm::new(cfg.model, base_vb.clone(), None)?;
    if let Some(checkpoint) = &cfg.init_checkpoint {
        base_map
            .load(checkpoint)
            .with_context(|| format!("Unable to load weights from {}", checkpoint.display()))?;
        tracing::info!(checkpoint = %checkpoint.display(), "loaded initial weights");
    }
    let reference_map = match cfg.reference_mode {
        ReferenceMode::SeparateCopy => Some(frozen_copy(&base_map)?),
        ReferenceMode::AdapterToggle => None,
    };

    let adapter_map = VarMap::new();
    let attachment = cfg.lora.as_ref().map(|lora| LoraAttachment {
        config: lora.clone(),
        vb: VarBuilder::from_varmap(&adapter_map, DType::F32, &device),
        switch: AdapterSwitch::new(),
    });
    let policy = CausalLm::new(cfg.model, base_vb, attachment.as_ref())?;
    let trainable = if attachment.is_some() {
        &adapter_map
    } else {
        &base_map
    };
    tracing::info!(
        trainable = num_parameters(trainable),
        total = num_parameters(&base_map) + num_parameters(&adapter_map),
        reference_mode = ?cfg.reference_mode,
        "built policy"
    );

    let reference_model = reference_map
        .as_ref()
        .map(|map| CausalLm::new(cfg.model, VarBuilder::from_varmap(map, DType::F32, &device), None))
        .transpose()?;
    let reference: Box<dyn Scorer + '_> = match (&reference_model, &attachment) {
        (Some(model), _) => Box::new(FrozenScorer::new(LogitsScorer::new(model))),
        (None, Some(lora)) => Box::new(AdapterDisabledScorer::new(
            LogitsScorer::new(&policy),
            lora.switch.clone(),
        )),
        (None, None) => {
            return Err(anyhow!(
                "reference mode `adapter_toggle` needs low-rank adapters"
            ))
        }
    };

    // training
    let engine = PreferenceLossEngine::new(cfg.dpo)?;
    let optimizer = AdamW::new(
        trainable.all_vars(),
        ParamsAdamW {
            lr: cfg.training.learning_rate,
            weight_decay: cfg.training.weight_decay,
            ..Default::default()
        },
    )?;
    let history = train_model_dpo(
        &engine,
        &LogitsScorer::new(&policy),
        reference.as_ref(),
        &train_loader,
        &val_loader,
        optimizer,
        &collator,
        &cfg.training,
    )?;

    // outputs
    fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("Unable to create {}", cfg.output_dir.display()))?;
    let weights_path = cfg.output_dir.join(WEIGHTS_FILE);
    trainable.save(&weights_path)?;
    let config_file = fs::File::create(cfg.output_dir.join(RUN_CONFIG_FILE))?;
    serde_json::to_writer_pretty(config_file, cfg)?;
    tracing::info!(path = %weights_path.display(), "saved trainable weights");

    println!("{}", history_table(&history));
    let comparison = match (&reference_model, &attachment) {
        (Some(baseline), _) => compare_generations(
            baseline,
            &policy,
            &comparison_prompts,
            tokenizer.as_ref(),
            formatter.as_ref(),
            cfg.model.context_length,
            &device,
        )?,
        (None, Some(lora)) => compare_generations(
            &WithoutAdapters::new(&policy, lora.switch.clone()),
            &policy,
            &comparison_prompts,
            tokenizer.as_ref(),
            formatter.as_ref(),
            cfg.model.context_length,
            &device,
        )?,
        (None, None) => return Err(anyhow!("no baseline model to compare against")),
    };
    println!("{comparison}");
    Ok(history)
}

/// Summary of the recorded evaluations
pub fn history_table(history: &DpoTrainingHistory) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Eval",
            "Tokens seen",
            "Train loss",
            "Val loss",
            "Train margin",
            "Val margin",
            "Train acc.",
            "Val acc.",
        ]);
    for ix in 0..history.train_losses.len() {
        table.add_row(vec![
            (ix + 1).to_string(),
            history.track_tokens_seen[ix].to_string(),
            format!("{:.3}", history.train_losses[ix]),
            format!("{:.3}", history.val_losses[ix]),
            format!("{:.3}", history.train_reward_margins[ix]),
            format!("{:.3}", history.val_reward_margins[ix]),
            format!("{:.2}", history.train_accuracies[ix]),
            format!("{:.2}", history.val_accuracies[ix]),
        ]);
    }
    table
}

/// Greedy continuations of each prompt by the baseline and the fine-tuned model
pub fn compare_generations<B: ModuleT, F: ModuleT>(
    baseline: &B,
    finetuned: &F,
    prompts: &[String],
    tokenizer: &dyn TextTokenizer,
    formatter: &dyn PromptFormatter,
    context_length: usize,
    device: &Device,
) -> anyhow::Result<Table> {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Prompt", "Baseline", "Fine-tuned"]);

    let eos_token_id = Some(tokenizer.eos_token_id());
    for prompt in prompts {
        let prompt_ids = tokenizer.encode(&formatter.format_prompt(prompt))?;
        let baseline_ids = generate_greedy(
            baseline,
            &prompt_ids,
            COMPARISON_MAX_NEW_TOKENS,
            context_length,
            eos_token_id,
            device,
        )?;
        let finetuned_ids = generate_greedy(
            finetuned,
            &prompt_ids,
            COMPARISON_MAX_NEW_TOKENS,
            context_length,
            eos_token_id,
            device,
        )?;
        table.add_row(vec![
            prompt.clone(),
            tokenizer.decode(&baseline_ids[prompt_ids.len()..])?,
            tokenizer.decode(&finetuned_ids[prompt_ids.len()..])?,
        ]);
    }
    Ok(table)
}
