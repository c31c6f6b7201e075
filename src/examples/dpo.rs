//! Examples of DPO fine-tuning on a small Arabic preference sample

use crate::data::PreferenceExample;
use crate::model::ModelConfig;
use crate::Example;
use anyhow::Result;

pub const DATA_DIR: &str = "data";
pub const SAMPLE_DATA_FILENAME: &str = "arabic_preferences_sample.json";

/// A handful of Arabic preference records, including two invalid ones
pub fn arabic_preference_sample() -> Vec<PreferenceExample> {
    vec![
        PreferenceExample::new(
            "ما هي عاصمة مصر؟",
            "عاصمة مصر هي القاهرة.",
            "عاصمة مصر هي الإسكندرية.",
        ),
        PreferenceExample::new(
            "كم عدد أيام الأسبوع؟",
            "في الأسبوع سبعة أيام.",
            "في الأسبوع خمسة أيام.",
        ),
        PreferenceExample::new("اذكر فاكهة صفراء.", "الموز فاكهة صفراء.", "الطماطم فاكهة صفراء."),
        PreferenceExample::new("ما هو الماء؟", "الماء سائل ضروري للحياة.", "الماء معدن صلب."),
        PreferenceExample::new("قل مرحباً.", "مرحباً! كيف يمكنني مساعدتك؟", "لا أريد التحدث."),
        PreferenceExample::new(
            "ما لون السماء في يوم صافٍ؟",
            "السماء زرقاء في اليوم الصافي.",
            "السماء خضراء.",
        ),
        PreferenceExample::new(
            "كم يساوي اثنان زائد اثنين؟",
            "اثنان زائد اثنين يساوي أربعة.",
            "اثنان زائد اثنين يساوي خمسة.",
        ),
        PreferenceExample::new("ترجم كلمة book إلى العربية.", "كتاب.", "قلم."),
        // degenerate
        PreferenceExample::new("ما هو أكبر كوكب؟", "المشتري.", "المشتري."),
        // empty rejected completion
        PreferenceExample::new("اذكر حيواناً أليفاً.", "القطة.", ""),
    ]
}

/// Model used by the examples: GPT-2 vocabulary, a few small layers
pub fn example_model_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 50_257,
        context_length: 256,
        emb_dim: 64,
        n_heads: 4,
        n_layers: 2,
    }
}

/// # Validating and splitting preference records
///
/// #### Id
/// 01
///
/// #### CLI command
/// ```sh
/// # without cuda
/// cargo run example 01
///
/// # with cuda
/// cargo run --features cuda example 01
/// ```
pub struct EG01;

impl Example for EG01 {
    fn description(&self) -> String {
        "Validate preference records and split them into train and held-out sets.".to_string()
    }

    fn main(&self) -> Result<()> {
        use crate::data::{filter_valid_examples, partition_data};

        let data = arabic_preference_sample();
        for (ix, example) in data.iter().enumerate() {
            if let Err(reason) = example.validate() {
                println!("Record {ix} is invalid: {reason:?}");
            }
        }

        let data = filter_valid_examples(data);
        println!("Number of valid records: {}", data.len());

        let (train_data, held_out) = partition_data(data, 0.25_f32, 42_u64)?;
        println!("Training set length: {}", train_data.len());
        println!("Held-out set length: {}", held_out.len());
        println!("First training record:\n{}", train_data[0]);
        Ok(())
    }
}

/// # Building tokenized pairs with prompt truncation
///
/// #### Id
/// 02
///
/// #### CLI command
/// ```sh
/// # without cuda
/// cargo run example 02
///
/// # with cuda
/// cargo run --features cuda example 02
/// ```
pub struct EG02;

impl Example for EG02 {
    fn description(&self) -> String {
        "Tokenize a preference record and show how truncation cuts the prompt first.".to_string()
    }

    fn main(&self) -> Result<()> {
        use crate::config::{DpoConfig, TruncationSide};
        use crate::pairs::TokenizedPair;
        use crate::tokenizer::{InstructionPromptFormatter, TextTokenizer};
        use tiktoken_rs::get_bpe_from_model;

        let tokenizer = get_bpe_from_model("gpt2")?;
        let example = &arabic_preference_sample()[0];

        let full = TokenizedPair::from_example(
            example,
            &tokenizer,
            &InstructionPromptFormatter,
            &DpoConfig::default(),
            true,
        )?;
        println!(
            "Untruncated: prompt {} tokens, chosen {} tokens, rejected {} tokens",
            full.prompt_length(),
            full.chosen_tokens().len(),
            full.rejected_tokens().len()
        );

        for side in [TruncationSide::Left, TruncationSide::Right] {
            let cfg = DpoConfig::default()
                .with_max_length(48)
                .with_prompt_truncation(side);
            let pair = TokenizedPair::from_example(
                example,
                &tokenizer,
                &InstructionPromptFormatter,
                &cfg,
                true,
            )?;
            let kept_prompt =
                TextTokenizer::decode(&tokenizer, &pair.chosen_tokens()[..pair.prompt_length()])?;
            println!(
                "\n{side:?} truncation to 48: prompt {} tokens, chosen {} tokens, rejected {} tokens",
                pair.prompt_length(),
                pair.chosen_tokens().len(),
                pair.rejected_tokens().len()
            );
            println!("Kept prompt text: {kept_prompt:?}");
        }
        Ok(())
    }
}

/// # The DPO loss on precomputed log-probabilities
///
/// #### Id
/// 03
///
/// #### CLI command
/// ```sh
/// cargo run example 03
/// ```
pub struct EG03;

impl Example for EG03 {
    fn description(&self) -> String {
        "Compute the DPO loss, rewards and accuracy from four log-probabilities.".to_string()
    }

    fn main(&self) -> Result<()> {
        use crate::config::DpoConfig;
        use crate::loss::{LogProbPair, PreferenceLossEngine};

        let engine = PreferenceLossEngine::new(DpoConfig::new(0.1))?;

        let preferred = LogProbPair::new(-10., -11., -12., -9.);
        let output = engine.compute(&[preferred])?;
        println!("Policy prefers the chosen completion:\n{output:#?}");

        let tie = LogProbPair::new(-10., -11., -10., -11.);
        let output = engine.compute(&[preferred, tie])?;
        println!("\nAdding a tie:\n{output:#?}");
        Ok(())
    }
}

/// # Loss at initialization for both reference modes
///
/// #### Id
/// 04
///
/// #### CLI command
/// ```sh
/// # without cuda
/// cargo run example 04
///
/// # with cuda
/// cargo run --features cuda example 04
/// ```
pub struct EG04;

impl Example for EG04 {
    fn description(&self) -> String {
        "Show that a fresh policy scores ln 2 against either kind of reference.".to_string()
    }

    fn main(&self) -> Result<()> {
        use crate::config::DpoConfig;
        use crate::data::filter_valid_examples;
        use crate::lora::{AdapterDisabledScorer, AdapterSwitch, LoraConfig};
        use crate::loss::PreferenceLossEngine;
        use crate::model::{frozen_copy, CausalLm, LoraAttachment};
        use crate::pairs::{PreferenceCollator, TokenizedPair};
        use crate::scorer::{FrozenScorer, LogitsScorer};
        use crate::tokenizer::RawPromptFormatter;
        use candle_core::{DType, Device};
        use candle_nn::{VarBuilder, VarMap};
        use tiktoken_rs::get_bpe_from_model;

        let dev = Device::cuda_if_available(0)?;
        let cfg = example_model_config();
        let dpo_cfg = DpoConfig::new(0.1).with_max_length(cfg.context_length);
        let tokenizer = get_bpe_from_model("gpt2")?;
        let pairs = filter_valid_examples(arabic_preference_sample())
            .iter()
            .take(4)
            .map(|example| {
                TokenizedPair::from_example(example, &tokenizer, &RawPromptFormatter, &dpo_cfg, true)
            })
            .collect::<Result<Vec<_>>>()?;

        let base_map = VarMap::new();
        let adapter_map = VarMap::new();
        let base_vb = VarBuilder::from_varmap(&base_map, DType::F32, &dev);
        let attachment = LoraAttachment {
            config: LoraConfig::default(),
            vb: VarBuilder::from_varmap(&adapter_map, DType::F32, &dev),
            switch: AdapterSwitch::new(),
        };
        let policy = CausalLm::new(cfg, base_vb, Some(&attachment))?;
        let reference_map = frozen_copy(&base_map)?;
        let reference_model = CausalLm::new(
            cfg,
            VarBuilder::from_varmap(&reference_map, DType::F32, &dev),
            None,
        )?;

        let engine = PreferenceLossEngine::new(dpo_cfg)?;
        let collator = PreferenceCollator::new().device(dev.clone());
        let policy_scorer = LogitsScorer::new(&policy);

        let separate = engine.compute_batch(
            &policy_scorer,
            &FrozenScorer::new(LogitsScorer::new(&reference_model)),
            &pairs,
            &collator,
        )?;
        let toggled = engine.compute_batch(
            &policy_scorer,
            &AdapterDisabledScorer::new(LogitsScorer::new(&policy), attachment.switch.clone()),
            &pairs,
            &collator,
        )?;

        println!("ln 2: {:.6}", std::f64::consts::LN_2);
        println!(
            "Separate copy reference: loss {:.6}, accuracy {:.2}",
            separate.stats.loss, separate.stats.accuracy
        );
        println!(
            "Adapter toggle reference: loss {:.6}, accuracy {:.2}",
            toggled.stats.loss, toggled.stats.accuracy
        );
        Ok(())
    }
}

/// # LoRA training with the adapter-toggle reference
///
/// #### Id
/// 05
///
/// #### CLI command
/// ```sh
/// # without cuda
/// cargo run example 05
///
/// # with cuda
/// cargo run --features cuda example 05
/// ```
pub struct EG05;

impl Example for EG05 {
    fn description(&self) -> String {
        "Train low-rank adapters with DPO and compare generations before and after.".to_string()
    }

    fn main(&self) -> Result<()> {
        use crate::config::{DpoConfig, PromptStyle, TrainingConfig};
        use crate::data::{filter_valid_examples, partition_data};
        use crate::lora::{AdapterDisabledScorer, AdapterSwitch, LoraConfig, WithoutAdapters};
        use crate::loss::PreferenceLossEngine;
        use crate::model::{num_parameters, CausalLm, LoraAttachment};
        use crate::pairs::{PreferenceCollator, PreferenceDataLoader, PreferenceDataset};
        use crate::pipeline::{compare_generations, history_table};
        use crate::scorer::LogitsScorer;
        use crate::tokenizer::{prompt_formatter_for, TextTokenizer};
        use crate::trainer::train_model_dpo;
        use candle_core::{DType, Device};
        use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
        use tiktoken_rs::get_bpe_from_model;

        let dev = Device::cuda_if_available(0)?;
        let cfg = example_model_config();
        let dpo_cfg = DpoConfig::new(0.1).with_max_length(cfg.context_length);
        let training_cfg = TrainingConfig {
            learning_rate: 5e-3,
            num_epochs: 4,
            batch_size: 2,
            eval_freq: 2,
            eval_iter: 2,
            held_out_fraction: 0.25,
            prompt_style: PromptStyle::Instruction,
            ..Default::default()
        };

        let tokenizer = get_bpe_from_model("gpt2")?;
        let formatter = prompt_formatter_for(training_cfg.prompt_style);
        let (train_data, val_data) = partition_data(
            filter_valid_examples(arabic_preference_sample()),
            training_cfg.held_out_fraction,
            training_cfg.seed,
        )?;
        let prompts = val_data
            .iter()
            .map(|example| example.prompt().to_string())
            .collect::<Vec<_>>();
        let train_loader = PreferenceDataLoader::new(
            PreferenceDataset::new(train_data, &tokenizer, formatter.as_ref(), &dpo_cfg, true)?,
            training_cfg.batch_size,
            true,
            false,
            training_cfg.seed,
        );
        let val_loader = PreferenceDataLoader::new(
            PreferenceDataset::new(val_data, &tokenizer, formatter.as_ref(), &dpo_cfg, true)?,
            training_cfg.batch_size,
            false,
            false,
            training_cfg.seed,
        );

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
        println!(
            "Trainable parameters: {} of {}",
            num_parameters(&adapter_map),
            num_parameters(&base_map) + num_parameters(&adapter_map)
        );

        let optimizer = AdamW::new(
            adapter_map.all_vars(),
            ParamsAdamW {
                lr: training_cfg.learning_rate,
                weight_decay: training_cfg.weight_decay,
                ..Default::default()
            },
        )?;
        let history = train_model_dpo(
            &PreferenceLossEngine::new(dpo_cfg)?,
            &LogitsScorer::new(&policy),
            &AdapterDisabledScorer::new(LogitsScorer::new(&policy), attachment.switch.clone()),
            &train_loader,
            &val_loader,
            optimizer,
            &PreferenceCollator::new()
                .pad_token_id(tokenizer.eos_token_id())
                .device(dev.clone()),
            &training_cfg,
        )?;
        println!("{}", history_table(&history));

        let comparison = compare_generations(
            &WithoutAdapters::new(&policy, attachment.switch.clone()),
            &policy,
            &prompts,
            &tokenizer,
            formatter.as_ref(),
            cfg.context_length,
            &dev,
        )?;
        println!("{comparison}");
        Ok(())
    }
}

/// # End-to-end run from a `RunConfig`
///
/// #### Id
/// 06
///
/// #### CLI command
/// ```sh
/// # without cuda
/// cargo run example 06
///
/// # with cuda
/// cargo run --features cuda example 06
/// ```
pub struct EG06;

impl Example for EG06 {
    fn description(&self) -> String {
        "Write the sample data to disk and run the full pipeline with a separate reference."
            .to_string()
    }

    fn main(&self) -> Result<()> {
        use crate::config::{
            DatasetSource, DpoConfig, ReferenceMode, RunConfig, TokenizerSource, TrainingConfig,
        };
        use crate::data::write_preference_data_to_json;
        use crate::lora::LoraConfig;
        use crate::pipeline::run_training;
        use std::path::{Path, PathBuf};

        let data_path = Path::new(DATA_DIR).join(SAMPLE_DATA_FILENAME);
        std::fs::create_dir_all(DATA_DIR)?;
        write_preference_data_to_json(&arabic_preference_sample(), &data_path)?;

        let cfg = RunConfig {
            dataset: DatasetSource::LocalJson { path: data_path },
            tokenizer: TokenizerSource::Gpt2Bpe,
            model: example_model_config(),
            init_checkpoint: None,
            lora: Some(LoraConfig::default()),
            dpo: DpoConfig::new(0.1).with_max_length(128),
            training: TrainingConfig {
                learning_rate: 5e-3,
                num_epochs: 2,
                eval_freq: 2,
                eval_iter: 2,
                held_out_fraction: 0.25,
                ..Default::default()
            },
            reference_mode: ReferenceMode::SeparateCopy,
            output_dir: PathBuf::from("runs").join("example_06"),
        };
        let history = run_training(&cfg)?;
        println!(
            "Finished {} steps, skipped {} batches. Outputs in {}",
            history.steps,
            history.skipped_batches,
            cfg.output_dir.display()
        );
        Ok(())
    }
}
