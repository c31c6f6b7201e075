//! Direct Preference Optimization fine-tuning with candle
//!
//! The core is `loss::PreferenceLossEngine`; the other modules supply the
//! preference data, tokenization, models, scorers and training loop around it.

pub mod config;
pub mod data;
pub mod error;
pub mod examples;
pub mod logging;
pub mod lora;
pub mod loss;
pub mod model;
pub mod pairs;
pub mod pipeline;
pub mod scorer;
pub mod tokenizer;
pub mod trainer;

/// A runnable demo registered with the CLI
pub trait Example: Send + Sync {
    fn description(&self) -> String;

    fn main(&self) -> anyhow::Result<()>;
}
