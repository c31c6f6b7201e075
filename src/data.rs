//! Preference dataset provider
//!
//! Loads `(prompt, chosen, rejected)` records from JSON or from a parquet file
//! of a Hugging Face Hub dataset, drops records that violate the example
//! invariants and splits the remainder reproducibly.

use crate::config::DatasetSource;
use anyhow::{anyhow, Context};
use bytes::Bytes;
use polars::prelude::*;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    fs::{read_to_string, File},
    io,
    path::Path,
};

/// A single human-preference record
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceExample {
    prompt: String,
    chosen: String,
    rejected: String,
}

impl Display for PreferenceExample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Prompt: {}\nChosen: {}\nRejected: {}",
            self.prompt, self.chosen, self.rejected
        )
    }
}

/// Reasons a record cannot be used for preference training
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidExample {
    EmptyPrompt,
    EmptyChosen,
    EmptyRejected,
    /// `chosen == rejected`: the pair carries no preference signal
    DegeneratePair,
}

impl PreferenceExample {
    pub fn new(prompt: &str, chosen: &str, rejected: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            chosen: chosen.to_string(),
            rejected: rejected.to_string(),
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn chosen(&self) -> &str {
        &self.chosen
    }

    pub fn rejected(&self) -> &str {
        &self.rejected
    }

    /// Checks that all fields are non-empty and that the completions differ.
    pub fn validate(&self) -> Result<(), InvalidExample> {
        if self.prompt.trim().is_empty() {
            return Err(InvalidExample::EmptyPrompt);
        }
        if self.chosen.trim().is_empty() {
            return Err(InvalidExample::EmptyChosen);
        }
        if self.rejected.trim().is_empty() {
            return Err(InvalidExample::EmptyRejected);
        }
        if self.chosen == self.rejected {
            return Err(InvalidExample::DegeneratePair);
        }
        Ok(())
    }
}

/// Drops records failing `PreferenceExample::validate`
pub fn filter_valid_examples(data: Vec<PreferenceExample>) -> Vec<PreferenceExample> {
    let total = data.len();
    let mut degenerate = 0_usize;
    let valid = data
        .into_iter()
        .filter(|example| match example.validate() {
            Ok(()) => true,
            Err(reason) => {
                if reason == InvalidExample::DegeneratePair {
                    degenerate += 1;
                }
                tracing::debug!(?reason, "dropping preference example");
                false
            }
        })
        .collect::<Vec<_>>();

    let dropped = total - valid.len();
    if dropped > 0 {
        tracing::warn!(
            dropped,
            degenerate,
            kept = valid.len(),
            "dropped invalid preference examples"
        );
    }
    valid
}

/// Column names holding prompt, chosen and rejected texts in a tabular dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub prompt: String,
    pub chosen: String,
    pub rejected: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            prompt: "prompt".to_string(),
            chosen: "chosen".to_string(),
            rejected: "rejected".to_string(),
        }
    }
}

/// Reads a JSON array of preference records
pub fn load_preference_json<P: AsRef<Path>>(
    file_path: P,
) -> anyhow::Result<Vec<PreferenceExample>> {
    let json_str = read_to_string(file_path.as_ref())
        .with_context(|| format!("Unable to read {}", file_path.as_ref().display()))?;
    let data: Vec<PreferenceExample> = serde_json::from_str(&json_str[..])
        .with_context(|| format!("Invalid preference data in {}", file_path.as_ref().display()))?;
    Ok(data)
}

/// Downloads a JSON preference file unless it already exists locally, then loads it
pub fn download_and_load_file<P: AsRef<Path>>(
    file_path: P,
    url: &str,
) -> anyhow::Result<Vec<PreferenceExample>> {
    if !file_path.as_ref().exists() {
        if let Some(parent) = file_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::info!(url, "downloading preference data");
        let resp = reqwest::blocking::get(url)?.error_for_status()?;
        let content: Bytes = resp.bytes()?;
        let mut out = File::create(file_path.as_ref())?;
        io::copy(&mut content.as_ref(), &mut out)?;
    }
    load_preference_json(file_path)
}

pub fn write_preference_data_to_json<P: AsRef<Path>>(
    data: &[PreferenceExample],
    save_path: P,
) -> anyhow::Result<()> {
    let file = File::create(save_path.as_ref())
        .with_context(|| format!("Unable to create {}", save_path.as_ref().display()))?;
    serde_json::to_writer_pretty(file, data)?;
    Ok(())
}

/// Converts a `DataFrame` into preference records using the given column mapping
pub fn dataframe_to_examples(
    df: &DataFrame,
    columns: &ColumnMapping,
) -> anyhow::Result<Vec<PreferenceExample>> {
    let prompts = df.column(&columns.prompt)?.as_materialized_series().str()?;
    let chosen = df.column(&columns.chosen)?.as_materialized_series().str()?;
    let rejected = df.column(&columns.rejected)?.as_materialized_series().str()?;

    prompts
        .into_iter()
        .zip(chosen)
        .zip(rejected)
        .enumerate()
        .map(|(ix, ((p, c), r))| match (p, c, r) {
            (Some(p), Some(c), Some(r)) => Ok(PreferenceExample::new(p, c, r)),
            _ => Err(anyhow!("Null value in preference record at row {ix}")),
        })
        .collect()
}

pub fn load_preference_parquet<P: AsRef<Path>>(
    file_path: P,
    columns: &ColumnMapping,
) -> anyhow::Result<Vec<PreferenceExample>> {
    let mut file = File::open(file_path.as_ref())
        .with_context(|| format!("Unable to open {}", file_path.as_ref().display()))?;
    let df = ParquetReader::new(&mut file).finish()?;
    dataframe_to_examples(&df, columns)
}

/// Fetches (or reuses the cached copy of) a parquet file of a Hub dataset repo
pub fn load_hub_parquet(
    repo_id: &str,
    filename: &str,
    columns: &ColumnMapping,
) -> anyhow::Result<Vec<PreferenceExample>> {
    let api = hf_hub::api::sync::Api::new()?;
    let repo = api.dataset(repo_id.to_string());
    let path = repo
        .get(filename)
        .with_context(|| format!("Unable to fetch {filename} from dataset {repo_id}"))?;
    tracing::info!(repo_id, path = %path.display(), "loaded dataset file from hub");
    load_preference_parquet(path, columns)
}

/// Loads and validates the records of a `DatasetSource`
pub fn load_from_source(source: &DatasetSource) -> anyhow::Result<Vec<PreferenceExample>> {
    let data = match source {
        DatasetSource::LocalJson { path } => load_preference_json(path)?,
        DatasetSource::Url { url, cache_path } => download_and_load_file(cache_path, url)?,
        DatasetSource::HubParquet {
            repo_id,
            filename,
            columns,
        } => load_hub_parquet(repo_id, filename, columns)?,
    };
    Ok(filter_valid_examples(data))
}

/// Splits data into train and held-out partitions
///
/// The split is a seeded shuffle, so the same `seed` and fraction always
/// produce the same partitions.
pub fn partition_data(
    data: Vec<PreferenceExample>,
    held_out_fraction: f32,
    seed: u64,
) -> anyhow::Result<(Vec<PreferenceExample>, Vec<PreferenceExample>)> {
    if !(0_f32..1_f32).contains(&held_out_fraction) {
        return Err(anyhow!(
            "held_out_fraction must be in [0, 1), got {held_out_fraction}"
        ));
    }
    let mut data = data;
    let mut rng = StdRng::seed_from_u64(seed);
    data.shuffle(&mut rng);

    let held_out_portion = (data.len() as f32 * held_out_fraction).floor() as usize;
    let held_out = data.split_off(data.len() - held_out_portion);
    Ok((data, held_out))
}
