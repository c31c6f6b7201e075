//! Tokenized preference pairs, datasets, loaders and the batch collator

use crate::config::{DpoConfig, TruncationSide};
use crate::data::PreferenceExample;
use crate::tokenizer::{PromptFormatter, TextTokenizer};
use candle_core::{Device, Result, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::rc::Rc;

/// Prompt + chosen and prompt + rejected token sequences sharing one prompt-length marker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenizedPair {
    chosen_tokens: Vec<u32>,
    rejected_tokens: Vec<u32>,
    prompt_length: usize,
}

impl TokenizedPair {
    /// Concatenates the prompt with each completion, applying the truncation policy
    ///
    /// When `prompt + completion` exceeds `config.max_length`, prompt tokens go
    /// first (from `config.prompt_truncation`'s side), then completions are cut
    /// from the right. The prompt cut is sized on the longer completion so both
    /// sequences keep the same prompt and the same `prompt_length`. When the
    /// longer completion alone fills `max_length` the prompt is dropped entirely.
    pub fn new(
        prompt_ids: &[u32],
        chosen_ids: &[u32],
        rejected_ids: &[u32],
        config: &DpoConfig,
    ) -> Self {
        let max_length = config.max_length;
        let longest_completion = std::cmp::max(chosen_ids.len(), rejected_ids.len());

        let prompt_keep = std::cmp::min(
            prompt_ids.len(),
            max_length.saturating_sub(longest_completion),
        );
        let prompt = match config.prompt_truncation {
            TruncationSide::Left => &prompt_ids[prompt_ids.len() - prompt_keep..],
            TruncationSide::Right => &prompt_ids[..prompt_keep],
        };

        let completion_budget = max_length.saturating_sub(prompt.len());
        let concat = |completion: &[u32]| {
            let keep = std::cmp::min(completion.len(), completion_budget);
            let mut tokens = Vec::with_capacity(prompt.len() + keep);
            tokens.extend_from_slice(prompt);
            tokens.extend_from_slice(&completion[..keep]);
            tokens
        };

        Self {
            chosen_tokens: concat(chosen_ids),
            rejected_tokens: concat(rejected_ids),
            prompt_length: prompt.len(),
        }
    }

    /// Builds a pair from pre-assembled sequences without any checks
    ///
    /// `PreferenceLossEngine` rejects pairs whose `prompt_length` exceeds
    /// either sequence.
    pub fn from_parts(
        chosen_tokens: Vec<u32>,
        rejected_tokens: Vec<u32>,
        prompt_length: usize,
    ) -> Self {
        Self {
            chosen_tokens,
            rejected_tokens,
            prompt_length,
        }
    }

    pub fn from_example<T: TextTokenizer + ?Sized, P: PromptFormatter + ?Sized>(
        example: &PreferenceExample,
        tokenizer: &T,
        prompt_formatter: &P,
        config: &DpoConfig,
        append_eos: bool,
    ) -> anyhow::Result<Self> {
        let prompt = prompt_formatter.format_prompt(example.prompt());
        let prompt_ids = tokenizer.encode(&prompt)?;
        let mut chosen_ids = tokenizer.encode(example.chosen())?;
        let mut rejected_ids = tokenizer.encode(example.rejected())?;
        if append_eos {
            chosen_ids.push(tokenizer.eos_token_id());
            rejected_ids.push(tokenizer.eos_token_id());
        }
        Ok(Self::new(&prompt_ids, &chosen_ids, &rejected_ids, config))
    }

    pub fn chosen_tokens(&self) -> &[u32] {
        &self.chosen_tokens
    }

    pub fn rejected_tokens(&self) -> &[u32] {
        &self.rejected_tokens
    }

    pub fn prompt_length(&self) -> usize {
        self.prompt_length
    }

    /// True when either sequence has no scored position
    ///
    /// The first token is never scored, so the region is
    /// `max(prompt_length, 1)..len`.
    pub fn has_empty_completion(&self) -> bool {
        let first_scored = std::cmp::max(self.prompt_length, 1);
        self.chosen_tokens.len() <= first_scored || self.rejected_tokens.len() <= first_scored
    }

    pub fn num_tokens(&self) -> usize {
        self.chosen_tokens.len() + self.rejected_tokens.len()
    }
}

pub struct PreferenceDataset_ {
    data: Vec<PreferenceExample>,
    encoded_pairs: Vec<TokenizedPair>,
}

/// Preference examples together with their tokenized pairs
///
/// NOTE: This is a Rc-wrapped `PreferenceDataset_` so loaders clone it cheaply.
#[derive(Clone)]
pub struct PreferenceDataset(Rc<PreferenceDataset_>);

impl AsRef<PreferenceDataset> for PreferenceDataset {
    fn as_ref(&self) -> &PreferenceDataset {
        self
    }
}

impl std::ops::Deref for PreferenceDataset {
    type Target = PreferenceDataset_;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PreferenceDataset {
    pub fn new<T: TextTokenizer + ?Sized, P: PromptFormatter + ?Sized>(
        data: Vec<PreferenceExample>,
        tokenizer: &T,
        prompt_formatter: &P,
        config: &DpoConfig,
        append_eos: bool,
    ) -> anyhow::Result<Self> {
        let encoded_pairs = data
            .iter()
            .map(|example| {
                TokenizedPair::from_example(example, tokenizer, prompt_formatter, config, append_eos)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let truncated_away = encoded_pairs
            .iter()
            .filter(|pair| pair.has_empty_completion())
            .count();
        if truncated_away > 0 {
            tracing::warn!(
                truncated_away,
                max_length = config.max_length,
                "pairs with an empty completion region contribute no training signal"
            );
        }

        let dataset_ = PreferenceDataset_ {
            data,
            encoded_pairs,
        };
        Ok(Self(Rc::new(dataset_)))
    }

    /// Gets the number of preference examples.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Checks whether the dataset has no preference examples.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the tokenized pair at specified index
    pub fn get_item_at_index(&self, idx: usize) -> Option<&TokenizedPair> {
        self.encoded_pairs.get(idx)
    }

    pub fn data(&self) -> &Vec<PreferenceExample> {
        &self.data
    }

    pub fn encoded_pairs(&self) -> &Vec<TokenizedPair> {
        &self.encoded_pairs
    }
}

/// Iterates a `PreferenceDataset` in batches of `TokenizedPair`
pub struct PreferenceDataLoader {
    dataset: PreferenceDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
}

impl PreferenceDataLoader {
    pub fn new(
        dataset: PreferenceDataset,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        seed: u64,
    ) -> Self {
        Self {
            dataset,
            batch_size,
            shuffle,
            drop_last,
            seed,
        }
    }

    /// Returns a `PreferenceBatcher` over the dataset for the given epoch
    ///
    /// Shuffled order is seeded by `seed + epoch`, so runs are reproducible.
    pub fn batcher(&self, epoch: usize) -> PreferenceBatcher {
        let mut indices = (0..self.dataset.len()).collect::<Vec<_>>();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        PreferenceBatcher {
            dataset: self.dataset.clone(),
            indices,
            cursor: 0,
            batch_size: std::cmp::max(self.batch_size, 1),
            drop_last: self.drop_last,
        }
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        let batch_size = std::cmp::max(self.batch_size, 1);
        if self.drop_last {
            self.dataset.len() / batch_size
        } else {
            self.dataset.len().div_ceil(batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dataset(&self) -> &PreferenceDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

pub struct PreferenceBatcher {
    dataset: PreferenceDataset,
    indices: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    drop_last: bool,
}

impl Iterator for PreferenceBatcher {
    type Item = Vec<TokenizedPair>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.indices.len() - self.cursor;
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }
        let end = std::cmp::min(self.cursor + self.batch_size, self.indices.len());
        let batch = self.indices[self.cursor..end]
            .iter()
            .map(|&idx| self.dataset.encoded_pairs[idx].clone())
            .collect::<Vec<_>>();
        self.cursor = end;
        Some(batch)
    }
}

/// Padded model inputs for a batch of pairs
///
/// Rows `0..batch_size` hold chosen sequences and rows
/// `batch_size..2 * batch_size` the rejected ones.
pub struct PreferenceBatch {
    /// `(2 * batch_size, seq_len)` token ids
    pub input_ids: Tensor,
    /// `(2 * batch_size, seq_len - 1)` with 1.0 where the target token is in
    /// the completion region
    pub completion_mask: Tensor,
    pub batch_size: usize,
}

/// Pads pairs into a single `PreferenceBatch`
#[derive(Clone, Debug)]
pub struct PreferenceCollator {
    pad_token_id: u32,
    device: Device,
}

impl Default for PreferenceCollator {
    fn default() -> Self {
        Self {
            pad_token_id: crate::tokenizer::GPT2_EOS_TOKEN_ID,
            device: Device::Cpu,
        }
    }
}

impl PreferenceCollator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Right-pads chosen then rejected sequences and masks everything outside
    /// the completion regions
    ///
    /// Target position `t` scores token `t + 1`; it is kept when
    /// `prompt_length <= t + 1 < len`. Token 0 has no context and is never
    /// scored. Sequences are padded to at least two tokens.
    pub fn collate(&self, pairs: &[TokenizedPair]) -> Result<PreferenceBatch> {
        let batch_size = pairs.len();
        let sequences = pairs
            .iter()
            .map(|p| (p.chosen_tokens(), p.prompt_length()))
            .chain(pairs.iter().map(|p| (p.rejected_tokens(), p.prompt_length())))
            .collect::<Vec<_>>();
        let seq_len = sequences
            .iter()
            .map(|(tokens, _)| tokens.len())
            .max()
            .unwrap_or(0)
            .max(2);

        let mut input_ids: Vec<u32> = Vec::with_capacity(sequences.len() * seq_len);
        let mut mask: Vec<f32> = Vec::with_capacity(sequences.len() * (seq_len - 1));
        for (tokens, prompt_length) in sequences.iter() {
            input_ids.extend_from_slice(tokens);
            input_ids.extend(std::iter::repeat(self.pad_token_id).take(seq_len - tokens.len()));
            mask.extend((1..seq_len).map(|target_ix| {
                if target_ix >= *prompt_length && target_ix < tokens.len() {
                    1_f32
                } else {
                    0_f32
                }
            }));
        }

        let rows = sequences.len();
        let input_ids = Tensor::from_vec(input_ids, (rows, seq_len), &self.device)?;
        let completion_mask = Tensor::from_vec(mask, (rows, seq_len - 1), &self.device)?;
        Ok(PreferenceBatch {
            input_ids,
            completion_mask,
            batch_size,
        })
    }
}
