//! Tokenizer seam and prompt formatting

use crate::config::{PromptStyle, TokenizerSource};
use anyhow::{anyhow, Context};
use std::path::Path;
use tiktoken_rs::{get_bpe_from_model, CoreBPE};

/// GPT-2 `<|endoftext|>` token id
pub const GPT2_EOS_TOKEN_ID: u32 = 50_256;

/// Deterministic text <-> token id mapping with an end-of-sequence token that
/// doubles as padding
pub trait TextTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>>;

    fn decode(&self, token_ids: &[u32]) -> anyhow::Result<String>;

    fn eos_token_id(&self) -> u32;
}

impl TextTokenizer for CoreBPE {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        Ok(self.encode_with_special_tokens(text))
    }

    fn decode(&self, token_ids: &[u32]) -> anyhow::Result<String> {
        CoreBPE::decode(self, token_ids.to_vec())
    }

    fn eos_token_id(&self) -> u32 {
        GPT2_EOS_TOKEN_ID
    }
}

/// A `tokenizers::Tokenizer` (e.g. the `tokenizer.json` of a Hub model)
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos_token_id: u32,
}

impl HfTokenizer {
    pub fn new(inner: tokenizers::Tokenizer, eos_token: &str) -> anyhow::Result<Self> {
        let eos_token_id = inner
            .token_to_id(eos_token)
            .ok_or_else(|| anyhow!("EOS token `{eos_token}` is not in the vocabulary"))?;
        Ok(Self {
            inner,
            eos_token_id,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P, eos_token: &str) -> anyhow::Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Unable to load tokenizer {}", path.as_ref().display()))?;
        Self::new(inner, eos_token)
    }

    /// Fetches `tokenizer.json` from a Hub model repository
    pub fn from_hub(repo_id: &str, eos_token: &str) -> anyhow::Result<Self> {
        let api = hf_hub::api::sync::Api::new()?;
        let path = api
            .model(repo_id.to_string())
            .get("tokenizer.json")
            .with_context(|| format!("Unable to fetch tokenizer.json from {repo_id}"))?;
        Self::from_file(path, eos_token)
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false).map_err(anyhow::Error::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, token_ids: &[u32]) -> anyhow::Result<String> {
        self.inner
            .decode(token_ids, true)
            .map_err(anyhow::Error::msg)
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}

/// Builds the tokenizer named by a `TokenizerSource`
pub fn load_tokenizer(source: &TokenizerSource) -> anyhow::Result<Box<dyn TextTokenizer>> {
    let tokenizer: Box<dyn TextTokenizer> = match source {
        TokenizerSource::Gpt2Bpe => Box::new(get_bpe_from_model("gpt2")?),
        TokenizerSource::HubRepo { repo_id, eos_token } => {
            let tokenizer = HfTokenizer::from_hub(repo_id, eos_token)?;
            tracing::info!(repo_id = %repo_id, vocab_size = tokenizer.vocab_size(), "loaded tokenizer");
            Box::new(tokenizer)
        }
        TokenizerSource::LocalFile { path, eos_token } => {
            let tokenizer = HfTokenizer::from_file(path, eos_token)?;
            tracing::info!(
                path = %path.display(),
                vocab_size = tokenizer.vocab_size(),
                "loaded tokenizer"
            );
            Box::new(tokenizer)
        }
    };
    Ok(tokenizer)
}

/// Frames a raw prompt before it is tokenized
pub trait PromptFormatter {
    fn format_prompt(&self, prompt: &str) -> String;
}

/// Uses the prompt text as is
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPromptFormatter;

impl PromptFormatter for RawPromptFormatter {
    fn format_prompt(&self, prompt: &str) -> String {
        prompt.to_string()
    }
}

/// Instruction framing with a trailing response header, so completions start
/// right after `### Response:`
#[derive(Debug, Clone, Copy, Default)]
pub struct InstructionPromptFormatter;

impl PromptFormatter for InstructionPromptFormatter {
    fn format_prompt(&self, prompt: &str) -> String {
        format!(
            "Below is an instruction that describes a task. Write a response that \
            appropriately completes the request.\n\n### Instruction:\n{prompt}\n\n### Response:\n"
        )
    }
}

pub fn prompt_formatter_for(style: PromptStyle) -> Box<dyn PromptFormatter> {
    match style {
        PromptStyle::Raw => Box::new(RawPromptFormatter),
        PromptStyle::Instruction => Box::new(InstructionPromptFormatter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;

    #[fixture]
    fn gpt2_tokenizer() -> CoreBPE {
        get_bpe_from_model("gpt2").unwrap()
    }

    #[rstest]
    #[case("In the heart of the city")]
    #[case("ما هي عاصمة المملكة العربية السعودية؟")]
    fn test_gpt2_encode_decode(gpt2_tokenizer: CoreBPE, #[case] txt: &str) -> Result<()> {
        let token_ids = TextTokenizer::encode(&gpt2_tokenizer, txt)?;
        let decoded = TextTokenizer::decode(&gpt2_tokenizer, &token_ids)?;
        assert_eq!(decoded, txt);
        Ok(())
    }

    #[rstest]
    fn test_gpt2_eos_token(gpt2_tokenizer: CoreBPE) -> Result<()> {
        let token_ids = TextTokenizer::encode(&gpt2_tokenizer, "<|endoftext|>")?;
        assert_eq!(token_ids, vec![gpt2_tokenizer.eos_token_id()]);
        Ok(())
    }

    #[rstest]
    fn test_load_tokenizer_gpt2() -> Result<()> {
        let tokenizer = load_tokenizer(&TokenizerSource::Gpt2Bpe)?;
        assert_eq!(tokenizer.eos_token_id(), GPT2_EOS_TOKEN_ID);
        Ok(())
    }

    #[fixture]
    fn word_level_tokenizer_json() -> String {
        r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": { "[UNK]": 0, "hello": 1, "world": 2, "<eos>": 3 },
                "unk_token": "[UNK]"
            }
        }"#
        .to_string()
    }

    #[rstest]
    fn test_load_tokenizer_local_file(word_level_tokenizer_json: String) -> Result<()> {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(word_level_tokenizer_json.as_bytes())?;
        let source = TokenizerSource::LocalFile {
            path: file.path().to_path_buf(),
            eos_token: "<eos>".to_string(),
        };

        let tokenizer = load_tokenizer(&source)?;
        let token_ids = tokenizer.encode("hello world")?;
        assert_eq!(token_ids, vec![1_u32, 2]);
        assert_eq!(tokenizer.decode(&token_ids)?, "hello world");
        assert_eq!(tokenizer.eos_token_id(), 3_u32);

        let hf = HfTokenizer::from_file(file.path(), "<eos>")?;
        assert_eq!(hf.vocab_size(), 4_usize);
        Ok(())
    }

    #[rstest]
    fn test_hf_tokenizer_rejects_unknown_eos(word_level_tokenizer_json: String) -> Result<()> {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(word_level_tokenizer_json.as_bytes())?;
        assert!(HfTokenizer::from_file(file.path(), "</s>").is_err());
        Ok(())
    }

    #[rstest]
    fn test_prompt_formatters() {
        let prompt = "Translate to English: مرحبا";
        assert_eq!(RawPromptFormatter.format_prompt(prompt), prompt);

        let formatted = InstructionPromptFormatter.format_prompt(prompt);
        assert!(formatted.contains(prompt));
        assert!(formatted.ends_with("### Response:\n"));
    }
}
