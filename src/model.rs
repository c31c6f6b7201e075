//! A compact GPT-style causal language model with optional low-rank adapters

use crate::error::{DpoError, DpoResult};
use crate::lora::{AdapterSwitch, LoraConfig, LoraLinear};
use candle_core::{bail, IndexOp, Module, ModuleT, Result, Tensor, Var, D};
use candle_nn::{embedding, linear_b, ops::softmax, Embedding, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

const EPS: f32 = 1e-5;

/// Config for specifying parameters of a `CausalLm`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub context_length: usize,
    pub emb_dim: usize,
    pub n_heads: usize,
    pub n_layers: usize,
}

impl ModelConfig {
    /// A model small enough to train on CPU in the demos
    pub fn small(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            context_length: 256,
            emb_dim: 128,
            n_heads: 4,
            n_layers: 4,
        }
    }

    /// Returns a custom configuration to be used in unit tests
    pub fn tiny_test() -> Self {
        Self {
            vocab_size: 64,
            context_length: 16,
            emb_dim: 12,
            n_heads: 3,
            n_layers: 2,
        }
    }

    pub fn validate(&self) -> DpoResult<()> {
        if self.n_heads == 0 || self.emb_dim % self.n_heads != 0 {
            return Err(DpoError::InvalidConfiguration(format!(
                "emb_dim {} must be divisible by n_heads {}",
                self.emb_dim, self.n_heads
            )));
        }
        if self.vocab_size == 0 || self.context_length < 2 {
            return Err(DpoError::InvalidConfiguration(
                "vocab_size must be positive and context_length at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where and how adapters are attached when building a `CausalLm`
pub struct LoraAttachment<'a> {
    pub config: LoraConfig,
    /// Adapter variables are created here, not in the base `VarBuilder`
    pub vb: VarBuilder<'a>,
    pub switch: AdapterSwitch,
}

/// Explicit projection enum
///
/// Keeps the concrete type of each adapted projection instead of a trait
/// object, so the model can be rebuilt with or without adapters.
#[derive(Clone, Debug)]
pub enum Projection {
    Linear(Linear),
    Lora(LoraLinear),
}

impl Projection {
    fn new(
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        name: &str,
        vb: &VarBuilder<'_>,
        adapters: Option<&LoraAttachment<'_>>,
    ) -> Result<Self> {
        let base = linear_b(in_dim, out_dim, bias, vb.pp(name))?;
        match adapters {
            Some(lora) => {
                // mirror the base variable path inside the adapter VarMap
                let prefix = vb.prefix();
                let adapter_vb = if prefix.is_empty() {
                    lora.vb.pp(name)
                } else {
                    lora.vb.pp(prefix).pp(name)
                };
                Ok(Projection::Lora(LoraLinear::new(
                    &base,
                    &lora.config,
                    lora.switch.clone(),
                    adapter_vb,
                )?))
            }
            None => Ok(Projection::Linear(base)),
        }
    }
}

impl Module for Projection {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Projection::Linear(l) => l.forward(xs),
            Projection::Lora(l) => l.forward(xs),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LayerNorm {
    scale: Tensor,
    shift: Tensor,
}

impl LayerNorm {
    pub fn new(emb_dim: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let scale = vb.get_with_hints(emb_dim, "scale", candle_nn::Init::Const(1.))?;
        let shift = vb.get_with_hints(emb_dim, "shift", candle_nn::Init::Const(0.))?;
        Ok(Self { scale, shift })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let norm_xs = centered.broadcast_div(&(var + EPS as f64)?.sqrt()?)?;
        norm_xs
            .broadcast_mul(&self.scale)?
            .broadcast_add(&self.shift)
    }
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = on_false.shape();
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape)?;
    mask.broadcast_as(shape)?.where_cond(&on_true, on_false)
}

/// Causal multi-head self-attention; query and value projections take adapters
#[derive(Clone, Debug)]
pub struct CausalSelfAttention {
    w_query: Projection,
    w_key: Linear,
    w_value: Projection,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    pub fn new(
        cfg: ModelConfig,
        vb: VarBuilder<'_>,
        adapters: Option<&LoraAttachment<'_>>,
    ) -> Result<Self> {
        let d = cfg.emb_dim;
        let w_query = Projection::new(d, d, false, "query", &vb, adapters)?;
        let w_key = linear_b(d, d, false, vb.pp("key"))?;
        let w_value = Projection::new(d, d, false, "value", &vb, adapters)?;
        let out_proj = linear_b(d, d, true, vb.pp("out_proj"))?;
        Ok(Self {
            w_query,
            w_key,
            w_value,
            out_proj,
            num_heads: cfg.n_heads,
            head_dim: d / cfg.n_heads,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, num_tokens, _d) = xs.dims3()?;
        xs.reshape((b, num_tokens, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl Module for CausalSelfAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, num_tokens, d_out) = xs.dims3()?;
        let queries = self.split_heads(&self.w_query.forward(xs)?)?;
        let keys = self.split_heads(&self.w_key.forward(xs)?)?;
        let values = self.split_heads(&self.w_value.forward(xs)?)?;

        let attn_scores = queries.matmul(&keys.t()?.contiguous()?)?;
        let mask: Vec<u8> = (0..num_tokens)
            .flat_map(|i| (0..num_tokens).map(move |j| u8::from(j > i)))
            .collect();
        let mask = Tensor::from_slice(&mask, (num_tokens, num_tokens), xs.device())?;
        let masked = masked_fill(&attn_scores, &mask, f32::NEG_INFINITY)?;

        let scaling = 1. / (self.head_dim as f64).sqrt();
        let attn_weights = softmax(&(masked * scaling)?, D::Minus1)?;
        let context = attn_weights
            .matmul(&values)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, num_tokens, d_out))?;
        self.out_proj.forward(&context)
    }
}

#[derive(Clone, Debug)]
pub struct FeedForward {
    expand: Linear,
    contract: Linear,
}

impl FeedForward {
    pub fn new(cfg: ModelConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let expand = linear_b(cfg.emb_dim, 4_usize * cfg.emb_dim, true, vb.pp("expand"))?;
        let contract = linear_b(4_usize * cfg.emb_dim, cfg.emb_dim, true, vb.pp("contract"))?;
        Ok(Self { expand, contract })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.contract.forward(&self.expand.forward(xs)?.gelu()?)
    }
}

/// Pre-norm transformer block with residual connections
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    att: CausalSelfAttention,
    ff: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
}

impl TransformerBlock {
    pub fn new(
        cfg: ModelConfig,
        vb: VarBuilder<'_>,
        adapters: Option<&LoraAttachment<'_>>,
    ) -> Result<Self> {
        Ok(Self {
            att: CausalSelfAttention::new(cfg, vb.pp("att"), adapters)?,
            ff: FeedForward::new(cfg, vb.pp("ff"))?,
            norm1: LayerNorm::new(cfg.emb_dim, vb.pp("norm1"))?,
            norm2: LayerNorm::new(cfg.emb_dim, vb.pp("norm2"))?,
        })
    }
}

impl Module for TransformerBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x = (self.att.forward(&self.norm1.forward(xs)?)? + xs)?;
        self.ff.forward(&self.norm2.forward(&x)?)? + x
    }
}

/// Token + position embeddings, a stack of `TransformerBlock`s and an output head
pub struct CausalLm {
    cfg: ModelConfig,
    tok_emb: Embedding,
    pos_emb: Embedding,
    trf_blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
    out_head: Projection,
    adapter_switch: Option<AdapterSwitch>,
}

impl CausalLm {
    /// Creates a new `CausalLm`
    ///
    /// ```rust
    /// use candle_core::{Device, DType};
    /// use candle_nn::{VarBuilder, VarMap};
    /// use dpo_from_scratch_rs::model::{CausalLm, ModelConfig};
    ///
    /// let varmap = VarMap::new();
    /// let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    /// let model = CausalLm::new(ModelConfig::tiny_test(), vb, None).unwrap();
    /// ```
    pub fn new(
        cfg: ModelConfig,
        vb: VarBuilder<'_>,
        adapters: Option<&LoraAttachment<'_>>,
    ) -> Result<Self> {
        if let Err(e) = cfg.validate() {
            bail!("{e}")
        }
        let tok_emb = embedding(cfg.vocab_size, cfg.emb_dim, vb.pp("tok_emb"))?;
        let pos_emb = embedding(cfg.context_length, cfg.emb_dim, vb.pp("pos_emb"))?;
        let trf_blocks = (0..cfg.n_layers)
            .map(|ix| TransformerBlock::new(cfg, vb.pp(format!("trf.{ix}")), adapters))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = LayerNorm::new(cfg.emb_dim, vb.pp("final_norm"))?;
        let out_head = Projection::new(cfg.emb_dim, cfg.vocab_size, false, "out_head", &vb, adapters)?;
        Ok(Self {
            cfg,
            tok_emb,
            pos_emb,
            trf_blocks,
            final_norm,
            out_head,
            adapter_switch: adapters.map(|a| a.switch.clone()),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    /// The switch shared by every adapter, when the model has any
    pub fn adapter_switch(&self) -> Option<&AdapterSwitch> {
        self.adapter_switch.as_ref()
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, false)
    }
}

impl ModuleT for CausalLm {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        let (_batch_size, seq_len) = xs.dims2()?;
        if seq_len > self.cfg.context_length {
            bail!(
                "sequence length {seq_len} exceeds context length {}",
                self.cfg.context_length
            )
        }
        let tok_embeds = self.tok_emb.forward(xs)?;
        let pos_ids = Tensor::arange(0u32, seq_len as u32, xs.device())?;
        let pos_embeds = self.pos_emb.embeddings().index_select(&pos_ids, 0)?;

        let mut x = tok_embeds.broadcast_add(&pos_embeds)?;
        for block in self.trf_blocks.iter() {
            x = block.forward(&x)?;
        }
        x = self.final_norm.forward(&x)?;
        self.out_head.forward(&x)
    }
}

/// Deep copy of every variable in `varmap`
///
/// Building a model from the copy yields a reference whose weights no longer
/// move with the original.
pub fn frozen_copy(varmap: &VarMap) -> Result<VarMap> {
    let copy = VarMap::new();
    {
        let source = varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let mut target = copy
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        for (name, var) in source.iter() {
            target.insert(name.clone(), Var::from_tensor(&var.as_tensor().copy()?)?);
        }
    }
    Ok(copy)
}

/// Greedy decoding: appends the arg-max token until `max_new_tokens` or `eos_token_id`
///
/// The context is cropped to the model's last `context_length` tokens.
pub fn generate_greedy<M: ModuleT>(
    model: &M,
    prompt_ids: &[u32],
    max_new_tokens: usize,
    context_length: usize,
    eos_token_id: Option<u32>,
    device: &candle_core::Device,
) -> Result<Vec<u32>> {
    if prompt_ids.is_empty() || context_length == 0 {
        bail!("generation needs a non-empty prompt and a positive context length")
    }
    let mut idx = prompt_ids.to_vec();
    for _ in 0..max_new_tokens {
        let start_token_index = idx.len().saturating_sub(context_length);
        let idx_cond = Tensor::new(&idx[start_token_index..], device)?.unsqueeze(0)?;
        let logits = model.forward_t(&idx_cond, false)?;
        let (_b, c, _vocab_size) = logits.dims3()?;
        let idx_next = logits.i((0, c - 1))?.argmax(D::Minus1)?.to_scalar::<u32>()?;
        if Some(idx_next) == eos_token_id {
            break;
        }
        idx.push(idx_next);
    }
    Ok(idx)
}

/// Count of scalar parameters in a `VarMap`
pub fn num_parameters(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::{DType, Device};
    use rstest::*;

    #[fixture]
    pub fn varmap() -> VarMap {
        VarMap::new()
    }

    #[fixture]
    pub fn batch_token_ids() -> Tensor {
        Tensor::new(&[[11_u32, 36, 10, 34], [11, 12, 32, 57]], &Device::Cpu).unwrap()
    }

    #[rstest]
    fn test_model_config_validation() {
        assert!(ModelConfig::tiny_test().validate().is_ok());
        assert!(ModelConfig::small(50_257).validate().is_ok());
        let cfg = ModelConfig {
            n_heads: 5,
            ..ModelConfig::tiny_test()
        };
        assert!(cfg.validate().is_err());
    }

    #[rstest]
    fn test_layer_norm_forward(varmap: VarMap) -> Result<()> {
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer_norm = LayerNorm::new(6, vb.pp("layer_norm"))?;
        let batch_example = Tensor::rand(0f32, 1f32, (2_usize, 6_usize), vb.device())?;

        let out_norm = layer_norm.forward(&batch_example)?;
        let mean = out_norm.mean_keepdim(D::Minus1)?.abs()?;

        assert_eq!(out_norm.dims(), &[2, 6]);
        assert!(mean.max_keepdim(0)?.squeeze(0)?.to_vec1::<f32>()?[0] < 1e-4);
        Ok(())
    }

    #[rstest]
    fn test_attention_is_causal(varmap: VarMap) -> Result<()> {
        let cfg = ModelConfig::tiny_test();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let att = CausalSelfAttention::new(cfg, vb.pp("att"), None)?;
        let xs = Tensor::rand(0f32, 1f32, (1_usize, 4_usize, cfg.emb_dim), vb.device())?;
        let changed_last = Tensor::cat(
            &[
                xs.narrow(1, 0, 3)?,
                Tensor::rand(0f32, 1f32, (1_usize, 1_usize, cfg.emb_dim), vb.device())?,
            ],
            1,
        )?;

        let out = att.forward(&xs)?.narrow(1, 0, 3)?;
        let out_changed = att.forward(&changed_last)?.narrow(1, 0, 3)?;
        let diff = (out - out_changed)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[rstest]
    fn test_causal_lm_forward(varmap: VarMap, batch_token_ids: Tensor) -> Result<()> {
        let cfg = ModelConfig::tiny_test();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CausalLm::new(cfg, vb, None)?;
        let (batch_size, seq_len) = batch_token_ids.dims2()?;

        let logits = model.forward(&batch_token_ids)?;

        assert_eq!(logits.dims(), &[batch_size, seq_len, cfg.vocab_size]);
        assert!(model.adapter_switch().is_none());
        Ok(())
    }

    #[rstest]
    fn test_causal_lm_rejects_long_sequences(varmap: VarMap) -> Result<()> {
        let cfg = ModelConfig::tiny_test();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CausalLm::new(cfg, vb, None)?;
        let too_long = Tensor::zeros((1, cfg.context_length + 1), DType::U32, &Device::Cpu)?;
        assert!(model.forward(&too_long).is_err());
        Ok(())
    }

    #[rstest]
    fn test_causal_lm_with_adapters(varmap: VarMap, batch_token_ids: Tensor) -> Result<()> {
        let cfg = ModelConfig::tiny_test();
        let dev = Device::Cpu;
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let adapter_map = VarMap::new();
        let attachment = LoraAttachment {
            config: LoraConfig::new(2, 4.),
            vb: VarBuilder::from_varmap(&adapter_map, DType::F32, &dev),
            switch: AdapterSwitch::new(),
        };
        let model = CausalLm::new(cfg, vb.clone(), Some(&attachment))?;
        let base = CausalLm::new(cfg, vb, None)?;

        // query + value per layer, plus the output head; each with A and B
        assert_eq!(adapter_map.all_vars().len(), (2 * cfg.n_layers + 1) * 2);
        assert!(model.adapter_switch().is_some());
        assert_eq!(
            model.forward(&batch_token_ids)?.to_vec3::<f32>()?,
            base.forward(&batch_token_ids)?.to_vec3::<f32>()?
        );
        Ok(())
    }

    #[rstest]
    fn test_frozen_copy_is_independent(mut varmap: VarMap) -> Result<()> {
        let cfg = ModelConfig::tiny_test();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _model = CausalLm::new(cfg, vb, None)?;

        let copy = frozen_copy(&varmap)?;
        assert_eq!(num_parameters(&copy), num_parameters(&varmap));

        let name = "final_norm.shift";
        let before = copy.data().lock().unwrap()[name].as_tensor().to_vec1::<f32>()?;
        varmap.set_one(name, Tensor::ones(cfg.emb_dim, DType::F32, &Device::Cpu)?)?;
        let after = copy.data().lock().unwrap()[name].as_tensor().to_vec1::<f32>()?;
        assert_eq!(before, after);
        assert_eq!(after, vec![0_f32; cfg.emb_dim]);
        Ok(())
    }

    #[rstest]
    fn test_generate_greedy(varmap: VarMap) -> Result<()> {
        let cfg = ModelConfig::tiny_test();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CausalLm::new(cfg, vb, None)?;
        let prompt = [1_u32, 2, 3];

        let out = generate_greedy(&model, &prompt, 20, cfg.context_length, None, &Device::Cpu)?;
        assert_eq!(out.len(), prompt.len() + 20);
        assert_eq!(&out[..3], &prompt);

        // greedy decoding is deterministic
        let again = generate_greedy(&model, &prompt, 20, cfg.context_length, None, &Device::Cpu)?;
        assert_eq!(out, again);
        Ok(())
    }

    #[rstest]
    fn test_generate_greedy_rejects_empty_prompt(varmap: VarMap) -> Result<()> {
        let cfg = ModelConfig::tiny_test();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CausalLm::new(cfg, vb, None)?;

        assert!(generate_greedy(&model, &[], 5, cfg.context_length, None, &Device::Cpu).is_err());
        assert!(generate_greedy(&model, &[1, 2], 5, 0, None, &Device::Cpu).is_err());
        Ok(())
    }
}
