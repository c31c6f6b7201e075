//! Low-rank adapters
//!
//! A `LoraLinear` computes `W x + (alpha / rank) * B A x` where `W` is a
//! detached base projection, `A` is Kaiming-uniform and `B` starts at zero, so a
//! freshly adapted model scores exactly like its base. Adapter variables are
//! built from their own `VarBuilder`, which lets the optimizer see them alone.
//!
//! All adapters of one model share an `AdapterSwitch`. Turning it off recovers
//! the base model, which is how the adapter-toggle reference is produced.

use crate::error::{DpoError, DpoResult};
use crate::scorer::Scorer;
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{init, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    /// Rank of the `B A` decomposition
    pub rank: usize,
    pub alpha: f64,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 16_f64,
        }
    }
}

impl LoraConfig {
    pub fn new(rank: usize, alpha: f64) -> Self {
        Self { rank, alpha }
    }

    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn validate(&self) -> DpoResult<()> {
        if self.rank == 0 {
            return Err(DpoError::InvalidConfiguration(
                "lora rank must be at least 1".to_string(),
            ));
        }
        if !self.alpha.is_finite() || self.alpha <= 0_f64 {
            return Err(DpoError::InvalidConfiguration(format!(
                "lora alpha must be a positive finite number, got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

/// Shared on/off flag for every adapter of a model
#[derive(Clone, Debug)]
pub struct AdapterSwitch(Arc<AtomicBool>);

impl Default for AdapterSwitch {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl AdapterSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst)
    }

    /// Disables the adapters until the returned guard is dropped
    pub fn disable(&self) -> AdapterGuard {
        let previous = self.0.swap(false, Ordering::SeqCst);
        AdapterGuard {
            switch: self.clone(),
            previous,
        }
    }
}

/// Restores the switch to its prior state on drop
pub struct AdapterGuard {
    switch: AdapterSwitch,
    previous: bool,
}

impl Drop for AdapterGuard {
    fn drop(&mut self) {
        self.switch.set_enabled(self.previous)
    }
}

/// A frozen `Linear` plus a trainable low-rank update
#[derive(Clone, Debug)]
pub struct LoraLinear {
    base: Linear,
    lora_a: Tensor,
    lora_b: Tensor,
    scaling: f64,
    switch: AdapterSwitch,
}

impl LoraLinear {
    /// Wraps `base`, whose weights are detached so they never receive gradients
    pub fn new(
        base: &Linear,
        config: &LoraConfig,
        switch: AdapterSwitch,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let (out_features, in_features) = base.weight().dims2()?;
        let base = Linear::new(base.weight().detach(), base.bias().map(|b| b.detach()));
        let lora_a = vb.get_with_hints(
            (config.rank, in_features),
            "lora_a",
            Init::Kaiming {
                dist: init::NormalOrUniform::Uniform,
                fan: init::FanInOut::FanIn,
                non_linearity: init::NonLinearity::Linear,
            },
        )?;
        let lora_b = vb.get_with_hints((out_features, config.rank), "lora_b", Init::Const(0.))?;
        Ok(Self {
            base,
            lora_a,
            lora_b,
            scaling: config.scaling(),
            switch,
        })
    }

    pub fn base(&self) -> &Linear {
        &self.base
    }

    pub fn rank(&self) -> usize {
        self.lora_a.dims()[0]
    }
}

impl Module for LoraLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let base_out = self.base.forward(xs)?;
        if !self.switch.is_enabled() {
            return Ok(base_out);
        }
        let lora_out = xs
            .broadcast_matmul(&self.lora_a.t()?)?
            .broadcast_matmul(&self.lora_b.t()?)?;
        base_out + (lora_out * self.scaling)?
    }
}

/// Scores with the adapters switched off and returns detached log-probabilities
pub struct AdapterDisabledScorer<S> {
    inner: S,
    switch: AdapterSwitch,
}

impl<S: Scorer> AdapterDisabledScorer<S> {
    pub fn new(inner: S, switch: AdapterSwitch) -> Self {
        Self { inner, switch }
    }
}

impl<S: Scorer> Scorer for AdapterDisabledScorer<S> {
    fn token_logprobs(&self, input_ids: &Tensor) -> Result<Tensor> {
        let _guard = self.switch.disable();
        Ok(self.inner.token_logprobs(input_ids)?.detach())
    }
}

/// Runs the wrapped model with its adapters switched off
pub struct WithoutAdapters<'a, M> {
    model: &'a M,
    switch: AdapterSwitch,
}

impl<'a, M: ModuleT> WithoutAdapters<'a, M> {
    pub fn new(model: &'a M, switch: AdapterSwitch) -> Self {
        Self { model, switch }
    }
}

impl<M: ModuleT> ModuleT for WithoutAdapters<'_, M> {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _guard = self.switch.disable();
        self.model.forward_t(xs, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::{DType, Device};
    use candle_nn::{linear_b, VarMap};
    use rstest::*;

    #[fixture]
    fn varmaps() -> (VarMap, VarMap) {
        (VarMap::new(), VarMap::new())
    }

    #[rstest]
    fn test_lora_config_validation() {
        assert!(LoraConfig::default().validate().is_ok());
        assert!(LoraConfig::new(0, 16.).validate().is_err());
        assert!(LoraConfig::new(4, 0.).validate().is_err());
        assert_eq!(LoraConfig::new(4, 8.).scaling(), 2_f64);
    }

    #[rstest]
    fn test_lora_linear_init(varmaps: (VarMap, VarMap)) -> Result<()> {
        let (base_map, adapter_map) = varmaps;
        let dev = Device::Cpu;
        let base_vb = VarBuilder::from_varmap(&base_map, DType::F32, &dev);
        let adapter_vb = VarBuilder::from_varmap(&adapter_map, DType::F32, &dev);
        let base = linear_b(6, 5, true, base_vb.pp("proj"))?;
        let cfg = LoraConfig::new(2, 4.);

        let lora = LoraLinear::new(&base, &cfg, AdapterSwitch::new(), adapter_vb.pp("proj"))?;

        assert_eq!(lora.rank(), 2_usize);
        assert_eq!(lora.lora_a.dims(), &[2, 6]);
        assert_eq!(lora.lora_b.dims(), &[5, 2]);
        assert_eq!(lora.lora_b.sum_all()?.to_scalar::<f32>()?, 0_f32);
        assert_eq!(adapter_map.all_vars().len(), 2_usize);
        assert_eq!(base_map.all_vars().len(), 2_usize);
        assert!(!lora.base().weight().is_variable());
        Ok(())
    }

    #[rstest]
    fn test_lora_linear_forward_matches_base_at_init(varmaps: (VarMap, VarMap)) -> Result<()> {
        let (base_map, adapter_map) = varmaps;
        let dev = Device::Cpu;
        let base_vb = VarBuilder::from_varmap(&base_map, DType::F32, &dev);
        let adapter_vb = VarBuilder::from_varmap(&adapter_map, DType::F32, &dev);
        let base = linear_b(3, 4, false, base_vb.pp("proj"))?;
        let lora = LoraLinear::new(
            &base,
            &LoraConfig::default(),
            AdapterSwitch::new(),
            adapter_vb.pp("proj"),
        )?;

        let xs = Tensor::rand(0f32, 1f32, (2_usize, 3_usize, 3_usize), &dev)?;
        let out = lora.forward(&xs)?;
        let expected = base.forward(&xs)?;

        assert_eq!(out.dims(), &[2, 3, 4]);
        assert_eq!(out.to_vec3::<f32>()?, expected.to_vec3::<f32>()?);
        Ok(())
    }

    #[rstest]
    fn test_adapter_switch_toggles_update(varmaps: (VarMap, VarMap)) -> Result<()> {
        let (base_map, mut adapter_map) = varmaps;
        let dev = Device::Cpu;
        let base_vb = VarBuilder::from_varmap(&base_map, DType::F32, &dev);
        let adapter_vb = VarBuilder::from_varmap(&adapter_map, DType::F32, &dev);
        let base = linear_b(3, 4, false, base_vb.pp("proj"))?;
        let switch = AdapterSwitch::new();
        let lora = LoraLinear::new(
            &base,
            &LoraConfig::new(2, 2.),
            switch.clone(),
            adapter_vb.pp("proj"),
        )?;
        // simulate a trained adapter
        adapter_map.set_one("proj.lora_b", Tensor::ones((4, 2), DType::F32, &dev)?)?;

        let xs = Tensor::ones((1_usize, 3_usize), DType::F32, &dev)?;
        let base_out = base.forward(&xs)?.to_vec2::<f32>()?;
        assert_ne!(lora.forward(&xs)?.to_vec2::<f32>()?, base_out);
        {
            let _guard = switch.disable();
            assert!(!switch.is_enabled());
            assert_eq!(lora.forward(&xs)?.to_vec2::<f32>()?, base_out);
        }
        assert!(switch.is_enabled());
        Ok(())
    }
}
