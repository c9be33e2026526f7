//! Optimizers for adapter training
//!
//! `PagedAdamW` keeps its first and second moments in host memory and moves
//! them to the accelerator only for the duration of each update, so
//! optimizer state does not compete with activations for device memory.

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::optim::Optimizer;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Which optimizer the trainer builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// AdamW with moments paged from host memory
    #[default]
    PagedAdamW,
    /// AdamW with moments resident on the training device
    AdamW,
}

impl std::str::FromStr for OptimizerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "paged_adamw" | "paged_adamw_8bit" | "paged" => Ok(Self::PagedAdamW),
            "adamw" => Ok(Self::AdamW),
            _ => Err(anyhow::anyhow!(
                "Invalid optimizer: {}. Valid options: paged_adamw, adamw",
                s
            )),
        }
    }
}

/// AdamW hyperparameters
#[derive(Debug, Clone)]
pub struct ParamsPagedAdamW {
    /// Learning rate
    pub lr: f64,
    /// Beta1 (first moment decay)
    pub beta1: f64,
    /// Beta2 (second moment decay)
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// Decoupled weight decay coefficient
    pub weight_decay: f64,
    /// Keep moments in host memory between steps
    pub paged: bool,
}

impl Default for ParamsPagedAdamW {
    fn default() -> Self {
        Self {
            lr: 5e-5,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            paged: true,
        }
    }
}

struct VarState {
    name: String,
    var: Var,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// AdamW whose state is paged between host and device
pub struct PagedAdamW {
    vars: Vec<VarState>,
    params: ParamsPagedAdamW,
    step_t: usize,
}

impl PagedAdamW {
    /// Build over every var in `var_map`, keyed by var name
    pub fn from_varmap(var_map: &VarMap, params: ParamsPagedAdamW) -> Result<Self> {
        let data = var_map
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;
        let mut named: Vec<(String, Var)> = data
            .iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self::with_names(named, params)?)
    }

    fn with_names(named: Vec<(String, Var)>, params: ParamsPagedAdamW) -> candle_core::Result<Self> {
        let mut vars = Vec::with_capacity(named.len());
        for (name, var) in named {
            let state_device = if params.paged { Device::Cpu } else { var.device().clone() };
            let exp_avg = Tensor::zeros(var.shape(), DType::F32, &state_device)?;
            let exp_avg_sq = Tensor::zeros(var.shape(), DType::F32, &state_device)?;
            vars.push(VarState {
                name,
                var,
                exp_avg,
                exp_avg_sq,
            });
        }
        Ok(Self {
            vars,
            params,
            step_t: 0,
        })
    }

    pub fn params(&self) -> &ParamsPagedAdamW {
        &self.params
    }

    /// Completed update steps
    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// Tensors of the trainable vars
    pub fn var_tensors(&self) -> Vec<Tensor> {
        self.vars.iter().map(|s| s.var.as_tensor().clone()).collect()
    }

    /// One update with every gradient multiplied by `grad_scale`
    pub fn step_scaled(&mut self, grads: &GradStore, grad_scale: f64) -> candle_core::Result<()> {
        self.step_t += 1;
        let ParamsPagedAdamW {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            paged,
        } = self.params;
        let bias_correction1 = 1.0 - beta1.powi(self.step_t as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step_t as i32);

        for state in self.vars.iter_mut() {
            let theta = &state.var;
            let Some(grad) = grads.get(theta.as_tensor()) else {
                continue;
            };
            let device = theta.device();
            let grad = (grad.to_dtype(DType::F32)? * grad_scale)?;

            let exp_avg = state.exp_avg.to_device(device)?;
            let exp_avg_sq = state.exp_avg_sq.to_device(device)?;

            let exp_avg = ((exp_avg * beta1)? + (&grad * (1.0 - beta1))?)?;
            let exp_avg_sq = ((exp_avg_sq * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&exp_avg / bias_correction1)?;
            let v_hat = (&exp_avg_sq / bias_correction2)?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;

            let current = theta.as_tensor().to_dtype(DType::F32)?;
            let decayed = (current * (1.0 - lr * weight_decay))?;
            let next = (decayed - (update * lr)?)?;
            theta.set(&next.to_dtype(theta.dtype())?)?;

            if paged {
                state.exp_avg = exp_avg.to_device(&Device::Cpu)?;
                state.exp_avg_sq = exp_avg_sq.to_device(&Device::Cpu)?;
            } else {
                state.exp_avg = exp_avg;
                state.exp_avg_sq = exp_avg_sq;
            }
        }
        Ok(())
    }

    /// Clip the global gradient norm to `max_norm`, then update
    ///
    /// Returns the norm before clipping.
    pub fn step_with_clipping(&mut self, grads: &GradStore, max_norm: f64) -> Result<f64> {
        let norm = compute_grad_norm(grads, &self.var_tensors())?;
        let scale = if max_norm > 0.0 && norm > max_norm {
            max_norm / (norm + 1e-6)
        } else {
            1.0
        };
        self.step_scaled(grads, scale)?;
        Ok(norm)
    }

    /// Save moments as `{var}.exp_avg` / `{var}.exp_avg_sq` safetensors
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tensors = HashMap::new();
        for state in &self.vars {
            tensors.insert(format!("{}.exp_avg", state.name), state.exp_avg.clone());
            tensors.insert(format!("{}.exp_avg_sq", state.name), state.exp_avg_sq.clone());
        }
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to save optimizer state to {:?}", path))?;
        Ok(())
    }
}

impl Optimizer for PagedAdamW {
    type Config = ParamsPagedAdamW;

    fn new(vars: Vec<Var>, config: Self::Config) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .enumerate()
            .map(|(i, var)| (format!("param.{}", i), var))
            .collect();
        Self::with_names(named, config)
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_scaled(grads, 1.0)
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// Learning rate decay shape after warmup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Linear,
    Cosine,
    Constant,
}

impl std::str::FromStr for SchedulerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            "constant" => Ok(Self::Constant),
            _ => Err(anyhow::anyhow!(
                "Invalid scheduler: {}. Valid options: linear, cosine, constant",
                s
            )),
        }
    }
}

/// Learning rate scheduler
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    kind: SchedulerKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LearningRateScheduler {
    /// Create a scheduler with linear warmup followed by `kind` decay
    pub fn new(kind: SchedulerKind, base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Get the learning rate for the current step
    pub fn get_lr(&self) -> f64 {
        if self.current_step < self.warmup_steps {
            return self.base_lr * (self.current_step as f64 / self.warmup_steps as f64);
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        if decay_steps == 0 {
            return self.base_lr;
        }
        let progress = ((self.current_step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);

        match self.kind {
            SchedulerKind::Linear => self.base_lr * (1.0 - progress),
            SchedulerKind::Cosine => {
                self.base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
            }
            SchedulerKind::Constant => self.base_lr,
        }
    }

    /// Step the scheduler and return the new learning rate
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.get_lr()
    }

    /// Get current step
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

/// Compute gradient norm for a set of tensors
///
/// # Arguments
/// * `grads` - GradStore containing computed gradients
/// * `params` - Parameters to compute gradient norm for
///
/// # Returns
/// * Total L2 norm of all gradients
pub fn compute_grad_norm(grads: &GradStore, params: &[Tensor]) -> Result<f64> {
    let mut total_norm_sq: f64 = 0.0;

    for param in params {
        if let Some(grad) = grads.get(param) {
            let grad_norm_sq = grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f32>()?;
            total_norm_sq += grad_norm_sq as f64;
        }
    }

    Ok(total_norm_sq.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, VarBuilder};

    fn quadratic_setup(paged: bool) -> (VarMap, PagedAdamW) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(4, "w", Init::Const(1.0)).unwrap();
        let params = ParamsPagedAdamW {
            lr: 0.1,
            paged,
            ..Default::default()
        };
        let opt = PagedAdamW::from_varmap(&varmap, params).unwrap();
        (varmap, opt)
    }

    fn var(varmap: &VarMap, name: &str) -> Var {
        varmap.data().lock().unwrap().get(name).unwrap().clone()
    }

    #[test]
    fn test_optimizer_kind_parse() {
        assert_eq!("paged_adamw_8bit".parse::<OptimizerKind>().unwrap(), OptimizerKind::PagedAdamW);
        assert_eq!("adamw".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamW);
        assert!("sgd".parse::<OptimizerKind>().is_err());
    }

    #[test]
    fn test_minimizes_quadratic() {
        let (varmap, mut opt) = quadratic_setup(true);
        let w = var(&varmap, "w");

        for _ in 0..200 {
            let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            opt.step(&grads).unwrap();
        }

        assert_eq!(opt.step_count(), 200);
        let values: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.abs() < 0.25), "{:?}", values);
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        // Adam's first bias-corrected update is lr * sign(grad)
        let (varmap, mut opt) = quadratic_setup(false);
        let w = var(&varmap, "w");
        let loss = w.as_tensor().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();

        let values: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        for v in values {
            assert!((v - 0.9).abs() < 1e-5);
        }
    }

    #[test]
    fn test_clipping_reports_unclipped_norm() {
        let (varmap, mut opt) = quadratic_setup(true);
        let w = var(&varmap, "w");
        // grad = 2 * w = [2, 2, 2, 2], norm 4
        let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let norm = opt.step_with_clipping(&grads, 1.0).unwrap();
        assert!((norm - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_state_saved_per_var() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("optimizer.safetensors");

        let (varmap, mut opt) = quadratic_setup(true);
        let w = var(&varmap, "w");
        let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.step(&loss.backward().unwrap()).unwrap();
        opt.save(&path).unwrap();
        assert_eq!(opt.step_count(), 1);

        let saved = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        assert!(saved.contains_key("w.exp_avg"));
        assert!(saved.contains_key("w.exp_avg_sq"));
    }

    #[test]
    fn test_linear_scheduler() {
        let mut scheduler = LearningRateScheduler::new(SchedulerKind::Linear, 1e-4, 0, 100);
        assert!((scheduler.get_lr() - 1e-4).abs() < 1e-12);
        for _ in 0..50 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 0.5e-4).abs() < 1e-12);
        for _ in 0..150 {
            scheduler.step();
        }
        assert_eq!(scheduler.get_lr(), 0.0);
    }

    #[test]
    fn test_lr_scheduler_warmup() {
        let mut scheduler = LearningRateScheduler::new(SchedulerKind::Cosine, 1e-4, 10, 110);
        assert_eq!(scheduler.get_lr(), 0.0);
        for _ in 0..5 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 0.5e-4).abs() < 1e-12);
        for _ in 0..55 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 0.5e-4).abs() < 1e-10);
    }

    #[test]
    fn test_scheduler_without_decay_steps() {
        let scheduler = LearningRateScheduler::new(SchedulerKind::Linear, 1e-4, 0, 0);
        assert_eq!(scheduler.get_lr(), 1e-4);
    }
}
