use std::fmt;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use model::{Layout, ModelConfig};

/// Immutable hyperparameter bundle for a training session. `Default`
/// supplies the CIFAR-10 reversible-classifier recipe; a TOML or JSON file
/// can override any section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub data: DataSection,
    #[serde(default)]
    pub optimizer: OptimizerSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub num_classes: usize,
    /// `(channels, height, width)` of a single example.
    pub input_shape: [usize; 3],
    pub filters: Vec<usize>,
    pub blocks: Vec<usize>,
    pub strides: Vec<usize>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            num_classes: 10,
            input_shape: [3, 32, 32],
            filters: vec![32, 64, 112],
            blocks: vec![3, 3, 3],
            strides: vec![1, 2, 2],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    pub batch_size: usize,
    pub eval_batch_size: usize,
    pub epochs: usize,
    pub shuffle: bool,
    pub augment: bool,
    pub layout: DataLayout,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            batch_size: 128,
            eval_batch_size: 1000,
            epochs: 160,
            shuffle: true,
            augment: true,
            layout: DataLayout::ChannelsFirst,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSection {
    /// Learning rate values of the piecewise-constant schedule; one more
    /// entry than `decay_boundaries`.
    pub learning_rates: Vec<f64>,
    /// Global-step breakpoints at which the learning rate drops.
    pub decay_boundaries: Vec<usize>,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            learning_rates: vec![0.1, 0.01, 0.001],
            decay_boundaries: vec![40_000, 60_000],
            momentum: 0.9,
            weight_decay: 2e-4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub seed: u64,
    pub precision: Precision,
    pub log_every: usize,
    pub save_every: usize,
    pub warmup_steps: usize,
    /// Oldest checkpoints beyond this count are pruned; `None` keeps all.
    pub max_checkpoints: Option<usize>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            seed: 42,
            precision: Precision::Fp32,
            log_every: 500,
            save_every: 500,
            warmup_steps: 1,
            max_checkpoints: Some(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn to_dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLayout {
    ChannelsFirst,
    ChannelsLast,
}

impl DataLayout {
    pub fn to_model_layout(self) -> Layout {
        match self {
            DataLayout::ChannelsFirst => Layout::ChannelsFirst,
            DataLayout::ChannelsLast => Layout::ChannelsLast,
        }
    }
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.num_classes == 0 {
            errors.push("model.num_classes must be greater than 0".to_string());
        }

        if self.model.input_shape.iter().any(|&dim| dim == 0) {
            errors.push("model.input_shape dimensions must be greater than 0".to_string());
        }

        if self.model.filters.is_empty()
            || self.model.filters.len() != self.model.blocks.len()
            || self.model.filters.len() != self.model.strides.len()
        {
            errors.push(
                "model.filters, model.blocks and model.strides must be non-empty and of equal length"
                    .to_string(),
            );
        }

        if self.model.filters.iter().any(|&width| width % 2 != 0) {
            errors.push("model.filters entries must be even".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.eval_batch_size == 0 {
            errors.push("data.eval_batch_size must be greater than 0".to_string());
        }

        if self.data.epochs == 0 {
            errors.push("data.epochs must be greater than 0".to_string());
        }

        if self.optimizer.learning_rates.len() != self.optimizer.decay_boundaries.len() + 1 {
            errors.push(
                "optimizer.learning_rates must have exactly one more entry than optimizer.decay_boundaries"
                    .to_string(),
            );
        }

        if self.optimizer.learning_rates.iter().any(|&lr| lr <= 0.0) {
            errors.push("optimizer.learning_rates entries must be greater than 0".to_string());
        }

        if !self
            .optimizer
            .decay_boundaries
            .windows(2)
            .all(|pair| pair[0] < pair[1])
        {
            errors.push("optimizer.decay_boundaries must be strictly increasing".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if self.runtime.log_every == 0 {
            errors.push("runtime.log_every must be greater than 0".to_string());
        }

        if self.runtime.save_every == 0 {
            errors.push("runtime.save_every must be greater than 0".to_string());
        }

        if self.runtime.max_checkpoints == Some(0) {
            errors.push("runtime.max_checkpoints must be greater than 0 when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    pub fn to_model_config(&self, device: Device) -> ModelConfig {
        let [c, h, w] = self.model.input_shape;
        ModelConfig {
            num_classes: self.model.num_classes,
            input_shape: (c, h, w),
            layout: self.data.layout.to_model_layout(),
            filters: self.model.filters.clone(),
            blocks: self.model.blocks.clone(),
            strides: self.model.strides.clone(),
            dtype: self.runtime.precision.to_dtype(),
            device,
        }
    }
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) => None,
            TrainingError::Validation(_) => None,
            TrainingError::Initialization(_) | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
