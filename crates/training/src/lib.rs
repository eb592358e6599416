pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use config::{DataLayout, Precision, TrainingConfig, TrainingError};
pub use data::{Batch, BlockingDataLoader, DataLoader, DatasetOptions, RecordDataset, RecordLoader};
pub use logging::{format_metrics_line, EvaluationReport, Logger, LoggingSettings};
pub use metrics::{EvaluationMetrics, EvaluationSummary, Mean};
pub use optimizer::{MomentumSgd, OptimizerState, ParameterState};
pub use scheduler::PiecewiseConstant;
pub use trainer::{SessionOptions, Trainer};
