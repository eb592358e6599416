pub mod blocks;
pub mod config;
pub mod model;

pub use blocks::{Downsample, ResidualInner, ReversibleBlock};
pub use config::{Layout, ModelConfig};
pub use model::RevNet;
