use candle_core::{DType, Device, Error, Result};

/// Memory layout of image batches handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `(batch, channels, height, width)`, the native candle conv layout.
    ChannelsFirst,
    /// `(batch, height, width, channels)`; transposed on entry.
    ChannelsLast,
}

/// Architecture hyperparameters for the reversible residual classifier.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub num_classes: usize,
    /// Input shape as `(channels, height, width)`, independent of `layout`.
    pub input_shape: (usize, usize, usize),
    pub layout: Layout,
    /// Channel width of each block group. Must be even because the coupling
    /// splits the channel dimension in half.
    pub filters: Vec<usize>,
    /// Number of reversible blocks per group.
    pub blocks: Vec<usize>,
    /// Stride applied by each group's downsample transition; the first group
    /// follows the stem directly and must use stride 1.
    pub strides: Vec<usize>,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    /// The CIFAR-10 bundle: three groups of three blocks at widths 32/64/112.
    pub fn cifar10(device: Device) -> Self {
        Self {
            num_classes: 10,
            input_shape: (3, 32, 32),
            layout: Layout::ChannelsFirst,
            filters: vec![32, 64, 112],
            blocks: vec![3, 3, 3],
            strides: vec![1, 2, 2],
            dtype: DType::F32,
            device,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Msg("model requires at least one class".into()));
        }
        let (c, h, w) = self.input_shape;
        if c == 0 || h == 0 || w == 0 {
            return Err(Error::Msg(format!(
                "input shape ({c}, {h}, {w}) must have non-zero dimensions"
            )));
        }
        if self.filters.is_empty()
            || self.filters.len() != self.blocks.len()
            || self.filters.len() != self.strides.len()
        {
            return Err(Error::Msg(format!(
                "filters/blocks/strides must be non-empty and of equal length (got {}/{}/{})",
                self.filters.len(),
                self.blocks.len(),
                self.strides.len()
            )));
        }
        for &width in &self.filters {
            if width == 0 || width % 2 != 0 {
                return Err(Error::Msg(format!(
                    "group width {width} must be even for channel coupling"
                )));
            }
        }
        if self.strides[0] != 1 {
            return Err(Error::Msg(
                "the first group follows the stem and must use stride 1".into(),
            ));
        }
        if self.strides.iter().any(|&s| s == 0) {
            return Err(Error::Msg("group strides must be non-zero".into()));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "model dtype {:?} must be floating point",
                self.dtype
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cifar10_bundle_is_valid() {
        let config = ModelConfig::cifar10(Device::Cpu);
        assert!(config.validate().is_ok());
        assert_eq!(config.filters, vec![32, 64, 112]);
        assert_eq!(config.num_classes, 10);
    }

    #[test]
    fn odd_group_width_is_rejected() {
        let mut config = ModelConfig::cifar10(Device::Cpu);
        config.filters[1] = 63;
        assert!(config.validate().is_err());
    }

    #[test]
    fn strided_first_group_is_rejected() {
        let mut config = ModelConfig::cifar10(Device::Cpu);
        config.strides[0] = 2;
        assert!(config.validate().is_err());
    }
}
