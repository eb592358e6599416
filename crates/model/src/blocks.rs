use candle_core::{Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};

/// Residual function applied to one half of a coupling:
/// conv3x3 -> relu -> conv3x3, width preserving.
#[derive(Debug, Clone)]
pub struct ResidualInner {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl ResidualInner {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(channels, channels, 3, cfg, vb.pp("conv1"))?;
        let conv2 = conv2d(channels, channels, 3, cfg, vb.pp("conv2"))?;
        Ok(Self { conv1, conv2 })
    }
}

impl Module for ResidualInner {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv2.forward(&self.conv1.forward(xs)?.relu()?)
    }
}

/// Additive coupling block. With inputs split along channels into
/// `(x1, x2)`:
///
///   y1 = x1 + F(x2)
///   y2 = x2 + G(y1)
///
/// The mapping is exactly invertible, so activations do not need to be
/// stored during the forward pass; `inverse` recovers the input from the
/// output alone.
#[derive(Debug, Clone)]
pub struct ReversibleBlock {
    f: ResidualInner,
    g: ResidualInner,
}

impl ReversibleBlock {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let half = channels / 2;
        let f = ResidualInner::new(half, vb.pp("f"))?;
        let g = ResidualInner::new(half, vb.pp("g"))?;
        Ok(Self { f, g })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // chunk yields strided views; conv kernels require contiguous input.
        let parts = xs.chunk(2, 1)?;
        let (x1, x2) = (parts[0].contiguous()?, parts[1].contiguous()?);
        let f_x2 = self.f.forward(&x2)?;
        let y1 = (&x1 + &f_x2)?;
        let g_y1 = self.g.forward(&y1)?;
        let y2 = (&x2 + &g_y1)?;
        Tensor::cat(&[&y1, &y2], 1)
    }

    /// Reconstructs the block input from its output.
    pub fn inverse(&self, ys: &Tensor) -> Result<Tensor> {
        let parts = ys.chunk(2, 1)?;
        let (y1, y2) = (parts[0].contiguous()?, parts[1].contiguous()?);
        let g_y1 = self.g.forward(&y1)?;
        let x2 = (&y2 - &g_y1)?;
        let f_x2 = self.f.forward(&x2)?;
        let x1 = (&y1 - &f_x2)?;
        Tensor::cat(&[&x1, &x2], 1)
    }
}

/// Strided transition between groups: conv3x3 -> relu. Changes the channel
/// width and spatial resolution; not invertible, so its input activation is
/// the one thing a group keeps around for the reconstruction pass.
#[derive(Debug, Clone)]
pub struct Downsample {
    conv: Conv2d,
}

impl Downsample {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };
        let conv = conv2d(in_channels, out_channels, 3, cfg, vb.pp("conv"))?;
        Ok(Self { conv })
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)?.relu()
    }
}
