use candle_core::{backprop::GradStore, DType, Error, Result, Tensor, Var, D};
use candle_nn::{conv2d, linear, loss, Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};

use crate::blocks::{Downsample, ReversibleBlock};
use crate::config::{Layout, ModelConfig};

struct Group {
    transition: Option<Downsample>,
    blocks: Vec<ReversibleBlock>,
}

/// Reversible residual classifier: a stem convolution, groups of additive
/// coupling blocks separated by strided transitions, global average pooling
/// and a linear head.
///
/// Gradients can be taken two ways. `forward` + `compute_loss` +
/// `Tensor::backward` is the plain autodiff route and retains every
/// activation. `compute_gradients` instead detaches the graph at block
/// boundaries during the forward pass and reconstructs block inputs through
/// the inverse coupling on the way back, keeping memory proportional to the
/// number of groups rather than the number of blocks. Both routes produce
/// the same parameter gradients up to floating point error.
pub struct RevNet {
    config: ModelConfig,
    varmap: VarMap,
    params: Vec<(String, Var)>,
    stem: Conv2d,
    groups: Vec<Group>,
    classifier: Linear,
}

impl RevNet {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let stem_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let (in_channels, _, _) = config.input_shape;
        let stem = conv2d(in_channels, config.filters[0], 3, stem_cfg, vb.pp("stem"))?;

        let mut groups = Vec::with_capacity(config.filters.len());
        let mut width = config.filters[0];
        for (index, ((&out_width, &depth), &stride)) in config
            .filters
            .iter()
            .zip(config.blocks.iter())
            .zip(config.strides.iter())
            .enumerate()
        {
            let vb_group = vb.pp(format!("group{index}"));
            let transition = if index == 0 && width == out_width && stride == 1 {
                None
            } else {
                Some(Downsample::new(width, out_width, stride, vb_group.pp("down"))?)
            };
            let mut blocks = Vec::with_capacity(depth);
            for block_index in 0..depth {
                blocks.push(ReversibleBlock::new(
                    out_width,
                    vb_group.pp(format!("block{block_index}")),
                )?);
            }
            groups.push(Group { transition, blocks });
            width = out_width;
        }

        let classifier = linear(width, config.num_classes, vb.pp("classifier"))?;

        let mut params: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            config,
            varmap,
            params,
            stem,
            groups,
            classifier,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Named trainable parameters in a stable (sorted) order.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        self.params.clone()
    }

    fn stem_forward(&self, images: &Tensor) -> Result<Tensor> {
        let images = match self.config.layout {
            Layout::ChannelsFirst => images.clone(),
            Layout::ChannelsLast => images.permute((0, 3, 1, 2))?.contiguous()?,
        };
        self.stem.forward(&images)?.relu()
    }

    fn head_forward(&self, features: &Tensor) -> Result<Tensor> {
        let pooled = features.mean(D::Minus1)?.mean(D::Minus1)?;
        self.classifier.forward(&pooled)
    }

    /// Full forward pass producing logits of shape `(batch, num_classes)`.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let mut hidden = self.stem_forward(images)?;
        for group in &self.groups {
            if let Some(transition) = &group.transition {
                hidden = transition.forward(&hidden)?;
            }
            for block in &group.blocks {
                hidden = block.forward(&hidden)?;
            }
        }
        self.head_forward(&hidden)
    }

    /// Mean cross entropy between logits and `u32` class labels.
    pub fn compute_loss(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let logits = logits.to_dtype(DType::F32)?;
        let labels = if labels.dtype() == DType::U32 {
            labels.clone()
        } else {
            labels.to_dtype(DType::U32)?
        };
        loss::cross_entropy(&logits, &labels)
    }

    /// Memory-saving gradient computation. Runs the forward pass with the
    /// graph cut at every block boundary, differentiates the classifier head
    /// on the detached trunk output, then walks the groups backwards:
    /// each block input is reconstructed through `inverse`, the block is
    /// re-run on it, and a vector-Jacobian product against the incoming
    /// output gradient yields both the parameter gradients and the gradient
    /// to pass further upstream. Returns the merged gradient store and the
    /// scalar loss.
    pub fn compute_gradients(&self, images: &Tensor, labels: &Tensor) -> Result<(GradStore, Tensor)> {
        // Forward, keeping only the transition inputs as saved activations.
        let mut hidden = self.stem_forward(images)?.detach();
        let mut transition_inputs: Vec<Option<Tensor>> = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            if let Some(transition) = &group.transition {
                transition_inputs.push(Some(hidden.clone()));
                hidden = transition.forward(&hidden)?.detach();
            } else {
                transition_inputs.push(None);
            }
            for block in &group.blocks {
                hidden = block.forward(&hidden)?.detach();
            }
        }

        // Head gradients seed both the parameter store and the backward
        // signal flowing into the trunk.
        let trunk = Var::from_tensor(&hidden)?;
        let logits = self.head_forward(trunk.as_tensor())?;
        let loss = self.compute_loss(&logits, labels)?;
        let mut grads = loss.backward()?;
        let mut upstream = grads
            .remove(trunk.as_tensor())
            .ok_or_else(|| Error::Msg("no gradient reached the trunk output".into()))?
            .contiguous()?;

        // Reverse pass over groups and blocks.
        let mut output = hidden;
        for (group, transition_input) in self.groups.iter().zip(transition_inputs.iter()).rev() {
            for block in group.blocks.iter().rev() {
                let input = block.inverse(&output)?.detach();
                let input_var = Var::from_tensor(&input)?;
                let recomputed = block.forward(input_var.as_tensor())?;
                let mut local = Self::vjp(&recomputed, &upstream)?;
                upstream = local
                    .remove(input_var.as_tensor())
                    .ok_or_else(|| Error::Msg("no gradient reached a block input".into()))?
                    .contiguous()?;
                self.merge_gradients(&mut grads, &mut local)?;
                output = input;
            }
            if let (Some(transition), Some(saved)) = (&group.transition, transition_input.as_ref()) {
                let input_var = Var::from_tensor(saved)?;
                let recomputed = transition.forward(input_var.as_tensor())?;
                let mut local = Self::vjp(&recomputed, &upstream)?;
                upstream = local
                    .remove(input_var.as_tensor())
                    .ok_or_else(|| Error::Msg("no gradient reached a transition input".into()))?
                    .contiguous()?;
                self.merge_gradients(&mut grads, &mut local)?;
                output = saved.clone();
            }
        }

        // Stem parameters, differentiated against the original images.
        let stem_out = self.stem_forward(images)?;
        let mut local = Self::vjp(&stem_out, &upstream)?;
        self.merge_gradients(&mut grads, &mut local)?;

        Ok((grads, loss))
    }

    /// Vector-Jacobian product: gradients of `sum(output * cotangent)` with
    /// respect to everything `output` depends on. Both sides are forced
    /// contiguous; strided operands feed the conv backward kernels
    /// otherwise and corrupt the weight gradients.
    fn vjp(output: &Tensor, cotangent: &Tensor) -> Result<GradStore> {
        let surrogate = (&output.contiguous()? * &cotangent.contiguous()?)?.sum_all()?;
        surrogate.backward()
    }

    fn merge_gradients(&self, into: &mut GradStore, from: &mut GradStore) -> Result<()> {
        for (_, var) in &self.params {
            if let Some(grad) = from.remove(var.as_tensor()) {
                let merged = match into.remove(var.as_tensor()) {
                    Some(existing) => (existing + grad)?,
                    None => grad,
                };
                into.insert(var.as_tensor(), merged);
            }
        }
        Ok(())
    }
}
