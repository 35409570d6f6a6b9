use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, ModuleT, VarBuilder};

/// A stack of (conv2d -> batchnorm -> relu) blocks over a single-channel
/// 2-d interaction map.
pub struct ConvBnStack {
    conv_layers: Vec<Conv2d>,
    norm_layers: Vec<BatchNorm>,
}

impl ConvBnStack {
    pub fn new() -> Self {
        Self {
            conv_layers: Vec::new(),
            norm_layers: Vec::new(),
        }
    }

    /// Appends a block after all the current blocks.
    pub fn push(&mut self, conv: Conv2d, norm: BatchNorm) {
        self.conv_layers.push(conv);
        self.norm_layers.push(norm);
    }

    pub fn num_blocks(&self) -> usize {
        self.conv_layers.len()
    }
}

impl Default for ConvBnStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleT for ConvBnStack {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for (conv, norm) in self.conv_layers.iter().zip(self.norm_layers.iter()) {
            x = conv.forward_t(&x, train)?;
            x = norm.forward_t(&x, train)?;
            x = x.relu()?;
        }
        Ok(x)
    }
}

/// Build `depth` blocks of (3x3 conv -> batchnorm -> relu), starting from
/// one input channel. Each block shrinks each spatial side by two.
pub fn conv_bn_stack(
    num_filters: usize,
    kernel_size: usize,
    depth: usize,
    vb: VarBuilder,
) -> Result<ConvBnStack> {
    let mut stack = ConvBnStack::new();
    let mut in_channels = 1;
    for b in 0..depth {
        let conv = candle_nn::conv2d(
            in_channels,
            num_filters,
            kernel_size,
            Conv2dConfig::default(),
            vb.pp(format!("conv.{}", b)),
        )?;
        let norm = candle_nn::batch_norm(
            num_filters,
            BatchNormConfig::default(),
            vb.pp(format!("norm.{}", b)),
        )?;
        stack.push(conv, norm);
        in_channels = num_filters;
    }
    Ok(stack)
}
