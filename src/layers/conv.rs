/// Convolution blocks shared by the encoder-decoder models
use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Dropout, ModuleT, VarBuilder};

/// Two `3×3 conv → ReLU` stages, spatial size preserved
pub struct DoubleConv {
    conv1: Conv2d,
    conv2: Conv2d,
    dropout: Option<Dropout>,
}

impl DoubleConv {
    /// Create new block
    ///
    /// # Arguments
    /// * `in_channels` - Input channels
    /// * `out_channels` - Output channels of both convolutions
    /// * `dropout` - Drop probability applied after the block in training mode
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(in_channels: usize, out_channels: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(in_channels, out_channels, 3, cfg, vb.pp("conv1"))?;
        let conv2 = conv2d(out_channels, out_channels, 3, cfg, vb.pp("conv2"))?;
        let dropout = (dropout > 0.0).then(|| Dropout::new(dropout));
        Ok(Self {
            conv1,
            conv2,
            dropout,
        })
    }
}

impl ModuleT for DoubleConv {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv1.forward(xs)?.relu()?;
        let xs = self.conv2.forward(&xs)?.relu()?;
        match &self.dropout {
            Some(dropout) => dropout.forward_t(&xs, train),
            None => Ok(xs),
        }
    }
}

/// `1×1 conv → ReLU` projection to one depth channel
pub struct DepthHead {
    proj: Conv2d,
}

impl DepthHead {
    pub fn new(in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let proj = conv2d(in_channels, 1, 1, Conv2dConfig::default(), vb.pp("proj"))?;
        Ok(Self { proj })
    }
}

impl Module for DepthHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.proj.forward(xs)?.relu()
    }
}
