/// Depth estimation networks and the name → constructor registry
use std::sync::Arc;

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, ModuleT, VarBuilder};

use crate::config::ModelConfig;
use crate::layers::{DepthHead, DoubleConv};

/// Builds a model whose parameters are drawn from (or registered in) a VarBuilder
///
/// The trainer keeps the factory so it can rebuild the live model after a
/// device move and materialise the EMA model from shadow weights.
pub type ModelFactory = Arc<dyn Fn(VarBuilder) -> Result<Box<dyn ModuleT>> + Send + Sync>;

/// Keys accepted by [`model_factory`]
pub const MODEL_NAMES: [&str; 2] = ["tiny_unet", "pixel_linear"];

/// Wrap a constructor closure as a [`ModelFactory`]
pub fn boxed<F>(f: F) -> ModelFactory
where
    F: Fn(VarBuilder) -> Result<Box<dyn ModuleT>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Resolve a model configuration into a factory
///
/// Unknown names fail here, before any parameter is allocated.
pub fn model_factory(config: &ModelConfig) -> crate::Result<ModelFactory> {
    let in_channels = config.in_channels;
    let base = config.base_channels;
    let dropout = config.dropout;

    let factory: ModelFactory = match config.name.to_lowercase().as_str() {
        "tiny_unet" => boxed(move |vb| {
            let model = TinyUNet::new(in_channels, base, dropout, vb)?;
            Ok(Box::new(model) as Box<dyn ModuleT>)
        }),
        "pixel_linear" => boxed(move |vb| {
            let model = PixelLinear::new(in_channels, vb)?;
            Ok(Box::new(model) as Box<dyn ModuleT>)
        }),
        other => {
            return Err(crate::DepthError::Config(format!(
                "Invalid model name: {}. Must be one of {:?}",
                other, MODEL_NAMES
            )))
        }
    };
    Ok(factory)
}

/// Two-level U-Net: conv encoder, bottleneck, decoder with skip concatenation
///
/// Input `[batch, in_channels, H, W]`, output `[batch, 1, H, W]`.
pub struct TinyUNet {
    enc1: DoubleConv,
    enc2: DoubleConv,
    bottleneck: DoubleConv,
    dec2: DoubleConv,
    dec1: DoubleConv,
    head: DepthHead,
}

impl TinyUNet {
    pub fn new(in_channels: usize, base: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let enc1 = DoubleConv::new(in_channels, base, 0.0, vb.pp("enc1"))?;
        let enc2 = DoubleConv::new(base, base * 2, 0.0, vb.pp("enc2"))?;
        let bottleneck = DoubleConv::new(base * 2, base * 4, dropout, vb.pp("bottleneck"))?;
        let dec2 = DoubleConv::new(base * 4 + base * 2, base * 2, 0.0, vb.pp("dec2"))?;
        let dec1 = DoubleConv::new(base * 2 + base, base, 0.0, vb.pp("dec1"))?;
        let head = DepthHead::new(base, vb.pp("head"))?;

        Ok(Self {
            enc1,
            enc2,
            bottleneck,
            dec2,
            dec1,
            head,
        })
    }

    /// Upsample `xs` to the skip's spatial size and concatenate on channels
    fn merge(xs: &Tensor, skip: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = skip.dims4()?;
        let up = xs.upsample_nearest2d(h, w)?;
        Tensor::cat(&[&up, skip], 1)
    }
}

impl ModuleT for TinyUNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let x1 = self.enc1.forward_t(xs, train)?;
        let x2 = self.enc2.forward_t(&x1.max_pool2d(2)?, train)?;
        let x3 = self.bottleneck.forward_t(&x2.max_pool2d(2)?, train)?;

        let d2 = self.dec2.forward_t(&Self::merge(&x3, &x2)?, train)?;
        let d1 = self.dec1.forward_t(&Self::merge(&d2, &x1)?, train)?;
        self.head.forward(&d1)
    }
}

/// Per-pixel linear map from input channels to depth (a single 1×1 conv)
pub struct PixelLinear {
    proj: Conv2d,
}

impl PixelLinear {
    pub fn new(in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let proj = conv2d(in_channels, 1, 1, Conv2dConfig::default(), vb.pp("proj"))?;
        Ok(Self { proj })
    }
}

impl ModuleT for PixelLinear {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        self.proj.forward(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config(name: &str) -> ModelConfig {
        ModelConfig {
            name: name.to_string(),
            in_channels: 3,
            base_channels: 4,
            dropout: 0.0,
        }
    }

    #[test]
    fn test_unet_output_matches_input_resolution() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let factory = model_factory(&config("tiny_unet"))?;
        let model = factory(vb)?;

        // Odd sizes exercise the floor in max_pool2d
        let x = Tensor::randn(0f32, 1.0, (2, 3, 15, 10), &device)?;
        let y = model.forward_t(&x, false)?;
        assert_eq!(y.dims(), &[2, 1, 15, 10]);
        Ok(())
    }

    #[test]
    fn test_pixel_linear_parameters() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let factory = model_factory(&config("pixel_linear"))?;
        let model = factory(vb)?;

        let x = Tensor::ones((1, 3, 2, 2), DType::F32, &device)?;
        assert_eq!(model.forward_t(&x, true)?.dims(), &[1, 1, 2, 2]);
        // weight [1, 3, 1, 1] + bias [1]
        assert_eq!(crate::utils::count_varmap_parameters(&varmap), 4);
        Ok(())
    }

    #[test]
    fn test_unknown_model_fails_before_allocation() {
        let err = model_factory(&config("vgg_unet")).err();
        match err {
            Some(crate::DepthError::Config(msg)) => assert!(msg.contains("tiny_unet")),
            _ => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn test_rebuild_from_existing_varmap_shares_weights() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let factory = model_factory(&config("pixel_linear"))?;
        let a = factory(VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
        let b = factory(VarBuilder::from_varmap(&varmap, DType::F32, &device))?;

        let x = Tensor::randn(0f32, 1.0, (1, 3, 4, 4), &device)?;
        let diff = (a.forward_t(&x, false)? - b.forward_t(&x, false)?)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
