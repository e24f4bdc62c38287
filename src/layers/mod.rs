/// Convolutional building blocks for the depth networks
///
/// - DoubleConv: two 3×3 conv + ReLU stages with optional dropout
/// - DepthHead: 1×1 projection to a single non-negative depth channel

pub mod conv;

pub use conv::{DepthHead, DoubleConv};
