use burn::{
    nn::{
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
};
use serde::{Deserialize, Serialize};

/// The two residual block kinds of the ResNet family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockVariant {
    /// Two 3x3 convolutions.
    Standard,
    /// 1x1 reduce, 3x3, 1x1 expand.
    Bottleneck,
}

impl BlockVariant {
    /// Multiplier from a block's nominal width to its real output channel count.
    pub fn expansion(self) -> usize {
        match self {
            BlockVariant::Standard => 1,
            BlockVariant::Bottleneck => 4,
        }
    }
}

/// A pre-activation residual block of either variant.
#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    Standard(BasicBlock<B>),
    Bottleneck(Bottleneck<B>),
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (main, shortcut) = self.branches(x);

        if main.dims() != shortcut.dims() {
            panic!(
                "ResidualBlock: shape mismatch before add: main={:?}, shortcut={:?}",
                main.dims(),
                shortcut.dims(),
            );
        }

        main + shortcut
    }

    /// Main path and shortcut path, right before they are added together.
    pub fn branches(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        match self {
            ResidualBlock::Standard(block) => block.branches(x),
            ResidualBlock::Bottleneck(block) => block.branches(x),
        }
    }

    pub fn has_projection(&self) -> bool {
        match self {
            ResidualBlock::Standard(block) => block.shortcut.is_some(),
            ResidualBlock::Bottleneck(block) => block.shortcut.is_some(),
        }
    }

    pub fn variant(&self) -> BlockVariant {
        match self {
            ResidualBlock::Standard(_) => BlockVariant::Standard,
            ResidualBlock::Bottleneck(_) => BlockVariant::Bottleneck,
        }
    }

    pub fn expansion(&self) -> usize {
        self.variant().expansion()
    }
}

#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    bn1: BatchNorm<B, 2>,
    conv1: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    /// 1x1 projection, `None` when the shortcut is the identity.
    shortcut: Option<Conv2d<B>>,
    activation: Relu,
}

impl<B: Backend> BasicBlock<B> {
    fn branches(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let out = self.activation.forward(self.bn1.forward(x.clone()));
        // The projection reads the activated input, the identity reads the raw one.
        let shortcut = match &self.shortcut {
            Some(projection) => projection.forward(out.clone()),
            None => x,
        };

        let out = self.conv1.forward(out);
        let out = self.bn2.forward(out);
        let out = self.activation.forward(out);
        let out = self.conv2.forward(out);

        (out, shortcut)
    }
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    bn1: BatchNorm<B, 2>,
    conv1: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    shortcut: Option<Conv2d<B>>,
    activation: Relu,
}

impl<B: Backend> Bottleneck<B> {
    fn branches(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let out = self.activation.forward(self.bn1.forward(x.clone()));
        let shortcut = match &self.shortcut {
            Some(projection) => projection.forward(out.clone()),
            None => x,
        };

        let out = self.conv1.forward(out);
        let out = self.activation.forward(self.bn2.forward(out));
        let out = self.conv2.forward(out);
        let out = self.activation.forward(self.bn3.forward(out));
        let out = self.conv3.forward(out);

        (out, shortcut)
    }
}

#[derive(Config, Debug)]
pub struct ResidualBlockConfig {
    pub variant: BlockVariant,
    /// Channels of the incoming feature map.
    pub in_channels: usize,
    /// Nominal width, before expansion.
    pub channels: usize,
    #[config(default = 1)]
    pub stride: usize,
}

impl ResidualBlockConfig {
    pub fn out_channels(&self) -> usize {
        self.channels * self.variant.expansion()
    }

    /// A learned shortcut is needed whenever the identity would not match the output shape.
    pub fn needs_projection(&self) -> bool {
        self.stride != 1 || self.in_channels != self.out_channels()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResidualBlock<B> {
        let shortcut = self
            .needs_projection()
            .then(|| conv(self.in_channels, self.out_channels(), 1, self.stride, device));

        match self.variant {
            BlockVariant::Standard => ResidualBlock::Standard(BasicBlock {
                bn1: BatchNormConfig::new(self.in_channels).init(device),
                conv1: conv(self.in_channels, self.channels, 3, self.stride, device),
                bn2: BatchNormConfig::new(self.channels).init(device),
                conv2: conv(self.channels, self.channels, 3, 1, device),
                shortcut,
                activation: Relu::new(),
            }),
            BlockVariant::Bottleneck => ResidualBlock::Bottleneck(Bottleneck {
                bn1: BatchNormConfig::new(self.in_channels).init(device),
                conv1: conv(self.in_channels, self.channels, 1, 1, device),
                bn2: BatchNormConfig::new(self.channels).init(device),
                conv2: conv(self.channels, self.channels, 3, self.stride, device),
                bn3: BatchNormConfig::new(self.channels).init(device),
                conv3: conv(self.channels, self.out_channels(), 1, 1, device),
                shortcut,
                activation: Relu::new(),
            }),
        }
    }
}

/// Bias-free square convolution, padded so that only the stride changes the spatial size.
pub(crate) fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let padding = kernel / 2;
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn input(channels: usize, size: usize) -> Tensor<TestBackend, 4> {
        let device = Default::default();
        Tensor::random(
            [2, channels, size, size],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        )
    }

    fn block(
        variant: BlockVariant,
        in_channels: usize,
        channels: usize,
        stride: usize,
    ) -> ResidualBlock<TestBackend> {
        ResidualBlockConfig::new(variant, in_channels, channels)
            .with_stride(stride)
            .init(&Default::default())
    }

    #[test]
    fn standard_block_keeps_shape_without_stride() {
        let block = block(BlockVariant::Standard, 16, 16, 1);
        assert!(!block.has_projection());

        let output = block.forward(input(16, 8));
        assert_eq!(output.dims(), [2, 16, 8, 8]);
    }

    #[test]
    fn standard_block_halves_spatial_size_with_stride_two() {
        let block = block(BlockVariant::Standard, 16, 32, 2);
        assert!(block.has_projection());

        let output = block.forward(input(16, 8));
        assert_eq!(output.dims(), [2, 32, 4, 4]);
    }

    #[test]
    fn channel_change_alone_requires_projection() {
        let block = block(BlockVariant::Standard, 8, 16, 1);
        assert!(block.has_projection());

        let (main, shortcut) = block.branches(input(8, 6));
        assert_eq!(main.dims(), [2, 16, 6, 6]);
        assert_eq!(shortcut.dims(), main.dims());
    }

    #[test]
    fn bottleneck_expands_channels_four_times() {
        let block = block(BlockVariant::Bottleneck, 16, 16, 1);
        assert!(block.has_projection());

        let output = block.forward(input(16, 8));
        assert_eq!(output.dims(), [2, 64, 8, 8]);
    }

    #[test]
    fn bottleneck_identity_when_input_matches_expanded_width() {
        let block = block(BlockVariant::Bottleneck, 64, 16, 1);
        assert!(!block.has_projection());

        let x = input(64, 4);
        let (main, shortcut) = block.branches(x.clone());
        assert_eq!(main.dims(), [2, 64, 4, 4]);
        shortcut.into_data().assert_eq(&x.into_data(), true);
    }

    #[test]
    fn bottleneck_with_stride_projects_and_downsamples() {
        let block = block(BlockVariant::Bottleneck, 64, 32, 2);
        assert!(block.has_projection());

        let (main, shortcut) = block.branches(input(64, 8));
        assert_eq!(main.dims(), [2, 128, 4, 4]);
        assert_eq!(shortcut.dims(), [2, 128, 4, 4]);
    }

    #[test]
    #[should_panic(expected = "shape mismatch before add: main=[2, 8, 2, 2], shortcut=[2, 8, 4, 4]")]
    fn strided_block_without_projection_panics_with_both_shapes() {
        let mut block = block(BlockVariant::Standard, 8, 8, 2);
        if let ResidualBlock::Standard(inner) = &mut block {
            inner.shortcut = None;
        }

        block.forward(input(8, 4));
    }

    #[test]
    fn projection_rule_matches_config() {
        let cases = [
            (BlockVariant::Standard, 64, 64, 1, false),
            (BlockVariant::Standard, 64, 64, 2, true),
            (BlockVariant::Standard, 64, 128, 1, true),
            (BlockVariant::Bottleneck, 256, 64, 1, false),
            (BlockVariant::Bottleneck, 64, 64, 1, true),
        ];
        for (variant, in_channels, channels, stride, expected) in cases {
            let config =
                ResidualBlockConfig::new(variant, in_channels, channels).with_stride(stride);
            assert_eq!(config.needs_projection(), expected, "{config}");
        }
    }
}
