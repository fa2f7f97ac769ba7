use std::iter;

use burn::{
    nn::{
        Linear, LinearConfig,
        conv::Conv2d,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    },
    prelude::*,
};

use super::block::{BlockVariant, ResidualBlock, ResidualBlockConfig, conv};
use crate::error::BuildError;

/// Channel count produced by the stem and fed to the first group.
pub const STEM_CHANNELS: usize = 64;
/// Nominal width of each of the four groups.
pub const GROUP_CHANNELS: [usize; 4] = [64, 128, 256, 512];
/// Stride of the first block in each group.
pub const GROUP_STRIDES: [usize; 4] = [1, 2, 2, 2];

#[derive(Module, Debug)]
pub struct PreActResNet<B: Backend> {
    stem: Conv2d<B>,
    groups: Vec<ResidualGroup<B>>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

impl<B: Backend> PreActResNet<B> {
    /// `[batch, channels, height, width]` images to `[batch, classes]` logits.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward(x);
        let x = self
            .groups
            .iter()
            .fold(x, |x, group| group.forward(x));

        let x = self.avgpool.forward(x);
        let x = x.flatten::<2>(1, 3);

        self.fc.forward(x)
    }

    /// Sum of absolute stem and classifier weights. Changes whenever an optimizer step lands.
    pub fn checksum(&self) -> f64 {
        let stem = self.stem.weight.val().abs().sum();
        let fc = self.fc.weight.val().abs().sum();
        let bias = self
            .fc
            .bias
            .as_ref()
            .map(|bias| bias.val().abs().sum().into_scalar().elem::<f64>())
            .unwrap_or_default();

        stem.into_scalar().elem::<f64>() + fc.into_scalar().elem::<f64>() + bias
    }

    /// Channel count the stem convolution expects.
    pub fn input_channels(&self) -> usize {
        self.stem.weight.val().dims()[1]
    }

    /// Width of the classifier output.
    pub fn num_classes(&self) -> usize {
        self.fc.weight.val().dims()[1]
    }

    pub fn groups(&self) -> &[ResidualGroup<B>] {
        &self.groups
    }
}

/// Blocks of one group, applied in order.
#[derive(Module, Debug)]
pub struct ResidualGroup<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> ResidualGroup<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    pub fn blocks(&self) -> &[ResidualBlock<B>] {
        &self.blocks
    }
}

/// One of the four groups: how many blocks of which kind, how wide, and how the first one strides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSpec {
    pub variant: BlockVariant,
    pub blocks: usize,
    pub channels: usize,
    pub stride: usize,
}

impl GroupSpec {
    /// `[stride, 1, 1, ...]`, one entry per block.
    pub fn stride_pattern(&self) -> Vec<usize> {
        iter::once(self.stride)
            .chain(iter::repeat(1).take(self.blocks.saturating_sub(1)))
            .collect()
    }

    pub fn out_channels(&self) -> usize {
        self.channels * self.variant.expansion()
    }

    /// Builds the group and hands back the channel count the next group will receive.
    pub fn init<B: Backend>(
        &self,
        in_channels: usize,
        device: &B::Device,
    ) -> (ResidualGroup<B>, usize) {
        let (blocks, out_channels) = self.stride_pattern().into_iter().fold(
            (Vec::with_capacity(self.blocks), in_channels),
            |(mut blocks, in_channels), stride| {
                let config = ResidualBlockConfig::new(self.variant, in_channels, self.channels)
                    .with_stride(stride);
                blocks.push(config.init(device));
                (blocks, config.out_channels())
            },
        );

        (ResidualGroup { blocks }, out_channels)
    }
}

#[derive(Config, Debug)]
pub struct ResNetConfig {
    pub num_classes: usize,
    pub variant: BlockVariant,
    /// Blocks per group, exactly four entries.
    pub block_counts: Vec<usize>,
    #[config(default = 3)]
    pub input_channels: usize,
}

impl ResNetConfig {
    pub fn resnet18(num_classes: usize) -> Self {
        Self::new(num_classes, BlockVariant::Standard, vec![2, 2, 2, 2])
    }

    pub fn resnet34(num_classes: usize) -> Self {
        Self::new(num_classes, BlockVariant::Standard, vec![3, 4, 6, 3])
    }

    pub fn resnet50(num_classes: usize) -> Self {
        Self::new(num_classes, BlockVariant::Bottleneck, vec![3, 4, 6, 3])
    }

    pub fn resnet101(num_classes: usize) -> Self {
        Self::new(num_classes, BlockVariant::Bottleneck, vec![3, 4, 23, 3])
    }

    pub fn resnet152(num_classes: usize) -> Self {
        Self::new(num_classes, BlockVariant::Bottleneck, vec![3, 8, 36, 3])
    }

    /// Preset lookup by the conventional depth number.
    pub fn from_depth(depth: usize, num_classes: usize) -> Result<Self, BuildError> {
        match depth {
            18 => Ok(Self::resnet18(num_classes)),
            34 => Ok(Self::resnet34(num_classes)),
            50 => Ok(Self::resnet50(num_classes)),
            101 => Ok(Self::resnet101(num_classes)),
            152 => Ok(Self::resnet152(num_classes)),
            other => Err(BuildError::UnknownDepth(other)),
        }
    }

    pub fn groups(&self) -> Result<Vec<GroupSpec>, BuildError> {
        if self.num_classes == 0 {
            return Err(BuildError::NoClasses);
        }
        if self.input_channels == 0 {
            return Err(BuildError::NoInputChannels);
        }
        if self.block_counts.len() != GROUP_CHANNELS.len() {
            return Err(BuildError::GroupCount {
                expected: GROUP_CHANNELS.len(),
                found: self.block_counts.len(),
            });
        }

        self.block_counts
            .iter()
            .zip(GROUP_CHANNELS.iter().zip(GROUP_STRIDES))
            .enumerate()
            .map(|(group, (&blocks, (&channels, stride)))| {
                if blocks == 0 {
                    return Err(BuildError::EmptyGroup { group });
                }
                Ok(GroupSpec {
                    variant: self.variant,
                    blocks,
                    channels,
                    stride,
                })
            })
            .collect()
    }

    /// Width of the pooled feature vector fed to the classifier.
    pub fn feature_channels(&self) -> usize {
        GROUP_CHANNELS[GROUP_CHANNELS.len() - 1] * self.variant.expansion()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<PreActResNet<B>, BuildError> {
        let specs = self.groups()?;

        let (groups, channels) = specs.iter().fold(
            (Vec::with_capacity(specs.len()), STEM_CHANNELS),
            |(mut groups, in_channels), spec| {
                let (group, out_channels) = spec.init(in_channels, device);
                groups.push(group);
                (groups, out_channels)
            },
        );
        debug_assert_eq!(channels, self.feature_channels());

        Ok(PreActResNet {
            stem: conv(self.input_channels, STEM_CHANNELS, 3, 1, device),
            groups,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(channels, self.num_classes).init(device),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray;

    fn images(batch: usize) -> Tensor<TestBackend, 4> {
        Tensor::random(
            [batch, 3, 32, 32],
            Distribution::Normal(0.0, 1.0),
            &Default::default(),
        )
    }

    #[test]
    fn stride_pattern_starts_with_group_stride() {
        let spec = GroupSpec {
            variant: BlockVariant::Standard,
            blocks: 4,
            channels: 128,
            stride: 2,
        };
        assert_eq!(spec.stride_pattern(), vec![2, 1, 1, 1]);
    }

    #[test]
    fn groups_follow_canonical_widths_and_strides() {
        let groups = ResNetConfig::resnet50(10).groups().unwrap();
        let widths: Vec<_> = groups.iter().map(|g| g.out_channels()).collect();
        let strides: Vec<_> = groups.iter().map(|g| g.stride).collect();
        let counts: Vec<_> = groups.iter().map(|g| g.blocks).collect();

        assert_eq!(widths, vec![256, 512, 1024, 2048]);
        assert_eq!(strides, vec![1, 2, 2, 2]);
        assert_eq!(counts, vec![3, 4, 6, 3]);
    }

    #[test]
    fn block_count_length_other_than_four_fails() {
        let device = Default::default();
        for counts in [vec![], vec![2, 2, 2], vec![2, 2, 2, 2, 2]] {
            let found = counts.len();
            let config = ResNetConfig::new(10, BlockVariant::Standard, counts);
            let err = config.init::<TestBackend>(&device).unwrap_err();
            assert_eq!(err, BuildError::GroupCount { expected: 4, found });
        }
    }

    #[test]
    fn zero_blocks_in_a_group_fails() {
        let config = ResNetConfig::new(10, BlockVariant::Standard, vec![2, 0, 2, 2]);
        assert_eq!(
            config.groups().unwrap_err(),
            BuildError::EmptyGroup { group: 1 }
        );
    }

    #[test]
    fn unknown_depth_is_rejected() {
        assert_eq!(
            ResNetConfig::from_depth(20, 10).unwrap_err(),
            BuildError::UnknownDepth(20)
        );
    }

    #[test]
    fn presets_match_table() {
        let table = [
            (18, BlockVariant::Standard, vec![2, 2, 2, 2]),
            (34, BlockVariant::Standard, vec![3, 4, 6, 3]),
            (50, BlockVariant::Bottleneck, vec![3, 4, 6, 3]),
            (101, BlockVariant::Bottleneck, vec![3, 4, 23, 3]),
            (152, BlockVariant::Bottleneck, vec![3, 8, 36, 3]),
        ];
        for (depth, variant, counts) in table {
            let config = ResNetConfig::from_depth(depth, 10).unwrap();
            assert_eq!(config.variant, variant);
            assert_eq!(config.block_counts, counts);
        }
    }

    #[test]
    fn first_block_of_each_group_carries_the_projection() {
        let device = Default::default();
        let model = ResNetConfig::resnet18(10)
            .init::<TestBackend>(&device)
            .unwrap();

        let projections: Vec<Vec<bool>> = model
            .groups()
            .iter()
            .map(|group| group.blocks().iter().map(|b| b.has_projection()).collect())
            .collect();
        // 64 -> 64 at stride 1 needs none, every later group changes width and strides.
        assert_eq!(
            projections,
            vec![
                vec![false, false],
                vec![true, false],
                vec![true, false],
                vec![true, false],
            ]
        );
    }

    #[test]
    fn every_preset_classifies_cifar_sized_batches() {
        let device = Default::default();
        for depth in [18, 34, 50, 101, 152] {
            let model = ResNetConfig::from_depth(depth, 10)
                .unwrap()
                .init::<TestBackend>(&device)
                .unwrap();
            let output = model.forward(images(2));
            assert_eq!(output.dims(), [2, 10], "resnet{depth}");
        }
    }

    #[test]
    fn single_channel_inputs_are_supported() {
        let device = Default::default();
        let model = ResNetConfig::resnet18(10)
            .with_input_channels(1)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([3, 1, 28, 28], &device);
        assert_eq!(model.forward(x).dims(), [3, 10]);
        assert_eq!(model.input_channels(), 1);
        assert_eq!(model.num_classes(), 10);
    }
}
