mod block;
mod resnet;

pub use block::{BasicBlock, BlockVariant, Bottleneck, ResidualBlock, ResidualBlockConfig};
pub use resnet::{
    GROUP_CHANNELS, GROUP_STRIDES, GroupSpec, PreActResNet, ResNetConfig, ResidualGroup,
    STEM_CHANNELS,
};
