//! Pre-activation residual networks for small-image classification, built and trained with burn.
//!
//! * [`model`] - residual blocks and the network assembler with the 18/34/50/101/152 presets.
//! * [`train`] - train and evaluate passes, plus the run driver that ties them to data loaders.
//! * [`metrics`] - per-pass loss and accuracy accumulation.
//! * [`data`] - datasets and the batcher that feeds the passes.
//! * [`device`] - picks a wgpu adapter when one answers, the CPU otherwise.

pub mod data;
pub mod device;
pub mod error;
pub mod metrics;
pub mod model;
pub mod train;

pub use error::{BuildError, DataError, TrainError};
pub use model::{BlockVariant, PreActResNet, ResNetConfig};
pub use train::{TrainingConfig, evaluate_epoch, run, train_epoch};
