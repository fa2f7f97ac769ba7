use std::{fs, path::Path};

use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    data::{DataSource, ImageBatch},
    error::TrainError,
    metrics::{EpochSummary, RunningMetrics},
    model::{PreActResNet, ResNetConfig},
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ResNetConfig,
    pub optimizer: AdamConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 128)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
}

impl TrainingConfig {
    /// Reads a config previously written next to a run's artifacts.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        let path = path.as_ref();
        Self::load(path).map_err(|err| TrainError::Config(format!("{}: {err:?}", path.display())))
    }
}

/// Loss, batch size and correct count of one forward pass.
struct BatchOutput<B: Backend> {
    loss: Tensor<B, 1>,
    batch_size: usize,
    correct: u64,
}

fn forward_batch<B: Backend>(
    model: &PreActResNet<B>,
    batch: ImageBatch<B>,
) -> Result<BatchOutput<B>, TrainError> {
    batch.validate(model.input_channels(), model.num_classes())?;
    let batch_size = batch.len();

    let output = model.forward(batch.images);
    let predicted = output.clone().argmax(1);
    let correct = predicted
        .equal(batch.targets.clone().reshape([batch_size, 1]))
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as u64;

    let loss = CrossEntropyLossConfig::new()
        .init(&output.device())
        .forward(output, batch.targets);

    Ok(BatchOutput {
        loss,
        batch_size,
        correct,
    })
}

/// One pass of parameter updates over `batches`.
///
/// The model is moved in and handed back updated, so a model/optimizer pair can only be in
/// one pass at a time. burn builds fresh gradients on every backward call, there is no
/// gradient buffer to clear between steps.
pub fn train_epoch<B, O, I>(
    mut model: PreActResNet<B>,
    optimizer: &mut O,
    learning_rate: f64,
    batches: I,
) -> Result<(PreActResNet<B>, EpochSummary), TrainError>
where
    B: AutodiffBackend,
    O: Optimizer<PreActResNet<B>, B>,
    I: IntoIterator<Item = ImageBatch<B>>,
{
    let mut metrics = RunningMetrics::new();

    for (iteration, batch) in batches.into_iter().enumerate() {
        let output = forward_batch(&model, batch)?;
        let loss = output.loss.clone().into_scalar().elem::<f64>();

        let grads = output.loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optimizer.step(learning_rate, model, grads);

        metrics.update(loss, output.batch_size, output.correct);
        debug!("[train] iteration {iteration}: loss {loss:.4}");
    }

    Ok((model, metrics.finalize()?))
}

/// Loss and accuracy of `model` over `batches`, without touching its parameters.
///
/// Pass `model.valid()` to evaluate with batch normalization running statistics.
pub fn evaluate_epoch<B, I>(model: &PreActResNet<B>, batches: I) -> Result<EpochSummary, TrainError>
where
    B: Backend,
    I: IntoIterator<Item = ImageBatch<B>>,
{
    let mut metrics = RunningMetrics::new();

    for batch in batches {
        let output = forward_batch(model, batch)?;
        let loss = output.loss.into_scalar().elem::<f64>();
        metrics.update(loss, output.batch_size, output.correct);
    }

    Ok(metrics.finalize()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: EpochSummary,
    pub valid: EpochSummary,
}

/// Per-epoch results of a run, in order. Saved as JSON for plotting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochRecord>,
}

impl History {
    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn valid_accuracies(&self) -> Vec<f64> {
        self.epochs.iter().map(|record| record.valid.accuracy).collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TrainError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

pub fn run<B: AutodiffBackend>(
    artifact_dir: &str,
    mut config: TrainingConfig,
    source: &DataSource,
    device: B::Device,
) -> Result<History, TrainError> {
    fs::create_dir_all(artifact_dir)?;
    let splits = source.load()?;

    if config.model.num_classes != splits.num_classes {
        warn!(
            "model configured for {} classes, dataset has {}, using the dataset's",
            config.model.num_classes, splits.num_classes
        );
        config.model.num_classes = splits.num_classes;
    }
    config.model.input_channels = splits.shape.channels;
    config.save(format!("{artifact_dir}/config.json"))?;

    B::seed(config.seed);

    let mut model = config.model.init::<B>(&device)?;
    let mut optimizer = config.optimizer.init::<B, PreActResNet<B>>();
    info!(
        "training {:?} network with block counts {:?}, {} parameters",
        config.model.variant,
        config.model.block_counts,
        model.num_params(),
    );

    let batcher = splits.batcher();
    let train_loader = DataLoaderBuilder::<B, _, _>::new(batcher.clone())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(splits.train);
    let test_loader = DataLoaderBuilder::<B::InnerBackend, _, _>::new(batcher)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(splits.test);

    let mut history = History::default();
    for epoch in 1..=config.num_epochs {
        let (trained, train) = train_epoch(
            model,
            &mut optimizer,
            config.learning_rate,
            train_loader.iter(),
        )?;
        model = trained;

        let valid = evaluate_epoch(&model.valid(), test_loader.iter())?;
        info!(
            "epoch {epoch}/{}: train loss {:.4}, accuracy {:.2}% | valid loss {:.4}, accuracy {:.2}%",
            config.num_epochs,
            train.loss,
            train.accuracy * 100.0,
            valid.loss,
            valid.accuracy * 100.0,
        );
        history.push(EpochRecord {
            epoch,
            train,
            valid,
        });
    }

    history.save(format!("{artifact_dir}/history.json"))?;
    model
        .save_file(format!("{artifact_dir}/model"), &CompactRecorder::new())
        .map_err(|err| TrainError::Record(format!("{err:?}")))?;
    info!("saved model and history to {artifact_dir}");

    Ok(history)
}
