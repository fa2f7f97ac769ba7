use thiserror::Error;

/// Invalid network or block configuration. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("expected {expected} block counts, one per group, found {found}")]
    GroupCount { expected: usize, found: usize },
    #[error("group {group} must contain at least one block")]
    EmptyGroup { group: usize },
    #[error("no preset for depth {0}, known depths are 18, 34, 50, 101 and 152")]
    UnknownDepth(usize),
    #[error("a classifier needs at least one class")]
    NoClasses,
    #[error("input images need at least one channel")]
    NoInputChannels,
}

/// Malformed data coming from a dataset or a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("the pass saw no examples")]
    EmptyEpoch,
    #[error("batch has {images} images but {targets} labels")]
    BatchMismatch { images: usize, targets: usize },
    #[error("batch images have {found} channels, the model expects {expected}")]
    ChannelMismatch { expected: usize, found: usize },
    #[error("{path}: expected {expected} pixel values, found {found}")]
    PixelCount {
        path: String,
        expected: usize,
        found: usize,
    },
    #[error("{path}: only single-label annotations are supported")]
    UnsupportedAnnotation { path: String },
    #[error("label {label} is out of range for {classes} classes")]
    LabelOutOfRange { label: i64, classes: usize },
    #[error("class {class} has no training images")]
    UnknownClass { class: String },
    #[error("could not load dataset: {0}")]
    Source(String),
}

/// Anything that aborts a training run.
#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize history: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not record model: {0}")]
    Record(String),
    #[error("could not load training config: {0}")]
    Config(String),
}
