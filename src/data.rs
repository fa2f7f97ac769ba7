use std::path::{Path, PathBuf};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{
            Dataset, InMemDataset,
            vision::{
                Annotation, ImageDatasetItem, ImageFolderDataset, MnistDataset, MnistItem,
                PixelDepth,
            },
        },
    },
    prelude::*,
    tensor::{Int, Tensor},
};
use log::{debug, info};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::error::DataError;

/// One labelled image, pixels stored channel-major (CHW).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageItem {
    pub pixels: Vec<u8>,
    pub label: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub const CIFAR: ImageShape = ImageShape {
        channels: 3,
        height: 32,
        width: 32,
    };
    pub const MNIST: ImageShape = ImageShape {
        channels: 1,
        height: 28,
        width: 28,
    };

    pub fn pixel_count(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// Per-channel standardization applied after scaling pixels to `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalization {
    pub fn mnist() -> Self {
        // 画素値を平均0，標準偏差1にする
        Self {
            mean: vec![0.1307],
            std: vec![0.3081],
        }
    }

    pub fn cifar() -> Self {
        Self {
            mean: vec![0.4914, 0.4822, 0.4465],
            std: vec![0.2470, 0.2435, 0.2616],
        }
    }

    pub fn uniform(channels: usize) -> Self {
        Self {
            mean: vec![0.5; channels],
            std: vec![0.25; channels],
        }
    }

    fn apply<B: Backend>(&self, images: Tensor<B, 4>, device: &B::Device) -> Tensor<B, 4> {
        let channels = self.mean.len();
        let per_channel = |values: &[f32]| {
            Tensor::<B, 1>::from_data(
                TensorData::new(values.to_vec(), [channels]).convert::<B::FloatElem>(),
                device,
            )
            .reshape([1, channels, 1, 1])
        };

        (images - per_channel(&self.mean)) / per_channel(&self.std)
    }
}

#[derive(Debug, Clone)]
pub struct ImageBatcher {
    shape: ImageShape,
    normalization: Normalization,
}

impl ImageBatcher {
    pub fn new(shape: ImageShape, normalization: Normalization) -> Self {
        Self {
            shape,
            normalization,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects batches whose labels do not line up with the images, whose channels do not
    /// match what the model was built for, or whose labels fall outside `0..classes`.
    pub fn validate(&self, channels: usize, classes: usize) -> Result<(), DataError> {
        let [images, found, _, _] = self.images.dims();
        let [targets] = self.targets.dims();

        if images != targets {
            return Err(DataError::BatchMismatch { images, targets });
        }
        if found != channels {
            return Err(DataError::ChannelMismatch {
                expected: channels,
                found,
            });
        }
        if self.is_empty() {
            return Ok(());
        }

        let min = self.targets.clone().min().into_scalar().elem::<i64>();
        let max = self.targets.clone().max().into_scalar().elem::<i64>();
        let out_of_range = if min < 0 {
            Some(min)
        } else if max >= classes as i64 {
            Some(max)
        } else {
            None
        };
        match out_of_range {
            Some(label) => Err(DataError::LabelOutOfRange { label, classes }),
            None => Ok(()),
        }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &<B as Backend>::Device) -> ImageBatch<B> {
        let ImageShape {
            channels,
            height,
            width,
        } = self.shape;

        let images = items
            .iter()
            .map(|item| TensorData::new(item.pixels.clone(), [channels, height, width]))
            .map(|data| Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), device))
            .map(|tensor| tensor.reshape([1, channels, height, width]))
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    TensorData::from([(item.label as i64).elem::<B::IntElem>()]),
                    device,
                )
            })
            .collect();

        // テンソルを結合してバッチを作成
        let images = Tensor::cat(images, 0) / 255;
        let images = self.normalization.apply(images, device);
        let targets = Tensor::cat(targets, 0);

        ImageBatch { images, targets }
    }
}

/// Train and test datasets plus what the model and batcher need to know about them.
pub struct Splits {
    pub train: InMemDataset<ImageItem>,
    pub test: InMemDataset<ImageItem>,
    pub shape: ImageShape,
    pub num_classes: usize,
    pub normalization: Normalization,
}

impl Splits {
    pub fn batcher(&self) -> ImageBatcher {
        ImageBatcher::new(self.shape, self.normalization.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    /// Seeded class prototypes plus noise, 3x32x32.
    Synthetic {
        train: usize,
        test: usize,
        classes: usize,
        seed: u64,
    },
    /// MNIST digits, downloaded by burn on first use.
    Mnist,
    /// `root/train/<class>/*.png` and `root/test/<class>/*.png`, 3x32x32 RGB.
    ImageFolder(PathBuf),
}

impl DataSource {
    pub fn load(&self) -> Result<Splits, DataError> {
        let splits = match self {
            DataSource::Synthetic {
                train,
                test,
                classes,
                seed,
            } => synthetic(*train, *test, *classes, *seed)?,
            DataSource::Mnist => mnist(),
            DataSource::ImageFolder(root) => image_folder(root)?,
        };

        info!(
            "loaded {} training and {} test images of shape {:?}, {} classes",
            splits.train.len(),
            splits.test.len(),
            splits.shape,
            splits.num_classes,
        );
        Ok(splits)
    }
}

fn synthetic(train: usize, test: usize, classes: usize, seed: u64) -> Result<Splits, DataError> {
    if classes == 0 {
        return Err(DataError::Source("synthetic data needs at least one class".into()));
    }
    let shape = ImageShape::CIFAR;
    let mut rng = StdRng::seed_from_u64(seed);

    let prototypes: Vec<Vec<u8>> = (0..classes)
        .map(|_| (0..shape.pixel_count()).map(|_| rng.r#gen::<u8>()).collect())
        .collect();

    let mut sample = |count: usize| {
        (0..count)
            .map(|index| {
                let label = index % classes;
                let pixels = prototypes[label]
                    .iter()
                    .map(|&p| (p as i16 + rng.gen_range(-24..=24)).clamp(0, 255) as u8)
                    .collect();
                ImageItem { pixels, label }
            })
            .collect::<Vec<_>>()
    };
    let train = sample(train);
    let test = sample(test);

    Ok(Splits {
        train: InMemDataset::new(train),
        test: InMemDataset::new(test),
        shape,
        num_classes: classes,
        normalization: Normalization::uniform(shape.channels),
    })
}

impl From<MnistItem> for ImageItem {
    fn from(item: MnistItem) -> Self {
        let pixels = item
            .image
            .iter()
            .flatten()
            .map(|&value| value.clamp(0.0, 255.0) as u8)
            .collect();

        ImageItem {
            pixels,
            label: item.label as usize,
        }
    }
}

fn mnist() -> Splits {
    let convert = |dataset: MnistDataset| -> InMemDataset<ImageItem> {
        InMemDataset::new(dataset.iter().map(ImageItem::from).collect())
    };

    Splits {
        train: convert(MnistDataset::train()),
        test: convert(MnistDataset::test()),
        shape: ImageShape::MNIST,
        num_classes: 10,
        normalization: Normalization::mnist(),
    }
}

fn pixel_value(pixel: PixelDepth) -> u8 {
    match pixel {
        PixelDepth::U8(value) => value,
        PixelDepth::U16(value) => (value >> 8) as u8,
        PixelDepth::F32(value) => (value * 255.0).clamp(0.0, 255.0) as u8,
    }
}

/// Converts an interleaved (HWC) folder image to a channel-major [`ImageItem`].
pub(crate) fn from_folder_item(
    item: ImageDatasetItem,
    shape: ImageShape,
) -> Result<ImageItem, DataError> {
    let label = match item.annotation {
        Annotation::Label(label) => label,
        _ => {
            return Err(DataError::UnsupportedAnnotation {
                path: item.image_path,
            });
        }
    };
    if item.image.len() != shape.pixel_count() {
        return Err(DataError::PixelCount {
            path: item.image_path,
            expected: shape.pixel_count(),
            found: item.image.len(),
        });
    }

    let hwc: Vec<u8> = item.image.into_iter().map(pixel_value).collect();
    let plane = shape.height * shape.width;
    let pixels = (0..shape.pixel_count())
        .map(|index| {
            let (channel, offset) = (index / plane, index % plane);
            hwc[offset * shape.channels + channel]
        })
        .collect();

    Ok(ImageItem { pixels, label })
}

/// Name of the directory an image sits in, which is its class.
fn class_name(image_path: &str) -> Option<String> {
    Path::new(image_path)
        .parent()?
        .file_name()?
        .to_str()
        .map(str::to_owned)
}

/// Images of one split, each paired with its class folder name.
fn load_folder(path: &Path, shape: ImageShape) -> Result<Vec<(String, ImageItem)>, DataError> {
    debug!("reading image folder {}", path.display());
    let dataset = ImageFolderDataset::new_classification(path)
        .map_err(|err| DataError::Source(format!("{}: {err:?}", path.display())))?;

    dataset
        .iter()
        .map(|item| {
            let class = class_name(&item.image_path).ok_or_else(|| {
                DataError::Source(format!("{}: not inside a class folder", item.image_path))
            })?;
            Ok((class, from_folder_item(item, shape)?))
        })
        .collect()
}

fn image_folder(root: &Path) -> Result<Splits, DataError> {
    let shape = ImageShape::CIFAR;
    let train = load_folder(&root.join("train"), shape)?;
    let test = load_folder(&root.join("test"), shape)?;

    // Each split is labelled against the training classes, so a test folder with fewer
    // classes still maps every image to the same id.
    let mut classes: Vec<String> = train.iter().map(|(class, _)| class.clone()).collect();
    classes.sort();
    classes.dedup();
    debug!("image folder classes: {classes:?}");

    let relabel = |items: Vec<(String, ImageItem)>| -> Result<Vec<ImageItem>, DataError> {
        items
            .into_iter()
            .map(|(class, mut item)| {
                item.label = classes
                    .binary_search(&class)
                    .map_err(|_| DataError::UnknownClass { class })?;
                Ok(item)
            })
            .collect()
    };
    let train = relabel(train)?;
    let test = relabel(test)?;

    Ok(Splits {
        train: InMemDataset::new(train),
        test: InMemDataset::new(test),
        shape,
        num_classes: classes.len(),
        normalization: Normalization::cifar(),
    })
}
