use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::imageops::FilterType;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];
const MIN_STD: f32 = 1e-8;

/// Problems with the on-disk dataset layout or its contents.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("dataset directory not found: {0}")]
    MissingDirectory(PathBuf),
    #[error("label directory name is not a number: {0}")]
    BadLabel(PathBuf),
    #[error("no images found under {0}")]
    Empty(PathBuf),
    #[error("sample has {actual} values, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("stream is not bound to a dataset")]
    Unbound,
}

/// One image in CHW layout with its scalar label.
#[derive(Debug, Clone)]
pub struct Sample {
    pub pixels: Vec<f32>,
    pub label: f32,
}

/// Settings for decoding images from disk.
#[derive(Debug, Clone)]
pub struct DataConfig {
    pub channels: usize,
    pub image_size: u32,
}

impl DataConfig {
    pub fn sample_len(&self) -> usize {
        self.channels * (self.image_size * self.image_size) as usize
    }
}

/// Load every image below `dir`, where each subdirectory name is the label.
///
/// Pixels keep their 0..255 scale. Files are visited in path order so runs are
/// reproducible.
pub fn load_image_folder(dir: &Path, config: &DataConfig) -> Result<Vec<Sample>> {
    if !dir.is_dir() {
        return Err(DataError::MissingDirectory(dir.to_path_buf()).into());
    }

    let mut label_dirs = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            label_dirs.push(path);
        }
    }
    label_dirs.sort();

    let mut samples = Vec::new();
    for label_dir in label_dirs {
        let label = label_dir
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse::<f32>().ok())
            .ok_or_else(|| DataError::BadLabel(label_dir.clone()))?;

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&label_dir)
            .with_context(|| format!("failed to read {}", label_dir.display()))?
        {
            let path = entry?.path();
            if is_image(&path) {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let img = image::open(&path)
                .with_context(|| format!("failed to decode {}", path.display()))?;
            samples.push(Sample {
                pixels: image_to_chw(img, config),
                label,
            });
        }
    }

    if samples.is_empty() {
        return Err(DataError::Empty(dir.to_path_buf()).into());
    }
    tracing::debug!(dir = %dir.display(), count = samples.len(), "loaded images");
    Ok(samples)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Convert a decoded image to CHW floats in pixel scale.
fn image_to_chw(img: DynamicImage, config: &DataConfig) -> Vec<f32> {
    let size = config.image_size;
    let img = if img.width() != size || img.height() != size {
        img.resize_exact(size, size, FilterType::CatmullRom)
    } else {
        img
    };

    let hw = (size * size) as usize;
    if config.channels == 1 {
        return img.to_luma8().pixels().map(|p| p.0[0] as f32).collect();
    }

    let rgb = img.to_rgb8();
    let mut out = vec![0.0f32; hw * 3];
    for (idx, pixel) in rgb.pixels().enumerate() {
        out[idx] = pixel.0[0] as f32;
        out[hw + idx] = pixel.0[1] as f32;
        out[2 * hw + idx] = pixel.0[2] as f32;
    }
    out
}

/// Per-element mean and standard deviation over the sample axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalization {
    /// Fit statistics on the training samples only.
    pub fn fit(samples: &[Sample]) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| DataError::Empty(PathBuf::from("<training set>")))?;
        let len = first.pixels.len();
        let count = samples.len() as f64;

        let mut sum = vec![0.0f64; len];
        for sample in samples {
            check_len(sample, len)?;
            for (acc, &value) in sum.iter_mut().zip(&sample.pixels) {
                *acc += value as f64;
            }
        }
        let mean: Vec<f64> = sum.into_iter().map(|s| s / count).collect();

        let mut var = vec![0.0f64; len];
        for sample in samples {
            for ((acc, &value), &m) in var.iter_mut().zip(&sample.pixels).zip(&mean) {
                *acc += (value as f64 - m).powi(2);
            }
        }

        let std = var
            .into_iter()
            .map(|v| {
                let std = (v / count).sqrt() as f32;
                if std < MIN_STD {
                    1.0
                } else {
                    std
                }
            })
            .collect();

        Ok(Self {
            mean: mean.into_iter().map(|m| m as f32).collect(),
            std,
        })
    }

    pub fn normalize(&self, pixels: &[f32]) -> Vec<f32> {
        pixels
            .iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(&x, (&m, &s))| (x - m) / s)
            .collect()
    }

    pub fn denormalize(&self, values: &[f32]) -> Vec<f32> {
        values
            .iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(&x, (&m, &s))| x * s + m)
            .collect()
    }

    /// Normalize a whole set in place with these statistics.
    pub fn apply(&self, samples: &mut [Sample]) -> Result<()> {
        for sample in samples.iter_mut() {
            check_len(sample, self.mean.len())?;
            sample.pixels = self.normalize(&sample.pixels);
        }
        Ok(())
    }
}

fn check_len(sample: &Sample, expected: usize) -> Result<(), DataError> {
    if sample.pixels.len() != expected {
        return Err(DataError::ShapeMismatch {
            expected,
            actual: sample.pixels.len(),
        });
    }
    Ok(())
}

/// In-memory image dataset shared between stream bindings.
#[derive(Clone, Debug)]
pub struct ImageDataset {
    samples: Vec<Arc<Sample>>,
}

impl ImageDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples: samples.into_iter().map(Arc::new).collect(),
        }
    }
}

impl Dataset<Arc<Sample>> for ImageDataset {
    fn get(&self, index: usize) -> Option<Arc<Sample>> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// A batch of normalized images and `[batch, 1]` labels.
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 2>,
}

#[derive(Clone, Debug)]
pub struct ImageBatcher {
    config: DataConfig,
}

impl ImageBatcher {
    pub fn new(config: DataConfig) -> Self {
        Self { config }
    }
}

impl<B: Backend> Batcher<B, Arc<Sample>, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<Arc<Sample>>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.config.image_size as usize;
        let mut pixels = Vec::with_capacity(batch_size * self.config.sample_len());
        let mut labels = Vec::with_capacity(batch_size);
        for item in &items {
            pixels.extend_from_slice(&item.pixels);
            labels.push(item.label);
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [batch_size, self.config.channels, size, size]),
            device,
        );
        let labels = Tensor::<B, 2>::from_data(TensorData::new(labels, [batch_size, 1]), device);
        ImageBatch { images, labels }
    }
}

/// Which split the stream is currently bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Train,
    Test,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Test => "eval",
        }
    }
}

#[derive(Debug)]
struct Binding {
    phase: Phase,
    dataset: Arc<ImageDataset>,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    emitted: usize,
}

/// Rebindable batch iterator.
///
/// A train binding reshuffles on every bind and wraps around so every batch is
/// full. A test binding walks the dataset in order and the last batch may be
/// short.
#[derive(Debug)]
pub struct BatchStream {
    rng: StdRng,
    binding: Option<Binding>,
}

impl BatchStream {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            binding: None,
        }
    }

    /// Bind to a dataset for the given phase, discarding any previous position.
    pub fn bind(&mut self, phase: Phase, dataset: Arc<ImageDataset>, batch_size: usize) -> Result<()> {
        if dataset.is_empty() {
            return Err(DataError::Empty(PathBuf::from(format!("<{} set>", phase.name()))).into());
        }
        if batch_size == 0 {
            return Err(anyhow::anyhow!("batch size must be positive"));
        }

        let mut order: Vec<usize> = (0..dataset.len()).collect();
        if phase == Phase::Train {
            order.shuffle(&mut self.rng);
        }
        self.binding = Some(Binding {
            phase,
            dataset,
            batch_size,
            order,
            cursor: 0,
            emitted: 0,
        });
        Ok(())
    }

    pub fn phase(&self) -> Option<Phase> {
        self.binding.as_ref().map(|b| b.phase)
    }

    /// `ceil(len / batch_size)` for the bound dataset.
    pub fn num_batches(&self) -> Result<usize> {
        let binding = self.binding.as_ref().ok_or(DataError::Unbound)?;
        Ok(num_batches(binding.dataset.len(), binding.batch_size))
    }

    /// Next batch of samples, or `None` once `num_batches` batches were emitted.
    pub fn next_items(&mut self) -> Result<Option<Vec<Arc<Sample>>>> {
        let binding = self.binding.as_mut().ok_or(DataError::Unbound)?;
        let len = binding.order.len();
        if binding.emitted >= num_batches(len, binding.batch_size) {
            return Ok(None);
        }

        let take = match binding.phase {
            Phase::Train => binding.batch_size,
            Phase::Test => binding.batch_size.min(len - binding.cursor),
        };
        let mut items = Vec::with_capacity(take);
        for _ in 0..take {
            if binding.cursor == len {
                binding.order.shuffle(&mut self.rng);
                binding.cursor = 0;
            }
            let index = binding.order[binding.cursor];
            binding.cursor += 1;
            if let Some(sample) = binding.dataset.get(index) {
                items.push(sample);
            }
        }
        binding.emitted += 1;
        Ok(Some(items))
    }
}

pub fn num_batches(len: usize, batch_size: usize) -> usize {
    len.div_ceil(batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{GrayImage, Luma};

    type TestBackend = NdArray;

    fn sample(values: &[f32], label: f32) -> Sample {
        Sample {
            pixels: values.to_vec(),
            label,
        }
    }

    fn dataset(len: usize) -> Arc<ImageDataset> {
        let samples = (0..len).map(|i| sample(&[i as f32], (i % 2) as f32)).collect();
        Arc::new(ImageDataset::new(samples))
    }

    #[test]
    fn normalization_round_trips() {
        let samples = vec![
            sample(&[0.0, 10.0, 255.0, 7.0], 0.0),
            sample(&[40.0, 10.0, 128.0, 3.0], 1.0),
            sample(&[90.0, 10.0, 1.0, 200.0], 1.0),
        ];
        let norm = Normalization::fit(&samples).unwrap();
        for s in &samples {
            let restored = norm.denormalize(&norm.normalize(&s.pixels));
            for (a, b) in restored.iter().zip(&s.pixels) {
                assert!((a - b).abs() < 1e-3, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn constant_pixels_use_unit_std() {
        let samples = vec![sample(&[5.0, 1.0], 0.0), sample(&[5.0, 3.0], 1.0)];
        let norm = Normalization::fit(&samples).unwrap();
        assert_eq!(norm.mean, vec![5.0, 2.0]);
        assert_eq!(norm.std, vec![1.0, 1.0]);
    }

    #[test]
    fn apply_rejects_mismatched_samples() {
        let norm = Normalization::fit(&[sample(&[1.0, 2.0], 0.0)]).unwrap();
        let mut other = vec![sample(&[1.0], 0.0)];
        assert!(norm.apply(&mut other).is_err());
    }

    #[test]
    fn batch_count_is_ceiling() {
        assert_eq!(num_batches(16, 8), 2);
        assert_eq!(num_batches(17, 8), 3);
        assert_eq!(num_batches(1, 8), 1);

        let mut stream = BatchStream::new(0);
        stream.bind(Phase::Train, dataset(10), 4).unwrap();
        assert_eq!(stream.num_batches().unwrap(), 3);
        stream.bind(Phase::Test, dataset(10), 4).unwrap();
        assert_eq!(stream.num_batches().unwrap(), 3);
    }

    #[test]
    fn train_batches_wrap_and_stay_full() {
        let mut stream = BatchStream::new(7);
        stream.bind(Phase::Train, dataset(10), 4).unwrap();

        let mut sizes = Vec::new();
        while let Some(items) = stream.next_items().unwrap() {
            sizes.push(items.len());
        }
        assert_eq!(sizes, vec![4, 4, 4]);
    }

    #[test]
    fn test_batches_are_ordered_and_partial() {
        let mut stream = BatchStream::new(7);
        stream.bind(Phase::Test, dataset(10), 4).unwrap();

        let mut seen = Vec::new();
        while let Some(items) = stream.next_items().unwrap() {
            seen.push(items.iter().map(|s| s.pixels[0] as usize).collect::<Vec<_>>());
        }
        assert_eq!(seen, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
    }

    #[test]
    fn rebinding_restarts_the_stream() {
        let mut stream = BatchStream::new(1);
        stream.bind(Phase::Test, dataset(4), 2).unwrap();
        stream.next_items().unwrap();
        stream.bind(Phase::Test, dataset(4), 2).unwrap();
        assert_eq!(stream.phase(), Some(Phase::Test));
        let first = stream.next_items().unwrap().unwrap();
        assert_eq!(first[0].pixels[0], 0.0);
    }

    #[test]
    fn unbound_stream_errors() {
        let mut stream = BatchStream::new(0);
        assert!(stream.next_items().is_err());
        assert!(stream.num_batches().is_err());
    }

    #[test]
    fn batcher_builds_image_and_label_tensors() {
        let config = DataConfig {
            channels: 1,
            image_size: 2,
        };
        let items = vec![
            Arc::new(sample(&[1.0, 2.0, 3.0, 4.0], 0.0)),
            Arc::new(sample(&[5.0, 6.0, 7.0, 8.0], 1.0)),
        ];
        let batch: ImageBatch<TestBackend> =
            ImageBatcher::new(config).batch(items, &Default::default());
        assert_eq!(batch.images.dims(), [2, 1, 2, 2]);
        assert_eq!(batch.labels.into_data().to_vec::<f32>().unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn loads_label_directories() {
        let dir = tempfile::tempdir().unwrap();
        for (label, value) in [("0", 10u8), ("1", 200u8)] {
            let class_dir = dir.path().join(label);
            std::fs::create_dir_all(&class_dir).unwrap();
            GrayImage::from_pixel(4, 4, Luma([value]))
                .save(class_dir.join("a.png"))
                .unwrap();
        }
        std::fs::write(dir.path().join("0").join("notes.txt"), "skip").unwrap();

        let config = DataConfig {
            channels: 1,
            image_size: 4,
        };
        let samples = load_image_folder(dir.path(), &config).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].label, 0.0);
        assert_eq!(samples[1].label, 1.0);
        assert!(samples[1].pixels.iter().all(|&p| p == 200.0));
    }

    #[test]
    fn rejects_non_numeric_label_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cats")).unwrap();
        let config = DataConfig {
            channels: 1,
            image_size: 4,
        };
        assert!(load_image_folder(dir.path(), &config).is_err());
        assert!(load_image_folder(&dir.path().join("missing"), &config).is_err());
    }
}
