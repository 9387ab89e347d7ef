use crate::data::Normalization;
use anyhow::{Context, Result};
use burn::prelude::*;
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use std::path::{Path, PathBuf};

/// Read any tensor back to host memory as `f32`.
pub fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read tensor data as f32: {err:?}"))
}

/// Split a BCHW tensor into one flat CHW vector per sample.
pub fn tensor_to_samples<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<Vec<f32>>> {
    let [batch, channels, height, width] = tensor.dims();
    let values = tensor_values(tensor)?;

    let len = channels * height * width;
    Ok((0..batch)
        .map(|b| values[b * len..(b + 1) * len].to_vec())
        .collect())
}

/// Binary mask: 255 where the pixel-scale difference reaches `threshold`, else 0.
pub fn segmentation_mask(original: &[f32], reconstruction: &[f32], threshold: f32) -> Vec<f32> {
    original
        .iter()
        .zip(reconstruction)
        .map(|(o, r)| if (o - r).abs() >= threshold { 255.0 } else { 0.0 })
        .collect()
}

/// Convert CHW pixel-scale values to an 8-bit image, saturating out-of-range values.
pub fn chw_to_image(values: &[f32], channels: usize, size: usize) -> Result<DynamicImage> {
    let hw = size * size;
    if values.len() != channels * hw {
        return Err(anyhow::anyhow!(
            "expected {} values for a {channels}x{size}x{size} image, got {}",
            channels * hw,
            values.len()
        ));
    }
    let to_u8 = |v: f32| v.round().clamp(0.0, 255.0) as u8;

    match channels {
        1 => {
            let mut img = GrayImage::new(size as u32, size as u32);
            for (idx, &v) in values.iter().enumerate() {
                img.put_pixel((idx % size) as u32, (idx / size) as u32, Luma([to_u8(v)]));
            }
            Ok(DynamicImage::ImageLuma8(img))
        }
        3 => {
            let mut img = RgbImage::new(size as u32, size as u32);
            for idx in 0..hw {
                let pixel = Rgb([
                    to_u8(values[idx]),
                    to_u8(values[hw + idx]),
                    to_u8(values[2 * hw + idx]),
                ]);
                img.put_pixel((idx % size) as u32, (idx / size) as u32, pixel);
            }
            Ok(DynamicImage::ImageRgb8(img))
        }
        _ => Err(anyhow::anyhow!("unsupported channel count {channels}")),
    }
}

/// Paths of the original / reconstruction / segmentation triplet for one sample.
pub fn sample_paths(dir: &Path, index: usize) -> [PathBuf; 3] {
    [
        dir.join(format!("image_{index:04}o.png")),
        dir.join(format!("image_{index:04}r.png")),
        dir.join(format!("image_{index:04}segm.png")),
    ]
}

/// Writes de-normalized sample triplets into an output directory.
#[derive(Debug, Clone)]
pub struct ImageDumper {
    dir: PathBuf,
    normalization: Normalization,
    channels: usize,
    image_size: usize,
    threshold: f32,
}

impl ImageDumper {
    pub fn new(
        dir: PathBuf,
        normalization: Normalization,
        channels: usize,
        image_size: usize,
        threshold: f32,
    ) -> Self {
        Self {
            dir,
            normalization,
            channels,
            image_size,
            threshold,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save one batch, numbering samples from `first_index`. Returns the number of files written.
    pub fn write_batch<B: Backend>(
        &self,
        originals: Tensor<B, 4>,
        reconstructions: Tensor<B, 4>,
        first_index: usize,
    ) -> Result<usize> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let originals = tensor_to_samples(originals)?;
        let reconstructions = tensor_to_samples(reconstructions)?;
        let mut written = 0;

        for (offset, (original, reconstruction)) in originals.iter().zip(&reconstructions).enumerate() {
            let original = self.normalization.denormalize(original);
            let reconstruction = self.normalization.denormalize(reconstruction);
            let segmentation = segmentation_mask(&original, &reconstruction, self.threshold);

            let paths = sample_paths(&self.dir, first_index + offset);
            for (values, path) in [&original, &reconstruction, &segmentation].into_iter().zip(&paths) {
                chw_to_image(values, self.channels, self.image_size)?
                    .save(path)
                    .with_context(|| format!("failed to save {}", path.display()))?;
                written += 1;
            }
        }

        Ok(written)
    }
}

/// Whether the evaluation phase writes sample images.
#[derive(Debug, Clone, Copy)]
pub enum ImageDumpPolicy<'a> {
    Skip,
    Write(&'a ImageDumper),
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    #[test]
    fn segmentation_threshold_is_inclusive() {
        let original = [100.0, 100.0, 100.0, 0.0];
        let reconstruction = [130.0, 129.0, 70.0, 0.0];
        assert_eq!(
            segmentation_mask(&original, &reconstruction, 30.0),
            vec![255.0, 0.0, 255.0, 0.0]
        );
    }

    #[test]
    fn sample_names_are_zero_padded() {
        let [o, r, s] = sample_paths(Path::new("out"), 7);
        assert_eq!(o, Path::new("out/image_0007o.png"));
        assert_eq!(r, Path::new("out/image_0007r.png"));
        assert_eq!(s, Path::new("out/image_0007segm.png"));
    }

    #[test]
    fn chw_to_image_saturates() {
        let img = chw_to_image(&[-20.0, 300.0, 12.4, 12.6], 1, 2).unwrap().to_luma8();
        assert_eq!(img.as_raw(), &vec![0, 255, 12, 13]);
        assert!(chw_to_image(&[0.0; 3], 1, 2).is_err());
    }

    #[test]
    fn writes_denormalized_triplets() {
        let dir = tempfile::tempdir().unwrap();
        let normalization = Normalization {
            mean: vec![100.0; 4],
            std: vec![10.0; 4],
        };
        let dumper = ImageDumper::new(dir.path().to_path_buf(), normalization, 1, 2, 30.0);
        let device = Default::default();
        let originals = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32; 8], [2, 1, 2, 2]),
            &device,
        );
        let reconstructions = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32, 3.0, 2.9, -3.0, 0.0, 0.0, 0.0, 0.0], [2, 1, 2, 2]),
            &device,
        );

        let written = dumper.write_batch(originals, reconstructions, 8).unwrap();
        assert_eq!(written, 6);

        let original = image::open(dir.path().join("image_0008o.png")).unwrap().to_luma8();
        assert_eq!(original.as_raw(), &vec![100; 4]);
        let segm = image::open(dir.path().join("image_0008segm.png")).unwrap().to_luma8();
        assert_eq!(segm.as_raw(), &vec![0, 255, 0, 255]);
        assert!(dir.path().join("image_0009r.png").exists());
    }
}
