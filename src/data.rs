use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Result, TrainError};

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff"];

/// Lists the image files of `dir` in sorted order, keeping at most `max_images`.
pub fn list_images(dir: &Path, max_images: usize) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(TrainError::MissingDirectory(dir.to_path_buf()));
    }

    let mut image_paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            image_paths.push(path);
        }
    }

    if image_paths.is_empty() {
        return Err(TrainError::NoImages(dir.to_path_buf()));
    }

    image_paths.sort();
    image_paths.truncate(max_images);

    tracing::info!("Found {} images in {}", image_paths.len(), dir.display());
    Ok(image_paths)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition<T> {
    pub train: Vec<T>,
    pub val: Vec<T>,
    pub test: Vec<T>,
}

/// Splits `items` into contiguous train, validation and test ranges.
///
/// The train range ends at `floor(n * train_ratio)`, the validation range at
/// `floor(n * (train_ratio + val_ratio))` and the test split takes the rest,
/// so the three lists are disjoint and always cover every item. Order is
/// preserved; shuffling only happens inside the loader.
pub fn partition<T: Clone>(items: &[T], train_ratio: f64, val_ratio: f64) -> Partition<T> {
    let n = items.len();
    // absorbs representation error, e.g. 0.7 + 0.2 == 0.8999999999999999
    let boundary = |ratio: f64| (((n as f64) * ratio + 1e-9).floor() as usize).min(n);

    let train_end = boundary(train_ratio);
    let val_end = boundary(train_ratio + val_ratio).max(train_end);

    Partition {
        train: items[..train_end].to_vec(),
        val: items[train_end..val_end].to_vec(),
        test: items[val_end..].to_vec(),
    }
}

/// Linear intensity rescaling from `[a_min, a_max]` to `[b_min, b_max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleIntensityRange {
    pub a_min: f32,
    pub a_max: f32,
    pub b_min: f32,
    pub b_max: f32,
    pub clip: bool,
}

impl Default for ScaleIntensityRange {
    fn default() -> Self {
        Self {
            a_min: 0.0,
            a_max: 255.0,
            b_min: 0.0,
            b_max: 1.0,
            clip: true,
        }
    }
}

impl ScaleIntensityRange {
    pub fn apply(&self, value: f32) -> f32 {
        let span = self.a_max - self.a_min;
        if span == 0.0 {
            return self.b_min;
        }
        let scaled = (value - self.a_min) / span * (self.b_max - self.b_min) + self.b_min;
        if self.clip {
            scaled.clamp(self.b_min.min(self.b_max), self.b_min.max(self.b_max))
        } else {
            scaled
        }
    }

    pub fn apply_slice(&self, values: &mut [f32]) {
        for v in values.iter_mut() {
            *v = self.apply(*v);
        }
    }
}

/// A decoded image in channel-first layout.
#[derive(Debug, Clone)]
pub struct Sample {
    pub path: PathBuf,
    /// `[channels, height, width]` flattened row-major.
    pub data: Vec<f32>,
}

/// Load, ensure channel-first, rescale intensity.
#[derive(Debug, Clone)]
pub struct ImageTransform {
    pub channels: usize,
    pub image_size: usize,
    pub intensity: ScaleIntensityRange,
}

impl ImageTransform {
    pub fn new(channels: usize, image_size: usize) -> Self {
        Self {
            channels,
            image_size,
            intensity: ScaleIntensityRange::default(),
        }
    }

    pub fn load(&self, path: &Path) -> Result<Sample> {
        let img = image::open(path).map_err(|source| TrainError::Image {
            path: path.to_path_buf(),
            source,
        })?;

        let (width, height) = (img.width() as usize, img.height() as usize);
        if width != self.image_size || height != self.image_size {
            return Err(TrainError::ImageShape {
                path: path.to_path_buf(),
                expected: [self.image_size, self.image_size],
                actual: [height, width],
            });
        }

        // alpha is dropped, it does not count as an image channel
        let color = img.color();
        let found = color.channel_count() as usize - usize::from(color.has_alpha());
        if found != self.channels {
            return Err(TrainError::ImageChannels {
                path: path.to_path_buf(),
                expected: self.channels,
                actual: found,
            });
        }

        let mut data: Vec<f32> = match self.channels {
            1 => img.to_luma8().pixels().map(|p| p[0] as f32).collect(),
            3 => {
                let rgb = img.to_rgb8();
                let mut planes = vec![Vec::with_capacity(height * width); 3];
                for p in rgb.pixels() {
                    planes[0].push(p[0] as f32);
                    planes[1].push(p[1] as f32);
                    planes[2].push(p[2] as f32);
                }
                planes.into_iter().flatten().collect::<Vec<f32>>()
            }
            other => {
                return Err(TrainError::Config(format!(
                    "images can be loaded with 1 or 3 channels, not {other}"
                )))
            }
        };
        self.intensity.apply_slice(&mut data);

        Ok(Sample {
            path: path.to_path_buf(),
            data,
        })
    }
}

pub struct ImageDataset {
    pub image_paths: Vec<PathBuf>,
    pub transform: ImageTransform,
}

impl ImageDataset {
    pub fn new(image_paths: Vec<PathBuf>, transform: ImageTransform) -> Self {
        Self {
            image_paths,
            transform,
        }
    }

    pub fn len(&self) -> usize {
        self.image_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_paths.is_empty()
    }

    pub fn get(&self, idx: usize) -> Result<Sample> {
        self.transform.load(&self.image_paths[idx])
    }

    /// Stacks the samples at `indices` into a `[n, C, H, W]` tensor.
    pub fn get_batch<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Result<Tensor<B, 4>> {
        let size = self.transform.image_size;
        let channels = self.transform.channels;

        let mut flat = Vec::with_capacity(indices.len() * channels * size * size);
        for &idx in indices {
            flat.extend(self.get(idx)?.data);
        }

        let data = TensorData::new(flat, [indices.len(), channels, size, size]);
        Ok(Tensor::from_data(data, device))
    }
}

/// Batches a dataset, optionally reshuffling on every pass.
pub struct DataLoader {
    pub dataset: ImageDataset,
    pub batch_size: usize,
    pub shuffle: bool,
}

impl DataLoader {
    pub fn new(dataset: ImageDataset, batch_size: usize, shuffle: bool) -> Self {
        Self {
            dataset,
            batch_size,
            shuffle,
        }
    }

    /// Number of batches per pass; the last one may be short.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Index groups for one pass over the dataset.
    pub fn epoch_plan<R: Rng>(&self, rng: &mut R) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            indices.shuffle(rng);
        }
        indices
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    pub fn load<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Result<Tensor<B, 4>> {
        self.dataset.get_batch(indices, device)
    }

    /// First batch of a fresh pass, used for calibration.
    pub fn first<B: Backend, R: Rng>(&self, rng: &mut R, device: &B::Device) -> Result<Option<Tensor<B, 4>>> {
        match self.epoch_plan(rng).first() {
            Some(indices) => self.load(indices, device).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{GrayAlphaImage, GrayImage, Luma, LumaA, Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray;

    #[test]
    fn partition_reference_sizes() {
        let items: Vec<usize> = (0..4000).collect();
        let split = partition(&items, 0.7, 0.2);
        assert_eq!(split.train.len(), 2800);
        assert_eq!(split.val.len(), 800);
        assert_eq!(split.test.len(), 400);
        assert_eq!(split.val[0], 2800);
        assert_eq!(split.test[0], 3600);
    }

    #[test]
    fn partition_is_disjoint_and_complete() {
        for n in 0..200 {
            let items: Vec<usize> = (0..n).collect();
            let split = partition(&items, 0.7, 0.2);
            let mut all: Vec<usize> = split
                .train
                .iter()
                .chain(&split.val)
                .chain(&split.test)
                .copied()
                .collect();
            assert_eq!(all.len(), n, "n = {n}");
            all.sort();
            all.dedup();
            assert_eq!(all.len(), n, "n = {n}");
        }
    }

    #[test]
    fn small_partition_keeps_order() {
        let items = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];
        let split = partition(&items, 0.7, 0.2);
        assert_eq!(split.train, &items[..7]);
        assert_eq!(split.val, &items[7..9]);
        assert_eq!(split.test, &items[9..]);
    }

    #[test]
    fn intensity_scaling_clips_to_unit_range() {
        let scale = ScaleIntensityRange::default();
        for v in 0..=255 {
            let out = scale.apply(v as f32);
            assert!((out - v as f32 / 255.0).abs() < 1e-6);
        }
        assert_eq!(scale.apply(-20.0), 0.0);
        assert_eq!(scale.apply(300.0), 1.0);
        assert_eq!(scale.apply(f32::MAX), 1.0);
    }

    #[test]
    fn intensity_scaling_without_clip_extrapolates() {
        let scale = ScaleIntensityRange {
            clip: false,
            ..Default::default()
        };
        assert!((scale.apply(510.0) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn lists_only_images_sorted_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.png", "a.png", "b.PNG"] {
            GrayImage::new(4, 4).save(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let paths = list_images(dir.path(), 2).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["a.png", "b.PNG"]);
    }

    #[test]
    fn missing_or_empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            list_images(&dir.path().join("nope"), 10),
            Err(TrainError::MissingDirectory(_))
        ));
        assert!(matches!(
            list_images(dir.path(), 10),
            Err(TrainError::NoImages(_))
        ));
    }

    #[test]
    fn transform_loads_channel_first_unit_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        let img = GrayImage::from_fn(4, 4, |x, _| Luma([(x * 85) as u8]));
        img.save(&path).unwrap();

        let sample = ImageTransform::new(1, 4).load(&path).unwrap();
        assert_eq!(sample.data.len(), 16);
        assert_eq!(&sample.data[..4], &[0.0, 85.0 / 255.0, 170.0 / 255.0, 1.0]);
    }

    #[test]
    fn transform_rejects_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        GrayImage::new(4, 6).save(&path).unwrap();

        let err = ImageTransform::new(1, 4).load(&path).unwrap_err();
        assert!(matches!(err, TrainError::ImageShape { actual: [6, 4], .. }));
    }

    #[test]
    fn transform_rejects_channel_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let rgb = dir.path().join("rgb.png");
        RgbImage::from_pixel(4, 4, Rgb([255, 0, 0])).save(&rgb).unwrap();
        let gray = dir.path().join("gray.png");
        GrayImage::new(4, 4).save(&gray).unwrap();

        let err = ImageTransform::new(1, 4).load(&rgb).unwrap_err();
        assert!(matches!(
            err,
            TrainError::ImageChannels {
                expected: 1,
                actual: 3,
                ..
            }
        ));
        assert!(matches!(
            ImageTransform::new(3, 4).load(&gray),
            Err(TrainError::ImageChannels { actual: 1, .. })
        ));

        let sample = ImageTransform::new(3, 4).load(&rgb).unwrap();
        assert_eq!(sample.data.len(), 48);
        assert_eq!(sample.data[0], 1.0);
        assert_eq!(sample.data[16], 0.0);
    }

    #[test]
    fn gray_alpha_counts_as_one_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("la.png");
        GrayAlphaImage::from_pixel(4, 4, LumaA([51, 0])).save(&path).unwrap();

        let sample = ImageTransform::new(1, 4).load(&path).unwrap();
        assert!((sample.data[0] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn loader_batches_cover_dataset_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..5 {
            let path = dir.path().join(format!("{i}.png"));
            GrayImage::from_pixel(2, 2, Luma([i as u8])).save(&path).unwrap();
            paths.push(path);
        }
        let loader = DataLoader::new(ImageDataset::new(paths, ImageTransform::new(1, 2)), 2, true);
        assert_eq!(loader.num_batches(), 3);

        let mut rng = StdRng::seed_from_u64(7);
        let plan = loader.epoch_plan(&mut rng);
        assert_eq!(plan.iter().map(Vec::len).collect::<Vec<_>>(), [2, 2, 1]);
        let mut seen: Vec<usize> = plan.concat();
        seen.sort();
        assert_eq!(seen, [0, 1, 2, 3, 4]);

        let device = Default::default();
        let batch = loader.load::<TestBackend>(&plan[0], &device).unwrap();
        assert_eq!(batch.dims(), [2, 1, 2, 2]);
    }
}
