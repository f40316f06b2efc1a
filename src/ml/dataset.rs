//! Labeled X-ray dataset and batching
//!
//! Each split root holds one subdirectory per class. Class directories are
//! mapped through [`Label`], not through their position in a listing.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use rand::{rngs::StdRng, SeedableRng};
use thiserror::Error;

use crate::ml::augment::AugmentConfig;
use crate::ml::preprocess::{self, PreprocessError, PIXELS_PER_IMAGE};
use crate::types::Label;

/// Recognized image extensions (compared case-insensitively)
const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff"];

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("data directory not found: {0}")]
    MissingRoot(PathBuf),
    #[error("class directory '{class}' not found in {root}")]
    MissingClass { root: PathBuf, class: Label },
    #[error("class directory '{class}' in {root} contains no images")]
    EmptyClass { root: PathBuf, class: Label },
    #[error("unexpected directory {0} (expected only 'normal' and 'tuberculosis')")]
    UnexpectedClass(PathBuf),
    #[error("class '{class}' has more than one directory in {root}")]
    DuplicateClass { root: PathBuf, class: Label },
    #[error("unreadable image {path}: {source}")]
    UnreadableImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: PreprocessError,
    },
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DatasetError + '_ {
    move |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// One split of the dataset (image paths only)
#[derive(Debug, Clone)]
pub struct XrayDataset {
    root: PathBuf,
    samples: Vec<(PathBuf, Label)>,
}

impl XrayDataset {
    /// Scans `root` and validates its class layout.
    ///
    /// Fails when the root or a class directory is missing or empty, when a
    /// directory does not name a known class, or when an image header cannot
    /// be read.
    pub fn from_directory(root: &Path) -> Result<Self, DatasetError> {
        if !root.is_dir() {
            return Err(DatasetError::MissingRoot(root.to_path_buf()));
        }

        let mut class_dirs: [Option<PathBuf>; 2] = [None, None];
        let mut entries = std::fs::read_dir(root)
            .map_err(io_error(root))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_error(root))?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let label = Label::from_dir_name(&name)
                .ok_or_else(|| DatasetError::UnexpectedClass(path.clone()))?;
            let slot = &mut class_dirs[label.index()];
            if slot.is_some() {
                return Err(DatasetError::DuplicateClass {
                    root: root.to_path_buf(),
                    class: label,
                });
            }
            *slot = Some(path);
        }

        let mut samples = Vec::new();
        for label in Label::ALL {
            let class_dir = class_dirs[label.index()]
                .take()
                .ok_or_else(|| DatasetError::MissingClass {
                    root: root.to_path_buf(),
                    class: label,
                })?;

            let mut images = Vec::new();
            for entry in std::fs::read_dir(&class_dir).map_err(io_error(&class_dir))? {
                let path = entry.map_err(io_error(&class_dir))?.path();
                if path.is_file() && is_image(&path) {
                    image::image_dimensions(&path).map_err(|source| DatasetError::UnreadableImage {
                        path: path.clone(),
                        source,
                    })?;
                    images.push(path);
                }
            }

            if images.is_empty() {
                return Err(DatasetError::EmptyClass {
                    root: root.to_path_buf(),
                    class: label,
                });
            }
            images.sort();
            samples.extend(images.into_iter().map(|path| (path, label)));
        }

        Ok(Self {
            root: root.to_path_buf(),
            samples,
        })
    }

    /// Number of samples per label
    pub fn class_count(&self, label: Label) -> usize {
        self.samples.iter().filter(|(_, l)| *l == label).count()
    }

    pub fn log_summary(&self, split: &str) {
        tracing::info!(
            "{}: {} images in {} ({} {}, {} {})",
            split,
            self.samples.len(),
            self.root.display(),
            self.class_count(Label::Normal),
            Label::Normal,
            self.class_count(Label::Tuberculosis),
            Label::Tuberculosis
        );
    }
}

/// Dataset item (image path only)
#[derive(Clone, Debug)]
pub struct XrayItem {
    pub path: PathBuf,
    pub label: Label,
}

impl Dataset<XrayItem> for XrayDataset {
    fn get(&self, index: usize) -> Option<XrayItem> {
        let (path, label) = self.samples.get(index)?;
        Some(XrayItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Batch data
#[derive(Clone, Debug)]
pub struct XrayBatch<B: Backend> {
    /// [batch_size, 224, 224, 3]
    pub images: Tensor<B, 4>,
    /// [batch_size], 0 = normal, 1 = tuberculosis
    pub targets: Tensor<B, 1, Int>,
}

/// Loads, optionally augments and normalizes images into a batch.
///
/// A sample that cannot be loaded turns the whole batch into an error.
#[derive(Clone)]
pub struct XrayBatcher<B: Backend> {
    device: B::Device,
    augmentation: Option<(AugmentConfig, Arc<Mutex<StdRng>>)>,
}

impl<B: Backend> XrayBatcher<B> {
    /// Batcher without augmentation (validation split)
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            augmentation: None,
        }
    }

    /// Batcher drawing a random transform for every sample (training split)
    pub fn with_augmentation(device: B::Device, config: AugmentConfig, seed: u64) -> Self {
        Self {
            device,
            augmentation: Some((config, Arc::new(Mutex::new(StdRng::seed_from_u64(seed))))),
        }
    }

    fn load_item(&self, item: &XrayItem) -> Result<Vec<f32>, DatasetError> {
        let image = preprocess::load_model_rgb(&item.path).map_err(|source| DatasetError::Load {
            path: item.path.clone(),
            source,
        })?;

        let image = match &self.augmentation {
            Some((config, rng)) => {
                let transform = {
                    let mut rng = rng.lock().unwrap_or_else(|e| e.into_inner());
                    config.sample(&mut *rng, image.width(), image.height())
                };
                transform.apply(&image)
            }
            None => image,
        };

        Ok(preprocess::normalize(&image))
    }
}

impl<B: Backend> Batcher<B, XrayItem, Result<XrayBatch<B>, DatasetError>> for XrayBatcher<B> {
    fn batch(&self, items: Vec<XrayItem>, _device: &B::Device) -> Result<XrayBatch<B>, DatasetError> {
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * PIXELS_PER_IMAGE);
        let mut targets = Vec::with_capacity(batch_size);

        for item in &items {
            all_pixels.extend_from_slice(&self.load_item(item)?);
            targets.push(item.label.index() as i64);
        }

        let images = preprocess::to_tensor::<B>(&all_pixels, batch_size, &self.device);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        Ok(XrayBatch { images, targets })
    }
}
