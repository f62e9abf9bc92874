//! Dataset factory: directory of labeled images -> training/validation streams.

pub mod source;
pub mod stream;

pub use source::{ImageDirectory, LabeledImage};
pub use stream::{BatchIter, ImageBatch, ImageDataset, StreamPolicy};

use crate::error::MlError;
use std::path::Path;
use tracing::debug;

/// Parameters for building a [`DatasetPair`].
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetOptions {
    pub image_width: usize,
    pub image_height: usize,
    pub batch_size: usize,
    /// Used only to size the shuffle and prefetch buffers.
    pub steps_per_epoch: usize,
    /// Used only to size the shuffle and prefetch buffers.
    pub epochs: usize,
    pub prefetch: bool,
    pub seed: u64,
    pub validation_split: f64,
}

impl DatasetOptions {
    /// Images drawn over the whole run: `batch_size * steps_per_epoch * epochs`.
    pub fn buffer_size(&self) -> usize {
        self.batch_size
            .saturating_mul(self.steps_per_epoch)
            .saturating_mul(self.epochs)
    }

    fn policy(&self) -> StreamPolicy {
        if self.prefetch {
            StreamPolicy::prefetched(self.buffer_size())
        } else {
            StreamPolicy::reshuffled()
        }
    }
}

/// Training and validation streams built from one directory.
#[derive(Debug, Clone)]
pub struct DatasetPair {
    pub training: ImageDataset,
    pub validation: ImageDataset,
    pub class_names: Vec<String>,
}

/// Index `data_dir`, split it 80/20 (or per `validation_split`) with a fixed
/// seed, and wrap each split in an infinite stream.
///
/// The classifier is binary, so exactly two class directories are required.
pub fn make_datasets(data_dir: &Path, options: &DatasetOptions) -> Result<DatasetPair, MlError> {
    let index = ImageDirectory::index(data_dir)?;
    if index.class_names.len() != 2 {
        return Err(MlError::dataset(format!(
            "expected 2 class directories in {}, found {}: {:?}",
            data_dir.display(),
            index.class_names.len(),
            index.class_names
        )));
    }

    let (train_entries, val_entries) = index.split(options.validation_split, options.seed)?;
    debug!(
        train = train_entries.len(),
        validation = val_entries.len(),
        prefetch = options.prefetch,
        "Split dataset"
    );

    let policy = options.policy();
    let training = ImageDataset::new(
        train_entries,
        options.image_width,
        options.image_height,
        options.batch_size,
        policy,
        options.seed,
    )?;
    let validation = ImageDataset::new(
        val_entries,
        options.image_width,
        options.image_height,
        options.batch_size,
        policy,
        options.seed.wrapping_add(1),
    )?;

    Ok(DatasetPair {
        training,
        validation,
        class_names: index.class_names,
    })
}
