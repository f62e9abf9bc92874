//! Image directory indexing, seeded train/validation split, and decoding.

use crate::error::MlError;
use image::imageops::FilterType;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// File extensions picked up when indexing a class directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["bmp", "gif", "jpeg", "jpg", "png"];

/// One image file and the index of the class directory it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledImage {
    pub path: PathBuf,
    pub label: usize,
}

/// An indexed dataset directory: one subdirectory per class, images inside.
#[derive(Debug, Clone)]
pub struct ImageDirectory {
    pub root: PathBuf,
    /// Class names in label order (sorted by directory name).
    pub class_names: Vec<String>,
    pub images: Vec<LabeledImage>,
}

impl ImageDirectory {
    /// Walk `root` and collect every image under each class subdirectory.
    pub fn index(root: &Path) -> Result<Self, MlError> {
        if !root.is_dir() {
            return Err(MlError::dataset(format!(
                "dataset directory not found: {}",
                root.display()
            )));
        }

        let mut class_dirs = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| MlError::dataset(e.to_string()))?;
            if entry.file_type().is_dir() {
                class_dirs.push(entry.into_path());
            }
        }
        class_dirs.sort();

        if class_dirs.is_empty() {
            return Err(MlError::dataset(format!(
                "no class subdirectories in {}",
                root.display()
            )));
        }

        let mut class_names = Vec::with_capacity(class_dirs.len());
        let mut images = Vec::new();
        for (label, class_dir) in class_dirs.iter().enumerate() {
            let name = class_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let before = images.len();
            for entry in WalkDir::new(class_dir)
                .follow_links(true)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|e| MlError::dataset(e.to_string()))?;
                if entry.file_type().is_file() && has_image_extension(entry.path()) {
                    images.push(LabeledImage {
                        path: entry.into_path(),
                        label,
                    });
                }
            }
            debug!(class = %name, label, count = images.len() - before, "Indexed class directory");
            class_names.push(name);
        }

        if images.is_empty() {
            return Err(MlError::dataset(format!(
                "no images found under {}",
                root.display()
            )));
        }

        Ok(Self {
            root: root.to_path_buf(),
            class_names,
            images,
        })
    }

    /// Shuffle the file list with `seed`, then hold out the last
    /// `floor(n * validation_split)` entries for validation.
    pub fn split(
        &self,
        validation_split: f64,
        seed: u64,
    ) -> Result<(Vec<LabeledImage>, Vec<LabeledImage>), MlError> {
        if !(validation_split > 0.0 && validation_split < 1.0) {
            return Err(MlError::invalid_input(format!(
                "validation split must be in (0, 1), got {validation_split}"
            )));
        }

        let mut shuffled = self.images.clone();
        let mut rng = StdRng::seed_from_u64(seed);
        shuffled.shuffle(&mut rng);

        let num_val = (shuffled.len() as f64 * validation_split) as usize;
        let validation = shuffled.split_off(shuffled.len() - num_val);
        Ok((shuffled, validation))
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// Decode an image, convert to single-channel grayscale and resize to
/// `width` x `height`. Returns raw 0..255 intensities, row-major.
pub fn decode_grayscale(path: &Path, width: usize, height: usize) -> Result<Vec<f32>, MlError> {
    let gray = image::open(path)?.to_luma8();
    let resized = image::imageops::resize(&gray, width as u32, height as u32, FilterType::Triangle);
    Ok(resized.into_raw().into_iter().map(f32::from).collect())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use image::{GrayImage, Luma};
    use std::path::Path;

    /// Write `count` small PNGs per class under `root/<class>/`.
    pub fn write_class_dirs(root: &Path, classes: &[(&str, u8)], count: usize) {
        for (class, shade) in classes {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..count {
                let value = shade.wrapping_add((i % 7) as u8);
                let img = GrayImage::from_pixel(20, 16, Luma([value]));
                img.save(dir.join(format!("{class}.{i}.png"))).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::write_class_dirs;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_index_labels_follow_sorted_class_names() {
        let dir = TempDir::new().unwrap();
        write_class_dirs(dir.path(), &[("dog", 200), ("cat", 20)], 3);
        std::fs::write(dir.path().join("cat").join("notes.txt"), "skip me").unwrap();

        let index = ImageDirectory::index(dir.path()).unwrap();
        assert_eq!(index.class_names, vec!["cat", "dog"]);
        assert_eq!(index.images.len(), 6);
        assert!(
            index
                .images
                .iter()
                .all(|img| img.path.starts_with(dir.path().join(&index.class_names[img.label])))
        );
    }

    #[test]
    fn test_index_missing_directory() {
        let result = ImageDirectory::index(Path::new("/definitely/not/here"));
        assert!(matches!(result, Err(MlError::Dataset(_))));
    }

    #[test]
    fn test_index_without_images() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("cat")).unwrap();
        let result = ImageDirectory::index(dir.path());
        assert!(matches!(result, Err(MlError::Dataset(_))));
    }

    #[test]
    fn test_split_is_seeded_and_eighty_twenty() {
        let dir = TempDir::new().unwrap();
        write_class_dirs(dir.path(), &[("cat", 20), ("dog", 200)], 25);
        let index = ImageDirectory::index(dir.path()).unwrap();

        let (train_a, val_a) = index.split(0.2, 315).unwrap();
        let (train_b, val_b) = index.split(0.2, 315).unwrap();
        assert_eq!(train_a.len(), 40);
        assert_eq!(val_a.len(), 10);
        assert_eq!(train_a, train_b);
        assert_eq!(val_a, val_b);

        let (train_c, _) = index.split(0.2, 316).unwrap();
        assert_ne!(train_a, train_c);
    }

    #[test]
    fn test_split_rejects_out_of_range_fraction() {
        let dir = TempDir::new().unwrap();
        write_class_dirs(dir.path(), &[("cat", 20), ("dog", 200)], 2);
        let index = ImageDirectory::index(dir.path()).unwrap();
        assert!(index.split(0.0, 1).is_err());
        assert!(index.split(1.0, 1).is_err());
    }

    #[test]
    fn test_decode_grayscale_resizes() {
        let dir = TempDir::new().unwrap();
        write_class_dirs(dir.path(), &[("cat", 50)], 1);
        let pixels = decode_grayscale(&dir.path().join("cat").join("cat.0.png"), 8, 6).unwrap();
        assert_eq!(pixels.len(), 48);
        assert!(pixels.iter().all(|&p| (p - 50.0).abs() < 1.0));
    }
}
