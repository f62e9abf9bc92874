//! Infinite, lazily decoded batch streams over a dataset split.
//!
//! An [`ImageDataset`] is a cheap, cloneable description of a split plus its
//! streaming policy. Every call to [`ImageDataset::iter`] starts a fresh
//! stream from the first pass; decoded images are shared between streams of
//! the same dataset when caching is enabled.

use crate::data::source::{LabeledImage, decode_grayscale};
use crate::error::MlError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// How a split is streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPolicy {
    /// Keep decoded images in memory after their first decode.
    pub cache: bool,
    /// Shuffle batch order each pass through a buffer of this many batches.
    pub shuffle_buffer: Option<usize>,
    /// Decode up to this many batches ahead of the consumer.
    pub prefetch_buffer: Option<usize>,
    /// Draw a fresh permutation of the images at the start of every pass.
    pub reshuffle_files: bool,
}

impl StreamPolicy {
    /// Repeat only: batches in split order, decoded on every pass.
    pub fn repeat_only() -> Self {
        Self {
            cache: false,
            shuffle_buffer: None,
            prefetch_buffer: None,
            reshuffle_files: false,
        }
    }

    /// Images in a new random order every pass, decoded on every pass.
    pub fn reshuffled() -> Self {
        Self {
            reshuffle_files: true,
            ..Self::repeat_only()
        }
    }

    /// Cache, shuffle and read ahead with a shared buffer size.
    pub fn prefetched(buffer: usize) -> Self {
        Self {
            cache: true,
            shuffle_buffer: Some(buffer.max(1)),
            prefetch_buffer: Some(buffer.max(1)),
            reshuffle_files: false,
        }
    }
}

/// A batch of single-channel images, row-major `[len, height, width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    pub images: Vec<f32>,
    pub labels: Vec<f32>,
    pub height: usize,
    pub width: usize,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

struct DatasetInner {
    entries: Vec<LabeledImage>,
    width: usize,
    height: usize,
    batch_size: usize,
    policy: StreamPolicy,
    seed: u64,
    decoded: Mutex<Vec<Option<Arc<Vec<f32>>>>>,
}

/// One split of the dataset with its streaming policy.
#[derive(Clone)]
pub struct ImageDataset {
    inner: Arc<DatasetInner>,
}

impl std::fmt::Debug for ImageDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDataset")
            .field("images", &self.inner.entries.len())
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("batch_size", &self.inner.batch_size)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl ImageDataset {
    pub fn new(
        entries: Vec<LabeledImage>,
        width: usize,
        height: usize,
        batch_size: usize,
        policy: StreamPolicy,
        seed: u64,
    ) -> Result<Self, MlError> {
        if batch_size == 0 {
            return Err(MlError::invalid_input("batch size must be positive"));
        }
        if width == 0 || height == 0 {
            return Err(MlError::invalid_input(format!(
                "image size must be positive, got {width}x{height}"
            )));
        }
        let batch_pixels = width
            .checked_mul(height)
            .and_then(|pixels| pixels.checked_mul(batch_size));
        if batch_pixels.is_none() || u32::try_from(width.max(height)).is_err() {
            return Err(MlError::invalid_input(format!(
                "image size {width}x{height} with batch size {batch_size} is too large"
            )));
        }
        let decoded = Mutex::new(vec![None; entries.len()]);
        Ok(Self {
            inner: Arc::new(DatasetInner {
                entries,
                width,
                height,
                batch_size,
                policy,
                seed,
                decoded,
            }),
        })
    }

    /// Number of images in the split.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn entries(&self) -> &[LabeledImage] {
        &self.inner.entries
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    pub fn policy(&self) -> StreamPolicy {
        self.inner.policy
    }

    /// Batches in one pass over the split; the last one may be short.
    pub fn batches_per_pass(&self) -> usize {
        self.len().div_ceil(self.inner.batch_size)
    }

    /// Start a new infinite stream. Yields nothing for an empty split.
    pub fn iter(&self) -> BatchIter {
        BatchIter {
            dataset: self.clone(),
            rng: StdRng::seed_from_u64(self.inner.seed),
            file_order: (0..self.len()).collect(),
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            passes: 0,
        }
    }

    fn image(&self, index: usize) -> Result<Arc<Vec<f32>>, MlError> {
        let inner = &self.inner;
        if inner.policy.cache {
            let decoded = inner.decoded.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(pixels) = &decoded[index] {
                return Ok(Arc::clone(pixels));
            }
        }

        let pixels = Arc::new(decode_grayscale(
            &inner.entries[index].path,
            inner.width,
            inner.height,
        )?);

        if inner.policy.cache {
            let mut decoded = inner.decoded.lock().unwrap_or_else(|e| e.into_inner());
            decoded[index] = Some(Arc::clone(&pixels));
        }
        Ok(pixels)
    }

    /// Batch `batch_index` of a pass whose image order is `file_order`.
    fn batch(&self, batch_index: usize, file_order: &[usize]) -> Result<ImageBatch, MlError> {
        let inner = &self.inner;
        let start = batch_index * inner.batch_size;
        let end = (start + inner.batch_size).min(file_order.len());
        let pixels_per_image = inner.width * inner.height;

        let mut images = Vec::with_capacity((end - start) * pixels_per_image);
        let mut labels = Vec::with_capacity(end - start);
        for &index in &file_order[start..end] {
            images.extend_from_slice(&self.image(index)?);
            labels.push(inner.entries[index].label as f32);
        }

        Ok(ImageBatch {
            images,
            labels,
            height: inner.height,
            width: inner.width,
        })
    }
}

/// Infinite iterator over batches of an [`ImageDataset`].
pub struct BatchIter {
    dataset: ImageDataset,
    rng: StdRng,
    /// Image order of the current pass.
    file_order: Vec<usize>,
    /// Batch indices still to be emitted in the current pass.
    pending: VecDeque<usize>,
    /// Batches decoded ahead of the consumer.
    ready: VecDeque<Result<ImageBatch, MlError>>,
    passes: u64,
}

impl BatchIter {
    /// Completed or started passes over the split.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    fn start_pass(&mut self) {
        let batches = self.dataset.batches_per_pass();
        if self.dataset.policy().reshuffle_files {
            self.file_order.shuffle(&mut self.rng);
        }
        let order = match self.dataset.policy().shuffle_buffer {
            Some(buffer) => buffer_shuffle(0..batches, buffer, &mut self.rng),
            None => (0..batches).collect(),
        };
        self.pending.extend(order);
        self.passes += 1;
    }

    fn read_ahead(&mut self, depth: usize) {
        while self.ready.len() < depth {
            let Some(batch_index) = self.pending.pop_front() else {
                break;
            };
            let batch = self.dataset.batch(batch_index, &self.file_order);
            let failed = batch.is_err();
            self.ready.push_back(batch);
            if failed {
                break;
            }
        }
    }
}

impl Iterator for BatchIter {
    type Item = Result<ImageBatch, MlError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dataset.is_empty() {
            return None;
        }
        if let Some(batch) = self.ready.pop_front() {
            return Some(batch);
        }
        if self.pending.is_empty() {
            self.start_pass();
        }
        let depth = self.dataset.policy().prefetch_buffer.unwrap_or(1).max(1);
        self.read_ahead(depth);
        self.ready.pop_front()
    }
}

/// Emit `items` in the order a fixed-size shuffle buffer would: fill the
/// buffer, then repeatedly emit a random slot and refill it from the input.
/// A buffer at least as large as the input yields a uniform permutation.
pub fn buffer_shuffle<I, R>(items: I, buffer_size: usize, rng: &mut R) -> Vec<usize>
where
    I: IntoIterator<Item = usize>,
    R: Rng,
{
    let buffer_size = buffer_size.max(1);
    let mut input = items.into_iter();
    let mut buffer: Vec<usize> = input.by_ref().take(buffer_size).collect();
    let mut out = Vec::new();

    while !buffer.is_empty() {
        let slot = rng.gen_range(0..buffer.len());
        match input.next() {
            Some(next) => out.push(std::mem::replace(&mut buffer[slot], next)),
            None => out.push(buffer.swap_remove(slot)),
        }
    }
    out
}
