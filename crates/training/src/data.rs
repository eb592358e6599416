use std::fs;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::config::{DataLayout, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Padding applied on each side before the random crop.
const CROP_PADDING: usize = 4;

/// Per-channel normalization constants for 3-channel CIFAR-style images.
const CIFAR_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
const CIFAR_STD: [f32; 3] = [0.2470, 0.2435, 0.2616];

/// Batch returned by dataset loaders.
#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
    pub examples: usize,
    pub epoch: usize,
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Options controlling how a split is iterated.
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub batch_size: usize,
    /// Number of passes over the split encoded inside the sequence; the
    /// loader yields `None` once they are exhausted.
    pub epochs: usize,
    pub shuffle: bool,
    pub augment: bool,
    pub layout: DataLayout,
    pub dtype: DType,
    pub seed: u64,
}

impl DatasetOptions {
    /// Single deterministic pass, no augmentation. Used by the evaluator.
    pub fn evaluation(batch_size: usize, layout: DataLayout, dtype: DType) -> Self {
        Self {
            batch_size,
            epochs: 1,
            shuffle: false,
            augment: false,
            layout,
            dtype,
            seed: 0,
        }
    }
}

/// An in-memory split of serialized records. Each record is one label byte
/// followed by `channels * height * width` image bytes in channel-major
/// order, the CIFAR-10 binary layout. The split `name` maps to
/// `<name>.bin` under the data directory.
#[derive(Debug, Clone)]
pub struct RecordDataset {
    records: Arc<Vec<u8>>,
    split: String,
    channels: usize,
    height: usize,
    width: usize,
}

impl RecordDataset {
    pub fn open(data_dir: &Path, split: &str, input_shape: [usize; 3]) -> Result<Self> {
        let path = data_dir.join(format!("{split}.bin"));
        if !path.is_file() {
            return Err(TrainingError::initialization(format!(
                "dataset split file {} does not exist",
                path.display()
            )));
        }
        let records = fs::read(&path)?;

        let [channels, height, width] = input_shape;
        let record_len = 1 + channels * height * width;
        if records.is_empty() {
            return Err(TrainingError::initialization(format!(
                "dataset split file {} is empty",
                path.display()
            )));
        }
        if records.len() % record_len != 0 {
            return Err(TrainingError::initialization(format!(
                "dataset split file {} has {} bytes, not a multiple of the {}-byte record size",
                path.display(),
                records.len(),
                record_len
            )));
        }

        Ok(Self {
            records: Arc::new(records),
            split: split.to_string(),
            channels,
            height,
            width,
        })
    }

    pub fn split(&self) -> &str {
        &self.split
    }

    fn record_len(&self) -> usize {
        1 + self.channels * self.height * self.width
    }

    /// Number of examples in the split.
    pub fn len(&self) -> usize {
        self.records.len() / self.record_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, index: usize) -> &[u8] {
        let len = self.record_len();
        let start = index * len;
        &self.records[start..start + len]
    }

    /// Builds a restartable loader over this split. Shuffling order is a
    /// pure function of `(seed, epoch)` so a resumed run replays the same
    /// sequence as an uninterrupted one.
    pub fn loader(&self, options: DatasetOptions, device: &Device) -> RecordLoader {
        RecordLoader::new(self.clone(), options, device.clone())
    }
}

/// Lazily-evaluated batch sequence over a [`RecordDataset`].
pub struct RecordLoader {
    dataset: RecordDataset,
    options: DatasetOptions,
    device: Device,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    rng: StdRng,
}

impl RecordLoader {
    fn new(dataset: RecordDataset, options: DatasetOptions, device: Device) -> Self {
        let mut loader = Self {
            order: (0..dataset.len()).collect(),
            rng: StdRng::seed_from_u64(options.seed),
            cursor: 0,
            epoch: 0,
            dataset,
            options,
            device,
        };
        loader.reshuffle();
        loader
    }

    fn reshuffle(&mut self) {
        if self.options.shuffle {
            // Reseeding per epoch keeps the order independent of how many
            // random draws augmentation consumed.
            let mut rng =
                StdRng::seed_from_u64(self.options.seed.wrapping_add(self.epoch as u64));
            self.order.shuffle(&mut rng);
        }
    }

    fn build_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.order.len() {
            if self.epoch + 1 >= self.options.epochs {
                return Ok(None);
            }
            self.epoch += 1;
            self.cursor = 0;
            self.reshuffle();
        }

        let end = (self.cursor + self.options.batch_size).min(self.order.len());
        let indices: Vec<usize> = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let examples = indices.len();
        let (channels, height, width) =
            (self.dataset.channels, self.dataset.height, self.dataset.width);
        let image_len = channels * height * width;

        let mut labels = Vec::with_capacity(examples);
        let mut pixels = vec![0f32; examples * image_len];
        let mut scratch = vec![0u8; image_len];

        for (slot, &index) in indices.iter().enumerate() {
            let record = self.dataset.record(index);
            labels.push(record[0] as u32);

            let image = &record[1..];
            let image = if self.options.augment {
                augment_into(&mut self.rng, (channels, height, width), image, &mut scratch);
                &scratch[..]
            } else {
                image
            };

            let base = slot * image_len;
            for c in 0..channels {
                let mean = CIFAR_MEAN.get(c).copied().unwrap_or(0.5);
                let std = CIFAR_STD.get(c).copied().unwrap_or(0.25);
                for y in 0..height {
                    for x in 0..width {
                        let value = image[c * height * width + y * width + x] as f32 / 255.0;
                        let normalized = (value - mean) / std;
                        let offset = match self.options.layout {
                            DataLayout::ChannelsFirst => c * height * width + y * width + x,
                            DataLayout::ChannelsLast => (y * width + x) * channels + c,
                        };
                        pixels[base + offset] = normalized;
                    }
                }
            }
        }

        let shape = match self.options.layout {
            DataLayout::ChannelsFirst => (examples, channels, height, width),
            DataLayout::ChannelsLast => (examples, height, width, channels),
        };
        let mut images = Tensor::from_vec(pixels, shape, &self.device)
            .map_err(|err| TrainingError::runtime(format!("failed to materialize image tensor: {err}")))?;
        if self.options.dtype != DType::F32 {
            images = images
                .to_dtype(self.options.dtype)
                .map_err(|err| TrainingError::runtime(format!("failed to cast image tensor: {err}")))?;
        }
        let labels = Tensor::from_vec(labels, examples, &self.device)
            .map_err(|err| TrainingError::runtime(format!("failed to materialize label tensor: {err}")))?;

        Ok(Some(Batch {
            images,
            labels,
            examples,
            epoch: self.epoch,
        }))
    }

}

/// Zero-pad by [`CROP_PADDING`] on every side, take a random crop of the
/// original size, then flip horizontally with probability one half.
fn augment_into(rng: &mut StdRng, dims: (usize, usize, usize), src: &[u8], dst: &mut [u8]) {
    let (channels, height, width) = dims;
    let top = rng.gen_range(0..=2 * CROP_PADDING) as isize - CROP_PADDING as isize;
    let left = rng.gen_range(0..=2 * CROP_PADDING) as isize - CROP_PADDING as isize;
    let flip = rng.gen_bool(0.5);

    for c in 0..channels {
        let plane = c * height * width;
        for y in 0..height {
            let src_y = y as isize + top;
            for x in 0..width {
                let src_x = x as isize + left;
                let value = if src_y >= 0
                    && src_y < height as isize
                    && src_x >= 0
                    && src_x < width as isize
                {
                    src[plane + src_y as usize * width + src_x as usize]
                } else {
                    0
                };
                let dst_x = if flip { width - 1 - x } else { x };
                dst[plane + y * width + dst_x] = value;
            }
        }
    }
}

impl DataLoader for RecordLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>> {
        Box::pin(async move { self.build_batch() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_split(dir: &Path, split: &str, examples: usize, shape: [usize; 3]) {
        let [c, h, w] = shape;
        let mut file = fs::File::create(dir.join(format!("{split}.bin"))).unwrap();
        for index in 0..examples {
            let mut record = vec![(index % 4) as u8];
            record.extend((0..c * h * w).map(|i| ((index * 31 + i * 7) % 256) as u8));
            file.write_all(&record).unwrap();
        }
    }

    fn options(batch_size: usize, epochs: usize, shuffle: bool) -> DatasetOptions {
        DatasetOptions {
            batch_size,
            epochs,
            shuffle,
            augment: false,
            layout: DataLayout::ChannelsFirst,
            dtype: DType::F32,
            seed: 7,
        }
    }

    #[test]
    fn truncated_split_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("train.bin"), vec![0u8; 100]).unwrap();
        let err = RecordDataset::open(dir.path(), "train", [3, 4, 4]).unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)));
    }

    #[test]
    fn missing_split_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = RecordDataset::open(dir.path(), "train", [3, 4, 4]).unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)));
    }

    #[test]
    fn loader_yields_all_examples_with_partial_final_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", 10, [3, 4, 4]);
        let dataset = RecordDataset::open(dir.path(), "train", [3, 4, 4]).unwrap();
        assert_eq!(dataset.len(), 10);

        let mut loader =
            BlockingDataLoader::new(dataset.loader(options(4, 1, false), &Device::Cpu));
        let mut counts = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            assert_eq!(batch.images.dims()[0], batch.examples);
            counts.push(batch.examples);
        }
        assert_eq!(counts, vec![4, 4, 2]);
    }

    #[test]
    fn epochs_are_encoded_in_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", 4, [3, 4, 4]);
        let dataset = RecordDataset::open(dir.path(), "train", [3, 4, 4]).unwrap();

        let mut loader =
            BlockingDataLoader::new(dataset.loader(options(4, 3, false), &Device::Cpu));
        let mut epochs = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            epochs.push(batch.epoch);
        }
        assert_eq!(epochs, vec![0, 1, 2]);
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn deterministic_order_without_shuffle() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", 6, [3, 4, 4]);
        let dataset = RecordDataset::open(dir.path(), "train", [3, 4, 4]).unwrap();

        let mut first =
            BlockingDataLoader::new(dataset.loader(options(6, 1, false), &Device::Cpu));
        let mut second =
            BlockingDataLoader::new(dataset.loader(options(6, 1, false), &Device::Cpu));
        let a = first.next_batch().unwrap().unwrap();
        let b = second.next_batch().unwrap().unwrap();
        assert_eq!(
            a.labels.to_vec1::<u32>().unwrap(),
            b.labels.to_vec1::<u32>().unwrap()
        );
    }

    #[test]
    fn shuffled_epochs_replay_for_equal_seeds() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", 16, [3, 4, 4]);
        let dataset = RecordDataset::open(dir.path(), "train", [3, 4, 4]).unwrap();

        let mut first =
            BlockingDataLoader::new(dataset.loader(options(16, 2, true), &Device::Cpu));
        let mut second =
            BlockingDataLoader::new(dataset.loader(options(16, 2, true), &Device::Cpu));
        for _ in 0..2 {
            let a = first.next_batch().unwrap().unwrap();
            let b = second.next_batch().unwrap().unwrap();
            assert_eq!(
                a.labels.to_vec1::<u32>().unwrap(),
                b.labels.to_vec1::<u32>().unwrap()
            );
        }
    }

    #[test]
    fn augmentation_preserves_shape_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", 5, [3, 8, 8]);
        let dataset = RecordDataset::open(dir.path(), "train", [3, 8, 8]).unwrap();

        let mut opts = options(5, 1, false);
        opts.augment = true;
        let mut loader = BlockingDataLoader::new(dataset.loader(opts, &Device::Cpu));
        let batch = loader.next_batch().unwrap().unwrap();
        assert_eq!(batch.images.dims(), [5, 3, 8, 8]);
        assert_eq!(batch.labels.to_vec1::<u32>().unwrap().len(), 5);
    }

    #[test]
    fn channels_last_layout_transposes_batches() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", 3, [3, 4, 4]);
        let dataset = RecordDataset::open(dir.path(), "train", [3, 4, 4]).unwrap();

        let mut opts = options(3, 1, false);
        opts.layout = DataLayout::ChannelsLast;
        let mut loader = BlockingDataLoader::new(dataset.loader(opts, &Device::Cpu));
        let batch = loader.next_batch().unwrap().unwrap();
        assert_eq!(batch.images.dims(), [3, 4, 4, 3]);
    }
}
