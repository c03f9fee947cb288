use std::collections::BTreeMap;

use candle_core::Tensor;
use futures::future::{self, BoxFuture, FutureExt};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{error::Result, TrainingError};

/// Keys the harness knows how to route into a model.
pub const INPUT_KEYS: [&str; 6] = [
    "input_ids",
    "attention_mask",
    "token_type_ids",
    "labels",
    "start_positions",
    "end_positions",
];

/// A collated batch keyed by feature name.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    features: BTreeMap<String, Tensor>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(key, tensor);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.features.insert(key.into(), tensor);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.features.get(key)
    }

    pub fn require(&self, key: &str) -> Result<&Tensor> {
        self.get(key)
            .ok_or_else(|| TrainingError::runtime(format!("batch is missing '{key}'")))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>>;

    /// Rewinds to the start of the next epoch.
    fn start_epoch(&mut self, epoch: usize) -> Result<()>;

    fn num_batches(&self) -> Option<usize> {
        None
    }
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

    pub fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.inner.start_epoch(epoch)
    }

    pub fn num_batches(&self) -> Option<usize> {
        self.inner.num_batches()
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Pre-collated batches held in memory, optionally reshuffled each epoch
/// with a seed derived from `(seed, epoch)`.
pub struct InMemoryDataLoader {
    batches: Vec<Batch>,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
    seed: u64,
}

impl InMemoryDataLoader {
    pub fn new(batches: Vec<Batch>) -> Self {
        let order = (0..batches.len()).collect();
        Self {
            batches,
            order,
            cursor: 0,
            shuffle: false,
            seed: 0,
        }
    }

    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }
}

impl DataLoader for InMemoryDataLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>> {
        let batch = self
            .order
            .get(self.cursor)
            .and_then(|&idx| self.batches.get(idx))
            .cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        future::ready(Ok(batch)).boxed()
    }

    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.cursor = 0;
        self.order = (0..self.batches.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            self.order.shuffle(&mut rng);
        }
        Ok(())
    }

    fn num_batches(&self) -> Option<usize> {
        Some(self.batches.len())
    }
}
