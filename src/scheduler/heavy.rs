//! Learned heavy-step bookkeeping.
//!
//! A heavy index is a step counter value after which a stage should yield,
//! because the step that follows it overshot the frame budget in an earlier
//! run. Sets are bounded and keyed by stage and chunk type.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

/// Pipeline stage owning a heavy set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Encoder,
    DecoderPreprocess,
    Decoder,
    Vocoder,
    Phonemizer,
}

/// Invocation flavour of a stage. Non-chunked stages use `Whole`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Whole,
    First,
    Middle,
    Last,
}

/// Bounded set of step indices with random replacement when full.
#[derive(Debug, Clone)]
pub struct HeavyLayerSet {
    indices: Vec<usize>,
    capacity: usize,
}

impl HeavyLayerSet {
    pub fn new(capacity: usize) -> Self {
        Self { indices: Vec::with_capacity(capacity), capacity }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }

    /// Insert an index, evicting a random entry when the set is full.
    ///
    /// # Returns
    /// `false` if the index was already present.
    pub fn insert(&mut self, index: usize) -> bool {
        if self.capacity == 0 || self.contains(index) {
            return false;
        }
        if self.indices.len() < self.capacity {
            self.indices.push(index);
        } else {
            let slot = rand::thread_rng().gen_range(0..self.indices.len());
            self.indices[slot] = index;
        }
        true
    }

    /// Record that the step after `counter - 1` overshot.
    ///
    /// Adds `counter - 1`, or `counter - 2` when `counter - 1` is already
    /// known, so later runs yield one step earlier.
    ///
    /// # Returns
    /// The index that was recorded, if any.
    pub fn record_overshoot(&mut self, counter: usize) -> Option<usize> {
        let previous = counter.checked_sub(1)?;
        let index = if self.contains(previous) { counter.checked_sub(2)? } else { previous };
        self.insert(index).then_some(index)
    }
}

/// All heavy sets for one loaded module.
#[derive(Debug)]
pub struct HeavyLayerRegistry {
    sets: Mutex<HashMap<(StageKind, ChunkType), HeavyLayerSet>>,
    capacity: usize,
}

impl HeavyLayerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { sets: Mutex::new(HashMap::new()), capacity }
    }

    pub fn contains(&self, stage: StageKind, chunk: ChunkType, index: usize) -> bool {
        self.sets.lock().get(&(stage, chunk)).is_some_and(|s| s.contains(index))
    }

    /// Apply the overshoot rule to the set for `(stage, chunk)`.
    pub fn record_overshoot(&self, stage: StageKind, chunk: ChunkType, counter: usize) -> Option<usize> {
        let mut sets = self.sets.lock();
        let set = sets.entry((stage, chunk)).or_insert_with(|| HeavyLayerSet::new(self.capacity));
        let recorded = set.record_overshoot(counter);
        if let Some(index) = recorded {
            debug!("Heavy step {} recorded for {:?}/{:?} ({} known)", index, stage, chunk, set.len());
        }
        recorded
    }

    /// Seed a set with externally known indices. Duplicates are skipped.
    pub fn add_custom_skip_indices(&self, stage: StageKind, chunk: ChunkType, indices: &[usize]) {
        let mut sets = self.sets.lock();
        let set = sets.entry((stage, chunk)).or_insert_with(|| HeavyLayerSet::new(self.capacity));
        for &index in indices {
            set.insert(index);
        }
    }

    /// Snapshot of the indices known for `(stage, chunk)`.
    pub fn snapshot(&self, stage: StageKind, chunk: ChunkType) -> Vec<usize> {
        self.sets.lock().get(&(stage, chunk)).map(|s| s.iter().collect()).unwrap_or_default()
    }
}
