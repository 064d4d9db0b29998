//! Batched autoregressive grapheme-to-phoneme decoding.
//!
//! A raw next-symbol graph is wrapped by [`EarlyStopGraph`], which tracks
//! which rows emitted the end token. [`PhonemizerStage`] runs one wrapped
//! evaluation per decode step through the cooperative scheduler until every
//! row of the batch has finished.

use std::collections::{BTreeSet, HashMap};

use ndarray::{Array1, Array2, Axis, Ix2, concatenate};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::graph::{GraphExecutor, no_output, not_ready};
use crate::model::{EOS_TOKEN, SOS_TOKEN, Vocabularies};
use crate::scheduler::{ChunkType, CooperativeStage};
use crate::tensor::Tensor;

/// Decode steps allowed per source symbol before giving up on a batch.
const MAX_STEPS_PER_SYMBOL: usize = 8;

/// Early stopping bookkeeping around a raw next-symbol graph.
///
/// Inputs: `[source [B,S], target [B,L], mask [B,L], finished [B]]`.
/// Outputs: `[target [B,L+1], mask [B,L+1], finished [B], num_finished [1]]`.
pub struct EarlyStopGraph {
    raw: Box<dyn GraphExecutor>,
    eos: i32,
    mask: Array2<f32>,
    finished: Vec<f32>,
    outputs: Vec<Tensor>,
    done: bool,
}

impl EarlyStopGraph {
    pub fn new(raw: Box<dyn GraphExecutor>, eos: i32) -> Self {
        Self { raw, eos, mask: Array2::zeros((0, 0)), finished: Vec::new(), outputs: Vec::new(), done: false }
    }

    fn finish(&mut self) -> Result<()> {
        let target = self.raw.output(0)?;
        let target = target.as_int()?.clone().into_dimensionality::<Ix2>().map_err(|e| EngineError::shape(format!("phonemizer target: {}", e)))?;
        let rows = target.nrows();
        if rows != self.finished.len() || rows != self.mask.nrows() {
            return Err(EngineError::shape(format!("phonemizer batch changed from {} to {} rows", self.finished.len(), rows)));
        }

        let last = target.ncols().checked_sub(1).ok_or_else(|| EngineError::shape("phonemizer returned an empty target"))?;
        let cond: Vec<bool> = (0..rows).map(|r| target[[r, last]] == self.eos || self.finished[r] > 0.0).collect();

        let column = Array2::from_shape_vec((rows, 1), cond.iter().map(|&c| if c { 0.0 } else { 1.0 }).collect())
            .map_err(|e| EngineError::shape(e.to_string()))?;
        let mask = concatenate(Axis(1), &[self.mask.view(), column.view()]).map_err(|e| EngineError::shape(e.to_string()))?;
        let sums = mask.sum_axis(Axis(1));
        let finished: Array1<f32> = (0..rows).map(|r| if cond[r] { sums[r] } else { 0.0 }).collect();
        let num_finished = cond.iter().filter(|&&c| c).count() as i32;

        self.outputs = vec![Tensor::Int(target.into_dyn()), Tensor::Float(mask.into_dyn()), Tensor::Float(finished.into_dyn()), Tensor::scalar_i32(num_finished)];
        Ok(())
    }
}

impl GraphExecutor for EarlyStopGraph {
    fn name(&self) -> &str {
        self.raw.name()
    }

    fn start(&mut self, inputs: Vec<Tensor>) -> Result<()> {
        let [source, target, mask, finished]: [Tensor; 4] =
            inputs.try_into().map_err(|v: Vec<Tensor>| EngineError::graph(self.raw.name(), format!("expected 4 inputs, got {}", v.len())))?;
        self.mask = mask.as_float()?.clone().into_dimensionality::<Ix2>().map_err(|e| EngineError::shape(format!("phonemizer mask: {}", e)))?;
        self.finished = finished.to_f32_vec();
        self.outputs.clear();
        self.done = false;

        let active: Vec<i32> = self.finished.iter().map(|&f| i32::from(f < 1.0)).collect();
        let active = Tensor::int(&[active.len()], active)?;
        self.raw.start(vec![source, target, active])
    }

    fn step(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        if self.raw.step()? {
            return Ok(true);
        }
        self.finish()?;
        self.done = true;
        Ok(false)
    }

    fn output_count(&self) -> usize {
        4
    }

    fn output(&self, index: usize) -> Result<Tensor> {
        if !self.done {
            return Err(not_ready(self.name()));
        }
        self.outputs.get(index).cloned().ok_or_else(|| no_output(self.name(), index, self.outputs.len()))
    }
}

/// Phonemizer of one language pack.
pub struct PhonemizerStage {
    stage: CooperativeStage,
    graph: Mutex<EarlyStopGraph>,
    vocab: Vocabularies,
    sos: i32,
    eos: i32,
}

impl PhonemizerStage {
    /// Wrap a raw phonemizer graph.
    ///
    /// # Errors
    /// Returns a resource error if the vocabularies lack `<sos>` or `<eos>`.
    pub fn new(stage: CooperativeStage, raw: Box<dyn GraphExecutor>, vocab: Vocabularies) -> Result<Self> {
        let token = |map: &HashMap<String, i32>, name: &str, which: &str| {
            map.get(name).copied().ok_or_else(|| EngineError::resource(format!("{} vocabulary has no {} token", which, name)))
        };
        let eos = token(&vocab.phoneme_vocab, EOS_TOKEN, "phoneme")?;
        let sos = token(&vocab.phoneme_vocab, SOS_TOKEN, "phoneme")?;
        token(&vocab.grapheme_vocab, SOS_TOKEN, "grapheme")?;
        token(&vocab.grapheme_vocab, EOS_TOKEN, "grapheme")?;
        Ok(Self { stage, graph: Mutex::new(EarlyStopGraph::new(raw, eos)), vocab, sos, eos })
    }

    pub fn vocab(&self) -> &Vocabularies {
        &self.vocab
    }

    /// Encode words as padded grapheme id rows: `<sos>`, the lowercased
    /// graphemes, `<eos>`, then zeros up to the longest word plus two.
    fn encode_batch(&self, words: &[&str]) -> Result<Tensor> {
        let sos = self.vocab.grapheme_vocab.get(SOS_TOKEN).copied().unwrap_or_default();
        let eos = self.vocab.grapheme_vocab.get(EOS_TOKEN).copied().unwrap_or_default();
        let width = words.iter().map(|w| w.chars().count()).max().unwrap_or(0) + 2;

        let mut data = Vec::with_capacity(words.len() * width);
        for word in words {
            let mut row = vec![sos];
            for c in word.chars().flat_map(char::to_lowercase) {
                match self.vocab.grapheme_id(c) {
                    Some(id) => row.push(id),
                    None => debug!("Skipping unknown grapheme {:?} in {:?}", c, word),
                }
            }
            row.push(eos);
            row.resize(width, 0);
            data.extend(row);
        }
        Tensor::int(&[words.len(), width], data)
    }

    fn decode_row(&self, ids: &[i32]) -> String {
        ids.iter()
            .filter(|&&id| id != self.sos && id != self.eos)
            .filter_map(|id| self.vocab.phoneme_ivocab.get(id))
            .map(String::as_str)
            .collect()
    }

    /// Phonemize a batch of words.
    ///
    /// Blank and duplicate words are dropped. Each decode step is one
    /// cooperative graph evaluation.
    ///
    /// # Returns
    /// Map from each word to its phoneme string.
    ///
    /// # Errors
    /// Graph failures abort the whole batch.
    pub async fn phonemize(&self, words: &[String]) -> Result<HashMap<String, String>> {
        let unique: BTreeSet<&str> = words.iter().map(|w| w.trim()).filter(|w| !w.is_empty()).collect();
        let words: Vec<&str> = unique.into_iter().collect();
        if words.is_empty() {
            return Ok(HashMap::new());
        }

        let batch = words.len();
        let source = self.encode_batch(&words)?;
        let max_steps = source.shape()[1] * MAX_STEPS_PER_SYMBOL;

        let mut target = Tensor::int(&[batch, 1], vec![self.sos; batch])?;
        let mut mask = Tensor::float(&[batch, 1], vec![1.0; batch])?;
        let mut finished = Tensor::zeros_f32(&[batch]);

        let mut graph = self.graph.lock().await;
        let mut steps = 0;
        loop {
            let out = self.stage.infer(&mut *graph, ChunkType::Whole, vec![source.clone(), target, mask, finished], &[0, 1, 2, 3]).await?;
            let [t, m, f, num]: [Tensor; 4] = out.try_into().map_err(|_| EngineError::graph(graph.name(), "expected four outputs"))?;
            (target, mask, finished) = (t, m, f);
            steps += 1;

            if num.first_i32()? as usize >= batch {
                break;
            }
            if steps >= max_steps {
                warn!("Phonemizer stopped after {} steps with unfinished rows", steps);
                break;
            }
        }
        debug!("Phonemized {} words in {} steps", batch, steps);

        let width = target.shape()[1];
        let ids = target.to_i32_vec();
        let stops = finished.to_f32_vec();
        let result = words
            .iter()
            .enumerate()
            .map(|(row, word)| {
                let stop = match stops[row] as usize {
                    0 => width,
                    p => p.min(width),
                };
                let row_ids = &ids[row * width..(row + 1) * width];
                (word.to_string(), self.decode_row(&row_ids[1.min(stop)..stop]))
            })
            .collect();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::graph::{GraphLoader, SyntheticLoader};
    use crate::scheduler::{FrameClock, HeavyLayerRegistry, StageBudget, StageKind};

    fn spawn_ticker(clock: FrameClock) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                clock.begin_frame();
                tokio::task::yield_now().await;
            }
        })
    }

    fn phonemizer(clock: FrameClock) -> PhonemizerStage {
        let pack = SyntheticLoader::demo_language_pack();
        let raw = SyntheticLoader::new().load_phonemizer(&pack).unwrap();
        let budget = StageBudget { budget: Duration::from_secs(1), adaptive: true, overshoot_margin: 1.4 };
        let stage = CooperativeStage::new(StageKind::Phonemizer, budget, Arc::new(HeavyLayerRegistry::new(4)), clock);
        PhonemizerStage::new(stage, raw, pack.vocabularies).unwrap()
    }

    #[tokio::test]
    async fn test_phonemize_batch_of_different_lengths() {
        let clock = FrameClock::new();
        let ticker = spawn_ticker(clock.clone());
        let stage = phonemizer(clock);

        let words = vec!["Hello".to_string(), "world".to_string(), "a".to_string(), "hello".to_string(), " ".to_string()];
        let result = stage.phonemize(&words).await.unwrap();
        ticker.abort();

        // Duplicates are kept verbatim, the blank entry is dropped
        assert_eq!(result.len(), 4);
        assert_eq!(result["world"], "world");
        assert_eq!(result["a"], "a");
        assert_eq!(result["Hello"], "hello");
    }

    #[tokio::test]
    async fn test_empty_batch_skips_graph() {
        let stage = phonemizer(FrameClock::new());
        assert!(stage.phonemize(&[]).await.unwrap().is_empty());
    }

    #[test]
    fn test_early_stop_bookkeeping() {
        struct Echo(Vec<Tensor>, bool);
        impl GraphExecutor for Echo {
            fn name(&self) -> &str {
                "echo"
            }
            fn start(&mut self, inputs: Vec<Tensor>) -> Result<()> {
                self.0 = inputs;
                self.1 = false;
                Ok(())
            }
            fn step(&mut self) -> Result<bool> {
                self.1 = true;
                Ok(false)
            }
            fn output_count(&self) -> usize {
                1
            }
            fn output(&self, _index: usize) -> Result<Tensor> {
                // Row 0 emits eos (2), row 1 emits 7
                let ids = self.0[1].to_i32_vec();
                let width = self.0[1].shape()[1];
                let mut out = ids[..width].to_vec();
                out.push(2);
                out.extend_from_slice(&ids[width..]);
                out.push(7);
                Tensor::int(&[2, width + 1], out)
            }
        }

        let mut graph = EarlyStopGraph::new(Box::new(Echo(Vec::new(), false)), 2);
        let inputs = vec![
            Tensor::int(&[2, 3], vec![0; 6]).unwrap(),
            Tensor::int(&[2, 2], vec![1, 5, 1, 6]).unwrap(),
            Tensor::float(&[2, 2], vec![1.0; 4]).unwrap(),
            Tensor::zeros_f32(&[2]),
        ];
        let out = graph.execute(inputs).unwrap();
        assert_eq!(out[0].shape(), &[2, 3]);
        assert_eq!(out[1].to_f32_vec(), vec![1.0, 1.0, 0.0, 1.0, 1.0, 1.0]);
        // Row 0 stops after two tokens: <sos> and one phoneme
        assert_eq!(out[2].to_f32_vec(), vec![2.0, 0.0]);
        assert_eq!(out[3].first_i32().unwrap(), 1);
    }
}
