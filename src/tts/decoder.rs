//! Decoder stage: a whole-sequence preprocessing pass, then causal chunks.

use tokio::sync::Mutex;
use tracing::debug;

use super::encoder::EncoderOutput;
use crate::error::{EngineError, Result};
use crate::graph::GraphExecutor;
use crate::scheduler::{ChunkType, CooperativeStage};
use crate::tensor::Tensor;

/// Blend coefficient for the first window and every later one.
const FIRST_ALPHA: f32 = 0.0;
const NEXT_ALPHA: f32 = 1.0;

/// One planned decoder window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub index: usize,
    pub start: usize,
    pub chunk_type: ChunkType,
    pub is_final: bool, // Last window of the request
}

/// Plan the decoder windows over `total` frames.
///
/// Windows start every `hop` frames. A window at frame 0 is `First`, one with
/// at least `chunk_length` frames left is `Middle`, and anything shorter is
/// `Last`, which ends the schedule. When `total <= hop` the single `First`
/// window is final.
pub fn chunk_schedule(total: usize, chunk_length: usize, hop: usize) -> Vec<ChunkPlan> {
    let mut plans = Vec::new();
    if hop == 0 {
        return plans;
    }

    let mut start = 0;
    while start < total {
        let chunk_type = if start == 0 {
            ChunkType::First
        } else if total - start >= chunk_length {
            ChunkType::Middle
        } else {
            ChunkType::Last
        };
        plans.push(ChunkPlan { index: plans.len(), start, chunk_type, is_final: false });
        if chunk_type == ChunkType::Last {
            break;
        }
        start += hop;
    }

    if let Some(last) = plans.last_mut() {
        last.is_final = true;
    }
    plans
}

/// Tensors derived once per request by the preprocessing pass.
#[derive(Debug, Clone)]
pub struct DecoderState {
    pub latent: Tensor,   // Preprocess output 0, [1, C, T]
    pub encoded: Tensor,  // Preprocess output 1
    pub mask: Tensor,     // Preprocess output 3
    pub carry: Tensor,    // Overlap fed to the next window, starts as preprocess output 2
    pub loudness: Tensor, // Encoder loudness features, forwarded to the first vocoder call
}

impl DecoderState {
    /// Sequence length in frames, the last axis of the latent.
    pub fn total_frames(&self) -> usize {
        self.latent.shape().last().copied().unwrap_or(0)
    }
}

pub struct DecoderStage {
    preprocess_stage: CooperativeStage,
    preprocess_graph: Mutex<Box<dyn GraphExecutor>>,
    chunk_stage: CooperativeStage,
    chunk_graph: Mutex<Box<dyn GraphExecutor>>,
    chunk_length: usize,
    hop: usize,
}

impl DecoderStage {
    /// Create the decoder stage.
    ///
    /// # Arguments
    /// * `preprocess_stage` - Stage driving the preprocessing graph
    /// * `preprocess_graph` - Whole-sequence preprocessing graph
    /// * `chunk_stage` - Stage driving the chunk graph
    /// * `chunk_graph` - Causal per-window graph
    /// * `chunk_length` - Frames per window
    /// * `hop` - Frames between window starts
    pub fn new(
        preprocess_stage: CooperativeStage,
        preprocess_graph: Box<dyn GraphExecutor>,
        chunk_stage: CooperativeStage,
        chunk_graph: Box<dyn GraphExecutor>,
        chunk_length: usize,
        hop: usize,
    ) -> Self {
        Self {
            preprocess_stage,
            preprocess_graph: Mutex::new(preprocess_graph),
            chunk_stage,
            chunk_graph: Mutex::new(chunk_graph),
            chunk_length,
            hop,
        }
    }

    pub fn chunk_length(&self) -> usize {
        self.chunk_length
    }

    /// Plan the windows for a preprocessed request.
    pub fn schedule(&self, state: &DecoderState) -> Vec<ChunkPlan> {
        chunk_schedule(state.total_frames(), self.chunk_length, self.hop)
    }

    /// Run the preprocessing pass over the encoder features and mask.
    ///
    /// # Errors
    /// Graph failures, or a graph that returns fewer than four outputs.
    pub async fn preprocess(&self, encoded: EncoderOutput) -> Result<DecoderState> {
        let EncoderOutput { features, mask, loudness } = encoded;
        let mut graph = self.preprocess_graph.lock().await;
        let out = self.preprocess_stage.infer(graph.as_mut(), ChunkType::Whole, vec![features, mask], &[0, 1, 2, 3]).await?;
        let [latent, encoded, carry, mask]: [Tensor; 4] = out.try_into().map_err(|_| EngineError::graph(graph.name(), "expected four outputs"))?;
        if latent.shape().len() != 3 {
            return Err(EngineError::shape(format!("decoder latent must be [1, C, T], got {:?}", latent.shape())));
        }
        debug!("Decoder preprocess: {} frames", latent.shape()[2]);
        Ok(DecoderState { latent, encoded, mask, carry, loudness })
    }

    /// Decode one window and advance the carry.
    ///
    /// # Arguments
    /// * `state` - Per-request tensors; the carry is replaced
    /// * `plan` - Window to decode
    /// * `actor_key` - Speaker actor key
    ///
    /// # Returns
    /// The window's features, output 0 of the chunk graph.
    pub async fn decode_chunk(&self, state: &mut DecoderState, plan: &ChunkPlan, actor_key: i32) -> Result<Tensor> {
        let alpha = if plan.chunk_type == ChunkType::First { FIRST_ALPHA } else { NEXT_ALPHA };
        let inputs = vec![
            Tensor::scalar_i32(plan.index as i32),
            Tensor::scalar_i32(self.chunk_length as i32),
            state.latent.clone(),
            state.encoded.clone(),
            state.mask.clone(),
            Tensor::scalar_f32(alpha),
            Tensor::int(&[1, 1], vec![actor_key])?,
            state.carry.clone(),
        ];

        let mut graph = self.chunk_graph.lock().await;
        let out = self.chunk_stage.infer(graph.as_mut(), plan.chunk_type, inputs, &[0, 2]).await?;
        let [features, carry]: [Tensor; 2] = out.try_into().map_err(|_| EngineError::graph(graph.name(), "expected features and carry"))?;
        state.carry = carry;
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(plans: &[ChunkPlan]) -> Vec<ChunkType> {
        plans.iter().map(|p| p.chunk_type).collect()
    }

    #[test]
    fn test_schedule_first_middle_last() {
        // chunk 10, boundary 2, hop 8
        let plans = chunk_schedule(30, 10, 8);
        assert_eq!(types(&plans), vec![ChunkType::First, ChunkType::Middle, ChunkType::Middle, ChunkType::Last]);
        assert_eq!(plans.iter().map(|p| p.start).collect::<Vec<_>>(), vec![0, 8, 16, 24]);
        assert_eq!(plans.iter().map(|p| p.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(plans[3].is_final);
        assert!(plans[..3].iter().all(|p| !p.is_final));
    }

    #[test]
    fn test_schedule_remaining_exactly_chunk_is_middle() {
        // 18 - 8 = 10 frames left, still a full window
        let plans = chunk_schedule(18, 10, 8);
        assert_eq!(types(&plans), vec![ChunkType::First, ChunkType::Middle, ChunkType::Last]);
    }

    #[test]
    fn test_schedule_short_request_single_final_first() {
        let plans = chunk_schedule(8, 10, 8);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].chunk_type, ChunkType::First);
        assert!(plans[0].is_final);

        let plans = chunk_schedule(9, 10, 8);
        assert_eq!(types(&plans), vec![ChunkType::First, ChunkType::Last]);
    }

    #[test]
    fn test_schedule_degenerate() {
        assert!(chunk_schedule(0, 10, 8).is_empty());
        assert!(chunk_schedule(20, 10, 0).is_empty());
    }
}
