//! Encoder stage: one budgeted pass over the annotated symbol sequence.

use tokio::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::graph::GraphExecutor;
use crate::scheduler::{ChunkType, CooperativeStage};
use crate::tensor::Tensor;

/// Encoder outputs forwarded to the decoder.
const FORWARDED_OUTPUTS: [usize; 3] = [0, 1, 5];

/// Parallel per-symbol streams fed to the encoder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderInput {
    pub phoneme_ids: Vec<i32>,
    pub emotion_keys: Vec<i32>,
    pub language_keys: Vec<i32>,
    pub speed: Vec<f32>,
    pub loudness: Vec<f32>,
    pub actor_key: i32,
}

impl EncoderInput {
    pub fn len(&self) -> usize {
        self.phoneme_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phoneme_ids.is_empty()
    }

    /// Append one symbol with its annotation.
    pub fn push(&mut self, phoneme: i32, emotion: i32, language: i32, speed: f32, loudness: f32) {
        self.phoneme_ids.push(phoneme);
        self.emotion_keys.push(emotion);
        self.language_keys.push(language);
        self.speed.push(speed);
        self.loudness.push(loudness);
    }

    /// Surround the streams with start and end markers.
    ///
    /// Each marker copies the annotation of its neighbouring symbol; an empty
    /// stream takes `fallback` (emotion, language) at unit speed and loudness.
    pub fn wrap(&mut self, start: i32, end: i32, fallback: (i32, i32)) {
        let (first, last) = match self.len() {
            0 => ((fallback.0, fallback.1, 1.0, 1.0), (fallback.0, fallback.1, 1.0, 1.0)),
            n => (self.annotation(0), self.annotation(n - 1)),
        };

        self.phoneme_ids.insert(0, start);
        self.emotion_keys.insert(0, first.0);
        self.language_keys.insert(0, first.1);
        self.speed.insert(0, first.2);
        self.loudness.insert(0, first.3);
        self.push(end, last.0, last.1, last.2, last.3);
    }

    fn annotation(&self, i: usize) -> (i32, i32, f32, f32) {
        (self.emotion_keys[i], self.language_keys[i], self.speed[i], self.loudness[i])
    }

    /// Build the six graph inputs.
    ///
    /// # Errors
    /// Returns a shape error if the streams differ in length.
    pub fn to_tensors(&self) -> Result<Vec<Tensor>> {
        let n = self.len();
        let lengths = [self.emotion_keys.len(), self.language_keys.len(), self.speed.len(), self.loudness.len()];
        if lengths.iter().any(|&l| l != n) {
            return Err(EngineError::shape(format!("encoder streams differ in length: {} phonemes vs {:?}", n, lengths)));
        }
        Ok(vec![
            Tensor::int(&[1, n], self.phoneme_ids.clone())?,
            Tensor::int(&[1, n], self.emotion_keys.clone())?,
            Tensor::int(&[1, 1], vec![self.actor_key])?,
            Tensor::int(&[1, n], self.language_keys.clone())?,
            Tensor::float(&[1, n], self.speed.clone())?,
            Tensor::float(&[1, n], self.loudness.clone())?,
        ])
    }
}

/// Encoder outputs 0, 1 and 5: features, mask and loudness features.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub features: Tensor,
    pub mask: Tensor,
    pub loudness: Tensor,
}

pub struct EncoderStage {
    stage: CooperativeStage,
    graph: Mutex<Box<dyn GraphExecutor>>,
}

impl EncoderStage {
    pub fn new(stage: CooperativeStage, graph: Box<dyn GraphExecutor>) -> Self {
        Self { stage, graph: Mutex::new(graph) }
    }

    /// Encode a full request.
    ///
    /// # Errors
    /// Graph failures are returned as-is.
    pub async fn infer(&self, input: &EncoderInput) -> Result<EncoderOutput> {
        let tensors = input.to_tensors()?;
        let mut graph = self.graph.lock().await;
        let mut out = self.stage.infer(graph.as_mut(), ChunkType::Whole, tensors, &FORWARDED_OUTPUTS).await?.into_iter();
        match (out.next(), out.next(), out.next()) {
            (Some(features), Some(mask), Some(loudness)) => Ok(EncoderOutput { features, mask, loudness }),
            _ => Err(EngineError::graph("encoder", "missing outputs")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shapes() {
        let mut input = EncoderInput { actor_key: 3, ..Default::default() };
        input.push(1, 0, 1, 1.0, 1.0);
        input.push(2, 0, 1, 1.0, 0.5);
        let tensors = input.to_tensors().unwrap();
        assert_eq!(tensors.len(), 6);
        assert_eq!(tensors[0].shape(), &[1, 2]);
        assert_eq!(tensors[2].shape(), &[1, 1]);
        assert_eq!(tensors[2].first_i32().unwrap(), 3);
        assert_eq!(tensors[5].dtype(), "f32");
    }

    #[test]
    fn test_wrap_copies_neighbours() {
        let mut input = EncoderInput::default();
        input.push(5, 1, 0, 0.5, 0.8);
        input.push(6, 2, 0, 1.5, 0.2);
        input.wrap(40, 41, (9, 9));
        assert_eq!(input.phoneme_ids, vec![40, 5, 6, 41]);
        assert_eq!(input.emotion_keys, vec![1, 1, 2, 2]);
        assert_eq!(input.speed, vec![0.5, 0.5, 1.5, 1.5]);
        assert_eq!(input.loudness, vec![0.8, 0.8, 0.2, 0.2]);
    }

    #[test]
    fn test_wrap_empty_uses_fallback() {
        let mut input = EncoderInput::default();
        input.wrap(40, 41, (3, 7));
        assert_eq!(input.phoneme_ids, vec![40, 41]);
        assert_eq!(input.emotion_keys, vec![3, 3]);
        assert_eq!(input.language_keys, vec![7, 7]);
        assert_eq!(input.speed, vec![1.0, 1.0]);
    }

    #[test]
    fn test_mismatched_streams() {
        let mut input = EncoderInput::default();
        input.push(1, 0, 1, 1.0, 1.0);
        input.speed.push(2.0);
        assert!(input.to_tensors().is_err());
    }
}
