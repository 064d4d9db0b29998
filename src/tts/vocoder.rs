//! Chunked vocoder: three graphs threading convolution rests between calls.

use tokio::sync::Mutex;
use tracing::debug;

use super::rest_layout::RestLayout;
use crate::error::{EngineError, Result};
use crate::graph::GraphExecutor;
use crate::scheduler::{ChunkType, CooperativeStage};
use crate::tensor::Tensor;

/// Rests carried from one vocoder call to the next within a request.
#[derive(Debug, Default)]
pub struct VocoderState {
    rests: Vec<Tensor>, // Full positional layout of the previous call's outputs
}

impl VocoderState {
    pub fn is_empty(&self) -> bool {
        self.rests.is_empty()
    }

    pub fn clear(&mut self) {
        self.rests.clear();
    }
}

pub struct VocoderStage {
    stage: CooperativeStage,
    first: Mutex<Box<dyn GraphExecutor>>,
    middle: Mutex<Box<dyn GraphExecutor>>,
    last: Mutex<Box<dyn GraphExecutor>>,
    layout: RestLayout,
}

impl VocoderStage {
    pub fn new(
        stage: CooperativeStage,
        first: Box<dyn GraphExecutor>,
        middle: Box<dyn GraphExecutor>,
        last: Box<dyn GraphExecutor>,
        layout: RestLayout,
    ) -> Self {
        Self { stage, first: Mutex::new(first), middle: Mutex::new(middle), last: Mutex::new(last), layout }
    }

    pub fn layout(&self) -> &RestLayout {
        &self.layout
    }

    /// Vocode one decoder window.
    ///
    /// # Arguments
    /// * `state` - Rests of the current request, updated in place
    /// * `chunk` - `First`, `Middle` or `Last`
    /// * `features` - Decoder features for the window
    /// * `loudness` - Loudness features, only read by the first call
    /// * `is_final` - Drop the rests afterwards
    ///
    /// # Returns
    /// Mono samples for the window.
    ///
    /// # Errors
    /// Graph failures, a graph whose output count disagrees with the layout,
    /// or a continuation chunk without prior state.
    pub async fn vocode(&self, state: &mut VocoderState, chunk: ChunkType, features: Tensor, loudness: &Tensor, is_final: bool) -> Result<Vec<f32>> {
        let audio = match chunk {
            ChunkType::First | ChunkType::Whole => {
                let mut graph = self.first.lock().await;
                self.layout.check_count(graph.name(), graph.output_count())?;
                let outputs: Vec<usize> = (0..self.layout.total()).collect();
                let rests = self.stage.infer(graph.as_mut(), ChunkType::First, vec![features, loudness.clone()], &outputs).await?;
                let audio = rests[RestLayout::AUDIO].clone();
                state.rests = rests;
                audio
            }
            ChunkType::Middle => {
                let mut graph = self.middle.lock().await;
                self.layout.check_count(graph.name(), graph.output_count())?;
                let inputs = self.continuation_inputs(state, graph.name(), features)?;
                let outputs: Vec<usize> = (0..self.layout.total()).collect();
                let rests = self.stage.infer(graph.as_mut(), ChunkType::Middle, inputs, &outputs).await?;
                let audio = rests[RestLayout::AUDIO].clone();
                state.rests = rests;
                audio
            }
            ChunkType::Last => {
                let mut graph = self.last.lock().await;
                let inputs = self.continuation_inputs(state, graph.name(), features)?;
                let mut out = self.stage.infer(graph.as_mut(), ChunkType::Last, inputs, &[RestLayout::AUDIO]).await?;
                state.clear();
                out.pop().ok_or_else(|| EngineError::graph(graph.name(), "no audio output"))?
            }
        };

        if is_final {
            state.clear();
        }
        let samples = audio.to_f32_vec();
        debug!("Vocoder {:?}: {} samples", chunk, samples.len());
        Ok(samples)
    }

    fn continuation_inputs(&self, state: &mut VocoderState, graph: &str, features: Tensor) -> Result<Vec<Tensor>> {
        if state.is_empty() {
            return Err(EngineError::graph(graph, "continuation chunk without a preceding first chunk"));
        }
        self.layout.check_count(graph, state.rests.len())?;
        let mut inputs = std::mem::take(&mut state.rests);
        inputs[RestLayout::AUDIO] = features;
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::graph::{GraphLoader, GraphRole, SyntheticLoader};
    use crate::scheduler::{FrameClock, HeavyLayerRegistry, StageBudget, StageKind};

    fn stage_for(loader: &SyntheticLoader, clock: FrameClock) -> VocoderStage {
        let module = SyntheticLoader::demo_module("demo", "narrator");
        let budget = StageBudget { budget: Duration::from_secs(1), adaptive: true, overshoot_margin: 1.4 };
        let stage = CooperativeStage::new(StageKind::Vocoder, budget, Arc::new(HeavyLayerRegistry::new(4)), clock);
        VocoderStage::new(
            stage,
            loader.load_speaker_graph(&module, GraphRole::VocoderFirst).unwrap(),
            loader.load_speaker_graph(&module, GraphRole::VocoderMiddle).unwrap(),
            loader.load_speaker_graph(&module, GraphRole::VocoderLast).unwrap(),
            RestLayout::from_config(&module.config).unwrap(),
        )
    }

    fn spawn_ticker(clock: FrameClock) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                clock.begin_frame();
                tokio::task::yield_now().await;
            }
        })
    }

    #[tokio::test]
    async fn test_middle_without_first_is_rejected() {
        let clock = FrameClock::new();
        let ticker = spawn_ticker(clock.clone());
        let vocoder = stage_for(&SyntheticLoader::new(), clock);
        let mut state = VocoderState::default();
        let features = Tensor::zeros_f32(&[1, 4, 8]);
        let loudness = Tensor::zeros_f32(&[1, 1, 8]);
        let result = vocoder.vocode(&mut state, ChunkType::Middle, features, &loudness, false).await;
        ticker.abort();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_first_keeps_rests_until_last() {
        let clock = FrameClock::new();
        let ticker = spawn_ticker(clock.clone());
        let vocoder = stage_for(&SyntheticLoader::new(), clock);
        let mut state = VocoderState::default();
        let loudness = Tensor::float(&[1, 1, 8], vec![1.0; 8]).unwrap();

        vocoder.vocode(&mut state, ChunkType::First, Tensor::zeros_f32(&[1, 4, 8]), &loudness, false).await.unwrap();
        assert!(!state.is_empty());
        vocoder.vocode(&mut state, ChunkType::Middle, Tensor::zeros_f32(&[1, 4, 8]), &loudness, false).await.unwrap();
        assert!(!state.is_empty());
        vocoder.vocode(&mut state, ChunkType::Last, Tensor::zeros_f32(&[1, 4, 5]), &loudness, true).await.unwrap();
        ticker.abort();
        assert!(state.is_empty());
    }
}
