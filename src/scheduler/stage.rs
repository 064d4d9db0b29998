//! Frame-budgeted cooperative execution of a graph.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::clock::FrameClock;
use super::heavy::{ChunkType, HeavyLayerRegistry, StageKind};
use crate::error::Result;
use crate::graph::GraphExecutor;
use crate::tensor::Tensor;

/// Time budget and adaptivity settings for one stage.
#[derive(Debug, Clone, Copy)]
pub struct StageBudget {
    pub budget: Duration,      // Work allowed per slice
    pub adaptive: bool,        // Record heavy steps on overshoot
    pub overshoot_margin: f64, // Multiple of the budget that counts as overshoot
}

impl StageBudget {
    fn overshoots(&self, elapsed: Duration) -> bool {
        self.adaptive && elapsed.as_secs_f64() > self.budget.as_secs_f64() * self.overshoot_margin
    }
}

/// Runs graphs a slice at a time, yielding to the host between slices.
///
/// Every slice starts on a fresh frame. Within a slice the executor is
/// stepped until it is exhausted, the budget is spent, or the step counter
/// hits a known heavy index.
#[derive(Clone)]
pub struct CooperativeStage {
    kind: StageKind,
    budget: StageBudget,
    heavy: Arc<HeavyLayerRegistry>,
    clock: FrameClock,
}

impl CooperativeStage {
    pub fn new(kind: StageKind, budget: StageBudget, heavy: Arc<HeavyLayerRegistry>, clock: FrameClock) -> Self {
        Self { kind, budget, heavy, clock }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn budget(&self) -> &StageBudget {
        &self.budget
    }

    /// Seed the heavy set for one chunk type.
    pub fn add_custom_skip_indices(&self, chunk: ChunkType, indices: &[usize]) {
        self.heavy.add_custom_skip_indices(self.kind, chunk, indices);
    }

    /// Run `exec` to completion across frames and collect the requested outputs.
    ///
    /// # Arguments
    /// * `exec` - Executor to drive
    /// * `chunk` - Chunk type selecting the heavy set
    /// * `inputs` - Graph inputs
    /// * `outputs` - Output indices to fetch once the graph is exhausted
    ///
    /// # Errors
    /// Any graph error is returned as-is and aborts the run.
    pub async fn infer(&self, exec: &mut dyn GraphExecutor, chunk: ChunkType, inputs: Vec<Tensor>, outputs: &[usize]) -> Result<Vec<Tensor>> {
        let mut waiter = self.clock.waiter();
        exec.start(inputs)?;

        let mut counter = 0usize;
        let mut slices = 0usize;
        let last_slice = loop {
            waiter.next_frame().await?;
            slices += 1;

            let slice_start = Instant::now();
            let more = loop {
                let more = exec.step()?;
                counter += 1;
                if !more || slice_start.elapsed() > self.budget.budget || self.heavy.contains(self.kind, chunk, counter) {
                    break more;
                }
            };

            let elapsed = slice_start.elapsed();
            if self.budget.overshoots(elapsed) {
                self.heavy.record_overshoot(self.kind, chunk, counter);
            }
            if !more {
                break elapsed;
            }
        };

        // Fetching outputs may wait on queued work, so it counts against the last slice
        let copy_start = Instant::now();
        let fetched = outputs.iter().map(|&i| exec.output(i)).collect::<Result<Vec<_>>>()?;
        if self.budget.overshoots(last_slice + copy_start.elapsed()) {
            self.heavy.record_overshoot(self.kind, chunk, counter);
        }

        debug!("{} ({:?}/{:?}) finished: {} steps over {} frames", exec.name(), self.kind, chunk, counter, slices);
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    /// Executor whose steps sleep for scripted durations.
    struct ScriptedGraph {
        costs: Vec<Duration>,
        cursor: usize,
        done: bool,
    }

    impl ScriptedGraph {
        fn new(costs: Vec<Duration>) -> Self {
            Self { costs, cursor: 0, done: false }
        }
    }

    impl GraphExecutor for ScriptedGraph {
        fn name(&self) -> &str {
            "scripted"
        }

        fn start(&mut self, _inputs: Vec<Tensor>) -> Result<()> {
            self.cursor = 0;
            self.done = false;
            Ok(())
        }

        fn step(&mut self) -> Result<bool> {
            if let Some(cost) = self.costs.get(self.cursor) {
                std::thread::sleep(*cost);
            }
            self.cursor += 1;
            self.done = self.cursor >= self.costs.len();
            Ok(!self.done)
        }

        fn output_count(&self) -> usize {
            1
        }

        fn output(&self, index: usize) -> Result<Tensor> {
            if !self.done {
                return Err(EngineError::graph("scripted", "not done"));
            }
            Ok(Tensor::scalar_i32(index as i32))
        }
    }

    fn spawn_ticker(clock: FrameClock) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                clock.begin_frame();
                tokio::task::yield_now().await;
            }
        })
    }

    fn stage(budget_ms: u64, heavy: Arc<HeavyLayerRegistry>, clock: FrameClock) -> CooperativeStage {
        let budget = StageBudget { budget: Duration::from_millis(budget_ms), adaptive: true, overshoot_margin: 1.4 };
        CooperativeStage::new(StageKind::Decoder, budget, heavy, clock)
    }

    #[tokio::test]
    async fn test_infer_returns_requested_outputs() {
        let clock = FrameClock::new();
        let ticker = spawn_ticker(clock.clone());
        let heavy = Arc::new(HeavyLayerRegistry::new(4));
        let stage = stage(1000, heavy, clock);

        let mut graph = ScriptedGraph::new(vec![Duration::ZERO; 5]);
        let out = stage.infer(&mut graph, ChunkType::Whole, vec![], &[0]).await.unwrap();
        ticker.abort();

        assert_eq!(out, vec![Tensor::scalar_i32(0)]);
    }

    #[tokio::test]
    async fn test_overshooting_step_is_learned() {
        let clock = FrameClock::new();
        let ticker = spawn_ticker(clock.clone());
        let heavy = Arc::new(HeavyLayerRegistry::new(4));
        let stage = stage(5, heavy.clone(), clock);

        // Third step costs far more than 1.4x the budget
        let costs = vec![Duration::ZERO, Duration::ZERO, Duration::from_millis(30), Duration::ZERO];
        let mut graph = ScriptedGraph::new(costs);
        stage.infer(&mut graph, ChunkType::Whole, vec![], &[0]).await.unwrap();
        ticker.abort();

        // Yield after step 2 next time so step 3 starts a fresh slice
        assert!(heavy.contains(StageKind::Decoder, ChunkType::Whole, 2));
        assert!(!heavy.contains(StageKind::Decoder, ChunkType::First, 2));
    }

    #[tokio::test]
    async fn test_non_adaptive_records_nothing() {
        let clock = FrameClock::new();
        let ticker = spawn_ticker(clock.clone());
        let heavy = Arc::new(HeavyLayerRegistry::new(4));
        let budget = StageBudget { budget: Duration::from_millis(1), adaptive: false, overshoot_margin: 1.4 };
        let stage = CooperativeStage::new(StageKind::Encoder, budget, heavy.clone(), clock);

        let mut graph = ScriptedGraph::new(vec![Duration::from_millis(10); 2]);
        stage.infer(&mut graph, ChunkType::Whole, vec![], &[0]).await.unwrap();
        ticker.abort();

        assert!(heavy.snapshot(StageKind::Encoder, ChunkType::Whole).is_empty());
    }
}
