//! Engine configuration and CLI argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, Result};

const DEFAULT_FRAME_BUDGET_MS: f64 = 5.0;
const DEFAULT_ENCODER_BUDGET_FRACTION: f64 = 0.7;
const DEFAULT_MIN_STAGE_BUDGET_MS: f64 = 6.0;
const DEFAULT_MAX_STAGE_BUDGET_MS: f64 = 1000.0;
const DEFAULT_OVERSHOOT_MARGIN: f64 = 1.4;
const DEFAULT_HEAVY_CAPACITY: usize = 4;
const DEFAULT_JITTER_WAIT_SECS: f64 = 0.5;
const DEFAULT_JITTER_CAPACITY: usize = 256;
const DEFAULT_SAMPLE_RATE: u32 = 44100;
const DEFAULT_TICK_MS: u64 = 16;
const DEFAULT_TEXT: &str = "Hello world";

/// Streaming TTS engine configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "streamvox")]
#[command(author, version, about = "A frame-budgeted streaming text-to-speech engine", long_about = None)]
pub struct EngineConfig {
    /// Per-frame work budget for each stage slice, in milliseconds
    #[arg(long, env = "STREAMVOX_FRAME_BUDGET_MS", default_value_t = DEFAULT_FRAME_BUDGET_MS)]
    pub frame_budget_ms: f64,

    /// Fraction of the frame budget granted to the encoder
    #[arg(long, default_value_t = DEFAULT_ENCODER_BUDGET_FRACTION)]
    pub encoder_budget_fraction: f64,

    /// Lower clamp for decoder and vocoder budgets, in milliseconds
    #[arg(long, default_value_t = DEFAULT_MIN_STAGE_BUDGET_MS)]
    pub min_stage_budget_ms: f64,

    /// Upper clamp for decoder and vocoder budgets, in milliseconds
    #[arg(long, default_value_t = DEFAULT_MAX_STAGE_BUDGET_MS)]
    pub max_stage_budget_ms: f64,

    /// Multiple of the budget a slice may reach before its last step is marked heavy
    #[arg(long, default_value_t = DEFAULT_OVERSHOOT_MARGIN)]
    pub overshoot_margin: f64,

    /// Maximum remembered heavy steps per stage and chunk type
    #[arg(long, default_value_t = DEFAULT_HEAVY_CAPACITY)]
    pub heavy_capacity: usize,

    /// Disable heavy-step learning for decoder, vocoder and phonemizer (the encoder always learns)
    #[arg(long)]
    pub no_adaptive: bool,

    /// Seconds of audio to buffer before playback starts
    #[arg(long, default_value_t = DEFAULT_JITTER_WAIT_SECS)]
    pub jitter_wait_secs: f64,

    /// Maximum number of packets the jitter buffer can hold
    #[arg(long, default_value_t = DEFAULT_JITTER_CAPACITY)]
    pub jitter_capacity: usize,

    /// Output sample rate of the vocoder
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    pub sample_rate: u32,

    /// Directory containing speaker module and language pack descriptors
    #[arg(long, short = 'd', env = "STREAMVOX_PACK_DIR", default_value_os_t = default_pack_dir())]
    pub pack_dir: PathBuf,

    /// Host tick interval used by the demo loop, in milliseconds
    #[arg(long, default_value_t = DEFAULT_TICK_MS)]
    pub tick_ms: u64,

    /// Text to synthesize (ignored when --input is given)
    #[arg(long, short = 't', default_value = DEFAULT_TEXT)]
    pub text: String,

    /// JSON request file to synthesize instead of --text
    #[arg(long, short = 'i')]
    pub input: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

/// Built-in defaults, independent of the command line and environment.
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_budget_ms: DEFAULT_FRAME_BUDGET_MS,
            encoder_budget_fraction: DEFAULT_ENCODER_BUDGET_FRACTION,
            min_stage_budget_ms: DEFAULT_MIN_STAGE_BUDGET_MS,
            max_stage_budget_ms: DEFAULT_MAX_STAGE_BUDGET_MS,
            overshoot_margin: DEFAULT_OVERSHOOT_MARGIN,
            heavy_capacity: DEFAULT_HEAVY_CAPACITY,
            no_adaptive: false,
            jitter_wait_secs: DEFAULT_JITTER_WAIT_SECS,
            jitter_capacity: DEFAULT_JITTER_CAPACITY,
            sample_rate: DEFAULT_SAMPLE_RATE,
            pack_dir: default_pack_dir(),
            tick_ms: DEFAULT_TICK_MS,
            text: DEFAULT_TEXT.to_string(),
            input: None,
            verbose: false,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from command line arguments.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Base per-slice budget.
    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs_f64(self.frame_budget_ms / 1000.0)
    }

    /// Encoder budget, a fraction of the frame budget so it does not monopolize a tick.
    pub fn encoder_budget(&self) -> Duration {
        self.frame_budget().mul_f64(self.encoder_budget_fraction)
    }

    /// Decoder and vocoder budget, the frame budget clamped to the configured range.
    pub fn chunk_stage_budget(&self) -> Duration {
        let ms = self.frame_budget_ms.max(self.min_stage_budget_ms).min(self.max_stage_budget_ms);
        Duration::from_secs_f64(ms / 1000.0)
    }

    /// Whether the non-encoder stages learn heavy steps.
    pub fn adaptive(&self) -> bool {
        !self.no_adaptive
    }

    /// Number of queued samples required before the jitter buffer starts delivering.
    pub fn jitter_threshold_samples(&self) -> usize {
        (self.jitter_wait_secs * self.sample_rate as f64).round() as usize
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.frame_budget_ms.is_nan() || self.frame_budget_ms <= 0.0 {
            return Err(EngineError::Config("frame budget must be positive".to_string()));
        }
        if self.encoder_budget_fraction <= 0.0 || self.encoder_budget_fraction > 1.0 {
            return Err(EngineError::Config("encoder budget fraction must be in (0, 1]".to_string()));
        }
        if self.min_stage_budget_ms > self.max_stage_budget_ms {
            return Err(EngineError::Config(format!(
                "min stage budget {}ms exceeds max stage budget {}ms",
                self.min_stage_budget_ms, self.max_stage_budget_ms
            )));
        }
        if self.overshoot_margin < 1.0 {
            return Err(EngineError::Config("overshoot margin must be at least 1.0".to_string()));
        }
        if self.jitter_wait_secs < 0.0 {
            return Err(EngineError::Config("jitter wait must not be negative".to_string()));
        }
        if self.jitter_capacity == 0 {
            return Err(EngineError::Config("jitter capacity must be positive".to_string()));
        }
        if self.sample_rate == 0 {
            return Err(EngineError::Config("sample rate must be positive".to_string()));
        }
        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        info!("Configuration:");
        info!("  Pack directory: {}", self.pack_dir.display());
        info!("  Frame budget: {}ms (encoder x{})", self.frame_budget_ms, self.encoder_budget_fraction);
        info!("  Chunk stage budget: {:?}", self.chunk_stage_budget());
        info!("  Overshoot margin: {}", self.overshoot_margin);
        info!("  Heavy steps per set: {}", self.heavy_capacity);
        info!("  Adaptive scheduling: {}", self.adaptive());
        info!("  Jitter wait: {}s ({} samples)", self.jitter_wait_secs, self.jitter_threshold_samples());
        info!("  Sample rate: {} Hz", self.sample_rate);
        info!("  Tick interval: {}ms", self.tick_ms);
    }
}

/// Get the default pack directory (<data dir>/streamvox/packs).
fn default_pack_dir() -> PathBuf {
    if let Some(data_dir) = dirs::data_dir() {
        data_dir.join("streamvox").join("packs")
    } else {
        PathBuf::from("packs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.heavy_capacity, 4);
        assert_eq!(config.jitter_threshold_samples(), 22050);
    }

    #[test]
    fn test_budgets() {
        let config = EngineConfig::default();
        assert_eq!(config.frame_budget(), Duration::from_millis(5));
        assert!((config.encoder_budget().as_secs_f64() - 0.0035).abs() < 1e-9);
        // 5ms is below the 6ms floor for chunked stages
        assert_eq!(config.chunk_stage_budget(), Duration::from_millis(6));
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut config = EngineConfig::default();
        config.overshoot_margin = 0.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.min_stage_budget_ms = 50.0;
        config.max_stage_budget_ms = 10.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_matches_cli_defaults() {
        let parsed = EngineConfig::parse_from(["streamvox", "--frame-budget-ms", "5", "--pack-dir", "packs"]);
        let mut config = EngineConfig::default();
        config.pack_dir = PathBuf::from("packs");
        assert_eq!(serde_json::to_value(&config).unwrap(), serde_json::to_value(&parsed).unwrap());
    }

    #[test]
    fn test_cli_overrides() {
        let config = EngineConfig::parse_from(["streamvox", "--frame-budget-ms", "8", "--no-adaptive", "-t", "hi"]);
        assert_eq!(config.frame_budget_ms, 8.0);
        assert!(!config.adaptive());
        assert_eq!(config.text, "hi");
    }
}
