//! streamvox - frame-budgeted streaming text-to-speech demo.
//!
//! Loads speaker modules from the pack directory (or a built-in synthetic
//! module), synthesizes the given text or request file, and paces the audio
//! through the jitter buffer on a fixed host tick, logging every packet.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use streamvox::model::ModuleCatalog;
use streamvox::scheduler::{ChunkType, StageKind};
use streamvox::{EngineConfig, EngineError, FrameClock, JitterBuffer, Segment, Session, SynthInput, SyntheticLoader};

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown(shutdown: Arc<AtomicBool>) {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("🛑 Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("🛑 Received SIGTERM, shutting down...");
        }
    }

    shutdown.store(true, Ordering::SeqCst);
}

/// Open the pack directory, falling back to the synthetic demo module when it holds no speakers.
fn open_catalog(dir: &Path) -> ModuleCatalog {
    let mut catalog = if dir.is_dir() {
        ModuleCatalog::open(dir).unwrap_or_else(|e| {
            warn!("⚠️  Could not scan {}: {}", dir.display(), e);
            ModuleCatalog::new()
        })
    } else {
        debug!("Pack directory {} does not exist", dir.display());
        ModuleCatalog::new()
    };

    if catalog.speakers().next().is_none() {
        info!("📦 No speaker modules found, using the synthetic demo module");
        catalog.register_speaker(SyntheticLoader::demo_module("demo", "narrator"));
        catalog.register_pack(SyntheticLoader::demo_language_pack());
    } else {
        warn!("⚠️  Modules from {} run on synthetic graphs, the audio is not real speech", dir.display());
    }
    catalog
}

/// Read the request file, or wrap the text for the first registered speaker.
fn load_input(config: &EngineConfig, catalog: &ModuleCatalog) -> Result<SynthInput> {
    if let Some(path) = &config.input {
        let data = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        return serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()));
    }

    let module = catalog.speakers().next().ok_or_else(|| anyhow!("no speaker modules registered"))?;
    let actor = module.actors.first().ok_or_else(|| anyhow!("module '{}' has no actors", module.name))?;
    Ok(SynthInput::new(&module.name, &actor.username, vec![Segment::new(&config.text)]))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = EngineConfig::from_args();

    // Respect RUST_LOG env var, fallback to verbose flag, default to info
    let filter = EnvFilter::try_from_default_env().or_else(|_| if config.verbose { EnvFilter::try_new("debug") } else { EnvFilter::try_new("info") })?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime::new(time::macros::format_description!("[hour]:[minute]:[second]")))
        .init();

    info!("🔊 streamvox v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("❌ Configuration error: {}", e);
        std::process::exit(1);
    }
    config.log_config();

    let catalog = open_catalog(&config.pack_dir);
    if config.verbose {
        catalog.print_modules();
    }
    let input = load_input(&config, &catalog)?;
    let module_name = input.module_name.clone();

    let clock = FrameClock::new();
    let session = Session::new(config.clone(), catalog, Arc::new(SyntheticLoader::new()), clock.clone()).context("failed to create session")?;

    let request = match session.synthesize(input) {
        Ok(request) => request,
        Err(EngineError::Validation { errors, .. }) => {
            for e in &errors {
                error!("❌ {}", e);
            }
            return Err(anyhow!("request rejected with {} validation error(s)", errors.len()));
        }
        Err(e) => return Err(e).context("failed to prepare request"),
    };
    for line in request.summary.to_string().lines() {
        info!("{}", line);
    }

    let delivered = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));
    let jitter = {
        let delivered = delivered.clone();
        let finished = finished.clone();
        JitterBuffer::new(config.jitter_threshold_samples(), config.jitter_capacity, move |packet| {
            let total = delivered.fetch_add(packet.len(), Ordering::Relaxed) + packet.len();
            info!("🔈 Packet: {} samples ({:.3}s), {} total{}", packet.len(), packet.duration_secs(), total, if packet.is_final { " [final]" } else { "" });
            if packet.is_final {
                finished.store(true, Ordering::SeqCst);
            }
        })
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    tokio::spawn(wait_for_shutdown(shutdown.clone()));

    let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms));
    let run = session.run(&request.id, |packet| jitter.enqueue(packet));
    tokio::pin!(run);
    let mut synthesized = false;

    while !finished.load(Ordering::SeqCst) {
        tokio::select! {
            result = &mut run, if !synthesized => {
                let packets = result.context("synthesis failed")?;
                debug!("Synthesis produced {} packets", packets);
                synthesized = true;
            }
            _ = ticker.tick() => {
                clock.begin_frame();
                jitter.tick();
            }
        }

        if shutdown.load(Ordering::SeqCst) {
            warn!("Stopping before playback finished");
            break;
        }
    }

    for (stage, chunk) in [(StageKind::Encoder, ChunkType::Whole), (StageKind::Decoder, ChunkType::Middle), (StageKind::Vocoder, ChunkType::Middle)] {
        if let Ok(indices) = session.heavy_indices(&module_name, stage, chunk)
            && !indices.is_empty()
        {
            debug!("Heavy steps {:?}/{:?}: {:?}", stage, chunk, indices);
        }
    }

    let seconds = delivered.load(Ordering::Relaxed) as f64 / config.sample_rate as f64;
    info!("✅ Done: {:.2}s of audio at {} frames", seconds, clock.frame());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_catalog_falls_back_to_demo() {
        let catalog = open_catalog(Path::new("/nonexistent/streamvox/packs"));
        assert!(catalog.speaker("demo").is_some());
    }

    #[test]
    fn test_open_catalog_keeps_disk_modules() {
        let dir = std::env::temp_dir().join(format!("streamvox-main-catalog-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let module = SyntheticLoader::demo_module("disk", "narrator");
        std::fs::write(dir.join("disk.json"), serde_json::to_string(&module).unwrap()).unwrap();

        let catalog = open_catalog(&dir);
        assert!(catalog.speaker("disk").is_some());
        assert!(catalog.speaker("demo").is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
