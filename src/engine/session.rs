//! Engine session: loaded modules, accepted requests and the running gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::loaded::LoadedModule;
use super::pipeline;
use super::text::{IdentityNormalizer, TextNormalizer, TextProcessor, validate_phonemes};
use crate::audio::OutputPacket;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::graph::GraphLoader;
use crate::model::{FALLBACK_EMOTION, Language, ModuleCatalog, NestedSummary, SpeakerModuleDescriptor, SynthInput};
use crate::scheduler::{ChunkType, FrameClock, StageKind};

/// An accepted request, ready to [`Session::run`].
#[derive(Debug, Clone)]
pub struct SynthRequest {
    pub id: String,
    pub warnings: Vec<String>, // Validation and pre-processing feedback, advisory only
    pub summary: NestedSummary,
    pub input: SynthInput, // Defaults filled in, text pre-processed
}

struct Inner {
    config: EngineConfig,
    clock: FrameClock,
    loader: Arc<dyn GraphLoader>,
    text: TextProcessor,
    catalog: Mutex<ModuleCatalog>,
    modules: Mutex<HashMap<String, Arc<LoadedModule>>>,
    requests: Mutex<HashMap<String, SynthInput>>,
    running: AtomicBool,
    active: Mutex<Option<String>>, // Id of the running request
}

/// Handle to the engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a session with the identity text normalizer.
    ///
    /// # Arguments
    /// * `config` - Stage budgets and heavy set capacity
    /// * `catalog` - Registered speaker modules and language packs
    /// * `loader` - Creates graph executors at preload
    /// * `clock` - Host frame clock every stage suspends on
    pub fn new(config: EngineConfig, catalog: ModuleCatalog, loader: Arc<dyn GraphLoader>, clock: FrameClock) -> Result<Self> {
        Self::with_normalizer(config, catalog, loader, clock, Box::new(IdentityNormalizer))
    }

    /// Create a session with a custom number and abbreviation expander.
    pub fn with_normalizer(
        config: EngineConfig,
        catalog: ModuleCatalog,
        loader: Arc<dyn GraphLoader>,
        clock: FrameClock,
        normalizer: Box<dyn TextNormalizer>,
    ) -> Result<Self> {
        let inner = Inner {
            config,
            clock,
            loader,
            text: TextProcessor::new(normalizer)?,
            catalog: Mutex::new(catalog),
            modules: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            active: Mutex::new(None),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn clock(&self) -> &FrameClock {
        &self.inner.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Run `f` against the catalog, for registration or inspection.
    pub fn with_catalog<R>(&self, f: impl FnOnce(&mut ModuleCatalog) -> R) -> R {
        f(&mut self.inner.catalog.lock())
    }

    /// Rescan the pack directory if it changed.
    ///
    /// # Returns
    /// `true` if the catalog was rebuilt.
    pub fn refresh_catalog(&self) -> Result<bool> {
        self.inner.catalog.lock().refresh()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_loaded(&self, module: &str) -> bool {
        self.inner.modules.lock().contains_key(module)
    }

    /// Names of the loaded modules, sorted.
    pub fn loaded_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.modules.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn module(&self, name: &str) -> Result<Arc<LoadedModule>> {
        self.inner.modules.lock().get(name).cloned().ok_or_else(|| EngineError::NotLoaded(name.to_string()))
    }

    /// Load a speaker module and its language packs. Already loaded modules are left as they are.
    ///
    /// # Arguments
    /// * `module` - Speaker module name
    /// * `languages` - Only load packs serving a language that partially matches one of these
    ///
    /// # Errors
    /// Unknown modules, speaker graph failures, or no usable language pack.
    pub fn preload(&self, module: &str, languages: Option<&[Language]>) -> Result<()> {
        if self.is_loaded(module) {
            debug!("Module '{}' already loaded", module);
            return Ok(());
        }

        let loaded = {
            let catalog = self.inner.catalog.lock();
            let descriptor = catalog.speaker(module).cloned().ok_or_else(|| EngineError::UnknownModule(module.to_string()))?;
            LoadedModule::load(descriptor, &catalog, self.inner.loader.as_ref(), &self.inner.config, &self.inner.clock, languages)?
        };
        self.inner.modules.lock().entry(module.to_string()).or_insert_with(|| Arc::new(loaded));
        Ok(())
    }

    /// Unload a module, or with `None` every module not in use.
    ///
    /// A module with a request in flight stays loaded; this is logged, not an error.
    pub fn unload(&self, module: Option<&str>) {
        let mut modules = self.inner.modules.lock();
        match module {
            Some(name) => match modules.get(name) {
                None => debug!("Module '{}' is not loaded", name),
                Some(loaded) if loaded.in_use() => warn!("⚠️  Module '{}' is in use by a running request, not unloading", name),
                Some(_) => {
                    modules.remove(name);
                    info!("🗑️  Unloaded module '{}'", name);
                }
            },
            None => modules.retain(|name, loaded| {
                if loaded.in_use() {
                    warn!("⚠️  Module '{}' is in use by a running request, not unloading", name);
                    return true;
                }
                info!("🗑️  Unloaded module '{}'", name);
                false
            }),
        }
    }

    /// Seed the heavy set of a loaded module's stage.
    ///
    /// # Errors
    /// Returns [`EngineError::NotLoaded`] if the module is not loaded.
    pub fn add_custom_skip_indices(&self, module: &str, stage: StageKind, chunk: ChunkType, indices: &[usize]) -> Result<()> {
        self.module(module)?.heavy.add_custom_skip_indices(stage, chunk, indices);
        Ok(())
    }

    /// Heavy indices learned so far for one stage of a loaded module.
    pub fn heavy_indices(&self, module: &str, stage: StageKind, chunk: ChunkType) -> Result<Vec<usize>> {
        Ok(self.module(module)?.heavy.snapshot(stage, chunk))
    }

    /// Validate and prepare a request.
    ///
    /// Loads the module if needed, fills in defaults and pre-processes every
    /// segment. The request is kept until [`Session::run`] consumes it.
    ///
    /// # Errors
    /// [`EngineError::Busy`] while another request runs, [`EngineError::Validation`]
    /// with every error and warning found, or preload failures.
    pub fn synthesize(&self, input: SynthInput) -> Result<SynthRequest> {
        if self.is_running() {
            return Err(EngineError::Busy(self.inner.active.lock().clone().unwrap_or_default()));
        }

        let (errors, mut warnings) = {
            let catalog = self.inner.catalog.lock();
            let modules: Vec<&SpeakerModuleDescriptor> = catalog.speakers().collect();
            input.validate(&modules)
        };
        for warning in &warnings {
            warn!("⚠️  {}", warning);
        }
        if !errors.is_empty() {
            for e in &errors {
                error!("❌ {}", e);
            }
            return Err(EngineError::Validation { errors, warnings });
        }

        self.preload(&input.module_name, None)?;
        let module = self.module(&input.module_name)?;

        let mut summary = input.nested_summary();
        summary.fill_qualities(&module.descriptor, &input.actor_username);

        let mut input = input;
        self.populate_defaults(&module.descriptor, &mut input);
        self.preprocess_segments(&module, &mut input, &mut warnings);

        let id = Uuid::new_v4().to_string();
        self.inner.requests.lock().insert(id.clone(), input.clone());
        info!("📝 Accepted request {} ({} segments, {} chars)", id, input.segments.len(), input.char_count());
        debug!("Request {} text: '{}'", id, input.full_text());
        Ok(SynthRequest { id, warnings, summary, input })
    }

    fn populate_defaults(&self, module: &SpeakerModuleDescriptor, input: &mut SynthInput) {
        if input.default_language.is_none()
            && let Some(first) = module.languages.first()
        {
            debug!("Default language not set, using '{}' from module '{}'", first, module.name);
            input.default_language = Some(first.clone());
        }
        if input.default_emotion.as_deref().is_none_or(str::is_empty) {
            input.default_emotion = Some(FALLBACK_EMOTION.to_string());
        }
        if input.speed.as_ref().is_none_or(Vec::is_empty) {
            input.speed = Some(vec![1.0]);
        }
        if input.loudness.as_ref().is_none_or(Vec::is_empty) {
            input.loudness = Some(vec![1.0]);
        }
        input.extra.clear();
        for segment in &mut input.segments {
            segment.extra.clear();
        }
    }

    fn preprocess_segments(&self, module: &LoadedModule, input: &mut SynthInput, warnings: &mut Vec<String>) {
        let default_language = input.default_language.clone();
        for (i, segment) in input.segments.iter_mut().enumerate() {
            if segment.is_custom() {
                let (text, feedback) = validate_phonemes(&segment.text, &module.descriptor);
                segment.text = text;
                if let Some(feedback) = feedback {
                    warnings.push(format!("Phoneme feedback for segment {}: {}", i + 1, feedback));
                }
                continue;
            }

            let Some(language) = segment.language.clone().or_else(|| default_language.clone()) else {
                continue;
            };
            let Some(group) = module.group_for(&language) else {
                warn!("⚠️  No language pack for {} in module '{}'", language, module.name());
                continue;
            };
            let (text, feedback) = self.inner.text.preprocess(&segment.text, &language, group.phonemizer.vocab());
            segment.text = text;
            if let Some(feedback) = feedback {
                warnings.push(format!("Pre-processing for segment {}:\n{}", i + 1, feedback));
            }
        }
    }

    /// Run an accepted request, handing finished audio to `on_packet` in order.
    ///
    /// # Returns
    /// Number of packets delivered. The last one is marked final.
    ///
    /// # Errors
    /// [`EngineError::Busy`] while another request runs,
    /// [`EngineError::UnknownRequest`], [`EngineError::NotLoaded`] if the
    /// module was unloaded in between, or any stage failure.
    pub async fn run<F>(&self, request_id: &str, on_packet: F) -> Result<usize>
    where
        F: FnMut(OutputPacket),
    {
        let _gate = RunningGuard::acquire(&self.inner, request_id)?;
        let input = self.inner.requests.lock().remove(request_id).ok_or_else(|| EngineError::UnknownRequest(request_id.to_string()))?;
        let module = self.module(&input.module_name)?.lease();

        info!("▶️  Running request {} on '{}'", request_id, module.name());
        let result = pipeline::run_request(&module, &self.inner.text, &input, on_packet).await;
        match &result {
            Ok(packets) => info!("✅ Request {} finished ({} packets)", request_id, packets),
            Err(e) => error!("❌ Request {} failed: {}", request_id, e),
        }
        result
    }
}

/// Holds the running flag for one request.
struct RunningGuard<'a> {
    inner: &'a Inner,
}

impl<'a> RunningGuard<'a> {
    fn acquire(inner: &'a Inner, request_id: &str) -> Result<Self> {
        if inner.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(EngineError::Busy(inner.active.lock().clone().unwrap_or_default()));
        }
        *inner.active.lock() = Some(request_id.to_string());
        Ok(Self { inner })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.inner.active.lock() = None;
        self.inner.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::graph::{GraphExecutor, GraphLoader, GraphRole, LAST_CHUNK_TRIM, SyntheticLoader, SyntheticVocoder};
    use crate::model::{Segment, SegmentPatch};
    use crate::tensor::{Tensor, slice_axis};

    fn demo_catalog() -> ModuleCatalog {
        let mut catalog = ModuleCatalog::new();
        catalog.register_speaker(SyntheticLoader::demo_module("demo", "narrator"));
        catalog.register_pack(SyntheticLoader::demo_language_pack());
        catalog
    }

    fn session_with(loader: SyntheticLoader) -> Session {
        Session::new(EngineConfig::default(), demo_catalog(), Arc::new(loader), FrameClock::new()).unwrap()
    }

    fn session() -> Session {
        session_with(SyntheticLoader::new())
    }

    /// Whole-sequence vocoder output for the frames the request encodes to,
    /// less `trim` trailing frames.
    fn whole_sequence_audio(session: &Session, loader: &SyntheticLoader, request: &SynthRequest, trim: usize) -> Vec<f32> {
        let module = session.module("demo").unwrap();
        let input = &request.input;
        let curves = pipeline::Curves::from_input(input);
        let streams = pipeline::build_streams(&module.descriptor, input, &curves, 1, &session.inner.text, |l, w| module.lookup(l, w)).unwrap();
        let mut encoder = loader.load_speaker_graph(&module.descriptor, GraphRole::Encoder).unwrap();
        let encoded = encoder.execute(streams.to_tensors().unwrap()).unwrap();
        let frames = encoded[0].shape()[2];
        let features = Tensor::Float(slice_axis(encoded[0].as_float().unwrap(), 2, 0, frames - trim));
        SyntheticVocoder::reference(&module.descriptor.config, &features, &encoded[5]).unwrap()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{} != {}", x, y);
        }
    }

    async fn run_collect(session: &Session, id: &str) -> Vec<OutputPacket> {
        let ticker = spawn_ticker(session.clock().clone());
        let mut packets = Vec::new();
        session.run(id, |p| packets.push(p)).await.unwrap();
        ticker.abort();
        packets
    }

    fn assert_single_final_last(packets: &[OutputPacket]) {
        assert_eq!(packets.iter().filter(|p| p.is_final).count(), 1);
        assert!(packets.last().unwrap().is_final);
    }

    fn hello_world() -> SynthInput {
        let mut input = SynthInput::new("demo", "narrator", vec![Segment::new("Hello world")]);
        input.default_language = Some(Language::new("eng"));
        input
    }

    fn spawn_ticker(clock: FrameClock) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                clock.begin_frame();
                tokio::task::yield_now().await;
            }
        })
    }

    #[test]
    fn test_synthesize_prepares_input() {
        let session = session();
        let mut input = hello_world();
        input.segments.push(Segment::new(" ÐƏ#").with(SegmentPatch::CustomPhonemized(true)));
        let request = session.synthesize(input).unwrap();

        assert!(session.is_loaded("demo"));
        assert_eq!(request.input.segments[0].text, "hello world");
        assert_eq!(request.input.segments[1].text, " ðə");
        assert_eq!(request.input.default_emotion.as_deref(), Some(FALLBACK_EMOTION));
        assert_eq!(request.input.speed, Some(vec![1.0]));
        assert!(request.warnings.iter().any(|w| w == "Phoneme feedback for segment 2: Illegal phonemes removed: #"));
        assert_eq!(request.summary.summary.len(), 1);
    }

    #[test]
    fn test_synthesize_rejects_invalid_input() {
        let session = session();
        let input = SynthInput::new("demo", "nobody", vec![Segment::new("hi")]);
        match session.synthesize(input) {
            Err(EngineError::Validation { errors, .. }) => assert!(errors[0].contains("nobody")),
            other => panic!("expected validation error, got {:?}", other.map(|r| r.id)),
        }
        assert!(!session.is_loaded("demo"));
    }

    #[test]
    fn test_grapheme_feedback_in_warnings() {
        let session = session();
        let mut input = hello_world();
        input.segments[0].text = "héllo".to_string();
        let request = session.synthesize(input).unwrap();
        assert_eq!(request.input.segments[0].text, "hllo");
        assert!(request.warnings.iter().any(|w| w == "Pre-processing for segment 1:\nIllegal graphemes removed: 'é' at index 1"));
    }

    #[tokio::test]
    async fn test_run_streams_final_packet_last() {
        let session = session();
        let ticker = spawn_ticker(session.clock().clone());
        let request = session.synthesize(hello_world()).unwrap();

        let mut packets = Vec::new();
        let count = session.run(&request.id, |p| packets.push(p)).await.unwrap();
        ticker.abort();

        assert_eq!(count, packets.len());
        assert!(packets.last().unwrap().is_final);
        assert!(packets[..packets.len() - 1].iter().all(|p| !p.is_final));
        assert!(packets.iter().map(|p| p.len()).sum::<usize>() > 0);
        assert!(packets.iter().all(|p| p.sample_rate == 44100));
        assert!(!session.is_running());

        // Words phonemized by the run are cached for the next one
        let module = session.module("demo").unwrap();
        assert_eq!(module.lookup(&Language::new("eng"), "hello").as_deref(), Some("hello"));

        // The request is consumed
        assert!(matches!(session.run(&request.id, |_| {}).await, Err(EngineError::UnknownRequest(_))));
    }

    #[tokio::test]
    async fn test_chunked_run_matches_whole_sequence() {
        let loader = SyntheticLoader::new();
        let session = session_with(loader.clone());
        // 13 symbols at 4 frames each, decoded 8 frames at a time
        let request = session.synthesize(hello_world()).unwrap();
        let packets = run_collect(&session, &request.id).await;

        assert!(packets.len() >= 3, "expected first, middle and last chunks, got {}", packets.len());
        assert_single_final_last(&packets);
        let joined: Vec<f32> = packets.iter().flat_map(|p| p.samples.iter().copied()).collect();
        let reference = whole_sequence_audio(&session, &loader, &request, LAST_CHUNK_TRIM);
        assert_close(&joined, &reference);
    }

    #[tokio::test]
    async fn test_single_chunk_run_is_final_first() {
        let loader = SyntheticLoader::with_frames_per_symbol(2);
        let session = session_with(loader.clone());
        // <start> a b <end> at 2 frames each fits one 8-frame window
        let mut input = hello_world();
        input.segments[0].text = "ab".to_string();
        let request = session.synthesize(input).unwrap();
        let packets = run_collect(&session, &request.id).await;

        assert_eq!(packets.len(), 1);
        assert_single_final_last(&packets);
        // Without a last chunk the convolution delay is never flushed, so
        // the audio is a prefix of the whole-sequence output
        let samples = &packets[0].samples;
        let reference = whole_sequence_audio(&session, &loader, &request, 0);
        assert!(!samples.is_empty());
        assert!(samples.len() < reference.len());
        assert_close(samples, &reference[..samples.len()]);
    }

    #[test]
    fn test_catalog_refresh_drops_removed_module() {
        let dir: PathBuf = std::env::temp_dir().join(format!("streamvox-session-catalog-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let module = SyntheticLoader::demo_module("disk", "narrator");
        std::fs::write(dir.join("disk.json"), serde_json::to_string(&module).unwrap()).unwrap();

        let catalog = ModuleCatalog::open(&dir).unwrap();
        let session = Session::new(EngineConfig::default(), catalog, Arc::new(SyntheticLoader::new()), FrameClock::new()).unwrap();
        session.with_catalog(|c| c.register_pack(SyntheticLoader::demo_language_pack()));
        assert!(!session.refresh_catalog().unwrap());
        session.preload("disk", None).unwrap();

        std::fs::remove_file(dir.join("disk.json")).unwrap();
        session.with_catalog(|c| c.rescan()).unwrap();
        assert!(session.with_catalog(|c| c.speaker("disk").is_none()));
        assert!(matches!(session.synthesize(SynthInput::new("disk", "narrator", vec![Segment::new("hi")])), Err(EngineError::Validation { .. })));
        // Registered packs survive the rescan
        assert!(session.with_catalog(|c| c.pack("eng-g2p").is_some()));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_busy_and_unload_refused_while_running() {
        let session = session();
        let request = session.synthesize(hello_world()).unwrap();
        let second = session.synthesize(hello_world()).unwrap();

        // No ticks yet: the run parks at its first frame boundary
        let runner = session.clone();
        let id = request.id.clone();
        let handle = tokio::spawn(async move { runner.run(&id, |_| {}).await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(session.is_running());

        assert!(matches!(session.synthesize(hello_world()), Err(EngineError::Busy(id)) if id == request.id));
        assert!(matches!(session.run(&second.id, |_| {}).await, Err(EngineError::Busy(_))));

        session.unload(Some("demo"));
        assert!(session.is_loaded("demo"));
        session.unload(None);
        assert!(session.is_loaded("demo"));

        let ticker = spawn_ticker(session.clock().clone());
        handle.await.unwrap().unwrap();
        ticker.abort();

        // The refused second run left its request in place
        assert!(!session.is_running());
        session.unload(Some("demo"));
        assert!(!session.is_loaded("demo"));
        assert!(matches!(session.run(&second.id, |_| {}).await, Err(EngineError::NotLoaded(_))));
    }

    #[test]
    fn test_preload_filter_and_errors() {
        let session = session();
        assert!(matches!(session.preload("missing", None), Err(EngineError::UnknownModule(_))));
        assert!(session.preload("demo", Some(&[Language::new("swe")])).is_err());
        assert!(!session.is_loaded("demo"));
        session.preload("demo", Some(&[Language::new("eng")])).unwrap();
        session.preload("demo", None).unwrap();
        assert_eq!(session.loaded_modules(), vec!["demo".to_string()]);
    }

    #[test]
    fn test_custom_skip_indices() {
        let session = session();
        assert!(session.add_custom_skip_indices("demo", StageKind::Vocoder, ChunkType::First, &[3]).is_err());
        session.preload("demo", None).unwrap();
        session.add_custom_skip_indices("demo", StageKind::Vocoder, ChunkType::First, &[3, 7]).unwrap();
        let mut indices = session.heavy_indices("demo", StageKind::Vocoder, ChunkType::First).unwrap();
        indices.sort();
        assert_eq!(indices, vec![3, 7]);
    }
}
