//! A preloaded speaker module: its stages, language groups and lease count.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::graph::{GraphExecutor, GraphLoader, GraphRole};
use crate::model::{FALLBACK_EMOTION, Language, ModuleCatalog, SpeakerModuleDescriptor, find_closest_language};
use crate::scheduler::{CooperativeStage, FrameClock, HeavyLayerRegistry, StageBudget, StageKind};
use crate::tts::{DecoderStage, EncoderStage, PhonemizerStage, RestLayout, VocoderStage};

/// Language key used when the module declares none for a language.
const DEFAULT_LANGUAGE_KEY: i32 = 1;

/// One language pack bound to a module: its phonemizer and word cache.
pub(crate) struct LanguageGroup {
    pub(crate) pack: String,
    pub(crate) languages: Vec<Language>,
    pub(crate) phonemizer: PhonemizerStage,
    pub(crate) lookup: Mutex<HashMap<String, String>>, // Word -> phonemes, grows with every request
}

pub(crate) struct LoadedModule {
    pub(crate) descriptor: SpeakerModuleDescriptor,
    pub(crate) heavy: Arc<HeavyLayerRegistry>,
    pub(crate) encoder: EncoderStage,
    pub(crate) decoder: DecoderStage,
    pub(crate) vocoder: VocoderStage,
    pub(crate) groups: Vec<LanguageGroup>,
    leases: AtomicUsize, // In-flight requests using this module
}

impl LoadedModule {
    /// Load every graph of `descriptor` and the language packs it references.
    ///
    /// # Arguments
    /// * `descriptor` - Speaker module to load
    /// * `catalog` - Resolves language module ids to packs
    /// * `loader` - Creates the graph executors
    /// * `config` - Stage budgets and heavy set capacity
    /// * `clock` - Host frame clock shared by every stage
    /// * `filter` - Only load packs serving a language matching one of these
    ///
    /// # Errors
    /// Speaker graph failures are fatal, as is ending up with no usable
    /// language pack. Individual packs that fail are skipped.
    pub(crate) fn load(
        descriptor: SpeakerModuleDescriptor,
        catalog: &ModuleCatalog,
        loader: &dyn GraphLoader,
        config: &EngineConfig,
        clock: &FrameClock,
        filter: Option<&[Language]>,
    ) -> Result<Self> {
        let heavy = Arc::new(HeavyLayerRegistry::new(config.heavy_capacity));
        let stage = |kind: StageKind, budget, adaptive| {
            CooperativeStage::new(kind, StageBudget { budget, adaptive, overshoot_margin: config.overshoot_margin }, heavy.clone(), clock.clone())
        };

        let mut groups = Vec::new();
        for reference in descriptor.phonemizer_modules.values() {
            let Some(pack) = catalog.pack_for(&descriptor.name, &reference.module_id) else {
                warn!("⚠️  No language pack mapped for '{}' in module '{}', skipping", reference.module_id, descriptor.name);
                continue;
            };
            let languages = if reference.languages.is_empty() { pack.languages.clone() } else { reference.languages.clone() };
            if let Some(filter) = filter
                && !languages.iter().any(|l| filter.iter().any(|f| f.matches(l)))
            {
                debug!("Language pack '{}' filtered out", pack.pack_name());
                continue;
            }

            let phonemizer = loader
                .load_phonemizer(pack)
                .and_then(|raw| PhonemizerStage::new(stage(StageKind::Phonemizer, config.frame_budget(), config.adaptive()), raw, pack.vocabularies.clone()));
            match phonemizer {
                Ok(phonemizer) => {
                    debug!("Loaded language pack '{}' ({} cached words)", pack.pack_name(), pack.lookup.len());
                    groups.push(LanguageGroup { pack: pack.pack_name().to_string(), languages, phonemizer, lookup: Mutex::new(pack.lookup.clone()) });
                }
                Err(e) => error!("❌ Failed to load language pack '{}': {}", pack.pack_name(), e),
            }
        }
        if groups.is_empty() {
            return Err(EngineError::resource(format!("no language modules found for module '{}'", descriptor.name)));
        }

        let mut graphs: HashMap<GraphRole, Box<dyn GraphExecutor>> = HashMap::new();
        for role in GraphRole::SPEAKER {
            graphs.insert(role, loader.load_speaker_graph(&descriptor, role)?);
        }
        let mut take = |role: GraphRole| graphs.remove(&role).ok_or_else(|| EngineError::resource(format!("graph {} was not loaded", role)));

        let chunk_budget = config.chunk_stage_budget();
        let layout = RestLayout::from_config(&descriptor.config)?;
        let vocoder = VocoderStage::new(
            stage(StageKind::Vocoder, chunk_budget, config.adaptive()),
            take(GraphRole::VocoderFirst)?,
            take(GraphRole::VocoderMiddle)?,
            take(GraphRole::VocoderLast)?,
            layout,
        );
        let encoder = EncoderStage::new(stage(StageKind::Encoder, config.encoder_budget(), true), take(GraphRole::Encoder)?);
        let decoder = DecoderStage::new(
            stage(StageKind::DecoderPreprocess, chunk_budget, config.adaptive()),
            take(GraphRole::DecoderPreprocess)?,
            stage(StageKind::Decoder, chunk_budget, config.adaptive()),
            take(GraphRole::DecoderChunk)?,
            descriptor.config.decoder_chunk_length,
            descriptor.config.chunk_hop_length(),
        );

        info!("📦 Loaded module '{}' with {} language pack(s)", descriptor.name, groups.len());
        Ok(Self { descriptor, heavy, encoder, decoder, vocoder, groups, leases: AtomicUsize::new(0) })
    }

    pub(crate) fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Language group whose languages hold the closest match to `language`.
    pub(crate) fn group_for(&self, language: &Language) -> Option<&LanguageGroup> {
        let closest = find_closest_language(language, self.groups.iter().flat_map(|g| g.languages.iter()))?;
        self.groups.iter().find(|g| g.languages.iter().any(|l| std::ptr::eq(l, closest.language)))
    }

    /// Cached phonemes of `word` in the group serving `language`.
    pub(crate) fn lookup(&self, language: &Language, word: &str) -> Option<String> {
        self.group_for(language)?.lookup.lock().get(word).cloned()
    }

    /// Encoder language key of the closest module language.
    pub(crate) fn language_key(&self, language: &Language) -> i32 {
        language_key(&self.descriptor, language)
    }

    /// Encoder emotion key, falling back to the default emotion and then the module's first.
    pub(crate) fn emotion_key(&self, emotion: Option<&str>) -> i32 {
        emotion_key(&self.descriptor, emotion)
    }

    pub(crate) fn in_use(&self) -> bool {
        self.leases.load(Ordering::Acquire) > 0
    }

    /// Mark the module as used by an in-flight request until the lease drops.
    pub(crate) fn lease(self: &Arc<Self>) -> ModuleLease {
        self.leases.fetch_add(1, Ordering::AcqRel);
        ModuleLease(self.clone())
    }
}

pub(crate) fn language_key(descriptor: &SpeakerModuleDescriptor, language: &Language) -> i32 {
    find_closest_language(language, &descriptor.languages).and_then(|c| c.language.languagekey).unwrap_or(DEFAULT_LANGUAGE_KEY)
}

pub(crate) fn emotion_key(descriptor: &SpeakerModuleDescriptor, emotion: Option<&str>) -> i32 {
    let name = emotion.filter(|e| !e.is_empty()).unwrap_or(FALLBACK_EMOTION);
    if let Some(key) = descriptor.emotion_key(name) {
        return key;
    }
    let fallback = descriptor.emotion_key(FALLBACK_EMOTION).or_else(|| descriptor.emotions.first().map(|e| e.emotionsetkey)).unwrap_or_default();
    warn!("⚠️  Emotion '{}' not found in module '{}', using key {}", name, descriptor.name, fallback);
    fallback
}

/// Keeps a module loaded while a request runs on it.
pub(crate) struct ModuleLease(Arc<LoadedModule>);

impl Deref for ModuleLease {
    type Target = LoadedModule;

    fn deref(&self) -> &LoadedModule {
        &self.0
    }
}

impl Drop for ModuleLease {
    fn drop(&mut self) {
        self.0.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SyntheticLoader;

    fn catalog() -> ModuleCatalog {
        let mut catalog = ModuleCatalog::new();
        catalog.register_speaker(SyntheticLoader::demo_module("demo", "narrator"));
        catalog.register_pack(SyntheticLoader::demo_language_pack());
        catalog
    }

    fn load(filter: Option<&[Language]>) -> Result<LoadedModule> {
        let catalog = catalog();
        let descriptor = catalog.speaker("demo").unwrap().clone();
        LoadedModule::load(descriptor, &catalog, &SyntheticLoader::new(), &EngineConfig::default(), &FrameClock::new(), filter)
    }

    #[test]
    fn test_load_demo_module() {
        let module = load(None).unwrap();
        assert_eq!(module.groups.len(), 1);
        assert_eq!(module.groups[0].pack, "eng-g2p");
        assert_eq!(module.lookup(&Language::new("eng"), "the").as_deref(), Some("ðə"));
        assert!(!module.in_use());
    }

    #[test]
    fn test_language_filter_excludes_everything() {
        let filter = [Language::new("swe")];
        assert!(matches!(load(Some(&filter)), Err(EngineError::Resource(_))));
        let filter = [Language::new("ENG")];
        assert!(load(Some(&filter)).is_ok());
    }

    #[test]
    fn test_missing_pack_is_fatal_when_alone() {
        let mut catalog = ModuleCatalog::new();
        catalog.register_speaker(SyntheticLoader::demo_module("demo", "narrator"));
        let descriptor = catalog.speaker("demo").unwrap().clone();
        let result = LoadedModule::load(descriptor, &catalog, &SyntheticLoader::new(), &EngineConfig::default(), &FrameClock::new(), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_lease_counts() {
        let module = Arc::new(load(None).unwrap());
        let a = module.lease();
        let b = module.lease();
        assert!(module.in_use());
        drop(a);
        assert!(module.in_use());
        drop(b);
        assert!(!module.in_use());
    }

    #[test]
    fn test_emotion_key_fallbacks() {
        let module = SyntheticLoader::demo_module("demo", "narrator");
        assert_eq!(emotion_key(&module, Some("happy")), 1);
        assert_eq!(emotion_key(&module, Some("Furious")), 0);
        assert_eq!(emotion_key(&module, None), 0);
        assert_eq!(language_key(&module, &Language::new("eng").with_region("US")), 0);
        assert_eq!(language_key(&SpeakerModuleDescriptor { languages: vec![Language::new("eng")], ..module }, &Language::new("eng")), DEFAULT_LANGUAGE_KEY);
    }
}
