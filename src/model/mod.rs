//! Data model: languages, module descriptors, the catalog and request input.

mod catalog;
mod input;
mod language;
mod module;

pub use catalog::ModuleCatalog;
pub use input::{EmotionStat, FALLBACK_EMOTION, LanguageSummary, MIN_SPEED, NestedSummary, Segment, SegmentPatch, SynthInput};
pub use language::{ClosestLanguage, Language, LanguageDistance, PRIMARY_MISMATCH_PENALTY, find_closest_language};
pub use module::{
    Actor, ActorRecording, EOS_TOKEN, Emotion, EmotionRecording, END_MARKER, LanguagePackDescriptor, LanguageRecording, PhonemizerModuleRef, RecordingDataInfo,
    SOS_TOKEN, START_MARKER, SpeakerModuleDescriptor, Vocabularies, VocoderConfig,
};
