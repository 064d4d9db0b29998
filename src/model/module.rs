//! Speaker module and language pack descriptors.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::language::{Language, find_closest_language};
use crate::error::{EngineError, Result};

/// Phoneme symbol wrapped around every request.
pub const START_MARKER: &str = "⏩";
/// Phoneme symbol closing every request.
pub const END_MARKER: &str = "⏪";
/// Start-of-sequence token in phonemizer vocabularies.
pub const SOS_TOKEN: &str = "<sos>";
/// End-of-sequence token in phonemizer vocabularies.
pub const EOS_TOKEN: &str = "<eos>";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub username: String,
    pub actorkey: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firstname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emotion {
    pub emotionsetkey: i32,
    pub emotionsetname: String,
}

/// Reference from a speaker module to a language pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhonemizerModuleRef {
    pub module_id: String,
    #[serde(default)]
    pub languages: Vec<Language>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Geometry of the decoder chunking and the chunked vocoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocoderConfig {
    pub sampling_rate: u32,
    pub n_mel_channels: usize,
    pub decoder_chunk_length: usize,
    pub chunk_boundary_length_ratio: usize,
    pub upsample_rates: Vec<usize>,
    pub upsample_kernel_sizes: Vec<usize>,
    pub resblock_kernel_sizes: Vec<usize>,
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    pub pre_conv_kernel: usize,
    pub post_conv_kernel: usize,
}

impl VocoderConfig {
    /// Frames shared between consecutive decoder windows. Halves round to even.
    pub fn boundary_length(&self) -> usize {
        if self.chunk_boundary_length_ratio == 0 {
            return 0;
        }
        (self.decoder_chunk_length as f64 / self.chunk_boundary_length_ratio as f64).round_ties_even() as usize
    }

    /// Distance between the starts of two consecutive decoder windows.
    pub fn chunk_hop_length(&self) -> usize {
        self.decoder_chunk_length.saturating_sub(self.boundary_length())
    }

    /// Output samples produced per feature frame.
    pub fn samples_per_frame(&self) -> usize {
        self.upsample_rates.iter().product()
    }

    /// Check the geometry is usable.
    ///
    /// # Errors
    /// Returns a resource error describing the first inconsistency.
    pub fn validate(&self) -> Result<()> {
        if self.decoder_chunk_length == 0 || self.chunk_hop_length() == 0 {
            return Err(EngineError::resource(format!(
                "decoder chunk length {} with boundary ratio {} gives no forward progress",
                self.decoder_chunk_length, self.chunk_boundary_length_ratio
            )));
        }
        if self.upsample_rates.is_empty() || self.upsample_rates.len() != self.upsample_kernel_sizes.len() {
            return Err(EngineError::resource("upsample rates and kernel sizes must be non-empty and the same length"));
        }
        if self.resblock_kernel_sizes.is_empty() || self.resblock_dilation_sizes.len() != self.resblock_kernel_sizes.len() {
            return Err(EngineError::resource("resblock kernel sizes and dilation groups must be non-empty and the same length"));
        }
        let groups = self.resblock_dilation_sizes[0].len();
        if groups == 0 || self.resblock_dilation_sizes.iter().any(|d| d.len() != groups) {
            return Err(EngineError::resource("every resblock needs the same non-zero number of dilations"));
        }
        Ok(())
    }
}

/// Per-actor recording statistics, used to report expected quality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingDataInfo {
    #[serde(default)]
    pub actors: BTreeMap<String, ActorRecording>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorRecording {
    pub actor: Actor,
    #[serde(default)]
    pub languages: Vec<LanguageRecording>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageRecording {
    pub language: Language,
    #[serde(default)]
    pub emotions: Vec<EmotionRecording>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionRecording {
    pub emotion: Emotion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

/// A speaker module: one voice, its graphs and its symbol table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerModuleDescriptor {
    pub name: String,
    pub actors: Vec<Actor>,
    pub emotions: Vec<Emotion>,
    pub languages: Vec<Language>,
    pub symbol_to_id: HashMap<String, i32>,
    #[serde(default)]
    pub phonemizer_modules: BTreeMap<String, PhonemizerModuleRef>,
    pub config: VocoderConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_data_info: Option<RecordingDataInfo>,
}

impl SpeakerModuleDescriptor {
    /// Read and parse a descriptor file.
    ///
    /// # Errors
    /// Returns [`EngineError::Descriptor`] if the file is unreadable or malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        read_descriptor(path)
    }

    pub fn actor(&self, username: &str) -> Option<&Actor> {
        self.actors.iter().find(|a| a.username == username)
    }

    /// Emotion key by set name, ignoring case.
    pub fn emotion_key(&self, name: &str) -> Option<i32> {
        self.emotions.iter().find(|e| e.emotionsetname.eq_ignore_ascii_case(name)).map(|e| e.emotionsetkey)
    }

    /// Symbol id for one phoneme character.
    pub fn symbol_id(&self, symbol: char) -> Option<i32> {
        let mut buf = [0u8; 4];
        self.symbol_to_id.get(&*symbol.encode_utf8(&mut buf)).copied()
    }

    /// Recorded quality for `(actor, language, emotion)`, matching the
    /// language on its primary code.
    pub fn recorded_quality(&self, actor_username: &str, language: &Language, emotion: &str) -> Option<String> {
        let actor = self.recording_data_info.as_ref()?.actors.values().find(|a| a.actor.username == actor_username)?;
        let probe = Language::new(language.iso639_2.clone());
        let closest = find_closest_language(&probe, actor.languages.iter().map(|l| &l.language))?;
        let recording = actor.languages.iter().find(|l| &l.language == closest.language)?;
        recording.emotions.iter().find(|e| e.emotion.emotionsetname == emotion).and_then(|e| e.quality.clone())
    }
}

/// Vocabularies of a language pack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vocabularies {
    pub grapheme_vocab: HashMap<String, i32>,
    pub phoneme_vocab: HashMap<String, i32>,
    #[serde(default)]
    pub grapheme_ivocab: HashMap<i32, String>,
    pub phoneme_ivocab: HashMap<i32, String>,
}

impl Vocabularies {
    pub fn grapheme_id(&self, grapheme: char) -> Option<i32> {
        let mut buf = [0u8; 4];
        self.grapheme_vocab.get(&*grapheme.encode_utf8(&mut buf)).copied()
    }

    /// Whether the lowercase form of `c` is a known grapheme.
    pub fn knows_grapheme(&self, c: char) -> bool {
        c.to_lowercase().all(|l| self.grapheme_id(l).is_some())
    }
}

/// A language pack: phonemizer vocabularies and a word lookup cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguagePackDescriptor {
    pub module_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub languages: Vec<Language>,
    pub vocabularies: Vocabularies,
    #[serde(default)]
    pub lookup: HashMap<String, String>,
}

impl LanguagePackDescriptor {
    /// Read and parse a descriptor file.
    ///
    /// # Errors
    /// Returns [`EngineError::Descriptor`] if the file is unreadable or malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        read_descriptor(path)
    }

    /// Name used in the module mapping.
    pub fn pack_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.module_id)
    }
}

fn read_descriptor<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path).map_err(|e| EngineError::Descriptor { path: path.to_path_buf(), message: e.to_string() })?;
    serde_json::from_str(&data).map_err(|e| EngineError::Descriptor { path: path.to_path_buf(), message: e.to_string() })
}
