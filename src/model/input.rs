//! Annotated synthesis input, its validation and the request summary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::language::Language;
use super::module::SpeakerModuleDescriptor;

/// Emotion used when a request names none.
pub const FALLBACK_EMOTION: &str = "Emotionless";
/// Speed multipliers at or below this are clamped to it.
pub const MIN_SPEED: f64 = 0.1;

/// One run of text sharing the same annotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>, // Reserved, ignored with a warning
    #[serde(rename = "IsCustomPhonemized", default, skip_serializing_if = "Option::is_none")]
    pub is_custom_phonemized: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>, // Unknown fields, reported as warnings
}

/// A single annotation change applied to a segment.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentPatch {
    Emotion(String),
    Language(Language),
    CustomPhonemized(bool),
}

impl Segment {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }

    /// Whether the text is already phoneme symbols.
    pub fn is_custom(&self) -> bool {
        self.is_custom_phonemized == Some(true)
    }

    pub fn apply(&mut self, patch: SegmentPatch) {
        match patch {
            SegmentPatch::Emotion(emotion) => self.emotion = Some(emotion),
            SegmentPatch::Language(language) => self.language = Some(language),
            SegmentPatch::CustomPhonemized(flag) => self.is_custom_phonemized = Some(flag),
        }
    }

    pub fn with(mut self, patch: SegmentPatch) -> Self {
        self.apply(patch);
        self
    }

    /// Validate against the resolved module, if any.
    ///
    /// # Returns
    /// `(errors, warnings)` without the segment prefix.
    pub fn validate(&self, module: Option<&SpeakerModuleDescriptor>) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.text.is_empty() {
            errors.push("Text => Text cannot be empty.".to_string());
            return (errors, warnings);
        }
        if self.style.as_deref().is_some_and(|s| !s.is_empty()) {
            warnings.push("Style => The Style field is currently not supported and will be ignored.".to_string());
        }

        if let Some(module) = module {
            if let Some(emotion) = self.emotion.as_deref().filter(|e| !e.is_empty())
                && !module.emotions.iter().any(|e| e.emotionsetname == emotion)
            {
                warnings.push(format!(
                    "Emotion => The 'emotion' {} in segment with text: '{}' does not match any emotions for the module {}. Available: {}",
                    emotion,
                    self.text,
                    module.name,
                    emotion_names(module)
                ));
            }
            if let Some(language) = &self.language
                && !module.languages.contains(language)
            {
                warnings.push(format!(
                    "Language => The 'language' {} in segment with text: '{}' does not match any languages for the module {}. Available: {}",
                    language,
                    self.text,
                    module.name,
                    language_names(module)
                ));
            }
            if self.is_custom() {
                let unsupported: Vec<String> = self.text.chars().filter(|&c| module.symbol_id(c).is_none()).map(String::from).collect();
                if !unsupported.is_empty() {
                    warnings.push(format!(
                        "IsCustomPhonemized => The text '{}' is marked as custom phonemized but contains unsupported symbols. These will be removed: {}",
                        self.text,
                        unsupported.join(", ")
                    ));
                }
            }
        }

        if !self.extra.is_empty() {
            warnings.push(format!("ExtraData => Extra data is ignored: {}", describe_extra(&self.extra)));
        }

        (errors, warnings)
    }
}

/// A synthesis request as submitted by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthInput {
    #[serde(default)]
    pub module_name: String,
    #[serde(default)]
    pub actor_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_language: Option<Language>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_emotion: Option<String>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loudness: Option<Vec<f64>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SynthInput {
    pub fn new(module_name: impl Into<String>, actor_username: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self { module_name: module_name.into(), actor_username: actor_username.into(), segments, ..Default::default() }
    }

    /// Concatenated text of every segment.
    pub fn full_text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    /// Character count of the concatenated text.
    pub fn char_count(&self) -> usize {
        self.segments.iter().map(|s| s.text.chars().count()).sum()
    }

    /// Validate against every registered module.
    ///
    /// # Arguments
    /// * `modules` - All registered speaker modules
    ///
    /// # Returns
    /// `(errors, warnings)`. Any error rejects the request.
    pub fn validate(&self, modules: &[&SpeakerModuleDescriptor]) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut module = None;

        if self.module_name.trim().is_empty() {
            errors.push("The 'moduleName' is required and cannot be empty.".to_string());
        }

        if self.actor_username.trim().is_empty() {
            errors.push("The 'actorUsername' is required and cannot be empty.".to_string());
        } else {
            let actor_modules: Vec<&SpeakerModuleDescriptor> = modules.iter().copied().filter(|m| m.actor(&self.actor_username).is_some()).collect();
            if actor_modules.is_empty() {
                errors.push(format!("The 'actorUsername' {} does not match any registered actor.", self.actor_username));
            } else {
                module = actor_modules.iter().copied().find(|m| m.name == self.module_name);
                if module.is_none() {
                    let names: Vec<&str> = actor_modules.iter().map(|m| m.name.as_str()).collect();
                    errors.push(format!(
                        "The 'moduleName' {} does not match any modules for the actor {}. Available modules: {}",
                        self.module_name,
                        self.actor_username,
                        names.join(", ")
                    ));
                }
            }
        }

        match (self.default_emotion.as_deref().filter(|e| !e.is_empty()), module) {
            (None, _) => warnings.push("DefaultEmotion => Optional field is missing; the fallback Emotion will be used instead.".to_string()),
            (Some(emotion), Some(module)) if !module.emotions.iter().any(|e| e.emotionsetname == emotion) => warnings.push(format!(
                "The 'defaultEmotion' {} does not match any emotions for the module {}. The fallback Emotion will be used instead. Available: {}",
                emotion,
                module.name,
                emotion_names(module)
            )),
            _ => {}
        }

        match (&self.default_language, module) {
            (None, _) => warnings.push("DefaultLanguage => Optional field is missing; using fallback.".to_string()),
            (Some(language), Some(module)) if !module.languages.contains(language) => warnings.push(format!(
                "The 'defaultLanguage' {} does not match any languages for the module {}. The fallback Language will be used instead. Available: {}",
                language,
                module.name,
                language_names(module)
            )),
            _ => {}
        }

        match self.speed.as_deref() {
            None | Some([]) => warnings.push("Speed => No speed values provided; default speed will apply.".to_string()),
            Some(speed) => {
                if speed.iter().any(|&v| v <= MIN_SPEED) {
                    warnings.push(format!("Speed => Some Speed multiplier(s) is less than or equal to {} and will be clamped to {}.", MIN_SPEED, MIN_SPEED));
                }
                if speed.iter().any(|&v| !(0.5..=2.0).contains(&v)) {
                    warnings.push("Speed => Some Speed multiplier falls outside the interval 0.5 and 2. This may affect the quality of the output.".to_string());
                }
            }
        }

        match self.loudness.as_deref() {
            None | Some([]) => warnings.push("Loudness => No loudness values provided; default loudness will apply.".to_string()),
            Some(loudness) => {
                if loudness.iter().any(|&v| v <= 0.0) {
                    warnings.push("Loudness => Some Loudness multiplier(s) is less than or equal to 0 and will be clamped to 0.".to_string());
                }
                if loudness.iter().any(|&v| v > 2.0) {
                    warnings.push("Loudness => Some Loudness multiplier is larger than 2. This may lead to audio distortion.".to_string());
                }
            }
        }

        if !self.extra.is_empty() {
            warnings.push(format!("ExtraData => Some top-level properties were not recognized: {}", describe_extra(&self.extra)));
        }

        if self.segments.is_empty() {
            errors.push("No segments provided; 'segments' cannot be empty.".to_string());
        }
        for (i, segment) in self.segments.iter().enumerate() {
            let (seg_errors, seg_warnings) = segment.validate(module);
            errors.extend(seg_errors.into_iter().map(|e| format!("Segment {}: {}", i + 1, e)));
            warnings.extend(seg_warnings.into_iter().map(|w| format!("Segment {}: {}", i + 1, w)));
        }

        (errors, warnings)
    }

    /// Group text volume by effective language and emotion.
    pub fn nested_summary(&self) -> NestedSummary {
        if self.segments.is_empty() {
            return NestedSummary { warning: Some("No segments available to summarize.".to_string()), summary: Vec::new() };
        }

        let mut summary: Vec<LanguageSummary> = Vec::new();
        for segment in &self.segments {
            let Some(language) = segment.language.as_ref().or(self.default_language.as_ref()) else {
                continue;
            };
            let emotion = segment
                .emotion
                .as_deref()
                .filter(|e| !e.is_empty())
                .or(self.default_emotion.as_deref().filter(|e| !e.is_empty()))
                .unwrap_or("UnknownEmotion");

            let index = match summary.iter().position(|s| &s.language == language) {
                Some(index) => index,
                None => {
                    summary.push(LanguageSummary { language: language.clone(), emotions: BTreeMap::new() });
                    summary.len() - 1
                }
            };
            let stat = summary[index]
                .emotions
                .entry(emotion.to_string())
                .or_insert_with(|| EmotionStat { emotion_name: emotion.to_string(), number_of_chars: 0, quality: None });
            if !segment.text.trim().is_empty() {
                stat.number_of_chars += segment.text.chars().count();
            }
        }

        NestedSummary { warning: None, summary }
    }
}

/// Characters per effective language and emotion, with recorded quality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NestedSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub summary: Vec<LanguageSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageSummary {
    pub language: Language,
    pub emotions: BTreeMap<String, EmotionStat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionStat {
    #[serde(rename = "emotionName")]
    pub emotion_name: String,
    pub number_of_chars: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

impl NestedSummary {
    /// Fill in recorded quality for every entry the actor has data for.
    pub fn fill_qualities(&mut self, module: &SpeakerModuleDescriptor, actor_username: &str) {
        for group in &mut self.summary {
            for stat in group.emotions.values_mut() {
                if let Some(quality) = module.recorded_quality(actor_username, &group.language, &stat.emotion_name) {
                    stat.quality = Some(quality);
                }
            }
        }
    }
}

impl std::fmt::Display for NestedSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(warning) = &self.warning {
            return writeln!(f, "Warning: {}", warning);
        }
        if self.summary.is_empty() {
            return writeln!(f, "No summary data available.");
        }
        writeln!(f, "Summary:")?;
        for group in &self.summary {
            writeln!(f, "- Language: {}", group.language)?;
            for stat in group.emotions.values() {
                writeln!(f, "  - Emotion: {}, Chars: {}, Quality: {}", stat.emotion_name, stat.number_of_chars, stat.quality.as_deref().unwrap_or("N/A"))?;
            }
        }
        Ok(())
    }
}

fn emotion_names(module: &SpeakerModuleDescriptor) -> String {
    module.emotions.iter().map(|e| e.emotionsetname.as_str()).collect::<Vec<_>>().join(", ")
}

fn language_names(module: &SpeakerModuleDescriptor) -> String {
    module.languages.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(", ")
}

fn describe_extra(extra: &BTreeMap<String, serde_json::Value>) -> String {
    extra.iter().map(|(k, v)| format!("{} = {}", k, v)).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SyntheticLoader;

    fn module() -> SpeakerModuleDescriptor {
        SyntheticLoader::demo_module("demo", "narrator")
    }

    fn input(text: &str) -> SynthInput {
        SynthInput::new("demo", "narrator", vec![Segment::new(text)])
    }

    #[test]
    fn test_parse_with_extra_fields() {
        let json = r#"{
            "moduleName": "demo",
            "actorUsername": "narrator",
            "segments": [{"text": "hi", "IsCustomPhonemized": true, "mood": 3}],
            "speed": [1.0, 1.2],
            "colour": "blue"
        }"#;
        let input: SynthInput = serde_json::from_str(json).unwrap();
        assert!(input.segments[0].is_custom());
        assert!(input.segments[0].extra.contains_key("mood"));
        assert!(input.extra.contains_key("colour"));
        assert_eq!(input.speed.as_deref(), Some(&[1.0, 1.2][..]));
    }

    #[test]
    fn test_validate_ok_with_fallback_warnings() {
        let module = module();
        let (errors, warnings) = input("Hello world").validate(&[&module]);
        assert!(errors.is_empty(), "{:?}", errors);
        assert!(warnings.iter().any(|w| w.starts_with("DefaultEmotion")));
        assert!(warnings.iter().any(|w| w.starts_with("Speed")));
        assert!(warnings.iter().any(|w| w.starts_with("Loudness")));
    }

    #[test]
    fn test_validate_errors() {
        let module = module();
        let mut bad = input("");
        bad.actor_username = "ghost".to_string();
        let (errors, _) = bad.validate(&[&module]);
        assert!(errors.iter().any(|e| e.contains("does not match any registered actor")));
        assert!(errors.iter().any(|e| e == "Segment 1: Text => Text cannot be empty."));

        let mut wrong_module = input("hi");
        wrong_module.module_name = "other".to_string();
        let (errors, _) = wrong_module.validate(&[&module]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Available modules: demo"));

        let empty = SynthInput::new("", "", vec![]);
        let (errors, _) = empty.validate(&[&module]);
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_validate_curve_warnings() {
        let module = module();
        let mut request = input("hi");
        request.speed = Some(vec![0.05, 1.0]);
        request.loudness = Some(vec![0.0, 3.0]);
        let (_, warnings) = request.validate(&[&module]);
        assert!(warnings.iter().any(|w| w.contains("clamped to 0.1")));
        assert!(warnings.iter().any(|w| w.contains("outside the interval")));
        assert!(warnings.iter().any(|w| w.contains("clamped to 0.")));
        assert!(warnings.iter().any(|w| w.contains("larger than 2")));
    }

    #[test]
    fn test_segment_warnings() {
        let module = module();
        let mut request = input("hi");
        request.segments[0].style = Some("whisper".to_string());
        request.segments[0].apply(SegmentPatch::Emotion("Furious".to_string()));
        request.segments.push(Segment::new("h%").with(SegmentPatch::CustomPhonemized(true)));
        let (errors, warnings) = request.validate(&[&module]);
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.starts_with("Segment 1: Style")));
        assert!(warnings.iter().any(|w| w.starts_with("Segment 1: Emotion")));
        assert!(warnings.iter().any(|w| w.starts_with("Segment 2: IsCustomPhonemized") && w.ends_with("%")));
    }

    #[test]
    fn test_nested_summary_groups() {
        let eng = Language::new("eng");
        let swe = Language::new("swe");
        let mut request = SynthInput::new(
            "demo",
            "narrator",
            vec![
                Segment::new("hello"),
                Segment::new("hej").with(SegmentPatch::Language(swe.clone())),
                Segment::new("there").with(SegmentPatch::Emotion("Happy".to_string())),
                Segment::new("world"),
            ],
        );
        request.default_language = Some(eng.clone());

        let summary = request.nested_summary();
        assert_eq!(summary.summary.len(), 2);
        assert_eq!(summary.summary[0].language, eng);
        assert_eq!(summary.summary[0].emotions["UnknownEmotion"].number_of_chars, 10);
        assert_eq!(summary.summary[0].emotions["Happy"].number_of_chars, 5);
        assert_eq!(summary.summary[1].language, swe);
    }

    #[test]
    fn test_patch_and_full_text() {
        let mut request = SynthInput::new("demo", "narrator", vec![Segment::new("a"), Segment::new("bé")]);
        request.segments[1].apply(SegmentPatch::Emotion("happy".to_string()));
        assert_eq!(request.segments[1].emotion.as_deref(), Some("happy"));
        assert!(request.segments[0].emotion.is_none());
        assert_eq!(request.full_text(), "abé");
        assert_eq!(request.char_count(), 3);
    }
}
