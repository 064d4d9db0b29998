//! Request orchestration: annotation streams and the chunk loop.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::loaded::{LoadedModule, emotion_key, language_key};
use super::text::{TextPiece, TextProcessor};
use crate::audio::OutputPacket;
use crate::audio::curve::resample;
use crate::error::{EngineError, Result};
use crate::model::{END_MARKER, Language, MIN_SPEED, START_MARKER, SpeakerModuleDescriptor, SynthInput};
use crate::tts::{EncoderInput, VocoderState};

/// Speed and loudness, one value per character of the request text.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Curves {
    pub(crate) speed: Vec<f64>,
    pub(crate) loudness: Vec<f64>,
}

impl Curves {
    /// Clamp the request curves and stretch them over the concatenated text.
    pub(crate) fn from_input(input: &SynthInput) -> Self {
        let chars = input.char_count();
        let prepare = |values: Option<&Vec<f64>>, floor: f64| {
            let values: Vec<f64> = match values {
                Some(v) if !v.is_empty() => v.iter().map(|&x| x.max(floor)).collect(),
                _ => vec![1.0],
            };
            resample(&values, chars)
        };
        Self { speed: prepare(input.speed.as_ref(), MIN_SPEED), loudness: prepare(input.loudness.as_ref(), 0.0) }
    }

    /// Values for `len` characters from `start`, resampled to `symbols`.
    fn piece(curve: &[f64], start: usize, len: usize, symbols: usize) -> Vec<f32> {
        let slice = curve.get(start..(start + len).min(curve.len())).unwrap_or_default();
        if slice.is_empty() {
            return vec![1.0; symbols];
        }
        resample(slice, symbols).into_iter().map(|v| v as f32).collect()
    }
}

/// Symbol ids of `text`, skipping characters the module does not know.
fn encode_symbols(module: &SpeakerModuleDescriptor, text: &str) -> Vec<i32> {
    text.chars()
        .filter_map(|c| {
            let id = module.symbol_id(c);
            if id.is_none() {
                warn!("⚠️  Symbol {:?} not in the symbol table of '{}', skipping", c, module.name);
            }
            id
        })
        .collect()
}

fn push_piece(streams: &mut EncoderInput, ids: &[i32], emotion: i32, language: i32, curves: &Curves, start: usize, len: usize) {
    let speed = Curves::piece(&curves.speed, start, len, ids.len());
    let loudness = Curves::piece(&curves.loudness, start, len, ids.len());
    for ((&id, s), l) in ids.iter().zip(speed).zip(loudness) {
        streams.push(id, emotion, language, s, l);
    }
}

/// Build the encoder streams for a prepared request.
///
/// # Arguments
/// * `module` - Speaker module providing symbols, emotions and languages
/// * `input` - Request with defaults filled in and text pre-processed
/// * `curves` - Per-character speed and loudness
/// * `actor_key` - Speaker actor key
/// * `text` - Word splitter
/// * `phonemes` - Cached phonemes of a lowercased word in a language
///
/// # Errors
/// Returns a resource error if the module lacks the start or end marker.
pub(crate) fn build_streams<F>(
    module: &SpeakerModuleDescriptor,
    input: &SynthInput,
    curves: &Curves,
    actor_key: i32,
    text: &TextProcessor,
    mut phonemes: F,
) -> Result<EncoderInput>
where
    F: FnMut(&Language, &str) -> Option<String>,
{
    let default_language = input
        .default_language
        .clone()
        .or_else(|| module.languages.first().cloned())
        .ok_or_else(|| EngineError::resource(format!("module '{}' declares no languages", module.name)))?;
    let marker = |symbol: &str| module.symbol_to_id.get(symbol).copied().ok_or_else(|| EngineError::resource(format!("module '{}' has no {} marker", module.name, symbol)));
    let (start_marker, end_marker) = (marker(START_MARKER)?, marker(END_MARKER)?);

    let mut streams = EncoderInput { actor_key, ..Default::default() };
    let mut cursor = 0; // Character offset into the curves
    let count = input.segments.len();
    for (i, segment) in input.segments.iter().enumerate() {
        let language = segment.language.as_ref().unwrap_or(&default_language);
        let language_key = language_key(module, language);
        let emotion_key = emotion_key(module, segment.emotion.as_deref().or(input.default_emotion.as_deref()));

        if segment.is_custom() {
            let len = segment.text.chars().count();
            let ids = encode_symbols(module, &segment.text.to_lowercase());
            push_piece(&mut streams, &ids, emotion_key, language_key, curves, cursor, len);
            cursor += len;
        } else {
            for piece in text.split(&segment.text) {
                let len = piece.text().chars().count();
                let ids = match piece {
                    TextPiece::Word(word) => match phonemes(language, &word.to_lowercase()) {
                        Some(p) => encode_symbols(module, &p),
                        None => {
                            warn!("⚠️  No phonemes for '{}', skipping", word);
                            cursor += len;
                            continue;
                        }
                    },
                    TextPiece::Delimiter(run) => encode_symbols(module, run),
                };
                push_piece(&mut streams, &ids, emotion_key, language_key, curves, cursor, len);
                cursor += len;
            }
        }

        let next_starts_with_space = input.segments.get(i + 1).is_some_and(|next| next.text.starts_with(' '));
        if i + 1 < count
            && !segment.text.ends_with(' ')
            && next_starts_with_space
            && let Some(space) = module.symbol_id(' ')
        {
            let speed = streams.speed.last().copied().unwrap_or(1.0);
            let loudness = streams.loudness.last().copied().unwrap_or(1.0);
            streams.push(space, emotion_key, language_key, speed, loudness);
        }
    }

    let fallback = (emotion_key(module, input.default_emotion.as_deref()), language_key(module, &default_language));
    streams.wrap(start_marker, end_marker, fallback);
    Ok(streams)
}

/// Phonemize every word the lookup caches of `module` do not hold yet.
async fn phonemize_missing(module: &LoadedModule, text: &TextProcessor, input: &SynthInput) -> Result<()> {
    let Some(default_language) = input.default_language.clone().or_else(|| module.descriptor.languages.first().cloned()) else {
        return Ok(());
    };

    let mut missing: Vec<BTreeSet<String>> = vec![BTreeSet::new(); module.groups.len()];
    for segment in input.segments.iter().filter(|s| !s.is_custom()) {
        let language = segment.language.as_ref().unwrap_or(&default_language);
        let Some(group) = module.group_for(language) else {
            continue;
        };
        let Some(index) = module.groups.iter().position(|g| std::ptr::eq(g, group)) else {
            continue;
        };
        let lookup = group.lookup.lock();
        missing[index].extend(text.words(&segment.text).into_iter().filter(|w| !lookup.contains_key(w)));
    }

    for (group, words) in module.groups.iter().zip(missing) {
        if words.is_empty() {
            continue;
        }
        let words: Vec<String> = words.into_iter().collect();
        debug!("Phonemizing {} word(s) with '{}'", words.len(), group.pack);
        let results = group.phonemizer.phonemize(&words).await?;
        group.lookup.lock().extend(results);
    }
    Ok(())
}

/// Run a prepared request through every stage, handing each finished chunk to `on_packet`.
///
/// # Returns
/// Number of packets delivered. The last one is marked final.
///
/// # Errors
/// Any graph failure ends the request. Packets already delivered stay delivered.
pub(crate) async fn run_request<F>(module: &LoadedModule, text: &TextProcessor, input: &SynthInput, mut on_packet: F) -> Result<usize>
where
    F: FnMut(OutputPacket),
{
    let descriptor = &module.descriptor;
    let actor_key = descriptor.actor(&input.actor_username).map(|a| a.actorkey).ok_or_else(|| EngineError::UnknownActor(input.actor_username.clone()))?;

    phonemize_missing(module, text, input).await?;
    let curves = Curves::from_input(input);
    let streams = build_streams(descriptor, input, &curves, actor_key, text, |language, word| module.lookup(language, word))?;
    debug!("Encoder input: {} symbols", streams.len());

    let encoded = module.encoder.infer(&streams).await?;
    let mut state = module.decoder.preprocess(encoded).await?;
    let plans = module.decoder.schedule(&state);
    let sample_rate = descriptor.config.sampling_rate;
    if plans.is_empty() {
        on_packet(OutputPacket::audio(Vec::new(), sample_rate, true));
        return Ok(1);
    }

    let mut vocoder_state = VocoderState::default();
    for plan in &plans {
        let features = module.decoder.decode_chunk(&mut state, plan, actor_key).await?;
        let samples = module.vocoder.vocode(&mut vocoder_state, plan.chunk_type, features, &state.loudness, plan.is_final).await?;
        debug!("Chunk {} ({:?}) -> {} samples", plan.index, plan.chunk_type, samples.len());
        on_packet(OutputPacket::audio(samples, sample_rate, plan.is_final));
    }

    info!("🔊 Synthesized {} symbols in {} chunk(s)", streams.len(), plans.len());
    Ok(plans.len())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::engine::text::IdentityNormalizer;
    use crate::graph::SyntheticLoader;
    use crate::model::{Segment, SegmentPatch};

    fn processor() -> TextProcessor {
        TextProcessor::new(Box::new(IdentityNormalizer)).unwrap()
    }

    fn letters(_: &Language, word: &str) -> Option<String> {
        Some(word.to_string())
    }

    fn streams_for(input: &SynthInput) -> EncoderInput {
        let module = SyntheticLoader::demo_module("demo", "narrator");
        build_streams(&module, input, &Curves::from_input(input), 1, &processor(), letters).unwrap()
    }

    fn hello_world() -> SynthInput {
        let mut input = SynthInput::new("demo", "narrator", vec![Segment::new("hello world")]);
        input.default_language = Some(Language::new("eng"));
        input
    }

    #[test]
    fn test_hello_world_streams() {
        let input = hello_world();
        let curves = Curves::from_input(&input);
        assert_eq!(curves.speed, vec![1.0; 11]);
        assert_eq!(curves.loudness, vec![1.0; 11]);

        let module = SyntheticLoader::demo_module("demo", "narrator");
        let streams = streams_for(&input);
        assert_eq!(streams.len(), 13);
        assert_eq!(streams.phoneme_ids[0], module.symbol_to_id[START_MARKER]);
        assert_eq!(streams.phoneme_ids[12], module.symbol_to_id[END_MARKER]);
        assert_eq!(streams.phoneme_ids[1], module.symbol_id('h').unwrap());
        assert_eq!(streams.phoneme_ids[6], module.symbol_id(' ').unwrap());
        let emotionless = module.emotion_key("Emotionless").unwrap();
        assert!(streams.emotion_keys.iter().all(|&k| k == emotionless));
        assert!(streams.speed.iter().all(|&s| s == 1.0));
        assert_eq!(streams.actor_key, 1);
    }

    #[test]
    fn test_markers_copy_neighbours() {
        let mut input = SynthInput::new(
            "demo",
            "narrator",
            vec![Segment::new("ab").with(SegmentPatch::Emotion("Happy".to_string())), Segment::new("cd")],
        );
        input.speed = Some(vec![0.5, 2.0]);
        let streams = streams_for(&input);
        assert_eq!(streams.len(), 6);
        assert_eq!(streams.emotion_keys, vec![1, 1, 1, 0, 0, 0]);
        assert_eq!(streams.speed[0], streams.speed[1]);
        assert_eq!(streams.speed[5], streams.speed[4]);
        assert!(streams.speed[1] < streams.speed[4]);
    }

    #[test]
    fn test_space_inserted_between_segments() {
        let input = SynthInput::new("demo", "narrator", vec![Segment::new("ab"), Segment::new(" cd")]);
        let module = SyntheticLoader::demo_module("demo", "narrator");
        let streams = streams_for(&input);
        let space = module.symbol_id(' ').unwrap();
        // a b <space> <space> c d, plus markers
        assert_eq!(streams.len(), 8);
        assert_eq!(&streams.phoneme_ids[3..5], &[space, space]);

        let input = SynthInput::new("demo", "narrator", vec![Segment::new("ab "), Segment::new(" cd")]);
        assert_eq!(streams_for(&input).len(), 8);
    }

    #[test]
    fn test_unknown_words_skipped_keep_curve_alignment() {
        let mut input = SynthInput::new("demo", "narrator", vec![Segment::new("xx ab")]);
        input.speed = Some(vec![0.5, 0.5, 0.5, 2.0, 2.0]);
        let module = SyntheticLoader::demo_module("demo", "narrator");
        let lookup: HashMap<&str, &str> = [("ab", "ab")].into_iter().collect();
        let streams =
            build_streams(&module, &input, &Curves::from_input(&input), 1, &processor(), |_, w| lookup.get(w).map(|p| p.to_string())).unwrap();
        // <start> <space> a b <end>
        assert_eq!(streams.len(), 5);
        assert_eq!(streams.speed[2], 2.0);
        assert_eq!(streams.speed[3], 2.0);
    }

    #[test]
    fn test_custom_segment_uses_symbols() {
        let input = SynthInput::new("demo", "narrator", vec![Segment::new("ðə").with(SegmentPatch::CustomPhonemized(true))]);
        let module = SyntheticLoader::demo_module("demo", "narrator");
        let streams = streams_for(&input);
        assert_eq!(streams.phoneme_ids[1..3], [module.symbol_id('ð').unwrap(), module.symbol_id('ə').unwrap()]);
    }

    #[test]
    fn test_curves_clamped_and_stretched() {
        let mut input = hello_world();
        input.speed = Some(vec![0.0, 3.0]);
        input.loudness = Some(vec![-1.0]);
        let curves = Curves::from_input(&input);
        assert_eq!(curves.speed.len(), 11);
        assert_eq!(curves.speed[0], MIN_SPEED);
        assert_eq!(curves.speed[10], 3.0);
        assert_eq!(curves.loudness, vec![0.0; 11]);
    }
}
