//! Text pre-processing and word segmentation.

use std::collections::BTreeSet;

use regex::Regex;

use crate::error::Result;
use crate::model::{Language, SpeakerModuleDescriptor, Vocabularies};

/// Letters, marks and digits: what the phonemizer sees as one word.
const WORD_PATTERN: &str = r"[\p{L}\p{M}\p{N}]+";
/// Letter runs checked against the grapheme vocabulary. Digits are left to the normalizer.
const LETTER_PATTERN: &str = r"[\p{L}\p{M}]+";
const SPACE_PATTERN: &str = r"\s+";

/// Number and abbreviation expansion, applied to lowercased text before cleaning.
pub trait TextNormalizer: Send + Sync {
    fn normalize(&self, text: &str, language: &Language) -> String;
}

/// Leaves text untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityNormalizer;

impl TextNormalizer for IdentityNormalizer {
    fn normalize(&self, text: &str, _language: &Language) -> String {
        text.to_string()
    }
}

/// A slice of segment text: a word or the run between two words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextPiece<'a> {
    Word(&'a str),
    Delimiter(&'a str),
}

impl<'a> TextPiece<'a> {
    pub fn text(&self) -> &'a str {
        match *self {
            TextPiece::Word(s) | TextPiece::Delimiter(s) => s,
        }
    }
}

/// Cleans segment text and splits it into words.
pub struct TextProcessor {
    normalizer: Box<dyn TextNormalizer>,
    word: Regex,
    letters: Regex,
    spaces: Regex,
}

impl TextProcessor {
    /// Compile the patterns around `normalizer`.
    ///
    /// # Errors
    /// Returns [`crate::EngineError::Pattern`] if a pattern fails to compile.
    pub fn new(normalizer: Box<dyn TextNormalizer>) -> Result<Self> {
        Ok(Self { normalizer, word: Regex::new(WORD_PATTERN)?, letters: Regex::new(LETTER_PATTERN)?, spaces: Regex::new(SPACE_PATTERN)? })
    }

    /// Prepare a plain text segment for phonemization.
    ///
    /// Lowercases, expands through the normalizer, drops letters the
    /// grapheme vocabulary lacks and collapses whitespace.
    ///
    /// # Returns
    /// The cleaned text and, when letters were removed, a feedback line.
    pub fn preprocess(&self, text: &str, language: &Language, vocab: &Vocabularies) -> (String, Option<String>) {
        let lowered = text.to_lowercase();
        let normalized = self.normalizer.normalize(&lowered, language);
        let (cleaned, feedback) = self.clean_graphemes(&normalized, vocab);
        (self.collapse_whitespace(&cleaned).to_lowercase(), feedback)
    }

    /// Remove letters whose lowercase form is not in `vocab`.
    ///
    /// Only letter runs are inspected; punctuation, digits and whitespace
    /// pass through. Indices in the feedback are character positions.
    pub fn clean_graphemes(&self, text: &str, vocab: &Vocabularies) -> (String, Option<String>) {
        let mut removed = Vec::new();
        let mut cleaned = String::with_capacity(text.len());
        let mut last = 0;
        for m in self.letters.find_iter(text) {
            cleaned.push_str(&text[last..m.start()]);
            let offset = text[..m.start()].chars().count();
            for (i, c) in m.as_str().chars().enumerate() {
                if vocab.knows_grapheme(c) {
                    cleaned.push(c);
                } else {
                    removed.push(format!("'{}' at index {}", c, offset + i));
                }
            }
            last = m.end();
        }
        cleaned.push_str(&text[last..]);

        let feedback = (!removed.is_empty()).then(|| format!("Illegal graphemes removed: {}", removed.join(", ")));
        (cleaned, feedback)
    }

    /// Replace every whitespace run with one space. Whitespace-only text becomes empty.
    pub fn collapse_whitespace(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return String::new();
        }
        self.spaces.replace_all(text, " ").into_owned()
    }

    /// Split text into alternating words and delimiter runs, covering it exactly.
    pub fn split<'a>(&self, text: &'a str) -> Vec<TextPiece<'a>> {
        let mut pieces = Vec::new();
        let mut last = 0;
        for m in self.word.find_iter(text) {
            if m.start() > last {
                pieces.push(TextPiece::Delimiter(&text[last..m.start()]));
            }
            pieces.push(TextPiece::Word(m.as_str()));
            last = m.end();
        }
        if last < text.len() {
            pieces.push(TextPiece::Delimiter(&text[last..]));
        }
        pieces
    }

    /// Distinct lowercased words of `text`, in sorted order.
    pub fn words(&self, text: &str) -> BTreeSet<String> {
        self.word.find_iter(text).map(|m| m.as_str().to_lowercase()).collect()
    }
}

/// Lowercase a custom phonemized segment and drop symbols the module lacks.
///
/// # Returns
/// The kept symbols and, when any were dropped, a feedback line.
pub fn validate_phonemes(text: &str, module: &SpeakerModuleDescriptor) -> (String, Option<String>) {
    let mut removed: Vec<String> = Vec::new();
    let kept: String = text
        .to_lowercase()
        .chars()
        .filter(|&c| {
            let known = module.symbol_id(c).is_some();
            if !known {
                removed.push(c.to_string());
            }
            known
        })
        .collect();
    let feedback = (!removed.is_empty()).then(|| format!("Illegal phonemes removed: {}", removed.join(", ")));
    (kept, feedback)
}
