//! Locale identity and hierarchical language matching.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Penalty for a primary code mismatch. Comparison stops there.
pub const PRIMARY_MISMATCH_PENALTY: u32 = 50;
const ISO639_3_PENALTY: u32 = 5;
const GLOTTOCODE_PENALTY: u32 = 15;
const REGION_PENALTY: u32 = 5;
const SUBREGION_PENALTY: u32 = 2;
const DIALECT_PENALTY: u32 = 2;

/// A language as described by codes of increasing specificity.
///
/// Equality and hashing ignore `languagekey`, which is only meaningful
/// inside a single module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Language {
    pub iso639_2: String, // Primary code, required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso639_3: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glottocode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso3166_1: Option<String>, // Region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso3166_2: Option<String>, // Sub-region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customdialect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languagekey: Option<i32>, // Module-local key fed to the encoder
}

impl PartialEq for Language {
    fn eq(&self, other: &Self) -> bool {
        self.iso639_2 == other.iso639_2
            && self.iso639_3 == other.iso639_3
            && self.glottocode == other.glottocode
            && self.iso3166_1 == other.iso3166_1
            && self.iso3166_2 == other.iso3166_2
            && self.customdialect == other.customdialect
    }
}

impl Eq for Language {}

impl Hash for Language {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.iso639_2.hash(state);
        self.iso639_3.hash(state);
        self.glottocode.hash(state);
        self.iso3166_1.hash(state);
        self.iso3166_2.hash(state);
        self.customdialect.hash(state);
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.iso639_2)?;
        match (&self.iso3166_1, &self.customdialect) {
            (Some(region), Some(dialect)) => write!(f, " ({} - {})", region, dialect),
            (Some(region), None) => write!(f, " ({})", region),
            (None, Some(dialect)) => write!(f, " ({})", dialect),
            (None, None) => Ok(()),
        }
    }
}

/// Result of a hierarchical comparison.
#[derive(Debug, Clone)]
pub struct LanguageDistance {
    pub distance: u32,
    pub differences: Vec<String>,
}

/// Closest candidate found by [`find_closest_language`].
#[derive(Debug, Clone)]
pub struct ClosestLanguage<'a> {
    pub language: &'a Language,
    pub distance: u32,
    pub feedback: String,
}

fn same(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

fn show(value: Option<&str>) -> &str {
    value.unwrap_or("")
}

impl Language {
    /// Language with only the primary code set.
    pub fn new(iso639_2: impl Into<String>) -> Self {
        Self { iso639_2: iso639_2.into(), ..Default::default() }
    }

    pub fn with_region(mut self, iso3166_1: impl Into<String>) -> Self {
        self.iso3166_1 = Some(iso3166_1.into());
        self
    }

    pub fn with_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.customdialect = Some(dialect.into());
        self
    }

    pub fn with_key(mut self, key: i32) -> Self {
        self.languagekey = Some(key);
        self
    }

    /// Named fields in a fixed order, used for partial matching.
    fn fields(&self) -> [(&'static str, Option<String>); 7] {
        [
            ("iso639_2", Some(self.iso639_2.clone())),
            ("iso639_3", self.iso639_3.clone()),
            ("glottocode", self.glottocode.clone()),
            ("iso3166_1", self.iso3166_1.clone()),
            ("iso3166_2", self.iso3166_2.clone()),
            ("customdialect", self.customdialect.clone()),
            ("languagekey", self.languagekey.map(|k| k.to_string())),
        ]
    }

    /// Partial match: every non-blank field of `self` must equal the
    /// candidate's field, ignoring case.
    pub fn matches(&self, candidate: &Language) -> bool {
        let wanted = self.fields();
        let offered = candidate.fields();
        wanted.iter().zip(offered.iter()).all(|((_, want), (_, have))| match want {
            Some(w) if !w.trim().is_empty() => have.as_deref().is_some_and(|h| h.eq_ignore_ascii_case(w)),
            _ => true,
        })
    }

    /// Weighted, hierarchical mismatch distance to `other`.
    ///
    /// A primary code mismatch returns [`PRIMARY_MISMATCH_PENALTY`] at once.
    /// The sub-region is compared only when the regions match.
    pub fn distance(&self, other: &Language) -> LanguageDistance {
        let mut distance = 0;
        let mut differences = Vec::new();

        if !self.iso639_2.eq_ignore_ascii_case(&other.iso639_2) {
            differences.push(format!("iso639_2 mismatch => +{} penalty. '{}' vs. '{}'", PRIMARY_MISMATCH_PENALTY, self.iso639_2, other.iso639_2));
            return LanguageDistance { distance: PRIMARY_MISMATCH_PENALTY, differences };
        }
        differences.push(format!("iso639_2 match: '{}'", self.iso639_2));

        let checks = [
            ("iso639_3", self.iso639_3.as_deref(), other.iso639_3.as_deref(), ISO639_3_PENALTY),
            ("glottocode", self.glottocode.as_deref(), other.glottocode.as_deref(), GLOTTOCODE_PENALTY),
        ];
        for (name, a, b, penalty) in checks {
            if same(a, b) {
                differences.push(format!("{} match: '{}'", name, show(a)));
            } else {
                distance += penalty;
                differences.push(format!("{} mismatch => +{} penalty. '{}' vs. '{}'", name, penalty, show(a), show(b)));
            }
        }

        if same(self.iso3166_1.as_deref(), other.iso3166_1.as_deref()) {
            differences.push(format!("iso3166_1 match: '{}'", show(self.iso3166_1.as_deref())));
            if same(self.iso3166_2.as_deref(), other.iso3166_2.as_deref()) {
                differences.push(format!("iso3166_2 match: '{}'", show(self.iso3166_2.as_deref())));
            } else {
                distance += SUBREGION_PENALTY;
                differences.push(format!(
                    "iso3166_2 mismatch => +{} penalty. '{}' vs. '{}'",
                    SUBREGION_PENALTY,
                    show(self.iso3166_2.as_deref()),
                    show(other.iso3166_2.as_deref())
                ));
            }
        } else {
            distance += REGION_PENALTY;
            differences.push(format!(
                "iso3166_1 mismatch => +{} penalty. '{}' vs. '{}'",
                REGION_PENALTY,
                show(self.iso3166_1.as_deref()),
                show(other.iso3166_1.as_deref())
            ));
            differences.push("Skipping iso3166_2 comparison because iso3166_1 differs.".to_string());
        }

        if same(self.customdialect.as_deref(), other.customdialect.as_deref()) {
            differences.push(format!("customdialect match: '{}'", show(self.customdialect.as_deref())));
        } else {
            distance += DIALECT_PENALTY;
            differences.push(format!(
                "customdialect mismatch => +{} penalty. '{}' vs. '{}'",
                DIALECT_PENALTY,
                show(self.customdialect.as_deref()),
                show(other.customdialect.as_deref())
            ));
        }

        LanguageDistance { distance, differences }
    }
}

/// Find the candidate closest to `input`.
///
/// Ties go to the first candidate in iteration order.
///
/// # Returns
/// `None` when there are no candidates.
pub fn find_closest_language<'a, I>(input: &Language, candidates: I) -> Option<ClosestLanguage<'a>>
where
    I: IntoIterator<Item = &'a Language>,
{
    let mut best: Option<(&'a Language, LanguageDistance)> = None;
    for candidate in candidates {
        let result = input.distance(candidate);
        if best.as_ref().is_none_or(|(_, b)| result.distance < b.distance) {
            best = Some((candidate, result));
        }
    }

    best.map(|(language, result)| ClosestLanguage {
        language,
        distance: result.distance,
        feedback: format!("Closest match: {}\nDistance: {}\nDifferences:\n{}", language, result.distance, result.differences.join("\n")),
    })
}
