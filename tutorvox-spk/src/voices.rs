//! Voice registry and voice resolution
//!
//! The registry is fixed at construction time. Resolution never fails: an
//! unknown or missing voice id falls through to the language/gender default.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Spoken language of a voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en-us")]
    EnUs,
    #[serde(rename = "en-gb")]
    EnGb,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Language::EnUs => "en-us",
            Language::EnGb => "en-gb",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "en-us" => Ok(Language::EnUs),
            "en-gb" => Ok(Language::EnGb),
            other => Err(format!("Unsupported language: {}", other)),
        }
    }
}

/// Voice gender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Female => "female",
            Gender::Male => "male",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "female" | "f" => Ok(Gender::Female),
            "male" | "m" => Ok(Gender::Male),
            other => Err(format!("Unsupported gender: {}", other)),
        }
    }
}

/// Quality grade of a voice, best first.
///
/// Declaration order is the rank table: sorting by this type puts the best
/// voices first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum QualityGrade {
    A,
    AMinus,
    BPlus,
    B,
    BMinus,
    CPlus,
    C,
    CMinus,
    DPlus,
    D,
    DMinus,
    FPlus,
    F,
}

impl QualityGrade {
    pub fn label(&self) -> &'static str {
        match self {
            QualityGrade::A => "A",
            QualityGrade::AMinus => "A-",
            QualityGrade::BPlus => "B+",
            QualityGrade::B => "B",
            QualityGrade::BMinus => "B-",
            QualityGrade::CPlus => "C+",
            QualityGrade::C => "C",
            QualityGrade::CMinus => "C-",
            QualityGrade::DPlus => "D+",
            QualityGrade::D => "D",
            QualityGrade::DMinus => "D-",
            QualityGrade::FPlus => "F+",
            QualityGrade::F => "F",
        }
    }
}

/// Immutable voice record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub language: Language,
    pub gender: Gender,
    pub grade: QualityGrade,
}

const fn voice(
    id: &'static str,
    name: &'static str,
    language: Language,
    gender: Gender,
    grade: QualityGrade,
) -> VoiceDescriptor {
    VoiceDescriptor { id, name, language, gender, grade }
}

use Gender::{Female, Male};
use Language::{EnGb, EnUs};
use QualityGrade as G;

static BUILTIN_VOICES: &[VoiceDescriptor] = &[
    voice("af_heart", "Heart", EnUs, Female, G::A),
    voice("af_alloy", "Alloy", EnUs, Female, G::C),
    voice("af_aoede", "Aoede", EnUs, Female, G::CPlus),
    voice("af_bella", "Bella", EnUs, Female, G::AMinus),
    voice("af_jessica", "Jessica", EnUs, Female, G::D),
    voice("af_kore", "Kore", EnUs, Female, G::CPlus),
    voice("af_nicole", "Nicole", EnUs, Female, G::BMinus),
    voice("af_nova", "Nova", EnUs, Female, G::C),
    voice("af_river", "River", EnUs, Female, G::D),
    voice("af_sarah", "Sarah", EnUs, Female, G::CPlus),
    voice("af_sky", "Sky", EnUs, Female, G::CMinus),
    voice("am_adam", "Adam", EnUs, Male, G::FPlus),
    voice("am_echo", "Echo", EnUs, Male, G::D),
    voice("am_eric", "Eric", EnUs, Male, G::D),
    voice("am_fenrir", "Fenrir", EnUs, Male, G::CPlus),
    voice("am_liam", "Liam", EnUs, Male, G::D),
    voice("am_michael", "Michael", EnUs, Male, G::CPlus),
    voice("am_onyx", "Onyx", EnUs, Male, G::D),
    voice("am_puck", "Puck", EnUs, Male, G::CPlus),
    voice("bf_alice", "Alice", EnGb, Female, G::D),
    voice("bf_emma", "Emma", EnGb, Female, G::BMinus),
    voice("bf_isabella", "Isabella", EnGb, Female, G::C),
    voice("bf_lily", "Lily", EnGb, Female, G::D),
    voice("bm_daniel", "Daniel", EnGb, Male, G::D),
    voice("bm_fable", "Fable", EnGb, Male, G::C),
    voice("bm_george", "George", EnGb, Male, G::C),
    voice("bm_lewis", "Lewis", EnGb, Male, G::DPlus),
];

/// Default voice per (language, gender)
static DEFAULT_VOICES: &[(Language, Gender, &str)] = &[
    (EnUs, Female, "af_heart"),
    (EnUs, Male, "am_michael"),
    (EnGb, Female, "bf_emma"),
    (EnGb, Male, "bm_george"),
];

/// Optional filters for [`VoiceCatalog::get_voices`]
#[derive(Debug, Clone, Copy, Default)]
pub struct VoiceFilter {
    pub language: Option<Language>,
    pub gender: Option<Gender>,
}

/// Inputs to [`VoiceCatalog::resolve_voice`]
#[derive(Debug, Clone, Copy, Default)]
pub struct VoiceQuery<'a> {
    pub voice: Option<&'a str>,
    pub language: Option<Language>,
    pub gender: Option<Gender>,
}

/// Static registry of neural voices
#[derive(Debug, Clone)]
pub struct VoiceCatalog {
    voices: &'static [VoiceDescriptor],
    defaults: &'static [(Language, Gender, &'static str)],
}

impl Default for VoiceCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VoiceCatalog {
    /// The registry shipped with the crate
    pub fn builtin() -> Self {
        Self {
            voices: BUILTIN_VOICES,
            defaults: DEFAULT_VOICES,
        }
    }

    /// Voices matching `filter`, best grade first, registry order within a grade
    pub fn get_voices(&self, filter: VoiceFilter) -> Vec<&VoiceDescriptor> {
        let mut voices: Vec<&VoiceDescriptor> = self
            .voices
            .iter()
            .filter(|v| filter.language.map_or(true, |l| v.language == l))
            .filter(|v| filter.gender.map_or(true, |g| v.gender == g))
            .collect();
        // Stable sort keeps registry order as the tiebreak.
        voices.sort_by_key(|v| v.grade);
        voices
    }

    /// Distinct languages in registry order
    pub fn languages(&self) -> Vec<Language> {
        let mut languages = Vec::new();
        for v in self.voices {
            if !languages.contains(&v.language) {
                languages.push(v.language);
            }
        }
        languages
    }

    pub fn get(&self, id: &str) -> Option<&VoiceDescriptor> {
        self.voices.iter().find(|v| v.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Pick the voice id to synthesize with.
    ///
    /// An explicit registered id wins; otherwise the language/gender default
    /// (en-us and female when unspecified) is used.
    pub fn resolve_voice(&self, query: VoiceQuery<'_>) -> &'static str {
        if let Some(id) = query.voice {
            if let Some(v) = self.voices.iter().find(|v| v.id == id) {
                return v.id;
            }
        }

        let language = query.language.unwrap_or(Language::EnUs);
        let gender = query.gender.unwrap_or(Gender::Female);

        self.defaults
            .iter()
            .find(|(l, g, _)| *l == language && *g == gender)
            .or_else(|| self.defaults.iter().find(|(l, _, _)| *l == language))
            .map(|(_, _, id)| *id)
            .or_else(|| self.defaults.first().map(|(_, _, id)| *id))
            .unwrap_or(self.voices[0].id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grades_sort_best_first() {
        assert!(QualityGrade::A < QualityGrade::AMinus);
        assert!(QualityGrade::BMinus < QualityGrade::CPlus);
        assert!(QualityGrade::FPlus < QualityGrade::F);
    }

    #[test]
    fn language_parsing() {
        assert_eq!("en-US".parse::<Language>().unwrap(), Language::EnUs);
        assert_eq!("en_gb".parse::<Language>().unwrap(), Language::EnGb);
        assert!("fr-fr".parse::<Language>().is_err());
    }

    #[test]
    fn every_default_is_registered() {
        let catalog = VoiceCatalog::builtin();
        for (_, _, id) in DEFAULT_VOICES {
            assert!(catalog.contains(id), "{} missing from registry", id);
        }
    }
}
