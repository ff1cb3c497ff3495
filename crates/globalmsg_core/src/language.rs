use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};

use crate::config::LanguagesSection;

/// Language code that asks for raw message keys instead of message text.
pub const DEBUG_LANGUAGE_CODE: &str = "qqx";

/// Sentinel language of rows that apply to every language.
pub const ALL_LANGUAGES: &str = "*";

const BUILTIN_CODES: &[&str] = &[
    "ar", "cs", "de", "de-at", "de-ch", "de-formal", "en", "en-gb", "es", "es-formal", "fi", "fr",
    "he", "it", "ja", "ko", "nl", "nl-informal", "pl", "pt", "pt-br", "ru", "sv", "uk", "zh",
    "zh-cn", "zh-hans", "zh-hant", "zh-tw",
];

const BUILTIN_FALLBACKS: &[(&str, &[&str])] = &[
    ("de-at", &["de"]),
    ("de-ch", &["de"]),
    ("de-formal", &["de"]),
    ("en-gb", &["en"]),
    ("es-formal", &["es"]),
    ("nl-informal", &["nl"]),
    ("pt-br", &["pt"]),
    ("uk", &["ru"]),
    ("zh", &["zh-hans"]),
    ("zh-cn", &["zh-hans"]),
    ("zh-hant", &["zh-hans"]),
    ("zh-tw", &["zh-hant", "zh-hans"]),
];

/// Recognized language codes and their strict fallback chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageCatalog {
    known: BTreeSet<String>,
    fallbacks: BTreeMap<String, Vec<String>>,
}

impl Default for LanguageCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl LanguageCatalog {
    pub fn builtin() -> Self {
        let known = BUILTIN_CODES.iter().map(|code| code.to_string()).collect();
        let fallbacks = BUILTIN_FALLBACKS
            .iter()
            .map(|(code, chain)| {
                (
                    code.to_string(),
                    chain.iter().map(|item| item.to_string()).collect(),
                )
            })
            .collect();
        Self { known, fallbacks }
    }

    /// Builtin table extended by the `[languages]` config section.
    /// Configured chains replace builtin ones for the same code.
    pub fn from_config(section: &LanguagesSection) -> Result<Self> {
        let mut catalog = Self::builtin();
        for code in &section.known {
            catalog.known.insert(normalize_code(code)?);
        }
        for code in section.fallbacks.keys() {
            catalog.known.insert(normalize_code(code)?);
        }
        for (code, chain) in &section.fallbacks {
            let code = normalize_code(code)?;
            let chain = chain
                .iter()
                .map(|item| normalize_code(item))
                .collect::<Result<Vec<_>>>()?;
            catalog.fallbacks.insert(code, chain);
        }
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn is_known(&self, code: &str) -> bool {
        self.known.contains(code)
    }

    /// Strict fallback chain for `code`, most specific first. Never contains
    /// `code` itself or the `*` sentinel.
    pub fn fallbacks_for(&self, code: &str) -> Vec<String> {
        let Some(chain) = self.fallbacks.get(code) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        chain
            .iter()
            .filter(|item| item.as_str() != code && item.as_str() != ALL_LANGUAGES)
            .filter(|item| seen.insert(item.as_str()))
            .cloned()
            .collect()
    }

    pub fn known_codes(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }

    fn validate(&self) -> Result<()> {
        for (code, chain) in &self.fallbacks {
            for item in chain {
                if item == code {
                    bail!("fallback chain for `{code}` must not contain `{code}` itself");
                }
                if !self.known.contains(item) {
                    bail!("fallback chain for `{code}` names unknown language `{item}`");
                }
            }
        }
        Ok(())
    }
}

fn normalize_code(value: &str) -> Result<String> {
    let code = value.trim().to_ascii_lowercase();
    if code.is_empty() {
        bail!("language code cannot be empty");
    }
    if code == ALL_LANGUAGES {
        bail!("`*` is reserved and cannot be configured as a language code");
    }
    if code.contains('/') || code.chars().any(char::is_whitespace) {
        bail!("invalid language code `{value}`");
    }
    Ok(code)
}
