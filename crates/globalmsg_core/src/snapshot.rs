use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::MessageRow;

/// Every stored message, grouped by language then name. Always rebuilt
/// wholesale from the store; never patched in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    languages: BTreeMap<String, BTreeMap<String, String>>,
}

impl CacheSnapshot {
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = MessageRow>,
    {
        let mut languages: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for row in rows {
            languages
                .entry(row.language)
                .or_default()
                .insert(row.name, row.text);
        }
        Self { languages }
    }

    /// Non-empty text stored for `name` under `language`.
    pub fn lookup(&self, language: &str, name: &str) -> Option<&str> {
        self.languages
            .get(language)?
            .get(name)
            .map(String::as_str)
            .filter(|text| !text.is_empty())
    }

    pub fn has_language(&self, language: &str) -> bool {
        self.languages.contains_key(language)
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.languages.keys().map(String::as_str)
    }

    pub fn messages(&self, language: &str) -> impl Iterator<Item = (&str, &str)> {
        self.languages
            .get(language)
            .into_iter()
            .flat_map(|messages| messages.iter())
            .map(|(name, text)| (name.as_str(), text.as_str()))
    }

    pub fn message_count(&self) -> usize {
        self.languages.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.message_count() == 0
    }

    /// Short content digest, stable across processes for identical contents.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (language, messages) in &self.languages {
            for (name, text) in messages {
                hasher.update(language.as_bytes());
                hasher.update([0u8]);
                hasher.update(name.as_bytes());
                hasher.update([0u8]);
                hasher.update(text.as_bytes());
                hasher.update([0xffu8]);
            }
        }
        let digest = hasher.finalize();
        let mut output = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            output.push_str(&format!("{byte:02x}"));
        }
        output
    }
}
