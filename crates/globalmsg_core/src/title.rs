use serde::Serialize;

use crate::language::{ALL_LANGUAGES, LanguageCatalog};

/// Lookup key of a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MessageKey {
    pub name: String,
    pub language: String,
}

/// Normalize a message name to database-key form: trimmed, spaces as
/// underscores, first character upper-cased.
pub fn normalize_message_name(value: &str) -> String {
    let replaced = value.trim().replace(' ', "_");
    let mut chars = replaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Split `Base/Sub` on the last slash.
pub fn split_subpage(text: &str) -> (&str, Option<&str>) {
    match text.rfind('/') {
        Some(index) if index > 0 && index + 1 < text.len() => {
            (&text[..index], Some(&text[index + 1..]))
        }
        _ => (text, None),
    }
}

/// Derive the message key of a global-message page from its title text.
/// A subpage naming a recognized language code selects that language;
/// anything else is the `*` message named by the whole title.
pub fn message_key_for_title(title_text: &str, catalog: &LanguageCatalog) -> MessageKey {
    let trimmed = title_text.trim();
    if let (base, Some(subpage)) = split_subpage(trimmed)
        && catalog.is_known(subpage)
    {
        return MessageKey {
            name: normalize_message_name(base),
            language: subpage.to_string(),
        };
    }
    MessageKey {
        name: normalize_message_name(trimmed),
        language: ALL_LANGUAGES.to_string(),
    }
}

/// Strip a trailing `/<code>` so already-qualified names are not qualified twice.
pub fn strip_language_suffix<'a>(name: &'a str, code: &str) -> &'a str {
    name.strip_suffix(code)
        .and_then(|rest| rest.strip_suffix('/'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(name)
}
