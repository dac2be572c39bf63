// Text collation: how two TEXT values compare and how a key normalizes
// before being hashed or stored in a B-tree.

use crate::error::{DbError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collation {
    /// Byte-for-byte comparison, no normalization.
    Binary,
    /// ASCII-range case folding only.
    AsciiCaseInsensitive,
    /// Trailing ASCII space characters are ignored.
    RightTrimSpaces,
    /// Unicode case and accent folding (NFKD + lowercase + strip combining marks).
    UnicodeCaseAccentInsensitive,
    /// Locale-tagged variant of `UnicodeCaseAccentInsensitive`, IETF BCP-47.
    Locale(String),
}

/// Locale tags this build understands. A real deployment would widen this
/// via a locale-data crate; the handful below cover the DDL surface this
/// engine exposes today.
const KNOWN_LOCALES: &[&str] = &["en-US", "en-GB", "de-DE", "fr-FR", "es-ES", "tr-TR", "sv-SE"];

fn bcp47_shape() -> Regex {
    Regex::new(r"^[A-Za-z]{2,3}(-[A-Za-z0-9]{2,8})*$").unwrap()
}

impl Collation {
    pub fn locale(tag: &str) -> Result<Self> {
        if !bcp47_shape().is_match(tag) {
            return Err(DbError::SchemaError(format!(
                "'{tag}' is not a well-formed BCP-47 locale tag"
            )));
        }
        if !KNOWN_LOCALES.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return Err(DbError::SchemaError(format!(
                "unknown locale tag '{tag}'; supported tags are {KNOWN_LOCALES:?}"
            )));
        }
        Ok(Collation::Locale(tag.to_string()))
    }

    /// Produce the normalized form used both for ordered comparison and as
    /// the pre-hash key for hash indexes, so both index kinds agree on
    /// equality.
    pub fn normalize(&self, s: &str) -> String {
        match self {
            Collation::Binary => s.to_string(),
            Collation::AsciiCaseInsensitive => s.to_ascii_lowercase(),
            Collation::RightTrimSpaces => s.trim_end_matches(' ').to_string(),
            Collation::UnicodeCaseAccentInsensitive | Collation::Locale(_) => {
                s.nfkd()
                    .filter(|c| !is_combining_mark(*c))
                    .collect::<String>()
                    .to_lowercase()
            }
        }
    }

    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match self {
            Collation::Binary => a.cmp(b),
            _ => self.normalize(a).cmp(&self.normalize(b)),
        }
    }

    pub fn equal(&self, a: &str, b: &str) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

fn is_combining_mark(c: char) -> bool {
    matches!(c as u32,
        0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_case_insensitive_folds() {
        let c = Collation::AsciiCaseInsensitive;
        assert!(c.equal("Hello", "hello"));
        assert!(!c.equal("Hello", "world"));
    }

    #[test]
    fn right_trim_ignores_trailing_spaces() {
        let c = Collation::RightTrimSpaces;
        assert!(c.equal("abc", "abc   "));
        assert!(!c.equal("abc", " abc"));
    }

    #[test]
    fn unicode_folds_accents() {
        let c = Collation::UnicodeCaseAccentInsensitive;
        assert!(c.equal("café", "CAFE\u{0301}"));
    }

    #[test]
    fn unknown_locale_tag_fails_clearly() {
        assert!(Collation::locale("xx-ZZ-not-real").is_err());
    }

    #[test]
    fn malformed_locale_tag_fails() {
        assert!(Collation::locale("not_a_tag!!").is_err());
    }

    #[test]
    fn known_locale_tag_is_accepted() {
        assert!(Collation::locale("en-US").is_ok());
    }

    #[test]
    fn binary_collation_is_byte_exact() {
        let c = Collation::Binary;
        assert!(!c.equal("abc", "ABC"));
    }
}
