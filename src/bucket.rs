// src/bucket.rs
//! Keyword buckets: a named topic plus the search terms fanned out for it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const TITLE_DISPLAY_CHARS: usize = 40;
pub const KEY_SOURCE_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordBucket {
    pub key: String,
    #[serde(default)]
    pub title: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub source_market_id: Option<String>,
}

impl KeywordBucket {
    pub fn new<K, T, I, S>(key: K, title: T, keywords: I) -> Self
    where
        K: Into<String>,
        T: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            title: title.into(),
            keywords: keywords.into_iter().map(Into::into).collect(),
            source_market_id: None,
        }
    }

    pub fn with_market_id(mut self, id: impl Into<String>) -> Self {
        self.source_market_id = Some(id.into());
        self
    }

    /// Title for display; falls back to the key.
    pub fn label(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.key
        } else {
            &self.title
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key.trim().is_empty() {
            return Err(ConfigError::EmptyKey);
        }
        if self.keywords.is_empty() {
            return Err(ConfigError::NoKeywords(self.key.clone()));
        }
        if let Some(index) = self.keywords.iter().position(|k| k.trim().is_empty()) {
            return Err(ConfigError::BlankKeyword {
                bucket: self.key.clone(),
                index,
            });
        }
        Ok(())
    }

    /// Copy with the keyword list replaced, validated before it is returned.
    pub fn with_keywords(&self, keywords: Vec<String>) -> Result<Self, ConfigError> {
        let next = Self {
            keywords: keywords.into_iter().map(|k| k.trim().to_string()).collect(),
            ..self.clone()
        };
        next.validate()?;
        Ok(next)
    }
}

/// Split into usable buckets and the errors for the ones skipped. Later
/// duplicates of a key are rejected.
pub fn partition_valid(buckets: Vec<KeywordBucket>) -> (Vec<KeywordBucket>, Vec<ConfigError>) {
    let mut seen = HashSet::new();
    let mut ok = Vec::with_capacity(buckets.len());
    let mut errors = Vec::new();
    for b in buckets {
        if let Err(e) = b.validate() {
            errors.push(e);
            continue;
        }
        if !seen.insert(b.key.clone()) {
            errors.push(ConfigError::DuplicateKey(b.key));
            continue;
        }
        ok.push(b);
    }
    (ok, errors)
}

/// `"Will Maduro leave office?"` -> `"will_maduro_leave_office"`.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut gap = false;
    for c in s.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if gap && !out.is_empty() {
                out.push('_');
            }
            out.push(c);
            gap = false;
        } else {
            gap = true;
        }
    }
    out
}

pub fn bucket_key_for(title: &str) -> String {
    let head: String = title.chars().take(KEY_SOURCE_CHARS).collect();
    slugify(&head)
}

pub fn display_title(title: &str) -> String {
    if title.chars().count() > TITLE_DISPLAY_CHARS {
        let head: String = title.chars().take(TITLE_DISPLAY_CHARS).collect();
        format!("{head}...")
    } else {
        title.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_name_the_bucket() {
        assert_eq!(
            KeywordBucket::new(" ", "t", ["a"]).validate(),
            Err(ConfigError::EmptyKey)
        );
        assert_eq!(
            KeywordBucket::new("b", "t", Vec::<String>::new()).validate(),
            Err(ConfigError::NoKeywords("b".into()))
        );
        assert_eq!(
            KeywordBucket::new("b", "t", ["ok", "  "]).validate(),
            Err(ConfigError::BlankKeyword {
                bucket: "b".into(),
                index: 1
            })
        );
    }

    #[test]
    fn duplicates_and_invalid_are_skipped() {
        let (ok, errs) = partition_valid(vec![
            KeywordBucket::new("a", "", ["x"]),
            KeywordBucket::new("a", "", ["y"]),
            KeywordBucket::new("b", "", Vec::<String>::new()),
            KeywordBucket::new("c", "", ["z"]),
        ]);
        assert_eq!(ok.iter().map(|b| b.key.as_str()).collect::<Vec<_>>(), ["a", "c"]);
        assert_eq!(errs.len(), 2);
        assert_eq!(ok[0].keywords, ["x"]);
    }

    #[test]
    fn keys_and_titles() {
        assert_eq!(slugify("Will Maduro leave office by 2025?"), "will_maduro_leave_office_by_2025");
        assert_eq!(slugify("--Fed  rate--"), "fed_rate");
        let long = "Will the Federal Reserve cut interest rates in December?";
        assert_eq!(display_title(long), "Will the Federal Reserve cut interest ra...");
        assert_eq!(display_title("Short"), "Short");
    }
}
