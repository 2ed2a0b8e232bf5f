//! Lock name normalization.
//!
//! Databases limit the length and alphabet of lock identifiers. A caller name
//! that already fits is used verbatim so it stays readable in server-side lock
//! views; anything else is replaced by a fixed-length key ending in a SHA-256
//! digest of the full name. Verbatim keys are always strictly shorter than
//! `max_length` and hashed keys are always exactly `max_length` bytes, so the
//! two forms never collide.

use std::fmt;
use std::hash::{Hash, Hasher};

use sha2::{Digest, Sha256};

use crate::error::LockError;

pub const DEFAULT_MAX_KEY_LENGTH: usize = 255;
const MIN_KEY_LENGTH: usize = 16;

/// Characters a backend accepts in a storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCharset {
    Any,
    /// `[A-Za-z0-9_]`
    AsciiIdentifier,
}

impl KeyCharset {
    fn allows(self, ch: char) -> bool {
        match self {
            KeyCharset::Any => true,
            KeyCharset::AsciiIdentifier => ch.is_ascii_alphanumeric() || ch == '_',
        }
    }
}

/// Identifier constraints of a lock backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRules {
    max_length: usize,
    charset: KeyCharset,
}

impl KeyRules {
    pub fn new(max_length: usize, charset: KeyCharset) -> Result<Self, LockError> {
        if max_length < MIN_KEY_LENGTH {
            return Err(LockError::InvalidConfig(format!(
                "key max_length ({max_length}) must be at least {MIN_KEY_LENGTH}"
            )));
        }
        Ok(Self {
            max_length,
            charset,
        })
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn charset(&self) -> KeyCharset {
        self.charset
    }

    fn accepts_verbatim(&self, name: &str) -> bool {
        !name.is_empty()
            && name.len() < self.max_length
            && name.chars().all(|ch| self.charset.allows(ch))
    }
}

impl Default for KeyRules {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_KEY_LENGTH,
            charset: KeyCharset::Any,
        }
    }
}

/// Normalized identity of a named lock.
///
/// Equality and hashing only consider the storage key; the caller's name is
/// kept for logging.
#[derive(Debug, Clone)]
pub struct NamedLockKey {
    name: String,
    storage_key: String,
}

impl NamedLockKey {
    pub fn normalize(name: &str, rules: &KeyRules) -> Self {
        let storage_key = if rules.accepts_verbatim(name) {
            name.to_string()
        } else {
            hashed_key(name, rules)
        };
        Self {
            name: name.to_string(),
            storage_key,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn is_hashed(&self) -> bool {
        self.name != self.storage_key
    }
}

impl PartialEq for NamedLockKey {
    fn eq(&self, other: &Self) -> bool {
        self.storage_key == other.storage_key
    }
}

impl Eq for NamedLockKey {}

impl Hash for NamedLockKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.storage_key.hash(state);
    }
}

impl fmt::Display for NamedLockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key)
    }
}

fn hashed_key(name: &str, rules: &KeyRules) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let hex = format!("{digest:x}");
    let hash_len = hex.len().min(rules.max_length);
    let prefix_len = rules.max_length - hash_len;

    let mut key = String::with_capacity(rules.max_length);
    for ch in name.chars().filter(|ch| rules.charset.allows(*ch)) {
        if key.len() + ch.len_utf8() > prefix_len {
            break;
        }
        key.push(ch);
    }
    while key.len() < prefix_len {
        key.push('_');
    }
    key.push_str(&hex[..hash_len]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident_rules(max_length: usize) -> KeyRules {
        KeyRules::new(max_length, KeyCharset::AsciiIdentifier).expect("valid rules")
    }

    #[test]
    fn short_valid_names_are_kept_verbatim() {
        let key = NamedLockKey::normalize("orders_sync", &KeyRules::default());
        assert_eq!(key.storage_key(), "orders_sync");
        assert!(!key.is_hashed());
    }

    #[test]
    fn normalization_is_deterministic() {
        let rules = ident_rules(32);
        let name = "tenant/42:invoice-run";
        let first = NamedLockKey::normalize(name, &rules);
        let second = NamedLockKey::normalize(name, &rules);
        assert_eq!(first, second);
        assert_eq!(first.storage_key(), second.storage_key());
    }

    #[test]
    fn invalid_characters_force_a_fixed_length_hash() {
        let rules = ident_rules(32);
        let key = NamedLockKey::normalize("tenant/42:invoice-run", &rules);
        assert!(key.is_hashed());
        assert_eq!(key.storage_key().len(), 32);
        assert!(key
            .storage_key()
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_'));
    }

    #[test]
    fn long_names_hash_to_max_length_with_readable_prefix() {
        let name = "a".repeat(400);
        let key = NamedLockKey::normalize(&name, &KeyRules::default());
        assert_eq!(key.storage_key().len(), DEFAULT_MAX_KEY_LENGTH);
        assert!(key.storage_key().starts_with("aaaa"));
    }

    #[test]
    fn name_at_exact_max_length_is_hashed_not_kept() {
        let rules = ident_rules(16);
        let name = "abcdefghijklmnop";
        assert_eq!(name.len(), 16);
        let key = NamedLockKey::normalize(name, &rules);
        assert!(key.is_hashed());
        assert_eq!(key.storage_key().len(), 16);
    }

    #[test]
    fn distinct_long_names_get_distinct_keys() {
        let rules = KeyRules::default();
        let left = NamedLockKey::normalize(&format!("{}x", "n".repeat(300)), &rules);
        let right = NamedLockKey::normalize(&format!("{}y", "n".repeat(300)), &rules);
        assert_ne!(left, right);
    }

    #[test]
    fn empty_name_is_hashed() {
        let key = NamedLockKey::normalize("", &ident_rules(20));
        assert_eq!(key.storage_key().len(), 20);
    }

    #[test]
    fn multibyte_prefix_respects_byte_budget() {
        let rules = KeyRules::new(70, KeyCharset::Any).expect("valid rules");
        let key = NamedLockKey::normalize(&"é".repeat(100), &rules);
        assert_eq!(key.storage_key().len(), 70);
    }

    #[test]
    fn rules_reject_tiny_max_length() {
        assert!(matches!(
            KeyRules::new(8, KeyCharset::Any),
            Err(LockError::InvalidConfig(_))
        ));
    }
}
