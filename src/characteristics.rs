//! Request characteristics and fingerprint derivation.
//!
//! A characteristic is any named, scalar-valued request property used for
//! keying or filtering: `ip.src`, `userId`, `tier`, plus whatever the
//! adapter injects. Rate-limit rules key their storage entries by a
//! *fingerprint*: a canonical, sanitized, length-bounded string derived
//! from the configured characteristic keys.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum length of a single fingerprint component before it is hashed.
const COMPONENT_MAX: usize = 100;

/// Maximum total fingerprint length.
const FINGERPRINT_MAX: usize = 500;

/// A scalar characteristic value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CharacteristicValue {
    /// String value.
    Str(String),
    /// Numeric value.
    Num(f64),
}

impl CharacteristicValue {
    /// Render the value for fingerprints and filter contexts.
    ///
    /// Integral numbers render without a fractional part so that
    /// `tier=2` and `tier=2.0` key identically.
    pub fn render(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
        }
    }

    /// The value as a string, when it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Num(_) => None,
        }
    }

    /// The value as a number, coercing numeric strings.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Str(s) => s.trim().parse().ok(),
        }
    }
}

impl From<&str> for CharacteristicValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for CharacteristicValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<f64> for CharacteristicValue {
    fn from(n: f64) -> Self {
        Self::Num(n)
    }
}

impl From<u64> for CharacteristicValue {
    fn from(n: u64) -> Self {
        Self::Num(n as f64)
    }
}

/// Mapping from characteristic key to scalar value.
///
/// Ordered so that snapshots render deterministically; fingerprint order
/// is the *configured* key order, not map order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Characteristics {
    values: BTreeMap<String, CharacteristicValue>,
}

impl Characteristics {
    /// Create an empty characteristics map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a characteristic.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<CharacteristicValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<CharacteristicValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a characteristic.
    pub fn get(&self, key: &str) -> Option<&CharacteristicValue> {
        self.values.get(key)
    }

    /// Look up a characteristic as a string slice.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    /// Number of characteristics present.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no characteristics are present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CharacteristicValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Derive the storage fingerprint for the given characteristic keys.
    ///
    /// The fingerprint is `k1:v1|k2:v2|...` over the keys that resolve,
    /// in the order given. Keys and values are sanitized to
    /// `[A-Za-z0-9_\-:.]`; components longer than 100 characters are
    /// replaced by a prefix plus a short hash; the total is capped at
    /// 500 characters. Errors if no key resolves.
    pub fn fingerprint(&self, by: &[String]) -> Result<String, ValidationError> {
        let mut parts = Vec::new();
        for key in by {
            if let Some(value) = self.values.get(key) {
                let k = sanitize_component(key);
                let v = sanitize_component(&value.render());
                parts.push(format!("{k}:{v}"));
            }
        }

        if parts.is_empty() {
            return Err(ValidationError::EmptyFingerprint);
        }

        let mut fp = parts.join("|");
        if fp.len() > FINGERPRINT_MAX {
            // Keep a readable prefix and disambiguate with a hash of the whole.
            let digest = short_hash(&fp);
            fp.truncate(FINGERPRINT_MAX - digest.len() - 1);
            fp.push('-');
            fp.push_str(&digest);
        }
        Ok(fp)
    }
}

impl FromIterator<(String, CharacteristicValue)> for Characteristics {
    fn from_iter<I: IntoIterator<Item = (String, CharacteristicValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Sanitize a fingerprint component: strip disallowed characters, hash
/// over-long components down to a bounded form.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.len() > COMPONENT_MAX {
        let digest = short_hash(&cleaned);
        format!("{}-{digest}", &cleaned[..COMPONENT_MAX - digest.len() - 1])
    } else {
        cleaned
    }
}

/// Stable 16-hex-digit hash suffix for over-long components.
fn short_hash(input: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Characteristics {
        Characteristics::new()
            .with("ip.src", "10.0.0.10")
            .with("userId", "user-1")
            .with("tier", 2.0)
    }

    #[test]
    fn test_fingerprint_basic() {
        let c = sample();
        let fp = c.fingerprint(&["ip.src".into()]).unwrap();
        assert_eq!(fp, "ip.src:10.0.0.10");
    }

    #[test]
    fn test_fingerprint_multiple_keys_in_configured_order() {
        let c = sample();
        let fp = c
            .fingerprint(&["userId".into(), "ip.src".into()])
            .unwrap();
        assert_eq!(fp, "userId:user-1|ip.src:10.0.0.10");
    }

    #[test]
    fn test_fingerprint_deterministic_under_insert_order() {
        let a = Characteristics::new()
            .with("ip.src", "1.2.3.4")
            .with("userId", "u");
        let b = Characteristics::new()
            .with("userId", "u")
            .with("ip.src", "1.2.3.4");
        let by = vec!["ip.src".to_string(), "userId".to_string()];
        assert_eq!(a.fingerprint(&by).unwrap(), b.fingerprint(&by).unwrap());
    }

    #[test]
    fn test_fingerprint_sanitizes() {
        let c = Characteristics::new().with("userId", "a b|c<script>");
        let fp = c.fingerprint(&["userId".into()]).unwrap();
        assert!(!fp.contains(' '));
        assert!(!fp.contains('<'));
        assert!(fp.split('|').count() == 1 || fp.starts_with("userId:"));
    }

    #[test]
    fn test_fingerprint_hashes_long_components() {
        let c = Characteristics::new().with("userId", "x".repeat(300));
        let fp = c.fingerprint(&["userId".into()]).unwrap();
        assert!(fp.len() <= "userId:".len() + COMPONENT_MAX);
    }

    #[test]
    fn test_fingerprint_total_cap() {
        let mut c = Characteristics::new();
        let mut by = Vec::new();
        for i in 0..20 {
            let key = format!("k{i}");
            c.insert(key.clone(), "v".repeat(90));
            by.push(key);
        }
        let fp = c.fingerprint(&by).unwrap();
        assert!(fp.len() <= FINGERPRINT_MAX);
    }

    #[test]
    fn test_fingerprint_empty_errors() {
        let c = Characteristics::new();
        assert!(c.fingerprint(&["ip.src".into()]).is_err());
    }

    #[test]
    fn test_numeric_render() {
        assert_eq!(CharacteristicValue::Num(2.0).render(), "2");
        assert_eq!(CharacteristicValue::Num(2.5).render(), "2.5");
    }

    #[test]
    fn test_number_coercion() {
        assert_eq!(
            CharacteristicValue::Str("42".into()).as_number(),
            Some(42.0)
        );
        assert_eq!(CharacteristicValue::Str("abc".into()).as_number(), None);
    }
}
