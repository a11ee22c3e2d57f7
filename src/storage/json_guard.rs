//! Guarded JSON parsing for stored state blobs.
//!
//! Storage values are opaque strings; the rule layer parses them as JSON
//! with a hard size cap and a nesting-depth cap so a corrupted or
//! hostile blob cannot blow the stack or the heap.

use serde::de::DeserializeOwned;

use crate::error::{Result, StorageError};

/// Maximum accepted blob size.
const MAX_BYTES: usize = 64 * 1024;

/// Maximum accepted nesting depth.
const MAX_DEPTH: usize = 8;

/// Parse a stored JSON blob with size and nesting limits.
pub fn parse_state_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    if raw.len() > MAX_BYTES {
        return Err(StorageError::ValueRejected(format!(
            "blob of {} bytes exceeds {MAX_BYTES}",
            raw.len()
        ))
        .into());
    }
    let depth = scan_depth(raw);
    if depth > MAX_DEPTH {
        return Err(StorageError::ValueRejected(format!(
            "nesting depth {depth} exceeds {MAX_DEPTH}"
        ))
        .into());
    }
    serde_json::from_str(raw).map_err(|e| StorageError::Serialization(e.to_string()).into())
}

/// Maximum `{`/`[` nesting depth, ignoring brackets inside strings.
fn scan_depth(raw: &str) -> usize {
    let mut depth = 0usize;
    let mut max_depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for b in raw.bytes() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max_depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parses_valid_blob() {
        let parsed: BTreeMap<String, u64> = parse_state_json(r#"{"a": 1, "b": 2}"#).unwrap();
        assert_eq!(parsed.get("a"), Some(&1));
    }

    #[test]
    fn test_rejects_oversized() {
        let big = format!(r#"{{"k": "{}"}}"#, "x".repeat(MAX_BYTES));
        let result: Result<serde_json::Value> = parse_state_json(&big);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_deep_nesting() {
        let deep = format!("{}1{}", "[".repeat(30), "]".repeat(30));
        let result: Result<serde_json::Value> = parse_state_json(&deep);
        assert!(result.is_err());
    }

    #[test]
    fn test_brackets_in_strings_ignored() {
        let raw = r#"{"k": "[[[[[[[[[[[[[[[[[[[[[["}"#;
        let parsed: serde_json::Value = parse_state_json(raw).unwrap();
        assert!(parsed.get("k").is_some());
    }

    #[test]
    fn test_rejects_malformed() {
        let result: Result<serde_json::Value> = parse_state_json("{not json");
        assert!(result.is_err());
    }
}
