//! Shared utility functions for the stageforge crate.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Extract the first balanced JSON object from text that may contain other content.
///
/// Braces inside JSON string literals are ignored while counting depth.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }

    None
}

/// Serialize `value` as pretty JSON and replace `path` atomically.
///
/// Writes to a sibling `.tmp` file, syncs it, then renames over the target so
/// a crash never leaves a partially written record behind.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let content = serde_json::to_vec_pretty(value).context("Failed to serialize state")?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
        file.write_all(&content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temp file: {}", tmp_path.display()))?;
    }
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Truncate to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_extract_json_object_with_prefix_and_suffix() {
        let text = r#"Review done: {"quality_score": 0.9} thanks"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"quality_score": 0.9}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"{"issue": "missing } brace", "ok": true} tail"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"issue": "missing } brace", "ok": true}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_unbalanced() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn test_write_json_atomic_replaces_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_json_atomic(&path, &serde_json::json!({"v": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"v": 2})).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["v"], 2);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdefghij", 6), "abc...");
    }
}
