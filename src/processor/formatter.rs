//! Operator-defined document customisation.
//!
//! The formatter file is JSON:
//!
//! ```json
//! { "changeDefaultKeys": { "sha": "commit_sha" }, "addNewGlobalKeys": { "source": "gh" } }
//! ```
//!
//! Renames are applied first, then global keys, then the job's tags.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, error};

/// Key renames and additions applied to every document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentFormatter {
    #[serde(rename = "changeDefaultKeys", default)]
    pub change_default_keys: HashMap<String, String>,

    #[serde(rename = "addNewGlobalKeys", default)]
    pub add_new_global_keys: HashMap<String, String>,
}

impl DocumentFormatter {
    /// Load a formatter file.
    ///
    /// An unreadable or malformed file is logged and yields the identity formatter.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read formatter file");
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(formatter) => {
                debug!(path = %path.display(), "Loaded document formatter");
                formatter
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Invalid formatter file");
                Self::default()
            }
        }
    }

    /// Load from an optional path.
    pub fn load_optional(path: Option<&Path>) -> Self {
        path.map(Self::load).unwrap_or_default()
    }

    /// Rename default keys and add global keys in place.
    pub fn apply(&self, doc: &mut Map<String, Value>) {
        for (from, to) in &self.change_default_keys {
            if let Some(value) = doc.remove(from) {
                doc.insert(to.clone(), value);
            }
        }
        for (key, value) in &self.add_new_global_keys {
            doc.insert(key.clone(), Value::String(value.clone()));
        }
    }
}

/// Merge job tags into a document, overwriting existing keys.
pub fn add_tags(doc: &mut Map<String, Value>, tags: &HashMap<String, String>) {
    for (key, value) in tags {
        doc.insert(key.clone(), Value::String(value.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_apply_renames_then_adds() {
        let formatter = DocumentFormatter {
            change_default_keys: HashMap::from([("sha".to_string(), "commit_sha".to_string())]),
            add_new_global_keys: HashMap::from([("source".to_string(), "gh".to_string())]),
        };
        let mut doc = json!({"sha": "abc", "message": "fix"})
            .as_object()
            .cloned()
            .unwrap();

        formatter.apply(&mut doc);

        assert_eq!(doc.get("commit_sha"), Some(&json!("abc")));
        assert!(!doc.contains_key("sha"));
        assert_eq!(doc.get("source"), Some(&json!("gh")));
        assert_eq!(doc.get("message"), Some(&json!("fix")));
    }

    #[test]
    fn test_rename_missing_key_is_noop() {
        let formatter = DocumentFormatter {
            change_default_keys: HashMap::from([("absent".to_string(), "x".to_string())]),
            ..Default::default()
        };
        let mut doc = Map::new();
        formatter.apply(&mut doc);
        assert!(doc.is_empty());
    }

    #[test]
    fn test_add_tags_overwrites() {
        let mut doc = json!({"env": "dev"}).as_object().cloned().unwrap();
        add_tags(&mut doc, &HashMap::from([("env".to_string(), "prod".to_string())]));
        assert_eq!(doc.get("env"), Some(&json!("prod")));
    }

    #[test]
    fn test_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("formatter.json");
        std::fs::write(
            &path,
            r#"{"changeDefaultKeys": {"sha": "id"}, "addNewGlobalKeys": {"dc": "eu"}}"#,
        )
        .unwrap();

        let formatter = DocumentFormatter::load(&path);
        assert_eq!(formatter.change_default_keys.get("sha").unwrap(), "id");
        assert_eq!(formatter.add_new_global_keys.get("dc").unwrap(), "eu");
    }

    #[test]
    fn test_load_invalid_falls_back_to_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("formatter.json");
        std::fs::write(&path, "not json").unwrap();

        let formatter = DocumentFormatter::load(&path);
        assert!(formatter.change_default_keys.is_empty());
        assert!(formatter.add_new_global_keys.is_empty());

        let missing = DocumentFormatter::load(&dir.path().join("missing.json"));
        assert!(missing.add_new_global_keys.is_empty());
    }
}
