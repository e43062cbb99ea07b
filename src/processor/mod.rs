//! Processor module - raw provider payloads to sink documents.
//!
//! Provides:
//! - Typed documents (`Commit`, `PullRequest`, `Issue`) with their ordering keys
//! - `Batch`: typed items kept aligned with their rendered JSON
//! - `DocumentFormatter`: operator key renames and global keys
//! - `GithubProcessor`: GitHub REST payload transformation

mod documents;
mod formatter;
mod github;

pub use documents::*;
pub use formatter::*;
pub use github::*;

#[cfg(test)]
pub(crate) use github::fixtures;

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Processed documents of one kind.
///
/// `items[i]` is the typed source of `documents[i]`.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    items: Vec<T>,
    documents: Vec<Value>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            documents: Vec::new(),
        }
    }
}

impl<T: Serialize> Batch<T> {
    /// Render items through the formatter, then merge tags.
    pub fn render(
        items: Vec<T>,
        formatter: &DocumentFormatter,
        tags: &HashMap<String, String>,
    ) -> crate::Result<Self> {
        let mut documents = Vec::with_capacity(items.len());
        for item in &items {
            let mut value = serde_json::to_value(item).map_err(|e| {
                crate::AuditError::Internal(format!("Serializing document: {e}"))
            })?;
            if let Value::Object(map) = &mut value {
                formatter.apply(map);
                add_tags(map, tags);
            }
            documents.push(value);
        }
        Ok(Self { items, documents })
    }
}

impl<T> Batch<T> {
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn documents(&self) -> &[Value] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Marker> Batch<T> {
    /// Largest ordering key in the batch.
    pub fn newest(&self) -> Option<T::Key> {
        self.items.iter().map(Marker::marker).max()
    }

    /// Keep only documents whose key is strictly after `floor`.
    pub fn retain_after(self, floor: T::Key) -> Self {
        let (items, documents): (Vec<T>, Vec<Value>) = self
            .items
            .into_iter()
            .zip(self.documents)
            .filter(|(item, _)| item.marker() > floor)
            .unzip();
        Self { items, documents }
    }
}
