use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

/// Id given to every document of a batch added under one shared id when
/// the caller names none.
pub const DEFAULT_SHARED_ID: &str = "shared";

/// A document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId(String);

impl DocumentId {
    /// A stable id derived from a file's path relative to the ingested
    /// directory, so re-ingesting the directory replaces its documents.
    pub fn for_path(relative_path: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        relative_path.hash(&mut hasher);
        Self(format!("{:016x}", hasher.finish()))
    }

    /// A fresh random (UUID v4) id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
