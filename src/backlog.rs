//! Backlog sources
//!
//! The orchestrator only needs WorkItem records; authoring formats are not
//! its concern. `FileBacklog` reads a plain JSON or YAML list.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::WorkItem;

pub trait BacklogSource {
    fn load(&self) -> Result<Vec<WorkItem>>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BacklogDocument {
    List(Vec<WorkItem>),
    Wrapped {
        #[serde(alias = "stories", alias = "tasks")]
        items: Vec<WorkItem>,
    },
}

impl BacklogDocument {
    fn into_items(self) -> Vec<WorkItem> {
        match self {
            BacklogDocument::List(items) => items,
            BacklogDocument::Wrapped { items } => items,
        }
    }
}

pub struct FileBacklog {
    path: PathBuf,
}

impl FileBacklog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_yaml(&self) -> bool {
        matches!(
            self.path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        )
    }
}

impl BacklogSource for FileBacklog {
    fn load(&self) -> Result<Vec<WorkItem>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read backlog {:?}", self.path))?;

        let document: BacklogDocument = if self.is_yaml() {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML backlog {:?}", self.path))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON backlog {:?}", self.path))?
        };

        let items = document.into_items();
        let mut seen = HashSet::new();
        for item in &items {
            if item.id.trim().is_empty() {
                return Err(anyhow!("Backlog {:?} contains an item without an id", self.path));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(anyhow!("Backlog {:?} contains duplicate id {}", self.path, item.id));
            }
        }

        log::info!("[Backlog] Loaded {} item(s) from {:?}", items.len(), self.path);
        Ok(items)
    }
}

/// Fixed in-memory backlog
impl BacklogSource for Vec<WorkItem> {
    fn load(&self) -> Result<Vec<WorkItem>> {
        Ok(self.clone())
    }
}
