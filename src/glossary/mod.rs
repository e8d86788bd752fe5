//! Series-scoped terminology glossary.
//!
//! Entries map Japanese surface forms (keys) to a translation note (value)
//! injected into translation prompts. The glossary evolves across chapters
//! via the two-stage generate/merge flow in [`stage1`] and [`resolver`].

pub mod actions;
pub mod resolver;
pub mod stage1;

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GlossaryError {
    #[error("glossary I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("glossary snapshot is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One stored entry. `keys` are raw Japanese strings as they appear in
/// source text; `value` is the note shown to the translation model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub id: u32,
    pub keys: Vec<String>,
    pub value: String,
}

/// A proposed entry from stage 1. Ids are assigned only when a proposal is
/// actually added to the glossary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    pub keys: Vec<String>,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Glossary {
    pub entries: Vec<GlossaryEntry>,
}

impl Glossary {
    pub fn max_id(&self) -> u32 {
        self.entries.iter().map(|e| e.id).max().unwrap_or(0)
    }

    pub fn entry(&self, id: u32) -> Option<&GlossaryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entry_mut(&mut self, id: u32) -> Option<&mut GlossaryEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Existing entries sharing at least one key with `keys`.
    pub fn conflicts_with<'a>(&'a self, keys: &[String]) -> Vec<&'a GlossaryEntry> {
        let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
        self.entries
            .iter()
            .filter(|e| e.keys.iter().any(|k| wanted.contains(k.as_str())))
            .collect()
    }

    /// Notes for every entry whose keys occur in `text`, newline-joined.
    /// Empty string when nothing matches.
    pub fn metadata_for(&self, text: &str) -> String {
        let matched: Vec<&str> = self
            .entries
            .iter()
            .filter(|e| e.keys.iter().any(|k| text.contains(k.as_str())))
            .map(|e| e.value.as_str())
            .collect();
        matched.join("\n")
    }
}

/// Persistence seam for glossaries, keyed by an externally supplied scope
/// id (one glossary per series).
pub trait GlossaryStore {
    fn load(&self, scope_id: &str) -> Result<Glossary, GlossaryError>;
    fn save(&self, scope_id: &str, glossary: &Glossary) -> Result<(), GlossaryError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    entries: Vec<GlossaryEntry>,
    updated_at: DateTime<Utc>,
}

/// Stores one JSON snapshot per scope under a base directory.
#[derive(Debug, Clone)]
pub struct FileGlossaryStore {
    dir: PathBuf,
}

impl FileGlossaryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, scope_id: &str) -> PathBuf {
        // Scope ids come from URLs; keep the file name safe.
        let safe: String = scope_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

impl GlossaryStore for FileGlossaryStore {
    /// A missing snapshot is an empty glossary, not an error.
    fn load(&self, scope_id: &str) -> Result<Glossary, GlossaryError> {
        let path = self.path_for(scope_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Glossary::default()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        Ok(Glossary {
            entries: snapshot.entries,
        })
    }

    fn save(&self, scope_id: &str, glossary: &Glossary) -> Result<(), GlossaryError> {
        fs::create_dir_all(&self.dir)?;
        let snapshot = Snapshot {
            entries: glossary.entries.clone(),
            updated_at: Utc::now(),
        };
        let raw = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.path_for(scope_id), raw)?;
        Ok(())
    }
}
