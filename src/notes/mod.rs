//! Notes collaborator.
//!
//! The `create_note` action writes through [`NotesClient`]; the default
//! implementation is the markdown [`VaultNotes`] store.

pub mod vault;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::NotesError;

pub use vault::VaultNotes;

/// A note to be created.
#[derive(Debug, Clone, Default)]
pub struct NoteRequest {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    /// Vault-relative folder, e.g. `Inbox` or `Support/Tickets`.
    pub folder: String,
    /// Extra frontmatter keys.
    pub frontmatter: Map<String, Value>,
}

/// Handle to a created note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRef {
    pub id: String,
    /// Vault-relative path of the note file.
    pub file_path: String,
}

#[async_trait]
pub trait NotesClient: Send + Sync {
    async fn create_note(&self, note: NoteRequest) -> Result<NoteRef, NotesError>;
}
