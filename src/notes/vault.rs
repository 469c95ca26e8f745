//! File-backed notes vault.
//!
//! Notes are markdown files under `<vault>/<folder>/<slug>.md`, each with a
//! frontmatter block carrying the note id, title, tags, creation time and
//! any caller-supplied keys.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::NotesError;
use crate::notes::{NoteRef, NoteRequest, NotesClient};

/// Upper bound on `-N` suffixes tried for one title.
const MAX_COLLISIONS: usize = 1000;

/// Markdown vault rooted at a directory.
pub struct VaultNotes {
    base_path: PathBuf,
}

impl VaultNotes {
    /// Create a vault rooted at `base_path`.
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Ensure the vault directory exists.
    pub async fn ensure_dirs(&self) -> Result<(), NotesError> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }
}

/// Folders must stay inside the vault.
fn validate_folder(folder: &str) -> Result<&Path, NotesError> {
    let path = Path::new(folder);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(NotesError::InvalidFolder(folder.to_string()));
    }
    Ok(path)
}

/// Lowercase ASCII slug; runs of other characters collapse to `-`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_end_matches('-').chars().take(80).collect();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

fn render_frontmatter(id: &str, note: &NoteRequest) -> String {
    let mut out = String::from("---\n");
    let mut line = |key: &str, value: &Value| {
        let rendered = serde_json::to_string(value).unwrap_or_else(|_| "null".into());
        out.push_str(&format!("{key}: {rendered}\n"));
    };
    line("id", &Value::String(id.to_string()));
    line("title", &Value::String(note.title.clone()));
    line(
        "tags",
        &Value::Array(note.tags.iter().cloned().map(Value::String).collect()),
    );
    line("created", &Value::String(Utc::now().to_rfc3339()));
    for (key, value) in &note.frontmatter {
        if !matches!(key.as_str(), "id" | "title" | "tags" | "created") {
            line(key, value);
        }
    }
    out.push_str("---\n\n");
    out
}

#[async_trait]
impl NotesClient for VaultNotes {
    async fn create_note(&self, note: NoteRequest) -> Result<NoteRef, NotesError> {
        let folder = validate_folder(&note.folder)?;
        let dir = self.base_path.join(folder);
        fs::create_dir_all(&dir).await?;

        let id = Uuid::new_v4().to_string();
        let body = format!("{}{}\n", render_frontmatter(&id, &note), note.content.trim_end());
        let slug = slugify(&note.title);

        for n in 1..=MAX_COLLISIONS {
            let file_name = if n == 1 {
                format!("{slug}.md")
            } else {
                format!("{slug}-{n}.md")
            };
            let full_path = dir.join(&file_name);

            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&full_path)
                .await
            {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };

            let relative = folder.join(&file_name).to_string_lossy().replace('\\', "/");
            file.write_all(body.as_bytes())
                .await
                .map_err(|e| NotesError::WriteFailed {
                    path: relative.clone(),
                    reason: e.to_string(),
                })?;
            file.flush().await?;

            debug!(note_id = %id, path = %relative, "Note written");
            return Ok(NoteRef {
                id,
                file_path: relative,
            });
        }

        Err(NotesError::WriteFailed {
            path: dir.join(format!("{slug}.md")).to_string_lossy().to_string(),
            reason: "too many notes with the same title".into(),
        })
    }
}
