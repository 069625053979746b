use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::schema::ExtractFormat;

const SNIPPET_MAX_CHARS: usize = 200;
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
    Text,
    Html,
    Plan,
    Script,
    Report,
}

/// Handle to something written for a run: where it lives and what it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Writes artifacts under a directory unique to one session, so concurrent
/// agents never collide on paths.
#[derive(Debug)]
pub struct ArtifactStore {
    session_dir: PathBuf,
    handles: Mutex<Vec<Artifact>>,
    closed: AtomicBool,
}

fn snippet_of(content: &str) -> String {
    let trimmed = content.trim();
    let mut snippet: String = trimmed.chars().take(SNIPPET_MAX_CHARS).collect();
    if trimmed.chars().count() > SNIPPET_MAX_CHARS {
        snippet.push('…');
    }
    snippet
}

impl ArtifactStore {
    pub async fn create(root: &Path) -> io::Result<Self> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let session_dir = root.join(format!("{stamp}-{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&session_dir).await?;
        info!(dir = %session_dir.display(), "artifact directory ready");
        Ok(Self {
            session_dir,
            handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Default root: the platform data dir, falling back to `./artifacts`.
    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join("rpa-test-agent").join("runs"))
            .unwrap_or_else(|| PathBuf::from("artifacts"))
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn case_dir(&self, case_id: &str) -> PathBuf {
        self.session_dir.join(case_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn handles(&self) -> Vec<Artifact> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn write(
        &self,
        case_id: Option<&str>,
        file_name: &str,
        kind: ArtifactKind,
        contents: &[u8],
        snippet: Option<String>,
    ) -> io::Result<Artifact> {
        if self.is_closed() {
            return Err(io::Error::other("artifact store is closed"));
        }
        let dir = match case_id {
            Some(case_id) => self.case_dir(case_id),
            None => self.session_dir.clone(),
        };
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, contents).await?;
        debug!(path = %path.display(), bytes = contents.len(), "artifact written");

        let artifact = Artifact {
            kind,
            path,
            bytes: contents.len() as u64,
            snippet,
        };
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(artifact.clone());
        Ok(artifact)
    }

    pub async fn write_screenshot(
        &self,
        case_id: &str,
        step_number: usize,
        failure: bool,
        png: &[u8],
    ) -> io::Result<Artifact> {
        let suffix = if failure { "-failure" } else { "" };
        let name = format!("step-{step_number:02}-screenshot{suffix}.png");
        self.write(Some(case_id), &name, ArtifactKind::Screenshot, png, None)
            .await
    }

    pub async fn write_extract(
        &self,
        case_id: &str,
        step_number: usize,
        format: ExtractFormat,
        content: &str,
    ) -> io::Result<Artifact> {
        let (kind, ext) = match format {
            ExtractFormat::Text => (ArtifactKind::Text, "txt"),
            ExtractFormat::Html => (ArtifactKind::Html, "html"),
        };
        let name = format!("step-{step_number:02}-extract.{ext}");
        self.write(
            Some(case_id),
            &name,
            kind,
            content.as_bytes(),
            Some(snippet_of(content)),
        )
        .await
    }

    /// Writes the manifest of every handle and refuses further writes.
    /// Returns `None` when the store was already closed.
    pub async fn close(&self) -> io::Result<Option<PathBuf>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let manifest = serde_json::to_vec_pretty(&self.handles()).map_err(io::Error::other)?;
        let path = self.session_dir.join(MANIFEST_FILE);
        tokio::fs::write(&path, manifest).await?;
        info!(path = %path.display(), "artifact manifest written");
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_get_distinct_directories() {
        let root = tempfile::tempdir().unwrap();
        let first = ArtifactStore::create(root.path()).await.unwrap();
        let second = ArtifactStore::create(root.path()).await.unwrap();
        assert_ne!(first.session_dir(), second.session_dir());
        assert!(first.session_dir().starts_with(root.path()));
    }

    #[tokio::test]
    async fn writes_are_tracked_and_manifest_written_once() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::create(root.path()).await.unwrap();

        let shot = store
            .write_screenshot("case-001", 3, true, b"\x89PNG")
            .await
            .unwrap();
        assert!(shot.path.ends_with("case-001/step-03-screenshot-failure.png"));
        assert_eq!(shot.bytes, 4);

        let text = store
            .write_extract("case-001", 4, ExtractFormat::Text, "  Total: $4.99  ")
            .await
            .unwrap();
        assert_eq!(text.snippet.as_deref(), Some("Total: $4.99"));
        assert_eq!(store.handles().len(), 2);

        let manifest = store.close().await.unwrap().expect("manifest path");
        let written: Vec<Artifact> =
            serde_json::from_slice(&std::fs::read(manifest).unwrap()).unwrap();
        assert_eq!(written, store.handles());

        assert_eq!(store.close().await.unwrap(), None);
        assert!(
            store
                .write(None, "late.txt", ArtifactKind::Text, b"late", None)
                .await
                .is_err()
        );
    }

    #[test]
    fn long_snippets_are_truncated() {
        let long = "x".repeat(SNIPPET_MAX_CHARS + 10);
        let snippet = snippet_of(&long);
        assert_eq!(snippet.chars().count(), SNIPPET_MAX_CHARS + 1);
        assert!(snippet.ends_with('…'));
    }
}
