//! `.codex/memory.md`: a line-oriented notes store backing the
//! `persistent_memory` tool (§4.4, §6). One append-only file of
//! `- [ ] note` lines.

use std::path::{Path, PathBuf};

pub struct MemoryStore {
    pub path: PathBuf,
}

impl MemoryStore {
    pub fn new(codex_dir: impl AsRef<Path>) -> Self {
        Self {
            path: codex_dir.as_ref().join("memory.md"),
        }
    }

    pub async fn append(&self, note: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut existing = tokio::fs::read_to_string(&self.path).await.unwrap_or_default();
        if !existing.is_empty() && !existing.ends_with('\n') {
            existing.push('\n');
        }
        existing.push_str(&format!("- [ ] {note}\n"));
        tokio::fs::write(&self.path, existing).await
    }

    pub async fn query(&self, needle: Option<&str>) -> std::io::Result<String> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e),
        };
        match needle {
            None => Ok(content),
            Some(needle) => Ok(content
                .lines()
                .filter(|line| line.contains(needle))
                .collect::<Vec<_>>()
                .join("\n")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_query_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.append("remember the API key rotation").await.unwrap();
        store.append("follow up on the flaky test").await.unwrap();

        let all = store.query(None).await.unwrap();
        assert_eq!(all.lines().count(), 2);

        let filtered = store.query(Some("flaky")).await.unwrap();
        assert_eq!(filtered, "- [ ] follow up on the flaky test");
    }

    #[tokio::test]
    async fn query_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        assert_eq!(store.query(None).await.unwrap(), "");
    }
}
