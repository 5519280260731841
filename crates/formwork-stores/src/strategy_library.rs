//! Strategy library backends
//!
//! Both backends serialize mutation through one async Mutex, so id
//! allocation stays single-writer even when gate evaluations overlap.
//! The file backend persists the markdown catalogue form after every
//! mutation.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;

use formwork_core::library::{StrategyCatalog, StrategyDraft, StrategyEntry, StrategyId};
use formwork_core::store::{StoreError, StrategyLibrary};

/// Volatile catalogue, used in tests and single-run setups.
pub struct InMemoryStrategyLibrary {
    catalog: Mutex<StrategyCatalog>,
}

impl InMemoryStrategyLibrary {
    pub fn new(catalog: StrategyCatalog) -> Self {
        Self {
            catalog: Mutex::new(catalog),
        }
    }
}

impl Default for InMemoryStrategyLibrary {
    fn default() -> Self {
        Self::new(StrategyCatalog::new())
    }
}

#[async_trait]
impl StrategyLibrary for InMemoryStrategyLibrary {
    async fn snapshot(&self) -> Result<StrategyCatalog, StoreError> {
        Ok(self.catalog.lock().await.clone())
    }

    async fn admit(&self, draft: StrategyDraft) -> Result<StrategyEntry, StoreError> {
        let mut catalog = self.catalog.lock().await;
        let id = catalog.next_id(draft.category);
        catalog.ensure_category(draft.category, "General");
        let entry = StrategyEntry::from_draft(id, draft);
        catalog.entries.push(entry.clone());
        tracing::info!(strategy_id = %entry.id, title = %entry.title, "admitted strategy");
        Ok(entry)
    }

    async fn enhance(&self, id: &StrategyId, note: String) -> Result<(), StoreError> {
        let mut catalog = self.catalog.lock().await;
        let entry = catalog
            .entries
            .iter_mut()
            .find(|e| e.id == *id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entry.enhancements.push(note);
        tracing::info!(strategy_id = %id, "enhanced strategy");
        Ok(())
    }
}

/// Markdown-file-backed catalogue shared across tasks.
pub struct FileStrategyLibrary {
    path: PathBuf,
    catalog: Mutex<StrategyCatalog>,
}

impl FileStrategyLibrary {
    /// Load the catalogue file; a missing file starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let catalog = match tokio::fs::read_to_string(&path).await {
            Ok(text) => StrategyCatalog::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StrategyCatalog::new(),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };
        Ok(Self {
            path,
            catalog: Mutex::new(catalog),
        })
    }

    async fn persist(&self, catalog: &StrategyCatalog) -> Result<(), StoreError> {
        tokio::fs::write(&self.path, catalog.render())
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}

#[async_trait]
impl StrategyLibrary for FileStrategyLibrary {
    async fn snapshot(&self) -> Result<StrategyCatalog, StoreError> {
        Ok(self.catalog.lock().await.clone())
    }

    async fn admit(&self, draft: StrategyDraft) -> Result<StrategyEntry, StoreError> {
        let mut catalog = self.catalog.lock().await;
        let id = catalog.next_id(draft.category);
        catalog.ensure_category(draft.category, "General");
        let entry = StrategyEntry::from_draft(id, draft);
        catalog.entries.push(entry.clone());
        self.persist(&catalog).await?;
        tracing::info!(strategy_id = %entry.id, path = %self.path.display(), "admitted strategy");
        Ok(entry)
    }

    async fn enhance(&self, id: &StrategyId, note: String) -> Result<(), StoreError> {
        let mut catalog = self.catalog.lock().await;
        let entry = catalog
            .entries
            .iter_mut()
            .find(|e| e.id == *id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entry.enhancements.push(note);
        let snapshot = catalog.clone();
        self.persist(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(title: &str) -> StrategyDraft {
        StrategyDraft {
            category: 'A',
            title: title.to_string(),
            applicability: "whenever".to_string(),
            steps: vec!["do it".to_string()],
            examples: Vec::new(),
        }
    }

    #[test]
    fn test_admit_allocates_sequential_ids() {
        tokio_test::block_on(async {
            let library = InMemoryStrategyLibrary::default();
            let first = library.admit(draft("First")).await.unwrap();
            let second = library.admit(draft("Second")).await.unwrap();
            assert_eq!(first.id, StrategyId::new('A', 1));
            assert_eq!(second.id, StrategyId::new('A', 2));
        });
    }

    #[test]
    fn test_enhance_appends_note() {
        tokio_test::block_on(async {
            let library = InMemoryStrategyLibrary::default();
            let entry = library.admit(draft("Base")).await.unwrap();
            library
                .enhance(&entry.id, "works for archives too".to_string())
                .await
                .unwrap();
            let catalog = library.snapshot().await.unwrap();
            assert_eq!(
                catalog.get(&entry.id).unwrap().enhancements,
                vec!["works for archives too".to_string()]
            );
        });
    }

    #[test]
    fn test_enhance_unknown_id_fails() {
        tokio_test::block_on(async {
            let library = InMemoryStrategyLibrary::default();
            let err = library
                .enhance(&StrategyId::new('Z', 1), "note".to_string())
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::NotFound(_)));
        });
    }

    #[test]
    fn test_file_backend_persists_across_reopen() {
        tokio_test::block_on(async {
            let dir = std::env::temp_dir().join(format!("formwork-lib-{}", std::process::id()));
            tokio::fs::create_dir_all(&dir).await.unwrap();
            let path = dir.join("library.md");
            let _ = tokio::fs::remove_file(&path).await;

            let library = FileStrategyLibrary::open(&path).await.unwrap();
            let entry = library.admit(draft("Persisted")).await.unwrap();
            drop(library);

            let reopened = FileStrategyLibrary::open(&path).await.unwrap();
            let catalog = reopened.snapshot().await.unwrap();
            assert!(catalog.contains(&entry.id));
            assert_eq!(catalog.get(&entry.id).unwrap().title, "Persisted");

            let _ = tokio::fs::remove_file(&path).await;
        });
    }
}
