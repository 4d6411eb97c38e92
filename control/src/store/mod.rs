//! Durable routing document store
//!
//! The document lives in a version-controlled working copy. Saving renders
//! the document, writes it atomically, and records a commit that is pushed
//! to the remote. Nothing in here is shared: the store is owned by the
//! writer task (see [`writer`]).

pub mod git;
pub mod writer;

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use common::RoutingDocument;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Version control operations the store needs
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Root of the working copy
    fn workdir(&self) -> &Path;

    /// Create or refresh the working copy
    async fn prepare(&self) -> Result<()>;

    /// Stage `path`; returns true if the index now differs from HEAD for it
    async fn stage(&self, path: &Path) -> Result<bool>;

    async fn commit(&self, message: &str) -> Result<()>;

    /// Publish local commits to the remote branch
    async fn push(&self) -> Result<()>;
}

/// What a save actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Rendered bytes matched the working copy and nothing was pending
    Unchanged,
    /// New commit pushed to the remote branch
    Pushed,
    /// Nothing new to commit, but earlier commits were pushed
    Flushed,
}

/// Routing document persisted in a version-controlled working copy
pub struct ConfigStore<V> {
    vcs: V,
    file_path: PathBuf,
    /// Working copy holds bytes that were written but not committed yet
    uncommitted: bool,
    /// Local commits exist that the remote has not accepted yet
    unpushed: bool,
}

impl<V: VersionControl> ConfigStore<V> {
    /// `file_path` is relative to the working copy root
    pub fn new(vcs: V, file_path: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            file_path: file_path.into(),
            uncommitted: false,
            unpushed: false,
        }
    }

    /// Prepare the working copy (StartupFatal on failure)
    pub async fn init(&self) -> Result<()> {
        self.vcs.prepare().await?;
        info!(
            workdir = %self.vcs.workdir().display(),
            file = %self.file_path.display(),
            "Working copy ready"
        );
        Ok(())
    }

    pub fn document_path(&self) -> PathBuf {
        self.vcs.workdir().join(&self.file_path)
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    /// Read the document. A missing file yields the empty skeleton; a
    /// document with duplicate names is repaired in memory.
    pub async fn load(&self) -> Result<RoutingDocument> {
        let path = self.document_path();

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No routing document yet, starting empty");
                return Ok(RoutingDocument::new());
            }
            Err(e) => return Err(SyncError::Io(e)),
        };

        let mut document = RoutingDocument::from_yaml(&content)?;
        if let Err(e) = document.validate() {
            let dropped = document.repair();
            warn!(error = %e, dropped, "Repaired routing document on load");
        }

        debug!(
            routes = document.routes.len(),
            acme_routes = document.acme_routes.len(),
            "Loaded routing document"
        );
        Ok(document)
    }

    /// Persist `document` and publish it. Saving a document identical to
    /// the working copy, with nothing left to push, is a no-op.
    pub async fn save(
        &mut self,
        document: &RoutingDocument,
        message: &str,
    ) -> Result<SaveOutcome> {
        let path = self.document_path();
        let rendered = document.to_yaml()?;

        if write_if_changed(&path, rendered.as_bytes()).await? {
            self.uncommitted = true;
        }

        // A failed stage or commit leaves `uncommitted` set, so the next save
        // stages the file even though its bytes no longer change.
        let staged = if self.uncommitted || self.unpushed {
            self.vcs.stage(&self.file_path).await?
        } else {
            false
        };

        if staged {
            self.vcs.commit(message).await?;
            self.unpushed = true;
            debug!(message, "Committed routing document");
        }
        self.uncommitted = false;

        if !self.unpushed {
            return Ok(SaveOutcome::Unchanged);
        }

        // On failure the rendered file stays in place and `unpushed` stays
        // set, so the next save stages, commits and pushes again.
        self.vcs.push().await?;
        self.unpushed = false;

        Ok(if staged {
            SaveOutcome::Pushed
        } else {
            SaveOutcome::Flushed
        })
    }
}

/// Atomic replace via temp file + rename. Returns false if the file already
/// holds exactly `content`.
async fn write_if_changed(path: &Path, content: &[u8]) -> Result<bool> {
    match tokio::fs::read(path).await {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(SyncError::Io(e)),
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "routes".to_string());
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

    tokio::fs::write(&temp_path, content).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(true)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::{RouteRecord, TablePolicy};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory version control: the index and HEAD are byte snapshots of
    /// the document file.
    #[derive(Clone, Default)]
    pub(crate) struct FakeVcs {
        pub root: PathBuf,
        pub head: Arc<Mutex<Option<Vec<u8>>>>,
        pub index: Arc<Mutex<Option<Vec<u8>>>>,
        pub commits: Arc<Mutex<Vec<String>>>,
        pub pushes: Arc<AtomicUsize>,
        pub fail_push: Arc<AtomicBool>,
        pub fail_commit: Arc<AtomicBool>,
    }

    impl FakeVcs {
        pub fn new(root: &Path) -> Self {
            Self {
                root: root.to_path_buf(),
                ..Default::default()
            }
        }

        pub fn commit_messages(&self) -> Vec<String> {
            self.commits.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl VersionControl for FakeVcs {
        fn workdir(&self) -> &Path {
            &self.root
        }

        async fn prepare(&self) -> Result<()> {
            tokio::fs::create_dir_all(&self.root).await?;
            Ok(())
        }

        async fn stage(&self, path: &Path) -> Result<bool> {
            let content = tokio::fs::read(self.root.join(path)).await?;
            let differs = self.head.lock().expect("lock").as_deref() != Some(content.as_slice());
            *self.index.lock().expect("lock") = Some(content);
            Ok(differs)
        }

        async fn commit(&self, message: &str) -> Result<()> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(SyncError::git("commit", "index.lock exists"));
            }
            let staged = self.index.lock().expect("lock").clone();
            *self.head.lock().expect("lock") = staged;
            self.commits.lock().expect("lock").push(message.to_string());
            Ok(())
        }

        async fn push(&self) -> Result<()> {
            if self.fail_push.load(Ordering::SeqCst) {
                return Err(SyncError::git("push", "remote rejected"));
            }
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_document() -> RoutingDocument {
        let mut doc = RoutingDocument::new();
        doc.upsert(
            &RouteRecord::new("api.example.com", "10.0.0.5", true),
            &TablePolicy::default(),
        );
        doc
    }

    async fn store() -> (tempfile::TempDir, ConfigStore<FakeVcs>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let vcs = FakeVcs::new(dir.path());
        let store = ConfigStore::new(vcs, "lb/routes.yaml");
        store.init().await.expect("init");
        (dir, store)
    }

    #[tokio::test]
    async fn test_load_missing_file_gives_skeleton() {
        let (_dir, store) = store().await;

        let doc = store.load().await.expect("load");
        assert!(doc.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let (_dir, mut store) = store().await;
        let doc = sample_document();

        let outcome = store
            .save(&doc, "edgesync: upsert api.example.com")
            .await
            .expect("save");
        assert_eq!(outcome, SaveOutcome::Pushed);

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded, doc);
        assert_eq!(
            store.vcs().commit_messages(),
            vec!["edgesync: upsert api.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_saving_identical_document_is_noop() {
        let (_dir, mut store) = store().await;
        let doc = sample_document();

        store.save(&doc, "first").await.expect("save");
        let outcome = store.save(&doc, "second").await.expect("save");

        assert_eq!(outcome, SaveOutcome::Unchanged);
        assert_eq!(store.vcs().commit_messages().len(), 1);
        assert_eq!(store.vcs().pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_push_is_retried_on_next_save() {
        let (_dir, mut store) = store().await;
        let doc = sample_document();

        store.vcs().fail_push.store(true, Ordering::SeqCst);
        assert!(store.save(&doc, "first").await.is_err());

        store.vcs().fail_push.store(false, Ordering::SeqCst);
        let outcome = store.save(&doc, "retry").await.expect("save");

        assert_eq!(outcome, SaveOutcome::Flushed);
        assert_eq!(store.vcs().pushes.load(Ordering::SeqCst), 1);
        assert_eq!(store.vcs().commit_messages(), vec!["first".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_commit_is_retried_on_next_save() {
        let (_dir, mut store) = store().await;
        let doc = sample_document();

        store.vcs().fail_commit.store(true, Ordering::SeqCst);
        assert!(store.save(&doc, "first").await.is_err());
        assert!(store.vcs().commit_messages().is_empty());

        // Same bytes are already on disk; the save must still commit them
        store.vcs().fail_commit.store(false, Ordering::SeqCst);
        let outcome = store.save(&doc, "retry").await.expect("save");

        assert_eq!(outcome, SaveOutcome::Pushed);
        assert_eq!(store.vcs().commit_messages(), vec!["retry".to_string()]);
        assert_eq!(store.vcs().pushes.load(Ordering::SeqCst), 1);

        let outcome = store.save(&doc, "again").await.expect("save");
        assert_eq!(outcome, SaveOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_load_repairs_duplicates() {
        let (_dir, store) = store().await;
        let path = store.document_path();
        tokio::fs::create_dir_all(path.parent().expect("parent"))
            .await
            .expect("mkdir");
        tokio::fs::write(
            &path,
            "routes:\n- name: a\n  ip: 10.0.0.1\n  port: 443\n- name: a\n  ip: 10.0.0.2\n  port: 443\nacmeRoutes: []\n",
        )
        .await
        .expect("write");

        let doc = store.load().await.expect("load");
        assert_eq!(doc.routes.len(), 1);
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_file() {
        let (dir, mut store) = store().await;
        store.save(&sample_document(), "save").await.expect("save");

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("lb"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["routes.yaml".to_string()]);
    }
}
