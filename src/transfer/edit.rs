//! Edit-and-sync sessions
//!
//! An [`EditSession`] keeps a local working copy of one object in a scratch
//! directory. The caller opens the copy in whatever editor it likes, polls
//! [`EditSession::has_changed`], and pushes the new content back with
//! [`EditSession::sync_back`]. The scratch directory goes away with the
//! session.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::TempDir;
use tokio::fs;

use crate::s3::error::S3Result;
use crate::s3::session::Session;
use crate::s3::types::{validate_segment, DELIMITER};
use crate::transfer::engine::TransferEngine;

/// What a change check compares against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: SystemTime,
    len: u64,
}

impl Stamp {
    async fn read(path: &Path) -> S3Result<Self> {
        let meta = fs::metadata(path).await?;
        Ok(Self {
            modified: meta.modified()?,
            len: meta.len(),
        })
    }
}

/// Local working copy of one object
#[derive(Debug)]
pub struct EditSession {
    engine: TransferEngine,
    session: Session,
    bucket: String,
    key: String,
    path: PathBuf,
    stamp: Stamp,
    _scratch: TempDir,
}

impl TransferEngine {
    /// Download `key` into a fresh scratch directory for editing
    pub async fn open_for_edit(
        &self,
        session: &Session,
        bucket: &str,
        key: &str,
    ) -> S3Result<EditSession> {
        let name = key.rsplit(DELIMITER).next().unwrap_or_default();
        validate_segment(name)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("s3-manager-edit-");
        let scratch = match &self.settings().edit_dir {
            Some(dir) => {
                fs::create_dir_all(dir).await?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };
        let path = scratch.path().join(name);

        self.download(session, bucket, key, &path).await?;
        let stamp = Stamp::read(&path).await?;
        tracing::info!("Opened s3://{}/{} for editing at {}", bucket, key, path.display());

        Ok(EditSession {
            engine: self.clone(),
            session: session.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            path,
            stamp,
            _scratch: scratch,
        })
    }
}

impl EditSession {
    /// The working copy to hand to an editor
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the working copy was modified since it was opened or last
    /// synced. A deleted working copy is an `Io` error.
    pub async fn has_changed(&self) -> S3Result<bool> {
        Ok(Stamp::read(&self.path).await? != self.stamp)
    }

    /// Upload the working copy over the original key. The key's listing
    /// levels are invalidated by the upload.
    pub async fn sync_back(&mut self) -> S3Result<u64> {
        let stamp = Stamp::read(&self.path).await?;
        let size = self
            .engine
            .upload(&self.session, &self.bucket, &self.key, &self.path)
            .await?;
        self.stamp = stamp;
        tracing::info!("Synced {} back to s3://{}/{}", self.path.display(), self.bucket, self.key);
        Ok(size)
    }

    /// Upload only when the working copy changed
    pub async fn sync_if_changed(&mut self) -> S3Result<Option<u64>> {
        if !self.has_changed().await? {
            return Ok(None);
        }
        self.sync_back().await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cache::ListingCache;
    use crate::navigator::Lister;
    use crate::s3::credentials::Profile;
    use crate::s3::error::S3Error;
    use crate::s3::memory::InMemoryStore;
    use crate::s3::types::{KeyPrefix, ListingEntry};
    use crate::settings::EngineSettings;

    fn setup(edit_dir: &Path) -> (Arc<InMemoryStore>, Session, TransferEngine) {
        let store = Arc::new(InMemoryStore::new());
        store.create_bucket("assets");
        store.insert("assets", "docs/guide.md", "# Guide");
        let session = Session::new(Profile::named("work"), store.clone());
        let settings = EngineSettings {
            edit_dir: Some(edit_dir.to_path_buf()),
            ..EngineSettings::default()
        };
        (store, session, TransferEngine::new(ListingCache::new(), settings))
    }

    fn touch_later(path: &Path) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
    }

    fn guide_size(listing: &[ListingEntry]) -> Option<u64> {
        listing.iter().find_map(|entry| match entry {
            ListingEntry::File(file) if file.name == "guide.md" => Some(file.size),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_edit_round_trip_refreshes_listing() {
        let root = TempDir::new().unwrap();
        let (store, session, engine) = setup(root.path());
        let lister = Lister::new(engine.cache().clone(), &EngineSettings::default());
        let docs = KeyPrefix::parse("docs/").unwrap();
        let before = lister.list_level(&session, "assets", &docs).await.unwrap();
        assert_eq!(guide_size(&before), Some(7));

        let mut edit = engine
            .open_for_edit(&session, "assets", "docs/guide.md")
            .await
            .unwrap();
        assert!(edit.path().starts_with(root.path()));
        assert_eq!(std::fs::read_to_string(edit.path()).unwrap(), "# Guide");
        assert!(!edit.has_changed().await.unwrap());
        assert_eq!(edit.sync_if_changed().await.unwrap(), None);

        std::fs::write(edit.path(), "# Guide\n\nEdited locally.").unwrap();
        touch_later(edit.path());
        assert!(edit.has_changed().await.unwrap());

        let size = edit.sync_back().await.unwrap();
        assert_eq!(size, 24);
        assert_eq!(
            store.object("assets", "docs/guide.md").unwrap(),
            "# Guide\n\nEdited locally.".as_bytes()
        );
        assert!(!edit.has_changed().await.unwrap());

        let after = lister.list_level(&session, "assets", &docs).await.unwrap();
        assert_eq!(guide_size(&after), Some(24));
    }

    #[tokio::test]
    async fn test_scratch_dir_removed_on_drop() {
        let root = TempDir::new().unwrap();
        let (_store, session, engine) = setup(root.path());
        let edit = engine
            .open_for_edit(&session, "assets", "docs/guide.md")
            .await
            .unwrap();
        let scratch = edit.path().parent().unwrap().to_path_buf();
        assert!(scratch.exists());
        drop(edit);
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_open_for_edit_rejects_folders_and_missing_keys() {
        let root = TempDir::new().unwrap();
        let (_store, session, engine) = setup(root.path());
        assert!(matches!(
            engine.open_for_edit(&session, "assets", "docs/").await,
            Err(S3Error::InvalidName(_))
        ));
        assert!(engine
            .open_for_edit(&session, "assets", "docs/missing.md")
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_deleted_working_copy_is_io_error() {
        let root = TempDir::new().unwrap();
        let (_store, session, engine) = setup(root.path());
        let edit = engine
            .open_for_edit(&session, "assets", "docs/guide.md")
            .await
            .unwrap();
        std::fs::remove_file(edit.path()).unwrap();
        assert!(matches!(edit.has_changed().await, Err(S3Error::Io(_))));
    }
}
