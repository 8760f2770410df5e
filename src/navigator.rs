//! Directory-tree view over a flat key space
//!
//! [`Lister`] turns delimiter listings into folder and file entries, going
//! through the [`ListingCache`] first. [`Navigator`] keeps the current
//! bucket/prefix cursor for one session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cache::ListingCache;
use crate::s3::error::{S3Error, S3Result};
use crate::s3::session::Session;
use crate::s3::store::list_all_pages;
use crate::s3::types::{
    sort_entries, FileEntry, FolderEntry, KeyPrefix, ListPage, ListingEntry, S3Url, DELIMITER,
};
use crate::settings::EngineSettings;

/// Listing shared by the cache and its callers
pub type Listing = Arc<Vec<ListingEntry>>;

/// Cache-backed level lister. Clones share the cache.
#[derive(Debug, Clone)]
pub struct Lister {
    cache: ListingCache,
    page_size: i32,
    retries: u32,
    backoff: Duration,
}

impl Lister {
    pub fn new(cache: ListingCache, settings: &EngineSettings) -> Self {
        Self {
            cache,
            page_size: settings.page_size,
            retries: settings.listing_retries,
            backoff: settings.retry_backoff(),
        }
    }

    pub fn cache(&self) -> &ListingCache {
        &self.cache
    }

    /// Entries directly under `prefix`, from the cache when present
    pub async fn list_level(
        &self,
        session: &Session,
        bucket: &str,
        prefix: &KeyPrefix,
    ) -> S3Result<Listing> {
        if let Some(hit) = self.cache.get(session.profile_id(), bucket, prefix) {
            tracing::debug!("Cache hit for {}/{}", bucket, prefix);
            return Ok(hit.entries);
        }
        self.fetch(session, bucket, prefix).await
    }

    /// Drop the cached level and fetch it again
    pub async fn refresh(
        &self,
        session: &Session,
        bucket: &str,
        prefix: &KeyPrefix,
    ) -> S3Result<Listing> {
        self.cache
            .invalidate(session.profile_id(), bucket, prefix, false);
        self.fetch(session, bucket, prefix).await
    }

    /// Run [`Lister::list_level`] on a background task
    pub fn spawn_list(
        &self,
        session: Session,
        bucket: String,
        prefix: KeyPrefix,
    ) -> JoinHandle<S3Result<Listing>> {
        let lister = self.clone();
        tokio::spawn(async move { lister.list_level(&session, &bucket, &prefix).await })
    }

    async fn fetch(&self, session: &Session, bucket: &str, prefix: &KeyPrefix) -> S3Result<Listing> {
        let profile = session.profile_id();
        let ticket = self.cache.begin_fetch(profile, bucket);

        let page = self.fetch_with_retry(session, bucket, prefix).await?;
        let entries = build_entries(prefix, page);
        tracing::info!(
            "Listed {} entries in s3://{}/{}",
            entries.len(),
            bucket,
            prefix
        );

        self.cache
            .put_fetched(ticket, profile, bucket, prefix, entries.clone());
        Ok(Arc::new(entries))
    }

    async fn fetch_with_retry(
        &self,
        session: &Session,
        bucket: &str,
        prefix: &KeyPrefix,
    ) -> S3Result<ListPage> {
        let mut attempt = 0u32;
        loop {
            let result = list_all_pages(
                session.store(),
                bucket,
                prefix.as_str(),
                Some(DELIMITER),
                self.page_size,
            )
            .await;

            match result {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    tracing::warn!(
                        "Listing {}/{} failed ({}), retry {} in {:?}",
                        bucket,
                        prefix,
                        e,
                        attempt,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                // An inaccessible bucket looks the same as a missing one to the user
                Err(S3Error::Access(msg)) => return Err(S3Error::NotFound(msg)),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Fold an aggregated listing page into sorted tree entries
pub fn build_entries(prefix: &KeyPrefix, page: ListPage) -> Vec<ListingEntry> {
    let base = prefix.as_str();
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(page.common_prefixes.len() + page.objects.len());

    for common in page.common_prefixes {
        let Some(rest) = common.strip_prefix(base) else {
            continue;
        };
        let name = rest.trim_end_matches(DELIMITER);
        if name.is_empty() || name.contains(DELIMITER) {
            tracing::debug!("Skipping unnavigable prefix {:?}", common);
            continue;
        }
        if seen.insert(name.to_string()) {
            entries.push(ListingEntry::Folder(FolderEntry {
                name: name.to_string(),
                prefix: common.clone(),
            }));
        }
    }

    for object in page.objects {
        // The folder's own placeholder and stray markers are not files
        if object.key == base || object.key.ends_with(DELIMITER) {
            continue;
        }
        let Some(name) = object.key.strip_prefix(base) else {
            continue;
        };
        entries.push(ListingEntry::File(FileEntry {
            name: name.to_string(),
            key: object.key.clone(),
            size: object.size,
            last_modified: object.last_modified,
        }));
    }

    sort_entries(&mut entries);
    entries
}

/// Where the user currently is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigationState {
    pub bucket: Option<String>,
    pub prefix: KeyPrefix,
}

impl NavigationState {
    /// Location rendered as an s3:// URL
    pub fn url(&self) -> Option<String> {
        self.bucket
            .as_ref()
            .map(|bucket| format!("s3://{}/{}", bucket, self.prefix))
    }
}

/// Cursor over one session's buckets
#[derive(Debug)]
pub struct Navigator {
    session: Session,
    lister: Lister,
    state: NavigationState,
}

impl Navigator {
    pub fn new(session: Session, lister: Lister) -> Self {
        Self {
            session,
            lister,
            state: NavigationState::default(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn lister(&self) -> &Lister {
        &self.lister
    }

    pub fn state(&self) -> &NavigationState {
        &self.state
    }

    pub fn bucket(&self) -> Option<&str> {
        self.state.bucket.as_deref()
    }

    pub fn prefix(&self) -> &KeyPrefix {
        &self.state.prefix
    }

    /// Switch bucket and return to its root
    pub fn select_bucket(&mut self, bucket: &str) {
        tracing::debug!("Selected bucket {}", bucket);
        self.state.bucket = Some(bucket.to_string());
        self.state.prefix = KeyPrefix::root();
    }

    /// Descend into a folder of the current level
    pub fn navigate_into(&mut self, folder: &FolderEntry) -> S3Result<()> {
        let next = self.state.prefix.child(&folder.name)?;
        if next.as_str() != folder.prefix {
            return Err(S3Error::InvalidName(format!(
                "{} is not a folder of {}",
                folder.prefix, self.state.prefix
            )));
        }
        self.state.prefix = next;
        Ok(())
    }

    /// Go one level up; stays put at the bucket root
    pub fn navigate_up(&mut self) {
        self.state.prefix = self.state.prefix.parent();
    }

    pub fn go_home(&mut self) {
        self.state.prefix = KeyPrefix::root();
    }

    /// Jump to the bucket and folder named by an S3 URL. A file URL lands
    /// in the folder holding the file.
    pub fn navigate_to_url(&mut self, url: &str) -> S3Result<()> {
        let parsed = S3Url::parse(url.trim())
            .ok_or_else(|| S3Error::InvalidName(format!("not an S3 URL: {}", url)))?;
        self.state.bucket = Some(parsed.bucket.clone());
        self.state.prefix = parsed.folder();
        tracing::info!("Navigated to {}", parsed.to_s3_url());
        Ok(())
    }

    /// Jump to a location given as a URL or as `bucket[/prefix]`. Unlike a
    /// URL, a bare path always names a folder.
    pub fn navigate_to_location(&mut self, location: &str) -> S3Result<()> {
        let location = location.trim();
        if location.contains("://") {
            return self.navigate_to_url(location);
        }

        let (bucket, rest) = location.split_once(DELIMITER).unwrap_or((location, ""));
        if bucket.is_empty() {
            return Err(S3Error::InvalidName(format!("no bucket in {}", location)));
        }
        let prefix = KeyPrefix::parse(rest)?;
        self.state.bucket = Some(bucket.to_string());
        self.state.prefix = prefix;
        tracing::info!("Navigated to s3://{}/{}", bucket, self.state.prefix);
        Ok(())
    }

    fn current_bucket(&self) -> S3Result<String> {
        self.state
            .bucket
            .clone()
            .ok_or_else(|| S3Error::NotFound("no bucket selected".to_string()))
    }

    /// Entries of the current level
    pub async fn list_current_level(&self) -> S3Result<Listing> {
        let bucket = self.current_bucket()?;
        self.lister
            .list_level(&self.session, &bucket, &self.state.prefix)
            .await
    }

    /// Refetch the current level regardless of the cache
    pub async fn refresh(&self) -> S3Result<Listing> {
        let bucket = self.current_bucket()?;
        self.lister
            .refresh(&self.session, &bucket, &self.state.prefix)
            .await
    }
}
