//! Authenticated sessions and bucket enumeration

use std::sync::Arc;

use crate::s3::credentials::Profile;
use crate::s3::error::{S3Error, S3Result};
use crate::s3::store::ObjectStore;
use crate::s3::types::Bucket;

/// Authenticated handle bound to one profile.
///
/// Cloning is cheap; clones share the underlying store.
#[derive(Clone)]
pub struct Session {
    profile: Arc<Profile>,
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("profile", &self.profile.name)
            .field("region", &self.store.region())
            .finish()
    }
}

impl Session {
    /// Wrap a store without checking that it accepts our credentials
    pub fn new(profile: Profile, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            profile: Arc::new(profile),
            store,
        }
    }

    /// Wrap a store after a harmless list call proves the credentials work.
    ///
    /// A permission error on that call still yields a session: the
    /// credentials were accepted, the account just cannot enumerate buckets.
    pub async fn establish(profile: Profile, store: Arc<dyn ObjectStore>) -> S3Result<Self> {
        match store.list_buckets().await {
            Ok(_) => {}
            Err(S3Error::Access(msg)) => {
                tracing::warn!(
                    "Profile '{}' cannot list buckets, continuing: {}",
                    profile.name,
                    msg
                );
            }
            Err(e) => {
                tracing::error!("Failed to authenticate profile '{}': {}", profile.name, e);
                return Err(S3Error::Authentication(format!("profile '{}': {}", profile.name, e)));
            }
        }

        tracing::info!(
            "Connected to profile: {} (Region: {})",
            profile.name,
            store.region()
        );
        Ok(Self::new(profile, store))
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn profile_id(&self) -> &str {
        &self.profile.name
    }

    pub fn region(&self) -> &str {
        self.store.region()
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }
}

/// Buckets visible to the session, ordered by name
pub async fn list_buckets(session: &Session) -> S3Result<Vec<Bucket>> {
    let mut buckets = session.store().list_buckets().await.map_err(|e| match e {
        // An auth failure at this point is a permission problem of the session
        S3Error::Authentication(msg) => S3Error::Access(msg),
        other => other,
    })?;
    buckets.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::debug!("Listed {} bucket(s) for {}", buckets.len(), session.profile_id());
    Ok(buckets)
}

/// Case-insensitive substring filter for the bucket search box
pub fn filter_buckets<'a>(buckets: &'a [Bucket], query: &str) -> Vec<&'a Bucket> {
    let needle = query.trim().to_lowercase();
    buckets
        .iter()
        .filter(|b| needle.is_empty() || b.name.to_lowercase().contains(&needle))
        .collect()
}
