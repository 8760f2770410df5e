//! In-memory object store
//!
//! Implements the same listing semantics as S3 (delimiter folding, ordered
//! keys, continuation tokens) so the engine can be exercised without a
//! network. Faults can be queued per operation to simulate service errors.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::s3::error::{S3Error, S3Result};
use crate::s3::store::{CompletedPart, ObjectBody, ObjectStore};
use crate::s3::types::{Bucket, ListPage, ObjectSummary};

/// Chunk size used when streaming object bodies back
const STREAM_CHUNK: usize = 64 * 1024;

/// Operations a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ListBuckets,
    ListPage,
    Head,
    Get,
    Put,
    Delete,
    UploadPart,
}

/// Failure to inject on the next call of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    AccessDenied,
    AuthRejected,
}

impl Fault {
    fn into_error(self, target: &str) -> S3Error {
        match self {
            Fault::Transient => S3Error::Transient(format!("{}: injected fault", target)),
            Fault::AccessDenied => S3Error::Access(format!("{}: injected fault", target)),
            Fault::AuthRejected => S3Error::Authentication(format!("{}: injected fault", target)),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: chrono::DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
    faults: HashMap<StoreOp, VecDeque<Fault>>,
    calls: HashMap<StoreOp, usize>,
}

/// Thread-safe in-memory bucket store
#[derive(Debug)]
pub struct InMemoryStore {
    region: String,
    state: Mutex<State>,
    next_upload: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            region: "us-east-1".to_string(),
            state: Mutex::new(State::default()),
            next_upload: AtomicU64::new(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_bucket(&self, name: &str) {
        self.state().buckets.entry(name.to_string()).or_default();
    }

    /// Seed an object without going through the trait
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let mut state = self.state();
        state.buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                last_modified: Utc::now(),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| o.data.clone())
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    /// All keys in a bucket, in key order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue a fault for the next call of `op`
    pub fn inject(&self, op: StoreOp, fault: Fault) {
        self.state().faults.entry(op).or_default().push_back(fault);
    }

    /// Number of calls made to `op` so far
    pub fn calls(&self, op: StoreOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn pending_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    fn enter(&self, op: StoreOp, target: &str) -> S3Result<MutexGuard<'_, State>> {
        let mut state = self.state();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(fault) = state.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(fault.into_error(target));
        }
        Ok(state)
    }
}

fn bucket_mut<'a>(state: &'a mut State, bucket: &str) -> S3Result<&'a mut BTreeMap<String, StoredObject>> {
    state
        .buckets
        .get_mut(bucket)
        .ok_or_else(|| S3Error::NotFound(format!("{} (NoSuchBucket)", bucket)))
}

fn summary(key: &str, object: &StoredObject) -> ObjectSummary {
    ObjectSummary {
        key: key.to_string(),
        size: object.data.len() as u64,
        last_modified: Some(object.last_modified),
        etag: None,
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    fn region(&self) -> &str {
        &self.region
    }

    async fn list_buckets(&self) -> S3Result<Vec<Bucket>> {
        let state = self.enter(StoreOp::ListBuckets, "list buckets")?;
        Ok(state
            .buckets
            .keys()
            .map(|name| Bucket {
                name: name.clone(),
                creation_date: None,
                region: Some(self.region.clone()),
            })
            .collect())
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        continuation_token: Option<String>,
        max_keys: i32,
    ) -> S3Result<ListPage> {
        let mut state = self.enter(StoreOp::ListPage, bucket)?;
        let objects = bucket_mut(&mut state, bucket)?;
        let limit = max_keys.max(1) as usize;

        let mut page = ListPage::default();
        let mut emitted = 0usize;
        let mut last_marker: Option<String> = None;

        for (key, object) in objects.iter() {
            if !key.starts_with(prefix) {
                continue;
            }
            // Resume strictly after the marker; a marker ending in the
            // delimiter stands for a whole common prefix.
            if let Some(token) = continuation_token.as_deref() {
                if key.as_str() <= token {
                    continue;
                }
                if delimiter.is_some_and(|d| token.ends_with(d)) && key.starts_with(token) {
                    continue;
                }
            }

            let rest = &key[prefix.len()..];
            let folded = delimiter
                .and_then(|d| rest.find(d).map(|pos| format!("{}{}", prefix, &rest[..=pos])));

            if let Some(common) = folded {
                if page.common_prefixes.last() == Some(&common) {
                    continue;
                }
                if emitted == limit {
                    page.next_token = last_marker;
                    return Ok(page);
                }
                last_marker = Some(common.clone());
                page.common_prefixes.push(common);
            } else {
                if emitted == limit {
                    page.next_token = last_marker;
                    return Ok(page);
                }
                last_marker = Some(key.clone());
                page.objects.push(summary(key, object));
            }
            emitted += 1;
        }

        Ok(page)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> S3Result<ObjectSummary> {
        let mut state = self.enter(StoreOp::Head, key)?;
        let objects = bucket_mut(&mut state, bucket)?;
        objects
            .get(key)
            .map(|o| summary(key, o))
            .ok_or_else(|| S3Error::NotFound(format!("{} (NoSuchKey)", key)))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> S3Result<ObjectBody> {
        let mut state = self.enter(StoreOp::Get, key)?;
        let objects = bucket_mut(&mut state, bucket)?;
        let data = objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| S3Error::NotFound(format!("{} (NoSuchKey)", key)))?;

        let size = data.len() as u64;
        let chunks: Vec<S3Result<Bytes>> = data
            .chunks(STREAM_CHUNK)
            .map(|c| Ok(data.slice_ref(c)))
            .collect();

        Ok(ObjectBody {
            size,
            chunks: stream::iter(chunks).boxed(),
        })
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> S3Result<()> {
        let mut state = self.enter(StoreOp::Put, key)?;
        bucket_mut(&mut state, bucket)?.insert(
            key.to_string(),
            StoredObject {
                data: body,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> S3Result<()> {
        let mut state = self.enter(StoreOp::Delete, key)?;
        // Like S3, deleting an absent key succeeds
        bucket_mut(&mut state, bucket)?.remove(key);
        Ok(())
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> S3Result<String> {
        let mut state = self.state();
        bucket_mut(&mut state, bucket)?;
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::Relaxed));
        state.uploads.insert(
            id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> S3Result<CompletedPart> {
        let mut state = self.enter(StoreOp::UploadPart, key)?;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| S3Error::NotFound(format!("{} (NoSuchUpload)", upload_id)))?;
        upload.parts.insert(part_number, body);
        Ok(CompletedPart {
            part_number,
            etag: format!("{}-{}", upload_id, part_number),
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> S3Result<()> {
        let mut state = self.state();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| S3Error::NotFound(format!("{} (NoSuchUpload)", upload_id)))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(S3Error::Access(format!("{}: upload id belongs to another key", key)));
        }

        let mut data = Vec::new();
        for part in &parts {
            let chunk = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| S3Error::Access(format!("{}: part {} missing", key, part.part_number)))?;
            data.extend_from_slice(chunk);
        }

        bucket_mut(&mut state, bucket)?.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> S3Result<()> {
        self.state().uploads.remove(upload_id);
        Ok(())
    }
}
