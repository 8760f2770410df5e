//! Object storage abstraction
//!
//! The engine talks to buckets through [`ObjectStore`]. [`crate::s3::S3Client`]
//! implements it on top of the AWS SDK and [`crate::s3::InMemoryStore`]
//! implements it for tests and offline demos.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::s3::error::S3Result;
use crate::s3::types::{Bucket, ListPage, ObjectSummary};

/// Streaming body of a downloaded object
pub struct ObjectBody {
    /// Content length announced by the store
    pub size: u64,
    pub chunks: BoxStream<'static, S3Result<Bytes>>,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody").field("size", &self.size).finish()
    }
}

/// A part accepted by a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Region the store is bound to, for display
    fn region(&self) -> &str;

    async fn list_buckets(&self) -> S3Result<Vec<Bucket>>;

    /// Fetch one listing page. With a delimiter, keys sharing a prefix up to
    /// the next delimiter are folded into `common_prefixes`.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        continuation_token: Option<String>,
        max_keys: i32,
    ) -> S3Result<ListPage>;

    /// Metadata of one object; `NotFound` when absent
    async fn head_object(&self, bucket: &str, key: &str) -> S3Result<ObjectSummary>;

    async fn get_object(&self, bucket: &str, key: &str) -> S3Result<ObjectBody>;

    /// Write a whole object, replacing any existing one
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> S3Result<()>;

    async fn delete_object(&self, bucket: &str, key: &str) -> S3Result<()>;

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> S3Result<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> S3Result<CompletedPart>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> S3Result<()>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> S3Result<()>;
}

/// Follow continuation tokens until the listing is exhausted
pub async fn list_all_pages(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    delimiter: Option<char>,
    page_size: i32,
) -> S3Result<ListPage> {
    let mut aggregate = ListPage::default();
    let mut token: Option<String> = None;

    loop {
        let page = store
            .list_page(bucket, prefix, delimiter, token.take(), page_size)
            .await?;
        aggregate.common_prefixes.extend(page.common_prefixes);
        aggregate.objects.extend(page.objects);

        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    Ok(aggregate)
}
