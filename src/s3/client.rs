//! AWS S3 client wrapper

use async_trait::async_trait;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as SdkCompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};

use crate::s3::error::{classify_sdk_error, S3Error, S3Result};
use crate::s3::store::{CompletedPart, ObjectBody, ObjectStore};
use crate::s3::types::{Bucket, ListPage, ObjectSummary};

const DEFAULT_REGION: &str = "us-east-1";

/// Overrides for talking to S3-compatible endpoints (MinIO, LocalStack)
#[derive(Debug, Clone, Default)]
pub struct S3ClientConfig {
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// S3 client wrapper with high-level operations
pub struct S3Client {
    client: Client,
    current_region: String,
}

fn to_chrono(d: &aws_sdk_s3::primitives::DateTime) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(d.secs(), d.subsec_nanos()).unwrap_or_default()
}

impl S3Client {
    /// Create a new S3 client for the given profile
    pub async fn new(profile_name: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(profile) = profile_name {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;

        let current_region = config
            .region()
            .map(|r| r.to_string())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        tracing::debug!(
            "Created S3 client for profile {:?} in {}",
            profile_name,
            current_region
        );

        Self {
            client: Client::new(&config),
            current_region,
        }
    }

    /// Create a client with explicit endpoint and credentials
    pub async fn with_config(config: S3ClientConfig) -> S3Result<Self> {
        let region = config
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));

        match (config.access_key_id, config.secret_access_key) {
            (Some(ak), Some(sk)) => {
                loader = loader.credentials_provider(Credentials::new(ak, sk, None, None, "static"));
            }
            (None, None) => {}
            _ => {
                return Err(S3Error::Configuration(
                    "both access key id and secret access key must be provided".to_string(),
                ))
            }
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            current_region: region,
        })
    }

    /// Create a bucket. Used by integration fixtures; the browser never creates buckets.
    pub async fn create_bucket(&self, bucket: &str) -> S3Result<()> {
        self.client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, bucket))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    fn region(&self) -> &str {
        &self.current_region
    }

    async fn list_buckets(&self) -> S3Result<Vec<Bucket>> {
        let response = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "list buckets"))?;

        let buckets = response
            .buckets()
            .iter()
            .map(|b| Bucket {
                name: b.name().unwrap_or_default().to_string(),
                creation_date: b.creation_date().map(to_chrono),
                region: None,
            })
            .collect();

        Ok(buckets)
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        continuation_token: Option<String>,
        max_keys: i32,
    ) -> S3Result<ListPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .max_keys(max_keys);

        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }
        if let Some(d) = delimiter {
            request = request.delimiter(d.to_string());
        }
        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, bucket))?;

        let common_prefixes = response
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();

        let objects = response
            .contents()
            .iter()
            .map(|obj| ObjectSummary {
                key: obj.key().unwrap_or_default().to_string(),
                size: obj.size().unwrap_or(0).max(0) as u64,
                last_modified: obj.last_modified().map(to_chrono),
                etag: obj.e_tag().map(|s| s.trim_matches('"').to_string()),
            })
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            common_prefixes,
            objects,
            next_token,
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> S3Result<ObjectSummary> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        Ok(ObjectSummary {
            key: key.to_string(),
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified: output.last_modified().map(to_chrono),
            etag: output.e_tag().map(|s| s.trim_matches('"').to_string()),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> S3Result<ObjectBody> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        let size = output.content_length().unwrap_or(0).max(0) as u64;
        let owned_key = key.to_string();
        let chunks = stream::try_unfold(output.body, move |mut body: ByteStream| {
            let key = owned_key.clone();
            async move {
                match body.try_next().await {
                    Ok(Some(chunk)) => Ok(Some((chunk, body))),
                    Ok(None) => Ok(None),
                    Err(e) => Err(S3Error::Transient(format!("{}: download stream failed: {}", key, e))),
                }
            }
        })
        .boxed();

        Ok(ObjectBody { size, chunks })
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> S3Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> S3Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        Ok(())
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> S3Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| S3Error::Transient(format!("{}: missing multipart upload id", key)))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> S3Result<CompletedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        Ok(CompletedPart {
            part_number,
            etag: output.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> S3Result<()> {
        let parts = parts
            .into_iter()
            .map(|p| {
                SdkCompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> S3Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        Ok(())
    }
}
