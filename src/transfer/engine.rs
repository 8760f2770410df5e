//! Upload, download and delete engine
//!
//! A job is planned up front into independent units, which then run one
//! after another. A failed unit does not stop the job; cancellation is
//! checked between units and at chunk or part boundaries inside a unit.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::TryStreamExt;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::cache::ListingCache;
use crate::s3::error::{S3Error, S3Result};
use crate::s3::session::Session;
use crate::s3::store::{list_all_pages, CompletedPart, ObjectStore};
use crate::s3::types::{FolderEntry, KeyPrefix, DELIMITER};
use crate::settings::EngineSettings;
use crate::transfer::job::{
    CancelFlag, JobEvent, JobHandle, JobId, JobReport, JobState, ProgressReporter, TransferJob,
    TransferKind, TransferUnit, UnitOutcome,
};

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRequest {
    Upload {
        bucket: String,
        key: String,
        local_path: PathBuf,
    },
    Download {
        bucket: String,
        key: String,
        local_path: PathBuf,
    },
    Delete {
        bucket: String,
        key: String,
    },
    /// Every file below `local_dir` lands at `prefix` + its relative path
    RecursiveUpload {
        bucket: String,
        prefix: KeyPrefix,
        local_dir: PathBuf,
    },
    /// Every key below `prefix` lands in `local_dir` + the rest of the key
    RecursiveDownload {
        bucket: String,
        prefix: KeyPrefix,
        local_dir: PathBuf,
    },
    DeleteBatch {
        bucket: String,
        keys: Vec<String>,
    },
    /// Delete a folder: every key below the prefix and its placeholder
    DeletePrefix {
        bucket: String,
        prefix: KeyPrefix,
    },
}

impl TransferRequest {
    pub fn kind(&self) -> TransferKind {
        match self {
            TransferRequest::Upload { .. } => TransferKind::Upload,
            TransferRequest::Download { .. } => TransferKind::Download,
            TransferRequest::Delete { .. } => TransferKind::Delete,
            TransferRequest::RecursiveUpload { .. } => TransferKind::RecursiveUpload,
            TransferRequest::RecursiveDownload { .. } => TransferKind::RecursiveDownload,
            TransferRequest::DeleteBatch { .. } => TransferKind::DeleteBatch,
            TransferRequest::DeletePrefix { .. } => TransferKind::DeletePrefix,
        }
    }

    pub fn bucket(&self) -> &str {
        match self {
            TransferRequest::Upload { bucket, .. }
            | TransferRequest::Download { bucket, .. }
            | TransferRequest::Delete { bucket, .. }
            | TransferRequest::RecursiveUpload { bucket, .. }
            | TransferRequest::RecursiveDownload { bucket, .. }
            | TransferRequest::DeleteBatch { bucket, .. }
            | TransferRequest::DeletePrefix { bucket, .. } => bucket,
        }
    }

    fn endpoints(&self) -> (String, String) {
        match self {
            TransferRequest::Upload {
                bucket,
                key,
                local_path,
            } => (local_path.display().to_string(), s3_url(bucket, key)),
            TransferRequest::Download {
                bucket,
                key,
                local_path,
            } => (s3_url(bucket, key), local_path.display().to_string()),
            TransferRequest::Delete { bucket, key } => (s3_url(bucket, key), String::new()),
            TransferRequest::RecursiveUpload {
                bucket,
                prefix,
                local_dir,
            } => (local_dir.display().to_string(), s3_url(bucket, prefix.as_str())),
            TransferRequest::RecursiveDownload {
                bucket,
                prefix,
                local_dir,
            } => (s3_url(bucket, prefix.as_str()), local_dir.display().to_string()),
            TransferRequest::DeleteBatch { bucket, keys } => {
                (format!("{} object(s) in s3://{}", keys.len(), bucket), String::new())
            }
            TransferRequest::DeletePrefix { bucket, prefix } => {
                (s3_url(bucket, prefix.as_str()), String::new())
            }
        }
    }
}

fn s3_url(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}

/// One executable piece of a plan
#[derive(Debug)]
enum Step {
    Upload { path: PathBuf, key: String },
    Download { key: String, path: PathBuf, create_parent: bool },
    MakeDir { path: PathBuf },
    Delete { key: String, must_exist: bool },
    /// Planning already failed for this unit
    Rejected(S3Error),
}

/// Runs transfer jobs and keeps the listing cache in step with mutations.
/// Clones share the cache and the job id counter.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    cache: ListingCache,
    settings: EngineSettings,
    next_id: Arc<AtomicU64>,
}

impl TransferEngine {
    pub fn new(cache: ListingCache, settings: EngineSettings) -> Self {
        Self {
            cache,
            settings,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn cache(&self) -> &ListingCache {
        &self.cache
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn allocate_id(&self) -> JobId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start a job on a background task
    pub fn spawn(&self, session: Session, request: TransferRequest) -> JobHandle {
        self.spawn_with_cancel(session, request, CancelFlag::new())
    }

    /// Start a job observing an existing cancellation flag
    pub fn spawn_with_cancel(
        &self,
        session: Session,
        request: TransferRequest,
        cancel: CancelFlag,
    ) -> JobHandle {
        let id = self.allocate_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.clone();
        let job_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let reporter = ProgressReporter::new(id, tx, engine.settings.progress_interval());
            engine.run(&session, request, &job_cancel, reporter).await
        });
        JobHandle::new(id, cancel, rx, task)
    }

    /// Run a job on the current task without an event channel
    pub async fn execute(
        &self,
        session: &Session,
        request: TransferRequest,
        cancel: &CancelFlag,
    ) -> JobReport {
        let reporter = ProgressReporter::silent(self.allocate_id());
        self.run(session, request, cancel, reporter).await
    }

    async fn run(
        &self,
        session: &Session,
        request: TransferRequest,
        cancel: &CancelFlag,
        mut reporter: ProgressReporter,
    ) -> JobReport {
        let (source, destination) = request.endpoints();
        let mut job = TransferJob {
            id: reporter.job_id(),
            kind: request.kind(),
            source,
            destination,
            state: JobState::Pending,
            bytes_transferred: 0,
            bytes_total: 0,
        };
        tracing::info!(
            "Job {} {:?}: {} -> {}",
            job.id,
            job.kind,
            job.source,
            job.destination
        );

        let store = session.store();
        let bucket = request.bucket().to_string();
        let plan = self.plan(store, &request).await;

        job.state = JobState::InProgress;
        job.bytes_total = plan.iter().map(|(unit, _)| unit.bytes).sum();
        reporter.set_total(job.bytes_total);
        reporter.emit_progress();

        let mut units = Vec::with_capacity(plan.len());
        let mut cancelled = false;
        for (unit, step) in plan {
            if cancelled || cancel.is_cancelled() {
                cancelled = true;
                units.push((unit, UnitOutcome::Cancelled));
                continue;
            }

            let outcome = match self
                .run_step(store, &bucket, step, cancel, &mut reporter)
                .await
            {
                Ok(bytes) => {
                    tracing::debug!("Job {}: {} done", job.id, unit);
                    UnitOutcome::Succeeded { bytes }
                }
                Err(S3Error::Cancelled) => {
                    cancelled = true;
                    UnitOutcome::Cancelled
                }
                Err(e) => {
                    tracing::warn!("Job {}: {} failed ({}): {}", job.id, unit, e.kind(), e);
                    UnitOutcome::Failed(Arc::new(e))
                }
            };
            reporter.send(JobEvent::UnitFinished {
                job_id: job.id,
                unit: unit.clone(),
                outcome: outcome.clone(),
            });
            units.push((unit, outcome));
        }

        if job.kind.is_mutation() && units.iter().any(|(_, o)| o.is_success()) {
            self.invalidate_after(session.profile_id(), &request);
        }

        job.bytes_transferred = reporter.transferred();
        job.state = if cancelled {
            JobState::Cancelled
        } else if units.iter().any(|(_, o)| o.error().is_some()) {
            JobState::Failed
        } else {
            JobState::Completed
        };
        reporter.emit_progress();
        reporter.send(JobEvent::Finished {
            job_id: job.id,
            state: job.state,
        });

        let succeeded = units.iter().filter(|(_, o)| o.is_success()).count();
        tracing::info!(
            "Job {} finished {:?}: {}/{} unit(s) succeeded",
            job.id,
            job.state,
            succeeded,
            units.len()
        );

        JobReport { job, units }
    }

    async fn run_step(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        step: Step,
        cancel: &CancelFlag,
        reporter: &mut ProgressReporter,
    ) -> S3Result<u64> {
        match step {
            Step::Upload { path, key } => {
                self.upload_file(store, bucket, &key, &path, cancel, reporter)
                    .await
            }
            Step::Download {
                key,
                path,
                create_parent,
            } => {
                if create_parent {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                }
                download_file(store, bucket, &key, &path, cancel, reporter).await
            }
            Step::MakeDir { path } => {
                fs::create_dir_all(&path).await?;
                Ok(0)
            }
            Step::Delete { key, must_exist } => {
                if must_exist {
                    store.head_object(bucket, &key).await?;
                }
                store.delete_object(bucket, &key).await?;
                tracing::debug!("Deleted s3://{}/{}", bucket, key);
                Ok(0)
            }
            Step::Rejected(e) => Err(e),
        }
    }

    /// Expand a request into units
    async fn plan(&self, store: &dyn ObjectStore, request: &TransferRequest) -> Vec<(TransferUnit, Step)> {
        match request {
            TransferRequest::Upload {
                key, local_path, ..
            } => {
                let unit = TransferUnit {
                    source: local_path.display().to_string(),
                    destination: key.clone(),
                    bytes: fs::metadata(local_path).await.map(|m| m.len()).unwrap_or(0),
                };
                let step = Step::Upload {
                    path: local_path.clone(),
                    key: key.clone(),
                };
                vec![(unit, step)]
            }
            TransferRequest::Download {
                bucket,
                key,
                local_path,
            } => {
                let bytes = match store.head_object(bucket, key).await {
                    Ok(summary) => summary.size,
                    Err(_) => 0,
                };
                vec![(
                    TransferUnit {
                        source: key.clone(),
                        destination: local_path.display().to_string(),
                        bytes,
                    },
                    Step::Download {
                        key: key.clone(),
                        path: local_path.clone(),
                        create_parent: false,
                    },
                )]
            }
            TransferRequest::Delete { key, .. } => vec![delete_unit(key, true)],
            TransferRequest::DeleteBatch { keys, .. } => {
                keys.iter().map(|key| delete_unit(key, true)).collect()
            }
            TransferRequest::RecursiveUpload {
                prefix, local_dir, ..
            } => plan_upload_tree(local_dir, prefix),
            TransferRequest::RecursiveDownload {
                bucket,
                prefix,
                local_dir,
            } => match list_all_pages(store, bucket, prefix.as_str(), None, self.settings.page_size).await {
                Ok(page) => plan_download_tree(
                    prefix,
                    local_dir,
                    page.objects.into_iter().map(|o| (o.key, o.size)),
                ),
                Err(e) => vec![listing_failure(prefix, e)],
            },
            TransferRequest::DeletePrefix { bucket, prefix } => {
                if prefix.is_root() {
                    return vec![listing_failure(
                        prefix,
                        S3Error::InvalidName("refusing to delete a whole bucket".to_string()),
                    )];
                }
                match list_all_pages(store, bucket, prefix.as_str(), None, self.settings.page_size).await {
                    Ok(page) => page
                        .objects
                        .iter()
                        .map(|o| delete_unit(&o.key, false))
                        .collect(),
                    Err(e) => vec![listing_failure(prefix, e)],
                }
            }
        }
    }

    fn invalidate_after(&self, profile: &str, request: &TransferRequest) {
        match request {
            TransferRequest::Upload { bucket, key, .. } | TransferRequest::Delete { bucket, key } => {
                self.cache.invalidate_key(profile, bucket, key);
            }
            TransferRequest::DeleteBatch { bucket, keys } => {
                for key in keys {
                    self.cache.invalidate_key(profile, bucket, key);
                }
            }
            TransferRequest::RecursiveUpload { bucket, prefix, .. }
            | TransferRequest::DeletePrefix { bucket, prefix } => {
                self.cache.invalidate_tree(profile, bucket, prefix);
            }
            TransferRequest::Download { .. } | TransferRequest::RecursiveDownload { .. } => {}
        }
    }

    /// Upload one file, overwriting any object at `key`. Returns the size.
    pub async fn upload(
        &self,
        session: &Session,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> S3Result<u64> {
        let mut reporter = ProgressReporter::silent(0);
        let size = self
            .upload_file(
                session.store(),
                bucket,
                key,
                local_path,
                &CancelFlag::new(),
                &mut reporter,
            )
            .await?;
        self.cache.invalidate_key(session.profile_id(), bucket, key);
        Ok(size)
    }

    /// Download one object to `local_path`, replacing an existing file.
    /// The parent directory must already exist.
    pub async fn download(
        &self,
        session: &Session,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> S3Result<u64> {
        let mut reporter = ProgressReporter::silent(0);
        download_file(
            session.store(),
            bucket,
            key,
            local_path,
            &CancelFlag::new(),
            &mut reporter,
        )
        .await
    }

    /// Delete one object; `NotFound` when the key does not exist
    pub async fn delete_object(&self, session: &Session, bucket: &str, key: &str) -> S3Result<()> {
        let store = session.store();
        store.head_object(bucket, key).await?;
        store.delete_object(bucket, key).await?;
        self.cache.invalidate_key(session.profile_id(), bucket, key);
        tracing::info!("Deleted s3://{}/{}", bucket, key);
        Ok(())
    }

    /// Create a folder by writing an empty placeholder object
    pub async fn create_directory(
        &self,
        session: &Session,
        bucket: &str,
        parent: &KeyPrefix,
        name: &str,
    ) -> S3Result<FolderEntry> {
        let name = name.trim();
        let prefix = parent.child(name)?;
        session
            .store()
            .put_object(bucket, prefix.as_str(), Bytes::new())
            .await?;
        self.cache
            .invalidate_key(session.profile_id(), bucket, prefix.as_str());
        tracing::info!("Created folder s3://{}/{}", bucket, prefix);
        Ok(FolderEntry {
            name: name.to_string(),
            prefix: prefix.into(),
        })
    }

    async fn upload_file(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        key: &str,
        path: &Path,
        cancel: &CancelFlag,
        reporter: &mut ProgressReporter,
    ) -> S3Result<u64> {
        let meta = fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(S3Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }
        let size = meta.len();

        if size >= self.settings.multipart_threshold {
            return self
                .upload_multipart(store, bucket, key, path, cancel, reporter)
                .await;
        }

        let data = fs::read(path).await?;
        cancel.check()?;
        store.put_object(bucket, key, Bytes::from(data)).await?;
        reporter.advance(size);
        tracing::debug!("Uploaded {} to s3://{}/{} ({} bytes)", path.display(), bucket, key, size);
        Ok(size)
    }

    async fn upload_multipart(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        key: &str,
        path: &Path,
        cancel: &CancelFlag,
        reporter: &mut ProgressReporter,
    ) -> S3Result<u64> {
        let mut file = fs::File::open(path).await?;
        let upload_id = store.create_multipart_upload(bucket, key).await?;
        tracing::debug!("Started multipart upload {} for {}", upload_id, key);

        let result = self
            .send_parts(store, bucket, key, &upload_id, &mut file, cancel, reporter)
            .await;

        match result {
            Ok((parts, total)) => {
                store
                    .complete_multipart_upload(bucket, key, &upload_id, parts)
                    .await?;
                Ok(total)
            }
            Err(e) => {
                if let Err(abort_err) = store.abort_multipart_upload(bucket, key, &upload_id).await {
                    tracing::warn!("Failed to abort multipart upload {}: {}", upload_id, abort_err);
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_parts(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        key: &str,
        upload_id: &str,
        file: &mut fs::File,
        cancel: &CancelFlag,
        reporter: &mut ProgressReporter,
    ) -> S3Result<(Vec<CompletedPart>, u64)> {
        let part_size = self.settings.part_size as usize;
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut part_number = 1;

        loop {
            cancel.check()?;
            let chunk = read_chunk(file, part_size).await?;
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len() as u64;
            let part = store
                .upload_part(bucket, key, upload_id, part_number, Bytes::from(chunk))
                .await?;
            parts.push(part);
            total += len;
            reporter.advance(len);
            part_number += 1;
        }

        Ok((parts, total))
    }
}

fn delete_unit(key: &str, must_exist: bool) -> (TransferUnit, Step) {
    (
        TransferUnit {
            source: key.to_string(),
            destination: String::new(),
            bytes: 0,
        },
        Step::Delete {
            key: key.to_string(),
            must_exist,
        },
    )
}

fn listing_failure(prefix: &KeyPrefix, error: S3Error) -> (TransferUnit, Step) {
    (
        TransferUnit {
            source: prefix.to_string(),
            destination: String::new(),
            bytes: 0,
        },
        Step::Rejected(error),
    )
}

/// Walk `local_dir` and map each file to a key under `prefix`
fn plan_upload_tree(local_dir: &Path, prefix: &KeyPrefix) -> Vec<(TransferUnit, Step)> {
    let mut plan = Vec::new();

    for entry in WalkDir::new(local_dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let source = e
                    .path()
                    .unwrap_or(local_dir)
                    .display()
                    .to_string();
                plan.push((
                    TransferUnit {
                        source,
                        destination: String::new(),
                        bytes: 0,
                    },
                    Step::Rejected(S3Error::Io(e.into())),
                ));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path().to_path_buf();
        let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let unit_source = path.display().to_string();

        match relative_key(local_dir, &path) {
            Some(rel) => {
                let key = prefix.join_key(&rel);
                plan.push((
                    TransferUnit {
                        source: unit_source,
                        destination: key.clone(),
                        bytes,
                    },
                    Step::Upload { path, key },
                ));
            }
            None => plan.push((
                TransferUnit {
                    source: unit_source.clone(),
                    destination: String::new(),
                    bytes,
                },
                Step::Rejected(S3Error::InvalidName(unit_source)),
            )),
        }
    }

    plan
}

/// Path of `path` below `root` as a `/`-separated key suffix
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let segments = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<&str>>>()?;
    if segments.is_empty() {
        return None;
    }
    Some(segments.join(&DELIMITER.to_string()))
}

/// Map listed keys under `prefix` to paths under `local_dir`
fn plan_download_tree(
    prefix: &KeyPrefix,
    local_dir: &Path,
    objects: impl Iterator<Item = (String, u64)>,
) -> Vec<(TransferUnit, Step)> {
    let mut plan = Vec::new();

    for (key, size) in objects {
        let Some(rel) = key.strip_prefix(prefix.as_str()) else {
            continue;
        };
        // The folder's own placeholder maps to `local_dir` itself
        if rel.is_empty() {
            continue;
        }

        let is_marker = rel.ends_with(DELIMITER);
        let Some(path) = local_path_for(local_dir, rel.trim_end_matches(DELIMITER)) else {
            plan.push((
                TransferUnit {
                    source: key.clone(),
                    destination: String::new(),
                    bytes: 0,
                },
                Step::Rejected(S3Error::InvalidName(key)),
            ));
            continue;
        };

        let unit = TransferUnit {
            source: key.clone(),
            destination: path.display().to_string(),
            bytes: if is_marker { 0 } else { size },
        };
        let step = if is_marker {
            Step::MakeDir { path }
        } else {
            Step::Download {
                key,
                path,
                create_parent: true,
            }
        };
        plan.push((unit, step));
    }

    plan
}

/// Join key segments under `root`, refusing anything that could leave it
fn local_path_for(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in rel.split(DELIMITER) {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

/// Read up to `limit` bytes, fewer only at end of file
async fn read_chunk(file: &mut fs::File, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Stream an object into a temp file beside `path`, then move it over
/// `path`. On failure or cancellation the temp file is dropped and any
/// existing file at `path` is left untouched.
async fn download_file(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    path: &Path,
    cancel: &CancelFlag,
    reporter: &mut ProgressReporter,
) -> S3Result<u64> {
    let body = store.get_object(bucket, key).await?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let (std_file, temp_path) = tempfile::Builder::new()
        .prefix(".s3-manager-")
        .suffix(".part")
        .tempfile_in(dir)?
        .into_parts();
    let mut file = fs::File::from_std(std_file);

    let result = write_body(body.chunks, &mut file, cancel, reporter).await;
    drop(file);

    match result {
        Ok(written) => {
            temp_path.persist(path).map_err(|e| e.error)?;
            tracing::debug!("Downloaded s3://{}/{} to {} ({} bytes)", bucket, key, path.display(), written);
            Ok(written)
        }
        Err(e) => {
            tracing::debug!("Discarding partial download of s3://{}/{}: {}", bucket, key, e);
            Err(e)
        }
    }
}

async fn write_body(
    mut chunks: futures_util::stream::BoxStream<'static, S3Result<Bytes>>,
    file: &mut fs::File,
    cancel: &CancelFlag,
    reporter: &mut ProgressReporter,
) -> S3Result<u64> {
    let mut written = 0u64;
    while let Some(chunk) = chunks.try_next().await? {
        cancel.check()?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        reporter.advance(chunk.len() as u64);
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::credentials::{CredentialSource, Profile};
    use crate::s3::memory::{Fault, InMemoryStore, StoreOp};
    use tempfile::TempDir;

    fn profile() -> Profile {
        Profile {
            name: "work".to_string(),
            source: CredentialSource::StaticKeys,
            region: "us-east-1".to_string(),
            role_arn: None,
            source_profile: None,
            credential_source: None,
            sso_start_url: None,
            sso_region: None,
            sso_account_id: None,
            sso_role_name: None,
            sso_session: None,
            problem: None,
        }
    }

    fn small_parts() -> EngineSettings {
        EngineSettings {
            multipart_threshold: 8,
            part_size: 4,
            progress_interval_ms: 0,
            ..EngineSettings::default()
        }
    }

    fn setup(settings: EngineSettings) -> (Arc<InMemoryStore>, Session, TransferEngine) {
        let store = Arc::new(InMemoryStore::new());
        store.create_bucket("assets");
        let session = Session::new(profile(), store.clone());
        let engine = TransferEngine::new(ListingCache::new(), settings);
        (store, session, engine)
    }

    #[test]
    fn test_local_path_for_rejects_escapes() {
        let root = Path::new("/tmp/out");
        assert_eq!(
            local_path_for(root, "a/b.txt").unwrap(),
            PathBuf::from("/tmp/out/a/b.txt")
        );
        assert!(local_path_for(root, "../etc/passwd").is_none());
        assert!(local_path_for(root, "a/./b").is_none());
        assert!(local_path_for(root, "a//b").is_none());
        assert!(local_path_for(root, "a\\..\\b").is_none());
    }

    #[test]
    fn test_plan_download_tree_maps_keys() {
        let prefix = KeyPrefix::parse("docs/").unwrap();
        let objects = vec![
            ("docs/".to_string(), 0),
            ("docs/a.txt".to_string(), 3),
            ("docs/empty/".to_string(), 0),
            ("docs/sub/b.txt".to_string(), 5),
            ("docs/../evil".to_string(), 1),
        ];
        let plan = plan_download_tree(&prefix, Path::new("/out"), objects.into_iter());
        assert_eq!(plan.len(), 4);
        assert!(matches!(plan[0].1, Step::Download { .. }));
        assert!(matches!(plan[1].1, Step::MakeDir { .. }));
        assert_eq!(plan[2].0.destination, PathBuf::from("/out/sub/b.txt").display().to_string());
        assert!(matches!(plan[3].1, Step::Rejected(S3Error::InvalidName(_))));
    }

    #[test]
    fn test_plan_upload_tree_relative_keys() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "aa").unwrap();
        std::fs::write(dir.path().join("sub").join("b.txt"), "bbb").unwrap();

        let prefix = KeyPrefix::parse("backup/").unwrap();
        let plan = plan_upload_tree(dir.path(), &prefix);
        let keys: Vec<&str> = plan.iter().map(|(u, _)| u.destination.as_str()).collect();
        assert_eq!(keys, vec!["backup/a.txt", "backup/sub/b.txt"]);
        assert_eq!(plan[1].0.bytes, 3);
    }

    #[tokio::test]
    async fn test_multipart_upload_sends_parts() {
        let (store, session, engine) = setup(small_parts());
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let size = engine.upload(&session, "assets", "big.bin", &path).await.unwrap();
        assert_eq!(size, 10);
        assert_eq!(store.calls(StoreOp::UploadPart), 3);
        assert_eq!(store.calls(StoreOp::Put), 0);
        assert_eq!(store.object("assets", "big.bin").unwrap(), Bytes::from_static(b"0123456789"));
    }

    #[tokio::test]
    async fn test_failed_part_aborts_upload() {
        let (store, session, engine) = setup(small_parts());
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        store.inject(StoreOp::UploadPart, Fault::Transient);
        let err = engine.upload(&session, "assets", "big.bin", &path).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.pending_uploads(), 0);
        assert!(!store.contains("assets", "big.bin"));
    }

    #[tokio::test]
    async fn test_cancelled_multipart_is_aborted() {
        let (store, _session, engine) = setup(small_parts());
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut reporter = ProgressReporter::silent(1);
        let err = engine
            .upload_multipart(store.as_ref(), "assets", "big.bin", &path, &cancel, &mut reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::Cancelled));
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_upload_missing_file_is_io_error() {
        let (_store, session, engine) = setup(EngineSettings::default());
        let err = engine
            .upload(&session, "assets", "x", Path::new("/definitely/not/here.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::Io(_)));
    }

    #[tokio::test]
    async fn test_download_overwrites_and_needs_parent() {
        let (store, session, engine) = setup(EngineSettings::default());
        store.insert("assets", "docs/guide.md", "# Guide");
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("guide.md");
        std::fs::write(&target, "old content that is longer").unwrap();

        engine.download(&session, "assets", "docs/guide.md", &target).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "# Guide");

        let nested = dir.path().join("missing").join("guide.md");
        let err = engine
            .download(&session, "assets", "docs/guide.md", &nested)
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::Io(_)));
    }

    #[tokio::test]
    async fn test_cancelled_download_removes_partial_file() {
        let (store, _session, _engine) = setup(EngineSettings::default());
        store.insert("assets", "big.bin", vec![1u8; 200 * 1024]);
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("big.bin");

        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut reporter = ProgressReporter::silent(1);
        let err = download_file(store.as_ref(), "assets", "big.bin", &target, &cancel, &mut reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::Cancelled));
        assert_eq!(reporter.transferred(), 0);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_cancelled_download_keeps_existing_file() {
        let (store, _session, _engine) = setup(EngineSettings::default());
        store.insert("assets", "notes.txt", "fresh remote copy");
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("notes.txt");
        std::fs::write(&target, "previous local copy").unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut reporter = ProgressReporter::silent(1);
        let err = download_file(store.as_ref(), "assets", "notes.txt", &target, &cancel, &mut reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::Cancelled));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "previous local copy");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_failed_download_keeps_existing_file() {
        let (store, session, engine) = setup(EngineSettings::default());
        store.insert("assets", "notes.txt", "fresh remote copy");
        store.inject(StoreOp::Get, Fault::Transient);
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("notes.txt");
        std::fs::write(&target, "previous local copy").unwrap();

        let err = engine
            .download(&session, "assets", "notes.txt", &target)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "previous local copy");
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_file() {
        let (_store, session, engine) = setup(EngineSettings::default());
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("ghost.txt");
        let err = engine
            .download(&session, "assets", "ghost.txt", &target)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_create_directory_validates_name() {
        let (store, session, engine) = setup(EngineSettings::default());
        let root = KeyPrefix::root();
        assert!(matches!(
            engine.create_directory(&session, "assets", &root, "").await,
            Err(S3Error::InvalidName(_))
        ));
        assert!(matches!(
            engine.create_directory(&session, "assets", &root, "a/b").await,
            Err(S3Error::InvalidName(_))
        ));

        let folder = engine
            .create_directory(&session, "assets", &root, "  photos ")
            .await
            .unwrap();
        assert_eq!(folder.name, "photos");
        assert_eq!(folder.prefix, "photos/");
        assert_eq!(store.object("assets", "photos/").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_delete_object_missing_is_not_found() {
        let (store, session, engine) = setup(EngineSettings::default());
        store.insert("assets", "docs/a.txt", "a");
        assert!(engine
            .delete_object(&session, "assets", "docs/missing.txt")
            .await
            .unwrap_err()
            .is_not_found());
        engine.delete_object(&session, "assets", "docs/a.txt").await.unwrap();
        assert!(!store.contains("assets", "docs/a.txt"));
    }

    #[tokio::test]
    async fn test_delete_prefix_removes_tree_and_placeholder() {
        let (store, session, engine) = setup(EngineSettings::default());
        store.insert("assets", "docs/", "");
        store.insert("assets", "docs/a.txt", "a");
        store.insert("assets", "docs/sub/b.txt", "b");
        store.insert("assets", "docsets/keep.txt", "k");

        let report = engine
            .execute(
                &session,
                TransferRequest::DeletePrefix {
                    bucket: "assets".to_string(),
                    prefix: KeyPrefix::parse("docs/").unwrap(),
                },
                &CancelFlag::new(),
            )
            .await;
        assert_eq!(report.state(), JobState::Completed);
        assert_eq!(report.success_count(), 3);
        assert_eq!(store.keys("assets"), vec!["docsets/keep.txt"]);
    }

    #[tokio::test]
    async fn test_delete_prefix_refuses_bucket_root() {
        let (store, session, engine) = setup(EngineSettings::default());
        store.insert("assets", "a.txt", "a");
        let report = engine
            .execute(
                &session,
                TransferRequest::DeletePrefix {
                    bucket: "assets".to_string(),
                    prefix: KeyPrefix::root(),
                },
                &CancelFlag::new(),
            )
            .await;
        assert_eq!(report.state(), JobState::Failed);
        assert!(store.contains("assets", "a.txt"));
    }

    #[tokio::test]
    async fn test_spawned_job_emits_ordered_events() {
        let (store, session, engine) = setup(small_parts());
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![9u8; 20]).unwrap();

        let mut handle = engine.spawn(
            session,
            TransferRequest::Upload {
                bucket: "assets".to_string(),
                key: "big.bin".to_string(),
                local_path: path,
            },
        );

        let mut progress = Vec::new();
        let mut finished = None;
        while let Some(event) = handle.next_event().await {
            match event {
                JobEvent::Progress {
                    bytes_transferred,
                    bytes_total,
                    ..
                } => {
                    assert_eq!(bytes_total, 20);
                    progress.push(bytes_transferred);
                }
                JobEvent::UnitFinished { outcome, .. } => assert!(outcome.is_success()),
                JobEvent::Finished { state, .. } => finished = Some(state),
            }
        }
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&20));
        assert_eq!(finished, Some(JobState::Completed));

        let report = handle.wait().await.unwrap();
        assert_eq!(report.job.bytes_transferred, 20);
        assert_eq!(store.object("assets", "big.bin").unwrap().len(), 20);
    }
}
