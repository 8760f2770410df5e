//! S3 data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::s3::error::{S3Error, S3Result};

/// Key delimiter used to simulate folders
pub const DELIMITER: char = '/';

/// Represents an S3 bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    pub creation_date: Option<DateTime<Utc>>,
    pub region: Option<String>,
}

/// One object as reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// One page of a delimiter listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Common prefixes, each ending in the delimiter
    pub common_prefixes: Vec<String>,
    pub objects: Vec<ObjectSummary>,
    pub next_token: Option<String>,
}

/// A folder derived from a common prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    pub name: String,
    /// Full prefix, always ending in the delimiter
    pub prefix: String,
}

/// A leaf key directly under the listed prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub fn size_string(&self) -> String {
        format_size(self.size)
    }
}

/// One row of a directory-tree view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingEntry {
    Folder(FolderEntry),
    File(FileEntry),
}

impl ListingEntry {
    pub fn name(&self) -> &str {
        match self {
            ListingEntry::Folder(f) => &f.name,
            ListingEntry::File(f) => &f.name,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, ListingEntry::Folder(_))
    }

    pub fn as_folder(&self) -> Option<&FolderEntry> {
        match self {
            ListingEntry::Folder(f) => Some(f),
            ListingEntry::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileEntry> {
        match self {
            ListingEntry::File(f) => Some(f),
            ListingEntry::Folder(_) => None,
        }
    }

    /// Render order: folders first, then case-insensitive by name, exact
    /// name as the final tie-break so the order is total.
    pub fn render_order(a: &ListingEntry, b: &ListingEntry) -> Ordering {
        b.is_folder()
            .cmp(&a.is_folder())
            .then_with(|| a.name().to_lowercase().cmp(&b.name().to_lowercase()))
            .then_with(|| a.name().cmp(b.name()))
    }
}

/// Sort entries into render order in place
pub fn sort_entries(entries: &mut [ListingEntry]) {
    entries.sort_by(ListingEntry::render_order);
}

/// Human-readable size string
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if size >= TB {
        format!("{:.2} TB", size as f64 / TB as f64)
    } else if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}

/// A folder level inside a bucket.
///
/// Always either empty (bucket root) or a sequence of non-empty segments
/// each followed by the delimiter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyPrefix(String);

impl KeyPrefix {
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parse a prefix string. A missing trailing delimiter is added.
    pub fn parse(raw: &str) -> S3Result<Self> {
        let trimmed = raw.trim_end_matches(DELIMITER);
        if trimmed.is_empty() {
            return if raw.is_empty() {
                Ok(Self::root())
            } else {
                Err(S3Error::InvalidName(raw.to_string()))
            };
        }
        if trimmed.split(DELIMITER).any(|segment| segment.is_empty()) {
            return Err(S3Error::InvalidName(raw.to_string()));
        }
        Ok(Self(format!("{}{}", trimmed, DELIMITER)))
    }

    /// The folder level holding `key`
    pub fn parent_of_key(key: &str) -> Self {
        let trimmed = key.trim_end_matches(DELIMITER);
        match trimmed.rfind(DELIMITER) {
            Some(pos) => Self::parse(&trimmed[..=pos]).unwrap_or_default(),
            None => Self::root(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(DELIMITER).filter(|s| !s.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Append one folder segment
    pub fn child(&self, name: &str) -> S3Result<Self> {
        validate_segment(name)?;
        Ok(Self(format!("{}{}{}", self.0, name, DELIMITER)))
    }

    /// Drop the last segment; the root is its own parent
    pub fn parent(&self) -> Self {
        Self::parent_of_key(&self.0)
    }

    /// Key of an object named `name` at this level
    pub fn join_key(&self, name: &str) -> String {
        format!("{}{}", self.0, name)
    }

    /// This prefix and every shorter one down to the root
    pub fn ancestors(&self) -> Vec<KeyPrefix> {
        let mut out = vec![self.clone()];
        let mut current = self.clone();
        while !current.is_root() {
            current = current.parent();
            out.push(current.clone());
        }
        out
    }

    /// True when `other` equals this prefix or lies below it
    pub fn contains(&self, other: &KeyPrefix) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Name of the last segment, if any
    pub fn last_segment(&self) -> Option<&str> {
        self.segments().last()
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for KeyPrefix {
    type Error = S3Error;

    fn try_from(value: String) -> S3Result<Self> {
        Self::parse(&value)
    }
}

impl From<KeyPrefix> for String {
    fn from(value: KeyPrefix) -> Self {
        value.0
    }
}

/// Check a single folder or file name
pub fn validate_segment(name: &str) -> S3Result<()> {
    if name.is_empty() || name.contains(DELIMITER) {
        return Err(S3Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// S3 URL parsed components
#[derive(Debug, Clone)]
pub struct S3Url {
    pub bucket: String,
    pub key: String,
}

impl S3Url {
    /// Parse an S3 URL (supports s3:// and https:// formats)
    pub fn parse(url: &str) -> Option<Self> {
        // s3://bucket/key format
        if let Some(rest) = url.strip_prefix("s3://") {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return None;
            }
            return Some(S3Url {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return None;
        }

        let parsed = url::Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        if !host.ends_with(".amazonaws.com") {
            return None;
        }

        // Virtual-hosted style: bucket.s3.region.amazonaws.com
        if host.contains(".s3.") {
            let bucket = host.split(".s3.").next()?;
            return Some(S3Url {
                bucket: bucket.to_string(),
                key: parsed.path().trim_start_matches('/').to_string(),
            });
        }

        // Path style: s3.region.amazonaws.com/bucket/key
        if host.starts_with("s3.") {
            let path = parsed.path().trim_start_matches('/');
            let (bucket, key) = path.split_once('/').unwrap_or((path, ""));
            if bucket.is_empty() {
                return None;
            }
            return Some(S3Url {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        None
    }

    /// The folder level this URL points at. A key without a trailing
    /// delimiter names a file, so its parent folder is returned.
    pub fn folder(&self) -> KeyPrefix {
        if self.key.is_empty() {
            KeyPrefix::root()
        } else if self.key.ends_with(DELIMITER) {
            KeyPrefix::parse(&self.key).unwrap_or_default()
        } else {
            KeyPrefix::parent_of_key(&self.key)
        }
    }

    /// Convert to s3:// URL format
    pub fn to_s3_url(&self) -> String {
        if self.key.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.key)
        }
    }
}
