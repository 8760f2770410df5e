//! S3 access module
//!
//! This module provides the object-store plumbing:
//! - [`credentials::ProfileManager`] - AWS profile resolution
//! - [`session::Session`] - authenticated handle and bucket listing
//! - [`store::ObjectStore`] - storage trait, with [`client::S3Client`] and
//!   [`memory::InMemoryStore`] implementations
//! - [`types`] - bucket, listing and prefix types
//! - [`error`] - classified error taxonomy

pub mod client;
pub mod credentials;
pub mod error;
pub mod memory;
pub mod session;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use client::{S3Client, S3ClientConfig};
pub use credentials::{CredentialSource, Profile, ProfileManager, ProfileStore};
pub use error::{S3Error, S3Result};
pub use memory::InMemoryStore;
pub use session::{filter_buckets, list_buckets, Session};
pub use store::ObjectStore;
pub use types::{Bucket, FileEntry, FolderEntry, KeyPrefix, ListingEntry, S3Url};
