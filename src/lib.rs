//! S3 Manager Library
//!
//! Presents S3's flat key space as a directory tree, runs cancellable
//! transfers against it and keeps a listing cache consistent with them.
//! A UI shell drives the engine through these modules.

pub mod cache;
pub mod navigator;
pub mod s3;
pub mod settings;
pub mod transfer;
