//! The provider contract: the `Provider` tag, the base `Storage`
//! trait every backend implements, and the optional capability traits
//! a backend can additionally support.
//!
//! Rust has no structural interface casting, so capability probing is
//! expressed the idiomatic way: `Storage` carries `as_multipart()` /
//! `as_bulk_copy()` / `as_validating()` methods that default to `None`
//! and that a concrete adapter overrides to return `Some(self)` when it
//! implements the corresponding trait. Callers probe with `if let
//! Some(mp) = backend.as_multipart() { ... }` instead of a downcast.

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod github;
pub mod memory;
pub mod oci;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::Result;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub(crate) type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Which of the five backend dialects an address or adapter belongs
/// to. `Memory` is the ninth-in-spirit, toolchain-free test double,
/// not one of the five production backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Oci,
    Aws,
    Gcp,
    Azure,
    Github,
    Memory,
}

impl Provider {
    pub fn scheme(self) -> &'static str {
        match self {
            Provider::Oci => "oci",
            Provider::Aws => "s3",
            Provider::Gcp => "gs",
            Provider::Azure => "azure",
            Provider::Github => "github",
            Provider::Memory => "memory",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "oci" => Some(Provider::Oci),
            "s3" => Some(Provider::Aws),
            "gs" => Some(Provider::Gcp),
            "azure" => Some(Provider::Azure),
            "github" => Some(Provider::Github),
            "memory" => Some(Provider::Memory),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Everything this core knows about an object after a stat or list
/// call. Fields a given backend cannot cheaply populate are left
/// `None` rather than faked.
#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    /// Backend-native ETag, whatever shape that backend gives it
    /// (composite `md5-N` for multipart AWS/Azure objects, a plain hex
    /// MD5 for GCS).
    pub etag: Option<String>,
    /// Lowercase-hex MD5 of the object's content, when available
    /// without an extra round trip.
    pub md5_hex: Option<String>,
    pub content_type: Option<String>,
    /// Unix timestamp (seconds) of last modification, when the
    /// backend exposes one.
    pub last_modified_unix: Option<i64>,
    /// User-defined metadata the backend stored alongside the object,
    /// when it was asked to and reports it back on stat/put.
    pub metadata: HashMap<String, String>,
    /// Backend-native storage class/tier, when the backend reports one.
    pub storage_class: Option<String>,
}

/// Everything a caller can ask a `put`/`initiate` call to do beyond
/// moving bytes: the content type, user metadata, storage class, and
/// tags recognized per the upload-options table. Adapters that don't
/// support a given field (e.g. no tagging API) ignore it rather than
/// erroring, matching how optional upload options degrade elsewhere in
/// this crate.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub storage_class: Option<String>,
    pub tags: HashMap<String, String>,
}

impl PutOptions {
    pub fn with_content_type(content_type: Option<&str>) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            ..Default::default()
        }
    }
}

/// One already-uploaded part of a multipart upload.
#[derive(Debug, Clone)]
pub struct Part {
    pub part_number: u32,
    pub etag: String,
    pub md5_hex: Option<String>,
}

/// The base contract every backend adapter implements: single-shot
/// get/put, existence/metadata, delete, and prefix listing.
pub trait Storage: Send + Sync {
    fn provider(&self) -> Provider;

    /// Fetch an object's bytes as a stream, optionally restricted to
    /// `range` (inclusive start, exclusive end).
    fn get(&self, key: &str, range: Option<(u64, u64)>) -> BoxFuture<'_, Result<BoxAsyncRead>>;

    /// Upload `body` (of known `size`) as `key`, replacing any
    /// existing object there.
    fn put(
        &self,
        key: &str,
        body: BoxAsyncRead,
        size: u64,
        options: &PutOptions,
    ) -> BoxFuture<'_, Result<ObjectInfo>>;

    fn stat(&self, key: &str) -> BoxFuture<'_, Result<ObjectInfo>>;

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<()>>;

    /// List objects under `prefix`, returning at most `limit` entries
    /// (`None` for unbounded).
    fn list(&self, prefix: &str, limit: Option<usize>) -> BoxFuture<'_, Result<Vec<ObjectInfo>>>;

    /// Downcast to the multipart-transfer capability, if this backend
    /// implements it.
    fn as_multipart(&self) -> Option<&dyn MultipartUpload> {
        None
    }

    /// Downcast to the server-side copy capability, if this backend
    /// implements it. The bulk orchestrator uses this to skip a
    /// download+upload round trip when source and destination live on
    /// the same backend.
    fn as_bulk_copy(&self) -> Option<&dyn BulkCopy> {
        None
    }

    /// Downcast to the cheap-validation capability, if this backend
    /// can report an object's content digest without a full download.
    fn as_validating(&self) -> Option<&dyn Validating> {
        None
    }
}

/// Chunked upload, for backends that support assembling an object
/// from independently-uploaded parts (S3 multipart, Azure block blobs,
/// GCS compose, OCI blob chunked upload).
pub trait MultipartUpload: Send + Sync {
    fn initiate(&self, key: &str, options: &PutOptions) -> BoxFuture<'_, Result<String>>;

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: BoxAsyncRead,
        size: u64,
    ) -> BoxFuture<'_, Result<Part>>;

    fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[Part],
    ) -> BoxFuture<'_, Result<ObjectInfo>>;

    fn abort(&self, key: &str, upload_id: &str) -> BoxFuture<'_, Result<()>>;

    /// Backend-recommended minimum part size, in bytes, used by the
    /// transfer engine to pick a part size no smaller than the backend
    /// will accept.
    fn min_part_size(&self) -> u64;

    /// Maximum number of parts this backend will accept in one upload.
    fn max_parts(&self) -> u32;
}

/// Server-side object copy, for backends that can duplicate an object
/// without routing the bytes through the caller.
pub trait BulkCopy: Send + Sync {
    fn copy(&self, src_key: &str, dst_key: &str) -> BoxFuture<'_, Result<ObjectInfo>>;
}

/// Cheap content-digest lookup, used by skip-if-valid logic to avoid
/// downloading an object just to discover it's already correct
/// locally.
pub trait Validating: Send + Sync {
    fn remote_md5_hex(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>>;
}

/// Wrap a `Bytes` buffer as a one-shot `AsyncRead`, for call sites that
/// already have the full body in memory (small uploads, test fixtures).
pub fn reader_from_bytes(bytes: Bytes) -> BoxAsyncRead {
    Box::pin(std::io::Cursor::new(bytes.to_vec()))
}
