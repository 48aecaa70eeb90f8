//! multistore-core — a unified, typed contract over heterogeneous
//! object-storage backends (OCI registries, S3-compatible gateways,
//! Azure Blob, GCS-compatible gateways, and Git-LFS-backed GitHub
//! repositories).
//!
//! Three things live here:
//!
//! - [`provider`]: the `Storage` trait and its capability interfaces
//!   (`MultipartUpload`, `BulkCopy`, `Validating`), one adapter per
//!   backend, and a URI grammar ([`uri`]) for addressing objects across
//!   all five dialects.
//! - [`transfer`]: a single-object transfer engine with chunked
//!   multipart upload/download, skip-if-valid short-circuiting, and
//!   inline checksum validation.
//! - [`bulk`]: a worker-pool orchestrator that fans a batch of
//!   transfers out across [`transfer`], with retry/backoff
//!   ([`retry`]) and progress aggregation.
//!
//! [`factory`] wires concrete backends together from [`config`] and a
//! caller-supplied [`credentials::Credentials`] implementation.

pub mod bulk;
pub mod config;
pub mod credentials;
pub mod error;
pub mod factory;
pub mod options;
pub mod pathutil;
pub mod provider;
pub mod retry;
pub mod transfer;
pub mod uri;
pub mod validation;

pub use bulk::{BatchReport, Direction, ItemResult, Progress, TransferItem};
pub use config::StorageConfig;
pub use credentials::Credentials;
pub use error::{Error, ErrorKind, Result};
pub use factory::{create, create_for_address, register, BackendFactory};
pub use options::{BulkOptions, DownloadOptions, ExcludePatterns, ListOptions, RetryOptions, UploadOptions};
pub use provider::{ObjectInfo, Part, Provider, PutOptions, Storage};
pub use transfer::{download, upload, upload_bytes, DownloadOutcome, UploadOutcome};
pub use uri::Address;
