//! Typed option bags for the operations exposed by this crate.
//!
//! Each bag follows the functional-options pattern: a public struct of
//! `pub` fields with sane `Default` impls, plus `with_*` builder
//! methods for the handful of fields callers actually tend to set. The
//! fields are public (not hidden behind getters) so adapters can read
//! them directly, matching how the teacher's `StorageConfig` structs
//! are consumed.

use std::collections::HashMap;
use std::time::Duration;

/// Options controlling a single-object download.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Skip the transfer if a valid local copy already exists.
    pub skip_if_valid: bool,
    /// Byte range to fetch, inclusive start/exclusive end. `None` means
    /// the whole object.
    pub range: Option<(u64, u64)>,
    /// Concurrency ceiling for multipart downloads of this object.
    pub max_concurrency: usize,
    /// Minimum object size, in bytes, before multipart download is used.
    pub multipart_threshold: u64,
    /// Size of each part when a multipart download is used.
    pub part_size: u64,
    /// Force single-shot routing regardless of size. Mutually exclusive
    /// with `force_multipart`.
    pub force_standard: bool,
    /// Force multipart routing regardless of size. Mutually exclusive
    /// with `force_standard`.
    pub force_multipart: bool,
    /// Verify the written file's MD5 against the remote digest after a
    /// download completes, when the backend reports one.
    pub validate_md5: bool,
    /// See [`crate::pathutil::compute_local_path`]: use only the final
    /// path segment of the object key when deriving a local path.
    pub use_base_name_only: bool,
    /// See [`crate::pathutil::compute_local_path`]: strip `prefix_to_strip`
    /// off the front of the object key before joining.
    pub strip_prefix: bool,
    pub prefix_to_strip: String,
    /// See [`crate::pathutil::compute_local_path`]: collapse overlap
    /// between the target directory's trailing segments and the object
    /// key's leading segments.
    pub join_with_tail_overlap: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            skip_if_valid: true,
            range: None,
            max_concurrency: 10,
            multipart_threshold: 10 * 1024 * 1024,
            part_size: 10 * 1024 * 1024,
            force_standard: false,
            force_multipart: false,
            validate_md5: true,
            use_base_name_only: false,
            strip_prefix: false,
            prefix_to_strip: String::new(),
            join_with_tail_overlap: false,
        }
    }
}

impl DownloadOptions {
    pub fn with_skip_if_valid(mut self, skip: bool) -> Self {
        self.skip_if_valid = skip;
        self
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_part_size(mut self, bytes: u64) -> Self {
        self.part_size = bytes.max(1);
        self
    }

    pub fn with_force_standard(mut self, force: bool) -> Self {
        self.force_standard = force;
        self
    }

    pub fn with_force_multipart(mut self, force: bool) -> Self {
        self.force_multipart = force;
        self
    }

    pub fn with_validate_md5(mut self, validate: bool) -> Self {
        self.validate_md5 = validate;
        self
    }
}

/// Options controlling a single-object upload.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub max_concurrency: usize,
    pub multipart_threshold: u64,
    pub part_size: u64,
    pub content_type: Option<String>,
    /// Overwrite an existing object at the destination. When false and
    /// the backend supports existence checks, an `AlreadyExists` error
    /// is raised instead of clobbering.
    pub overwrite: bool,
    /// User-defined key/value metadata attached to the object, passed
    /// through to the backend's native metadata mechanism.
    pub metadata: HashMap<String, String>,
    /// Backend-specific storage class/tier (e.g. `"STANDARD_IA"`,
    /// `"Archive"`). `None` leaves the backend's own default in effect.
    pub storage_class: Option<String>,
    /// Compute and send a whole-object MD5 alongside the upload so the
    /// backend can verify it server-side, in addition to (or instead
    /// of) this crate's own post-upload validation.
    pub calculate_md5: bool,
    /// Key/value tags attached to the object, distinct from `metadata`
    /// on backends that model the two separately (e.g. S3 object tags
    /// vs. user metadata headers).
    pub tags: HashMap<String, String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            multipart_threshold: 10 * 1024 * 1024,
            part_size: 10 * 1024 * 1024,
            content_type: None,
            overwrite: true,
            metadata: HashMap::new(),
            storage_class: None,
            calculate_md5: false,
            tags: HashMap::new(),
        }
    }
}

impl UploadOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_part_size(mut self, bytes: u64) -> Self {
        self.part_size = bytes.max(1);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    pub fn with_calculate_md5(mut self, calculate: bool) -> Self {
        self.calculate_md5 = calculate;
        self
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Options controlling a listing walk.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Restrict results to keys with this prefix.
    pub prefix: Option<String>,
    /// Cap the number of entries returned; `None` means unbounded.
    pub limit: Option<usize>,
    /// Recurse into nested "directories". Backends without real
    /// directories (S3-style, GCS) ignore this and always recurse.
    pub recursive: bool,
}

impl ListOptions {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Glob-style include/exclude filters applied during bulk enumeration.
#[derive(Debug, Clone, Default)]
pub struct ExcludePatterns {
    pub patterns: Vec<String>,
}

impl ExcludePatterns {
    pub fn new(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if `relative_path` matches any configured pattern.
    pub fn matches(&self, relative_path: &str) -> bool {
        self.patterns.iter().any(|pat| {
            glob::Pattern::new(pat)
                .map(|p| p.matches(relative_path))
                .unwrap_or(false)
        })
    }
}

/// Options controlling a bulk (many-object) transfer.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub download: DownloadOptions,
    pub upload: UploadOptions,
    pub exclude: ExcludePatterns,
    /// Number of objects transferred concurrently. Distinct from
    /// per-object `max_concurrency`, which bounds parts within one
    /// object's transfer.
    pub worker_count: usize,
    pub retry: RetryOptions,
    /// Abort the whole batch on the first object failure instead of
    /// continuing and reporting partial results.
    pub fail_fast: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            download: DownloadOptions::default(),
            upload: UploadOptions::default(),
            exclude: ExcludePatterns::default(),
            worker_count: 4,
            retry: RetryOptions::default(),
            fail_fast: false,
        }
    }
}

impl BulkOptions {
    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }

    pub fn with_exclude(mut self, exclude: ExcludePatterns) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Bounded exponential backoff parameters consulted by the retry engine.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub multiplier: f64,
    /// Random jitter fraction in `[0, jitter]` added to each delay.
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_patterns_match_glob() {
        let ex = ExcludePatterns::new(["*.tmp", "cache/**"]);
        assert!(ex.matches("build.tmp"));
        assert!(!ex.matches("src/main.rs"));
    }

    #[test]
    fn download_options_builders_chain() {
        let opts = DownloadOptions::default()
            .with_skip_if_valid(false)
            .with_max_concurrency(0)
            .with_part_size(0);
        assert!(!opts.skip_if_valid);
        assert_eq!(opts.max_concurrency, 1);
        assert_eq!(opts.part_size, 1);
    }

    #[test]
    fn defaults_match_the_published_table() {
        let download = DownloadOptions::default();
        assert_eq!(download.multipart_threshold, 10 * 1024 * 1024);
        assert_eq!(download.part_size, 10 * 1024 * 1024);
        assert_eq!(download.max_concurrency, 10);

        let upload = UploadOptions::default();
        assert_eq!(upload.multipart_threshold, 10 * 1024 * 1024);
        assert_eq!(upload.part_size, 10 * 1024 * 1024);
        assert_eq!(upload.max_concurrency, 10);

        let bulk = BulkOptions::default();
        assert_eq!(bulk.worker_count, 4);

        let retry = RetryOptions::default();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn upload_options_builders_set_metadata_class_md5_and_tags() {
        let mut metadata = HashMap::new();
        metadata.insert("author".to_string(), "me".to_string());
        let mut tags = HashMap::new();
        tags.insert("env".to_string(), "prod".to_string());

        let opts = UploadOptions::default()
            .with_metadata(metadata.clone())
            .with_storage_class("STANDARD_IA")
            .with_calculate_md5(true)
            .with_tags(tags.clone());

        assert_eq!(opts.metadata, metadata);
        assert_eq!(opts.storage_class.as_deref(), Some("STANDARD_IA"));
        assert!(opts.calculate_md5);
        assert_eq!(opts.tags, tags);
    }
}
