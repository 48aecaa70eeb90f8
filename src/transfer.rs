//! The concurrent transfer engine: single-object download and upload,
//! routing between a single-shot path and a chunked multipart path
//! based on size, with skip-if-valid short-circuiting and inline
//! integrity validation.
//!
//! Downloads chunk by byte range -- every backend's `Storage::get`
//! already accepts a range, so no backend-specific capability is
//! needed to parallelize a download. Uploads instead require the
//! backend's own [`crate::provider::MultipartUpload`] capability, since
//! assembling parts into one object is backend-specific; a backend
//! that doesn't implement it gets a single whole-file upload instead.

use std::path::Path;
use std::sync::Arc;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::options::{DownloadOptions, UploadOptions};
use crate::pathutil::{is_local_file_valid, write_reader_to_file};
use crate::provider::{reader_from_bytes, ObjectInfo, Part, PutOptions, Storage};
use crate::validation::ValidatingReader;

/// Result of a completed (or skipped) download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub bytes_transferred: u64,
    /// True when a valid local copy already existed and no bytes moved.
    pub skipped: bool,
}

/// Result of a completed upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub bytes_transferred: u64,
    pub info: ObjectInfo,
}

fn cancelled_error(op: &'static str) -> Error {
    Error::new(ErrorKind::Other, op, "cancelled").retryable(false)
}

fn put_options_from(options: &UploadOptions) -> PutOptions {
    PutOptions {
        content_type: options.content_type.clone(),
        metadata: options.metadata.clone(),
        storage_class: options.storage_class.clone(),
        tags: options.tags.clone(),
    }
}

/// Download `key` from `storage` into `local_path`, chunking the
/// transfer when the object is large enough to clear
/// `options.multipart_threshold`.
pub async fn download(
    storage: &Arc<dyn Storage>,
    key: &str,
    local_path: &Path,
    options: &DownloadOptions,
    cancellation: &CancellationToken,
) -> Result<DownloadOutcome> {
    if cancellation.is_cancelled() {
        return Err(cancelled_error("download"));
    }

    if options.force_standard && options.force_multipart {
        return Err(Error::invalid_config("download", key));
    }

    let info = storage.stat(key).await?;

    if options.skip_if_valid {
        if let Some(expected) = &info.md5_hex {
            if is_local_file_valid(local_path, info.size, expected).await? {
                debug!(key, "local copy already valid, skipping download");
                return Ok(DownloadOutcome {
                    bytes_transferred: 0,
                    skipped: true,
                });
            }
        }
    }

    let use_multipart = if options.force_multipart {
        true
    } else if options.force_standard {
        false
    } else {
        info.size >= options.multipart_threshold && info.size > 0
    };

    if use_multipart {
        download_multipart(storage, key, local_path, &info, options, cancellation).await?;
    } else {
        download_single_shot(storage, key, local_path, &info, options, cancellation).await?;
    }

    Ok(DownloadOutcome {
        bytes_transferred: info.size,
        skipped: false,
    })
}

async fn download_single_shot(
    storage: &Arc<dyn Storage>,
    key: &str,
    local_path: &Path,
    info: &ObjectInfo,
    options: &DownloadOptions,
    cancellation: &CancellationToken,
) -> Result<()> {
    let range = options.range;
    let reader = storage.get(key, range).await?;

    match &info.md5_hex {
        Some(expected) if range.is_none() && options.validate_md5 => {
            let mut validating = ValidatingReader::new(reader, expected.clone());
            write_reader_to_file(local_path, &mut validating).await?;
            validating.verify()?;
        }
        _ => {
            write_reader_to_file(local_path, reader).await?;
        }
    }

    if cancellation.is_cancelled() {
        return Err(cancelled_error("download"));
    }
    Ok(())
}

async fn download_multipart(
    storage: &Arc<dyn Storage>,
    key: &str,
    local_path: &Path,
    info: &ObjectInfo,
    options: &DownloadOptions,
    cancellation: &CancellationToken,
) -> Result<()> {
    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::invalid_path("download", parent.display().to_string()).with_source(e))?;
    }

    {
        let file = File::create(local_path)
            .await
            .map_err(|e| Error::invalid_path("download", local_path.display().to_string()).with_source(e))?;
        file.set_len(info.size)
            .await
            .map_err(|e| Error::invalid_path("download", local_path.display().to_string()).with_source(e))?;
    }

    let part_size = options.part_size.max(1);
    let num_parts = info.size.div_ceil(part_size);
    let semaphore = Arc::new(Semaphore::new(options.max_concurrency));
    let mut tasks = JoinSet::new();

    for idx in 0..num_parts {
        let start = idx * part_size;
        let end = (start + part_size).min(info.size);
        let storage = storage.clone();
        let key = key.to_string();
        let local_path = local_path.to_path_buf();
        let semaphore = semaphore.clone();

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let mut reader = storage.get(&key, Some((start, end))).await?;
            let mut buf = Vec::with_capacity((end - start) as usize);
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "download", &key).with_source(e))?;

            let mut file = OpenOptions::new()
                .write(true)
                .open(&local_path)
                .await
                .map_err(|e| Error::invalid_path("download", local_path.display().to_string()).with_source(e))?;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| Error::invalid_path("download", local_path.display().to_string()).with_source(e))?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &buf)
                .await
                .map_err(|e| Error::invalid_path("download", local_path.display().to_string()).with_source(e))?;

            Ok::<(), Error>(())
        });
    }

    while let Some(joined) = tokio::select! {
        biased;
        _ = cancellation.cancelled() => {
            tasks.abort_all();
            return Err(cancelled_error("download"));
        }
        next = tasks.join_next() => next,
    } {
        joined
            .map_err(|e| Error::new(ErrorKind::Other, "download", key).with_source(e))??;
    }

    if options.validate_md5 {
        if let Some(expected) = &info.md5_hex {
            if !is_local_file_valid(local_path, info.size, expected).await? {
                let _ = fs::remove_file(local_path).await;
                return Err(Error::checksum_mismatch("download", key));
            }
        }
    }

    Ok(())
}

/// Upload the file at `local_path` to `key` on `storage`, using the
/// backend's multipart capability when the file clears
/// `options.multipart_threshold` and the backend supports it.
pub async fn upload(
    storage: &Arc<dyn Storage>,
    local_path: &Path,
    key: &str,
    options: &UploadOptions,
    cancellation: &CancellationToken,
) -> Result<UploadOutcome> {
    if cancellation.is_cancelled() {
        return Err(cancelled_error("upload"));
    }

    if !options.overwrite {
        match storage.stat(key).await {
            Ok(_) => return Err(Error::new(ErrorKind::AlreadyExists, "upload", key)),
            Err(e) if e.is(ErrorKind::NotFound) => {}
            Err(e) => return Err(e),
        }
    }

    let metadata = fs::metadata(local_path)
        .await
        .map_err(|e| Error::invalid_path("upload", local_path.display().to_string()).with_source(e))?;
    let size = metadata.len();

    let info = if size >= options.multipart_threshold && storage.as_multipart().is_some() {
        upload_multipart(storage, local_path, key, size, options, cancellation).await?
    } else {
        upload_single_shot(storage, local_path, key, size, options).await?
    };

    Ok(UploadOutcome {
        bytes_transferred: size,
        info,
    })
}

async fn upload_single_shot(
    storage: &Arc<dyn Storage>,
    local_path: &Path,
    key: &str,
    size: u64,
    options: &UploadOptions,
) -> Result<ObjectInfo> {
    let file = File::open(local_path)
        .await
        .map_err(|e| Error::invalid_path("upload", local_path.display().to_string()).with_source(e))?;
    storage
        .put(key, Box::pin(file), size, &put_options_from(options))
        .await
}

async fn upload_multipart(
    storage: &Arc<dyn Storage>,
    local_path: &Path,
    key: &str,
    size: u64,
    options: &UploadOptions,
    cancellation: &CancellationToken,
) -> Result<ObjectInfo> {
    let mp = storage
        .as_multipart()
        .ok_or_else(|| Error::not_supported("upload", key))?;

    let part_size = options.part_size.max(mp.min_part_size());
    let num_parts = size.div_ceil(part_size);
    if num_parts > mp.max_parts() as u64 {
        warn!(key, num_parts, max_parts = mp.max_parts(), "part count exceeds backend limit, widening part size");
    }
    let part_size = part_size.max(size.div_ceil(mp.max_parts() as u64).max(1));
    let num_parts = size.div_ceil(part_size).max(1);

    let upload_id = mp.initiate(key, &put_options_from(options)).await?;

    let semaphore = Arc::new(Semaphore::new(options.max_concurrency));
    let mut tasks = JoinSet::new();

    for idx in 0..num_parts {
        let start = idx * part_size;
        let end = (start + part_size).min(size);
        let part_number = (idx + 1) as u32;
        let storage = storage.clone();
        let local_path = local_path.to_path_buf();
        let key = key.to_string();
        let upload_id = upload_id.clone();
        let semaphore = semaphore.clone();

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let mut file = File::open(&local_path)
                .await
                .map_err(|e| Error::invalid_path("upload", local_path.display().to_string()).with_source(e))?;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| Error::invalid_path("upload", local_path.display().to_string()).with_source(e))?;
            let limited = file.take(end - start);

            let mp = storage.as_multipart().expect("multipart capability checked before spawning");
            let part = mp
                .upload_part(&key, &upload_id, part_number, Box::pin(limited), end - start)
                .await?;
            Ok::<Part, Error>(part)
        });
    }

    let mut parts = Vec::with_capacity(num_parts as usize);
    let mut failed = false;
    while let Some(joined) = tokio::select! {
        biased;
        _ = cancellation.cancelled() => {
            tasks.abort_all();
            failed = true;
            None
        }
        next = tasks.join_next() => next,
    } {
        match joined {
            Ok(Ok(part)) => parts.push(part),
            Ok(Err(_)) | Err(_) => failed = true,
        }
    }

    if failed {
        let _ = mp.abort(key, &upload_id).await;
        return Err(cancelled_error("upload"));
    }

    parts.sort_by_key(|p| p.part_number);
    mp.complete(key, &upload_id, &parts).await
}

/// One-shot, in-memory upload helper for small payloads that don't
/// warrant opening a file (used by callers that already hold the bytes,
/// e.g. tests and the bulk orchestrator's metadata-only copies).
pub async fn upload_bytes(
    storage: &Arc<dyn Storage>,
    key: &str,
    data: bytes::Bytes,
    content_type: Option<&str>,
) -> Result<ObjectInfo> {
    let size = data.len() as u64;
    let options = PutOptions::with_content_type(content_type);
    storage.put(key, reader_from_bytes(data), size, &options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryStorage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn force_standard_and_force_multipart_together_is_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let dir = TempDir::new().unwrap();
        let options = DownloadOptions::default()
            .with_force_standard(true)
            .with_force_multipart(true);
        let cancellation = CancellationToken::new();
        let err = download(&storage, "missing.txt", &dir.path().join("out.bin"), &options, &cancellation)
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::InvalidConfig));
    }

    #[tokio::test]
    async fn force_multipart_routes_small_objects_through_chunked_path() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed("a.txt", b"hello world".to_vec());
        let storage: Arc<dyn Storage> = storage;

        let dir = TempDir::new().unwrap();
        let local_path = dir.path().join("a.txt");
        let options = DownloadOptions::default()
            .with_force_multipart(true)
            .with_part_size(4);
        let cancellation = CancellationToken::new();
        let outcome = download(&storage, "a.txt", &local_path, &options, &cancellation).await.unwrap();

        assert!(!outcome.skipped);
        let on_disk = tokio::fs::read(&local_path).await.unwrap();
        assert_eq!(on_disk, b"hello world");
    }

    #[tokio::test]
    async fn validate_md5_false_skips_checksum_enforcement() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed("a.txt", b"hello".to_vec());
        let storage: Arc<dyn Storage> = storage;

        let dir = TempDir::new().unwrap();
        let local_path = dir.path().join("a.txt");
        let options = DownloadOptions::default().with_validate_md5(false);
        let cancellation = CancellationToken::new();
        let outcome = download(&storage, "a.txt", &local_path, &options, &cancellation).await.unwrap();
        assert!(!outcome.skipped);
    }
}
