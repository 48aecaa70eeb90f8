//! Local-filesystem helpers used by the transfer engine: mapping a
//! remote address onto a local path, checking whether an existing
//! local file already satisfies an integrity check, and streaming
//! a reader's bytes out to disk.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::options::DownloadOptions;
use crate::validation::{digest_matches, md5_raw_of_file};

/// Decide where a downloaded object lands under `target_dir`, honoring
/// (in priority order) `use_base_name_only`, `strip_prefix`, and
/// `join_with_tail_overlap` from `opts`; falls back to a naive join of
/// `target_dir` and `object_key`.
pub fn compute_local_path(target_dir: &Path, object_key: &str, opts: &DownloadOptions) -> PathBuf {
    if opts.use_base_name_only {
        let base = object_key.rsplit('/').next().unwrap_or(object_key);
        return target_dir.join(base);
    }

    if opts.strip_prefix && !opts.prefix_to_strip.is_empty() {
        if let Some(rest) = object_key.strip_prefix(&opts.prefix_to_strip) {
            return join_segments(target_dir, rest);
        }
    }

    if opts.join_with_tail_overlap {
        return tail_overlap_join(target_dir, object_key);
    }

    join_segments(target_dir, object_key)
}

fn join_segments(base: &Path, key: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for segment in key.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}

/// Find the longest `k` such that the last `k` segments of `target_dir`
/// equal the first `k` segments of `object_key`, and join only the
/// remaining, non-overlapping segments of `object_key`.
fn tail_overlap_join(target_dir: &Path, object_key: &str) -> PathBuf {
    let dir_segments: Vec<&str> = target_dir
        .iter()
        .map(|c| c.to_str().unwrap_or(""))
        .filter(|s| !s.is_empty())
        .collect();
    let key_segments: Vec<&str> = object_key.split('/').filter(|s| !s.is_empty()).collect();

    let max_k = dir_segments.len().min(key_segments.len());
    let mut overlap = 0;
    for k in (1..=max_k).rev() {
        if dir_segments[dir_segments.len() - k..] == key_segments[..k] {
            overlap = k;
            break;
        }
    }

    let mut path = target_dir.to_path_buf();
    for segment in &key_segments[overlap..] {
        path.push(segment);
    }
    path
}

/// Returns true when `path` exists, its size equals `expected_size`,
/// and its MD5 matches `expected_md5`. Size is checked first since it's
/// cheap (a stat) and rules out most mismatches without hashing the
/// whole file. `expected_md5` may be hex, mixed-case hex, or base64.
/// Used by the transfer engine's skip-if-valid check before starting a
/// download that would otherwise overwrite an already-correct file.
pub async fn is_local_file_valid(path: &Path, expected_size: u64, expected_md5: &str) -> Result<bool> {
    let metadata = match fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::invalid_path("is_local_file_valid", path.display().to_string()).with_source(e)),
    };
    if metadata.len() != expected_size {
        return Ok(false);
    }
    let actual_raw = md5_raw_of_file(path).await?;
    Ok(digest_matches(expected_md5, &actual_raw))
}

/// Stream `reader` to `path`, creating parent directories as needed.
/// Writes to a sibling `.part` file first and renames into place on
/// success, so a crash mid-write never leaves a corrupt file at `path`.
pub async fn write_reader_to_file(
    path: &Path,
    mut reader: impl AsyncRead + Unpin,
) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::invalid_path("write_reader_to_file", path.display().to_string()).with_source(e))?;
    }

    let tmp_path = sibling_tmp_path(path);
    let mut file = fs::File::create(&tmp_path)
        .await
        .map_err(|e| Error::invalid_path("write_reader_to_file", tmp_path.display().to_string()).with_source(e))?;

    let mut buf = vec![0u8; 256 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| Error::new(crate::error::ErrorKind::Other, "write_reader_to_file", path.display().to_string()).with_source(e))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .await
            .map_err(|e| Error::invalid_path("write_reader_to_file", tmp_path.display().to_string()).with_source(e))?;
        total += n as u64;
    }
    file.flush().await.map_err(|e| {
        Error::invalid_path("write_reader_to_file", tmp_path.display().to_string()).with_source(e)
    })?;
    drop(file);

    fs::rename(&tmp_path, path).await.map_err(|e| {
        Error::invalid_path("write_reader_to_file", path.display().to_string()).with_source(e)
    })?;

    Ok(total)
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    name.push_str(".part");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn naive_join_is_the_default() {
        let opts = DownloadOptions::default();
        let path = compute_local_path(Path::new("/tmp/root"), "a/b/c.bin", &opts);
        assert_eq!(path, Path::new("/tmp/root/a/b/c.bin"));
    }

    #[test]
    fn use_base_name_only_drops_directories() {
        let mut opts = DownloadOptions::default();
        opts.use_base_name_only = true;
        let path = compute_local_path(Path::new("/tmp/root"), "a/b/c.bin", &opts);
        assert_eq!(path, Path::new("/tmp/root/c.bin"));
    }

    #[test]
    fn strip_prefix_removes_leading_segments_before_joining() {
        let mut opts = DownloadOptions::default();
        opts.strip_prefix = true;
        opts.prefix_to_strip = "data/".into();
        let path = compute_local_path(Path::new("/downloads"), "data/files/x.bin", &opts);
        assert_eq!(path, Path::new("/downloads/files/x.bin"));
    }

    #[test]
    fn tail_overlap_collapses_duplicated_segments() {
        let mut opts = DownloadOptions::default();
        opts.join_with_tail_overlap = true;
        let path = compute_local_path(Path::new("/local/project/data"), "data/files/x.bin", &opts);
        assert_eq!(path, Path::new("/local/project/data/files/x.bin"));
    }

    #[test]
    fn tail_overlap_falls_back_to_naive_join_without_overlap() {
        let mut opts = DownloadOptions::default();
        opts.join_with_tail_overlap = true;
        let path = compute_local_path(Path::new("/local/project"), "unrelated/x.bin", &opts);
        assert_eq!(path, Path::new("/local/project/unrelated/x.bin"));
    }

    #[tokio::test]
    async fn write_reader_creates_parents_and_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested/dir/file.bin");
        let data = b"hello world".to_vec();
        let written = write_reader_to_file(&target, &data[..]).await.unwrap();
        assert_eq!(written, data.len() as u64);
        let on_disk = tokio::fs::read(&target).await.unwrap();
        assert_eq!(on_disk, data);
    }

    #[tokio::test]
    async fn is_local_file_valid_false_when_missing() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("missing.bin");
        assert!(!is_local_file_valid(&target, 8, "deadbeef").await.unwrap());
    }

    #[tokio::test]
    async fn is_local_file_valid_false_on_size_mismatch_without_hashing() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file.bin");
        tokio::fs::write(&target, b"hello").await.unwrap();
        assert!(!is_local_file_valid(&target, 999, "irrelevant").await.unwrap());
    }

    #[tokio::test]
    async fn is_local_file_valid_true_on_matching_size_and_digest() {
        use md5::{Digest, Md5};
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file.bin");
        let data = b"hello world";
        tokio::fs::write(&target, data).await.unwrap();
        let hex_digest = hex::encode(Md5::digest(data));
        assert!(is_local_file_valid(&target, data.len() as u64, &hex_digest).await.unwrap());
    }
}
