//! Streaming integrity validation: MD5 accumulation over async
//! readers, a transparent validating reader wrapper, and the
//! composite multipart-ETag calculation shared by the AWS and Azure
//! adapters.

use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use md5::{Digest, Md5};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::error::{Error, ErrorKind, Result};

/// Compute the raw MD5 digest bytes of an entire file, streaming it in
/// fixed-size chunks rather than reading it into memory at once.
pub async fn md5_raw_of_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path)
        .await
        .map_err(|e| Error::invalid_path("md5_raw_of_file", path.display().to_string()).with_source(e))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| Error::new(ErrorKind::Other, "md5_raw_of_file", path.display().to_string()).with_source(e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

/// Compute the lowercase-hex MD5 of an entire file.
pub async fn md5_hex_of_file(path: &Path) -> Result<String> {
    Ok(hex::encode(md5_raw_of_file(path).await?))
}

/// An `AsyncRead` wrapper that accumulates an MD5 digest over every
/// byte that passes through it, and checks the result against an
/// expected hex digest once the stream is exhausted.
///
/// The transfer engine wraps a backend's response body in this reader
/// so integrity validation happens inline during the copy to disk,
/// rather than as a second pass over the written file.
pub struct ValidatingReader<R> {
    inner: R,
    hasher: Md5,
    expected_hex: String,
    finished: bool,
}

impl<R: AsyncRead + Unpin> ValidatingReader<R> {
    pub fn new(inner: R, expected_hex: impl Into<String>) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
            expected_hex: expected_hex.into(),
            finished: false,
        }
    }

    /// Check the accumulated digest against the expected value. Call
    /// this only after the reader has been fully drained (EOF reached);
    /// calling it earlier checks a partial digest and will usually fail.
    pub fn verify(&self) -> Result<()> {
        let actual = self.hasher.clone().finalize();
        if digest_matches(&self.expected_hex, actual.as_slice()) {
            Ok(())
        } else {
            Err(Error::checksum_mismatch("validate", "stream"))
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ValidatingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let after = buf.filled().len();
            if after > before {
                this.hasher.update(&buf.filled()[before..after]);
            } else if !this.finished {
                this.finished = true;
            }
        }
        poll
    }
}

/// Combine per-part MD5 digests into the composite multipart ETag
/// AWS and Azure-compatible clients expect: the MD5 of the
/// concatenation of each part's raw (decoded) digest, followed by a
/// `-{part_count}` suffix.
///
/// A single-part upload's composite equals the sole part's own MD5 --
/// there is nothing to concatenate, so this short-circuits rather than
/// hashing a one-element concatenation.
///
/// `part_md5_hex` must be given in part order.
pub fn composite_multipart_etag(part_md5_hex: &[String]) -> Result<String> {
    if part_md5_hex.is_empty() {
        return Err(Error::invalid_config("composite_multipart_etag", "parts"));
    }
    if part_md5_hex.len() == 1 {
        return Ok(part_md5_hex[0].clone());
    }
    let mut hasher = Md5::new();
    for hex_digest in part_md5_hex {
        let raw = hex::decode(hex_digest)
            .map_err(|e| Error::invalid_config("composite_multipart_etag", hex_digest.clone()).with_source(e))?;
        hasher.update(&raw);
    }
    Ok(format!("{}-{}", hex::encode(hasher.finalize()), part_md5_hex.len()))
}

/// Compare an expected digest value against raw computed bytes,
/// tolerating the four encodings a backend or a caller might hand us:
/// lowercase hex, mixed-case hex, standard base64, and base64 that
/// decodes to the same raw bytes.
pub fn digest_matches(expected: &str, actual_raw: &[u8]) -> bool {
    use base64::engine::general_purpose::STANDARD as base64_standard;
    use base64::Engine as _;

    let expected_trimmed = expected.trim();

    let actual_hex = hex::encode(actual_raw);
    if actual_hex.eq_ignore_ascii_case(expected_trimmed) {
        return true;
    }

    let actual_b64 = base64_standard.encode(actual_raw);
    if actual_b64 == expected_trimmed {
        return true;
    }

    if let Ok(decoded) = base64_standard.decode(expected_trimmed) {
        if decoded == actual_raw {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validating_reader_accepts_matching_digest() {
        let data = b"the quick brown fox".to_vec();
        let expected = hex::encode(Md5::digest(&data));
        let mut reader = ValidatingReader::new(&data[..], expected);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert!(reader.verify().is_ok());
    }

    #[tokio::test]
    async fn validating_reader_rejects_mismatched_digest() {
        let data = b"the quick brown fox".to_vec();
        let mut reader = ValidatingReader::new(&data[..], "0".repeat(32));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(reader.verify().is_err());
    }

    #[test]
    fn composite_etag_single_part_equals_the_part_digest() {
        let part = hex::encode(Md5::digest(b"part-one"));
        let etag = composite_multipart_etag(&[part.clone()]).unwrap();
        assert_eq!(etag, part);
    }

    #[test]
    fn digest_matches_lowercase_hex() {
        let raw = Md5::digest(b"data");
        assert!(digest_matches(&hex::encode(raw), &raw));
    }

    #[test]
    fn digest_matches_mixed_case_hex() {
        let raw = Md5::digest(b"data");
        let upper = hex::encode(raw).to_uppercase();
        assert!(digest_matches(&upper, &raw));
    }

    #[test]
    fn digest_matches_base64() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        let raw = Md5::digest(b"data");
        assert!(digest_matches(&STANDARD.encode(raw), &raw));
    }

    #[test]
    fn digest_matches_rejects_mismatch() {
        let raw = Md5::digest(b"data");
        assert!(!digest_matches(&"0".repeat(32), &raw));
    }

    #[test]
    fn composite_etag_multi_part_deterministic() {
        let p1 = hex::encode(Md5::digest(b"part-one"));
        let p2 = hex::encode(Md5::digest(b"part-two"));
        let a = composite_multipart_etag(&[p1.clone(), p2.clone()]).unwrap();
        let b = composite_multipart_etag(&[p1, p2]).unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with("-2"));
    }

    #[test]
    fn composite_etag_rejects_empty() {
        assert!(composite_multipart_etag(&[]).is_err());
    }
}
