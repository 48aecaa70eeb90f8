//! S3-style backend, speaking the AWS SDK for Rust against any
//! S3-compatible endpoint (AWS itself, or a compatible gateway via
//! `endpoint_url` + path-style addressing).

use std::sync::Arc;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::credentials::Credentials;
use crate::error::{classify_http_status, Error, ErrorKind, Result};
use crate::provider::{
    BoxAsyncRead, BoxFuture, BulkCopy, MultipartUpload, ObjectInfo, Part, Provider, PutOptions,
    Storage, Validating,
};

pub struct AwsStorage {
    client: Client,
    bucket: String,
}

impl AwsStorage {
    pub async fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
        use_path_style: bool,
        credentials: Arc<dyn Credentials>,
    ) -> Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));

        if let Some(endpoint) = endpoint_url.as_ref() {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        if let Some(pair) = credentials.access_key_pair() {
            let creds = aws_sdk_s3::config::Credentials::new(
                pair.access_key_id,
                pair.secret_access_key,
                pair.session_token,
                None,
                "multistore-core",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(use_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket,
        })
    }

    fn map_sdk_error(&self, op: &'static str, key: &str, err: impl std::fmt::Display) -> Error {
        Error::new(ErrorKind::Other, op, key)
            .with_provider(Provider::Aws)
            .with_source(anyhow::anyhow!("{err}"))
    }

    fn strip_quotes(etag: &str) -> String {
        etag.trim_matches('"').to_string()
    }
}

impl Storage for AwsStorage {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    fn get(&self, key: &str, range: Option<(u64, u64)>) -> BoxFuture<'_, Result<BoxAsyncRead>> {
        let key = key.to_string();
        Box::pin(async move {
            debug!(bucket = %self.bucket, key = %key, "s3 get_object");
            let mut req = self.client.get_object().bucket(&self.bucket).key(&key);
            if let Some((start, end)) = range {
                req = req.range(format!("bytes={start}-{}", end.saturating_sub(1)));
            }
            let resp = req.send().await.map_err(|e| {
                let svc = e.into_service_error();
                if svc.is_no_such_key() {
                    Error::not_found("get", &key).with_provider(Provider::Aws)
                } else {
                    self.map_sdk_error("get", &key, svc)
                }
            })?;
            let bytes = resp
                .body
                .collect()
                .await
                .map_err(|e| self.map_sdk_error("get", &key, e))?
                .into_bytes();
            Ok(crate::provider::reader_from_bytes(bytes::Bytes::from(bytes.to_vec())))
        })
    }

    fn put(
        &self,
        key: &str,
        mut body: BoxAsyncRead,
        _size: u64,
        options: &PutOptions,
    ) -> BoxFuture<'_, Result<ObjectInfo>> {
        let key = key.to_string();
        let options = options.clone();
        Box::pin(async move {
            let mut buf = Vec::new();
            body.read_to_end(&mut buf)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "put", &key).with_source(e))?;
            let len = buf.len() as u64;

            debug!(bucket = %self.bucket, key = %key, "s3 put_object");
            let mut req = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(ByteStream::from(buf));
            if let Some(ct) = options.content_type.as_deref() {
                req = req.content_type(ct);
            }
            if let Some(class) = options.storage_class.as_deref() {
                req = req.storage_class(class.into());
            }
            for (k, v) in &options.metadata {
                req = req.metadata(k, v);
            }
            if !options.tags.is_empty() {
                let tagging = options
                    .tags
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("&");
                req = req.tagging(tagging);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| self.map_sdk_error("put", &key, e))?;

            Ok(ObjectInfo {
                key: key.clone(),
                size: len,
                etag: resp.e_tag().map(Self::strip_quotes),
                md5_hex: None,
                content_type: options.content_type,
                last_modified_unix: None,
                metadata: options.metadata,
                storage_class: options.storage_class,
            })
        })
    }

    fn stat(&self, key: &str) -> BoxFuture<'_, Result<ObjectInfo>> {
        let key = key.to_string();
        Box::pin(async move {
            let resp = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    let svc = e.into_service_error();
                    if svc.is_not_found() {
                        Error::not_found("stat", &key).with_provider(Provider::Aws)
                    } else {
                        self.map_sdk_error("stat", &key, svc)
                    }
                })?;

            Ok(ObjectInfo {
                key: key.clone(),
                size: resp.content_length().unwrap_or(0).max(0) as u64,
                etag: resp.e_tag().map(Self::strip_quotes),
                md5_hex: resp
                    .e_tag()
                    .map(Self::strip_quotes)
                    .filter(|e| !e.contains('-')),
                content_type: resp.content_type().map(str::to_string),
                last_modified_unix: resp.last_modified().map(|t| t.secs()),
                metadata: resp.metadata().cloned().unwrap_or_default(),
                storage_class: resp.storage_class().map(|c| c.as_str().to_string()),
            })
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| self.map_sdk_error("delete", &key, e))?;
            Ok(())
        })
    }

    fn list(&self, prefix: &str, limit: Option<usize>) -> BoxFuture<'_, Result<Vec<ObjectInfo>>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let mut out = Vec::new();
            let mut continuation: Option<String> = None;
            loop {
                let mut req = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&prefix);
                if let Some(token) = &continuation {
                    req = req.continuation_token(token);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| self.map_sdk_error("list", &prefix, e))?;

                for obj in resp.contents() {
                    out.push(ObjectInfo {
                        key: obj.key().unwrap_or_default().to_string(),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                        etag: obj.e_tag().map(Self::strip_quotes),
                        md5_hex: obj.e_tag().map(Self::strip_quotes).filter(|e| !e.contains('-')),
                        content_type: None,
                        last_modified_unix: obj.last_modified().map(|t| t.secs()),
                        metadata: std::collections::HashMap::new(),
                        storage_class: obj.storage_class().map(|c| c.as_str().to_string()),
                    });
                    if let Some(limit) = limit {
                        if out.len() >= limit {
                            return Ok(out);
                        }
                    }
                }

                if resp.is_truncated() == Some(true) {
                    continuation = resp.next_continuation_token().map(str::to_string);
                } else {
                    break;
                }
            }
            Ok(out)
        })
    }

    fn as_multipart(&self) -> Option<&dyn MultipartUpload> {
        Some(self)
    }

    fn as_bulk_copy(&self) -> Option<&dyn BulkCopy> {
        Some(self)
    }

    fn as_validating(&self) -> Option<&dyn Validating> {
        Some(self)
    }
}

impl MultipartUpload for AwsStorage {
    fn initiate(&self, key: &str, options: &PutOptions) -> BoxFuture<'_, Result<String>> {
        let key = key.to_string();
        let options = options.clone();
        Box::pin(async move {
            let mut req = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&key);
            if let Some(ct) = options.content_type.as_deref() {
                req = req.content_type(ct);
            }
            if let Some(class) = options.storage_class.as_deref() {
                req = req.storage_class(class.into());
            }
            for (k, v) in &options.metadata {
                req = req.metadata(k, v);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| self.map_sdk_error("initiate_multipart", &key, e))?;
            resp.upload_id()
                .map(str::to_string)
                .ok_or_else(|| Error::new(ErrorKind::Other, "initiate_multipart", &key).with_provider(Provider::Aws))
        })
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        mut body: BoxAsyncRead,
        _size: u64,
    ) -> BoxFuture<'_, Result<Part>> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut buf = Vec::new();
            body.read_to_end(&mut buf)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "upload_part", &key).with_source(e))?;
            let md5_hex = hex::encode(Md5::digest(&buf));

            let resp = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number as i32)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| self.map_sdk_error("upload_part", &key, e))?;

            let etag = resp
                .e_tag()
                .map(Self::strip_quotes)
                .ok_or_else(|| Error::new(ErrorKind::Other, "upload_part", &key).with_provider(Provider::Aws))?;

            Ok(Part {
                part_number,
                etag,
                md5_hex: Some(md5_hex),
            })
        })
    }

    fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[Part],
    ) -> BoxFuture<'_, Result<ObjectInfo>> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let completed_parts = parts
                .iter()
                .map(|p| {
                    CompletedPart::builder()
                        .e_tag(&p.etag)
                        .part_number(p.part_number as i32)
                        .build()
                })
                .collect();

            let completed = CompletedMultipartUpload::builder()
                .set_parts(Some(completed_parts))
                .build();

            let resp = self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .multipart_upload(completed)
                .send()
                .await
                .map_err(|e| self.map_sdk_error("complete_multipart", &key, e))?;

            let md5_parts: Vec<String> = parts
                .iter()
                .filter_map(|p| p.md5_hex.clone())
                .collect();
            let composite_etag = if md5_parts.len() == parts.len() {
                crate::validation::composite_multipart_etag(&md5_parts).ok()
            } else {
                None
            };

            Ok(ObjectInfo {
                key,
                size: 0,
                etag: composite_etag.or_else(|| resp.e_tag().map(Self::strip_quotes)),
                md5_hex: None,
                content_type: None,
                last_modified_unix: None,
                metadata: std::collections::HashMap::new(),
                storage_class: None,
            })
        })
    }

    fn abort(&self, key: &str, upload_id: &str) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
                .map_err(|e| self.map_sdk_error("abort_multipart", &key, e))?;
            Ok(())
        })
    }

    fn min_part_size(&self) -> u64 {
        5 * 1024 * 1024
    }

    fn max_parts(&self) -> u32 {
        10_000
    }
}

impl BulkCopy for AwsStorage {
    fn copy(&self, src_key: &str, dst_key: &str) -> BoxFuture<'_, Result<ObjectInfo>> {
        let src_key = src_key.to_string();
        let dst_key = dst_key.to_string();
        Box::pin(async move {
            let copy_source = format!("{}/{}", self.bucket, src_key);
            let resp = self
                .client
                .copy_object()
                .bucket(&self.bucket)
                .key(&dst_key)
                .copy_source(&copy_source)
                .send()
                .await
                .map_err(|e| self.map_sdk_error("copy", &src_key, e))?;

            Ok(ObjectInfo {
                key: dst_key,
                size: 0,
                etag: resp
                    .copy_object_result()
                    .and_then(|r| r.e_tag())
                    .map(Self::strip_quotes),
                md5_hex: None,
                content_type: None,
                last_modified_unix: None,
                metadata: std::collections::HashMap::new(),
                storage_class: None,
            })
        })
    }
}

impl Validating for AwsStorage {
    fn remote_md5_hex(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            match self.stat(&key).await {
                Ok(info) => Ok(info.md5_hex),
                Err(e) if e.is(ErrorKind::NotFound) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }
}

/// Translate an S3 HTTP status-style error code into the shared
/// taxonomy, for call sites that only have a raw status to go on
/// (used by tests and by the retry classification layer).
pub fn classify(status: u16) -> ErrorKind {
    classify_http_status(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_quotes_from_etag() {
        assert_eq!(AwsStorage::strip_quotes("\"abc123\""), "abc123");
        assert_eq!(AwsStorage::strip_quotes("abc123"), "abc123");
    }

    #[test]
    fn classify_maps_not_found() {
        assert_eq!(classify(404), ErrorKind::NotFound);
    }
}
