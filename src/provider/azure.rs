//! Azure Blob Storage backend, speaking the Blob REST API directly via
//! `reqwest` (there is no first-party Azure Rust SDK on par with
//! `aws-sdk-s3` pinned for this toolchain).
//!
//! Multipart strategy uses native Block Blob primitives: `upload_part`
//! stages a block directly on the final blob (Put Block), and
//! `complete` commits the block list (Put Block List). No temporary
//! objects are created, and uncommitted blocks expire on Azure's own
//! 7-day schedule if a caller never completes or aborts.
//!
//! Block IDs: `base64("{upload_id}:{part_number:05}")` -- the
//! upload_id is folded in so concurrent multipart uploads to the same
//! key never collide on a block id.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use md5::{Digest, Md5};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::StatusCode;
use tokio::io::AsyncReadExt;
use tracing::debug;
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::error::{Error, ErrorKind, Result};
use crate::provider::{
    BoxAsyncRead, BoxFuture, BulkCopy, MultipartUpload, ObjectInfo, Part, Provider, PutOptions,
    Storage, Validating,
};

const AZURE_API_VERSION: &str = "2023-11-03";

const BLOB_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

pub struct AzureStorage {
    client: reqwest::Client,
    container: String,
    base_url: String,
    credentials: Arc<dyn Credentials>,
}

impl AzureStorage {
    pub fn new(container: String, account: String, credentials: Arc<dyn Credentials>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| Error::new(ErrorKind::Other, "new", "azure_client").with_source(e))?;

        Ok(Self {
            client,
            container,
            base_url: format!("https://{account}.blob.core.windows.net"),
            credentials,
        })
    }

    fn blob_url(&self, blob_name: &str) -> String {
        let encoded = percent_encoding::utf8_percent_encode(blob_name, &BLOB_ENCODE_SET);
        format!("{}/{}/{}", self.base_url, self.container, encoded)
    }

    fn account(&self) -> Result<&str> {
        self.credentials
            .account_name()
            .ok_or_else(|| Error::invalid_config("azure", "account_name"))
    }

    fn block_id(upload_id: &str, part_number: u32) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .encode(format!("{upload_id}:{part_number:05}").as_bytes())
    }

    fn compute_md5(data: &[u8]) -> String {
        hex::encode(Md5::digest(data))
    }

    /// Build the `Authorization: SharedKey ...` header for a request,
    /// per Azure's Shared Key string-to-sign layout.
    fn sign_request(
        &self,
        method: &str,
        blob_name: &str,
        content_length: Option<usize>,
        content_type: &str,
        date: &str,
        query_params: &[(String, String)],
    ) -> Result<String> {
        let account = self.account()?;
        let content_length_str = match content_length {
            Some(0) | None => String::new(),
            Some(len) => len.to_string(),
        };

        let ms_headers = format!("x-ms-date:{date}\nx-ms-version:{AZURE_API_VERSION}");

        let mut canonicalized_resource = if blob_name.is_empty() {
            format!("/{account}/{}", self.container)
        } else {
            format!("/{account}/{}/{blob_name}", self.container)
        };
        if !query_params.is_empty() {
            let mut sorted = query_params.to_vec();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            for (k, v) in &sorted {
                canonicalized_resource.push_str(&format!("\n{}:{v}", k.to_lowercase()));
            }
        }

        let string_to_sign = format!(
            "{method}\n\n\n{content_length_str}\n\n{content_type}\n\n\n\n\n\n\n{ms_headers}\n{canonicalized_resource}"
        );

        let signature = self.credentials.sign_hmac_sha256(&string_to_sign)?;
        Ok(format!("SharedKey {account}:{signature}"))
    }

    fn rfc1123_date() -> String {
        httpdate::fmt_http_date(std::time::SystemTime::now())
    }

    async fn request(
        &self,
        method: reqwest::Method,
        blob_name: &str,
        query_params: &[(String, String)],
        content_type: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response> {
        let mut url = self.blob_url(blob_name);
        if !query_params.is_empty() {
            let qs = query_params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            url = format!("{url}?{qs}");
        }

        let date = Self::rfc1123_date();
        let content_length = body.as_ref().map(|b| b.len());

        let auth_header = self.sign_request(
            method.as_str(),
            blob_name,
            content_length,
            content_type,
            &date,
            query_params,
        )?;

        let mut req = self
            .client
            .request(method, &url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Authorization", auth_header);
        if !content_type.is_empty() {
            req = req.header("Content-Type", content_type);
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        req.send()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, "request", blob_name).with_provider(Provider::Azure).with_source(e))
    }

    fn classify_status(status: StatusCode) -> ErrorKind {
        crate::error::classify_http_status(status.as_u16())
    }
}

impl Storage for AzureStorage {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn get(&self, key: &str, range: Option<(u64, u64)>) -> BoxFuture<'_, Result<BoxAsyncRead>> {
        let key = key.to_string();
        Box::pin(async move {
            debug!(container = %self.container, blob = %key, "azure get");
            let mut req = self
                .client
                .get(self.blob_url(&key))
                .header("x-ms-date", Self::rfc1123_date())
                .header("x-ms-version", AZURE_API_VERSION);

            if let Some((start, end)) = range {
                req = req.header("x-ms-range", format!("bytes={start}-{}", end.saturating_sub(1)));
            }

            let date = Self::rfc1123_date();
            let auth = self.sign_request("GET", &key, None, "", &date, &[])?;
            let resp = req
                .header("Authorization", auth)
                .send()
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "get", &key).with_provider(Provider::Azure).with_source(e))?;

            if !resp.status().is_success() {
                let kind = Self::classify_status(resp.status());
                return Err(Error::new(kind, "get", &key).with_provider(Provider::Azure));
            }

            let bytes: Bytes = resp
                .bytes()
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "get", &key).with_source(e))?;
            Ok(crate::provider::reader_from_bytes(bytes))
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
        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let metadata = options.metadata.clone();
        let storage_class = options.storage_class.clone();
        let tags = options.tags.clone();
        Box::pin(async move {
            let mut buf = Vec::new();
            body.read_to_end(&mut buf)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "put", &key).with_source(e))?;
            let md5_hex = Self::compute_md5(&buf);
            let len = buf.len() as u64;

            debug!(container = %self.container, blob = %key, "azure put");
            let resp = self
                .request_with_blob_type(&key, &content_type, buf, &metadata, storage_class.as_deref(), &tags)
                .await?;

            if !resp.status().is_success() {
                let kind = Self::classify_status(resp.status());
                return Err(Error::new(kind, "put", &key).with_provider(Provider::Azure));
            }

            Ok(ObjectInfo {
                key,
                size: len,
                etag: Some(md5_hex.clone()),
                md5_hex: Some(md5_hex),
                content_type: Some(content_type),
                last_modified_unix: None,
                metadata,
                storage_class,
            })
        })
    }

    fn stat(&self, key: &str) -> BoxFuture<'_, Result<ObjectInfo>> {
        let key = key.to_string();
        Box::pin(async move {
            let date = Self::rfc1123_date();
            let auth = self.sign_request("HEAD", &key, None, "", &date, &[])?;
            let resp = self
                .client
                .head(self.blob_url(&key))
                .header("x-ms-date", &date)
                .header("x-ms-version", AZURE_API_VERSION)
                .header("Authorization", auth)
                .send()
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "stat", &key).with_source(e))?;

            if resp.status() == StatusCode::NOT_FOUND {
                return Err(Error::not_found("stat", &key).with_provider(Provider::Azure));
            }
            if !resp.status().is_success() {
                let kind = Self::classify_status(resp.status());
                return Err(Error::new(kind, "stat", &key).with_provider(Provider::Azure));
            }

            let size = resp
                .headers()
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let md5_header = resp
                .headers()
                .get("content-md5")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let metadata: HashMap<String, String> = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| {
                    let name = k.as_str().strip_prefix("x-ms-meta-")?;
                    Some((name.to_string(), v.to_str().ok()?.to_string()))
                })
                .collect();
            let storage_class = resp
                .headers()
                .get("x-ms-access-tier")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            Ok(ObjectInfo {
                key,
                size,
                etag: md5_header.clone(),
                md5_hex: md5_header,
                content_type,
                last_modified_unix: None,
                metadata,
                storage_class,
            })
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let resp = self.request(reqwest::Method::DELETE, &key, &[], "", None).await?;
            if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
                let kind = Self::classify_status(resp.status());
                return Err(Error::new(kind, "delete", &key).with_provider(Provider::Azure));
            }
            Ok(())
        })
    }

    fn list(&self, prefix: &str, limit: Option<usize>) -> BoxFuture<'_, Result<Vec<ObjectInfo>>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let mut out = Vec::new();
            let mut marker: Option<String> = None;
            loop {
                let mut qp = vec![
                    ("comp".to_string(), "list".to_string()),
                    ("restype".to_string(), "container".to_string()),
                    ("prefix".to_string(), prefix.clone()),
                ];
                if let Some(m) = &marker {
                    qp.push(("marker".to_string(), m.clone()));
                }
                let resp = self.request(reqwest::Method::GET, "", &qp, "", None).await?;
                if !resp.status().is_success() {
                    let kind = Self::classify_status(resp.status());
                    return Err(Error::new(kind, "list", &prefix).with_provider(Provider::Azure));
                }
                let body = resp
                    .text()
                    .await
                    .map_err(|e| Error::new(ErrorKind::Other, "list", &prefix).with_source(e))?;

                let mut search_from = 0;
                while let Some(start) = body[search_from..].find("<Blob>") {
                    let start = search_from + start;
                    let end = match body[start..].find("</Blob>") {
                        Some(e) => start + e,
                        None => break,
                    };
                    let chunk = &body[start..end];
                    if let Some(name) = extract_tag(chunk, "Name") {
                        out.push(ObjectInfo {
                            key: name,
                            size: extract_tag(chunk, "Content-Length")
                                .and_then(|s| s.parse().ok())
                                .unwrap_or(0),
                            etag: extract_tag(chunk, "Etag"),
                            md5_hex: None,
                            content_type: extract_tag(chunk, "Content-Type"),
                            last_modified_unix: None,
                            metadata: HashMap::new(),
                            storage_class: extract_tag(chunk, "AccessTier"),
                        });
                    }
                    search_from = end;
                    if let Some(limit) = limit {
                        if out.len() >= limit {
                            return Ok(out);
                        }
                    }
                }

                marker = extract_tag(&body, "NextMarker").filter(|m| !m.is_empty());
                if marker.is_none() {
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

impl AzureStorage {
    async fn request_with_blob_type(
        &self,
        key: &str,
        content_type: &str,
        body: Vec<u8>,
        metadata: &HashMap<String, String>,
        storage_class: Option<&str>,
        tags: &HashMap<String, String>,
    ) -> Result<reqwest::Response> {
        let date = Self::rfc1123_date();
        let content_length = Some(body.len());
        let auth = self.sign_request("PUT", key, content_length, content_type, &date, &[])?;

        let mut req = self
            .client
            .put(self.blob_url(key))
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-Type", content_type)
            .header("Authorization", auth);
        for (k, v) in metadata {
            req = req.header(format!("x-ms-meta-{k}"), v);
        }
        if let Some(class) = storage_class {
            req = req.header("x-ms-access-tier", class);
        }
        if !tags.is_empty() {
            let tag_str = tags
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            req = req.header("x-ms-tags", tag_str);
        }

        req.body(body)
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, "put", key).with_provider(Provider::Azure).with_source(e))
    }
}

fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

impl MultipartUpload for AzureStorage {
    fn initiate(&self, _key: &str, _options: &PutOptions) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { Ok(Uuid::new_v4().to_string()) })
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
            let md5_hex = Self::compute_md5(&buf);
            let block_id = Self::block_id(&upload_id, part_number);

            let qp = vec![
                ("comp".to_string(), "block".to_string()),
                ("blockid".to_string(), block_id.clone()),
            ];
            let date = Self::rfc1123_date();
            let auth = self.sign_request("PUT", &key, Some(buf.len()), "application/octet-stream", &date, &qp)?;

            let url = format!("{}?comp=block&blockid={block_id}", self.blob_url(&key));
            let resp = self
                .client
                .put(&url)
                .header("x-ms-date", &date)
                .header("x-ms-version", AZURE_API_VERSION)
                .header("Content-Type", "application/octet-stream")
                .header("Authorization", auth)
                .body(buf)
                .send()
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "upload_part", &key).with_source(e))?;

            if !resp.status().is_success() {
                let kind = Self::classify_status(resp.status());
                return Err(Error::new(kind, "upload_part", &key).with_provider(Provider::Azure));
            }

            Ok(Part {
                part_number,
                etag: block_id,
                md5_hex: Some(md5_hex),
            })
        })
    }

    fn complete(
        &self,
        key: &str,
        _upload_id: &str,
        parts: &[Part],
    ) -> BoxFuture<'_, Result<ObjectInfo>> {
        let key = key.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<BlockList>\n");
            for part in &parts {
                xml.push_str(&format!("  <Latest>{}</Latest>\n", part.etag));
            }
            xml.push_str("</BlockList>");
            let xml_bytes = xml.into_bytes();

            let qp = vec![("comp".to_string(), "blocklist".to_string())];
            let date = Self::rfc1123_date();
            let auth = self.sign_request("PUT", &key, Some(xml_bytes.len()), "application/xml", &date, &qp)?;

            let url = format!("{}?comp=blocklist", self.blob_url(&key));
            let resp = self
                .client
                .put(&url)
                .header("x-ms-date", &date)
                .header("x-ms-version", AZURE_API_VERSION)
                .header("Content-Type", "application/xml")
                .header("Authorization", auth)
                .body(xml_bytes)
                .send()
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "complete_multipart", &key).with_source(e))?;

            if !resp.status().is_success() {
                let kind = Self::classify_status(resp.status());
                return Err(Error::new(kind, "complete_multipart", &key).with_provider(Provider::Azure));
            }

            let md5_parts: Vec<String> = parts.iter().filter_map(|p| p.md5_hex.clone()).collect();
            let etag = if md5_parts.len() == parts.len() {
                crate::validation::composite_multipart_etag(&md5_parts).ok()
            } else {
                None
            };

            Ok(ObjectInfo {
                key,
                size: 0,
                etag,
                md5_hex: None,
                content_type: None,
                last_modified_unix: None,
                metadata: HashMap::new(),
                storage_class: None,
            })
        })
    }

    fn abort(&self, _key: &str, _upload_id: &str) -> BoxFuture<'_, Result<()>> {
        // Uncommitted blocks expire automatically on Azure's own
        // 7-day schedule; there is no explicit abort call to make.
        Box::pin(async move { Ok(()) })
    }

    fn min_part_size(&self) -> u64 {
        1
    }

    fn max_parts(&self) -> u32 {
        50_000
    }
}

impl BulkCopy for AzureStorage {
    fn copy(&self, src_key: &str, dst_key: &str) -> BoxFuture<'_, Result<ObjectInfo>> {
        let src_key = src_key.to_string();
        let dst_key = dst_key.to_string();
        Box::pin(async move {
            let src_url = self.blob_url(&src_key);
            let date = Self::rfc1123_date();
            let auth = self.sign_request("PUT", &dst_key, Some(0), "", &date, &[])?;

            let resp = self
                .client
                .put(self.blob_url(&dst_key))
                .header("x-ms-date", &date)
                .header("x-ms-version", AZURE_API_VERSION)
                .header("x-ms-copy-source", &src_url)
                .header("Authorization", auth)
                .send()
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "copy", &src_key).with_source(e))?;

            if !resp.status().is_success() {
                let kind = Self::classify_status(resp.status());
                return Err(Error::new(kind, "copy", &src_key).with_provider(Provider::Azure));
            }

            Ok(ObjectInfo {
                key: dst_key,
                size: 0,
                etag: None,
                md5_hex: None,
                content_type: None,
                last_modified_unix: None,
                metadata: HashMap::new(),
                storage_class: None,
            })
        })
    }
}

impl Validating for AzureStorage {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_embeds_upload_and_part() {
        let id = AzureStorage::block_id("abc-123", 1);
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD.decode(&id).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "abc-123:00001");
    }

    #[test]
    fn block_id_differs_across_uploads() {
        let a = AzureStorage::block_id("upload-A", 1);
        let b = AzureStorage::block_id("upload-B", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn extract_tag_reads_inner_text() {
        let xml = "<Blob><Name>foo/bar.txt</Name></Blob>";
        assert_eq!(extract_tag(xml, "Name").unwrap(), "foo/bar.txt");
    }
}
