//! Namespaced, OCI-style backend: each object lives at a registry
//! `repository`, addressed by a tag, and is stored as a single-layer
//! OCI image manifest over the OCI Distribution API. There is no
//! off-the-shelf registry client in this stack, so requests are built
//! by hand the same way the Azure and GCS adapters build theirs.
//!
//! This dialect has no native MD5 (registries content-address blobs by
//! SHA-256 digest) and no native cross-repository copy, so
//! [`Validating`] and [`BulkCopy`] are intentionally not implemented --
//! the capability probe on [`crate::provider::Storage`] is the
//! mechanism for a backend to honestly decline a capability it cannot
//! offer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::credentials::Credentials;
use crate::error::{classify_http_status, Error, ErrorKind, Result};
use crate::provider::{
    BoxAsyncRead, BoxFuture, MultipartUpload, ObjectInfo, Part, Provider, PutOptions, Storage,
};

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
const EMPTY_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.empty.v1+json";

#[derive(Debug, Serialize, Deserialize)]
struct ManifestDescriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: String,
    config: ManifestDescriptor,
    layers: Vec<ManifestDescriptor>,
}

#[derive(Debug, Deserialize)]
struct TagsList {
    tags: Option<Vec<String>>,
}

pub struct OciStorage {
    client: reqwest::Client,
    registry: String,
    repository: String,
    credentials: Arc<dyn Credentials>,
    uploads: Mutex<HashMap<String, HashMap<u32, Vec<u8>>>>,
}

fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

impl OciStorage {
    pub fn new(container: &str, credentials: Arc<dyn Credentials>) -> Result<Self> {
        let (registry, repository) = container
            .split_once('/')
            .ok_or_else(|| Error::invalid_config("new", container.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| Error::new(ErrorKind::Other, "new", "oci_client").with_source(e))?;
        Ok(Self {
            client,
            registry: registry.to_string(),
            repository: repository.to_string(),
            credentials,
            uploads: Mutex::new(HashMap::new()),
        })
    }

    fn v2_url(&self, path: &str) -> String {
        format!("https://{}/v2/{}{path}", self.registry, self.repository)
    }

    async fn auth_header(&self) -> Option<String> {
        self.credentials
            .bearer_token()
            .await
            .ok()
            .map(|tok| format!("Bearer {tok}"))
    }

    fn classify(status: StatusCode) -> ErrorKind {
        classify_http_status(status.as_u16())
    }

    async fn fetch_manifest(&self, tag: &str) -> Result<Manifest> {
        let url = self.v2_url(&format!("/manifests/{tag}"));
        let mut req = self
            .client
            .get(&url)
            .header("Accept", MANIFEST_MEDIA_TYPE);
        if let Some(auth) = self.auth_header().await {
            req = req.header("Authorization", auth);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, "stat", tag).with_source(e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::not_found("stat", tag).with_provider(Provider::Oci));
        }
        if !resp.status().is_success() {
            let kind = Self::classify(resp.status());
            return Err(Error::new(kind, "stat", tag).with_provider(Provider::Oci));
        }
        resp.json()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, "stat", tag).with_source(e))
    }

    async fn manifest_digest(&self, tag: &str) -> Result<String> {
        let url = self.v2_url(&format!("/manifests/{tag}"));
        let mut req = self.client.head(&url).header("Accept", MANIFEST_MEDIA_TYPE);
        if let Some(auth) = self.auth_header().await {
            req = req.header("Authorization", auth);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, "delete", tag).with_source(e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::not_found("delete", tag).with_provider(Provider::Oci));
        }
        resp.headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::new(ErrorKind::Other, "delete", tag))
    }

    /// Upload `data` as a single monolithic blob, returning its digest.
    /// Skips the PATCH/PUT-with-range dance entirely: the whole content
    /// is already in hand, so a POST-then-PUT monolithic upload is the
    /// simplest request shape the Distribution API supports.
    async fn put_blob_monolithic(&self, data: Vec<u8>) -> Result<(String, u64)> {
        let digest = sha256_digest(&data);
        let size = data.len() as u64;

        if self.blob_exists(&digest).await? {
            return Ok((digest, size));
        }

        let start_url = self.v2_url("/blobs/uploads/");
        let mut req = self.client.post(&start_url);
        if let Some(auth) = self.auth_header().await {
            req = req.header("Authorization", auth);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, "put", &digest).with_source(e))?;
        if !resp.status().is_success() {
            let kind = Self::classify(resp.status());
            return Err(Error::new(kind, "put", &digest).with_provider(Provider::Oci));
        }
        let location = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::new(ErrorKind::Other, "put", &digest))?
            .to_string();

        let finalize_url = self.append_query(&location, "digest", &digest);
        let mut req = self.client.put(&finalize_url).body(data);
        if let Some(auth) = self.auth_header().await {
            req = req.header("Authorization", auth);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, "put", &digest).with_source(e))?;
        if !resp.status().is_success() {
            let kind = Self::classify(resp.status());
            return Err(Error::new(kind, "put", &digest).with_provider(Provider::Oci));
        }
        Ok((digest, size))
    }

    fn append_query(&self, url: &str, key: &str, value: &str) -> String {
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}{key}={value}")
    }

    async fn blob_exists(&self, digest: &str) -> Result<bool> {
        let url = self.v2_url(&format!("/blobs/{digest}"));
        let mut req = self.client.head(&url);
        if let Some(auth) = self.auth_header().await {
            req = req.header("Authorization", auth);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, "put", digest).with_source(e))?;
        Ok(resp.status().is_success())
    }

    async fn get_blob(&self, digest: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>> {
        let url = self.v2_url(&format!("/blobs/{digest}"));
        let mut req = self.client.get(&url);
        if let Some((start, end)) = range {
            req = req.header("Range", format!("bytes={start}-{}", end.saturating_sub(1)));
        }
        if let Some(auth) = self.auth_header().await {
            req = req.header("Authorization", auth);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, "get", digest).with_source(e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::not_found("get", digest).with_provider(Provider::Oci));
        }
        if !resp.status().is_success() {
            let kind = Self::classify(resp.status());
            return Err(Error::new(kind, "get", digest).with_provider(Provider::Oci));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::new(ErrorKind::Other, "get", digest).with_source(e))
    }

    async fn push_manifest(
        &self,
        tag: &str,
        layer_digest: String,
        layer_size: u64,
        title: &str,
        extra_annotations: &HashMap<String, String>,
    ) -> Result<()> {
        let (config_digest, config_size) = self.put_blob_monolithic(Vec::new()).await?;

        let mut annotations = HashMap::new();
        annotations.insert("org.opencontainers.image.title".to_string(), title.to_string());
        annotations.extend(extra_annotations.clone());

        let manifest = Manifest {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config: ManifestDescriptor {
                media_type: EMPTY_CONFIG_MEDIA_TYPE.to_string(),
                digest: config_digest,
                size: config_size,
                annotations: None,
            },
            layers: vec![ManifestDescriptor {
                media_type: LAYER_MEDIA_TYPE.to_string(),
                digest: layer_digest,
                size: layer_size,
                annotations: Some(annotations),
            }],
        };

        let url = self.v2_url(&format!("/manifests/{tag}"));
        let mut req = self
            .client
            .put(&url)
            .header("Content-Type", MANIFEST_MEDIA_TYPE);
        if let Some(auth) = self.auth_header().await {
            req = req.header("Authorization", auth);
        }
        let resp = req
            .json(&manifest)
            .send()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, "put", tag).with_source(e))?;
        if !resp.status().is_success() {
            let kind = Self::classify(resp.status());
            return Err(Error::new(kind, "put", tag).with_provider(Provider::Oci));
        }
        Ok(())
    }
}

impl Storage for OciStorage {
    fn provider(&self) -> Provider {
        Provider::Oci
    }

    fn get(&self, key: &str, range: Option<(u64, u64)>) -> BoxFuture<'_, Result<BoxAsyncRead>> {
        let key = key.to_string();
        Box::pin(async move {
            let manifest = self.fetch_manifest(&key).await?;
            let layer = manifest
                .layers
                .first()
                .ok_or_else(|| Error::not_found("get", &key).with_provider(Provider::Oci))?;
            let bytes = self.get_blob(&layer.digest, range).await?;
            Ok(crate::provider::reader_from_bytes(bytes::Bytes::from(bytes)))
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

            let (digest, size) = self.put_blob_monolithic(buf).await?;
            self.push_manifest(&key, digest.clone(), size, &key, &options.metadata)
                .await?;

            Ok(ObjectInfo {
                key,
                size,
                etag: Some(digest),
                md5_hex: None,
                content_type: options.content_type,
                last_modified_unix: None,
                metadata: options.metadata,
                storage_class: None,
            })
        })
    }

    fn stat(&self, key: &str) -> BoxFuture<'_, Result<ObjectInfo>> {
        let key = key.to_string();
        Box::pin(async move {
            let manifest = self.fetch_manifest(&key).await?;
            let layer = manifest
                .layers
                .first()
                .ok_or_else(|| Error::not_found("stat", &key).with_provider(Provider::Oci))?;
            Ok(ObjectInfo {
                key,
                size: layer.size,
                etag: Some(layer.digest.clone()),
                md5_hex: None,
                content_type: Some(layer.media_type.clone()),
                last_modified_unix: None,
                metadata: layer.annotations.clone().unwrap_or_default(),
                storage_class: None,
            })
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let digest = self.manifest_digest(&key).await?;
            let url = self.v2_url(&format!("/manifests/{digest}"));
            let mut req = self.client.delete(&url);
            if let Some(auth) = self.auth_header().await {
                req = req.header("Authorization", auth);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "delete", &key).with_source(e))?;
            if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
                let kind = Self::classify(resp.status());
                return Err(Error::new(kind, "delete", &key).with_provider(Provider::Oci));
            }
            Ok(())
        })
    }

    fn list(&self, prefix: &str, limit: Option<usize>) -> BoxFuture<'_, Result<Vec<ObjectInfo>>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let url = self.v2_url("/tags/list");
            let mut req = self.client.get(&url);
            if let Some(auth) = self.auth_header().await {
                req = req.header("Authorization", auth);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "list", &prefix).with_source(e))?;
            if !resp.status().is_success() {
                let kind = Self::classify(resp.status());
                return Err(Error::new(kind, "list", &prefix).with_provider(Provider::Oci));
            }
            let parsed: TagsList = resp
                .json()
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "list", &prefix).with_source(e))?;

            // Tag listing does not carry size; a matching tag's size
            // requires a follow-up manifest fetch, which a caller doing
            // a bulk listing does not want paid on every entry. Callers
            // needing size should `stat` the tags they care about.
            let mut out: Vec<ObjectInfo> = parsed
                .tags
                .unwrap_or_default()
                .into_iter()
                .filter(|tag| tag.starts_with(&prefix))
                .map(|tag| ObjectInfo {
                    key: tag,
                    size: 0,
                    etag: None,
                    md5_hex: None,
                    content_type: None,
                    last_modified_unix: None,
                    metadata: HashMap::new(),
                    storage_class: None,
                })
                .collect();
            out.sort_by(|a, b| a.key.cmp(&b.key));
            if let Some(limit) = limit {
                out.truncate(limit);
            }
            Ok(out)
        })
    }

    fn as_multipart(&self) -> Option<&dyn MultipartUpload> {
        Some(self)
    }
}

impl MultipartUpload for OciStorage {
    fn initiate(&self, key: &str, _options: &PutOptions) -> BoxFuture<'_, Result<String>> {
        let key = key.to_string();
        Box::pin(async move {
            let upload_id = uuid::Uuid::new_v4().to_string();
            self.uploads.lock().unwrap().insert(upload_id.clone(), HashMap::new());
            let _ = key;
            Ok(upload_id)
        })
    }

    fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        mut body: BoxAsyncRead,
        _size: u64,
    ) -> BoxFuture<'_, Result<Part>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut buf = Vec::new();
            body.read_to_end(&mut buf)
                .await
                .map_err(|e| Error::new(ErrorKind::Other, "upload_part", &upload_id).with_source(e))?;
            let digest = sha256_digest(&buf);

            let mut uploads = self.uploads.lock().unwrap();
            let session = uploads
                .get_mut(&upload_id)
                .ok_or_else(|| Error::not_found("upload_part", &upload_id).with_provider(Provider::Oci))?;
            session.insert(part_number, buf);

            Ok(Part {
                part_number,
                etag: digest,
                md5_hex: None,
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
            let session = self
                .uploads
                .lock()
                .unwrap()
                .remove(&upload_id)
                .ok_or_else(|| Error::not_found("complete", &upload_id).with_provider(Provider::Oci))?;

            // The Distribution API's chunked PATCH upload requires
            // strictly ordered, contiguous byte ranges. Parts arrive
            // here already collected, so assembling into one buffer and
            // pushing a single monolithic blob is simpler than replaying
            // a PATCH sequence and behaves identically from the
            // registry's point of view.
            let mut assembled = Vec::new();
            for part in &parts {
                let chunk = session
                    .get(&part.part_number)
                    .ok_or_else(|| Error::not_found("complete", format!("part {}", part.part_number)))?;
                assembled.extend_from_slice(chunk);
            }

            let (digest, size) = self.put_blob_monolithic(assembled).await?;
            self.push_manifest(&key, digest.clone(), size, &key, &HashMap::new())
                .await?;

            Ok(ObjectInfo {
                key,
                size,
                etag: Some(digest),
                md5_hex: None,
                content_type: None,
                last_modified_unix: None,
                metadata: HashMap::new(),
                storage_class: None,
            })
        })
    }

    fn abort(&self, _key: &str, upload_id: &str) -> BoxFuture<'_, Result<()>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            self.uploads.lock().unwrap().remove(&upload_id);
            Ok(())
        })
    }

    fn min_part_size(&self) -> u64 {
        1
    }

    fn max_parts(&self) -> u32 {
        u32::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_digest_is_prefixed() {
        let d = sha256_digest(b"hello");
        assert!(d.starts_with("sha256:"));
        assert_eq!(d.len(), "sha256:".len() + 64);
    }

    #[test]
    fn new_rejects_container_without_slash() {
        let creds = Arc::new(crate::credentials::StaticCredentials::from_bearer_token("t"));
        assert!(OciStorage::new("no-slash-here", creds).is_err());
    }

    #[test]
    fn new_splits_registry_and_repository() {
        let creds = Arc::new(crate::credentials::StaticCredentials::from_bearer_token("t"));
        let storage = OciStorage::new("registry.example.com/my/repo", creds).unwrap();
        assert_eq!(storage.registry, "registry.example.com");
        assert_eq!(storage.repository, "my/repo");
    }
}
