//! An in-process storage backend backed by a `HashMap`, implementing
//! the full capability set (base storage, multipart, bulk copy,
//! validating). This is the test double the rest of this crate's test
//! suites are built against, so the transfer engine, bulk orchestrator,
//! retry engine, and factory logic all have toolchain-free coverage
//! without talking to a real cloud backend.

use std::collections::HashMap;
use std::sync::Mutex;

use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};
use crate::provider::{
    reader_from_bytes, BoxAsyncRead, BoxFuture, BulkCopy, MultipartUpload, ObjectInfo, Part,
    Provider, PutOptions, Storage, Validating,
};

#[derive(Default, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
    storage_class: Option<String>,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, UploadState>,
    next_upload_id: u64,
}

struct UploadState {
    options: PutOptions,
    parts: HashMap<u32, Vec<u8>>,
}

/// In-memory `Storage` implementation. Cheap to construct, safe to
/// share across tasks via `Arc`.
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Seed an object directly, bypassing `put`, for test setup.
    pub fn seed(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(
            key.into(),
            StoredObject {
                data: data.into(),
                ..Default::default()
            },
        );
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

fn info_for(key: &str, object: &StoredObject) -> ObjectInfo {
    let digest = md5_hex(&object.data);
    ObjectInfo {
        key: key.to_string(),
        size: object.data.len() as u64,
        etag: Some(digest.clone()),
        md5_hex: Some(digest),
        content_type: object.content_type.clone(),
        last_modified_unix: None,
        metadata: object.metadata.clone(),
        storage_class: object.storage_class.clone(),
    }
}

impl Storage for MemoryStorage {
    fn provider(&self) -> Provider {
        Provider::Memory
    }

    fn get(&self, key: &str, range: Option<(u64, u64)>) -> BoxFuture<'_, Result<BoxAsyncRead>> {
        let key = key.to_string();
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            let object = state
                .objects
                .get(&key)
                .ok_or_else(|| Error::not_found("get", &key).with_provider(Provider::Memory))?;
            let slice = match range {
                Some((start, end)) => {
                    let start = start as usize;
                    let end = (end as usize).min(object.data.len());
                    object.data.get(start..end).unwrap_or_default().to_vec()
                }
                None => object.data.clone(),
            };
            Ok(reader_from_bytes(bytes::Bytes::from(slice)))
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
                .map_err(|e| Error::new(crate::error::ErrorKind::Other, "put", &key).with_source(e))?;
            let object = StoredObject {
                data: buf,
                content_type: options.content_type.clone(),
                metadata: options.metadata.clone(),
                storage_class: options.storage_class.clone(),
            };
            let info = info_for(&key, &object);
            let mut state = self.state.lock().unwrap();
            state.objects.insert(key, object);
            Ok(info)
        })
    }

    fn stat(&self, key: &str) -> BoxFuture<'_, Result<ObjectInfo>> {
        let key = key.to_string();
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            let object = state
                .objects
                .get(&key)
                .ok_or_else(|| Error::not_found("stat", &key).with_provider(Provider::Memory))?;
            Ok(info_for(&key, object))
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.objects.remove(&key);
            Ok(())
        })
    }

    fn list(&self, prefix: &str, limit: Option<usize>) -> BoxFuture<'_, Result<Vec<ObjectInfo>>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            let mut out: Vec<ObjectInfo> = state
                .objects
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(k, object)| info_for(k, object))
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

    fn as_bulk_copy(&self) -> Option<&dyn BulkCopy> {
        Some(self)
    }

    fn as_validating(&self) -> Option<&dyn Validating> {
        Some(self)
    }
}

impl MultipartUpload for MemoryStorage {
    fn initiate(&self, _key: &str, options: &PutOptions) -> BoxFuture<'_, Result<String>> {
        let options = options.clone();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.next_upload_id += 1;
            let upload_id = format!("mem-upload-{}", state.next_upload_id);
            state.uploads.insert(
                upload_id.clone(),
                UploadState {
                    options,
                    parts: HashMap::new(),
                },
            );
            Ok(upload_id)
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
                .map_err(|e| Error::new(crate::error::ErrorKind::Other, "upload_part", &key).with_source(e))?;
            let digest = md5_hex(&buf);

            let mut state = self.state.lock().unwrap();
            let upload = state
                .uploads
                .get_mut(&upload_id)
                .ok_or_else(|| Error::not_found("upload_part", &upload_id).with_provider(Provider::Memory))?;
            upload.parts.insert(part_number, buf);

            Ok(Part {
                part_number,
                etag: digest.clone(),
                md5_hex: Some(digest),
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
            let mut state = self.state.lock().unwrap();
            let upload = state
                .uploads
                .remove(&upload_id)
                .ok_or_else(|| Error::not_found("complete", &upload_id).with_provider(Provider::Memory))?;

            let mut assembled = Vec::new();
            for part in &parts {
                let chunk = upload
                    .parts
                    .get(&part.part_number)
                    .ok_or_else(|| Error::not_found("complete", format!("part {}", part.part_number)))?;
                assembled.extend_from_slice(chunk);
            }

            let object = StoredObject {
                data: assembled,
                content_type: upload.options.content_type.clone(),
                metadata: upload.options.metadata.clone(),
                storage_class: upload.options.storage_class.clone(),
            };
            let info = info_for(&key, &object);
            state.objects.insert(key, object);
            Ok(info)
        })
    }

    fn abort(&self, _key: &str, upload_id: &str) -> BoxFuture<'_, Result<()>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.uploads.remove(&upload_id);
            Ok(())
        })
    }

    fn min_part_size(&self) -> u64 {
        // No real minimum in memory; kept small so tests can exercise
        // multipart paths without allocating large buffers.
        1
    }

    fn max_parts(&self) -> u32 {
        10_000
    }
}

impl BulkCopy for MemoryStorage {
    fn copy(&self, src_key: &str, dst_key: &str) -> BoxFuture<'_, Result<ObjectInfo>> {
        let src_key = src_key.to_string();
        let dst_key = dst_key.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let object = state
                .objects
                .get(&src_key)
                .cloned()
                .ok_or_else(|| Error::not_found("copy", &src_key).with_provider(Provider::Memory))?;
            let info = info_for(&dst_key, &object);
            state.objects.insert(dst_key, object);
            Ok(info)
        })
    }
}

impl Validating for MemoryStorage {
    fn remote_md5_hex(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Ok(state.objects.get(&key).map(|object| md5_hex(&object.data)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = MemoryStorage::new();
        let body = reader_from_bytes(bytes::Bytes::from_static(b"hello"));
        let options = PutOptions::with_content_type(Some("text/plain"));
        store.put("a/b.txt", body, 5, &options).await.unwrap();

        let mut reader = store.get("a/b.txt", None).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn put_stores_metadata_storage_class_and_tags() {
        let store = MemoryStorage::new();
        let body = reader_from_bytes(bytes::Bytes::from_static(b"hello"));
        let mut metadata = HashMap::new();
        metadata.insert("author".to_string(), "me".to_string());
        let options = PutOptions {
            content_type: Some("text/plain".to_string()),
            metadata: metadata.clone(),
            storage_class: Some("STANDARD_IA".to_string()),
            tags: HashMap::new(),
        };
        let info = store.put("a/b.txt", body, 5, &options).await.unwrap();
        assert_eq!(info.metadata, metadata);
        assert_eq!(info.storage_class.as_deref(), Some("STANDARD_IA"));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryStorage::new();
        let err = store.get("missing", None).await.unwrap_err();
        assert!(err.is(crate::error::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn multipart_roundtrip_assembles_parts_in_order() {
        let store = MemoryStorage::new();
        let mp = store.as_multipart().unwrap();
        let upload_id = mp.initiate("big.bin", &PutOptions::default()).await.unwrap();

        let p2 = mp
            .upload_part("big.bin", &upload_id, 2, reader_from_bytes(bytes::Bytes::from_static(b"world")), 5)
            .await
            .unwrap();
        let p1 = mp
            .upload_part("big.bin", &upload_id, 1, reader_from_bytes(bytes::Bytes::from_static(b"hello ")), 6)
            .await
            .unwrap();

        let info = mp.complete("big.bin", &upload_id, &[p1, p2]).await.unwrap();
        assert_eq!(info.size, 11);

        let mut reader = store.get("big.bin", None).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn bulk_copy_duplicates_object() {
        let store = MemoryStorage::new();
        store.seed("src", b"payload".to_vec());
        let copy = store.as_bulk_copy().unwrap();
        copy.copy("src", "dst").await.unwrap();
        let info = store.stat("dst").await.unwrap();
        assert_eq!(info.size, 7);
    }

    #[tokio::test]
    async fn validating_reports_md5_without_download() {
        let store = MemoryStorage::new();
        store.seed("x", b"content".to_vec());
        let validating = store.as_validating().unwrap();
        let digest = validating.remote_md5_hex("x").await.unwrap();
        assert!(digest.is_some());
    }

    #[tokio::test]
    async fn list_respects_prefix_and_limit() {
        let store = MemoryStorage::new();
        store.seed("a/1", b"x".to_vec());
        store.seed("a/2", b"y".to_vec());
        store.seed("b/1", b"z".to_vec());
        let entries = store.list("a/", None).await.unwrap();
        assert_eq!(entries.len(), 2);
        let limited = store.list("a/", Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
