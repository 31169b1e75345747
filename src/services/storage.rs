//! File storage contract, its local-disk and object-storage implementations,
//! and scoped staging of case documents for extraction.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::appeal::case::FileRef;
use crate::error::{ServiceError, StorageError};
use crate::services::StagedDocument;

/// Location of an uploaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub path: String,
}

#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<StoredObject, StorageError>;
    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes, StorageError>;
    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<String, StorageError>;
    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), StorageError>;
}

/// Reject anything that could escape the bucket.
pub(crate) fn validate_object_path(path: &str) -> Result<PathBuf, StorageError> {
    let raw = Path::new(path);
    let mut normalized = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => {}
            _ => return Err(StorageError::InvalidPath(path.to_string())),
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(normalized)
}

// ==================== Local disk ====================

/// Stores objects under `{root}/{bucket}/{path}`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf, StorageError> {
        let bucket = validate_object_path(bucket)?;
        let path = validate_object_path(path)?;
        Ok(self.root.join(bucket).join(path))
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let target = self.object_path(bucket, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &bytes).await?;
        Ok(StoredObject {
            bucket: bucket.to_string(),
            path: path.to_string(),
        })
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes, StorageError> {
        let target = self.object_path(bucket, path)?;
        match tokio::fs::read(&target).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let target = self.object_path(bucket, path)?;
        if !tokio::fs::try_exists(&target).await? {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }
        let absolute = std::path::absolute(&target)?;
        let mut url = url::Url::from_file_path(&absolute)
            .map_err(|()| StorageError::InvalidPath(absolute.display().to_string()))?;
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string());
        Ok(url.to_string())
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), StorageError> {
        for path in paths {
            let target = self.object_path(bucket, path)?;
            match tokio::fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// ==================== Object storage (HTTP) ====================

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

/// Supabase-compatible storage REST API.
pub struct ObjectStorage {
    client: reqwest::Client,
    base_url: String,
    service_key: Option<SecretString>,
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

impl ObjectStorage {
    pub fn new(base_url: &str, service_key: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
        }
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_path(path)
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.service_key {
            Some(key) => request
                .bearer_auth(key.expose_secret())
                .header("apikey", key.expose_secret()),
            None => request,
        }
    }

    async fn check(
        response: reqwest::Response,
        bucket: &str,
        path: &str,
    ) -> Result<reqwest::Response, StorageError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

fn request_error(err: reqwest::Error) -> StorageError {
    StorageError::Request(err.to_string())
}

#[async_trait]
impl FileStorage for ObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        validate_object_path(path)?;
        let response = self
            .authorize(self.client.post(self.object_url(bucket, path)))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(request_error)?;
        Self::check(response, bucket, path).await?;
        Ok(StoredObject {
            bucket: bucket.to_string(),
            path: path.to_string(),
        })
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes, StorageError> {
        validate_object_path(path)?;
        let response = self
            .authorize(self.client.get(self.object_url(bucket, path)))
            .send()
            .await
            .map_err(request_error)?;
        Self::check(response, bucket, path)
            .await?
            .bytes()
            .await
            .map_err(request_error)
    }

    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        validate_object_path(path)?;
        let url = format!(
            "{}/storage/v1/object/sign/{}/{}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_path(path)
        );
        let response = self
            .authorize(self.client.post(url))
            .json(&serde_json::json!({ "expiresIn": ttl.as_secs() }))
            .send()
            .await
            .map_err(request_error)?;
        let signed: SignedUrlResponse = Self::check(response, bucket, path)
            .await?
            .json()
            .await
            .map_err(request_error)?;
        if signed.signed_url.starts_with("http") {
            Ok(signed.signed_url)
        } else {
            Ok(format!("{}/storage/v1{}", self.base_url, signed.signed_url))
        }
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), StorageError> {
        if paths.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}/storage/v1/object/{}",
            self.base_url,
            urlencoding::encode(bucket)
        );
        let response = self
            .authorize(self.client.delete(url))
            .json(&serde_json::json!({ "prefixes": paths }))
            .send()
            .await
            .map_err(request_error)?;
        Self::check(response, bucket, "").await?;
        Ok(())
    }
}

// ==================== Staging ====================

/// Documents copied into a private temporary directory. The directory and
/// everything in it is deleted when this value is dropped, whether the
/// extraction that used it succeeded or not.
#[derive(Debug)]
pub struct StagedDocuments {
    dir: tempfile::TempDir,
    docs: Vec<StagedDocument>,
}

impl StagedDocuments {
    pub fn documents(&self) -> &[StagedDocument] {
        &self.docs
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

fn staging_error(name: &str, reason: impl std::fmt::Display) -> ServiceError {
    ServiceError::Staging {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Materialize every file (inline bytes or stored object) on local disk.
pub async fn stage_documents(
    storage: &dyn FileStorage,
    files: &[FileRef],
) -> Result<StagedDocuments, ServiceError> {
    let dir = tempfile::Builder::new()
        .prefix("policypilot-stage-")
        .tempdir()
        .map_err(|e| staging_error("<staging dir>", e))?;

    let mut docs = Vec::with_capacity(files.len());
    for (idx, file) in files.iter().enumerate() {
        let bytes = match (&file.data, file.storage_location()) {
            (Some(data), _) => Bytes::from(data.clone()),
            (None, Some((bucket, path))) => storage
                .download(bucket, path)
                .await
                .map_err(|e| staging_error(&file.name, e))?,
            (None, None) => return Err(staging_error(&file.name, "file has no content")),
        };
        let safe_name: String = file
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect();
        let path = dir.path().join(format!("{idx:02}-{safe_name}"));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| staging_error(&file.name, e))?;
        let content_type = if file.content_type.is_empty() {
            mime_guess::from_path(&file.name)
                .first_or_octet_stream()
                .to_string()
        } else {
            file.content_type.clone()
        };
        docs.push(StagedDocument {
            name: file.name.clone(),
            content_type,
            path,
        });
    }
    Ok(StagedDocuments { dir, docs })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn stored(name: &str, bucket: &str, path: &str) -> FileRef {
        FileRef {
            name: name.to_string(),
            size: 0,
            content_type: String::new(),
            last_modified: None,
            bucket: Some(bucket.to_string()),
            path: Some(path.to_string()),
            data: None,
        }
    }

    #[tokio::test]
    async fn local_storage_round_trip_and_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LocalStorage::new(dir.path());
        storage
            .upload("denials", "c1/a.pdf", Bytes::from_static(b"pdf"), "application/pdf")
            .await
            .expect("upload");
        assert_eq!(
            storage.download("denials", "c1/a.pdf").await.expect("download"),
            Bytes::from_static(b"pdf")
        );
        let url = storage
            .signed_url("denials", "c1/a.pdf", Duration::from_secs(60))
            .await
            .expect("url");
        assert!(url.starts_with("file://") && url.contains("expires="), "{url}");

        storage
            .remove("denials", &["c1/a.pdf".to_string(), "c1/missing.pdf".to_string()])
            .await
            .expect("remove");
        assert!(matches!(
            storage.download("denials", "c1/a.pdf").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn local_storage_rejects_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LocalStorage::new(dir.path());
        let err = storage
            .download("denials", "../../etc/passwd")
            .await
            .expect_err("traversal");
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn staged_files_are_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LocalStorage::new(dir.path());
        storage
            .upload("denials", "c1/letter.pdf", Bytes::from_static(b"abc"), "application/pdf")
            .await
            .expect("upload");
        let mut inline = stored("notes.txt", "", "");
        inline.bucket = None;
        inline.path = None;
        inline.data = Some(b"inline".to_vec());

        let staged = stage_documents(
            &storage,
            &[stored("letter.pdf", "denials", "c1/letter.pdf"), inline],
        )
        .await
        .expect("stage");
        let staged_dir = staged.dir().to_path_buf();
        assert_eq!(staged.documents().len(), 2);
        assert_eq!(staged.documents()[0].content_type, "application/pdf");
        assert_eq!(staged.documents()[1].content_type, "text/plain");
        assert_eq!(
            std::fs::read(&staged.documents()[1].path).expect("read"),
            b"inline"
        );

        drop(staged);
        assert!(!staged_dir.exists());
    }

    #[tokio::test]
    async fn staging_fails_cleanly_when_an_object_is_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LocalStorage::new(dir.path());
        let err = stage_documents(&storage, &[stored("gone.pdf", "denials", "c1/gone.pdf")])
            .await
            .expect_err("missing object");
        assert!(matches!(err, ServiceError::Staging { ref name, .. } if name == "gone.pdf"));
    }

    #[test]
    fn object_paths_are_percent_encoded_per_segment() {
        assert_eq!(encode_path("c1/Denial Letter.pdf"), "c1/Denial%20Letter.pdf");
    }
}
