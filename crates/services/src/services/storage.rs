use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid object path: {0}")]
    InvalidPath(String),
    #[error("Object not found: {0}")]
    NotFound(String),
}

/// Where an object sits within a project: the uploaded source, a produced
/// result, or an aligned mask staged for the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    Original,
    Result,
    Mask,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Original => "original",
            StorageKind::Result => "result",
            StorageKind::Mask => "mask",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a content type to the stored file extension. Unknown types fall
/// back to `jpg`.
pub fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    }
}

/// Inverse of [`extension_for`], used when serving objects back out of the
/// store.
pub fn content_type_for_path(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Deterministic object path for an image artifact. The same ids and content
/// type always resolve to the same path, so step retries overwrite rather
/// than accumulate.
pub fn object_path(
    workspace_id: Uuid,
    project_id: Uuid,
    kind: StorageKind,
    image_id: Uuid,
    content_type: &str,
) -> String {
    format!(
        "{workspace_id}/{project_id}/{kind}/{image_id}.{}",
        extension_for(content_type)
    )
}

/// Recovers the store path from one of our own object URLs, with or without
/// a public base prefix. Foreign URLs yield `None`.
pub fn path_from_url(url: &str) -> Option<&str> {
    let (_, path) = url.split_once("/files/")?;
    (!path.is_empty()).then_some(path)
}

#[derive(Clone, Debug, Serialize)]
pub struct StoredObject {
    pub path: String,
    pub url: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
    /// Removes every object in `paths`. Objects already gone are skipped.
    async fn delete_many(&self, paths: &[String]) -> Result<(), StorageError> {
        for path in paths {
            self.delete(path).await?;
        }
        Ok(())
    }
    /// Paths of all stored objects starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    /// Public URL the object is reachable at once written.
    fn url_for(&self, path: &str) -> String;
}

/// Writes `bytes` at the deterministic path for the given ids and returns
/// where it landed.
pub async fn write_image(
    store: &dyn ObjectStore,
    workspace_id: Uuid,
    project_id: Uuid,
    kind: StorageKind,
    image_id: Uuid,
    content_type: &str,
    bytes: &[u8],
) -> Result<StoredObject, StorageError> {
    let path = object_path(workspace_id, project_id, kind, image_id, content_type);
    store.put(&path, bytes).await?;
    let url = store.url_for(&path);
    Ok(StoredObject { path, url })
}

/// Filesystem-backed store, served back out under `/files`.
pub struct FsObjectStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl FsObjectStore {
    pub fn new(root: PathBuf, public_base_url: Option<String>) -> Self {
        Self {
            root,
            public_base_url,
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        if path.is_empty()
            || relative.is_absolute()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative.to_string_lossy().into_owned();
                    if key.starts_with(prefix) {
                        found.push(key);
                    }
                }
            }
        }
        found.sort();
        Ok(found)
    }

    fn url_for(&self, path: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/files/{path}", base.trim_end_matches('/')),
            None => format!("/files/{path}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_ids() -> (Uuid, Uuid, Uuid) {
        (
            Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap(),
            Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap(),
            Uuid::parse_str("33333333-3333-3333-3333-333333333333").unwrap(),
        )
    }

    #[test]
    fn extension_mapping_covers_known_types() {
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/webp"), "webp");
        assert_eq!(extension_for("image/gif"), "gif");
        assert_eq!(extension_for("image/png; charset=binary"), "png");
        assert_eq!(extension_for("application/pdf"), "jpg");
        assert_eq!(extension_for(""), "jpg");
    }

    #[test]
    fn object_paths_are_deterministic() {
        let (ws, proj, img) = fixed_ids();
        let path = object_path(ws, proj, StorageKind::Result, img, "image/png");
        assert_eq!(
            path,
            "11111111-1111-1111-1111-111111111111/22222222-2222-2222-2222-222222222222/result/33333333-3333-3333-3333-333333333333.png"
        );
        assert_eq!(
            path,
            object_path(ws, proj, StorageKind::Result, img, "image/png")
        );
    }

    #[test]
    fn url_round_trips_back_to_a_store_path() {
        assert_eq!(path_from_url("/files/ws/proj/result/a.png"), Some("ws/proj/result/a.png"));
        assert_eq!(
            path_from_url("https://cdn.example.com/files/ws/proj/mask/b.png"),
            Some("ws/proj/mask/b.png")
        );
        assert_eq!(path_from_url("https://model.test/out.png"), None);
        assert_eq!(path_from_url("/files/"), None);
    }

    #[tokio::test]
    async fn put_get_round_trip_and_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path().to_path_buf(), None);

        store.put("ws/proj/result/a.png", b"first").await.unwrap();
        assert_eq!(store.get("ws/proj/result/a.png").await.unwrap(), b"first");

        store.put("ws/proj/result/a.png", b"second").await.unwrap();
        assert_eq!(store.get("ws/proj/result/a.png").await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn missing_object_reports_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path().to_path_buf(), None);

        assert!(matches!(
            store.get("ws/proj/result/missing.png").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path().to_path_buf(), None);

        store.put("ws/proj/result/a.png", b"bytes").await.unwrap();
        store.delete("ws/proj/result/a.png").await.unwrap();
        store.delete("ws/proj/result/a.png").await.unwrap();
        assert!(store.get("ws/proj/result/a.png").await.is_err());
    }

    #[tokio::test]
    async fn list_returns_matching_prefix_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path().to_path_buf(), None);

        store.put("ws/proj/result/b.png", b"b").await.unwrap();
        store.put("ws/proj/result/a.png", b"a").await.unwrap();
        store.put("ws/proj/original/c.png", b"c").await.unwrap();

        let listed = store.list("ws/proj/result/").await.unwrap();
        assert_eq!(listed, vec!["ws/proj/result/a.png", "ws/proj/result/b.png"]);
        assert!(store.list("elsewhere/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_many_removes_every_path_given() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path().to_path_buf(), None);

        store.put("ws/proj/result/a.png", b"a").await.unwrap();
        store.put("ws/proj/result/b.png", b"b").await.unwrap();

        store
            .delete_many(&[
                "ws/proj/result/a.png".to_string(),
                "ws/proj/result/b.png".to_string(),
                "ws/proj/result/already-gone.png".to_string(),
            ])
            .await
            .unwrap();

        assert!(store.list("ws/proj/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path().to_path_buf(), None);

        assert!(matches!(
            store.put("../outside.png", b"x").await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            store.get("/etc/passwd").await,
            Err(StorageError::InvalidPath(_))
        ));
    }

    #[test]
    fn urls_respect_public_base() {
        let relative = FsObjectStore::new(PathBuf::from("/tmp"), None);
        assert_eq!(relative.url_for("ws/p/result/a.png"), "/files/ws/p/result/a.png");

        let absolute = FsObjectStore::new(
            PathBuf::from("/tmp"),
            Some("https://cdn.example.com/".to_string()),
        );
        assert_eq!(
            absolute.url_for("ws/p/result/a.png"),
            "https://cdn.example.com/files/ws/p/result/a.png"
        );
    }
}
