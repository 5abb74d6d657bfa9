//! Disk-backed store implementations.
//!
//! Layout under a store root:
//!
//! ```text
//! <root>/imagedb/<algorithm>/<encoded>        raw image config
//! <root>/imagedb/parents.json                 child → parent index
//! <root>/layers/<algorithm>-<encoded>         raw layer bytes
//! <root>/layers/<algorithm>-<encoded>.meta.json
//! <root>/references.json                      name → image id
//! ```
//!
//! Content files are written to a temporary name and renamed into place, so
//! a crashed write never leaves a half-written image or layer visible.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use a3s_delta_core::error::{DeltaError, Result};
use a3s_delta_core::{
    Digest, Image, ImageId, ImageStore, LayerInfo, LayerReader, LayerStore, ReferenceStore,
    RegisteredLayer,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::RwLock;

fn store_err(action: &str, path: &Path, e: impl std::fmt::Display) -> DeltaError {
    DeltaError::StoreError(format!("Failed to {} {}: {}", action, path.display(), e))
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| store_err("create directory", path, e))
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let data = std::fs::read_to_string(path).map_err(|e| store_err("read", path, e))?;
    serde_json::from_str(&data).map_err(|e| store_err("parse", path, e))
}

/// Write `data` next to `path` and rename it into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| store_err("write", &tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| store_err("rename into", path, e))
}

async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &data).await
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ParentIndex {
    parents: BTreeMap<ImageId, ImageId>,
}

/// Image store keeping raw configs as content-addressed files.
pub struct DiskImageStore {
    root: PathBuf,
    /// Parent links; also serializes writers
    index: RwLock<ParentIndex>,
}

impl DiskImageStore {
    /// Open (or create) an image store rooted at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        let dir = root.join("imagedb");
        create_dir(&dir)?;
        let index = load_json(&dir.join("parents.json"))?;
        Ok(Self {
            root: root.to_path_buf(),
            index: RwLock::new(index),
        })
    }

    fn config_path(&self, id: &ImageId) -> PathBuf {
        self.root
            .join("imagedb")
            .join(id.algorithm())
            .join(id.encoded())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("imagedb").join("parents.json")
    }

    async fn exists(&self, id: &ImageId) -> bool {
        tokio::fs::try_exists(self.config_path(id))
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl ImageStore for DiskImageStore {
    async fn get(&self, id: &ImageId) -> Result<Image> {
        let path = self.config_path(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeltaError::NotFound(format!("image {}", id)))
            }
            Err(e) => return Err(store_err("read image config", &path, e)),
        };
        Image::from_config(&raw)
    }

    async fn create(&self, config: &[u8]) -> Result<ImageId> {
        let image = Image::from_config(config)?;
        let path = self.config_path(image.id());

        let _guard = self.index.write().await;
        if !self.exists(image.id()).await {
            if let Some(dir) = path.parent() {
                create_dir(dir)?;
            }
            write_atomic(&path, config).await?;
            tracing::debug!(image = %image.id(), "Stored image config");
        }
        Ok(image.id().clone())
    }

    async fn set_parent(&self, id: &ImageId, parent: &ImageId) -> Result<()> {
        let mut index = self.index.write().await;
        for known in [id, parent] {
            if !self.exists(known).await {
                return Err(DeltaError::NotFound(format!("image {}", known)));
            }
        }
        let previous = index.parents.insert(id.clone(), parent.clone());
        if let Err(e) = save_json(&self.index_path(), &*index).await {
            match previous {
                Some(prev) => index.parents.insert(id.clone(), prev),
                None => index.parents.remove(id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn parent(&self, id: &ImageId) -> Result<Option<ImageId>> {
        Ok(self.index.read().await.parents.get(id).cloned())
    }

    async fn children(&self, id: &ImageId) -> Result<Vec<ImageId>> {
        let index = self.index.read().await;
        Ok(index
            .parents
            .iter()
            .filter(|(_, parent)| *parent == id)
            .map(|(child, _)| child.clone())
            .collect())
    }
}

/// Metadata stored beside each layer blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMeta {
    pub diff_id: Digest,
    pub size_bytes: u64,
    pub registered_at: DateTime<Utc>,
    #[serde(default = "default_references")]
    pub references: u32,
}

fn default_references() -> u32 {
    1
}

/// Content-addressed layer store for one platform.
///
/// A layer is visible only once both its blob and its `.meta.json` exist;
/// the metadata is written last. The metadata also carries the layer's
/// reference count.
pub struct DiskLayerStore {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl DiskLayerStore {
    pub fn new(dir: &Path) -> Result<Self> {
        create_dir(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            lock: RwLock::new(()),
        })
    }

    fn blob_path(&self, diff_id: &Digest) -> PathBuf {
        self.dir
            .join(format!("{}-{}", diff_id.algorithm(), diff_id.encoded()))
    }

    fn meta_path(&self, diff_id: &Digest) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.meta.json",
            diff_id.algorithm(),
            diff_id.encoded()
        ))
    }

    async fn read_meta(&self, diff_id: &Digest) -> Result<Option<LayerMeta>> {
        let path = self.meta_path(diff_id);
        match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| store_err("parse", &path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_err("read", &path, e)),
        }
    }

    /// All layers currently held.
    pub async fn list(&self) -> Result<Vec<LayerMeta>> {
        let _guard = self.lock.read().await;
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| store_err("read directory", &self.dir, e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| store_err("read directory", &self.dir, e))?
        {
            let path = entry.path();
            if !path.to_string_lossy().ends_with(".meta.json") {
                continue;
            }
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| store_err("read", &path, e))?;
            match serde_json::from_slice::<LayerMeta>(&data) {
                Ok(meta) => entries.push(meta),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable layer metadata"),
            }
        }
        entries.sort_by(|a, b| a.diff_id.cmp(&b.diff_id));
        Ok(entries)
    }
}

#[async_trait]
impl LayerStore for DiskLayerStore {
    async fn get(&self, diff_id: &Digest) -> Result<Option<LayerInfo>> {
        let _guard = self.lock.read().await;
        Ok(self.read_meta(diff_id).await?.map(|meta| LayerInfo {
            diff_id: meta.diff_id,
            size: meta.size_bytes,
        }))
    }

    async fn open(&self, diff_id: &Digest) -> Result<Box<dyn LayerReader>> {
        let _guard = self.lock.read().await;
        if self.read_meta(diff_id).await?.is_none() {
            return Err(DeltaError::NotFound(format!("layer {}", diff_id)));
        }
        let path = self.blob_path(diff_id);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| store_err("open layer", &path, e))?;
        Ok(Box::new(file.into_std().await))
    }

    async fn register(&self, data: Vec<u8>) -> Result<RegisteredLayer> {
        let diff_id = Digest::sha256(&data);
        let size = data.len() as u64;
        let info = LayerInfo {
            diff_id: diff_id.clone(),
            size,
        };

        let _guard = self.lock.write().await;
        if let Some(mut meta) = self.read_meta(&diff_id).await? {
            meta.references += 1;
            save_json(&self.meta_path(&diff_id), &meta).await?;
            return Ok(RegisteredLayer {
                info,
                created: false,
                references: meta.references,
            });
        }

        write_atomic(&self.blob_path(&diff_id), &data).await?;
        let meta = LayerMeta {
            diff_id: diff_id.clone(),
            size_bytes: size,
            registered_at: Utc::now(),
            references: 1,
        };
        save_json(&self.meta_path(&diff_id), &meta).await?;

        tracing::debug!(diff_id = %diff_id, size_bytes = size, "Registered layer");
        Ok(RegisteredLayer {
            info,
            created: true,
            references: 1,
        })
    }

    async fn release(&self, diff_id: &Digest) -> Result<()> {
        let _guard = self.lock.write().await;
        if let Some(mut meta) = self.read_meta(diff_id).await? {
            if meta.references > 1 {
                meta.references -= 1;
                return save_json(&self.meta_path(diff_id), &meta).await;
            }
        }

        // Metadata first, so a partial release leaves the layer invisible.
        for path in [self.meta_path(diff_id), self.blob_path(diff_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(store_err("remove", &path, e)),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReferenceIndex {
    references: BTreeMap<String, ImageId>,
}

/// Reference store persisted as a single JSON file.
pub struct DiskReferenceStore {
    path: PathBuf,
    index: RwLock<ReferenceIndex>,
}

impl DiskReferenceStore {
    pub fn new(root: &Path) -> Result<Self> {
        create_dir(root)?;
        let path = root.join("references.json");
        let index = load_json(&path)?;
        Ok(Self {
            path,
            index: RwLock::new(index),
        })
    }

    /// All names, sorted.
    pub async fn names(&self) -> Vec<String> {
        self.index.read().await.references.keys().cloned().collect()
    }
}

#[async_trait]
impl ReferenceStore for DiskReferenceStore {
    async fn get(&self, name: &str) -> Result<ImageId> {
        self.index
            .read()
            .await
            .references
            .get(name)
            .cloned()
            .ok_or_else(|| DeltaError::NotFound(format!("reference {}", name)))
    }

    async fn add_tag(&self, name: &str, id: &ImageId) -> Result<()> {
        let mut index = self.index.write().await;
        let previous = index.references.insert(name.to_string(), id.clone());
        if let Err(e) = save_json(&self.path, &*index).await {
            match previous {
                Some(prev) => index.references.insert(name.to_string(), prev),
                None => index.references.remove(name),
            };
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn config(diff_ids: &[&str]) -> Vec<u8> {
        serde_json::json!({
            "os": "linux",
            "architecture": "arm64",
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_image_store_persists_configs_and_parents() {
        let tmp = TempDir::new().unwrap();
        let raw_base = config(&["faked:a"]);
        let raw_child = config(&["faked:a", "faked:b"]);

        let (base, child) = {
            let store = DiskImageStore::new(tmp.path()).unwrap();
            let base = store.create(&raw_base).await.unwrap();
            let child = store.create(&raw_child).await.unwrap();
            store.set_parent(&child, &base).await.unwrap();
            (base, child)
        };

        let store = DiskImageStore::new(tmp.path()).unwrap();
        let image = store.get(&child).await.unwrap();
        assert_eq!(image.raw_config(), raw_child.as_slice());
        assert_eq!(image.diff_ids().len(), 2);
        assert_eq!(store.parent(&child).await.unwrap(), Some(base.clone()));
        assert_eq!(store.children(&base).await.unwrap(), vec![child]);
    }

    #[tokio::test]
    async fn test_failed_parent_save_keeps_index() {
        let tmp = TempDir::new().unwrap();
        let store = DiskImageStore::new(tmp.path()).unwrap();
        let base = store.create(&config(&["faked:a"])).await.unwrap();
        let child = store.create(&config(&["faked:a", "faked:b"])).await.unwrap();

        // A directory in the index's place makes the rename fail.
        std::fs::create_dir(store.index_path()).unwrap();
        let err = store.set_parent(&child, &base).await.unwrap_err();
        assert!(matches!(err, DeltaError::StoreError(_)));
        assert_eq!(store.parent(&child).await.unwrap(), None);
        assert!(store.children(&base).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_image_store_unknown_id() {
        let tmp = TempDir::new().unwrap();
        let store = DiskImageStore::new(tmp.path()).unwrap();
        let err = store.get(&Digest::sha256(b"nope")).await.unwrap_err();
        assert!(matches!(err, DeltaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_image_store_rejects_invalid_config() {
        let tmp = TempDir::new().unwrap();
        let store = DiskImageStore::new(tmp.path()).unwrap();
        assert!(store.create(b"{}").await.is_err());
        let id = Digest::sha256(b"{}");
        assert!(store.get(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_layer_store_register_open_release() {
        let tmp = TempDir::new().unwrap();
        let store = DiskLayerStore::new(&tmp.path().join("layers")).unwrap();

        let registered = store.register(vec![7u8; 4096]).await.unwrap();
        assert!(registered.created);
        let diff_id = registered.info.diff_id.clone();
        assert_eq!(store.get(&diff_id).await.unwrap().unwrap().size, 4096);
        let again = store.register(vec![7u8; 4096]).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.references, 2);

        let mut content = Vec::new();
        store
            .open(&diff_id)
            .await
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, vec![7u8; 4096]);
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.release(&diff_id).await.unwrap();
        assert_eq!(store.list().await.unwrap()[0].references, 1);

        // The count survives reopening the store.
        let store = DiskLayerStore::new(&tmp.path().join("layers")).unwrap();
        assert!(store.get(&diff_id).await.unwrap().is_some());

        store.release(&diff_id).await.unwrap();
        assert!(store.get(&diff_id).await.unwrap().is_none());
        assert!(matches!(
            store.open(&diff_id).await,
            Err(DeltaError::NotFound(_))
        ));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_layer_without_metadata_is_invisible() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("layers");
        let store = DiskLayerStore::new(&dir).unwrap();
        let diff_id = Digest::sha256(b"orphan");
        std::fs::write(store.blob_path(&diff_id), b"orphan").unwrap();
        assert!(store.get(&diff_id).await.unwrap().is_none());
        assert!(store.open(&diff_id).await.is_err());
    }

    #[tokio::test]
    async fn test_reference_store_persistence() {
        let tmp = TempDir::new().unwrap();
        let id = Digest::sha256(b"image");
        {
            let refs = DiskReferenceStore::new(tmp.path()).unwrap();
            refs.add_tag("busybox:1.29", &id).await.unwrap();
        }
        let refs = DiskReferenceStore::new(tmp.path()).unwrap();
        assert_eq!(refs.get("busybox:1.29").await.unwrap(), id);
        assert_eq!(refs.names().await, vec!["busybox:1.29".to_string()]);
        assert!(refs.get("busybox:1.24").await.is_err());
    }
}
