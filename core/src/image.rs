//! Image metadata as seen by the delta engine.
//!
//! Only the parts of the OCI image config the engine relies on are parsed:
//! platform fields, `rootfs.diff_ids`, and labels. The raw config bytes are
//! always kept, because the image id is the digest of those exact bytes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{DeltaError, Result};

/// Image identifier: digest of the raw config bytes.
pub type ImageId = Digest;

/// OS/architecture pair selecting a layer store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    /// The OS/architecture pair a layer store is keyed by; variants share a store.
    pub fn store_key(&self) -> Platform {
        Platform::new(self.os.clone(), self.architecture.clone())
    }

    /// Whether two platforms resolve to the same layer store.
    pub fn shares_store_with(&self, other: &Platform) -> bool {
        self.os == other.os && self.architecture == other.architecture
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// Root filesystem section of an image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeSection {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct RawImageConfig {
    os: String,
    architecture: String,
    #[serde(default)]
    variant: Option<String>,
    rootfs: RootFs,
    #[serde(default)]
    config: Option<RuntimeSection>,
}

/// Parsed image config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    pub platform: Platform,
    pub rootfs: RootFs,
    pub labels: HashMap<String, String>,
}

impl ImageConfig {
    /// Parse the fields the engine needs from raw config JSON.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let parsed: RawImageConfig = serde_json::from_slice(raw)?;
        if parsed.rootfs.fs_type != "layers" {
            return Err(DeltaError::SerializationError(format!(
                "unsupported rootfs type '{}'",
                parsed.rootfs.fs_type
            )));
        }

        Ok(Self {
            platform: Platform {
                os: parsed.os,
                architecture: parsed.architecture,
                variant: parsed.variant,
            },
            rootfs: parsed.rootfs,
            labels: parsed
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
        })
    }
}

/// An image known to an image store.
#[derive(Debug, Clone)]
pub struct Image {
    id: ImageId,
    config: ImageConfig,
    raw_config: Arc<[u8]>,
}

impl Image {
    /// Build an image from raw config bytes, computing its id.
    pub fn from_config(raw: &[u8]) -> Result<Self> {
        let config = ImageConfig::parse(raw)?;
        Ok(Self {
            id: Digest::sha256(raw),
            config,
            raw_config: Arc::from(raw),
        })
    }

    pub fn id(&self) -> &ImageId {
        &self.id
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn platform(&self) -> &Platform {
        &self.config.platform
    }

    /// Layer diffIDs, bottom to top.
    pub fn diff_ids(&self) -> &[Digest] {
        &self.config.rootfs.diff_ids
    }

    /// The exact config bytes the id was computed from.
    pub fn raw_config(&self) -> &[u8] {
        &self.raw_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Vec<u8> {
        serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Env": ["PATH=/bin"], "Labels": { "app": "web" } },
            "rootfs": {
                "type": "layers",
                "diff_ids": [
                    "faked:base",
                    "faked:app"
                ]
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_parse_config() {
        let config = ImageConfig::parse(&sample_config()).unwrap();
        assert_eq!(config.platform, Platform::new("linux", "amd64"));
        assert_eq!(config.rootfs.diff_ids.len(), 2);
        assert_eq!(config.rootfs.diff_ids[1].encoded(), "app");
        assert_eq!(config.labels.get("app").map(String::as_str), Some("web"));
    }

    #[test]
    fn test_image_id_is_config_digest() {
        let raw = sample_config();
        let image = Image::from_config(&raw).unwrap();
        assert_eq!(image.id(), &Digest::sha256(&raw));
        assert_eq!(image.raw_config(), raw.as_slice());
    }

    #[test]
    fn test_parse_rejects_unknown_rootfs_type() {
        let raw = br#"{"os":"linux","architecture":"amd64","rootfs":{"type":"zfs","diff_ids":[]}}"#;
        assert!(ImageConfig::parse(raw).is_err());
    }

    #[test]
    fn test_parse_rejects_invalid_diff_id() {
        let raw =
            br#"{"os":"linux","architecture":"amd64","rootfs":{"type":"layers","diff_ids":["oops"]}}"#;
        assert!(ImageConfig::parse(raw).is_err());
    }

    #[test]
    fn test_platform_display() {
        let mut p = Platform::new("linux", "arm");
        assert_eq!(p.to_string(), "linux/arm");
        p.variant = Some("v7".to_string());
        assert_eq!(p.to_string(), "linux/arm/v7");
        assert_eq!(p.store_key(), Platform::new("linux", "arm"));
        assert!(p.shares_store_with(&Platform::new("linux", "arm")));
        assert!(!p.shares_store_with(&Platform::new("linux", "arm64")));
    }
}
