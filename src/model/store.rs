//! Manifest-file model store.
//!
//! Models live under a directory of JSON manifests laid out by qualified
//! name: `<dir>/<host>/<namespace>/<model>/<tag>`. A manifest names the
//! weights file and carries the structural metadata the estimator needs.
//! The model's identity is the digest of the manifest bytes, so editing a
//! manifest yields a new identity.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ModelKey, ModelMetadata};
use crate::error::{KilnError, Result};

const DEFAULT_HOST: &str = "registry.local";
const DEFAULT_NAMESPACE: &str = "library";
const DEFAULT_TAG: &str = "latest";

/// On-disk manifest contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Path to the weights file, absolute or relative to the models dir.
    pub weights: PathBuf,
    pub metadata: ModelMetadata,
}

/// A model resolved by name, ready to hand to the scheduler.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub name: String,
    pub key: ModelKey,
    pub weights_path: PathBuf,
    pub metadata: ModelMetadata,
}

pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolve a model name to its manifest digest, weights path, and
    /// metadata.
    pub fn resolve(&self, name: &str) -> Result<ResolvedModel> {
        let path = self.manifest_path(name);
        let bytes = std::fs::read(&path)
            .map_err(|_| KilnError::UnknownModel(name.to_string()))?;
        let key = ModelKey::from_manifest_bytes(&bytes);
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| KilnError::Manifest(format!("{}: {}", name, e)))?;

        let weights_path = if manifest.weights.is_absolute() {
            manifest.weights.clone()
        } else {
            self.dir.join(&manifest.weights)
        };

        Ok(ResolvedModel {
            name: name.to_string(),
            key,
            weights_path,
            metadata: manifest.metadata,
        })
    }

    /// All model names with a manifest on disk.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        collect_manifests(&self.dir, &self.dir, &mut names)?;
        names.sort();
        Ok(names)
    }

    /// Write a manifest for `name`, creating parent directories.
    pub fn put(&self, name: &str, manifest: &Manifest) -> Result<()> {
        let path = self.manifest_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec_pretty(manifest)?)?;
        Ok(())
    }

    fn manifest_path(&self, name: &str) -> PathBuf {
        let (host, namespace, model, tag) = parse_name(name);
        self.dir.join(host).join(namespace).join(model).join(tag)
    }
}

/// Split a model name into `(host, namespace, model, tag)`, filling in
/// defaults for the parts a short name omits.
fn parse_name(name: &str) -> (String, String, String, String) {
    let (rest, tag) = match name.rsplit_once(':') {
        Some((rest, tag)) if !tag.contains('/') => (rest, tag),
        _ => (name, DEFAULT_TAG),
    };

    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [model] => (DEFAULT_HOST.into(), DEFAULT_NAMESPACE.into(), model.to_string(), tag.into()),
        [namespace, model] => (DEFAULT_HOST.into(), namespace.to_string(), model.to_string(), tag.into()),
        [host, namespace, model] => {
            (host.to_string(), namespace.to_string(), model.to_string(), tag.into())
        }
        _ => (DEFAULT_HOST.into(), DEFAULT_NAMESPACE.into(), rest.to_string(), tag.into()),
    }
}

fn collect_manifests(root: &Path, dir: &Path, names: &mut Vec<String>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_manifests(root, &path, names)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let parts: Vec<_> = rel.iter().filter_map(|c| c.to_str()).collect();
            if let [host, namespace, model, tag] = parts.as_slice() {
                names.push(format!("{}/{}/{}:{}", host, namespace, model, tag));
            }
        }
    }
    Ok(())
}
