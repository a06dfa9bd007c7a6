//! Bundle manifest (bundle_manifest.json)
//!
//! Lists every staged file sorted by bundle path with its size, SHA-256
//! and workspace source. `bundle_root_sha256` is the SHA-256 of the JCS
//! form of the entries, so the same outputs always give the same digest.
//! The manifest carries no timestamps or run ids.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::Path;

pub const SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_ID: &str = "crossbuild/bundle_manifest@1";

/// File name of the manifest at the bundle root
pub const MANIFEST_FILE: &str = "bundle_manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path inside the bundle, `/`-separated
    pub path: String,
    pub size: u64,
    pub sha256: String,
    /// Workspace-relative path the file was copied from
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub schema_version: u32,
    pub schema_id: String,
    pub platform: String,
    pub arch: String,
    pub entries: Vec<ManifestEntry>,
    pub bundle_root_sha256: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("JCS canonicalization error: {0}")]
    JcsError(String),
}

/// Mismatch between a manifest and the files on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegrityError {
    MissingFile { path: String },
    SizeMismatch { path: String, expected: u64, actual: u64 },
    HashMismatch { path: String, expected: String, actual: String },
}

/// Streaming SHA-256 of a file
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

impl BundleManifest {
    /// Build a manifest; entries are sorted by path.
    pub fn new(
        platform: &str,
        arch: &str,
        mut entries: Vec<ManifestEntry>,
    ) -> Result<Self, ManifestError> {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let bundle_root_sha256 = Self::compute_root_sha256(&entries)?;
        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            platform: platform.to_string(),
            arch: arch.to_string(),
            entries,
            bundle_root_sha256,
        })
    }

    pub fn compute_root_sha256(entries: &[ManifestEntry]) -> Result<String, ManifestError> {
        let jcs_bytes = serde_json_canonicalizer::to_vec(&entries.to_vec())
            .map_err(|e| ManifestError::JcsError(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&jcs_bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn verify_root(&self) -> Result<bool, ManifestError> {
        Ok(Self::compute_root_sha256(&self.entries)? == self.bundle_root_sha256)
    }

    /// Check every entry against the files under `dir`
    pub fn verify_entries(&self, dir: &Path) -> Result<Vec<IntegrityError>, ManifestError> {
        let mut errors = Vec::new();

        for entry in &self.entries {
            let full_path = dir.join(&entry.path);
            if !full_path.is_file() {
                errors.push(IntegrityError::MissingFile {
                    path: entry.path.clone(),
                });
                continue;
            }

            let actual_size = fs::metadata(&full_path)?.len();
            if actual_size != entry.size {
                errors.push(IntegrityError::SizeMismatch {
                    path: entry.path.clone(),
                    expected: entry.size,
                    actual: actual_size,
                });
                continue;
            }

            let actual = sha256_file(&full_path)?;
            if actual != entry.sha256 {
                errors.push(IntegrityError::HashMismatch {
                    path: entry.path.clone(),
                    expected: entry.sha256.clone(),
                    actual,
                });
            }
        }

        Ok(errors)
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<(), ManifestError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let json = fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(path: &str, contents: &[u8]) -> ManifestEntry {
        let mut hasher = Sha256::new();
        hasher.update(contents);
        ManifestEntry {
            path: path.to_string(),
            size: contents.len() as u64,
            sha256: hex::encode(hasher.finalize()),
            source: format!("target/{}", path),
        }
    }

    #[test]
    fn test_entries_sorted_and_root_order_independent() {
        let a = BundleManifest::new(
            "linux/amd64",
            "x86_64",
            vec![entry("b.txt", b"b"), entry("a.txt", b"a")],
        )
        .unwrap();
        let b = BundleManifest::new(
            "linux/amd64",
            "x86_64",
            vec![entry("a.txt", b"a"), entry("b.txt", b"b")],
        )
        .unwrap();
        assert_eq!(a.entries[0].path, "a.txt");
        assert_eq!(a.bundle_root_sha256, b.bundle_root_sha256);
        assert!(a.verify_root().unwrap());
    }

    #[test]
    fn test_root_changes_with_content() {
        let a = BundleManifest::new("linux/amd64", "x86_64", vec![entry("app", b"v1")]).unwrap();
        let b = BundleManifest::new("linux/amd64", "x86_64", vec![entry("app", b"v2")]).unwrap();
        assert_ne!(a.bundle_root_sha256, b.bundle_root_sha256);
    }

    #[test]
    fn test_verify_entries() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app"), b"binary").unwrap();
        fs::write(dir.path().join("other"), b"changed").unwrap();

        let manifest = BundleManifest::new(
            "linux/amd64",
            "x86_64",
            vec![
                entry("app", b"binary"),
                entry("other", b"origina"),
                entry("gone", b"x"),
            ],
        )
        .unwrap();
        let errors = manifest.verify_entries(dir.path()).unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&IntegrityError::MissingFile {
            path: "gone".to_string()
        }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, IntegrityError::HashMismatch { path, .. } if path == "other")));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let manifest = BundleManifest::new("linux/arm64", "aarch64", vec![entry("app", b"x")]).unwrap();
        manifest.write_to_file(&path).unwrap();
        assert_eq!(BundleManifest::from_file(&path).unwrap(), manifest);
        assert_eq!(manifest.total_size(), 1);
    }

    #[test]
    fn test_sha256_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
