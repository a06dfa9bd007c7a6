//! Artifact publication
//!
//! The publisher names a staged [`ArtifactBundle`] and hands its files to an
//! [`ArtifactSink`]. Names are pure functions of the entry and the bundle
//! manifest. There are no retries at this layer, and the staging
//! directory is removed whether or not the sink accepted the bundle.

mod sink;

pub use sink::{DirectorySink, TarSink};

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::collect::{ArtifactBundle, BundleManifest, MANIFEST_FILE};
use crate::matrix::PlatformEntry;
use crate::signal::CancellationCoordinator;

/// Hex characters of the manifest digest appended to names
pub const CONTENT_DIGEST_LEN: usize = 12;

/// One file handed to a sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    /// Path inside the bundle, `/`-separated
    pub relative_path: String,
    /// Where to read the content from
    pub source: PathBuf,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sink rejected bundle: {0}")]
    Rejected(String),
}

/// Destination for published bundles.
///
/// A sink either stores the complete bundle or nothing.
pub trait ArtifactSink: Send + Sync {
    fn name(&self) -> &str;

    /// Store `files` as bundle `bundle_name` and return its location
    fn publish(&self, bundle_name: &str, files: &[BundleFile]) -> Result<String, SinkError>;
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish of {bundle} failed: {source}")]
    Sink {
        bundle: String,
        #[source]
        source: SinkError,
    },

    #[error("staged bundle {bundle} does not match its manifest ({problems} problems)")]
    Integrity { bundle: String, problems: usize },

    #[error("publish cancelled")]
    Cancelled,
}

/// How published bundles are stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleFormat {
    #[default]
    Directory,
    Tar,
}

impl std::str::FromStr for BundleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "directory" | "dir" => Ok(BundleFormat::Directory),
            "tar" => Ok(BundleFormat::Tar),
            other => Err(format!("unknown bundle format: {} (expected directory or tar)", other)),
        }
    }
}

/// `[bundle]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSettings {
    #[serde(default)]
    pub format: BundleFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default)]
    pub content_digest: bool,
}

impl BundleSettings {
    pub fn naming_rule(&self) -> NamingRule {
        NamingRule {
            prefix: self.prefix.clone(),
            content_digest: self.content_digest,
        }
    }

    /// Sink for this format rooted at `output_dir`
    pub fn sink(&self, output_dir: PathBuf) -> Arc<dyn ArtifactSink> {
        match self.format {
            BundleFormat::Directory => Arc::new(DirectorySink::new(output_dir)),
            BundleFormat::Tar => Arc::new(TarSink::new(output_dir)),
        }
    }
}

/// Bundle naming: `[{prefix}-]{arch}-{platform_family}[-{digest12}]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamingRule {
    pub prefix: Option<String>,
    pub content_digest: bool,
}

impl NamingRule {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(prefix) = &self.prefix {
            let re = regex_lite::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$")
                .map_err(|e| e.to_string())?;
            if !re.is_match(prefix) {
                return Err(format!(
                    "bundle.prefix `{}` must start with an alphanumeric character and contain only [A-Za-z0-9._-]",
                    prefix
                ));
            }
        }
        Ok(())
    }

    pub fn bundle_name(&self, entry: &PlatformEntry, manifest: &BundleManifest) -> String {
        let mut name = entry.bundle_stem();
        if let Some(prefix) = &self.prefix {
            name = format!("{}-{}", prefix, name);
        }
        if self.content_digest {
            let digest = &manifest.bundle_root_sha256;
            let end = digest.len().min(CONTENT_DIGEST_LEN);
            name = format!("{}-{}", name, &digest[..end]);
        }
        name
    }
}

/// Result of a successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub bundle_name: String,
    pub sink: String,
    pub location: String,
    /// Files in the bundle, manifest included
    pub file_count: usize,
    pub bundle_root_sha256: String,
}

/// Sink input for a bundle: every staged file plus the manifest, sorted by path
pub fn bundle_files(bundle: &ArtifactBundle) -> Vec<BundleFile> {
    let mut files: Vec<BundleFile> = bundle
        .manifest
        .entries
        .iter()
        .map(|e| BundleFile {
            relative_path: e.path.clone(),
            source: bundle.staged_path(&e.path),
        })
        .collect();
    files.push(BundleFile {
        relative_path: MANIFEST_FILE.to_string(),
        source: bundle.staged_path(MANIFEST_FILE),
    });
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    files
}

pub struct ArtifactPublisher {
    sink: Arc<dyn ArtifactSink>,
    cancel: CancellationCoordinator,
}

impl ArtifactPublisher {
    pub fn new(sink: Arc<dyn ArtifactSink>, cancel: CancellationCoordinator) -> Self {
        Self { sink, cancel }
    }

    /// Name and publish `bundle`, consuming its staging directory.
    pub fn publish(
        &self,
        mut bundle: ArtifactBundle,
        rule: &NamingRule,
    ) -> Result<PublishReceipt, PublishError> {
        if self.cancel.is_cancelled() {
            bundle.discard();
            return Err(PublishError::Cancelled);
        }

        let name = rule.bundle_name(&bundle.entry, &bundle.manifest);
        bundle.name = name.clone();

        let problems = bundle
            .manifest
            .verify_entries(&bundle.staging_dir)
            .map(|errors| errors.len())
            .unwrap_or(usize::MAX);
        if problems > 0 {
            warn!(bundle = %name, problems, "staged bundle failed verification");
            bundle.discard();
            return Err(PublishError::Integrity {
                bundle: name,
                problems,
            });
        }

        let files = bundle_files(&bundle);
        let result = self.sink.publish(&name, &files);
        let digest = bundle.manifest.bundle_root_sha256.clone();
        bundle.discard();

        match result {
            Ok(location) => {
                info!(bundle = %name, sink = self.sink.name(), location = %location, "bundle published");
                Ok(PublishReceipt {
                    bundle_name: name,
                    sink: self.sink.name().to_string(),
                    location,
                    file_count: files.len(),
                    bundle_root_sha256: digest,
                })
            }
            Err(source) => Err(PublishError::Sink {
                bundle: name,
                source,
            }),
        }
    }
}
