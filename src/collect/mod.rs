//! Artifact collection
//!
//! After a Succeeded build the collector resolves each [`ArtifactRule`]
//! against the workspace in declaration order, copies the matches into the
//! job's staging directory and records the layout in
//! [`BundleManifest`]. The workspace itself is never modified.

mod manifest;
mod spec;

pub use manifest::{
    sha256_file, BundleManifest, IntegrityError, ManifestEntry, ManifestError, MANIFEST_FILE,
};
pub use spec::{expand_placeholders, ArtifactRule, ArtifactSpec, DeclaredOutputs};

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::matrix::PlatformEntry;
use crate::workspace::{remove_quietly, WorkspacePaths};

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("required artifact not found: {pattern}")]
    MissingArtifact { pattern: String },

    #[error("invalid artifact pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("rename for `{pattern}` needs exactly one match, found {matches}")]
    AmbiguousRename { pattern: String, matches: usize },

    #[error("two artifacts staged at the same bundle path: {path}")]
    DuplicateDestination { path: String },

    #[error("artifact I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CollectError + '_ {
    move |source| CollectError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One staged file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Workspace-relative source path
    pub source: String,
    /// Bundle-relative path
    pub path: String,
}

/// Collected outputs of one entry, staged and ready to publish
#[derive(Debug)]
pub struct ArtifactBundle {
    /// Default bundle name, `{arch}-{platform_family}`
    pub name: String,
    pub entry: PlatformEntry,
    pub staging_dir: PathBuf,
    /// Staged files in rule order, then lexicographic within a rule
    pub files: Vec<StagedFile>,
    pub manifest: BundleManifest,
}

impl ArtifactBundle {
    /// Absolute path of a staged file
    pub fn staged_path(&self, bundle_path: &str) -> PathBuf {
        self.staging_dir.join(bundle_path)
    }

    /// Remove the staging directory without publishing
    pub fn discard(self) {
        debug!(bundle = %self.name, "discarding staged bundle");
        remove_quietly(&self.staging_dir);
    }
}

/// `{arch}-{platform_family}`
pub fn default_bundle_name(entry: &PlatformEntry) -> String {
    entry.bundle_stem()
}

/// A path under the workspace root
#[derive(Debug, Clone)]
struct Candidate {
    rel: String,
    abs: PathBuf,
    is_dir: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ArtifactCollector;

impl ArtifactCollector {
    pub fn new() -> Self {
        Self
    }

    /// Stage the outputs `spec` declares for `entry`.
    ///
    /// On any error the partially filled staging directory is removed.
    pub fn collect(
        &self,
        workspace: &WorkspacePaths,
        entry: &PlatformEntry,
        spec: &ArtifactSpec,
    ) -> Result<ArtifactBundle, CollectError> {
        let staging_dir = workspace.staging_dir();
        remove_quietly(&staging_dir);
        fs::create_dir_all(&staging_dir).map_err(io_err(&staging_dir))?;

        match self.stage(workspace, entry, spec, &staging_dir) {
            Ok((files, manifest)) => {
                info!(
                    platform = %entry.platform,
                    files = files.len(),
                    bytes = manifest.total_size(),
                    "artifacts collected"
                );
                Ok(ArtifactBundle {
                    name: default_bundle_name(entry),
                    entry: entry.clone(),
                    staging_dir,
                    files,
                    manifest,
                })
            }
            Err(e) => {
                remove_quietly(&staging_dir);
                Err(e)
            }
        }
    }

    fn stage(
        &self,
        workspace: &WorkspacePaths,
        entry: &PlatformEntry,
        spec: &ArtifactSpec,
        staging_dir: &Path,
    ) -> Result<(Vec<StagedFile>, BundleManifest), CollectError> {
        let candidates = scan(workspace, staging_dir)?;

        // bundle path -> source
        let mut planned: BTreeMap<String, Candidate> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();

        for rule in spec.rules() {
            let pattern = rule.resolved_pattern(entry);
            let matcher = rule.matcher(entry)?;
            let matches = prune_nested(candidates.iter().filter(|c| matcher.is_match(&c.rel)));

            if matches.is_empty() {
                if rule.required {
                    return Err(CollectError::MissingArtifact { pattern });
                }
                debug!(pattern = %pattern, "optional artifact not present");
                continue;
            }

            let rename = rule.resolved_rename(entry);
            if rename.is_some() && matches.len() > 1 {
                return Err(CollectError::AmbiguousRename {
                    pattern,
                    matches: matches.len(),
                });
            }

            let dest = rule.resolved_dest(entry);
            let mut rule_files = 0;
            for matched in matches {
                let name = match &rename {
                    Some(name) => name.clone(),
                    None => file_name(&matched.rel),
                };
                let base = join_rel(&dest, &name);

                let files = if matched.is_dir {
                    expand_dir(matched, &base)?
                } else {
                    vec![(base, matched.clone())]
                };

                for (bundle_path, source) in files {
                    if bundle_path == MANIFEST_FILE || planned.contains_key(&bundle_path) {
                        return Err(CollectError::DuplicateDestination { path: bundle_path });
                    }
                    order.push(bundle_path.clone());
                    planned.insert(bundle_path, source);
                    rule_files += 1;
                }
            }

            if rule_files == 0 && rule.required {
                return Err(CollectError::MissingArtifact { pattern });
            }
        }

        let mut staged = Vec::with_capacity(order.len());
        let mut entries = Vec::with_capacity(order.len());
        for bundle_path in order {
            let source = &planned[&bundle_path];
            let target = staging_dir.join(&bundle_path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            let size = fs::copy(&source.abs, &target).map_err(io_err(&source.abs))?;
            let sha256 = sha256_file(&target).map_err(io_err(&target))?;

            entries.push(ManifestEntry {
                path: bundle_path.clone(),
                size,
                sha256,
                source: source.rel.clone(),
            });
            staged.push(StagedFile {
                source: source.rel.clone(),
                path: bundle_path,
            });
        }

        let manifest = BundleManifest::new(&entry.platform, &entry.arch, entries)
            .map_err(|e| manifest_err(staging_dir, e))?;
        let manifest_path = staging_dir.join(MANIFEST_FILE);
        manifest
            .write_to_file(&manifest_path)
            .map_err(|e| manifest_err(&manifest_path, e))?;

        Ok((staged, manifest))
    }
}

fn manifest_err(path: &Path, e: ManifestError) -> CollectError {
    let source = match e {
        ManifestError::IoError(io) => io,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    };
    CollectError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Every file and directory under the workspace root, sorted by relative path
fn scan(workspace: &WorkspacePaths, staging_dir: &Path) -> Result<Vec<Candidate>, CollectError> {
    let root = &workspace.root;
    let skip = |p: &Path| {
        p.starts_with(staging_dir)
            || p.starts_with(&workspace.job_dir) && !root.starts_with(&workspace.job_dir)
            || workspace.ignored.iter().any(|i| p.starts_with(i))
    };

    let mut candidates = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !skip(e.path()));

    for dir_entry in walker {
        let dir_entry = dir_entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
            CollectError::Io {
                path,
                source: io::Error::new(io::ErrorKind::Other, e.to_string()),
            }
        })?;
        let rel = match dir_entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => to_slash(rel),
            _ => continue,
        };

        let file_type = dir_entry.file_type();
        let is_dir = if file_type.is_dir() {
            true
        } else if file_type.is_file() || (file_type.is_symlink() && dir_entry.path().is_file()) {
            false
        } else {
            continue;
        };

        candidates.push(Candidate {
            rel,
            abs: dir_entry.path().to_path_buf(),
            is_dir,
        });
    }

    candidates.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(candidates)
}

/// Drop matches that live inside a matched directory
fn prune_nested<'a>(matches: impl Iterator<Item = &'a Candidate>) -> Vec<&'a Candidate> {
    let mut kept: Vec<&Candidate> = Vec::new();
    for candidate in matches {
        let nested = kept
            .iter()
            .any(|k| k.is_dir && candidate.rel.starts_with(&format!("{}/", k.rel)));
        if !nested {
            kept.push(candidate);
        }
    }
    kept
}

/// Files under a matched directory, mapped below `base`
fn expand_dir(dir: &Candidate, base: &str) -> Result<Vec<(String, Candidate)>, CollectError> {
    let mut files = Vec::new();
    for dir_entry in WalkDir::new(&dir.abs)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let dir_entry = dir_entry.map_err(|e| CollectError::Io {
            path: dir.abs.clone(),
            source: io::Error::new(io::ErrorKind::Other, e.to_string()),
        })?;
        let path = dir_entry.path();
        let is_file = dir_entry.file_type().is_file()
            || (dir_entry.file_type().is_symlink() && path.is_file());
        if !is_file {
            continue;
        }
        let Ok(inner) = path.strip_prefix(&dir.abs) else {
            continue;
        };
        let inner = to_slash(inner);
        files.push((
            join_rel(base, &inner),
            Candidate {
                rel: join_rel(&dir.rel, &inner),
                abs: path.to_path_buf(),
                is_dir: false,
            },
        ));
    }
    Ok(files)
}

pub(crate) fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn file_name(rel: &str) -> String {
    rel.rsplit('/').next().unwrap_or(rel).to_string()
}

fn join_rel(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}
