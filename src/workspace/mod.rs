//! Per-entry build workspaces
//!
//! Every entry gets a job directory under `<work_root>/<run_id>/<platform_slug>`
//! holding its build log, state record and staging area. With
//! `isolate = true` the source tree is also copied to `<job_dir>/src` so
//! concurrent builds never write to the same directory.
//!
//! Paths matching the entry's declared outputs never survive from before
//! the build: they are left out of an isolated copy and removed from a
//! shared source root.

mod exclude;

pub use exclude::{ExcludeError, ExcludeRules};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::collect::{to_slash, DeclaredOutputs};
use crate::matrix::PlatformEntry;

/// Build log file name inside the job directory
pub const BUILD_LOG: &str = "build.log";

/// When to keep an isolated workspace copy after the entry finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepPolicy {
    Never,
    /// Keep copies of entries that did not succeed
    #[default]
    Failed,
    Always,
}

/// `[workspace]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    #[serde(default = "default_isolate")]
    pub isolate: bool,
    #[serde(default)]
    pub keep: KeepPolicy,
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

fn default_isolate() -> bool {
    true
}

fn default_exclude() -> Vec<String> {
    vec![".git".to_string(), ".git/**".to_string()]
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            isolate: default_isolate(),
            keep: KeepPolicy::default(),
            exclude: default_exclude(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("source root does not exist: {0}")]
    MissingSource(PathBuf),

    #[error("workspace I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Exclude(#[from] ExcludeError),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Paths of one entry's prepared workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    /// Source tree mounted read-write into the container
    pub root: PathBuf,
    /// Job directory (log, state, staging)
    pub job_dir: PathBuf,
    pub log_path: PathBuf,
    /// `root` is a private copy
    pub isolated: bool,
    /// Absolute paths under `root` that artifact matching must skip
    pub ignored: Vec<PathBuf>,
}

impl WorkspacePaths {
    /// Staging directory for collected artifacts
    pub fn staging_dir(&self) -> PathBuf {
        self.job_dir.join("staging")
    }
}

/// Prepares and tears down entry workspaces for one run
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    source_root: PathBuf,
    run_dir: PathBuf,
    settings: WorkspaceSettings,
    rules: ExcludeRules,
    ignored: Vec<PathBuf>,
}

impl WorkspaceManager {
    /// `ignored` lists absolute paths inside `source_root` that belong to
    /// the orchestrator itself (work root, output dir) and are never copied
    /// or matched.
    pub fn new(
        source_root: PathBuf,
        run_dir: PathBuf,
        settings: WorkspaceSettings,
        ignored: Vec<PathBuf>,
    ) -> Result<Self, WorkspaceError> {
        let rules = ExcludeRules::new(&settings.exclude)?;
        let ignored = ignored
            .into_iter()
            .filter(|p| p.starts_with(&source_root))
            .collect();
        Ok(Self {
            source_root,
            run_dir,
            settings,
            rules,
            ignored,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn job_dir(&self, entry: &PlatformEntry) -> PathBuf {
        self.run_dir.join(entry.platform_slug())
    }

    /// Paths `prepare` would produce, without touching the filesystem
    pub fn planned_paths(&self, entry: &PlatformEntry) -> WorkspacePaths {
        let job_dir = self.job_dir(entry);
        let log_path = job_dir.join(BUILD_LOG);
        if self.settings.isolate {
            WorkspacePaths {
                root: job_dir.join("src"),
                job_dir,
                log_path,
                isolated: true,
                ignored: Vec::new(),
            }
        } else {
            WorkspacePaths {
                root: self.source_root.clone(),
                job_dir,
                log_path,
                isolated: false,
                ignored: self.ignored.clone(),
            }
        }
    }

    /// Create the job directory and, when isolating, copy the source tree.
    ///
    /// Anything matching `outputs` is left out of the copy, or removed from
    /// the source root when the workspace is shared.
    pub fn prepare(
        &self,
        entry: &PlatformEntry,
        outputs: &DeclaredOutputs,
    ) -> Result<WorkspacePaths, WorkspaceError> {
        if !self.source_root.is_dir() {
            return Err(WorkspaceError::MissingSource(self.source_root.clone()));
        }

        let paths = self.planned_paths(entry);
        fs::create_dir_all(&paths.job_dir).map_err(io_err(&paths.job_dir))?;
        if !paths.isolated {
            let removed = self.clear_outputs(outputs)?;
            if removed > 0 {
                info!(platform = %entry.platform, removed, "removed stale outputs from source root");
            }
            return Ok(paths);
        }

        if paths.root.exists() {
            fs::remove_dir_all(&paths.root).map_err(io_err(&paths.root))?;
        }
        let copied = self.copy_tree(&paths.root, outputs)?;
        debug!(platform = %entry.platform, files = copied, root = %paths.root.display(), "workspace copied");

        Ok(paths)
    }

    fn copy_tree(&self, dest_root: &Path, outputs: &DeclaredOutputs) -> Result<usize, WorkspaceError> {
        fs::create_dir_all(dest_root).map_err(io_err(dest_root))?;
        let mut copied = 0;

        let walker = WalkDir::new(&self.source_root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .filter_entry(|e| !self.skip(e.path()) && !self.is_output(e.path(), outputs));

        for entry in walker {
            let entry = entry?;
            let rel_path = match entry.path().strip_prefix(&self.source_root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };
            let target = dest_root.join(rel_path);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                fs::create_dir_all(&target).map_err(io_err(&target))?;
            } else if file_type.is_symlink() {
                copy_symlink(entry.path(), &target)?;
            } else {
                fs::copy(entry.path(), &target).map_err(io_err(&target))?;
                copied += 1;
            }
        }

        Ok(copied)
    }

    /// Delete top-most paths under the source root that match `outputs`
    fn clear_outputs(&self, outputs: &DeclaredOutputs) -> Result<usize, WorkspaceError> {
        let mut matched = Vec::new();
        let mut walker = WalkDir::new(&self.source_root).follow_links(false).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry?;
            if self.skip(entry.path()) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
            if self.is_output(entry.path(), outputs) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                matched.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
            }
        }

        for (path, is_dir) in &matched {
            debug!(path = %path.display(), "removing stale output");
            if *is_dir {
                fs::remove_dir_all(path).map_err(io_err(path))?;
            } else {
                fs::remove_file(path).map_err(io_err(path))?;
            }
        }
        Ok(matched.len())
    }

    fn is_output(&self, path: &Path, outputs: &DeclaredOutputs) -> bool {
        match path.strip_prefix(&self.source_root) {
            Ok(rel) if !rel.as_os_str().is_empty() => outputs.is_match(&to_slash(rel)),
            _ => false,
        }
    }

    fn skip(&self, path: &Path) -> bool {
        if self.ignored.iter().any(|i| path.starts_with(i)) {
            return true;
        }
        match path.strip_prefix(&self.source_root) {
            Ok(rel) if !rel.as_os_str().is_empty() => self.rules.is_excluded(rel),
            _ => false,
        }
    }

    /// Remove an isolated copy according to the keep policy.
    ///
    /// The job directory itself (log, state) always stays. Returns true
    /// when the copy was removed.
    pub fn teardown(&self, paths: &WorkspacePaths, succeeded: bool) -> Result<bool, WorkspaceError> {
        if !paths.isolated {
            return Ok(false);
        }
        let remove = match self.settings.keep {
            KeepPolicy::Never => true,
            KeepPolicy::Failed => succeeded,
            KeepPolicy::Always => false,
        };
        if !remove || !paths.root.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&paths.root).map_err(io_err(&paths.root))?;
        Ok(true)
    }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> Result<(), WorkspaceError> {
    let link = fs::read_link(src).map_err(io_err(src))?;
    std::os::unix::fs::symlink(&link, target).map_err(io_err(target))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, target: &Path) -> Result<(), WorkspaceError> {
    if src.is_file() {
        fs::copy(src, target).map_err(io_err(target))?;
    } else {
        warn!(path = %src.display(), "skipping directory symlink");
    }
    Ok(())
}

/// Remove `path` if it exists, logging instead of failing
pub fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_dir_all(path) {
            warn!(path = %path.display(), error = %e, "failed to remove directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{ArtifactRule, ArtifactSpec};
    use tempfile::TempDir;

    fn source_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::create_dir_all(dir.path().join(".crossbuild/work")).unwrap();
        fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::write(dir.path().join(".crossbuild/work/old.log"), "x").unwrap();
        dir
    }

    fn manager(src: &Path, settings: WorkspaceSettings) -> WorkspaceManager {
        let work = src.join(".crossbuild/work");
        WorkspaceManager::new(
            src.to_path_buf(),
            work.join("run1"),
            settings,
            vec![work.clone()],
        )
        .unwrap()
    }

    #[test]
    fn test_isolated_copy_excludes() {
        let src = source_tree();
        let mgr = manager(src.path(), WorkspaceSettings::default());
        let entry = PlatformEntry::new("linux/arm64", "aarch64");

        let paths = mgr.prepare(&entry, &DeclaredOutputs::none()).unwrap();
        assert!(paths.isolated);
        assert_eq!(paths.job_dir, src.path().join(".crossbuild/work/run1/linux-arm64"));
        assert_eq!(paths.log_path, paths.job_dir.join("build.log"));
        assert!(paths.root.join("Cargo.toml").exists());
        assert!(paths.root.join("src/main.rs").exists());
        assert!(!paths.root.join(".git").exists());
        assert!(!paths.root.join(".crossbuild").exists());
    }

    #[test]
    fn test_shared_workspace_uses_source_root() {
        let src = source_tree();
        let settings = WorkspaceSettings {
            isolate: false,
            ..WorkspaceSettings::default()
        };
        let mgr = manager(src.path(), settings);
        let entry = PlatformEntry::new("linux/amd64", "x86_64");
        let paths = mgr.prepare(&entry, &DeclaredOutputs::none()).unwrap();
        assert!(!paths.isolated);
        assert_eq!(paths.root, src.path());
        assert_eq!(paths.ignored, vec![src.path().join(".crossbuild/work")]);
    }

    #[test]
    fn test_copy_does_not_touch_source() {
        let src = source_tree();
        let mgr = manager(src.path(), WorkspaceSettings::default());
        let entry = PlatformEntry::new("linux/amd64", "x86_64");
        let paths = mgr.prepare(&entry, &DeclaredOutputs::none()).unwrap();
        fs::write(paths.root.join("src/main.rs"), "changed").unwrap();
        assert_eq!(
            fs::read_to_string(src.path().join("src/main.rs")).unwrap(),
            "fn main() {}"
        );
    }

    fn outputs(entry: &PlatformEntry) -> DeclaredOutputs {
        ArtifactSpec::new(vec![
            ArtifactRule::required("target/release/app"),
            ArtifactRule::optional("i18n/locale"),
        ])
        .unwrap()
        .declared_outputs(entry)
        .unwrap()
    }

    fn with_stale_outputs(src: &Path) {
        fs::create_dir_all(src.join("target/release")).unwrap();
        fs::create_dir_all(src.join("i18n/locale/de")).unwrap();
        fs::write(src.join("target/release/app"), "stale").unwrap();
        fs::write(src.join("target/release/notes.txt"), "keep").unwrap();
        fs::write(src.join("i18n/locale/de/app.mo"), "stale").unwrap();
        fs::write(src.join("i18n/app.pot"), "keep").unwrap();
    }

    #[test]
    fn test_isolated_copy_leaves_out_declared_outputs() {
        let src = source_tree();
        with_stale_outputs(src.path());
        let mgr = manager(src.path(), WorkspaceSettings::default());
        let entry = PlatformEntry::new("linux/amd64", "x86_64");

        let paths = mgr.prepare(&entry, &outputs(&entry)).unwrap();
        assert!(!paths.root.join("target/release/app").exists());
        assert!(!paths.root.join("i18n/locale").exists());
        assert!(paths.root.join("target/release/notes.txt").exists());
        assert!(paths.root.join("i18n/app.pot").exists());
        assert!(src.path().join("target/release/app").exists());
        assert!(src.path().join("i18n/locale/de/app.mo").exists());
    }

    #[test]
    fn test_shared_workspace_clears_declared_outputs() {
        let src = source_tree();
        with_stale_outputs(src.path());
        let settings = WorkspaceSettings {
            isolate: false,
            ..WorkspaceSettings::default()
        };
        let mgr = manager(src.path(), settings);
        let entry = PlatformEntry::new("linux/amd64", "x86_64");

        let paths = mgr.prepare(&entry, &outputs(&entry)).unwrap();
        assert_eq!(paths.root, src.path());
        assert!(!src.path().join("target/release/app").exists());
        assert!(!src.path().join("i18n/locale").exists());
        assert!(src.path().join("target/release/notes.txt").exists());
        assert!(src.path().join("i18n/app.pot").exists());
        assert!(src.path().join("src/main.rs").exists());
        assert!(src.path().join(".crossbuild/work/old.log").exists());
    }

    #[test]
    fn test_teardown_keep_failed() {
        let src = source_tree();
        let mgr = manager(src.path(), WorkspaceSettings::default());

        let entry = PlatformEntry::new("linux/amd64", "x86_64");
        let ok = mgr.prepare(&entry, &DeclaredOutputs::none()).unwrap();
        assert!(mgr.teardown(&ok, true).unwrap());
        assert!(!ok.root.exists());
        assert!(ok.job_dir.exists());

        let entry = PlatformEntry::new("linux/arm64", "aarch64");
        let failed = mgr.prepare(&entry, &DeclaredOutputs::none()).unwrap();
        assert!(!mgr.teardown(&failed, false).unwrap());
        assert!(failed.root.exists());
    }

    #[test]
    fn test_teardown_policies() {
        let src = source_tree();
        let never = manager(
            src.path(),
            WorkspaceSettings {
                keep: KeepPolicy::Never,
                ..WorkspaceSettings::default()
            },
        );
        let entry = PlatformEntry::new("linux/amd64", "x86_64");
        let paths = never.prepare(&entry, &DeclaredOutputs::none()).unwrap();
        assert!(never.teardown(&paths, false).unwrap());

        let always = manager(
            src.path(),
            WorkspaceSettings {
                keep: KeepPolicy::Always,
                ..WorkspaceSettings::default()
            },
        );
        let entry = PlatformEntry::new("linux/amd64", "x86_64");
        let paths = always.prepare(&entry, &DeclaredOutputs::none()).unwrap();
        assert!(!always.teardown(&paths, true).unwrap());
        assert!(paths.root.exists());
    }

    #[test]
    fn test_missing_source_root() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir.path().join("nope"), WorkspaceSettings::default());
        let entry = PlatformEntry::new("linux/amd64", "x86_64");
        let err = mgr.prepare(&entry, &DeclaredOutputs::none()).unwrap_err();
        assert!(matches!(err, WorkspaceError::MissingSource(_)));
    }

    #[test]
    fn test_settings_defaults_from_empty_table() {
        let settings: WorkspaceSettings = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(settings, WorkspaceSettings::default());
        assert!(settings.isolate);
        assert_eq!(settings.keep, KeepPolicy::Failed);
    }
}
