//! Exclusion rules for workspace copies

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Patterns never copied into an isolated workspace
const DEFAULT_EXCLUDES: &[&str] = &[".crossbuild", ".crossbuild/**"];

#[derive(Debug, thiserror::Error)]
pub enum ExcludeError {
    #[error("invalid exclude pattern `{pattern}`: {source}")]
    GlobError {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// Compiled exclusion globs matched against workspace-relative paths
#[derive(Debug, Clone)]
pub struct ExcludeRules {
    glob_set: GlobSet,
    patterns: Vec<String>,
}

impl ExcludeRules {
    /// Default exclusions plus `patterns`
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ExcludeError> {
        let mut builder = GlobSetBuilder::new();
        let mut all = Vec::new();

        let defaults = DEFAULT_EXCLUDES.iter().map(|p| p.to_string());
        let extra = patterns.iter().map(|p| p.as_ref().trim().to_string());
        for pattern in defaults.chain(extra).filter(|p| !p.is_empty()) {
            let glob = Glob::new(&pattern).map_err(|source| ExcludeError::GlobError {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
            all.push(pattern);
        }

        let glob_set = builder.build().map_err(|source| ExcludeError::GlobError {
            pattern: all.join(","),
            source,
        })?;

        Ok(Self {
            glob_set,
            patterns: all,
        })
    }

    pub fn is_excluded(&self, rel_path: &Path) -> bool {
        let path_str = rel_path.to_string_lossy();
        self.glob_set.is_match(path_str.as_ref())
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}
