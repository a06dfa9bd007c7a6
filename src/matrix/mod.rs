//! Platform matrix
//!
//! The matrix is the ordered list of (platform, arch) pairs a run builds
//! for. Each entry carries an explicit `enabled` flag so future platforms
//! can be declared without being built.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from matrix construction
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatrixError {
    #[error("duplicate platform in matrix: {0}")]
    DuplicatePlatform(String),

    #[error("invalid platform tag `{0}` (expected os/arch[/variant])")]
    InvalidPlatform(String),

    #[error("matrix entry for {0} has an empty arch")]
    EmptyArch(String),

    #[error("platform not declared in matrix: {0}")]
    UnknownPlatform(String),

    #[error("platforms {first} and {second} both produce bundle `{name}`")]
    BundleNameCollision {
        name: String,
        first: String,
        second: String,
    },

    #[error("platforms {first} and {second} share the workspace slug `{slug}`")]
    SlugCollision {
        slug: String,
        first: String,
        second: String,
    },
}

/// One (platform, arch) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformEntry {
    /// Container platform constraint, e.g. `linux/arm64`
    pub platform: String,
    /// CPU architecture tag used in bundle names, e.g. `aarch64`
    pub arch: String,
    /// Inactive entries are declared but never built
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl PlatformEntry {
    pub fn new(platform: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            arch: arch.into(),
            enabled: true,
        }
    }

    /// Same entry with `enabled = false`
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// OS segment of the platform tag (`linux` for `linux/arm64`)
    pub fn platform_family(&self) -> &str {
        self.platform.split('/').next().unwrap_or(&self.platform)
    }

    /// Default bundle name, `{arch}-{platform_family}`
    pub fn bundle_stem(&self) -> String {
        format!("{}-{}", self.arch, self.platform_family())
    }

    /// Filesystem- and container-name-safe form of the platform tag
    pub fn platform_slug(&self) -> String {
        self.platform
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect()
    }

    /// Arch normalized to the names `std::env::consts::ARCH` uses
    pub fn normalized_arch(&self) -> String {
        normalize_arch(&self.arch)
    }

    /// True when this entry's arch differs from `host_arch` after normalization
    pub fn is_foreign_to(&self, host_arch: &str) -> bool {
        self.normalized_arch() != normalize_arch(host_arch)
    }

    fn validate(&self) -> Result<(), MatrixError> {
        let re = regex_lite::Regex::new(r"^[a-z0-9]+/[a-z0-9_]+(/[a-z0-9]+)?$")
            .map_err(|_| MatrixError::InvalidPlatform(self.platform.clone()))?;
        if !re.is_match(&self.platform) {
            return Err(MatrixError::InvalidPlatform(self.platform.clone()));
        }
        if self.arch.trim().is_empty() {
            return Err(MatrixError::EmptyArch(self.platform.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for PlatformEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.platform, self.arch)
    }
}

/// Map common arch aliases onto a single spelling
pub fn normalize_arch(arch: &str) -> String {
    match arch.to_ascii_lowercase().as_str() {
        "amd64" | "x86_64" | "x86-64" | "x64" => "x86_64".to_string(),
        "arm64" | "aarch64" | "arm64/v8" => "aarch64".to_string(),
        "armhf" | "armv7" | "armv7l" | "arm" | "arm/v7" => "arm".to_string(),
        "386" | "i386" | "i686" | "x86" => "x86".to_string(),
        "ppc64le" | "powerpc64le" => "powerpc64le".to_string(),
        other => other.to_string(),
    }
}

/// Arch of the machine running the orchestrator
pub fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

/// Ordered, validated set of platform entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformMatrix {
    declared: Vec<PlatformEntry>,
}

impl PlatformMatrix {
    /// Build a matrix, rejecting duplicate or malformed platform tags.
    ///
    /// Platform and slug uniqueness cover disabled entries too. Bundle
    /// names must be distinct among enabled entries.
    pub fn new(entries: Vec<PlatformEntry>) -> Result<Self, MatrixError> {
        let mut seen = HashSet::new();
        let mut slugs: HashMap<String, &str> = HashMap::new();
        let mut bundles: HashMap<String, &str> = HashMap::new();
        for entry in &entries {
            entry.validate()?;
            if !seen.insert(entry.platform.clone()) {
                return Err(MatrixError::DuplicatePlatform(entry.platform.clone()));
            }
            let slug = entry.platform_slug();
            if let Some(first) = slugs.insert(slug.clone(), &entry.platform) {
                return Err(MatrixError::SlugCollision {
                    slug,
                    first: first.to_string(),
                    second: entry.platform.clone(),
                });
            }
            if entry.enabled {
                let name = entry.bundle_stem();
                if let Some(first) = bundles.insert(name.clone(), &entry.platform) {
                    return Err(MatrixError::BundleNameCollision {
                        name,
                        first: first.to_string(),
                        second: entry.platform.clone(),
                    });
                }
            }
        }
        Ok(Self { declared: entries })
    }

    /// Empty matrix
    pub fn empty() -> Self {
        Self::default()
    }

    /// Enabled entries in declaration order
    pub fn entries(&self) -> impl Iterator<Item = &PlatformEntry> {
        self.declared.iter().filter(|e| self.is_enabled(e))
    }

    /// Every declared entry, enabled or not
    pub fn declared(&self) -> &[PlatformEntry] {
        &self.declared
    }

    pub fn is_enabled(&self, entry: &PlatformEntry) -> bool {
        entry.enabled
    }

    /// Number of enabled entries
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restrict the matrix to the given platforms.
    ///
    /// Entries outside `platforms` are disabled. Naming a platform that is
    /// not declared is an error; naming a declared-but-disabled one does not
    /// enable it.
    pub fn filter(&self, platforms: &[String]) -> Result<Self, MatrixError> {
        for platform in platforms {
            if !self.declared.iter().any(|e| &e.platform == platform) {
                return Err(MatrixError::UnknownPlatform(platform.clone()));
            }
        }
        let declared = self
            .declared
            .iter()
            .cloned()
            .map(|mut e| {
                if !platforms.contains(&e.platform) {
                    e.enabled = false;
                }
                e
            })
            .collect();
        Ok(Self { declared })
    }

    /// Distinct arches of enabled entries, in first-seen order
    pub fn enabled_arches(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.entries()
            .map(|e| e.arch.clone())
            .filter(|a| seen.insert(a.clone()))
            .collect()
    }
}
