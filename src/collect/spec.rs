//! Declared build outputs
//!
//! An [`ArtifactSpec`] is an ordered list of rules. Each rule's `pattern`
//! is a glob relative to the workspace root (`*` stays within one path
//! segment, `**` crosses segments). `{arch}`, `{platform_family}` and
//! `{platform_slug}` are substituted per entry in `pattern`, `dest` and
//! `rename`.

use std::path::{Component, Path};

use globset::{Glob, GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};

use super::CollectError;
use crate::matrix::PlatformEntry;

/// One declared output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRule {
    pub pattern: String,
    /// Directory inside the bundle; empty means the bundle root
    #[serde(default)]
    pub dest: String,
    /// New file name for a single match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl ArtifactRule {
    /// Required rule staged at the bundle root
    pub fn required(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            dest: String::new(),
            rename: None,
            required: true,
        }
    }

    pub fn optional(pattern: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(pattern)
        }
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = dest.into();
        self
    }

    pub fn with_rename(mut self, rename: impl Into<String>) -> Self {
        self.rename = Some(rename.into());
        self
    }

    /// Pattern with placeholders substituted and `.` segments dropped
    pub fn resolved_pattern(&self, entry: &PlatformEntry) -> String {
        normalize_rel(&expand_placeholders(&self.pattern, entry))
    }

    pub fn resolved_dest(&self, entry: &PlatformEntry) -> String {
        normalize_rel(&expand_placeholders(&self.dest, entry))
    }

    pub fn resolved_rename(&self, entry: &PlatformEntry) -> Option<String> {
        self.rename.as_deref().map(|r| expand_placeholders(r, entry))
    }

    /// Compile the resolved pattern for `entry`
    pub fn matcher(&self, entry: &PlatformEntry) -> Result<GlobMatcher, CollectError> {
        let pattern = self.resolved_pattern(entry);
        compile(&pattern)
    }

    fn validate(&self) -> Result<(), CollectError> {
        let invalid = |reason: &str| CollectError::InvalidPattern {
            pattern: self.pattern.clone(),
            reason: reason.to_string(),
        };

        if normalize_rel(self.pattern.trim()).is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if !is_contained(&self.pattern) {
            return Err(invalid("pattern must be relative and stay inside the workspace"));
        }
        if !self.dest.is_empty() && !is_contained(&self.dest) {
            return Err(invalid("dest must be relative and stay inside the bundle"));
        }
        if let Some(rename) = &self.rename {
            if rename.is_empty() || rename.contains('/') || rename == "." || rename == ".." {
                return Err(invalid("rename must be a plain file name"));
            }
        }

        let sample = PlatformEntry::new("linux/amd64", "x86_64");
        compile(&self.resolved_pattern(&sample)).map(|_| ())
    }
}

fn compile(pattern: &str) -> Result<GlobMatcher, CollectError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g: Glob| g.compile_matcher())
        .map_err(|e| CollectError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.kind().to_string(),
        })
}

fn is_contained(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// `./a//b` -> `a/b`
fn normalize_rel(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Substitute `{arch}`, `{platform_family}` and `{platform_slug}`
pub fn expand_placeholders(template: &str, entry: &PlatformEntry) -> String {
    template
        .replace("{arch}", &entry.arch)
        .replace("{platform_family}", entry.platform_family())
        .replace("{platform_slug}", &entry.platform_slug())
}

/// Validated, ordered rule list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSpec {
    rules: Vec<ArtifactRule>,
}

impl ArtifactSpec {
    pub fn new(rules: Vec<ArtifactRule>) -> Result<Self, CollectError> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[ArtifactRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Matchers for every rule, resolved for `entry`
    pub fn declared_outputs(&self, entry: &PlatformEntry) -> Result<DeclaredOutputs, CollectError> {
        let matchers = self
            .rules
            .iter()
            .map(|r| r.matcher(entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DeclaredOutputs { matchers })
    }
}

/// Workspace-relative paths an entry's build is expected to produce.
///
/// Anything matching is treated as a build output and never carried into
/// a workspace from before the build.
#[derive(Debug, Clone, Default)]
pub struct DeclaredOutputs {
    matchers: Vec<GlobMatcher>,
}

impl DeclaredOutputs {
    /// Nothing declared
    pub fn none() -> Self {
        Self::default()
    }

    /// `rel` is a `/`-separated path relative to the workspace root
    pub fn is_match(&self, rel: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        let entry = PlatformEntry::new("linux/arm/v7", "armv7");
        assert_eq!(
            expand_placeholders("dist/{arch}/{platform_family}/{platform_slug}", &entry),
            "dist/armv7/linux/linux-arm-v7"
        );
        let rule = ArtifactRule::required("target/{arch}/app.deb")
            .with_dest("pkg/{platform_family}")
            .with_rename("app-{arch}.deb");
        assert_eq!(rule.resolved_dest(&entry), "pkg/linux");
        assert_eq!(rule.resolved_rename(&entry).as_deref(), Some("app-armv7.deb"));
    }

    #[test]
    fn test_star_does_not_cross_segments() {
        let entry = PlatformEntry::new("linux/amd64", "x86_64");
        let m = ArtifactRule::required("target/*.deb").matcher(&entry).unwrap();
        assert!(m.is_match("target/app.deb"));
        assert!(!m.is_match("target/debian/app.deb"));

        let m = ArtifactRule::required("target/**/*.deb").matcher(&entry).unwrap();
        assert!(m.is_match("target/debian/app.deb"));
    }

    #[test]
    fn test_dot_segments_normalized() {
        let entry = PlatformEntry::new("linux/amd64", "x86_64");
        let rule = ArtifactRule::required("./target/{arch}/./app").with_dest("./pkg/");
        assert_eq!(rule.resolved_pattern(&entry), "target/x86_64/app");
        assert_eq!(rule.resolved_dest(&entry), "pkg");
        assert!(rule.matcher(&entry).unwrap().is_match("target/x86_64/app"));

        let err = ArtifactSpec::new(vec![ArtifactRule::required("./")]).unwrap_err();
        assert!(matches!(err, CollectError::InvalidPattern { .. }));
    }

    #[test]
    fn test_declared_outputs() {
        let entry = PlatformEntry::new("linux/arm64", "aarch64");
        let spec = ArtifactSpec::new(vec![
            ArtifactRule::required("./target/{arch}/app"),
            ArtifactRule::optional("i18n/locale"),
        ])
        .unwrap();
        let outputs = spec.declared_outputs(&entry).unwrap();
        assert!(outputs.is_match("target/aarch64/app"));
        assert!(outputs.is_match("i18n/locale"));
        assert!(!outputs.is_match("target/x86_64/app"));
        assert!(!outputs.is_match("src/main.c"));
        assert!(!DeclaredOutputs::none().is_match("target/aarch64/app"));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        for pattern in ["../outside", "/etc/passwd", "a/../../b"] {
            let err = ArtifactSpec::new(vec![ArtifactRule::required(pattern)]).unwrap_err();
            assert!(matches!(err, CollectError::InvalidPattern { .. }), "{pattern}");
        }
        let err =
            ArtifactSpec::new(vec![ArtifactRule::required("a").with_dest("../up")]).unwrap_err();
        assert!(matches!(err, CollectError::InvalidPattern { .. }));
    }

    #[test]
    fn test_rejects_bad_glob_and_rename() {
        let err = ArtifactSpec::new(vec![ArtifactRule::required("target/[abc")]).unwrap_err();
        assert!(matches!(err, CollectError::InvalidPattern { .. }));

        let err =
            ArtifactSpec::new(vec![ArtifactRule::required("a").with_rename("x/y")]).unwrap_err();
        assert!(matches!(err, CollectError::InvalidPattern { .. }));
    }

    #[test]
    fn test_deserialize_defaults() {
        let rule: ArtifactRule =
            serde_json::from_value(serde_json::json!({"pattern": "i18n/locale"})).unwrap();
        assert!(rule.required);
        assert_eq!(rule.dest, "");
        assert_eq!(rule.rename, None);
    }
}
