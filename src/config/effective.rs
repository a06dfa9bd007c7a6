//! Effective configuration with provenance
//!
//! Records the merged configuration and every contributing source. The
//! recorded copy has secret-like values redacted; typed settings are built
//! from the unredacted merge.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;
use super::settings::PipelineSettings;
use super::ConfigError;

pub const SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_ID: &str = "crossbuild/effective_config@1";

pub const EFFECTIVE_CONFIG_FILE: &str = "effective_config.json";

/// Repo config location relative to the working directory
pub const REPO_CONFIG_PATH: &str = ".crossbuild/pipeline.toml";

/// `~/.config/crossbuild/config.toml`, if `HOME` is set
pub fn default_host_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/crossbuild/config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Repo,
    Cli,
}

/// A contributing config source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 of the raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub schema_version: u32,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Merged configuration, secrets redacted
    pub config: Value,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,

    /// Redacted key paths
    pub redactions: Vec<String>,

    #[serde(skip)]
    resolved: Value,
}

/// Keys that contain secrets and should be redacted
const SECRET_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "private_key",
    "api_key",
    "credential",
];

impl EffectiveConfig {
    /// Merge builtin defaults, host file, repo file and CLI overrides.
    ///
    /// Missing files are skipped.
    pub fn build(
        host_config_path: Option<&Path>,
        repo_config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        for (origin, path) in [
            (ConfigOrigin::Host, host_config_path),
            (ConfigOrigin::Repo, repo_config_path),
        ] {
            let Some(path) = path.filter(|p| p.exists()) else {
                continue;
            };
            let (value, digest) = Self::load_toml_file(path)?;
            debug!(origin = ?origin, path = %path.display(), "loaded config layer");
            layers.push(value);
            sources.push(ConfigSource {
                origin,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let resolved = merge_layers(layers);
        let mut config = resolved.clone();
        let redactions = Self::redact_secrets(&mut config);

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            run_id: None,
            config,
            sources,
            redactions,
            resolved,
        })
    }

    /// Typed, validated settings; relative paths are resolved against `base`
    pub fn settings(&self, base: &Path) -> Result<PipelineSettings, ConfigError> {
        let settings: PipelineSettings = serde_json::from_value(self.resolved.clone())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let settings = settings.resolve_paths(base);
        settings.validate()?;
        Ok(settings)
    }

    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path).map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        let digest = hex::encode(Sha256::digest(&bytes));

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("{}: invalid UTF-8: {}", path.display(), e)))?;

        let toml_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;

        Ok((Self::toml_to_json(toml_value), digest))
    }

    fn toml_to_json(toml: toml::Value) -> Value {
        match toml {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Number(i.into()),
            toml::Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::String(dt.to_string()),
            toml::Value::Array(arr) => Value::Array(arr.into_iter().map(Self::toml_to_json).collect()),
            toml::Value::Table(table) => Value::Object(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Self::toml_to_json(v)))
                    .collect(),
            ),
        }
    }

    fn redact_secrets(value: &mut Value) -> Vec<String> {
        let mut redactions = Vec::new();
        Self::redact_recursive(value, String::new(), &mut redactions);
        redactions
    }

    fn redact_recursive(value: &mut Value, path: String, redactions: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let current_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", path, key)
                    };
                    let key_lower = key.to_lowercase();
                    let is_secret = SECRET_KEYS.iter().any(|s| key_lower.contains(s));

                    if is_secret && !val.is_object() && !val.is_array() {
                        *val = Value::String("[REDACTED]".to_string());
                        redactions.push(current_path);
                    } else {
                        Self::redact_recursive(val, current_path, redactions);
                    }
                }
            }
            Value::Array(arr) => {
                for (i, val) in arr.iter_mut().enumerate() {
                    Self::redact_recursive(val, format!("{}[{}]", path, i), redactions);
                }
            }
            _ => {}
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("JSON serialization failed: {}", e),
            )
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)
    }

    /// Recorded value by dot-separated path
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.config;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(|v| v.as_u64())
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(|v| v.as_bool())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toml_file(contents: &str) -> NamedTempFile {
        let mut temp = NamedTempFile::new().unwrap();
        write!(temp, "{}", contents).unwrap();
        temp
    }

    #[test]
    fn test_build_with_defaults_only() {
        let config = EffectiveConfig::build(None, None, None).unwrap();
        assert_eq!(config.schema_id, SCHEMA_ID);
        assert_eq!(config.get_u64("parallel"), Some(1));
        assert_eq!(config.get_str("runtime.program"), Some("docker"));
        assert_eq!(config.get_bool("workspace.isolate"), Some(true));
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_layers_and_provenance() {
        let host = toml_file("[runtime]\nprogram = \"podman\"\n");
        let repo = toml_file("image = \"build-env:1\"\nentrypoint = \"ci/build.sh\"\nparallel = 2\n");
        let cli = serde_json::json!({"parallel": 3});

        let config = EffectiveConfig::build(Some(host.path()), Some(repo.path()), Some(cli)).unwrap();

        assert_eq!(config.get_str("runtime.program"), Some("podman"));
        assert_eq!(config.get_str("image"), Some("build-env:1"));
        assert_eq!(config.get_u64("parallel"), Some(3));

        let origins: Vec<_> = config.sources.iter().map(|s| s.origin.clone()).collect();
        assert_eq!(
            origins,
            vec![ConfigOrigin::Builtin, ConfigOrigin::Host, ConfigOrigin::Repo, ConfigOrigin::Cli]
        );
        assert_eq!(config.sources[1].digest.as_ref().map(String::len), Some(64));
    }

    #[test]
    fn test_missing_file_skipped() {
        let config =
            EffectiveConfig::build(None, Some(Path::new("/nonexistent/pipeline.toml")), None).unwrap();
        assert_eq!(config.sources.len(), 1);
    }

    #[test]
    fn test_parse_error_names_file() {
        let bad = toml_file("image = [\n");
        let err = EffectiveConfig::build(None, Some(bad.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(ref m) if m.contains(&bad.path().display().to_string())));
    }

    #[test]
    fn test_secret_redacted_in_record_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = serde_json::json!({
            "image": "build-env:1",
            "entrypoint": "build.sh",
            "runtime": {"env": {"REGISTRY_TOKEN": "hunter2", "MODE": "release"}}
        });

        let config = EffectiveConfig::build(None, None, Some(cli)).unwrap();
        assert_eq!(config.get_str("runtime.env.REGISTRY_TOKEN"), Some("[REDACTED]"));
        assert_eq!(config.get_str("runtime.env.MODE"), Some("release"));
        assert!(config.redactions.contains(&"runtime.env.REGISTRY_TOKEN".to_string()));
        assert!(!config.to_json().unwrap().contains("hunter2"));

        let settings = config.settings(dir.path()).unwrap();
        assert_eq!(settings.runtime.env["REGISTRY_TOKEN"], "hunter2");
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run").join(EFFECTIVE_CONFIG_FILE);
        EffectiveConfig::build(None, None, None)
            .unwrap()
            .with_run_id("run1")
            .write_to_file(&path)
            .unwrap();
        let json = fs::read_to_string(&path).unwrap();
        assert!(json.contains(r#""run_id": "run1""#));
        assert!(!json.contains("resolved"));
    }
}
