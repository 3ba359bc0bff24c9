//! Configuration
//!
//! One YAML document configures the whole installation. Durations accept
//! either a bare number (nanoseconds) or a suffixed string such as `10m`
//! or `1h30m`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {0}")]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("cannot parse config: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A duration that deserializes from nanoseconds or a suffixed string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KDuration(pub Duration);

impl From<KDuration> for Duration {
    fn from(d: KDuration) -> Duration {
        d.0
    }
}

impl Serialize for KDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(self.0))
    }
}

impl<'de> Deserialize<'de> for KDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Nanos(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Nanos(n) => Ok(KDuration(Duration::from_nanos(n))),
            Raw::Text(s) => parse_duration(&s)
                .map(KDuration)
                .map_err(|e| D::Error::custom(format!("invalid duration {s:?}: {e}"))),
        }
    }
}

/// Parses a sequence of `<number><unit>` segments, units `h m s ms`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("unexpected {c:?}"));
        }
        let value: u64 = digits.parse().map_err(|_| "number too large".to_string())?;
        digits.clear();

        let unit = match c {
            'h' => Duration::from_secs(3600),
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(1)
            }
            'm' => Duration::from_secs(60),
            's' => Duration::from_secs(1),
            other => return Err(format!("unknown unit {other:?}")),
        };
        total += unit * value as u32;
    }
    if !digits.is_empty() {
        return Err("missing unit".to_string());
    }
    Ok(total)
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs % 3600 == 0 && secs > 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 && secs > 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// URL this installation is reachable on.
    #[serde(default)]
    pub base_url: String,

    /// Node location under which per-job workspaces live.
    pub workspace_node_path_prefix: String,

    pub service: ServiceSection,

    /// Path to a kubeconfig file; empty selects the default resolution
    /// (in-cluster or ~/.kube/config).
    #[serde(default)]
    pub kubeconfig: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    pub executor: ExecutorSection,

    pub storage: StorageSection,

    #[serde(default)]
    pub plugins: Vec<PluginRegistration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSection {
    pub web_port: u16,
    pub grpc_port: u16,
    #[serde(default)]
    pub job_spec_repos: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorSection {
    /// Keeps the historical (misspelled) key; user configs depend on it.
    #[serde(rename = "preperationTimeout")]
    pub preparation_timeout: KDuration,
    pub total_timeout: KDuration,
    #[serde(default)]
    pub event_trace_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSection {
    pub logs_path: PathBuf,
    pub jobs_connection_string: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRegistration {
    pub name: String,
    #[serde(rename = "type")]
    pub types: Vec<PluginType>,
    #[serde(default)]
    pub config: serde_yaml::Value,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Integration,
    Repository,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.total_timeout.0 < self.executor.preparation_timeout.0 {
            return Err(ConfigError::Invalid(
                "totalTimeout must be greater than preperationTimeout".to_string(),
            ));
        }
        if self.workspace_node_path_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "workspaceNodePathPrefix is required".to_string(),
            ));
        }
        if self.storage.jobs_connection_string.is_empty() {
            return Err(ConfigError::Invalid(
                "storage.jobsConnectionString is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn durations_parse_suffixed_strings() {
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
    }

    #[test]
    fn a_full_config_document_parses() {
        let yaml = r#"
baseURL: https://kiln.example.com
workspaceNodePathPrefix: /mnt/kiln/workspaces
service:
  webPort: 8080
  grpcPort: 7777
namespace: builds
executor:
  preperationTimeout: 10m
  totalTimeout: 1h
storage:
  logsPath: /var/lib/kiln/logs
  jobsConnectionString: postgres://kiln@localhost/kiln
plugins:
- name: github
  type: [repository]
  command: ["kiln-plugin-github"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.namespace, "builds");
        assert_eq!(
            config.executor.preparation_timeout.0,
            Duration::from_secs(600)
        );
        assert_eq!(config.plugins[0].types, vec![PluginType::Repository]);
    }

    #[test]
    fn numeric_durations_are_nanoseconds() {
        let d: KDuration = serde_yaml::from_str("600000000000").unwrap();
        assert_eq!(d.0, Duration::from_secs(600));
    }

    #[test]
    fn inverted_timeouts_are_rejected() {
        let yaml = r#"
workspaceNodePathPrefix: /mnt/kiln
service: { webPort: 1, grpcPort: 2 }
executor: { preperationTimeout: 1h, totalTimeout: 10m }
storage: { logsPath: /tmp/logs, jobsConnectionString: postgres://x }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
