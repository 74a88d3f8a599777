//! Daemon configuration: one TOML file describing sources, rule sets, and
//! actions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use weir_buffers::QueueConfig;

use crate::ruleset::FilterConfig;
use crate::sources::{dtls::DtlsSourceConfig, udp::UdpSourceConfig, unix::UnixSourceConfig};

#[derive(Debug, Snafu)]
pub enum ConfigFileError {
    #[snafu(display("could not read {}: {source}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not parse {}: {source}", path.display()))]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("default ruleset {name} is not defined"))]
    MissingDefaultRuleset { name: String },
}

fn default_workdir() -> PathBuf {
    PathBuf::from("/var/spool/weir")
}

fn default_ruleset_name() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// All disk-queue files live here.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    #[serde(default = "default_ruleset_name")]
    pub default_ruleset: String,
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
    pub rulesets: HashMap<String, RulesetConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SourceConfig {
    Udp(UdpSourceConfig),
    Unix(UnixSourceConfig),
    Dtls(DtlsSourceConfig),
}

/// One parser in a rule set's chain: its name plus free-form options the
/// parser itself validates.
#[derive(Debug, Deserialize)]
pub struct ParserBinding {
    pub name: String,
    #[serde(flatten)]
    pub params: toml::Table,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesetConfig {
    #[serde(default)]
    pub parsers: Vec<ParserBinding>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Target path, for outputs that write files.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let text = std::fs::read_to_string(path).context(ReadFileSnafu {
            path: path.to_path_buf(),
        })?;
        let config: DaemonConfig = toml::from_str(&text).context(ParseFileSnafu {
            path: path.to_path_buf(),
        })?;
        config.validate()
    }

    pub fn validate(self) -> Result<Self, ConfigFileError> {
        if !self.rulesets.contains_key(&self.default_ruleset) {
            return Err(ConfigFileError::MissingDefaultRuleset {
                name: self.default_ruleset.clone(),
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
workdir = "/tmp/weir-test"

[sources.net]
type = "udp"
address = "127.0.0.1:5514"
ruleset = "remote"

[sources.local]
type = "unix"
path = "/tmp/weir-test/log.sock"
use_creds = true

[rulesets.default]
[[rulesets.default.actions]]
name = "everything"
type = "file"
path = "/tmp/weir-test/all.log"

[rulesets.remote]
parsers = [
  { name = "cisconames" },
  { name = "rfc3164", "detect.headerless" = true, "headerless.tag" = "json" },
]

[rulesets.remote.queue]
type = "linked_list"
max_size = 5000

[[rulesets.remote.actions]]
name = "errors"
type = "file"
path = "/tmp/weir-test/errors.log"
filter = { max_severity = 3 }

[[rulesets.remote.actions]]
name = "archive"
type = "null"

[rulesets.remote.actions.queue]
type = "fixed_array"
max_size = 100
file_prefix = "archive"
"#;

    #[test]
    fn sample_config_parses() {
        let config: DaemonConfig = toml::from_str(SAMPLE).unwrap();
        let config = config.validate().unwrap();
        assert_eq!(config.sources.len(), 2);
        let remote = &config.rulesets["remote"];
        assert_eq!(remote.parsers.len(), 2);
        assert_eq!(remote.parsers[1].name, "rfc3164");
        assert_eq!(remote.queue.max_size, 5000);
        assert_eq!(remote.actions.len(), 2);
        assert_eq!(remote.actions[0].filter.max_severity, Some(3));
        assert_eq!(
            remote.actions[1].queue.file_prefix.as_deref(),
            Some("archive")
        );
    }

    #[test]
    fn missing_default_ruleset_is_an_error() {
        let config: DaemonConfig = toml::from_str(
            r#"
default_ruleset = "nope"
[rulesets.other]
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_top_level_keys_are_rejected() {
        assert!(toml::from_str::<DaemonConfig>("surprise = 1\n[rulesets.default]\n").is_err());
    }
}
