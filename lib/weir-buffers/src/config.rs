//! Queue configuration.
//!
//! Deserialization is hand-rolled because the valid field set depends on
//! the queue kind: disk queues require a file prefix, direct queues take no
//! sizing at all, and watermarks default to fractions of `max_size` when
//! not given explicitly.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{de, Deserialize, Deserializer, Serialize};
use snafu::Snafu;

use crate::queue::{Consumer, Queue, QueueError, QueueSettings};
use crate::Bufferable;

pub use crate::queue::QueueKind;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("watermarks must satisfy low <= high <= max_size"))]
    InvalidWatermarks,
    #[snafu(display("discard watermark must not exceed max_size"))]
    InvalidDiscardWatermark,
    #[snafu(display("error building queue: {source}"))]
    Build { source: QueueError },
}

const ALL_FIELDS: [&str; 14] = [
    "type",
    "max_size",
    "num_workers",
    "high_watermark",
    "low_watermark",
    "discard_watermark",
    "discard_severity",
    "enqueue_timeout_ms",
    "shutdown_timeout_ms",
    "shutdown_immediate_timeout_ms",
    "worker_idle_timeout_ms",
    "persist_every",
    "file_prefix",
    "max_file_size",
];

/// Queue tuning, as it appears under a component's `queue` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueConfig {
    #[serde(rename = "type")]
    pub kind: QueueKind,
    pub max_size: usize,
    pub num_workers: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub discard_watermark: usize,
    pub discard_severity: u8,
    pub enqueue_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub shutdown_immediate_timeout_ms: u64,
    pub worker_idle_timeout_ms: u64,
    pub persist_every: u32,
    pub file_prefix: Option<String>,
    pub max_file_size: u64,
}

pub const fn default_max_size() -> usize {
    10_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        let max = default_max_size();
        QueueConfig {
            kind: QueueKind::FixedArray,
            max_size: max,
            num_workers: 1,
            high_watermark: max / 10 * 9,
            low_watermark: max / 10 * 3,
            discard_watermark: 0,
            discard_severity: 8,
            enqueue_timeout_ms: 2_000,
            shutdown_timeout_ms: 1_500,
            shutdown_immediate_timeout_ms: 1_000,
            worker_idle_timeout_ms: 60_000,
            persist_every: 0,
            file_prefix: None,
            max_file_size: 1024 * 1024,
        }
    }
}

struct QueueConfigVisitor;

impl QueueConfigVisitor {
    fn visit_map_impl<'de, A>(mut map: A) -> Result<QueueConfig, A::Error>
    where
        A: de::MapAccess<'de>,
    {
        let mut kind: Option<QueueKind> = None;
        let mut max_size: Option<usize> = None;
        let mut num_workers: Option<usize> = None;
        let mut high_watermark: Option<usize> = None;
        let mut low_watermark: Option<usize> = None;
        let mut discard_watermark: Option<usize> = None;
        let mut discard_severity: Option<u8> = None;
        let mut enqueue_timeout_ms: Option<u64> = None;
        let mut shutdown_timeout_ms: Option<u64> = None;
        let mut shutdown_immediate_timeout_ms: Option<u64> = None;
        let mut worker_idle_timeout_ms: Option<u64> = None;
        let mut persist_every: Option<u32> = None;
        let mut file_prefix: Option<String> = None;
        let mut max_file_size: Option<u64> = None;

        macro_rules! set_field {
            ($field:ident, $name:literal) => {{
                if $field.is_some() {
                    return Err(de::Error::duplicate_field($name));
                }
                $field = Some(map.next_value()?);
            }};
        }

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "type" => set_field!(kind, "type"),
                "max_size" => set_field!(max_size, "max_size"),
                "num_workers" => set_field!(num_workers, "num_workers"),
                "high_watermark" => set_field!(high_watermark, "high_watermark"),
                "low_watermark" => set_field!(low_watermark, "low_watermark"),
                "discard_watermark" => set_field!(discard_watermark, "discard_watermark"),
                "discard_severity" => set_field!(discard_severity, "discard_severity"),
                "enqueue_timeout_ms" => set_field!(enqueue_timeout_ms, "enqueue_timeout_ms"),
                "shutdown_timeout_ms" => set_field!(shutdown_timeout_ms, "shutdown_timeout_ms"),
                "shutdown_immediate_timeout_ms" => {
                    set_field!(shutdown_immediate_timeout_ms, "shutdown_immediate_timeout_ms")
                }
                "worker_idle_timeout_ms" => {
                    set_field!(worker_idle_timeout_ms, "worker_idle_timeout_ms")
                }
                "persist_every" => set_field!(persist_every, "persist_every"),
                "file_prefix" => set_field!(file_prefix, "file_prefix"),
                "max_file_size" => set_field!(max_file_size, "max_file_size"),
                other => {
                    return Err(de::Error::unknown_field(other, &ALL_FIELDS));
                }
            }
        }

        let kind = kind.unwrap_or(QueueKind::FixedArray);
        let defaults = QueueConfig::default();

        match kind {
            QueueKind::Disk => {
                if file_prefix.is_none() {
                    return Err(de::Error::missing_field("file_prefix"));
                }
            }
            QueueKind::Direct => {
                // Direct queues neither buffer nor spill; sizing fields
                // make no sense for them.
                if max_size.is_some() || high_watermark.is_some() || file_prefix.is_some() {
                    return Err(de::Error::unknown_field("max_size", &["type"]));
                }
            }
            QueueKind::FixedArray | QueueKind::LinkedList => {}
        }

        let max_size = max_size.unwrap_or(defaults.max_size);
        if max_size == 0 && kind.is_memory() {
            return Err(de::Error::custom("max_size must be greater than zero"));
        }

        Ok(QueueConfig {
            kind,
            max_size,
            num_workers: num_workers.unwrap_or(defaults.num_workers),
            high_watermark: high_watermark.unwrap_or(max_size / 10 * 9),
            low_watermark: low_watermark.unwrap_or(max_size / 10 * 3),
            discard_watermark: discard_watermark.unwrap_or(0),
            discard_severity: discard_severity.unwrap_or(8),
            enqueue_timeout_ms: enqueue_timeout_ms.unwrap_or(defaults.enqueue_timeout_ms),
            shutdown_timeout_ms: shutdown_timeout_ms.unwrap_or(defaults.shutdown_timeout_ms),
            shutdown_immediate_timeout_ms: shutdown_immediate_timeout_ms
                .unwrap_or(defaults.shutdown_immediate_timeout_ms),
            worker_idle_timeout_ms: worker_idle_timeout_ms
                .unwrap_or(defaults.worker_idle_timeout_ms),
            persist_every: persist_every.unwrap_or(0),
            file_prefix,
            max_file_size: max_file_size.unwrap_or(defaults.max_file_size),
        })
    }
}

impl<'de> de::Visitor<'de> for QueueConfigVisitor {
    type Value = QueueConfig;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("struct QueueConfig")
    }

    fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
    where
        A: de::MapAccess<'de>,
    {
        QueueConfigVisitor::visit_map_impl(map)
    }
}

impl<'de> Deserialize<'de> for QueueConfig {
    fn deserialize<D>(deserializer: D) -> Result<QueueConfig, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(QueueConfigVisitor)
    }
}

/// A timeout of zero means "wait forever".
fn ms_opt(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

impl QueueConfig {
    /// Converts to queue settings rooted at `dir`, validating watermark
    /// ordering.
    pub fn settings(&self, id: impl Into<String>, dir: &Path) -> Result<QueueSettings, ConfigError> {
        if self.kind.is_memory()
            && !(self.low_watermark <= self.high_watermark && self.high_watermark <= self.max_size)
        {
            return Err(ConfigError::InvalidWatermarks);
        }
        if self.discard_watermark > self.max_size && self.max_size > 0 {
            return Err(ConfigError::InvalidDiscardWatermark);
        }
        let mut settings = QueueSettings::new(id, self.kind);
        settings.max_size = self.max_size;
        settings.num_workers = self.num_workers;
        settings.high_watermark = self.high_watermark;
        settings.low_watermark = self.low_watermark;
        settings.discard_watermark = self.discard_watermark;
        settings.discard_severity = self.discard_severity;
        settings.enqueue_timeout = ms_opt(self.enqueue_timeout_ms);
        settings.shutdown_timeout = ms_opt(self.shutdown_timeout_ms);
        settings.shutdown_immediate_timeout = ms_opt(self.shutdown_immediate_timeout_ms);
        settings.worker_idle_timeout = ms_opt(self.worker_idle_timeout_ms);
        settings.persist_every = self.persist_every;
        settings.dir = dir.to_path_buf();
        settings.file_prefix = self.file_prefix.clone();
        settings.max_file_size = self.max_file_size;
        Ok(settings)
    }

    /// Builds and returns the queue (not yet started).
    pub fn build<T: Bufferable>(
        &self,
        id: impl Into<String>,
        dir: &Path,
        consumer: Consumer<T>,
    ) -> Result<Queue<T>, ConfigError> {
        let settings = self.settings(id, dir)?;
        Queue::new(settings, consumer).map_err(|source| ConfigError::Build { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Result<QueueConfig, toml::de::Error> {
        toml::from_str(source)
    }

    #[test]
    fn parse_empty_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.kind, QueueKind::FixedArray);
        assert_eq!(config.max_size, 10_000);
        assert_eq!(config.high_watermark, 9_000);
        assert_eq!(config.low_watermark, 3_000);
        assert_eq!(config.discard_severity, 8);
    }

    #[test]
    fn parse_unknown_field_is_rejected() {
        assert!(parse("frobnicate = 3").is_err());
    }

    #[test]
    fn parse_duplicate_field_is_rejected() {
        assert!(parse("max_size = 10\nmax_size = 20").is_err());
    }

    #[test]
    fn watermark_defaults_follow_max_size() {
        let config = parse("max_size = 100").unwrap();
        assert_eq!(config.high_watermark, 90);
        assert_eq!(config.low_watermark, 30);
    }

    #[test]
    fn disk_requires_file_prefix() {
        assert!(parse("type = \"disk\"").is_err());
        let config = parse("type = \"disk\"\nfile_prefix = \"main\"").unwrap();
        assert_eq!(config.kind, QueueKind::Disk);
        assert_eq!(config.file_prefix.as_deref(), Some("main"));
    }

    #[test]
    fn direct_rejects_sizing() {
        assert!(parse("type = \"direct\"\nmax_size = 10").is_err());
        let config = parse("type = \"direct\"").unwrap();
        assert_eq!(config.kind, QueueKind::Direct);
    }

    #[test]
    fn invalid_watermark_order_fails_settings() {
        let mut config = QueueConfig::default();
        config.low_watermark = 9_500;
        let err = config.settings("q", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWatermarks));
    }

    #[test]
    fn zero_timeout_means_forever() {
        let config = parse("enqueue_timeout_ms = 0").unwrap();
        let settings = config.settings("q", Path::new(".")).unwrap();
        assert!(settings.enqueue_timeout.is_none());
    }
}
