//! Engine Configuration
//!
//! Typed configuration for every component. Loaded from an optional YAML
//! file; every section falls back to its `Default`.
//!
//! ```yaml
//! erasure:
//!   set_size: 6
//!   standard: "EC:2"
//!   reduced_redundancy: "EC:1"
//! registry:
//!   heartbeat_interval: 1s
//!   suspect_after_missed: 3
//!   dead_after: 30s
//! heal:
//!   scan_interval: 5m
//!   workers: 4
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{ErasureScheme, StorageClass};
use crate::error::{Error, Result};

// =============================================================================
// Root
// =============================================================================

/// Configuration of a storage engine instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub erasure: ErasureConfig,
    pub registry: RegistryConfig,
    pub write: WriteConfig,
    pub read: ReadConfig,
    pub metadata: MetadataConfig,
    pub heal: HealConfig,
    pub shard_store: ShardStoreConfig,
}

impl EngineConfig {
    /// Parse a YAML document and validate it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.erasure.validate()?;
        self.registry.validate()?;
        if self.heal.workers == 0 {
            return Err(Error::Config("heal.workers must be at least 1".to_string()));
        }
        if self.heal.queue_capacity == 0 {
            return Err(Error::Config(
                "heal.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.metadata.max_propose_attempts == 0 {
            return Err(Error::Config(
                "metadata.max_propose_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Erasure / Storage Classes
// =============================================================================

/// Erasure layout of new objects, per storage class.
///
/// `set_size` is the number of shards (k+m) of every object; each class
/// picks its parity count with the `EC:<parity>` notation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErasureConfig {
    pub set_size: usize,
    pub standard: Option<String>,
    pub reduced_redundancy: Option<String>,
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self {
            set_size: 6,
            standard: Some("EC:2".to_string()),
            reduced_redundancy: Some("EC:1".to_string()),
        }
    }
}

impl ErasureConfig {
    pub fn standard_parity(&self) -> Result<usize> {
        match &self.standard {
            Some(s) => parse_storage_class(s),
            None => Ok(default_parity_count(self.set_size)),
        }
    }

    pub fn reduced_redundancy_parity(&self) -> Result<usize> {
        match &self.reduced_redundancy {
            Some(s) => parse_storage_class(s),
            None => Ok(1),
        }
    }

    /// Scheme for a new object of the given class.
    pub fn scheme_for(&self, class: StorageClass) -> Result<ErasureScheme> {
        let parity = match class {
            StorageClass::Standard => self.standard_parity()?,
            StorageClass::ReducedRedundancy => self.reduced_redundancy_parity()?,
        };
        let scheme = ErasureScheme::new(self.set_size.saturating_sub(parity), parity);
        scheme.validate()?;
        Ok(scheme)
    }

    pub fn validate(&self) -> Result<()> {
        if self.set_size < 2 {
            return Err(Error::Config(format!(
                "erasure.set_size must be at least 2, got {}",
                self.set_size
            )));
        }
        let standard = self.standard_parity()?;
        let rrs = self.reduced_redundancy_parity()?;
        let max_parity = self.set_size / 2;

        for (name, parity) in [("standard", standard), ("reduced_redundancy", rrs)] {
            if parity == 0 {
                return Err(Error::Config(format!(
                    "{} parity must be at least 1",
                    name
                )));
            }
            if parity > max_parity {
                return Err(Error::Config(format!(
                    "{} parity {} exceeds half of set size {}",
                    name, parity, self.set_size
                )));
            }
        }
        if standard < rrs {
            return Err(Error::Config(format!(
                "standard parity {} is lower than reduced redundancy parity {}",
                standard, rrs
            )));
        }
        Ok(())
    }
}

/// Parse `EC:<parity>` into a parity count.
pub fn parse_storage_class(s: &str) -> Result<usize> {
    let s = s.trim();
    let parity = s
        .strip_prefix("EC:")
        .ok_or_else(|| Error::Config(format!("unsupported storage class format: '{}'", s)))?;
    parity
        .parse::<usize>()
        .map_err(|_| Error::Config(format!("invalid parity count in '{}'", s)))
}

/// Parity count derived from the number of shards in a set.
pub fn default_parity_count(set_size: usize) -> usize {
    match set_size {
        0 | 1 => 0,
        2 | 3 => 1,
        4 | 5 => 2,
        6 | 7 => 3,
        _ => 4,
    }
}

// =============================================================================
// Component Sections
// =============================================================================

/// Node Registry timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before `alive -> suspect`.
    pub suspect_after_missed: u32,
    /// Silence after which a suspect node is declared dead.
    #[serde(with = "duration_str")]
    pub dead_after: Duration,
    #[serde(with = "duration_str")]
    pub evaluation_interval: Duration,
    pub event_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            suspect_after_missed: 3,
            dead_after: Duration::from_secs(30),
            evaluation_interval: Duration::from_secs(1),
            event_buffer: 256,
        }
    }
}

impl RegistryConfig {
    /// Silence after which an alive node becomes suspect.
    pub fn suspect_after(&self) -> Duration {
        self.heartbeat_interval * self.suspect_after_missed
    }

    pub fn validate(&self) -> Result<()> {
        if self.suspect_after_missed == 0 {
            return Err(Error::Config(
                "registry.suspect_after_missed must be at least 1".to_string(),
            ));
        }
        if self.dead_after <= self.suspect_after() {
            return Err(Error::Config(format!(
                "registry.dead_after ({:?}) must exceed the suspect timeout ({:?})",
                self.dead_after,
                self.suspect_after()
            )));
        }
        Ok(())
    }
}

/// Write Coordinator limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Timeout of a single shard RPC.
    #[serde(with = "duration_str")]
    pub rpc_timeout: Duration,
    /// Deadline of the whole write, metadata commit included.
    #[serde(with = "duration_str")]
    pub deadline: Duration,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(5),
            deadline: Duration::from_secs(30),
        }
    }
}

/// Read Coordinator limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    #[serde(with = "duration_str")]
    pub rpc_timeout: Duration,
    #[serde(with = "duration_str")]
    pub deadline: Duration,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(5),
            deadline: Duration::from_secs(30),
        }
    }
}

/// Metadata quorum client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    #[serde(with = "duration_str")]
    pub rpc_timeout: Duration,
    /// Propose rounds tried before giving up on a contended object.
    pub max_propose_attempts: u32,
    #[serde(with = "duration_str")]
    pub retry_backoff: Duration,
    /// Push the newest committed entry to lagging replicas after a read.
    pub read_repair: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(2),
            max_propose_attempts: 5,
            retry_backoff: Duration::from_millis(20),
            read_repair: true,
        }
    }
}

/// Healing Manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    #[serde(with = "duration_str")]
    pub scan_interval: Duration,
    /// Size of the worker pool.
    pub workers: usize,
    pub queue_capacity: usize,
    /// Pause between objects during a scan pass.
    #[serde(with = "duration_str")]
    pub scan_pace: Duration,
    /// Verify payload checksums when probing (bitrot scan).
    pub deep_probe: bool,
    #[serde(with = "duration_str")]
    pub rpc_timeout: Duration,
    #[serde(with = "duration_str")]
    pub task_deadline: Duration,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(300),
            workers: 4,
            queue_capacity: 1024,
            scan_pace: Duration::ZERO,
            deep_probe: true,
            rpc_timeout: Duration::from_secs(10),
            task_deadline: Duration::from_secs(300),
        }
    }
}

/// Local shard store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardStoreConfig {
    /// fsync shard files before acknowledging a put.
    pub sync_writes: bool,
    /// Capacity advertised in heartbeats.
    pub capacity_bytes: u64,
}

impl Default for ShardStoreConfig {
    fn default() -> Self {
        Self {
            sync_writes: true,
            capacity_bytes: 1 << 40,
        }
    }
}

// =============================================================================
// Durations
// =============================================================================

/// Parse a duration such as `"500ms"`, `"30s"`, `"5m"`, `"1h30m"` or `"2d"`.
///
/// A trailing bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut unit_buf = String::new();

    let mut flush = |num: &mut String, unit: &mut String| -> Result<()> {
        let n: u64 = num
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        let multiplier = match unit.to_ascii_lowercase().as_str() {
            "ms" => 1,
            "" | "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            other => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    other
                )))
            }
        };
        total_ms = n
            .checked_mul(multiplier)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))?;
        num.clear();
        unit.clear();
        Ok(())
    };

    for c in s.chars() {
        if c.is_ascii_digit() {
            if !unit_buf.is_empty() {
                flush(&mut num_buf, &mut unit_buf)?;
            }
            num_buf.push(c);
        } else if c.is_ascii_alphabetic() {
            if num_buf.is_empty() {
                return Err(Error::DurationParse(format!(
                    "unit without number in duration: {}",
                    s
                )));
            }
            unit_buf.push(c);
        } else {
            return Err(Error::DurationParse(format!(
                "unexpected character '{}' in duration: {}",
                c, s
            )));
        }
    }
    if !num_buf.is_empty() {
        flush(&mut num_buf, &mut unit_buf)?;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Render a duration in the notation accepted by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis() as u64;
    if ms % 1_000 != 0 {
        format!("{}ms", ms)
    } else {
        format!("{}s", ms / 1_000)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("10x"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("ms"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("1.5s"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("99999999999999999d"), Err(Error::DurationParse(_)));
        assert_matches!(
            parse_duration("18446744073709551615ms1s"),
            Err(Error::DurationParse(_))
        );
    }

    #[test]
    fn test_format_duration_roundtrip() {
        for d in [Duration::from_millis(250), Duration::from_secs(90)] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_storage_class_parsing() {
        assert_eq!(parse_storage_class("EC:2").unwrap(), 2);
        assert_eq!(parse_storage_class(" EC:4 ").unwrap(), 4);
        assert_matches!(parse_storage_class("RS:2"), Err(Error::Config(_)));
        assert_matches!(parse_storage_class("EC:two"), Err(Error::Config(_)));
    }

    #[test]
    fn test_default_parity_count() {
        assert_eq!(default_parity_count(1), 0);
        assert_eq!(default_parity_count(3), 1);
        assert_eq!(default_parity_count(4), 2);
        assert_eq!(default_parity_count(7), 3);
        assert_eq!(default_parity_count(16), 4);
    }

    #[test]
    fn test_scheme_for_storage_class() {
        let config = ErasureConfig::default();
        assert_eq!(
            config.scheme_for(StorageClass::Standard).unwrap(),
            ErasureScheme::new(4, 2)
        );
        assert_eq!(
            config.scheme_for(StorageClass::ReducedRedundancy).unwrap(),
            ErasureScheme::new(5, 1)
        );

        let derived = ErasureConfig {
            set_size: 8,
            standard: None,
            reduced_redundancy: None,
        };
        assert_eq!(
            derived.scheme_for(StorageClass::Standard).unwrap(),
            ErasureScheme::new(4, 4)
        );
    }

    #[test]
    fn test_erasure_validation() {
        let too_much_parity = ErasureConfig {
            set_size: 6,
            standard: Some("EC:4".into()),
            reduced_redundancy: Some("EC:1".into()),
        };
        assert!(too_much_parity.validate().is_err());

        let rrs_above_standard = ErasureConfig {
            set_size: 6,
            standard: Some("EC:1".into()),
            reduced_redundancy: Some("EC:2".into()),
        };
        assert!(rrs_above_standard.validate().is_err());

        assert!(ErasureConfig::default().validate().is_ok());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
erasure:
  set_size: 6
  standard: "EC:2"
registry:
  heartbeat_interval: 500ms
  suspect_after_missed: 4
  dead_after: 10s
heal:
  workers: 2
  scan_interval: 1m
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.registry.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.registry.suspect_after(), Duration::from_secs(2));
        assert_eq!(config.heal.workers, 2);
        assert_eq!(config.heal.scan_interval, Duration::from_secs(60));
        // untouched sections keep their defaults
        assert_eq!(config.write, WriteConfig::default());
    }

    #[test]
    fn test_registry_validation() {
        let config = RegistryConfig {
            dead_after: Duration::from_secs(2),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
