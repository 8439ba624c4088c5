// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Remote shuffle configuration

use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::result;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::codec::{BlockCodec, Lz4FrameCodec, PassthroughCodec};
use crate::error::{Result, ShuffleError};

/// Prefix shared by every remote shuffle setting.
pub const REMOTE_SHUFFLE_CONFIG_PREFIX: &str = "ballista.shuffle.remote";
/// Maximum number of block fetches kept in flight per fetch iterator
pub const REMOTE_SHUFFLE_READ_AHEAD_BLOCKS: &str =
    "ballista.shuffle.remote.read_ahead_blocks";
/// Upper bound on the expected bytes of in-flight and unconsumed fetches
pub const REMOTE_SHUFFLE_MAX_BYTES_IN_FLIGHT: &str =
    "ballista.shuffle.remote.max_bytes_in_flight";
/// How long closing a fetch iterator waits for cancelled fetches to wind down
pub const REMOTE_SHUFFLE_CANCEL_TIMEOUT_MS: &str =
    "ballista.shuffle.remote.cancel_timeout_ms";
/// Number of concurrent block uploads while committing a map output
pub const REMOTE_SHUFFLE_UPLOAD_PARALLELISM: &str =
    "ballista.shuffle.remote.upload_parallelism";
/// Codec applied to partition streams, `lz4` or `none`
pub const REMOTE_SHUFFLE_COMPRESSION: &str = "ballista.shuffle.remote.compression";
/// Directory holding map output staging files
pub const REMOTE_SHUFFLE_LOCAL_DIR: &str = "ballista.shuffle.remote.local_dir";
/// Object store URL shuffle blocks are written to
pub const REMOTE_SHUFFLE_STORE_URL: &str = "ballista.shuffle.remote.store_url";

/// Result of validating a raw setting value
pub type ParseResult<T> = result::Result<T, String>;

static CONFIG_ENTRIES: LazyLock<HashMap<String, ConfigEntry>> = LazyLock::new(|| {
    let entries = vec![
        ConfigEntry::new(REMOTE_SHUFFLE_READ_AHEAD_BLOCKS.to_string(),
                         "Maximum number of remote block fetches in flight for one reduce task".to_string(),
                         ConfigValueType::PositiveInteger, Some(8.to_string())),
        ConfigEntry::new(REMOTE_SHUFFLE_MAX_BYTES_IN_FLIGHT.to_string(),
                         "Maximum expected bytes of fetched but unconsumed blocks for one reduce task".to_string(),
                         ConfigValueType::PositiveInteger, Some((48 * 1024 * 1024).to_string())),
        ConfigEntry::new(REMOTE_SHUFFLE_CANCEL_TIMEOUT_MS.to_string(),
                         "Time in milliseconds closing a fetch iterator waits for cancelled fetches".to_string(),
                         ConfigValueType::Integer, Some(5000.to_string())),
        ConfigEntry::new(REMOTE_SHUFFLE_UPLOAD_PARALLELISM.to_string(),
                         "Number of concurrent block uploads while committing a map output".to_string(),
                         ConfigValueType::PositiveInteger, Some(4.to_string())),
        ConfigEntry::new(REMOTE_SHUFFLE_COMPRESSION.to_string(),
                         "Codec for shuffle partition streams, possible values: lz4, none".to_string(),
                         ConfigValueType::Codec, Some("lz4".to_string())),
        ConfigEntry::new(REMOTE_SHUFFLE_LOCAL_DIR.to_string(),
                         "Local directory for map output staging files. Defaults to the system temporary directory".to_string(),
                         ConfigValueType::Utf8, None),
        ConfigEntry::new(REMOTE_SHUFFLE_STORE_URL.to_string(),
                         "Object store URL shuffle blocks are written to, e.g. s3://bucket/shuffle".to_string(),
                         ConfigValueType::Utf8, None),
    ];
    entries
        .into_iter()
        .map(|e| (e.name.clone(), e))
        .collect::<HashMap<_, _>>()
});

/// Type a configuration value must parse as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigValueType {
    /// Unsigned integer
    Integer,
    /// Unsigned integer greater than zero
    PositiveInteger,
    /// Codec name
    Codec,
    /// Free-form string
    Utf8,
}

impl Display for ConfigValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValueType::Integer => write!(f, "integer"),
            ConfigValueType::PositiveInteger => write!(f, "positive integer"),
            ConfigValueType::Codec => write!(f, "codec"),
            ConfigValueType::Utf8 => write!(f, "string"),
        }
    }
}

/// Configuration option meta-data
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    name: String,
    description: String,
    value_type: ConfigValueType,
    default_value: Option<String>,
}

impl ConfigEntry {
    fn new(
        name: String,
        description: String,
        value_type: ConfigValueType,
        default_value: Option<String>,
    ) -> Self {
        Self {
            name,
            description,
            value_type,
            default_value,
        }
    }
}

/// Compression applied to partition streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShuffleCompression {
    /// Bytes are persisted as written
    None,
    /// LZ4 frame format
    #[default]
    Lz4,
}

impl ShuffleCompression {
    /// Returns the codec implementing this compression.
    pub fn codec(&self) -> Arc<dyn BlockCodec> {
        match self {
            ShuffleCompression::None => Arc::new(PassthroughCodec),
            ShuffleCompression::Lz4 => Arc::new(Lz4FrameCodec),
        }
    }
}

impl std::str::FromStr for ShuffleCompression {
    type Err = String;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ShuffleCompression::None),
            "lz4" => Ok(ShuffleCompression::Lz4),
            other => Err(format!("unknown shuffle compression '{other}'")),
        }
    }
}

/// Rotation of the benchmark binary's log file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "build-binary", derive(clap::ValueEnum))]
pub enum LogRotationPolicy {
    /// New file every minute
    Minutely,
    /// New file every hour
    Hourly,
    /// New file every day
    Daily,
    /// Single file
    #[default]
    Never,
}

#[cfg(feature = "build-binary")]
impl std::str::FromStr for LogRotationPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        clap::ValueEnum::from_str(s, true)
    }
}

/// Tuning of a fetch iterator's read-ahead window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Maximum number of block fetches in flight or fetched but unconsumed
    pub read_ahead_blocks: usize,
    /// Maximum expected bytes held by the read-ahead window. One block is
    /// always admitted, however large.
    pub max_bytes_in_flight: u64,
    /// Time `close` waits for cancelled fetches to release their resources
    pub cancel_timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        RemoteShuffleConfig::default().fetch_options()
    }
}

/// Settings of the map side write path
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Directory holding staging files
    pub local_dir: PathBuf,
    /// Number of concurrent uploads during commit
    pub upload_parallelism: usize,
    /// Codec applied to partition streams
    pub codec: Arc<dyn BlockCodec>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        RemoteShuffleConfig::default().write_options()
    }
}

/// Remote shuffle configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteShuffleConfig {
    /// Settings stored in map for easy serde
    settings: HashMap<String, String>,
}

impl Default for RemoteShuffleConfig {
    fn default() -> Self {
        Self {
            settings: HashMap::new(),
        }
    }
}

impl RemoteShuffleConfig {
    /// Create a new configuration based on key-value pairs
    pub fn with_settings(settings: HashMap<String, String>) -> Result<Self> {
        let supported_entries = RemoteShuffleConfig::valid_entries();
        for name in settings.keys() {
            if !supported_entries.contains_key(name) {
                return Err(ShuffleError::Configuration(format!(
                    "configuration key `{name}` does not exist"
                )));
            }
        }
        for (name, entry) in supported_entries {
            if let Some(v) = settings.get(name) {
                // validate that we can parse the user-supplied value
                Self::parse_value(v.as_str(), entry.value_type).map_err(|e| ShuffleError::Configuration(format!("Failed to parse user-supplied value '{v}' for configuration setting '{name}' ({}): {e}", entry.description)))?;
            } else if let Some(v) = entry.default_value.clone() {
                Self::parse_value(v.as_str(), entry.value_type).map_err(|e| ShuffleError::Configuration(format!("Failed to parse default value '{v}' for configuration setting '{name}': {e}")))?;
            }
        }

        Ok(Self { settings })
    }

    /// Sets a single value, validating it first.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let entries = Self::valid_entries();
        let key = if key.starts_with(REMOTE_SHUFFLE_CONFIG_PREFIX) {
            key.to_string()
        } else {
            format!("{REMOTE_SHUFFLE_CONFIG_PREFIX}.{key}")
        };

        match entries.get(&key) {
            Some(entry) => {
                Self::parse_value(value, entry.value_type).map_err(|e| {
                    ShuffleError::Configuration(format!(
                        "Failed to parse value '{value}' for configuration setting '{key}' ({}): {e}",
                        entry.description
                    ))
                })?;
                self.settings.insert(key, value.to_string());
                Ok(())
            }
            None => Err(ShuffleError::Configuration(format!(
                "configuration key `{key}` does not exist"
            ))),
        }
    }

    /// Checks that `val` parses as `value_type`
    pub fn parse_value(val: &str, value_type: ConfigValueType) -> ParseResult<()> {
        match value_type {
            ConfigValueType::Integer => {
                val.parse::<u64>().map_err(|e| format!("{e:?}"))?;
            }
            ConfigValueType::PositiveInteger => {
                let v = val.parse::<u64>().map_err(|e| format!("{e:?}"))?;
                if v == 0 {
                    return Err("value must be greater than zero".to_string());
                }
            }
            ConfigValueType::Codec => {
                val.parse::<ShuffleCompression>()?;
            }
            ConfigValueType::Utf8 => {}
        }

        Ok(())
    }

    /// All available configuration options
    pub fn valid_entries() -> &'static HashMap<String, ConfigEntry> {
        &CONFIG_ENTRIES
    }

    /// Read-ahead window size in blocks
    pub fn read_ahead_blocks(&self) -> usize {
        self.get_u64_setting(REMOTE_SHUFFLE_READ_AHEAD_BLOCKS) as usize
    }

    /// Read-ahead byte budget
    pub fn max_bytes_in_flight(&self) -> u64 {
        self.get_u64_setting(REMOTE_SHUFFLE_MAX_BYTES_IN_FLIGHT)
    }

    /// Bounded wait of a fetch iterator close
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.get_u64_setting(REMOTE_SHUFFLE_CANCEL_TIMEOUT_MS))
    }

    /// Concurrent uploads per map output commit
    pub fn upload_parallelism(&self) -> usize {
        self.get_u64_setting(REMOTE_SHUFFLE_UPLOAD_PARALLELISM) as usize
    }

    /// Partition stream compression
    pub fn compression(&self) -> ShuffleCompression {
        self.get_string_setting(REMOTE_SHUFFLE_COMPRESSION)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// Staging directory
    pub fn local_dir(&self) -> PathBuf {
        self.get_string_setting(REMOTE_SHUFFLE_LOCAL_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Object store URL, if configured
    pub fn store_url(&self) -> Option<String> {
        self.get_string_setting(REMOTE_SHUFFLE_STORE_URL)
    }

    /// Read-ahead settings for fetch iterators
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            read_ahead_blocks: self.read_ahead_blocks(),
            max_bytes_in_flight: self.max_bytes_in_flight(),
            cancel_timeout: self.cancel_timeout(),
        }
    }

    /// Settings for map output writers
    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            local_dir: self.local_dir(),
            upload_parallelism: self.upload_parallelism(),
            codec: self.compression().codec(),
        }
    }

    fn get_u64_setting(&self, key: &str) -> u64 {
        // values are validated on the way in, a parse failure here can only
        // come from a missing default
        self.get_string_setting(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    fn get_string_setting(&self, key: &str) -> Option<String> {
        if let Some(v) = self.settings.get(key) {
            Some(v.to_string())
        } else {
            Self::valid_entries()
                .get(key)
                .and_then(|entry| entry.default_value.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() -> Result<()> {
        let config = RemoteShuffleConfig::default();
        assert_eq!(8, config.read_ahead_blocks());
        assert_eq!(48 * 1024 * 1024, config.max_bytes_in_flight());
        assert_eq!(Duration::from_secs(5), config.cancel_timeout());
        assert_eq!(4, config.upload_parallelism());
        assert_eq!(ShuffleCompression::Lz4, config.compression());
        assert_eq!(std::env::temp_dir(), config.local_dir());
        assert_eq!(None, config.store_url());
        Ok(())
    }

    #[test]
    fn custom_config() -> Result<()> {
        let settings = HashMap::from([
            (REMOTE_SHUFFLE_READ_AHEAD_BLOCKS.to_string(), "2".to_string()),
            (REMOTE_SHUFFLE_COMPRESSION.to_string(), "none".to_string()),
            (
                REMOTE_SHUFFLE_STORE_URL.to_string(),
                "s3://bucket/shuffle".to_string(),
            ),
        ]);
        let config = RemoteShuffleConfig::with_settings(settings)?;
        assert_eq!(2, config.read_ahead_blocks());
        assert_eq!(ShuffleCompression::None, config.compression());
        assert_eq!(Some("s3://bucket/shuffle".to_string()), config.store_url());
        assert_eq!("passthrough", config.write_options().codec.name());
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (key, value) in [
            (REMOTE_SHUFFLE_READ_AHEAD_BLOCKS, "0"),
            (REMOTE_SHUFFLE_READ_AHEAD_BLOCKS, "many"),
            (REMOTE_SHUFFLE_COMPRESSION, "gzip"),
        ] {
            let settings = HashMap::from([(key.to_string(), value.to_string())]);
            let err = RemoteShuffleConfig::with_settings(settings).unwrap_err();
            assert!(matches!(err, ShuffleError::Configuration(_)), "{key}={value}");
        }

        let settings = HashMap::from([(
            "ballista.shuffle.remote.unknown".to_string(),
            "1".to_string(),
        )]);
        assert!(RemoteShuffleConfig::with_settings(settings).is_err());
    }

    #[test]
    fn set_accepts_short_keys() -> Result<()> {
        let mut config = RemoteShuffleConfig::default();
        config.set("upload_parallelism", "16")?;
        config.set(REMOTE_SHUFFLE_CANCEL_TIMEOUT_MS, "0")?;
        assert_eq!(16, config.upload_parallelism());
        assert_eq!(Duration::ZERO, config.cancel_timeout());
        assert!(config.set("not_a_key", "1").is_err());

        // rejected values name what the setting is for
        let err = config.set("upload_parallelism", "0").unwrap_err();
        assert!(
            err.to_string().contains("Number of concurrent block uploads"),
            "{err}"
        );
        Ok(())
    }
}
