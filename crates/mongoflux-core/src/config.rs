//! Configuration: the TOML config file, the command-line overrides, and the
//! merge that resolves them into run settings.
//!
//! Precedence is uniform for every setting, booleans included: a flag that
//! was explicitly set wins, an unset flag takes the file value, and built-in
//! defaults apply last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::measurement::MeasurementSpec;

pub const DEFAULT_MONGO_URL: &str = "mongodb://localhost:27017";
pub const DEFAULT_INFLUX_URL: &str = "http://localhost:8086";
pub const DEFAULT_RESUME_NAME: &str = "default";
pub const DEFAULT_OPLOG_DATABASE: &str = "local";
pub const DEFAULT_OPLOG_COLLECTION: &str = "oplog.rs";
pub const DEFAULT_INFLUX_CLIENTS: usize = 10;
pub const DEFAULT_INFLUX_BUFFER_SIZE: usize = 1000;
pub const DEFAULT_CHANNEL_SIZE: usize = 512;
pub const DEFAULT_BUFFER_SIZE: usize = 32;
pub const DEFAULT_BUFFER_DURATION: &str = "75ms";

/// The config file, top-level scalars in kebab-case plus the
/// `[gtm-settings]` table and the ordered `[[measurement]]` tables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub verbose: Option<bool>,
    pub resume: Option<bool>,
    pub resume_name: Option<String>,
    pub resume_strategy: Option<u8>,
    pub resume_from_timestamp: Option<i64>,
    pub resume_write_unsafe: Option<bool>,
    pub replay: Option<bool>,
    pub direct_reads: Option<bool>,
    pub change_streams: Option<bool>,
    pub exit_after_direct_reads: Option<bool>,
    pub mongo_url: Option<String>,
    pub mongo_oplog_database_name: Option<String>,
    pub mongo_oplog_collection_name: Option<String>,
    pub influx_url: Option<String>,
    pub influx_user: Option<String>,
    pub influx_password: Option<String>,
    pub influx_skip_verify: Option<bool>,
    pub influx_auto_create_db: Option<bool>,
    pub influx_pem_file: Option<PathBuf>,
    pub influx_clients: Option<usize>,
    pub influx_buffer_size: Option<usize>,
    pub gtm_settings: GtmSettings,
    pub measurement: Vec<MeasurementSpec>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// The `[gtm-settings]` table: ingestion channel and oplog re-read buffer
/// tuning.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct GtmSettings {
    pub channel_size: Option<usize>,
    pub buffer_size: Option<usize>,
    pub buffer_duration: Option<String>,
}

/// Values carried by explicitly set command-line flags. `None` means the
/// flag was not given.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub verbose: Option<bool>,
    pub resume: Option<bool>,
    pub resume_name: Option<String>,
    pub resume_strategy: Option<u8>,
    pub resume_from_timestamp: Option<i64>,
    pub resume_write_unsafe: Option<bool>,
    pub replay: Option<bool>,
    pub direct_reads: Option<bool>,
    pub change_streams: Option<bool>,
    pub exit_after_direct_reads: Option<bool>,
    pub mongo_url: Option<String>,
    pub mongo_oplog_database_name: Option<String>,
    pub mongo_oplog_collection_name: Option<String>,
    pub influx_url: Option<String>,
    pub influx_user: Option<String>,
    pub influx_password: Option<String>,
    pub influx_skip_verify: Option<bool>,
    pub influx_auto_create_db: Option<bool>,
    pub influx_pem_file: Option<PathBuf>,
    pub influx_clients: Option<usize>,
    pub influx_buffer_size: Option<usize>,
}

/// Which kind of resume position this run persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStrategy {
    Timestamp,
    Token,
}

/// Sink connection settings.
#[derive(Debug, Clone)]
pub struct InfluxSettings {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub skip_verify: bool,
    pub auto_create_db: bool,
    pub pem_file: Option<PathBuf>,
    pub clients: usize,
    pub buffer_size: usize,
}

/// Fully resolved run settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub verbose: bool,
    pub resume: bool,
    pub resume_name: String,
    pub resume_strategy: ResumeStrategy,
    pub resume_from_timestamp: Option<i64>,
    pub resume_write_unsafe: bool,
    pub replay: bool,
    pub direct_reads: bool,
    pub change_streams: bool,
    pub exit_after_direct_reads: bool,
    pub mongo_url: String,
    pub oplog_database: String,
    pub oplog_collection: String,
    pub influx: InfluxSettings,
    pub channel_size: usize,
    pub buffer_size: usize,
    pub buffer_duration: Duration,
    pub measurements: Vec<MeasurementSpec>,
}

impl Settings {
    /// Merge flags over the file and apply defaults. Fails on an empty
    /// measurement list, an unknown resume strategy, an unparseable buffer
    /// duration, or a token strategy without change streams.
    pub fn resolve(file: FileConfig, flags: Overrides) -> Result<Self> {
        let resume_strategy = match flags.resume_strategy.or(file.resume_strategy).unwrap_or(0) {
            0 => ResumeStrategy::Timestamp,
            1 => ResumeStrategy::Token,
            other => bail!("unknown resume strategy {other} (0=timestamp, 1=token)"),
        };
        let change_streams = flags.change_streams.or(file.change_streams).unwrap_or(false);
        if resume_strategy == ResumeStrategy::Token && !change_streams {
            bail!("the token resume strategy requires change streams");
        }

        let buffer_duration = file
            .gtm_settings
            .buffer_duration
            .as_deref()
            .unwrap_or(DEFAULT_BUFFER_DURATION);
        let buffer_duration = humantime::parse_duration(buffer_duration)
            .with_context(|| format!("invalid buffer-duration {buffer_duration:?}"))?;
        if buffer_duration.is_zero() {
            bail!("buffer-duration must be positive");
        }

        if file.measurement.is_empty() {
            bail!("no measurements configured");
        }

        Ok(Self {
            verbose: flags.verbose.or(file.verbose).unwrap_or(false),
            resume: flags.resume.or(file.resume).unwrap_or(false),
            resume_name: flags
                .resume_name
                .or(file.resume_name)
                .unwrap_or_else(|| DEFAULT_RESUME_NAME.to_string()),
            resume_strategy,
            resume_from_timestamp: flags.resume_from_timestamp.or(file.resume_from_timestamp),
            resume_write_unsafe: flags
                .resume_write_unsafe
                .or(file.resume_write_unsafe)
                .unwrap_or(false),
            replay: flags.replay.or(file.replay).unwrap_or(false),
            direct_reads: flags.direct_reads.or(file.direct_reads).unwrap_or(false),
            change_streams,
            exit_after_direct_reads: flags
                .exit_after_direct_reads
                .or(file.exit_after_direct_reads)
                .unwrap_or(false),
            mongo_url: flags
                .mongo_url
                .or(file.mongo_url)
                .unwrap_or_else(|| DEFAULT_MONGO_URL.to_string()),
            oplog_database: flags
                .mongo_oplog_database_name
                .or(file.mongo_oplog_database_name)
                .unwrap_or_else(|| DEFAULT_OPLOG_DATABASE.to_string()),
            oplog_collection: flags
                .mongo_oplog_collection_name
                .or(file.mongo_oplog_collection_name)
                .unwrap_or_else(|| DEFAULT_OPLOG_COLLECTION.to_string()),
            influx: InfluxSettings {
                url: flags
                    .influx_url
                    .or(file.influx_url)
                    .unwrap_or_else(|| DEFAULT_INFLUX_URL.to_string()),
                user: flags.influx_user.or(file.influx_user),
                password: flags.influx_password.or(file.influx_password),
                skip_verify: flags
                    .influx_skip_verify
                    .or(file.influx_skip_verify)
                    .unwrap_or(false),
                auto_create_db: flags
                    .influx_auto_create_db
                    .or(file.influx_auto_create_db)
                    .unwrap_or(true),
                pem_file: flags.influx_pem_file.or(file.influx_pem_file),
                clients: flags
                    .influx_clients
                    .or(file.influx_clients)
                    .unwrap_or(DEFAULT_INFLUX_CLIENTS),
                buffer_size: flags
                    .influx_buffer_size
                    .or(file.influx_buffer_size)
                    .unwrap_or(DEFAULT_INFLUX_BUFFER_SIZE),
            },
            channel_size: file
                .gtm_settings
                .channel_size
                .unwrap_or(DEFAULT_CHANNEL_SIZE),
            buffer_size: file.gtm_settings.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            buffer_duration,
            measurements: file.measurement,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_file() -> FileConfig {
        toml::from_str(
            r#"
            [[measurement]]
            namespace = "db.c"
            fields = ["temp"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = Settings::resolve(minimal_file(), Overrides::default()).unwrap();
        assert_eq!(settings.mongo_url, DEFAULT_MONGO_URL);
        assert_eq!(settings.influx.url, DEFAULT_INFLUX_URL);
        assert_eq!(settings.influx.clients, 10);
        assert_eq!(settings.influx.buffer_size, 1000);
        assert!(settings.influx.auto_create_db);
        assert_eq!(settings.resume_name, "default");
        assert_eq!(settings.resume_strategy, ResumeStrategy::Timestamp);
        assert_eq!(settings.channel_size, 512);
        assert_eq!(settings.buffer_size, 32);
        assert_eq!(settings.buffer_duration, Duration::from_millis(75));
        assert_eq!(settings.oplog_database, "local");
        assert_eq!(settings.oplog_collection, "oplog.rs");
    }

    #[test]
    fn file_values_override_defaults() {
        let file: FileConfig = toml::from_str(
            r#"
            influx-auto-create-db = false
            influx-clients = 4

            [gtm-settings]
            channel-size = 64
            buffer-duration = "200ms"

            [[measurement]]
            namespace = "db.c"
            fields = ["temp"]
            "#,
        )
        .unwrap();
        let settings = Settings::resolve(file, Overrides::default()).unwrap();
        assert!(!settings.influx.auto_create_db);
        assert_eq!(settings.influx.clients, 4);
        assert_eq!(settings.channel_size, 64);
        assert_eq!(settings.buffer_duration, Duration::from_millis(200));
    }

    #[test]
    fn explicit_flags_override_file_both_directions() {
        let file: FileConfig = toml::from_str(
            r#"
            influx-auto-create-db = false
            resume = true

            [[measurement]]
            namespace = "db.c"
            fields = ["temp"]
            "#,
        )
        .unwrap();
        let flags = Overrides {
            influx_auto_create_db: Some(true),
            resume: Some(false),
            ..Overrides::default()
        };
        let settings = Settings::resolve(file, flags).unwrap();
        assert!(settings.influx.auto_create_db);
        assert!(!settings.resume);
    }

    #[test]
    fn unset_flag_takes_file_value() {
        let file: FileConfig = toml::from_str(
            r#"
            influx-auto-create-db = false

            [[measurement]]
            namespace = "db.c"
            fields = ["temp"]
            "#,
        )
        .unwrap();
        let settings = Settings::resolve(file, Overrides::default()).unwrap();
        assert!(!settings.influx.auto_create_db);
    }

    #[test]
    fn missing_measurements_are_fatal() {
        let err = Settings::resolve(FileConfig::default(), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("no measurements"));
    }

    #[test]
    fn invalid_buffer_duration_is_fatal() {
        let mut file = minimal_file();
        file.gtm_settings.buffer_duration = Some("soon".to_string());
        assert!(Settings::resolve(file, Overrides::default()).is_err());
    }

    #[test]
    fn token_strategy_requires_change_streams() {
        let mut file = minimal_file();
        file.resume_strategy = Some(1);
        assert!(Settings::resolve(file.clone(), Overrides::default()).is_err());

        file.change_streams = Some(true);
        let settings = Settings::resolve(file, Overrides::default()).unwrap();
        assert_eq!(settings.resume_strategy, ResumeStrategy::Token);
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let parsed: Result<FileConfig, _> = toml::from_str("mongo-yurl = \"x\"");
        assert!(parsed.is_err());
    }
}
