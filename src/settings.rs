/*
 * Copyright 2020 Actyx AG
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
//! Layered configuration: defaults, an optional TOML file, then `OEE__…` environment
//! variables (e.g. `OEE__EXPORT__RECORDS_PER_TXN=5000`)
use crate::{metric::MetricConfig, source::CycleTimeUnit};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const ENV_PREFIX: &str = "OEE";
pub const DEFAULT_SETTINGS_FILE: &str = "oee.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// What to do with a row that cannot be turned into a valid record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidRecordPolicy {
    /// log and count the row, then continue
    Discard,
    /// stop with the row's error
    Abort,
}

impl Default for InvalidRecordPolicy {
    fn default() -> Self {
        InvalidRecordPolicy::Discard
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub cycle_time_unit: CycleTimeUnit,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// input rows per database transaction
    pub records_per_txn: usize,
    /// prepended with `_` to all table names unless empty
    pub table_prefix: String,
    pub on_invalid: InvalidRecordPolicy,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            records_per_txn: 1_000,
            table_prefix: String::new(),
            on_invalid: InvalidRecordPolicy::Discard,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub metric: MetricConfig,
    pub source: SourceSettings,
    pub export: ExportSettings,
    /// default filter directive when `RUST_LOG` is not set
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            metric: MetricConfig::default(),
            source: SourceSettings::default(),
            export: ExportSettings::default(),
            log_level: "info".to_owned(),
        }
    }
}

impl Settings {
    /// Load from the given file (or `oee.toml` if present) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_SETTINGS_FILE).required(false),
        };
        Self::build(
            Config::builder().add_source(file).add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            ),
        )
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, SettingsError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if let Err(err) = self.metric.validate() {
            return Err(SettingsError::Invalid {
                key: "metric.performance_ceiling",
                reason: err.reason,
            });
        }
        if self.export.records_per_txn == 0 {
            return Err(SettingsError::Invalid {
                key: "export.records_per_txn",
                reason: "must be at least 1".to_owned(),
            });
        }
        // the prefix ends up unquoted in SQL statements
        if !self
            .export
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(SettingsError::Invalid {
                key: "export.table_prefix",
                reason: format!("{:?} may only contain letters, digits and '_'", self.export.table_prefix),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(text: &str) -> Result<Settings, SettingsError> {
        Settings::build(Config::builder().add_source(File::from_str(text, FileFormat::Toml)))
    }

    #[test]
    fn must_default() {
        let settings = from_toml("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.metric.performance_ceiling, 1.0);
        assert_eq!(settings.source.cycle_time_unit, CycleTimeUnit::Seconds);
        assert_eq!(settings.export.records_per_txn, 1000);
        assert_eq!(settings.export.on_invalid, InvalidRecordPolicy::Discard);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn must_read_sections() {
        let settings = from_toml(
            r#"
            log_level = "debug"

            [metric]
            performance_ceiling = 0.95

            [source]
            cycle_time_unit = "minutes"

            [export]
            records_per_txn = 50
            table_prefix = "plant1"
            on_invalid = "abort"
            "#,
        )
        .unwrap();
        assert_eq!(settings.metric.performance_ceiling, 0.95);
        assert_eq!(settings.source.cycle_time_unit, CycleTimeUnit::Minutes);
        assert_eq!(settings.export.records_per_txn, 50);
        assert_eq!(settings.export.table_prefix, "plant1");
        assert_eq!(settings.export.on_invalid, InvalidRecordPolicy::Abort);
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn must_reject_bad_values() {
        for text in &[
            "[metric]\nperformance_ceiling = 0.0",
            "[metric]\nperformance_ceiling = 1.5",
            "[export]\nrecords_per_txn = 0",
            "[export]\ntable_prefix = \"x; drop table y\"",
        ] {
            match from_toml(text) {
                Err(SettingsError::Invalid { .. }) => {}
                other => panic!("{}: unexpected {:?}", text, other),
            }
        }
        assert!(matches!(
            from_toml("[export]\non_invalid = \"ignore\""),
            Err(SettingsError::Config(_))
        ));
    }

    #[test]
    fn missing_explicit_file_must_fail() {
        assert!(Settings::load(Some(Path::new("/nonexistent/oee.toml"))).is_err());
    }
}
