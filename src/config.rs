use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::key::{KeyExtent, TableId};

/// Configuration for the file manager
#[derive(Debug, Clone)]
pub struct FileManagerConfig {
    /// Maximum number of files open at once, reserved or idle (default: 256)
    pub max_open: usize,

    /// How long a released file may stay open unused (default: 60s).
    /// Idle files are checked every `max_idle / 2`.
    pub max_idle: Duration,

    /// How often to log file manager metrics (default: 30s)
    pub metrics_interval: Duration,

    /// Settings for tables without an explicit entry in `tables`
    pub default_table: TableConfig,

    /// Per-table overrides
    pub tables: HashMap<TableId, TableConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableConfig {
    /// Keep scanning when a file fails to open or read (default: false).
    /// Never honored for the metadata table.
    pub ignore_failures: bool,
}

impl TableConfig {
    /// Set whether file failures are skipped
    pub fn ignore_failures(mut self, ignore: bool) -> Self {
        self.ignore_failures = ignore;
        self
    }
}

impl Default for FileManagerConfig {
    fn default() -> Self {
        Self {
            max_open: 256,
            max_idle: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(30),
            default_table: TableConfig::default(),
            tables: HashMap::new(),
        }
    }
}

impl FileManagerConfig {
    /// Create a new config with the given open file limit
    pub fn new(max_open: usize) -> Self {
        Self {
            max_open,
            ..Default::default()
        }
    }

    /// Set maximum number of open files
    pub fn max_open(mut self, max_open: usize) -> Self {
        self.max_open = max_open;
        self
    }

    /// Set maximum idle time for cached files
    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set metrics logging interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Set the settings used by tables without an override
    pub fn default_table(mut self, config: TableConfig) -> Self {
        self.default_table = config;
        self
    }

    /// Override settings for one table
    pub fn table(mut self, table_id: impl Into<String>, config: TableConfig) -> Self {
        self.tables.insert(TableId::new(table_id), config);
        self
    }

    pub fn table_config(&self, table_id: &TableId) -> &TableConfig {
        self.tables.get(table_id).unwrap_or(&self.default_table)
    }

    /// Whether scans of `extent` skip files that fail to open or read.
    pub fn continue_on_failure(&self, extent: &KeyExtent) -> bool {
        !extent.is_metadata() && self.table_config(&extent.table_id).ignore_failures
    }

    /// Period of the idle file closer.
    pub fn idle_check_interval(&self) -> Duration {
        self.max_idle / 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_open == 0 {
            return Err(Error::InvalidConfig("max_open must be > 0".to_string()));
        }
        if self.idle_check_interval().is_zero() {
            return Err(Error::InvalidConfig(format!(
                "max_idle {:?} leaves no idle check period",
                self.max_idle
            )));
        }
        if self.metrics_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "metrics_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::METADATA_TABLE_ID;

    #[test]
    fn test_default_config() {
        let config = FileManagerConfig::default();
        assert_eq!(config.max_open, 256);
        assert_eq!(config.max_idle, Duration::from_secs(60));
        assert_eq!(config.idle_check_interval(), Duration::from_secs(30));
        assert!(!config.default_table.ignore_failures);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = FileManagerConfig::new(8)
            .max_idle(Duration::from_millis(500))
            .metrics_interval(Duration::from_secs(5))
            .table("t1", TableConfig::default().ignore_failures(true));

        assert_eq!(config.max_open, 8);
        assert_eq!(config.idle_check_interval(), Duration::from_millis(250));
        assert_eq!(config.metrics_interval, Duration::from_secs(5));
        assert!(config.table_config(&TableId::new("t1")).ignore_failures);
        assert!(!config.table_config(&TableId::new("t2")).ignore_failures);
    }

    #[test]
    fn test_metadata_never_continues_on_failure() {
        let config = FileManagerConfig::default()
            .default_table(TableConfig::default().ignore_failures(true))
            .table(METADATA_TABLE_ID, TableConfig::default().ignore_failures(true));

        assert!(config.continue_on_failure(&KeyExtent::whole_table("1")));
        assert!(!config.continue_on_failure(&KeyExtent::whole_table(METADATA_TABLE_ID)));
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            FileManagerConfig::new(0).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(FileManagerConfig::new(1)
            .max_idle(Duration::ZERO)
            .validate()
            .is_err());

        // Halving 1ns leaves a zero timer period.
        assert!(matches!(
            FileManagerConfig::new(1)
                .max_idle(Duration::from_nanos(1))
                .validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(FileManagerConfig::new(1)
            .max_idle(Duration::from_nanos(2))
            .validate()
            .is_ok());

        assert!(matches!(
            FileManagerConfig::new(4)
                .metrics_interval(Duration::ZERO)
                .validate(),
            Err(Error::InvalidConfig(_))
        ));
    }
}
