//! Configuration validation.

use super::Config;
use crate::codec::LegacyCharset;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Store validation
    if config.store.host.is_empty() {
        return Err(MigrateError::Config("store.host is required".into()));
    }
    if config.store.database.is_empty() {
        return Err(MigrateError::Config("store.database is required".into()));
    }
    if config.store.user.is_empty() {
        return Err(MigrateError::Config("store.user is required".into()));
    }
    if config.store.max_connections == 0 {
        return Err(MigrateError::Config(
            "store.max_connections must be at least 1".into(),
        ));
    }

    // Dispatcher validation
    if config.dispatcher.interval_secs == 0 {
        return Err(MigrateError::Config(
            "dispatcher.interval_secs must be at least 1".into(),
        ));
    }
    if config.dispatcher.transcode_workers == 0 {
        return Err(MigrateError::Config(
            "dispatcher.transcode_workers must be at least 1".into(),
        ));
    }
    if config.dispatcher.load_workers == 0 {
        return Err(MigrateError::Config(
            "dispatcher.load_workers must be at least 1".into(),
        ));
    }
    if config.dispatcher.verify_workers == 0 {
        return Err(MigrateError::Config(
            "dispatcher.verify_workers must be at least 1".into(),
        ));
    }

    // Transcode validation
    if config.transcode.rows_per_split <= 0 {
        return Err(MigrateError::Config(
            "transcode.rows_per_split must be at least 1".into(),
        ));
    }
    LegacyCharset::new(&config.transcode.charset)?;

    if config.verify.max_diffs == 0 {
        return Err(MigrateError::Config(
            "verify.max_diffs must be at least 1".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DispatcherConfig, NodeConfig, StoreConfig, TranscodeConfig, VerifyConfig,
    };

    fn valid_config() -> Config {
        Config {
            node: NodeConfig::default(),
            store: StoreConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "migmeta".to_string(),
                user: "mig".to_string(),
                password: "password".to_string(),
                schema: "_ebcdic_pg_migrate".to_string(),
                max_connections: 4,
            },
            dispatcher: DispatcherConfig::default(),
            transcode: TranscodeConfig::default(),
            verify: VerifyConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_empty_store_host_rejected() {
        let mut config = valid_config();
        config.store.host.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = valid_config();
        config.dispatcher.interval_secs = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_rows_per_split_rejected() {
        let mut config = valid_config();
        config.transcode.rows_per_split = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_charset_rejected() {
        let mut config = valid_config();
        config.transcode.charset = "no-such-charset".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = valid_config();
        config.dispatcher.load_workers = 0;
        assert!(validate(&config).is_err());
    }
}
