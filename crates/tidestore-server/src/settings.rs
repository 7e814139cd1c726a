//! Configuration loading for the ingest binary.
//!
//! The TOML file (if any) is read first, then `TIDESTORE_*` environment
//! variables override individual values:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `TIDESTORE_TOPIC` | `log.topic` |
//! | `TIDESTORE_GROUP_ID` | `log.group_id` |
//! | `TIDESTORE_PARTITIONS` | `log.partitions` |
//! | `TIDESTORE_COMMIT_PERIOD_MS` | `log.commit_period_ms` |
//! | `TIDESTORE_MAX_TIME_BETWEEN_COMMITS_MS` | `log.max_time_between_commits_ms` |
//! | `TIDESTORE_TABLE` | `store.table` |
//! | `TIDESTORE_MODULUS` | `store.modulus` |
//! | `TIDESTORE_MAX_PENDING_BYTES` | `store.max_pending_bytes` |
//! | `TIDESTORE_SKIP_WRITE` | `store.skip_write` |
//! | `TIDESTORE_LOG_MAC_KEY` | `keys.log_mac` |
//! | `TIDESTORE_LOG_CIPHER_KEY` | `keys.log_cipher` |
//! | `TIDESTORE_STORAGE_CIPHER_KEY` | `keys.storage_cipher` |

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use tidestore_storage::IngestConfig;

/// Load the file at `path` (defaults when `None`), apply the process
/// environment and validate.
pub fn load(path: Option<&Path>) -> Result<IngestConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            IngestConfig::from_toml_str(&text)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        }
        None => IngestConfig::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Apply `TIDESTORE_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut IngestConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("TIDESTORE_TOPIC") {
        config.log.topic = v;
    }
    if let Some(v) = lookup("TIDESTORE_GROUP_ID") {
        config.log.group_id = v;
    }
    if let Some(v) = lookup("TIDESTORE_PARTITIONS") {
        config.log.partitions = parse("TIDESTORE_PARTITIONS", &v)?;
    }
    if let Some(v) = lookup("TIDESTORE_COMMIT_PERIOD_MS") {
        config.log.commit_period_ms = parse("TIDESTORE_COMMIT_PERIOD_MS", &v)?;
    }
    if let Some(v) = lookup("TIDESTORE_MAX_TIME_BETWEEN_COMMITS_MS") {
        config.log.max_time_between_commits_ms =
            parse("TIDESTORE_MAX_TIME_BETWEEN_COMMITS_MS", &v)?;
    }
    if let Some(v) = lookup("TIDESTORE_TABLE") {
        config.store.table = v;
    }
    if let Some(v) = lookup("TIDESTORE_MODULUS") {
        config.store.modulus = parse("TIDESTORE_MODULUS", &v)?;
    }
    if let Some(v) = lookup("TIDESTORE_MAX_PENDING_BYTES") {
        config.store.max_pending_bytes = parse("TIDESTORE_MAX_PENDING_BYTES", &v)?;
    }
    if let Some(v) = lookup("TIDESTORE_SKIP_WRITE") {
        config.store.skip_write = parse("TIDESTORE_SKIP_WRITE", &v)?;
    }
    if let Some(v) = lookup("TIDESTORE_LOG_MAC_KEY") {
        config.keys.log_mac = Some(v);
    }
    if let Some(v) = lookup("TIDESTORE_LOG_CIPHER_KEY") {
        config.keys.log_cipher = Some(v);
    }
    if let Some(v) = lookup("TIDESTORE_STORAGE_CIPHER_KEY") {
        config.keys.storage_cipher = Some(v);
    }
    Ok(())
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{} has an invalid value: {:?}", name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [log]
            topic = "metrics"
            partitions = 2

            [store]
            table = "raw"
            eager_flush_age_ms = 250
            "#
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.log.topic, "metrics");
        assert_eq!(config.store.table, "raw");
        assert_eq!(config.store.eager_flush_age_ms, 250);
        assert_eq!(config.log.commit_period_ms, 1000);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = IngestConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("TIDESTORE_TOPIC", "override"),
                ("TIDESTORE_PARTITIONS", "12"),
                ("TIDESTORE_SKIP_WRITE", "true"),
                ("TIDESTORE_MODULUS", " 60 "),
            ]),
        )
        .unwrap();

        assert_eq!(config.log.topic, "override");
        assert_eq!(config.log.partitions, 12);
        assert!(config.store.skip_write);
        assert_eq!(config.store.modulus, 60);
    }

    #[test]
    fn test_bad_env_value_names_the_variable() {
        let mut config = IngestConfig::default();
        let err = apply_env_overrides(&mut config, env(&[("TIDESTORE_PARTITIONS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("TIDESTORE_PARTITIONS"));
    }
}
