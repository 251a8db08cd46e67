use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Config;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub storage: Option<StorageConfig>,
    pub http: Option<HttpConfig>,
    pub throttle: Option<ThrottleConfig>,
    pub scheduler: Option<SchedulerConfig>,
    pub sources: Option<SourcesConfig>,
    pub notify: Option<NotifyConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: Option<PathBuf>,
    pub asset_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub pagination_delay_ms: Option<u64>,
    pub page_delay_ms: Option<u64>,
    pub chapter_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// English weekday name, e.g. "sunday" or "sun".
    pub weekly_day: Option<String>,
    pub max_concurrent_jobs: Option<usize>,
    pub legacy_hours: Option<Vec<u8>>,
    pub require_numeric_identifier: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub mangadex_api_base: Option<String>,
    pub madara_hosts: Option<Vec<String>>,
    pub graphql_hosts: Option<Vec<String>>,
    /// Image host -> mirror host.
    pub mirrors: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: Option<PathBuf>,
}

/// Platform config directory path: `<config_dir>/chaptersync/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("chaptersync").join("config.toml"))
}

/// Load config by cascading CWD `.chaptersync.toml` over platform config.
/// CWD values override platform values; missing files are skipped.
pub fn load_config() -> Result<ConfigFile, ConfigError> {
    let platform = match config_path() {
        Some(p) => load_from_path(&p)?,
        None => None,
    };
    let cwd = load_from_path(Path::new(".chaptersync.toml"))?;

    Ok(match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    })
}

/// Load a config from a specific path. `Ok(None)` if the file doesn't exist.
pub fn load_from_path(path: &Path) -> Result<Option<ConfigFile>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&content)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Field-wise overlay of one optional section over another.
fn section<T: Default>(
    base: Option<T>,
    overlay: Option<T>,
    pick: impl FnOnce(T, T) -> T,
) -> Option<T> {
    match (base, overlay) {
        (None, None) => None,
        (b, o) => Some(pick(b.unwrap_or_default(), o.unwrap_or_default())),
    }
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    ConfigFile {
        storage: section(base.storage, overlay.storage, |b, o| StorageConfig {
            database_path: o.database_path.or(b.database_path),
            asset_root: o.asset_root.or(b.asset_root),
        }),
        http: section(base.http, overlay.http, |b, o| HttpConfig {
            timeout_secs: o.timeout_secs.or(b.timeout_secs),
            user_agent: o.user_agent.or(b.user_agent),
        }),
        throttle: section(base.throttle, overlay.throttle, |b, o| ThrottleConfig {
            pagination_delay_ms: o.pagination_delay_ms.or(b.pagination_delay_ms),
            page_delay_ms: o.page_delay_ms.or(b.page_delay_ms),
            chapter_delay_ms: o.chapter_delay_ms.or(b.chapter_delay_ms),
        }),
        scheduler: section(base.scheduler, overlay.scheduler, |b, o| SchedulerConfig {
            weekly_day: o.weekly_day.or(b.weekly_day),
            max_concurrent_jobs: o.max_concurrent_jobs.or(b.max_concurrent_jobs),
            legacy_hours: o.legacy_hours.or(b.legacy_hours),
            require_numeric_identifier: o
                .require_numeric_identifier
                .or(b.require_numeric_identifier),
        }),
        sources: section(base.sources, overlay.sources, |b, o| SourcesConfig {
            mangadex_api_base: o.mangadex_api_base.or(b.mangadex_api_base),
            madara_hosts: o.madara_hosts.or(b.madara_hosts),
            graphql_hosts: o.graphql_hosts.or(b.graphql_hosts),
            mirrors: o.mirrors.or(b.mirrors),
        }),
        notify: section(base.notify, overlay.notify, |b, o| NotifyConfig {
            webhook_url: o.webhook_url.or(b.webhook_url),
        }),
        logging: section(base.logging, overlay.logging, |b, o| LoggingConfig {
            dir: o.dir.or(b.dir),
        }),
    }
}

impl ConfigFile {
    /// Overwrite the fields of `config` that this file sets.
    pub fn apply(self, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(storage) = self.storage {
            if let Some(path) = storage.database_path {
                config.database_path = path;
            }
            if let Some(root) = storage.asset_root {
                config.asset_root = root;
            }
        }
        if let Some(http) = self.http {
            if let Some(secs) = http.timeout_secs {
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        field: "http.timeout_secs",
                        message: "must be at least 1".into(),
                    });
                }
                config.http_timeout_secs = secs;
            }
            if let Some(agent) = http.user_agent {
                config.user_agent = agent;
            }
        }
        if let Some(throttle) = self.throttle {
            config.pagination_delay_ms = throttle
                .pagination_delay_ms
                .unwrap_or(config.pagination_delay_ms);
            config.page_delay_ms = throttle.page_delay_ms.unwrap_or(config.page_delay_ms);
            config.chapter_delay_ms = throttle.chapter_delay_ms.unwrap_or(config.chapter_delay_ms);
        }
        if let Some(scheduler) = self.scheduler {
            if let Some(day) = scheduler.weekly_day {
                config.weekly_day = day.trim().parse::<Weekday>().map_err(|_| ConfigError::Invalid {
                    field: "scheduler.weekly_day",
                    message: format!("unknown weekday {day:?}"),
                })?;
            }
            if let Some(n) = scheduler.max_concurrent_jobs {
                config.max_concurrent_jobs = n.max(1);
            }
            if let Some(hours) = scheduler.legacy_hours {
                if let Some(bad) = hours.iter().find(|h| **h > 23) {
                    return Err(ConfigError::Invalid {
                        field: "scheduler.legacy_hours",
                        message: format!("hour {bad} is out of range 0-23"),
                    });
                }
                config.legacy_hours = hours;
            }
            if let Some(required) = scheduler.require_numeric_identifier {
                config.require_numeric_identifier = required;
            }
        }
        if let Some(sources) = self.sources {
            if let Some(base) = sources.mangadex_api_base {
                config.mangadex_api_base = base;
            }
            if let Some(hosts) = sources.madara_hosts {
                config.madara_hosts = hosts;
            }
            if let Some(hosts) = sources.graphql_hosts {
                config.graphql_hosts = hosts;
            }
            if let Some(mirrors) = sources.mirrors {
                config.mirrors = mirrors;
            }
        }
        if let Some(url) = self.notify.and_then(|n| n.webhook_url) {
            config.webhook_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(dir) = self.logging.and_then(|l| l.dir) {
            config.log_dir = Some(dir);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[storage]
database_path = "/var/lib/chaptersync/db.sqlite"

[throttle]
page_delay_ms = 100

[scheduler]
weekly_day = "friday"
legacy_hours = [3, 15]

[sources]
madara_hosts = ["reader.test"]
mirrors = { "img1.reader.test" = "img2.reader.test" }

[notify]
webhook_url = "https://hooks.test/new"
"#;

    #[test]
    fn sample_applies_over_defaults() {
        let file: ConfigFile = toml::from_str(SAMPLE).unwrap();
        let mut config = Config::default();
        file.apply(&mut config).unwrap();
        assert_eq!(
            config.database_path,
            PathBuf::from("/var/lib/chaptersync/db.sqlite")
        );
        assert_eq!(config.page_delay_ms, 100);
        assert_eq!(config.chapter_delay_ms, 1000);
        assert_eq!(config.weekly_day, Weekday::Fri);
        assert_eq!(config.legacy_hours, vec![3, 15]);
        assert_eq!(config.madara_hosts, vec!["reader.test".to_string()]);
        assert_eq!(
            config.mirrors.get("img1.reader.test").map(String::as_str),
            Some("img2.reader.test")
        );
        assert_eq!(config.webhook_url.as_deref(), Some("https://hooks.test/new"));
    }

    #[test]
    fn overlay_wins_and_base_survives() {
        let base: ConfigFile = toml::from_str(SAMPLE).unwrap();
        let overlay: ConfigFile = toml::from_str("[throttle]\npage_delay_ms = 5\n").unwrap();
        let merged = merge(base, overlay);
        let throttle = merged.throttle.unwrap();
        assert_eq!(throttle.page_delay_ms, Some(5));
        assert_eq!(
            merged.storage.unwrap().database_path,
            Some(PathBuf::from("/var/lib/chaptersync/db.sqlite"))
        );
        assert!(merged.http.is_none());
    }

    #[test]
    fn bad_weekday_is_rejected() {
        let file: ConfigFile = toml::from_str("[scheduler]\nweekly_day = \"someday\"\n").unwrap();
        let err = file.apply(&mut Config::default()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "scheduler.weekly_day",
                ..
            }
        ));
    }

    #[test]
    fn out_of_range_legacy_hour_is_rejected() {
        let file: ConfigFile = toml::from_str("[scheduler]\nlegacy_hours = [0, 24]\n").unwrap();
        assert!(file.apply(&mut Config::default()).is_err());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = std::env::temp_dir().join("chaptersync-config-test-missing");
        assert!(load_from_path(&dir.join("nope.toml")).unwrap().is_none());
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let file: ConfigFile = toml::from_str("[display]\ntheme = \"dark\"\n").unwrap();
        assert_eq!(file, ConfigFile::default());
    }
}
