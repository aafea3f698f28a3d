use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use config::{Config, Environment, File, FileFormat};
use radar_engine::DEFAULT_TICK_CRON;
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "radar.toml";

/// Bootstrap configuration: `radar.toml` (optional) overlaid by `RADAR__*`
/// environment variables, e.g. `RADAR__DATABASE__URL`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub source: SourceConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Absent means the in-memory store.
    pub url: Option<String>,
    pub max_connections: u32,
    pub auto_migrate: bool,
    pub recover_orphaned_runs: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            auto_migrate: true,
            recover_orphaned_runs: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            cors_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Bilibili,
    Fixture,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub user_agent: String,
    pub referer: Option<String>,
    pub cookie: Option<String>,
    pub fixture_path: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub max_concurrency: usize,
    pub api_base: Option<String>,
    pub search_base: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Bilibili,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/124.0 Safari/537.36"
                .to_string(),
            referer: Some("https://www.bilibili.com".to_string()),
            cookie: None,
            fixture_path: None,
            request_timeout_secs: 15,
            max_concurrency: 4,
            api_base: None,
            search_base: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_cron: String,
    pub default_timezone: String,
    pub seed_templates: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_cron: DEFAULT_TICK_CRON.to_string(),
            default_timezone: "UTC".to_string(),
            seed_templates: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => {
                if !path.exists() {
                    bail!("config file {} does not exist", path.display());
                }
                builder.add_source(File::from(path).format(FileFormat::Toml))
            }
            None => builder
                .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false)),
        };
        builder = builder.add_source(
            Environment::with_prefix("RADAR")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("http.cors_origins"),
        );

        let config: AppConfig = builder
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        self.default_tz()?;
        if self.source.kind == SourceKind::Fixture && self.source.fixture_path.is_none() {
            bail!("source.fixture_path is required when source.kind = \"fixture\"");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.http
            .bind
            .parse()
            .with_context(|| format!("http.bind `{}` is not a socket address", self.http.bind))
    }

    pub fn default_tz(&self) -> Result<Tz> {
        self.scheduler
            .default_timezone
            .parse::<Tz>()
            .map_err(|_| {
                anyhow::anyhow!(
                    "scheduler.default_timezone `{}` is not an IANA timezone",
                    self.scheduler.default_timezone
                )
            })
    }
}
