use anyhow::{bail, Context, Result};
use leadwatch_core::RecipientId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 120;
const DEFAULT_REPORT_HOUR: u32 = 9;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Optional keys accepted in the TOML config file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub database_path: Option<PathBuf>,
    pub leads_path: Option<PathBuf>,
    pub outbox_path: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub admin_ids: Option<Vec<RecipientId>>,
    pub report_hour: Option<u32>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub log_level: Option<String>,
    pub log_dir: Option<PathBuf>,
}

/// Values given on the command line; they win over everything else.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub leads: Option<PathBuf>,
    pub outbox: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub log_dir: Option<PathBuf>,
    pub debug: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonConfig {
    pub database_path: PathBuf,
    pub leads_path: PathBuf,
    pub outbox_path: PathBuf,
    pub poll_interval: Duration,
    pub admin_ids: Vec<RecipientId>,
    pub report_hour: u32,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub debug: bool,
}

impl DaemonConfig {
    pub fn defaults(data_dir: &Path) -> Self {
        Self {
            database_path: data_dir.join("leadwatch.db"),
            leads_path: data_dir.join("leads.json"),
            outbox_path: data_dir.join("outbox.jsonl"),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            admin_ids: Vec::new(),
            report_hour: DEFAULT_REPORT_HOUR,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            log_level: "info".to_string(),
            log_dir: Some(data_dir.join("logs")),
            debug: false,
        }
    }

    /// Defaults, then the config file, then the process environment, then flags.
    pub fn load(overrides: &CliOverrides) -> Result<Self> {
        Self::load_with(overrides, &default_data_dir(), |key| std::env::var(key).ok())
    }

    pub fn load_with<F>(overrides: &CliOverrides, data_dir: &Path, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::defaults(data_dir);

        let explicit = overrides
            .config
            .clone()
            .or_else(|| env("LEADWATCH_CONFIG").map(PathBuf::from));
        let file = match explicit {
            Some(path) => Some(read_file_config(&path)?),
            None => {
                let implicit = data_dir.join("config.toml");
                if implicit.exists() {
                    Some(read_file_config(&implicit)?)
                } else {
                    None
                }
            }
        };
        if let Some(file) = file {
            config.apply_file(file);
        }

        config.apply_env(&env)?;
        config.apply_cli(overrides);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(path) = file.database_path {
            self.database_path = path;
        }
        if let Some(path) = file.leads_path {
            self.leads_path = path;
        }
        if let Some(path) = file.outbox_path {
            self.outbox_path = path;
        }
        if let Some(secs) = file.poll_interval_secs {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(ids) = file.admin_ids {
            self.admin_ids = ids;
        }
        if let Some(hour) = file.report_hour {
            self.report_hour = hour;
        }
        if let Some(attempts) = file.retry_attempts {
            self.retry_attempts = attempts;
        }
        if let Some(secs) = file.retry_delay_secs {
            self.retry_delay = Duration::from_secs(secs);
        }
        if let Some(level) = file.log_level {
            self.log_level = level;
        }
        if let Some(dir) = file.log_dir {
            self.log_dir = Some(dir);
        }
    }

    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = env("LEADWATCH_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(path) = env("LEADWATCH_LEADS_PATH") {
            self.leads_path = PathBuf::from(path);
        }
        if let Some(path) = env("LEADWATCH_OUTBOX_PATH") {
            self.outbox_path = PathBuf::from(path);
        }
        if let Some(raw) = env("LEADWATCH_POLL_INTERVAL") {
            let secs = raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("LEADWATCH_POLL_INTERVAL is not a number: {raw:?}"))?;
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(raw) = env("ADMIN_IDS") {
            self.admin_ids = parse_admin_ids(&raw)?;
        }
        if let Some(level) = env("LEADWATCH_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(dir) = env("LEADWATCH_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    fn apply_cli(&mut self, overrides: &CliOverrides) {
        if let Some(path) = &overrides.database {
            self.database_path = path.clone();
        }
        if let Some(path) = &overrides.leads {
            self.leads_path = path.clone();
        }
        if let Some(path) = &overrides.outbox {
            self.outbox_path = path.clone();
        }
        if let Some(secs) = overrides.poll_interval_secs {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(dir) = &overrides.log_dir {
            self.log_dir = Some(dir.clone());
        }
        self.debug |= overrides.debug;
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("poll interval must be at least one second");
        }
        if self.report_hour > 23 {
            bail!("report_hour must be between 0 and 23, got {}", self.report_hour);
        }
        if self.retry_attempts == 0 {
            bail!("retry_attempts must be at least 1");
        }
        Ok(())
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config {}", path.display()))
}

pub fn parse_admin_ids(raw: &str) -> Result<Vec<RecipientId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<RecipientId>()
                .with_context(|| format!("invalid admin id {item:?}"))
        })
        .collect()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("leadwatch")
}
