use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat, Source};
use serde::Deserialize;

use crate::metadata::CaseRules;

pub const CONFIG_FILE: &str = "site_scrape";
pub const ENV_PREFIX: &str = "SITE_SCRAPE";

/// Global knobs, layered: built-in defaults, then `site_scrape.toml` in the
/// working directory, then `SITE_SCRAPE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sites_dir: PathBuf,
    pub user_agent: String,
    pub fetch_timeout_secs: u64,
    pub max_retries: u32,
    pub detail_concurrency: usize,
    /// Records mentioning any of these terms are never dispatched.
    pub ignored: Vec<String>,
    pub request_delay_ms: u64,
    /// Exact spellings for names, studios, tags and titles.
    pub case_overrides: Vec<String>,
    pub tag_case_overrides: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            sites_dir: PathBuf::from("sites"),
            user_agent: format!("site_scrape/{}", env!("CARGO_PKG_VERSION")),
            fetch_timeout_secs: 30,
            max_retries: 3,
            detail_concurrency: 4,
            ignored: Vec::new(),
            request_delay_ms: 0,
            case_overrides: Vec::new(),
            tag_case_overrides: Vec::new(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_sources(
            File::with_name(CONFIG_FILE).required(false),
            environment(ENV_PREFIX),
        )
    }

    fn from_sources(
        file: impl Source + Send + Sync + 'static,
        env: Environment,
    ) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()
    }

    /// Parse settings from TOML text, still honouring `env`.
    pub fn from_toml(text: &str, env: Environment) -> Result<Self, ConfigError> {
        Self::from_sources(File::from_str(text, FileFormat::Toml), env)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn case_rules(&self) -> CaseRules {
        CaseRules::new(self.case_overrides.clone(), self.tag_case_overrides.clone())
    }
}

pub fn environment(prefix: &str) -> Environment {
    Environment::with_prefix(prefix)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("ignored")
        .with_list_parse_key("case_overrides")
        .with_list_parse_key("tag_case_overrides")
}
