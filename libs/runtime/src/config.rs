use anyhow::{bail, Context, Result};
use ctxkit::BindingScope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variables with this prefix override file values,
/// e.g. `CTXKIT__CONTEXT__NAME=worker` sets `context.name`.
pub const ENV_PREFIX: &str = "CTXKIT__";

/// Logging section applied to every target without its own section.
pub const DEFAULT_SECTION: &str = "default";

/// Application configuration: the root context plus the values seeded into it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Root context settings.
    #[serde(default)]
    pub context: ContextConfig,
    /// Base directory for relative log files (defaults to the working directory).
    #[serde(default)]
    pub home_dir: Option<String>,
    /// Logging configuration (optional, console defaults if None).
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    /// Constant bindings: key → JSON/YAML value.
    #[serde(default)]
    pub bindings: BTreeMap<String, serde_json::Value>,
    /// Configuration for bindings, bound at `<key>:$config`.
    #[serde(default)]
    pub configs: BTreeMap<String, serde_json::Value>,
    /// Directory of `<key>.yaml` files merged into `configs`.
    #[serde(default)]
    pub configs_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    pub name: String,
    /// Scope given to the seeded constant bindings.
    #[serde(default)]
    pub default_scope: BindingScope,
    /// Lock seeded bindings so they cannot be rebound.
    #[serde(default)]
    pub lock_bindings: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            name: "application".to_string(),
            default_scope: BindingScope::Transient,
            lock_bindings: false,
        }
    }
}

/// Logging configuration: target prefix → settings. The
/// [`DEFAULT_SECTION`] entry covers everything not listed explicitly.
pub type LoggingConfig = BTreeMap<String, LogSection>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogSection {
    /// "trace", "debug", "info", "warn", "error" or "off".
    pub console_level: String,
    /// Log file path, empty for console only.
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub file_level: String,
    /// Keep rotated files younger than this (used when `max_backups` is unset).
    #[serde(default)]
    pub max_age_days: Option<u32>,
    /// How many rotated files to keep.
    #[serde(default)]
    pub max_backups: Option<usize>,
    /// Rotate once the file grows past this size.
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            console_level: "info".to_string(),
            file: String::new(),
            file_level: "debug".to_string(),
            max_age_days: None,
            max_backups: Some(3),
            max_size_mb: Some(100),
        }
    }
}

/// Console-only logging at `info`.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = BTreeMap::new();
    logging.insert(DEFAULT_SECTION.to_string(), LogSection::default());
    logging
}

impl AppConfig {
    /// Defaults → YAML file → `CTXKIT__*` environment variables.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        Self::load_with_env(config_path.as_ref(), ENV_PREFIX)
    }

    fn load_with_env(config_path: &Path, env_prefix: &str) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        if !config_path.is_file() {
            bail!("config file not found: {}", config_path.display());
        }

        let figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(config_path))
            .merge(Env::prefixed(env_prefix).split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

        if let Some(dir) = config.configs_dir.clone() {
            let dir = match config_path.parent() {
                Some(base) if Path::new(&dir).is_relative() => base.join(dir),
                _ => PathBuf::from(dir),
            };
            merge_config_files(&mut config.configs, &dir)
                .with_context(|| format!("Failed to read configs_dir {}", dir.display()))?;
        }

        Ok(config)
    }

    /// Load `config_path` if given, otherwise use defaults.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => Ok(Self {
                logging: Some(default_logging_config()),
                ..Self::default()
            }),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Directory relative log paths are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        match &self.home_dir {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => PathBuf::from("."),
        }
    }

    /// `-v` raises the default console level to debug, `-vv` to trace.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let logging = self.logging.get_or_insert_with(default_logging_config);
        let section = logging
            .entry(DEFAULT_SECTION.to_string())
            .or_default();
        match args.verbose {
            0 => {}
            1 => section.console_level = "debug".to_string(),
            _ => section.console_level = "trace".to_string(),
        }
    }
}

/// Command line arguments relevant to configuration loading.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
}

fn merge_config_files(
    configs: &mut BTreeMap<String, serde_json::Value>,
    dir: &Path,
) -> Result<()> {
    use std::fs;
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext != "yml" && ext != "yaml" {
            continue;
        }
        let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let raw = fs::read_to_string(&path)?;
        let value: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?;
        configs.insert(key.to_string(), serde_json::to_value(value)?);
    }
    Ok(())
}
