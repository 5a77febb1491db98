use crate::cache_dir::CacheDir;
use crate::locator::AssetReference;
use crate::sweeper::RetentionInterval;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Demo length when neither the asset nor the global config names one.
pub const DEFAULT_DEMO_PERCENT: u8 = 30;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;
/// Time a build may spend after its fetch (truncation and publish).
pub const BUILD_WAIT_MARGIN_SECS: u64 = 120;
pub const DEFAULT_BUILD_WAIT_TIMEOUT_SECS: u64 = DEFAULT_FETCH_TIMEOUT_SECS + BUILD_WAIT_MARGIN_SECS;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_true() -> bool {
    true
}

/// Settings that may be given globally and overridden per asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetSettings {
    /// Percentage of the source kept in demos (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demo_percent: Option<u8>,
    /// Serve uploaded demo files as-is instead of truncating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_demo_mode: Option<bool>,
}

/// YAML config file structure (`demotape.yaml` in the base directory)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigYaml {
    #[serde(flatten)]
    pub global: AssetSettings,
    /// How long full copies for buyers are kept
    #[serde(default)]
    pub retention_interval: RetentionInterval,
    /// Treat extensionless remote URLs as audio
    #[serde(default = "default_true")]
    pub default_extension_fallback: bool,
    pub fetch_timeout_secs: Option<u64>,
    pub build_wait_timeout_secs: Option<u64>,
    /// Overrides keyed by asset reference (`"{product_id}:{track_index}"`)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub per_asset: HashMap<String, AssetSettings>,
}

/// Engine configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub base_dir: PathBuf,
    pub global: AssetSettings,
    pub per_asset: HashMap<AssetReference, AssetSettings>,
    pub retention_interval: RetentionInterval,
    pub default_extension_fallback: bool,
    pub fetch_timeout: Duration,
    pub build_wait_timeout: Duration,
}

impl Config {
    /// Dev mode (`DEMOTAPE_DEV_MODE` or a `.env` file) reads `DEMOTAPE_*`
    /// variables; otherwise `demotape.yaml` in the base directory.
    pub fn load(base_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let dev_mode = std::env::var("DEMOTAPE_DEV_MODE").is_ok() || dotenvy::dotenv().is_ok();
        if dev_mode {
            info!("Dev mode activated - loading from environment");
            Self::from_env(base_dir)
        } else {
            let base_dir = match base_dir {
                Some(dir) => dir,
                None => default_base_dir()?,
            };
            info!("Loading {}", CacheDir::new(&base_dir).config_path().display());
            Self::from_config_file(&base_dir)
        }
    }

    fn from_env(base_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let base_dir = match base_dir.or_else(|| env_var("DEMOTAPE_BASE_DIR").map(PathBuf::from)) {
            Some(dir) => dir,
            None => default_base_dir()?,
        };

        let yaml = ConfigYaml {
            global: AssetSettings {
                demo_percent: env_parse("DEMOTAPE_DEMO_PERCENT")?,
                direct_demo_mode: env_parse("DEMOTAPE_DIRECT_DEMO_MODE")?,
            },
            retention_interval: env_parse("DEMOTAPE_RETENTION_INTERVAL")?.unwrap_or_default(),
            default_extension_fallback: env_parse("DEMOTAPE_DEFAULT_EXTENSION_FALLBACK")?
                .unwrap_or(true),
            fetch_timeout_secs: env_parse("DEMOTAPE_FETCH_TIMEOUT_SECS")?,
            build_wait_timeout_secs: env_parse("DEMOTAPE_BUILD_WAIT_TIMEOUT_SECS")?,
            per_asset: HashMap::new(),
        };
        Self::from_yaml(base_dir, yaml)
    }

    /// Read `demotape.yaml` under `base_dir`. A missing file means defaults.
    pub fn from_config_file(base_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = CacheDir::new(base_dir).config_path();
        let yaml = match std::fs::read_to_string(&config_path) {
            Ok(raw) => serde_yaml::from_str(&raw).map_err(|e| {
                ConfigError::Serialization(format!("{}: {}", config_path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("No {}, using defaults", config_path.display());
                ConfigYaml::default_values()
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_yaml(base_dir.to_path_buf(), yaml)
    }

    pub fn from_yaml(base_dir: PathBuf, yaml: ConfigYaml) -> Result<Self, ConfigError> {
        validate(&yaml.global, "global")?;

        let mut per_asset = HashMap::with_capacity(yaml.per_asset.len());
        for (reference, settings) in yaml.per_asset {
            let parsed: AssetReference = reference
                .parse()
                .map_err(|_| ConfigError::Config(format!("invalid asset reference: {reference}")))?;
            validate(&settings, &reference)?;
            per_asset.insert(parsed, settings);
        }

        let fetch_secs = yaml.fetch_timeout_secs.unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);
        let min_wait = fetch_secs.saturating_add(BUILD_WAIT_MARGIN_SECS);
        let wait_secs = match yaml.build_wait_timeout_secs {
            None => min_wait,
            Some(secs) if secs <= fetch_secs => {
                warn!(
                    "build_wait_timeout_secs {} does not cover fetch_timeout_secs {}, using {}",
                    secs, fetch_secs, min_wait
                );
                min_wait
            }
            Some(secs) => secs,
        };

        Ok(Self {
            base_dir,
            global: yaml.global,
            per_asset,
            retention_interval: yaml.retention_interval,
            default_extension_fallback: yaml.default_extension_fallback,
            fetch_timeout: Duration::from_secs(fetch_secs),
            build_wait_timeout: Duration::from_secs(wait_secs),
        })
    }

    pub fn cache_dir(&self) -> CacheDir {
        CacheDir::new(&self.base_dir)
    }

    pub fn resolver(&self) -> SettingsResolver {
        SettingsResolver {
            global: self.global.clone(),
            per_asset: self.per_asset.clone(),
        }
    }

    pub fn save_to_config_yaml(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.base_dir)?;
        let yaml = ConfigYaml {
            global: self.global.clone(),
            retention_interval: self.retention_interval,
            default_extension_fallback: self.default_extension_fallback,
            fetch_timeout_secs: Some(self.fetch_timeout.as_secs()),
            build_wait_timeout_secs: Some(self.build_wait_timeout.as_secs()),
            per_asset: self
                .per_asset
                .iter()
                .map(|(r, s)| (r.to_string(), s.clone()))
                .collect(),
        };
        let raw = serde_yaml::to_string(&yaml).map_err(|e| ConfigError::Serialization(e.to_string()))?;
        std::fs::write(self.cache_dir().config_path(), raw)?;
        Ok(())
    }
}

impl ConfigYaml {
    /// Field defaults; `Default` would turn the extension fallback off.
    pub fn default_values() -> Self {
        Self {
            default_extension_fallback: true,
            ..Self::default()
        }
    }
}

/// `dirs::data_dir()/demotape`
pub fn default_base_dir() -> Result<PathBuf, ConfigError> {
    dirs::data_dir()
        .map(|d| d.join("demotape"))
        .ok_or_else(|| ConfigError::Config("no data directory on this platform".into()))
}

fn validate(settings: &AssetSettings, scope: &str) -> Result<(), ConfigError> {
    match settings.demo_percent {
        Some(p) if p > 100 => Err(ConfigError::Config(format!(
            "{scope}: demo_percent {p} is outside 0-100"
        ))),
        _ => Ok(()),
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    env_var(name)
        .map(|raw| {
            raw.parse()
                .map_err(|e| ConfigError::Config(format!("{name}={raw}: {e}")))
        })
        .transpose()
}

/// Two-level settings lookup: per-asset override, then global, then default.
#[derive(Clone, Debug, Default)]
pub struct SettingsResolver {
    global: AssetSettings,
    per_asset: HashMap<AssetReference, AssetSettings>,
}

impl SettingsResolver {
    pub fn new(global: AssetSettings, per_asset: HashMap<AssetReference, AssetSettings>) -> Self {
        Self { global, per_asset }
    }

    pub fn resolve<T>(
        &self,
        reference: &AssetReference,
        field: impl Fn(&AssetSettings) -> Option<T>,
        default: T,
    ) -> T {
        self.per_asset
            .get(reference)
            .and_then(&field)
            .or_else(|| field(&self.global))
            .unwrap_or(default)
    }

    pub fn demo_percent(&self, reference: &AssetReference) -> u8 {
        self.resolve(reference, |s| s.demo_percent, DEFAULT_DEMO_PERCENT)
    }

    pub fn direct_demo_mode(&self, reference: &AssetReference) -> bool {
        self.resolve(reference, |s| s.direct_demo_mode, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_yaml_parses_flat_globals() {
        let yaml = "demo_percent: 25\nretention_interval: never\ndirect_demo_mode: true\n";
        let config: ConfigYaml = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.global.demo_percent, Some(25));
        assert_eq!(config.global.direct_demo_mode, Some(true));
        assert_eq!(config.retention_interval, RetentionInterval::Never);
        assert!(config.default_extension_fallback);
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::from_config_file(tmp.path()).unwrap();
        assert_eq!(config.retention_interval, RetentionInterval::Daily);
        assert!(config.default_extension_fallback);
        assert_eq!(config.fetch_timeout, Duration::from_secs(300));
        assert_eq!(
            config.resolver().demo_percent(&AssetReference::new(1, 0)),
            DEFAULT_DEMO_PERCENT
        );
    }

    #[test]
    fn build_wait_outlasts_fetch_timeout() {
        let tmp = TempDir::new().unwrap();
        let config = Config::from_config_file(tmp.path()).unwrap();
        assert!(config.build_wait_timeout > config.fetch_timeout);
        assert_eq!(
            config.build_wait_timeout,
            Duration::from_secs(DEFAULT_BUILD_WAIT_TIMEOUT_SECS)
        );

        let derived: ConfigYaml = serde_yaml::from_str("fetch_timeout_secs: 60
").unwrap();
        let config = Config::from_yaml(tmp.path().to_path_buf(), derived).unwrap();
        assert_eq!(config.build_wait_timeout, Duration::from_secs(60 + BUILD_WAIT_MARGIN_SECS));

        let too_short: ConfigYaml =
            serde_yaml::from_str("fetch_timeout_secs: 60
build_wait_timeout_secs: 30
").unwrap();
        let config = Config::from_yaml(tmp.path().to_path_buf(), too_short).unwrap();
        assert_eq!(config.build_wait_timeout, Duration::from_secs(60 + BUILD_WAIT_MARGIN_SECS));

        let explicit: ConfigYaml =
            serde_yaml::from_str("fetch_timeout_secs: 60
build_wait_timeout_secs: 900
").unwrap();
        let config = Config::from_yaml(tmp.path().to_path_buf(), explicit).unwrap();
        assert_eq!(config.build_wait_timeout, Duration::from_secs(900));
    }

    #[test]
    fn save_and_load_config_yaml_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let yaml = "demo_percent: 40\nper_asset:\n  \"7:2\":\n    demo_percent: 10\n";
        let config = Config::from_yaml(tmp.path().to_path_buf(), serde_yaml::from_str(yaml).unwrap())
            .unwrap();
        config.save_to_config_yaml().unwrap();

        let loaded = Config::from_config_file(tmp.path()).unwrap();
        assert_eq!(loaded.global.demo_percent, Some(40));
        assert_eq!(
            loaded.per_asset.get(&AssetReference::new(7, 2)).unwrap().demo_percent,
            Some(10)
        );
    }

    #[test]
    fn out_of_range_percent_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let yaml: ConfigYaml = serde_yaml::from_str("demo_percent: 150\n").unwrap();
        assert!(matches!(
            Config::from_yaml(tmp.path().to_path_buf(), yaml),
            Err(ConfigError::Config(_))
        ));
    }

    #[test]
    fn bad_per_asset_key_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let yaml: ConfigYaml =
            serde_yaml::from_str("per_asset:\n  not-a-ref:\n    demo_percent: 5\n").unwrap();
        assert!(Config::from_yaml(tmp.path().to_path_buf(), yaml).is_err());
    }

    #[test]
    fn corrupt_yaml_is_a_serialization_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("demotape.yaml"), "demo_percent: [oops").unwrap();
        assert!(matches!(
            Config::from_config_file(tmp.path()),
            Err(ConfigError::Serialization(_))
        ));
    }

    #[test]
    fn resolver_prefers_override_then_global_then_default() {
        let track = AssetReference::new(1, 0);
        let other = AssetReference::new(2, 0);
        let per_asset = HashMap::from([(
            track,
            AssetSettings {
                demo_percent: Some(10),
                direct_demo_mode: None,
            },
        )]);

        let resolver = SettingsResolver::new(
            AssetSettings {
                demo_percent: Some(50),
                direct_demo_mode: Some(true),
            },
            per_asset.clone(),
        );
        assert_eq!(resolver.demo_percent(&track), 10);
        assert_eq!(resolver.demo_percent(&other), 50);
        assert!(resolver.direct_demo_mode(&track));

        let bare = SettingsResolver::new(AssetSettings::default(), per_asset);
        assert_eq!(bare.demo_percent(&other), DEFAULT_DEMO_PERCENT);
        assert!(!bare.direct_demo_mode(&track));
    }
}
