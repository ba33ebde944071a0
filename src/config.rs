//! Engine configuration and on-disk layout.
//!
//! Configuration is an optional TOML file; every field has a default, so an
//! engine started with no file at all is fully configured:
//!
//! ```toml
//! data_root = "/var/lib/distroforge"
//!
//! [build]
//! tool = ["sudo", "mkarchiso"]
//! log_poll_interval_ms = 1000
//! download_base = "/isos"
//!
//! [logging]
//! level = "info"
//! format = "pretty"   # or "json"
//! ```
//!
//! The file is taken from `--config`, else `$DISTROFORGE_CONFIG`, else
//! `<data_root>/engine.toml` when it exists. `$DISTROFORGE_HOME` overrides
//! `data_root`.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::Deserialize;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::drivers::arch::{ArchPaths, BuildSettings};

pub const CONFIG_ENV: &str = "DISTROFORGE_CONFIG";
pub const HOME_ENV: &str = "DISTROFORGE_HOME";
pub const LOG_FORMAT_ENV: &str = "DISTROFORGE_LOG_FORMAT";

pub const CONFIG_FILE_NAME: &str = "engine.toml";
const LOCK_FILE_NAME: &str = "engine.lock";
const DATA_DIR_NAME: &str = ".distroforge";
const FALLBACK_DATA_DIR_NAME: &str = ".distroforge_data_fallback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => bail!("unsupported log format '{}' (expected 'pretty' or 'json')", other),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Build tool program and leading arguments.
    pub tool: Vec<String>,
    pub log_poll_interval_ms: u64,
    pub download_base: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tool: vec!["sudo".to_string(), "mkarchiso".to_string()],
            log_poll_interval_ms: 1000,
            download_base: "/isos".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EngineToml {
    data_root: Option<PathBuf>,
    build: BuildConfig,
    logging: LoggingConfig,
}

/// Where configuration may come from. Split out from the process
/// environment so resolution is testable.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// `--config <path>`.
    pub cli_config: Option<PathBuf>,
    pub env_config: Option<PathBuf>,
    pub env_home: Option<PathBuf>,
    pub env_log_format: Option<String>,
    /// Data root used when neither the file nor the environment names one.
    pub default_data_root: PathBuf,
}

impl ConfigSources {
    pub fn from_env(cli_config: Option<PathBuf>) -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            cli_config,
            env_config: non_empty(CONFIG_ENV).map(PathBuf::from),
            env_home: non_empty(HOME_ENV).map(PathBuf::from),
            env_log_format: non_empty(LOG_FORMAT_ENV),
            default_data_root: default_data_root(),
        }
    }
}

/// `$HOME/.distroforge`, or `<cwd>/.distroforge_data_fallback` when no home
/// directory is known.
pub fn default_data_root() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(DATA_DIR_NAME),
        None => std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(FALLBACK_DATA_DIR_NAME),
    }
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub data_root: PathBuf,
    pub build: BuildConfig,
    pub logging: LoggingConfig,
    /// The file this was loaded from, if any.
    pub source: Option<PathBuf>,
}

impl EngineConfig {
    pub fn load(sources: &ConfigSources) -> Result<Self> {
        let base_root = sources
            .env_home
            .clone()
            .unwrap_or_else(|| sources.default_data_root.clone());

        let explicit = sources.cli_config.as_ref().or(sources.env_config.as_ref());
        let file = match explicit {
            Some(path) => {
                if !path.is_file() {
                    bail!("config file '{}' does not exist", path.display());
                }
                Some(path.clone())
            }
            None => {
                let candidate = base_root.join(CONFIG_FILE_NAME);
                candidate.is_file().then_some(candidate)
            }
        };

        let parsed = match &file {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("reading config '{}'", path.display()))?;
                toml::from_str::<EngineToml>(&content)
                    .with_context(|| format!("parsing config '{}'", path.display()))?
            }
            None => EngineToml::default(),
        };

        let mut logging = parsed.logging;
        if let Some(format) = &sources.env_log_format {
            logging.format = format
                .parse()
                .with_context(|| format!("invalid {}", LOG_FORMAT_ENV))?;
        }

        let data_root = match (&sources.env_home, parsed.data_root) {
            (Some(home), _) => home.clone(),
            (None, Some(root)) => root,
            (None, None) => base_root,
        };

        let config = Self {
            data_root,
            build: parsed.build,
            logging,
            source: file,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let origin = self
            .source
            .as_ref()
            .map(|p| format!("config '{}'", p.display()))
            .unwrap_or_else(|| "default config".to_string());

        if self.build.tool.is_empty() || self.build.tool[0].trim().is_empty() {
            bail!("invalid {}: build.tool must name a program", origin);
        }
        if self.build.log_poll_interval_ms == 0 {
            bail!("invalid {}: build.log_poll_interval_ms must be positive", origin);
        }
        Ok(())
    }

    pub fn projects_root(&self) -> PathBuf {
        self.data_root.join("projects")
    }

    pub fn isos_root(&self) -> PathBuf {
        self.data_root.join("isos")
    }

    pub fn arch_work_root(&self) -> PathBuf {
        self.data_root.join("work").join("archiso")
    }

    pub fn arch_paths(&self) -> ArchPaths {
        ArchPaths {
            projects_root: self.projects_root(),
            isos_root: self.isos_root(),
            work_root: self.arch_work_root(),
        }
    }

    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            tool: self.build.tool.clone(),
            log_poll_interval: Duration::from_millis(self.build.log_poll_interval_ms),
            download_base: self.build.download_base.clone(),
        }
    }
}

/// Exclusive hold on a data root. Released when dropped.
#[derive(Debug)]
pub struct DataRootLock {
    _file: File,
    path: PathBuf,
}

impl DataRootLock {
    /// Lock `<data_root>/engine.lock`, failing if another engine holds it.
    pub fn acquire(data_root: &Path) -> Result<Self> {
        fs::create_dir_all(data_root)
            .with_context(|| format!("creating data root '{}'", data_root.display()))?;
        let path = data_root.join(LOCK_FILE_NAME);

        // The lock file is never unlinked: removing a file another process
        // still holds would let a third process lock a fresh inode.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening engine lock '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            bail!(
                "data root '{}' is in use by another engine (lock: {})",
                data_root.display(),
                path.display()
            );
        }
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sources(tmp: &TempDir) -> ConfigSources {
        ConfigSources {
            default_data_root: tmp.path().join("default-root"),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_without_any_file() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::load(&sources(&tmp)).unwrap();

        assert_eq!(config.data_root, tmp.path().join("default-root"));
        assert_eq!(config.build, BuildConfig::default());
        assert_eq!(config.build.tool, vec!["sudo", "mkarchiso"]);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.source, None);
        assert_eq!(
            config.arch_work_root(),
            tmp.path().join("default-root/work/archiso")
        );
    }

    #[test]
    fn explicit_file_overrides_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("custom.toml");
        fs::write(
            &path,
            r#"
data_root = "/srv/forge"

[build]
tool = ["mkarchiso"]
log_poll_interval_ms = 250

[logging]
format = "json"
"#,
        )
        .unwrap();

        let config = EngineConfig::load(&ConfigSources {
            cli_config: Some(path.clone()),
            ..sources(&tmp)
        })
        .unwrap();

        assert_eq!(config.data_root, PathBuf::from("/srv/forge"));
        assert_eq!(config.build.tool, vec!["mkarchiso"]);
        assert_eq!(
            config.build_settings().log_poll_interval,
            Duration::from_millis(250)
        );
        // Unset fields keep their defaults.
        assert_eq!(config.build.download_base, "/isos");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.source, Some(path));
    }

    #[test]
    fn cli_path_wins_over_env_path() {
        let tmp = TempDir::new().unwrap();
        let cli = tmp.path().join("cli.toml");
        let env = tmp.path().join("env.toml");
        fs::write(&cli, "[build]\ndownload_base = \"/cli\"\n").unwrap();
        fs::write(&env, "[build]\ndownload_base = \"/env\"\n").unwrap();

        let config = EngineConfig::load(&ConfigSources {
            cli_config: Some(cli),
            env_config: Some(env.clone()),
            ..sources(&tmp)
        })
        .unwrap();
        assert_eq!(config.build.download_base, "/cli");

        let config = EngineConfig::load(&ConfigSources {
            env_config: Some(env),
            ..sources(&tmp)
        })
        .unwrap();
        assert_eq!(config.build.download_base, "/env");
    }

    #[test]
    fn file_in_data_root_is_picked_up() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("home");
        fs::create_dir_all(&home).unwrap();
        fs::write(home.join(CONFIG_FILE_NAME), "data_root = \"/ignored\"\n").unwrap();

        let config = EngineConfig::load(&ConfigSources {
            env_home: Some(home.clone()),
            ..sources(&tmp)
        })
        .unwrap();
        // DISTROFORGE_HOME beats data_root from the file.
        assert_eq!(config.data_root, home);
        assert_eq!(config.source, Some(home.join(CONFIG_FILE_NAME)));
    }

    #[test]
    fn env_log_format_overrides_file() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::load(&ConfigSources {
            env_log_format: Some("JSON".into()),
            ..sources(&tmp)
        })
        .unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);

        assert!(EngineConfig::load(&ConfigSources {
            env_log_format: Some("xml".into()),
            ..sources(&tmp)
        })
        .is_err());
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        let load = |content: &str| {
            fs::write(&path, content).unwrap();
            EngineConfig::load(&ConfigSources {
                cli_config: Some(path.clone()),
                ..sources(&tmp)
            })
        };

        assert!(load("[build]\ntools = [\"x\"]\n").is_err());
        assert!(load("[build]\ntool = []\n").is_err());
        assert!(load("[build]\nlog_poll_interval_ms = 0\n").is_err());
        assert!(load("[logging]\nformat = \"xml\"\n").is_err());
        assert!(load("[build]\ntool = [\"mkarchiso\"]\n").is_ok());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = EngineConfig::load(&ConfigSources {
            cli_config: Some(tmp.path().join("nope.toml")),
            ..sources(&tmp)
        })
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn second_lock_on_same_root_fails() {
        let tmp = TempDir::new().unwrap();
        let first = DataRootLock::acquire(tmp.path()).unwrap();
        assert!(first.path().ends_with("engine.lock"));

        let err = DataRootLock::acquire(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("in use by another engine"));

        drop(first);
        assert!(DataRootLock::acquire(tmp.path()).is_ok());
    }
}
