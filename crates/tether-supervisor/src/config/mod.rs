//! Configuration file model.
//!
//! The file follows the PM2 ecosystem layout (an `apps` list with `script`,
//! `args`, `cwd`, `env`, `max_memory_restart`, ...) plus an optional
//! `supervisor` section for tether itself. JSON files are accepted as well,
//! since JSON is a subset of YAML.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_common::ByteSize;
use tether_process::KillSignal;
use thiserror::Error;

use crate::descriptor::ProcessDescriptor;

pub mod validation;

/// Errors raised while loading a configuration file.
///
/// These are the only errors that reach the operator; the supervisor does
/// not start when one is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub supervisor: SupervisorOptions,
    pub apps: Vec<AppConfig>,

    /// Directory relative `cwd` values are resolved against; set by
    /// [`TetherConfig::load_from_file`].
    #[serde(skip)]
    pub base_directory: Option<PathBuf>,
}

/// Options for tether itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorOptions {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_memory_check_interval", with = "duration_serde")]
    pub memory_check_interval: Duration,
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            memory_check_interval: default_memory_check_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// One application entry (PM2 field names).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,

    /// Executable or script to run
    #[serde(alias = "command")]
    pub script: String,

    #[serde(default)]
    pub args: ArgList,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    #[serde(default, deserialize_with = "env_serde::deserialize")]
    pub env: BTreeMap<String, String>,

    #[serde(default = "default_instances")]
    pub instances: u32,

    #[serde(default = "default_true")]
    pub autorestart: bool,

    #[serde(default)]
    pub watch: WatchSetting,

    #[serde(default)]
    pub ignore_watch: Vec<String>,

    #[serde(default = "default_watch_delay", with = "duration_serde")]
    pub watch_delay: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_restart: Option<ByteSize>,

    /// `none` runs the script directly; absent means inferred from the
    /// script's extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,

    #[serde(default)]
    pub interpreter_args: ArgList,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_min_uptime", with = "duration_serde")]
    pub min_uptime: Duration,

    #[serde(default = "default_restart_delay", with = "duration_serde")]
    pub restart_delay: Duration,

    /// Initial delay of the exponential backoff; replaces `restart_delay`
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "option_duration_serde"
    )]
    pub exp_backoff_restart_delay: Option<Duration>,

    #[serde(default)]
    pub stop_exit_codes: Vec<i32>,

    #[serde(default, with = "signal_serde")]
    pub kill_signal: KillSignal,

    #[serde(default = "default_kill_timeout", with = "duration_serde")]
    pub kill_timeout: Duration,

    #[serde(default = "default_instance_var")]
    pub instance_var: String,

    #[serde(default, alias = "output", skip_serializing_if = "Option::is_none")]
    pub out_file: Option<PathBuf>,

    #[serde(default, alias = "error", skip_serializing_if = "Option::is_none")]
    pub error_file: Option<PathBuf>,
}

/// Arguments given either as one shell-style string or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgList {
    Line(String),
    List(Vec<String>),
}

impl Default for ArgList {
    fn default() -> Self {
        ArgList::List(Vec::new())
    }
}

impl ArgList {
    /// Split into individual arguments using shell quoting rules.
    pub fn to_vec(&self) -> Result<Vec<String>, shell_words::ParseError> {
        match self {
            ArgList::Line(line) => shell_words::split(line),
            ArgList::List(items) => Ok(items.clone()),
        }
    }
}

/// `watch: true|false` or `watch: [paths...]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WatchSetting {
    Enabled(bool),
    Paths(Vec<PathBuf>),
}

impl Default for WatchSetting {
    fn default() -> Self {
        WatchSetting::Enabled(false)
    }
}

impl WatchSetting {
    pub fn is_enabled(&self) -> bool {
        match self {
            WatchSetting::Enabled(enabled) => *enabled,
            WatchSetting::Paths(paths) => !paths.is_empty(),
        }
    }
}

impl TetherConfig {
    /// Load configuration from a YAML (or JSON) file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::load_from_string(&content)?;
        config.base_directory = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf);
        Ok(config)
    }

    /// Load configuration from a YAML string
    pub fn load_from_string(content: &str) -> ConfigResult<Self> {
        let config: TetherConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        validation::validate_config(self)
    }

    /// Build one descriptor per app instance, merging each app's `env` over
    /// the environment of the current process.
    pub fn descriptors(&self) -> ConfigResult<Vec<ProcessDescriptor>> {
        // Variables that are not valid UTF-8 are not forwarded
        let inherited: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect();
        self.descriptors_with_env(&inherited)
    }

    /// Same as [`TetherConfig::descriptors`] with an explicit inherited
    /// environment.
    pub fn descriptors_with_env(
        &self,
        inherited: &HashMap<String, String>,
    ) -> ConfigResult<Vec<ProcessDescriptor>> {
        let base = match &self.base_directory {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(|source| ConfigError::Io {
                path: PathBuf::from("."),
                source,
            })?,
        };

        let mut descriptors = Vec::new();
        for app in &self.apps {
            for instance in 0..app.instances {
                descriptors.push(ProcessDescriptor::from_app(app, instance, inherited, &base)?);
            }
        }
        Ok(descriptors)
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_memory_check_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_instances() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_watch_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_restarts() -> u32 {
    16
}

fn default_min_uptime() -> Duration {
    Duration::from_secs(1)
}

fn default_restart_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_kill_timeout() -> Duration {
    Duration::from_millis(1600)
}

fn default_instance_var() -> String {
    "NODE_APP_INSTANCE".to_string()
}

/// Durations: an integer is milliseconds (PM2), a string takes a
/// `ms`/`s`/`m`/`h` suffix.
pub(crate) mod duration_serde {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("milliseconds or a duration string such as \"10s\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_millis(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_millis)
                    .map_err(|_| E::custom(format!("duration cannot be negative: {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                parse_duration(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let invalid = || format!("Invalid duration: {}", s);

        // Check for "ms" BEFORE "s" since "ms" ends with 's'
        if let Some(num) = s.strip_suffix("ms") {
            num.trim().parse().map(Duration::from_millis).map_err(|_| invalid())
        } else if let Some(num) = s.strip_suffix('s') {
            num.trim().parse().map(Duration::from_secs).map_err(|_| invalid())
        } else if let Some(num) = s.strip_suffix('m') {
            let mins: u64 = num.trim().parse().map_err(|_| invalid())?;
            mins.checked_mul(60).map(Duration::from_secs).ok_or_else(invalid)
        } else if let Some(num) = s.strip_suffix('h') {
            let hours: u64 = num.trim().parse().map_err(|_| invalid())?;
            hours.checked_mul(3600).map(Duration::from_secs).ok_or_else(invalid)
        } else if let Ok(millis) = s.parse() {
            Ok(Duration::from_millis(millis))
        } else {
            Err(format!("Duration must be milliseconds or end with 'ms', 's', 'm' or 'h': {}", s))
        }
    }
}

mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(transparent)]
    struct Wrapped(#[serde(with = "super::duration_serde")] Duration);

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::duration_serde::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|w| w.0))
    }
}

mod signal_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use tether_process::KillSignal;

    pub fn serialize<S>(signal: &KillSignal, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(signal.name())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<KillSignal, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Environment values may be written as numbers or booleans in YAML; they
/// are stored as the strings the child will see.
mod env_serde {
    use serde::{Deserialize, Deserializer};
    use std::collections::BTreeMap;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Bool(bool),
        Integer(i64),
        Float(f64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, Scalar>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Scalar::Bool(b) => b.to_string(),
                    Scalar::Integer(i) => i.to_string(),
                    Scalar::Float(f) => f.to_string(),
                    Scalar::Text(s) => s,
                };
                (key, value)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DASHBOARD: &str = r#"
apps:
  - name: streamlit_dashboard
    script: python
    args: "-m streamlit run app.py --server.port 8501 --server.address 0.0.0.0 --server.headless true"
    cwd: /home/user/webapp_fresh
    env:
      PYTHONPATH: /home/user/webapp_fresh
      STREAMLIT_DISABLE_DATAFRAME_ARROW_CONVERSION: 1
    instances: 1
    autorestart: true
    watch: false
    max_memory_restart: 1G
    interpreter: none
"#;

    #[test]
    fn test_load_dashboard_config() {
        let config = TetherConfig::load_from_string(DASHBOARD).unwrap();
        assert_eq!(config.apps.len(), 1);

        let app = &config.apps[0];
        assert_eq!(app.name, "streamlit_dashboard");
        assert_eq!(app.script, "python");
        assert_eq!(app.max_memory_restart, Some(ByteSize::from_gib(1)));
        assert_eq!(app.interpreter.as_deref(), Some("none"));
        assert!(!app.watch.is_enabled());
        assert_eq!(app.env["STREAMLIT_DISABLE_DATAFRAME_ARROW_CONVERSION"], "1");

        let args = app.args.to_vec().unwrap();
        assert_eq!(args[..4], ["-m", "streamlit", "run", "app.py"]);
        assert_eq!(args.len(), 10);
    }

    #[test]
    fn test_defaults() {
        let config = TetherConfig::load_from_string("apps:\n  - name: web\n    script: ./server\n").unwrap();
        let app = &config.apps[0];

        assert_eq!(config.supervisor.memory_check_interval, Duration::from_secs(1));
        assert_eq!(config.supervisor.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(app.instances, 1);
        assert!(app.autorestart);
        assert_eq!(app.max_restarts, 16);
        assert_eq!(app.min_uptime, Duration::from_secs(1));
        assert_eq!(app.kill_signal, KillSignal::Term);
        assert_eq!(app.kill_timeout, Duration::from_millis(1600));
        assert_eq!(app.instance_var, "NODE_APP_INSTANCE");
        assert_eq!(app.exp_backoff_restart_delay, None);
        assert_eq!(app.max_memory_restart, None);
    }

    #[test]
    fn test_json_config_and_aliases() {
        let json = r#"{
            "apps": [{
                "name": "worker",
                "command": "/usr/bin/env",
                "args": ["python3", "worker.py"],
                "max_memory_restart": 1073741824,
                "kill_timeout": 3000,
                "exp_backoff_restart_delay": 100,
                "kill_signal": "SIGINT",
                "watch": ["src", "lib"]
            }]
        }"#;

        let config = TetherConfig::load_from_string(json).unwrap();
        let app = &config.apps[0];
        assert_eq!(app.script, "/usr/bin/env");
        assert_eq!(app.args, ArgList::List(vec!["python3".into(), "worker.py".into()]));
        assert_eq!(app.max_memory_restart, Some(ByteSize::from_gib(1)));
        assert_eq!(app.kill_timeout, Duration::from_secs(3));
        assert_eq!(app.exp_backoff_restart_delay, Some(Duration::from_millis(100)));
        assert_eq!(app.kill_signal, KillSignal::Int);
        assert!(app.watch.is_enabled());
    }

    #[test]
    fn test_duration_formats() {
        use duration_serde::parse_duration;

        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1500").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("307445734561825861m").is_err());
        assert!(parse_duration("5124095576030432h").is_err());
    }

    #[test]
    fn test_parse_errors() {
        let err = TetherConfig::load_from_string("apps: [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = TetherConfig::load_from_string(
            "apps:\n  - name: web\n    script: ./server\n    max_memory_restart: 1Q\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = TetherConfig::load_from_string(
            "apps:\n  - name: web\n    script: ./server\n    min_uptime: 307445734561825861m\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = TetherConfig::load_from_file("/no/such/tether.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_base_directory_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecosystem.yaml");
        std::fs::write(&path, "apps:\n  - name: web\n    script: ./server\n    cwd: app\n").unwrap();

        let config = TetherConfig::load_from_file(&path).unwrap();
        assert_eq!(config.base_directory.as_deref(), Some(dir.path()));

        let descriptors = config.descriptors_with_env(&HashMap::new()).unwrap();
        assert_eq!(descriptors[0].working_directory, dir.path().join("app"));
    }
}
