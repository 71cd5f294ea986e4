//! Immutable launch descriptors.
//!
//! A [`ProcessDescriptor`] is built once per app instance when the
//! configuration is loaded. Arguments are split, the interpreter is
//! resolved, the environment is merged and all paths are made absolute, so
//! nothing is re-parsed while the process is supervised.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_common::ByteSize;
use tether_process::{KillSignal, LaunchSpec, OutputTarget};

use crate::config::{AppConfig, ConfigError, ConfigResult, WatchSetting};
use crate::lifecycle::{Backoff, RestartPolicy};

/// Id of one instance: the app name when it runs a single instance,
/// `name-<index>` otherwise.
pub fn instance_id(name: &str, instance: u32, instance_count: u32) -> String {
    if instance_count <= 1 {
        name.to_string()
    } else {
        format!("{}-{}", name, instance)
    }
}

/// Fully merged environment handed to the child.
///
/// The child is spawned with exactly this mapping; the supervisor's own
/// environment is never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// Merge `overrides` over `inherited`; override values win.
    pub fn merge(inherited: &HashMap<String, String>, overrides: &BTreeMap<String, String>) -> Self {
        let mut vars: BTreeMap<String, String> = inherited
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(vars)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl From<BTreeMap<String, String>> for Environment {
    fn from(vars: BTreeMap<String, String>) -> Self {
        Self(vars)
    }
}

/// What the file watcher looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    pub roots: Vec<PathBuf>,
    /// Directory names, `*.ext` patterns or absolute paths to skip
    pub ignore: Vec<String>,
    pub delay: Duration,
}

/// Everything needed to supervise one process instance.
#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub id: String,
    pub name: String,
    pub instance: u32,
    pub instance_count: u32,
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: Environment,
    pub autorestart: bool,
    pub watch: Option<WatchSpec>,
    pub memory_ceiling: Option<ByteSize>,
    pub restart: RestartPolicy,
    pub stop_exit_codes: Vec<i32>,
    pub kill_signal: KillSignal,
    pub kill_timeout: Duration,
    pub stdout: OutputTarget,
    pub stderr: OutputTarget,
}

impl ProcessDescriptor {
    /// A single-instance descriptor with default policy.
    pub fn new(id: impl Into<String>, command: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            instance: 0,
            instance_count: 1,
            command: command.into(),
            args: Vec::new(),
            working_directory: working_directory.into(),
            environment: Environment::default(),
            autorestart: true,
            watch: None,
            memory_ceiling: None,
            restart: RestartPolicy::default(),
            stop_exit_codes: Vec::new(),
            kill_signal: KillSignal::default(),
            kill_timeout: Duration::from_millis(1600),
            stdout: OutputTarget::Inherit,
            stderr: OutputTarget::Inherit,
        }
    }

    /// Build the descriptor of instance `instance` of `app`.
    pub fn from_app(
        app: &AppConfig,
        instance: u32,
        inherited: &HashMap<String, String>,
        base_directory: &Path,
    ) -> ConfigResult<Self> {
        let split = |field: &str, list: &crate::config::ArgList| {
            list.to_vec().map_err(|e| {
                ConfigError::validation(format!("App {}: cannot split {}: {}", app.name, field, e))
            })
        };
        let args = split("args", &app.args)?;
        let interpreter_args = split("interpreter_args", &app.interpreter_args)?;

        let (command, args) =
            resolve_invocation(&app.script, args, app.interpreter.as_deref(), interpreter_args);

        let working_directory = match &app.cwd {
            Some(cwd) => base_directory.join(cwd),
            None => base_directory.to_path_buf(),
        };

        let mut overrides = BTreeMap::new();
        overrides.insert(app.instance_var.clone(), instance.to_string());
        overrides.extend(app.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let environment = Environment::merge(inherited, &overrides);

        let log_path = |path: &PathBuf| {
            per_instance_path(&working_directory.join(path), instance, app.instances)
        };
        let out_file = app.out_file.as_ref().map(log_path);
        let error_file = app.error_file.as_ref().map(log_path);

        let watch = app.watch.is_enabled().then(|| {
            let roots = match &app.watch {
                WatchSetting::Paths(paths) => {
                    paths.iter().map(|p| working_directory.join(p)).collect()
                }
                WatchSetting::Enabled(_) => vec![working_directory.clone()],
            };
            // Log files written by the child must not trigger restarts
            let ignore = app
                .ignore_watch
                .iter()
                .cloned()
                .chain(
                    out_file
                        .iter()
                        .chain(error_file.iter())
                        .map(|p| p.to_string_lossy().into_owned()),
                )
                .collect();
            WatchSpec {
                roots,
                ignore,
                delay: app.watch_delay,
            }
        });

        let backoff = match app.exp_backoff_restart_delay {
            Some(initial) => Backoff::exponential(initial),
            None => Backoff::Fixed(app.restart_delay),
        };

        Ok(Self {
            id: instance_id(&app.name, instance, app.instances),
            name: app.name.clone(),
            instance,
            instance_count: app.instances,
            command,
            args,
            working_directory,
            environment,
            autorestart: app.autorestart,
            watch,
            memory_ceiling: app.max_memory_restart,
            restart: RestartPolicy {
                max_restarts: app.max_restarts,
                min_uptime: app.min_uptime,
                backoff,
            },
            stop_exit_codes: app.stop_exit_codes.clone(),
            kill_signal: app.kill_signal,
            kill_timeout: app.kill_timeout,
            stdout: out_file.map(OutputTarget::Append).unwrap_or_default(),
            stderr: error_file.map(OutputTarget::Append).unwrap_or_default(),
        })
    }

    pub fn launch_spec(&self) -> LaunchSpec<'_> {
        LaunchSpec {
            program: &self.command,
            args: &self.args,
            working_directory: &self.working_directory,
            environment: self.environment.as_map(),
            stdout: &self.stdout,
            stderr: &self.stderr,
        }
    }

    /// Command line as an operator would type it.
    pub fn command_line(&self) -> String {
        shell_words::join(std::iter::once(&self.command).chain(self.args.iter()))
    }

    /// Whether an exit with `code` should be treated as a deliberate stop.
    pub fn is_stop_exit_code(&self, code: Option<i32>) -> bool {
        code.is_some_and(|code| self.stop_exit_codes.contains(&code))
    }
}

/// Resolve the program and argument list for a script.
///
/// `interpreter: none` runs the script itself; an explicit interpreter is
/// prepended together with its own arguments; without one the interpreter
/// is inferred from the script's extension.
pub fn resolve_invocation(
    script: &str,
    args: Vec<String>,
    interpreter: Option<&str>,
    interpreter_args: Vec<String>,
) -> (String, Vec<String>) {
    let interpreter = match interpreter.map(str::trim) {
        Some(name) if name.eq_ignore_ascii_case("none") => None,
        Some(name) => Some(name.to_string()),
        None => infer_interpreter(script).map(str::to_string),
    };

    match interpreter {
        None => (script.to_string(), args),
        Some(program) => {
            let mut full = interpreter_args;
            full.push(script.to_string());
            full.extend(args);
            (program, full)
        }
    }
}

fn infer_interpreter(script: &str) -> Option<&'static str> {
    let extension = Path::new(script).extension()?.to_str()?;
    match extension.to_ascii_lowercase().as_str() {
        "js" | "mjs" | "cjs" => Some("node"),
        "py" => Some("python3"),
        "sh" => Some("bash"),
        "rb" => Some("ruby"),
        "pl" => Some("perl"),
        "php" => Some("php"),
        _ => None,
    }
}

/// `out.log` becomes `out-2.log` for instance 2 of a multi-instance app.
fn per_instance_path(path: &Path, instance: u32, instance_count: u32) -> PathBuf {
    if instance_count <= 1 {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, instance, ext.to_string_lossy()),
        None => format!("{}-{}", stem, instance),
    };
    path.with_file_name(file_name)
}
