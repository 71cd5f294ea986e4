use super::*;
use std::collections::HashSet;

/// Validate the complete configuration
pub fn validate_config(config: &TetherConfig) -> ConfigResult<()> {
    validate_supervisor_options(&config.supervisor)?;
    validate_app_configs(&config.apps)?;
    Ok(())
}

/// Validate tether's own options
fn validate_supervisor_options(options: &SupervisorOptions) -> ConfigResult<()> {
    if options.memory_check_interval.is_zero() {
        return Err(ConfigError::validation("memory_check_interval must be greater than 0"));
    }

    if options.shutdown_timeout.is_zero() {
        return Err(ConfigError::validation("shutdown_timeout must be greater than 0"));
    }

    match options.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::validation(format!(
            "Invalid log level: {}, must be one of: trace, debug, info, warn, error",
            options.log_level
        ))),
    }
}

/// Validate all app entries
fn validate_app_configs(apps: &[AppConfig]) -> ConfigResult<()> {
    if apps.is_empty() {
        return Err(ConfigError::validation("At least one app must be configured"));
    }

    let mut names = HashSet::new();
    let mut instance_ids = HashSet::new();
    for app in apps {
        if !names.insert(app.name.as_str()) {
            return Err(ConfigError::validation(format!("Duplicate app name: {}", app.name)));
        }

        validate_app_config(app)?;

        // "web" with two instances becomes "web-0" and "web-1", which must
        // not collide with another app's name.
        for instance in 0..app.instances {
            let id = crate::descriptor::instance_id(&app.name, instance, app.instances);
            if !instance_ids.insert(id.clone()) {
                return Err(ConfigError::validation(format!("Duplicate process id: {}", id)));
            }
        }
    }

    Ok(())
}

/// Validate a single app entry
fn validate_app_config(app: &AppConfig) -> ConfigResult<()> {
    tether_process::validate_process_id(&app.name)
        .map_err(|e| ConfigError::validation(format!("Invalid app name {:?}: {}", app.name, e)))?;

    if app.script.trim().is_empty() {
        return Err(ConfigError::validation(format!("App {}: script cannot be empty", app.name)));
    }

    if app.instances == 0 {
        return Err(ConfigError::validation(format!(
            "App {}: instances must be at least 1",
            app.name
        )));
    }

    if app.max_memory_restart.is_some_and(|ceiling| ceiling.is_zero()) {
        return Err(ConfigError::validation(format!(
            "App {}: max_memory_restart must be greater than 0",
            app.name
        )));
    }

    validate_args(&app.name, "args", &app.args)?;
    validate_args(&app.name, "interpreter_args", &app.interpreter_args)?;

    if let Some(interpreter) = &app.interpreter {
        if interpreter.trim().is_empty() {
            return Err(ConfigError::validation(format!(
                "App {}: interpreter cannot be empty (use \"none\" to run the script directly)",
                app.name
            )));
        }
    }

    if app.instance_var.is_empty() {
        return Err(ConfigError::validation(format!(
            "App {}: instance_var cannot be empty",
            app.name
        )));
    }

    if app.watch.is_enabled() && app.watch_delay.is_zero() {
        return Err(ConfigError::validation(format!(
            "App {}: watch_delay must be greater than 0 when watch is enabled",
            app.name
        )));
    }

    Ok(())
}

fn validate_args(name: &str, field: &str, args: &ArgList) -> ConfigResult<()> {
    args.to_vec()
        .map(|_| ())
        .map_err(|e| ConfigError::validation(format!("App {}: cannot split {}: {}", name, field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(yaml: &str) -> ConfigResult<TetherConfig> {
        TetherConfig::load_from_string(yaml)
    }

    fn validation_message(yaml: &str) -> String {
        match load(yaml) {
            Err(ConfigError::Validation(msg)) => msg,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_requires_at_least_one_app() {
        assert!(validation_message("apps: []\n").contains("At least one app"));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let msg = validation_message(
            "apps:\n  - name: web\n    script: a\n  - name: web\n    script: b\n",
        );
        assert!(msg.contains("Duplicate app name"));
    }

    #[test]
    fn test_rejects_colliding_instance_ids() {
        let msg = validation_message(
            "apps:\n  - name: web\n    script: a\n    instances: 2\n  - name: web-1\n    script: b\n",
        );
        assert!(msg.contains("Duplicate process id: web-1"));
    }

    #[test]
    fn test_rejects_bad_fields() {
        assert!(validation_message("apps:\n  - name: 'my app'\n    script: a\n").contains("Invalid app name"));
        assert!(validation_message("apps:\n  - name: web\n    script: '  '\n").contains("script cannot be empty"));
        assert!(validation_message("apps:\n  - name: web\n    script: a\n    instances: 0\n")
            .contains("instances must be at least 1"));
        assert!(validation_message("apps:\n  - name: web\n    script: a\n    max_memory_restart: 0\n")
            .contains("max_memory_restart"));
        assert!(validation_message("apps:\n  - name: web\n    script: a\n    args: \"run 'unterminated\"\n")
            .contains("cannot split args"));
    }

    #[test]
    fn test_rejects_bad_supervisor_options() {
        let msg = validation_message(
            "supervisor:\n  log_level: loud\napps:\n  - name: web\n    script: a\n",
        );
        assert!(msg.contains("Invalid log level"));

        let msg = validation_message(
            "supervisor:\n  memory_check_interval: 0ms\napps:\n  - name: web\n    script: a\n",
        );
        assert!(msg.contains("memory_check_interval"));
    }

    #[test]
    fn test_unknown_signal_is_a_parse_error() {
        let err = load("apps:\n  - name: web\n    script: a\n    kill_signal: SIGWINCH\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
