//! Configuration loading and schema definitions for flotilla.
//!
//! This module provides types and functions for loading flotilla configuration
//! from TOML files or strings, plus an env-var expansion helper applied to
//! per-project environment overrides.
//!
//! # The configuration file format is described in the README.

pub mod schema;

pub use schema::*;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Reporter names `ReportConfig::reporters` accepts (schema.rs's doc
/// comment on that field promises unknown names are a startup error).
const KNOWN_REPORTERS: &[&str] = &["console", "junit", "null"];

/// Rejects unknown reporter names (schema.rs's doc comment on
/// `ReportConfig::reporters` promises this is a startup error). Exposed
/// separately from [`load_config`] so CLI `--reporter` overrides, applied
/// after a config is loaded, can be validated the same way.
pub fn validate_reporters(reporters: &[String]) -> Result<()> {
    for name in reporters {
        if !KNOWN_REPORTERS.contains(&name.as_str()) {
            bail!(
                "unknown reporter \"{name}\" in [report].reporters (expected one of {})",
                KNOWN_REPORTERS.join(", ")
            );
        }
    }
    Ok(())
}

/// Loads flotilla configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains invalid TOML, or
/// doesn't match the configuration schema.
///
/// ```no_run
/// use flotilla::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("flotilla.toml"))?;
/// println!("Workers: {}", config.runner.workers);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: RunnerConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    expand_project_env(&mut config.projects)?;
    validate_reporters(&config.report.reporters)?;

    Ok(config)
}

/// Loads flotilla configuration from a TOML string. Useful for tests.
pub fn load_config_str(content: &str) -> Result<RunnerConfig> {
    let mut config: RunnerConfig = toml::from_str(content).context("Failed to parse config")?;

    expand_project_env(&mut config.projects)?;
    validate_reporters(&config.report.reporters)?;

    Ok(config)
}

/// Searches the current directory for `flotilla.toml`, returning `None` if
/// absent rather than erroring — callers decide whether a missing config is
/// fatal (it is for `run`, it isn't for `--help`).
pub fn discover_config() -> Option<std::path::PathBuf> {
    let candidate = Path::new("flotilla.toml");
    candidate.exists().then(|| candidate.to_path_buf())
}

/// Expands environment variable references in a string value.
///
/// Syntax:
/// - `${VAR}` - required, fails if VAR is not set
/// - `${VAR:-default}` - optional, uses "default" if VAR not set
/// - `$$` - escaped dollar sign (becomes single `$`)
///
/// # Errors
/// Returns error if a required variable is not set.
pub(crate) fn expand_env_value(value: &str) -> Result<String, String> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            match chars.peek() {
                Some('$') => {
                    chars.next();
                    result.push('$');
                }
                Some('{') => {
                    chars.next();

                    let mut var_content = String::new();
                    let mut found_close = false;

                    for c in chars.by_ref() {
                        if c == '}' {
                            found_close = true;
                            break;
                        }
                        var_content.push(c);
                    }

                    if !found_close {
                        return Err(format!("Unclosed variable reference: ${{{var_content}"));
                    }

                    let (var_name, default_value) = if let Some(idx) = var_content.find(":-") {
                        let (name, rest) = var_content.split_at(idx);
                        (name, Some(&rest[2..]))
                    } else {
                        (var_content.as_str(), None)
                    };

                    if var_name.is_empty() {
                        return Err("Empty variable name in ${}".to_string());
                    }

                    match std::env::var(var_name) {
                        Ok(val) => result.push_str(&val),
                        Err(_) => {
                            if let Some(default) = default_value {
                                result.push_str(default);
                            } else {
                                return Err(format!(
                                    "Required environment variable not set: {var_name}"
                                ));
                            }
                        }
                    }
                }
                _ => result.push('$'),
            }
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

fn expand_env_hashmap(env: &mut HashMap<String, String>) -> Result<()> {
    for (key, value) in env.iter_mut() {
        *value = expand_env_value(value)
            .map_err(|e| anyhow::anyhow!("Failed to expand env var '{key}': {e}"))?;
    }
    Ok(())
}

fn expand_project_env(projects: &mut HashMap<String, ProjectConfig>) -> Result<()> {
    for project in projects.values_mut() {
        expand_env_hashmap(&mut project.env)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_value_no_variables() -> Result<(), String> {
        let result = expand_env_value("hello world")?;
        assert_eq!(result, "hello world");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_escaped_dollar() -> Result<(), String> {
        let result = expand_env_value("price is $$100")?;
        assert_eq!(result, "price is $100");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_multiple_escaped_dollars() -> Result<(), String> {
        let result = expand_env_value("$$$$")?;
        assert_eq!(result, "$$");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_literal_dollar_no_brace() -> Result<(), String> {
        let result = expand_env_value("$x and $y")?;
        assert_eq!(result, "$x and $y");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_empty_var_name() {
        let result = expand_env_value("${}");
        assert!(matches!(&result, Err(e) if e.contains("Empty variable name")));
    }

    #[test]
    fn test_expand_env_value_unclosed_brace() {
        let result = expand_env_value("${VAR");
        assert!(matches!(&result, Err(e) if e.contains("Unclosed variable reference")));
    }

    #[test]
    fn test_expand_env_value_var_set() -> Result<(), String> {
        let result = expand_env_value("${HOME}")?;
        assert!(!result.is_empty());
        Ok(())
    }

    #[test]
    fn test_expand_env_value_var_unset() {
        let result = expand_env_value("${_FLOTILLA_TEST_NONEXISTENT_VAR}");
        assert!(result.is_err());
    }

    #[test]
    fn test_expand_env_value_default_not_used_when_set() -> Result<(), String> {
        let result = expand_env_value("${HOME:-fallback}")?;
        assert_ne!(result, "fallback");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_default_used_when_unset() -> Result<(), String> {
        let result = expand_env_value("${_FLOTILLA_TEST_MISSING:-fallback}")?;
        assert_eq!(result, "fallback");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_mixed() -> Result<(), String> {
        let result = expand_env_value("prefix_${HOME}_suffix")?;
        assert!(result.starts_with("prefix_"));
        assert!(result.ends_with("_suffix"));
        Ok(())
    }

    #[test]
    fn test_expand_env_value_empty_default() -> Result<(), String> {
        let result = expand_env_value("${_FLOTILLA_TEST_MISSING:-}")?;
        assert_eq!(result, "");
        Ok(())
    }

    #[test]
    fn load_config_str_expands_project_env() -> Result<()> {
        unsafe {
            std::env::set_var("_FLOTILLA_CFG_TEST_VAR", "expanded");
        }
        let config = load_config_str(
            r#"
            [runner]
            workers = 4

            [projects.default]
            test_dir = "tests"
            env = { FOO = "${_FLOTILLA_CFG_TEST_VAR}" }
            "#,
        )?;
        assert_eq!(
            config.projects["default"].env.get("FOO").map(String::as_str),
            Some("expanded")
        );
        Ok(())
    }
}
