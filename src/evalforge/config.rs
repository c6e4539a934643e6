//! Configuration resolution: CLI argument > environment variable > default.
//!
//! No TOML/YAML/config-file parsing crate is introduced here — the same choice the rest of this
//! crate makes for its own settings. Each service declares a small schema of keys it needs
//! ([`ConfigKeySpec`]); [`resolve`] walks every key, applies the key's `transform` and
//! `validator`, and reports every problem at once rather than failing on the first missing key.

use std::collections::HashMap;
use std::fmt;

/// How a raw string value should be coerced before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    String,
    Bool,
    Int,
    Path,
}

/// A cheap post-coercion check. Kept as a closed enum rather than a boxed closure so schemas
/// stay `Clone`/`Debug` and can be declared as plain `const`/`static` data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validator {
    None,
    Port,
    OneOf(&'static [&'static str]),
}

/// Declares one configuration key a service needs resolved before it can run.
#[derive(Debug, Clone)]
pub struct ConfigKeySpec {
    /// Key name as used in [`ResolvedConfig`] lookups.
    pub key: &'static str,
    /// Environment variable this key falls back to when no CLI override is given.
    pub env_var: &'static str,
    pub required: bool,
    pub default: Option<&'static str>,
    pub transform: Transform,
    pub validator: Validator,
    pub description: &'static str,
}

impl ConfigKeySpec {
    pub const fn new(key: &'static str, env_var: &'static str) -> Self {
        ConfigKeySpec {
            key,
            env_var,
            required: true,
            default: None,
            transform: Transform::String,
            validator: Validator::None,
            description: "",
        }
    }

    pub const fn optional(mut self, default: &'static str) -> Self {
        self.required = false;
        self.default = Some(default);
        self
    }

    pub const fn with_transform(mut self, t: Transform) -> Self {
        self.transform = t;
        self
    }

    pub const fn with_validator(mut self, v: Validator) -> Self {
        self.validator = v;
        self
    }

    pub const fn described(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }
}

/// A single resolved configuration value, post-transform.
#[derive(Debug, Clone)]
pub enum ConfigValue {
    String(String),
    Bool(bool),
    Int(i64),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// The result of resolving a schema: every required key present and valid.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    values: HashMap<String, ConfigValue>,
}

impl ResolvedConfig {
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ConfigValue::as_str)
    }
}

/// One missing or invalid key, collected so every problem in a schema is reported together
/// instead of failing on the first one encountered.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub problems: Vec<String>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration invalid: {}", self.problems.join("; "))
    }
}

impl std::error::Error for ConfigError {}

/// Resolve a schema against explicit CLI overrides and the process environment.
///
/// Precedence per key: `cli_args` > `std::env::var(env_var)` > `default`. Collects every
/// missing-required or failed-validation key into a single [`ConfigError`] rather than
/// returning on the first problem.
pub fn resolve(
    schema: &[ConfigKeySpec],
    cli_args: &HashMap<String, String>,
) -> Result<ResolvedConfig, ConfigError> {
    let mut values = HashMap::new();
    let mut problems = Vec::new();

    for spec in schema {
        let raw = cli_args
            .get(spec.key)
            .cloned()
            .or_else(|| std::env::var(spec.env_var).ok())
            .or_else(|| spec.default.map(|d| d.to_string()));

        let raw = match raw {
            Some(r) => r,
            None => {
                if spec.required {
                    problems.push(format!(
                        "missing required key '{}' (set --{} or ${})",
                        spec.key, spec.key, spec.env_var
                    ));
                }
                continue;
            }
        };

        let value = match spec.transform {
            Transform::String | Transform::Path => ConfigValue::String(raw),
            Transform::Bool => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => ConfigValue::Bool(true),
                "0" | "false" | "no" | "off" => ConfigValue::Bool(false),
                other => {
                    problems.push(format!(
                        "key '{}' has non-boolean value '{}'",
                        spec.key, other
                    ));
                    continue;
                }
            },
            Transform::Int => match raw.parse::<i64>() {
                Ok(n) => ConfigValue::Int(n),
                Err(_) => {
                    problems.push(format!(
                        "key '{}' has non-integer value '{}'",
                        spec.key, raw
                    ));
                    continue;
                }
            },
        };

        match &spec.validator {
            Validator::None => {}
            Validator::Port => {
                if let ConfigValue::Int(n) = &value {
                    if *n < 1 || *n > 65535 {
                        problems.push(format!(
                            "key '{}' out of port range 1-65535: {}",
                            spec.key, n
                        ));
                        continue;
                    }
                }
            }
            Validator::OneOf(allowed) => {
                if let ConfigValue::String(s) = &value {
                    if !allowed.contains(&s.as_str()) {
                        problems.push(format!(
                            "key '{}' must be one of {:?}, got '{}'",
                            spec.key, allowed, s
                        ));
                        continue;
                    }
                }
            }
        }

        values.insert(spec.key.to_string(), value);
    }

    if problems.is_empty() {
        Ok(ResolvedConfig { values })
    } else {
        Err(ConfigError { problems })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_defaults_when_nothing_else_supplied() {
        let schema = [ConfigKeySpec::new("host", "EVALFORGE_TEST_HOST").optional("localhost")];
        let cli = HashMap::new();
        let resolved = resolve(&schema, &cli).unwrap();
        assert_eq!(resolved.get_str("host"), Some("localhost"));
    }

    #[test]
    fn cli_overrides_env_and_default() {
        let schema = [ConfigKeySpec::new("host", "EVALFORGE_TEST_HOST2").optional("localhost")];
        let mut cli = HashMap::new();
        cli.insert("host".to_string(), "example.com".to_string());
        let resolved = resolve(&schema, &cli).unwrap();
        assert_eq!(resolved.get_str("host"), Some("example.com"));
    }

    #[test]
    fn missing_required_key_is_reported() {
        let schema = [ConfigKeySpec::new("token", "EVALFORGE_TEST_TOKEN_MISSING")];
        let cli = HashMap::new();
        let err = resolve(&schema, &cli).unwrap_err();
        assert_eq!(err.problems.len(), 1);
    }

    #[test]
    fn port_validator_rejects_out_of_range() {
        let schema = [ConfigKeySpec::new("port", "EVALFORGE_TEST_PORT")
            .with_transform(Transform::Int)
            .with_validator(Validator::Port)];
        let mut cli = HashMap::new();
        cli.insert("port".to_string(), "70000".to_string());
        let err = resolve(&schema, &cli).unwrap_err();
        assert!(err.problems[0].contains("port range"));
    }

    #[test]
    fn one_of_validator_rejects_unknown_values() {
        let schema = [ConfigKeySpec::new("browser", "EVALFORGE_TEST_BROWSER")
            .with_validator(Validator::OneOf(&["chromium", "firefox", "webkit"]))];
        let mut cli = HashMap::new();
        cli.insert("browser".to_string(), "lynx".to_string());
        let err = resolve(&schema, &cli).unwrap_err();
        assert!(err.problems[0].contains("must be one of"));
    }
}
