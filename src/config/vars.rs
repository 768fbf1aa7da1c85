//! Environment variable interpolation for config files.
//!
//! - `$VAR` / `${VAR}`: value of VAR, an error if it is unset
//! - `${VAR:-default}`: default when VAR is unset or empty
//! - `${VAR-default}`: default only when VAR is unset
//! - `$$`: a literal `$`
//!
//! Secrets such as the warehouse token are usually injected this way.

use regex::{Captures, Regex};
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<default>[^}]*) )? \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("static interpolation pattern is valid")
});

/// Interpolate with the process environment.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate using `lookup` to resolve variable names.
///
/// Every problem is collected so a config with several missing variables
/// reports all of them at once.
pub fn interpolate_with<F>(input: &str, lookup: F) -> Result<String, Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
        let whole = &caps[0];
        if whole == "$$" {
            return "$".to_string();
        }

        let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
            return whole.to_string();
        };
        let name = name.as_str();
        let default = caps.name("default").map(|m| m.as_str());
        let empty_uses_default = caps.name("op").is_some_and(|op| op.as_str() == ":-");

        match lookup(name) {
            Some(value) if value.contains(['\n', '\r']) => {
                errors.push(format!("environment variable '{name}' contains a newline"));
                whole.to_string()
            }
            Some(value) if value.is_empty() && empty_uses_default => {
                default.unwrap_or_default().to_string()
            }
            Some(value) => value,
            None => match default {
                Some(default) => default.to_string(),
                None => {
                    errors.push(format!("environment variable '{name}' is not set"));
                    whole.to_string()
                }
            },
        }
    });

    if errors.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(errors)
    }
}
