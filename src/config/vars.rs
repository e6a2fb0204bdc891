//! Environment variable interpolation for config files.
//!
//! Supported forms:
//! - `$VAR` or `${VAR}`: value of VAR, error if unset
//! - `${VAR:-default}`: default when VAR is unset or empty
//! - `${VAR-default}`: default only when VAR is unset
//! - `$$`: a literal `$`

use regex::{Captures, Regex};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        | \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<default>[^}]*) )? \}
        | \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("placeholder pattern is valid")
});

/// Outcome of interpolating a config text.
#[derive(Debug)]
pub struct InterpolationResult {
    pub text: String,
    /// Every problem found; interpolation keeps going so all are reported.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate variables from the process environment.
pub fn interpolate(input: &str) -> InterpolationResult {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate variables resolved by `lookup`.
pub(crate) fn interpolate_with<F>(input: &str, lookup: F) -> InterpolationResult
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = PLACEHOLDER
        .replace_all(input, |caps: &Captures| {
            let whole = &caps[0];
            if whole == "$$" {
                return "$".to_string();
            }

            let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
                return whole.to_string();
            };
            let name = name.as_str();
            let op = caps.name("op").map(|m| m.as_str());
            let default = caps.name("default").map(|m| m.as_str());

            match (lookup(name), default) {
                (Some(value), _) if value.contains(['\n', '\r']) => {
                    errors.push(format!(
                        "environment variable '{name}' contains newlines, which is not allowed"
                    ));
                    whole.to_string()
                }
                (Some(value), Some(default)) if value.is_empty() && op == Some(":-") => {
                    default.to_string()
                }
                (Some(value), _) => value,
                (None, Some(default)) => default.to_string(),
                (None, None) => {
                    errors.push(format!("environment variable '{name}' is not set"));
                    whole.to_string()
                }
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn run(input: &str, vars: &[(&str, &str)]) -> InterpolationResult {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        interpolate_with(input, |name| env.get(name).cloned())
    }

    #[test]
    fn test_bare_and_braced() {
        let result = run("a: $NODE, b: ${REGION}", &[("NODE", "n1"), ("REGION", "eu")]);
        assert!(result.is_ok());
        assert_eq!(result.text, "a: n1, b: eu");
    }

    #[test]
    fn test_missing_variables_all_reported() {
        let result = run("a: $ONE, b: ${TWO}", &[]);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].contains("ONE"));
        assert!(result.errors[1].contains("not set"));
    }

    #[test]
    fn test_colon_default_covers_empty() {
        let result = run("v: ${EMPTY:-fallback}", &[("EMPTY", "")]);
        assert_eq!(result.text, "v: fallback");
    }

    #[test]
    fn test_plain_default_keeps_empty() {
        let result = run("v: ${EMPTY-fallback}", &[("EMPTY", "")]);
        assert_eq!(result.text, "v: ");
    }

    #[test]
    fn test_default_when_unset() {
        let result = run("v: ${UNSET-fallback} ${UNSET2:-other}", &[]);
        assert!(result.is_ok());
        assert_eq!(result.text, "v: fallback other");
    }

    #[test]
    fn test_set_value_wins_over_default() {
        let result = run("v: ${SET:-fallback}", &[("SET", "actual")]);
        assert_eq!(result.text, "v: actual");
    }

    #[test]
    fn test_dollar_escape() {
        let result = run("fee: $$5", &[]);
        assert_eq!(result.text, "fee: $5");
    }

    #[test]
    fn test_newlines_rejected() {
        let result = run("v: $BAD", &[("BAD", "a\r\nb")]);
        assert!(!result.is_ok());
        assert!(result.errors[0].contains("newlines"));
    }

    #[test]
    fn test_config_snippet() {
        let yaml = r#"
node:
  id: ${NODE_ID:-worker-1}
source:
  path: "s3://${TDDF_BUCKET}/inbox"
"#;
        let result = run(yaml, &[("TDDF_BUCKET", "tddf-prod")]);
        assert!(result.is_ok());
        assert!(result.text.contains("id: worker-1"));
        assert!(result.text.contains("s3://tddf-prod/inbox"));
    }
}
