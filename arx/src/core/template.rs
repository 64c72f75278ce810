//! `{{name}}` placeholder parsing and substitution for command tokens.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::EngineError;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap());

/// Placeholder names referenced by one token, in order of appearance.
pub fn placeholders(token: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(token)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Reject braces that are not part of a well-formed placeholder.
pub fn check_token(token: &str) -> Result<(), String> {
    let stripped = PLACEHOLDER.replace_all(token, "");
    if stripped.contains("{{") || stripped.contains("}}") {
        return Err(format!("malformed placeholder in '{token}'"));
    }
    Ok(())
}

/// Substitute every placeholder in `tokens` from `params`.
///
/// Fails if any placeholder has no value; nothing is ever passed through
/// literally.
pub fn substitute(
    tokens: &[String],
    params: &BTreeMap<String, String>,
) -> Result<Vec<String>, EngineError> {
    let mut missing = Vec::new();
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        check_token(token).map_err(EngineError::validation)?;
        let rendered = PLACEHOLDER.replace_all(token, |caps: &regex::Captures<'_>| {
            match params.get(&caps[1]) {
                Some(value) => value.clone(),
                None => {
                    missing.push(caps[1].to_string());
                    String::new()
                }
            }
        });
        out.push(rendered.into_owned());
    }
    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(EngineError::validation(format!(
            "unresolved placeholder(s): {}",
            missing.join(", ")
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn params(items: &[(&str, &str)]) -> BTreeMap<String, String> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_whole_and_embedded_placeholders() {
        let argv = substitute(
            &tokens(&["cargo", "test", "-p", "{{crate}}", "--features={{ feature }}"]),
            &params(&[("crate", "arx"), ("feature", "test-support")]),
        )
        .expect("substitute");
        assert_eq!(argv, tokens(&["cargo", "test", "-p", "arx", "--features=test-support"]));
    }

    #[test]
    fn missing_values_are_a_hard_error() {
        let err = substitute(
            &tokens(&["git", "push", "{{remote}}", "{{branch}}"]),
            &params(&[("remote", "origin")]),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(err.to_string().contains("branch"));
    }

    #[test]
    fn stray_braces_are_rejected() {
        assert!(check_token("{{branch").is_err());
        assert!(check_token("{{ 1bad }}").is_err());
        assert!(check_token("plain").is_ok());
        assert!(substitute(&tokens(&["echo", "}}"]), &params(&[])).is_err());
    }

    #[test]
    fn placeholders_are_listed_in_order() {
        assert_eq!(placeholders("{{a}}-{{b}}"), vec!["a", "b"]);
        assert!(placeholders("none").is_empty());
    }
}
