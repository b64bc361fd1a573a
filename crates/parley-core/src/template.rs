// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

/// Substitute `{{key}}` placeholders in `content` using the provided `vars`.
/// Keys are looked up case-sensitively.  Unknown placeholders are left as-is.
pub fn apply_template(content: &str, vars: &HashMap<String, String>) -> String {
    if vars.is_empty() || !content.contains("{{") {
        return content.to_string();
    }

    let mut result = content.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{{{}}}}}", key), value);
    }
    result
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn simple_substitution() {
        let result = apply_template("Hello {{name}}!", &vars(&[("name", "world")]));
        assert_eq!(result, "Hello world!");
    }

    #[test]
    fn dotted_keys_substitute() {
        let result = apply_template(
            "You are {{agent.name}}. Goal: {{conversation.goal}}",
            &vars(&[("agent.name", "Alice"), ("conversation.goal", "debate")]),
        );
        assert_eq!(result, "You are Alice. Goal: debate");
    }

    #[test]
    fn unknown_placeholder_is_left_as_is() {
        let result = apply_template("{{unknown}} stays", &vars(&[("other", "x")]));
        assert_eq!(result, "{{unknown}} stays");
    }

    #[test]
    fn no_vars_returns_content_unchanged() {
        let content = "no placeholders here";
        let result = apply_template(content, &HashMap::new());
        assert_eq!(result, content);
    }

    #[test]
    fn repeated_placeholder_substitutes_everywhere() {
        let result = apply_template("{{x}} and {{x}}", &vars(&[("x", "y")]));
        assert_eq!(result, "y and y");
    }
}
