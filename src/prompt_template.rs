//! Prompt templates: a text blob with named `{PLACEHOLDER}` tokens, rendered
//! at each turn against a caller-supplied replacement map.
//!
//! Construction validates that every placeholder an agent declares as
//! required is actually present in the template text; unknown placeholders
//! in the replacement map are tolerated and simply ignored.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum PromptTemplateError {
    MissingPlaceholder { placeholder: String },
}

impl fmt::Display for PromptTemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptTemplateError::MissingPlaceholder { placeholder } => {
                write!(f, "template is missing required placeholder {{{}}}", placeholder)
            }
        }
    }
}

impl Error for PromptTemplateError {}

/// A validated prompt template: text plus the set of placeholders it is
/// known to contain.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    /// Construct a template, failing if any of `required_placeholders` is
    /// absent from `text`.
    pub fn new(
        text: impl Into<String>,
        required_placeholders: &[&str],
    ) -> Result<Self, PromptTemplateError> {
        let text = text.into();
        for placeholder in required_placeholders {
            let token = format!("{{{}}}", placeholder);
            if !text.contains(&token) {
                return Err(PromptTemplateError::MissingPlaceholder {
                    placeholder: placeholder.to_string(),
                });
            }
        }
        Ok(Self { text })
    }

    /// Substitute every `{PLACEHOLDER}` token present in `replacements`.
    /// Placeholders named in `replacements` but absent from the template
    /// text are ignored; placeholders present in the text but absent from
    /// `replacements` are left untouched.
    pub fn render(&self, replacements: &HashMap<&str, String>) -> String {
        let mut rendered = self.text.clone();
        for (placeholder, value) in replacements {
            let token = format!("{{{}}}", placeholder);
            rendered = rendered.replace(&token, value);
        }
        rendered
    }

    pub fn raw(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_fails_without_required_placeholder() {
        let err = PromptTemplate::new("hello world", &["USER_MEMORY"]).unwrap_err();
        assert!(matches!(err, PromptTemplateError::MissingPlaceholder { .. }));
    }

    #[test]
    fn render_substitutes_known_and_ignores_unknown() {
        let template =
            PromptTemplate::new("memory: {USER_MEMORY}", &["USER_MEMORY"]).unwrap();
        let mut replacements = HashMap::new();
        replacements.insert("USER_MEMORY", "none".to_string());
        replacements.insert("UNRELATED", "ignored".to_string());
        assert_eq!(template.render(&replacements), "memory: none");
    }

    #[test]
    fn unfilled_placeholder_is_left_untouched() {
        let template =
            PromptTemplate::new("{A} and {B}", &["A", "B"]).unwrap();
        let mut replacements = HashMap::new();
        replacements.insert("A", "x".to_string());
        assert_eq!(template.render(&replacements), "x and {B}");
    }
}
