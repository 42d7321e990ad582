//! Endpoint path templates.
//!
//! A template is an absolute path whose segments may be parameters in
//! braces, e.g. `/chat/{room}`. A parameter matches exactly one non-empty
//! segment.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use regex::Regex;

use crate::connection::PathParams;
use crate::error::{Error, Result};

// ============================================================================
// PathTemplate
// ============================================================================

/// Compiled path template.
#[derive(Clone)]
pub struct PathTemplate {
    raw: String,
    regex: Regex,
    names: Vec<String>,
}

impl PathTemplate {
    /// Compiles a template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the template is not absolute, has
    /// unbalanced braces, or repeats or misnames a parameter.
    pub fn parse(template: &str) -> Result<Self> {
        if !template.starts_with('/') {
            return Err(Error::config(format!(
                "Endpoint path must start with '/': {template}"
            )));
        }

        let normalized = normalize(template);
        let mut pattern = String::from("^");
        let mut names = Vec::new();

        for segment in normalized.split('/').skip(1) {
            pattern.push('/');
            match parse_parameter(segment, template)? {
                Some(name) => {
                    if names.iter().any(|n| n == name) {
                        return Err(Error::config(format!(
                            "Duplicate path parameter '{name}' in {template}"
                        )));
                    }
                    pattern.push_str(&format!("(?P<{name}>[^/]+)"));
                    names.push(name.to_string());
                }
                None => pattern.push_str(&regex::escape(segment)),
            }
        }
        pattern.push('$');

        let regex = Regex::new(&pattern)
            .map_err(|e| Error::config(format!("Invalid endpoint path {template}: {e}")))?;

        Ok(Self {
            raw: normalized.to_string(),
            regex,
            names,
        })
    }

    /// Returns the normalized template text.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the parameter names in order of appearance.
    #[inline]
    #[must_use]
    pub fn parameter_names(&self) -> &[String] {
        &self.names
    }

    /// Matches a request path, returning the decoded parameters.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let captures = self.regex.captures(normalize(path))?;
        let mut params = PathParams::default();
        for name in &self.names {
            let raw = captures.name(name)?.as_str();
            let value = urlencoding::decode(raw).ok()?.into_owned();
            params.insert(name.clone(), value);
        }
        Some(params)
    }

    /// Renders a concrete path from parameter values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a parameter has no value.
    pub fn render(&self, params: &PathParams) -> Result<String> {
        let mut path = String::new();
        for segment in self.raw.split('/').skip(1) {
            path.push('/');
            match parse_parameter(segment, &self.raw)? {
                Some(name) => {
                    let value = params.get(name).ok_or_else(|| {
                        Error::config(format!("Missing path parameter '{name}' for {}", self.raw))
                    })?;
                    path.push_str(&urlencoding::encode(value));
                }
                None => path.push_str(segment),
            }
        }
        Ok(path)
    }
}

impl fmt::Debug for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathTemplate").field(&self.raw).finish()
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for PathTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PathTemplate {}

fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

fn parse_parameter<'a>(segment: &'a str, template: &str) -> Result<Option<&'a str>> {
    let opens = segment.contains('{');
    let closes = segment.contains('}');
    if !opens && !closes {
        return Ok(None);
    }

    let name = segment
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| {
            Error::config(format!(
                "Path parameter must span a whole segment: '{segment}' in {template}"
            ))
        })?;

    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(Error::config(format!(
            "Invalid path parameter name '{name}' in {template}"
        )));
    }
    Ok(Some(name))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_path() {
        let template = PathTemplate::parse("/echo").unwrap();
        assert!(template.matches("/echo").is_some());
        assert!(template.matches("/echo/").is_some());
        assert!(template.matches("/echo/x").is_none());
        assert!(template.matches("/ech").is_none());
    }

    #[test]
    fn test_parameters_extracted_and_decoded() {
        let template = PathTemplate::parse("/chat/{room}/{user}").unwrap();
        let params = template.matches("/chat/lobby/ann%20b").unwrap();

        assert_eq!(params.get("room").map(String::as_str), Some("lobby"));
        assert_eq!(params.get("user").map(String::as_str), Some("ann b"));
        assert_eq!(template.parameter_names(), ["room", "user"]);
        assert!(template.matches("/chat/lobby").is_none());
    }

    #[test]
    fn test_regex_characters_are_literal() {
        let template = PathTemplate::parse("/a.b").unwrap();
        assert!(template.matches("/a.b").is_some());
        assert!(template.matches("/axb").is_none());
    }

    #[test]
    fn test_root() {
        let template = PathTemplate::parse("/").unwrap();
        assert!(template.matches("/").is_some());
        assert!(template.matches("/x").is_none());
        assert_eq!(template.render(&PathParams::default()).unwrap(), "/");
    }

    #[test]
    fn test_render() {
        let template = PathTemplate::parse("/chat/{room}").unwrap();
        let mut params = PathParams::default();
        params.insert("room".into(), "a b".into());

        assert_eq!(template.render(&params).unwrap(), "/chat/a%20b");
        assert!(template.render(&PathParams::default()).is_err());
    }

    #[test]
    fn test_invalid_templates() {
        assert!(PathTemplate::parse("chat").is_err());
        assert!(PathTemplate::parse("/chat/{room").is_err());
        assert!(PathTemplate::parse("/chat/x{room}").is_err());
        assert!(PathTemplate::parse("/chat/{1room}").is_err());
        assert!(PathTemplate::parse("/{a}/{a}").is_err());
    }
}
