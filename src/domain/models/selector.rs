//! Agent selection expressions.
//!
//! A `delegate_to` value is either a literal agent name, a set of names, or
//! a tag expression (AND of `tag==value` / `tag.has(value)` terms).
//! Expressions are parsed once into a matcher so resolution never re-parses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("empty selector term in {0:?}")]
    EmptyTerm(String),
    #[error("malformed tag term {0:?}, expected tag==value or tag.has(value)")]
    MalformedTag(String),
}

/// A single tag requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagTerm {
    /// `tag==value` — the tag must exist with exactly this value.
    Equals { tag: String, value: String },
    /// `tag.has(value)` — the tag's value set must contain the value.
    Has { tag: String, value: String },
}

/// A compiled agent selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorExpr {
    /// Run on the master itself.
    Local,
    /// A literal agent name.
    Name(String),
    /// Any of these agent names.
    Names(Vec<String>),
    /// All tag terms must match (AND).
    Tags(Vec<TagTerm>),
}

impl SelectorExpr {
    /// Parse a `delegate_to` string.
    ///
    /// Empty → `Local`. `a,b,c` → `Names`. Terms containing `==` or
    /// `.has(` → `Tags`. Anything else is a single `Name`.
    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::Local);
        }

        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(SelectorError::EmptyTerm(raw.to_string()));
        }

        let is_tag_expr = parts.iter().any(|p| p.contains("==") || p.contains(".has("));
        if is_tag_expr {
            let terms = parts.iter().map(|p| Self::parse_tag_term(p)).collect::<Result<_, _>>()?;
            return Ok(Self::Tags(terms));
        }

        if parts.len() == 1 {
            Ok(Self::Name(parts[0].to_string()))
        } else {
            Ok(Self::Names(parts.iter().map(|p| (*p).to_string()).collect()))
        }
    }

    fn parse_tag_term(term: &str) -> Result<TagTerm, SelectorError> {
        if let Some((tag, value)) = term.split_once("==") {
            let (tag, value) = (tag.trim(), value.trim());
            if tag.is_empty() || value.is_empty() {
                return Err(SelectorError::MalformedTag(term.to_string()));
            }
            return Ok(TagTerm::Equals { tag: tag.to_string(), value: value.to_string() });
        }
        if let Some((tag, rest)) = term.split_once(".has(") {
            let tag = tag.trim();
            let value = rest.trim().strip_suffix(')').map(str::trim);
            if let Some(v) = value {
                if !tag.is_empty() && !v.is_empty() {
                    return Ok(TagTerm::Has { tag: tag.to_string(), value: v.to_string() });
                }
            }
        }
        Err(SelectorError::MalformedTag(term.to_string()))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    /// Check whether an agent with the given name and tags matches.
    ///
    /// Tag values may be comma-separated sets; `Has` matches any element.
    pub fn matches(&self, name: &str, tags: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Local => false,
            Self::Name(n) => n == name,
            Self::Names(ns) => ns.iter().any(|n| n == name),
            Self::Tags(terms) => terms.iter().all(|term| match term {
                TagTerm::Equals { tag, value } => tags.get(tag).is_some_and(|v| v == value),
                TagTerm::Has { tag, value } => tags
                    .get(tag)
                    .is_some_and(|v| v.split(',').map(str::trim).any(|e| e == value)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_parse_empty_is_local() {
        assert!(SelectorExpr::parse("").unwrap().is_local());
        assert!(SelectorExpr::parse("  ").unwrap().is_local());
    }

    #[test]
    fn test_parse_name_and_names() {
        assert_eq!(SelectorExpr::parse("a1").unwrap(), SelectorExpr::Name("a1".into()));
        assert_eq!(
            SelectorExpr::parse("a1, a2").unwrap(),
            SelectorExpr::Names(vec!["a1".into(), "a2".into()])
        );
    }

    #[test]
    fn test_parse_tag_expression() {
        let expr = SelectorExpr::parse("role==web, zone.has(eu)").unwrap();
        assert_eq!(
            expr,
            SelectorExpr::Tags(vec![
                TagTerm::Equals { tag: "role".into(), value: "web".into() },
                TagTerm::Has { tag: "zone".into(), value: "eu".into() },
            ])
        );
    }

    #[test]
    fn test_parse_malformed_tag() {
        assert!(SelectorExpr::parse("role==").is_err());
        assert!(SelectorExpr::parse("zone.has(").is_err());
        assert!(SelectorExpr::parse("a1,,a2").is_err());
    }

    #[test]
    fn test_name_matching() {
        let expr = SelectorExpr::parse("a1,a2").unwrap();
        assert!(expr.matches("a1", &tags(&[])));
        assert!(expr.matches("a2", &tags(&[])));
        assert!(!expr.matches("a3", &tags(&[])));
    }

    #[test]
    fn test_tag_matching_is_and() {
        let expr = SelectorExpr::parse("role==web, zone.has(eu)").unwrap();
        assert!(expr.matches("any", &tags(&[("role", "web"), ("zone", "us,eu")])));
        assert!(!expr.matches("any", &tags(&[("role", "web"), ("zone", "us")])));
        assert!(!expr.matches("any", &tags(&[("zone", "eu")])));
    }
}
