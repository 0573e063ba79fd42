//! Kubernetes label selectors, matched locally against cached objects and
//! rendered back to the string form the API server accepts.
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

const KEY_PATTERN: &str = r"^([A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$";
const VALUE_PATTERN: &str = r"^([A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?)?$";
const SET_PATTERN: &str = r"^(\S+)\s+(in|notin)\s*\((.*)\)$";

struct Patterns {
    key: Regex,
    value: Regex,
    set: Regex,
}

static PATTERNS: LazyLock<std::result::Result<Patterns, regex::Error>> = LazyLock::new(|| {
    Ok(Patterns {
        key: Regex::new(KEY_PATTERN)?,
        value: Regex::new(VALUE_PATTERN)?,
        set: Regex::new(SET_PATTERN)?,
    })
});

fn patterns() -> Result<&'static Patterns> {
    PATTERNS
        .as_ref()
        .map_err(|e| Error::Config(format!("invalid selector pattern: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(key, value) => labels.get(key) == Some(value),
            Self::NotEquals(key, value) => labels.get(key) != Some(value),
            Self::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Self::NotIn(key, values) => !labels.get(key).is_some_and(|v| values.contains(v)),
            Self::Exists(key) => labels.contains_key(key),
            Self::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Self::Equals(key, value) => write!(f, "{key}={value}"),
            Self::NotEquals(key, value) => write!(f, "{key}!={value}"),
            Self::In(key, values) => write!(f, "{key} in ({})", join(values)),
            Self::NotIn(key, values) => write!(f, "{key} notin ({})", join(values)),
            Self::Exists(key) => write!(f, "{key}"),
            Self::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Equality selector over every entry of `labels`
    #[must_use]
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self {
            requirements: labels
                .iter()
                .map(|(key, value)| Requirement::Equals(key.clone(), value.clone()))
                .collect(),
        }
    }

    #[must_use]
    pub fn with(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    #[must_use]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Parse the textual selector syntax, e.g. `app=web,tier in (a,b),!legacy`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when a term is malformed or a key or value is
    /// not a valid label
    pub fn parse(selector: &str) -> Result<Self> {
        let patterns = patterns()?;

        let mut requirements = Vec::new();
        for term in split_terms(selector)? {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_term(term, patterns)?);
        }
        Ok(Self { requirements })
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        write!(f, "{}", terms.join(","))
    }
}

/// Split on commas that are not inside a parenthesised value set
fn split_terms(selector: &str) -> Result<Vec<&str>> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::Config(format!("unbalanced ')' in selector {selector:?}")))?;
            }
            ',' if depth == 0 => {
                terms.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::Config(format!("unbalanced '(' in selector {selector:?}")));
    }
    terms.push(&selector[start..]);
    Ok(terms)
}

fn parse_term(term: &str, patterns: &Patterns) -> Result<Requirement> {
    let key = |k: &str| -> Result<String> {
        let k = k.trim();
        if patterns.key.is_match(k) {
            Ok(k.to_string())
        } else {
            Err(Error::Config(format!("invalid label key {k:?}")))
        }
    };
    let value = |v: &str| -> Result<String> {
        let v = v.trim();
        if patterns.value.is_match(v) {
            Ok(v.to_string())
        } else {
            Err(Error::Config(format!("invalid label value {v:?}")))
        }
    };

    if let Some(caps) = patterns.set.captures(term) {
        if caps[3].trim().is_empty() {
            return Err(Error::Config(format!("empty value set in {term:?}")));
        }
        let values = caps[3]
            .split(',')
            .map(value)
            .collect::<Result<BTreeSet<_>>>()?;
        let k = key(&caps[1])?;
        return Ok(if &caps[2] == "in" {
            Requirement::In(k, values)
        } else {
            Requirement::NotIn(k, values)
        });
    }
    if let Some(k) = term.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(key(k)?));
    }
    if let Some((k, v)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(key(k)?, value(v)?));
    }
    if let Some((k, v)) = term.split_once("==") {
        return Ok(Requirement::Equals(key(k)?, value(v)?));
    }
    if let Some((k, v)) = term.split_once('=') {
        return Ok(Requirement::Equals(key(k)?, value(v)?));
    }
    Ok(Requirement::Exists(key(term)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::parse("").unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&BTreeMap::new()));
        assert!(selector.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_equality_and_inequality() {
        let selector: LabelSelector = "app=web,tier!=db".parse().unwrap();
        assert!(selector.matches(&labels(&[("app", "web")])));
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "frontend")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("tier", "db")])));
        assert!(!selector.matches(&labels(&[("app", "api")])));
    }

    #[test]
    fn test_set_based_terms() {
        let selector = LabelSelector::parse("env in (dev, prod),team notin (legacy),owner,!skip")
            .unwrap();
        assert_eq!(selector.requirements().len(), 4);
        assert!(selector.matches(&labels(&[("env", "dev"), ("team", "a"), ("owner", "x")])));
        assert!(selector.matches(&labels(&[("env", "prod"), ("owner", "x")])));
        assert!(!selector.matches(&labels(&[("env", "staging"), ("owner", "x")])));
        assert!(!selector.matches(&labels(&[("env", "dev"), ("team", "legacy"), ("owner", "x")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "dev"), ("owner", "x"), ("skip", "")])));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let text = "app.kubernetes.io/name=web,env in (dev,prod),!skip";
        let selector = LabelSelector::parse(text).unwrap();
        assert_eq!(selector.to_string(), text);
        assert_eq!(LabelSelector::parse(&selector.to_string()).unwrap(), selector);
    }

    #[test]
    fn test_from_labels_matches_format() {
        let selector = LabelSelector::from_labels(&labels(&[("b", "2"), ("a", "1")]));
        assert_eq!(selector.to_string(), "a=1,b=2");
    }

    #[test]
    fn test_invalid_selectors_rejected() {
        assert!(LabelSelector::parse("env in (dev").is_err());
        assert!(LabelSelector::parse("bad key=x").is_err());
        assert!(LabelSelector::parse("app=-web").is_err());
    }

    #[test]
    fn test_empty_value_set_rejected() {
        for text in ["env in ()", "env notin ( )", "app=web,env in ()"] {
            let err = LabelSelector::parse(text).unwrap_err();
            assert!(matches!(err, Error::Config(ref msg) if msg.contains("empty value set")), "{text}: {err}");
        }
        assert!(LabelSelector::parse("env in (dev)").is_ok());
    }

    #[test]
    fn test_repeated_parses_agree() {
        let first = LabelSelector::parse("app=web,env in (dev,prod)").unwrap();
        for _ in 0..3 {
            assert_eq!(LabelSelector::parse("app=web,env in (dev,prod)").unwrap(), first);
        }
        assert!(patterns().is_ok());
    }
}
