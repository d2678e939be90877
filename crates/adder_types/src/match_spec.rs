//! A reduced dependency-spec matcher.
//!
//! Dependency strings have the shape `name [version-spec [build-glob]]`,
//! e.g. `python >=2.7,<2.8.0a0`. Version specs combine constraints with `,`
//! (and) and `|` (or); a constraint is a comparison (`>=1.2`), an exact
//! version (`1.2`), a negation (`!=1.2`) or a prefix match (`=1.2`, `1.2.*`).
//! This covers the spec forms the index pruner has to evaluate; it is not a
//! full solver grammar.

use std::cmp::Ordering;
use std::str::FromStr;

use thiserror::Error;

use crate::version;

/// An error that can occur while parsing a match spec.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseMatchSpecError {
    #[error("empty match spec")]
    Empty,
    #[error("invalid version constraint: {0}")]
    InvalidConstraint(String),
    #[error("invalid build matcher: {0}")]
    InvalidBuild(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Constraint {
    Exact(String),
    NotEqual(String),
    StartsWith(String),
    Greater(String),
    GreaterEqual(String),
    Less(String),
    LessEqual(String),
}

impl Constraint {
    fn parse(part: &str) -> Result<Constraint, ParseMatchSpecError> {
        let part = part.trim();
        if part.is_empty() {
            return Err(ParseMatchSpecError::InvalidConstraint(part.to_string()));
        }
        let constraint = if let Some(rest) = part.strip_prefix(">=") {
            Constraint::GreaterEqual(rest.to_string())
        } else if let Some(rest) = part.strip_prefix("<=") {
            Constraint::LessEqual(rest.to_string())
        } else if let Some(rest) = part.strip_prefix(">") {
            Constraint::Greater(rest.to_string())
        } else if let Some(rest) = part.strip_prefix("<") {
            Constraint::Less(rest.to_string())
        } else if let Some(rest) = part.strip_prefix("!=") {
            Constraint::NotEqual(rest.to_string())
        } else if let Some(rest) = part.strip_prefix("==") {
            Constraint::Exact(rest.to_string())
        } else if let Some(rest) = part.strip_prefix('=') {
            match strip_star(rest) {
                Some(prefix) => Constraint::StartsWith(prefix.to_string()),
                None => Constraint::StartsWith(rest.to_string()),
            }
        } else {
            match strip_star(part) {
                Some(prefix) => Constraint::StartsWith(prefix.to_string()),
                None => Constraint::Exact(part.to_string()),
            }
        };
        match &constraint {
            Constraint::Exact(v)
            | Constraint::NotEqual(v)
            | Constraint::StartsWith(v)
            | Constraint::Greater(v)
            | Constraint::GreaterEqual(v)
            | Constraint::Less(v)
            | Constraint::LessEqual(v)
                if v.is_empty() =>
            {
                Err(ParseMatchSpecError::InvalidConstraint(part.to_string()))
            }
            _ => Ok(constraint),
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            Constraint::Exact(v) => version::compare(candidate, v) == Ordering::Equal,
            Constraint::NotEqual(v) => version::compare(candidate, v) != Ordering::Equal,
            Constraint::StartsWith(prefix) => {
                candidate == prefix || candidate.starts_with(&format!("{prefix}."))
            }
            Constraint::Greater(v) => version::compare(candidate, v) == Ordering::Greater,
            Constraint::GreaterEqual(v) => version::compare(candidate, v) != Ordering::Less,
            Constraint::Less(v) => version::compare(candidate, v) == Ordering::Less,
            Constraint::LessEqual(v) => version::compare(candidate, v) != Ordering::Greater,
        }
    }
}

fn strip_star(part: &str) -> Option<&str> {
    part.strip_suffix(".*")
        .or_else(|| part.strip_suffix('*'))
        .map(|prefix| prefix.trim_end_matches('.'))
}

/// A version spec: OR-groups of AND-constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionSpec {
    groups: Vec<Vec<Constraint>>,
}

impl FromStr for VersionSpec {
    type Err = ParseMatchSpecError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let groups = spec
            .split('|')
            .map(|group| group.split(',').map(Constraint::parse).collect())
            .collect::<Result<Vec<Vec<_>>, _>>()?;
        Ok(VersionSpec { groups })
    }
}

impl VersionSpec {
    /// Return true when `candidate` satisfies the spec.
    pub fn matches(&self, candidate: &str) -> bool {
        self.groups
            .iter()
            .any(|group| group.iter().all(|constraint| constraint.matches(candidate)))
    }
}

/// A parsed dependency spec.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSpec {
    pub name: String,
    pub version: Option<VersionSpec>,
    pub build: Option<glob::Pattern>,
}

impl FromStr for MatchSpec {
    type Err = ParseMatchSpecError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut parts = spec.split_whitespace();
        let head = parts.next().ok_or(ParseMatchSpecError::Empty)?;

        // a glued spec like `python>=3.6` splits at the first operator char
        let (name, inline_version) = match head.find(['<', '>', '=', '!']) {
            Some(at) if at > 0 => (&head[..at], Some(&head[at..])),
            _ => (head, None),
        };

        let version = match (inline_version, parts.next()) {
            (Some(v), _) | (None, Some(v)) => Some(v.parse()?),
            (None, None) => None,
        };
        let build = parts
            .next()
            .map(|pattern| {
                glob::Pattern::new(pattern)
                    .map_err(|_| ParseMatchSpecError::InvalidBuild(pattern.to_string()))
            })
            .transpose()?;

        Ok(MatchSpec {
            name: name.to_string(),
            version,
            build,
        })
    }
}

impl MatchSpec {
    /// Return true when the given `(name, version, build)` triple satisfies
    /// this spec.
    pub fn matches(&self, name: &str, version: &str, build: &str) -> bool {
        if self.name != name {
            return false;
        }
        if let Some(spec) = &self.version {
            if !spec.matches(version) {
                return false;
            }
        }
        if let Some(pattern) = &self.build {
            if !pattern.matches(build) {
                return false;
            }
        }
        true
    }
}
