//! Equality-based label selectors, in the string form accepted by the Kubernetes list APIs
//! (`key=value,other!=value`).
use snafu::{ensure, OptionExt, Snafu};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SelectorError {
    #[snafu(display("Label selector requirement '{}' is not of the form key=value or key!=value", requirement))]
    InvalidRequirement { requirement: String },

    #[snafu(display("Label selector requirement '{}' has an empty key", requirement))]
    EmptyKey { requirement: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Operator {
    Equals,
    NotEquals,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Requirement {
    key: String,
    operator: Operator,
    value: String,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Equals => value == Some(&self.value),
            Operator::NotEquals => value != Some(&self.value),
        }
    }
}

/// A parsed equality-based label selector. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Returns true if every requirement of the selector holds for the given labels.
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let empty = BTreeMap::new();
        let labels = labels.unwrap_or(&empty);
        self.requirements
            .iter()
            .all(|requirement| requirement.matches(labels))
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(selector: &str) -> Result<Self, Self::Err> {
        let requirements = selector
            .split(',')
            .map(str::trim)
            .filter(|requirement| !requirement.is_empty())
            .map(parse_requirement)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LabelSelector { requirements })
    }
}

fn parse_requirement(requirement: &str) -> Result<Requirement, SelectorError> {
    // `!=` must be tried first, since it also contains `=`.
    let (key, operator, value) = if let Some((key, value)) = requirement.split_once("!=") {
        (key, Operator::NotEquals, value)
    } else if let Some((key, value)) = requirement.split_once("==") {
        (key, Operator::Equals, value)
    } else {
        let (key, value) = requirement
            .split_once('=')
            .context(InvalidRequirementSnafu { requirement })?;
        (key, Operator::Equals, value)
    };

    let key = key.trim();
    ensure!(!key.is_empty(), EmptyKeySnafu { requirement });

    Ok(Requirement {
        key: key.to_string(),
        operator,
        value: value.trim().to_string(),
    })
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .requirements
            .iter()
            .map(|requirement| match requirement.operator {
                Operator::Equals => format!("{}={}", requirement.key, requirement.value),
                Operator::NotEquals => format!("{}!={}", requirement.key, requirement.value),
            })
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}
