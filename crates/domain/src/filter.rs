//! Filter language
//!
//! ListJobs and Subscribe share one declarative filter language. An
//! expression is a list of terms combined by implicit AND; a list of
//! expressions also ANDs. Unknown fields never match.

use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Annotation keys submitted by users are stored under this prefix on the
/// workload; the filter language exposes them with the prefix stripped.
pub const USERDATA_ANNOTATION_PREFIX: &str = "userdata.kiln.dev/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterOp {
    #[default]
    Equals,
    StartsWith,
    EndsWith,
    Contains,
    Exists,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterTerm {
    pub field: String,
    pub value: String,
    pub operation: FilterOp,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterExpression {
    pub terms: Vec<FilterTerm>,
}

/// Sort directive for ListJobs. Fields use the same names as filter terms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderExpression {
    pub field: String,
    pub ascending: bool,
}

impl FilterTerm {
    pub fn matches(&self, status: &JobStatus) -> bool {
        let matched = match resolve_field(status, &self.field) {
            Some(actual) => match self.operation {
                FilterOp::Equals => actual == self.value,
                FilterOp::StartsWith => actual.starts_with(&self.value),
                FilterOp::EndsWith => actual.ends_with(&self.value),
                FilterOp::Contains => actual.contains(&self.value),
                FilterOp::Exists => true,
            },
            None => false,
        };
        matched != self.negate
    }
}

impl FilterExpression {
    /// True when every term matches.
    pub fn matches(&self, status: &JobStatus) -> bool {
        self.terms.iter().all(|t| t.matches(status))
    }
}

/// Applies a whole filter (all expressions must match).
pub fn matches(filter: &[FilterExpression], status: &JobStatus) -> bool {
    filter.iter().all(|expr| expr.matches(status))
}

/// Resolves a filter field against a status. Returns None for unknown
/// fields and absent annotations.
pub fn resolve_field(status: &JobStatus, field: &str) -> Option<String> {
    if let Some(key) = field.strip_prefix("annotation.") {
        return status
            .metadata
            .annotations
            .iter()
            .find(|a| {
                a.key == key
                    || a.key
                        .strip_prefix(USERDATA_ANNOTATION_PREFIX)
                        .is_some_and(|stripped| stripped == key)
            })
            .map(|a| a.value.clone());
    }

    match field {
        "name" => Some(status.name.clone()),
        "owner" => Some(status.metadata.owner.clone()),
        "repo.host" => Some(status.metadata.repository.host.clone()),
        "repo.owner" => Some(status.metadata.repository.owner.clone()),
        "repo.repo" => Some(status.metadata.repository.repo.clone()),
        "repo.ref" => Some(status.metadata.repository.ref_.clone()),
        "repo.revision" => Some(status.metadata.repository.revision.clone()),
        "trigger" => Some(status.metadata.trigger.as_str().to_string()),
        "phase" => Some(status.phase.as_str().to_string()),
        "success" => Some(status.conditions.success.to_string()),
        _ => None,
    }
}
