//! Flat record schemas and projections for extracted GitHub resources.

use std::collections::BTreeSet;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "omx-core";

/// Watermark used when there is no local pull-request aggregate yet.
pub const EARLY_DATE: &str = "1970-01-01T00:00:00Z";

/// `chrono` layout for the timestamp component of snapshot paths.
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// A flat, fixed-schema row. `FIELDS` lists the column names in declared order
/// and must match the serde field order of the implementing struct.
pub trait TabularRecord: Serialize + DeserializeOwned + Clone {
    const FIELDS: &'static [&'static str];
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("{resource} is not a JSON object")]
    NotAnObject { resource: &'static str },
    #[error("missing field `{pointer}` in {resource}")]
    MissingField {
        resource: &'static str,
        pointer: String,
    },
    #[error("field `{pointer}` in {resource} should be {expected}")]
    WrongType {
        resource: &'static str,
        pointer: String,
        expected: &'static str,
    },
    #[error("{resource} fields out of sync with record schema: unexpected {unexpected:?}, missing {missing:?}")]
    SchemaDrift {
        resource: &'static str,
        unexpected: Vec<String>,
        missing: Vec<String>,
    },
}

/// One row of `workflow_runs.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRunRecord {
    pub id: u64,
    pub repo: String,
    pub name: String,
    pub head_sha: String,
    pub status: String,
    pub conclusion: String,
    pub created_at: String,
    pub updated_at: String,
    pub run_started_at: String,
}

impl TabularRecord for WorkflowRunRecord {
    const FIELDS: &'static [&'static str] = &[
        "id",
        "repo",
        "name",
        "head_sha",
        "status",
        "conclusion",
        "created_at",
        "updated_at",
        "run_started_at",
    ];
}

/// One row of the REST-extracted `prs.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub id: u64,
    pub repo: String,
    pub author: String,
    pub created_at: String,
    pub merged_at: String,
    pub updated_at: String,
    pub closed_at: String,
    pub state: String,
    pub draft: bool,
}

impl TabularRecord for PullRequestRecord {
    const FIELDS: &'static [&'static str] = &[
        "id",
        "repo",
        "author",
        "created_at",
        "merged_at",
        "updated_at",
        "closed_at",
        "state",
        "draft",
    ];
}

/// Stable identity of a pull request across organizations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PullRequestKey {
    pub org: String,
    pub repository: String,
    pub number: u64,
}

/// Pull request as held in the incrementally maintained search aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub org: String,
    pub repository: String,
    pub number: u64,
    pub author: String,
    pub created_at: String,
    pub updated_at: String,
    pub closed_at: String,
    pub merged_at: String,
    pub is_draft: bool,
}

impl PullRequest {
    pub fn key(&self) -> PullRequestKey {
        PullRequestKey {
            org: self.org.clone(),
            repository: self.repository.clone(),
            number: self.number,
        }
    }
}

impl TabularRecord for PullRequest {
    const FIELDS: &'static [&'static str] = &[
        "org",
        "repository",
        "number",
        "author",
        "created_at",
        "updated_at",
        "closed_at",
        "merged_at",
        "is_draft",
    ];
}

fn lookup<'a>(
    resource: &'static str,
    value: &'a JsonValue,
    pointer: &str,
) -> Result<&'a JsonValue, ProjectionError> {
    value
        .pointer(pointer)
        .ok_or_else(|| ProjectionError::MissingField {
            resource,
            pointer: pointer.to_string(),
        })
}

/// Renders a scalar as its natural string form. Null becomes an empty string
/// so nullable timestamp columns keep a stable type.
fn text(
    resource: &'static str,
    value: &JsonValue,
    pointer: &str,
) -> Result<String, ProjectionError> {
    match lookup(resource, value, pointer)? {
        JsonValue::Null => Ok(String::new()),
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::Bool(b) => Ok(b.to_string()),
        _ => Err(ProjectionError::WrongType {
            resource,
            pointer: pointer.to_string(),
            expected: "a scalar",
        }),
    }
}

fn unsigned(
    resource: &'static str,
    value: &JsonValue,
    pointer: &str,
) -> Result<u64, ProjectionError> {
    lookup(resource, value, pointer)?
        .as_u64()
        .ok_or_else(|| ProjectionError::WrongType {
            resource,
            pointer: pointer.to_string(),
            expected: "an unsigned integer",
        })
}

fn boolean(
    resource: &'static str,
    value: &JsonValue,
    pointer: &str,
) -> Result<bool, ProjectionError> {
    lookup(resource, value, pointer)?
        .as_bool()
        .ok_or_else(|| ProjectionError::WrongType {
            resource,
            pointer: pointer.to_string(),
            expected: "a boolean",
        })
}

pub fn project_workflow_run(run: &JsonValue) -> Result<WorkflowRunRecord, ProjectionError> {
    const R: &str = "workflow run";
    Ok(WorkflowRunRecord {
        id: unsigned(R, run, "/id")?,
        repo: text(R, run, "/repository/name")?,
        name: text(R, run, "/name")?,
        head_sha: text(R, run, "/head_sha")?,
        status: text(R, run, "/status")?,
        conclusion: text(R, run, "/conclusion")?,
        created_at: text(R, run, "/created_at")?,
        updated_at: text(R, run, "/updated_at")?,
        run_started_at: text(R, run, "/run_started_at")?,
    })
}

pub fn project_pull_request(pr: &JsonValue) -> Result<PullRequestRecord, ProjectionError> {
    const R: &str = "pull request";
    Ok(PullRequestRecord {
        id: unsigned(R, pr, "/id")?,
        repo: text(R, pr, "/base/repo/name")?,
        author: text(R, pr, "/user/login")?,
        created_at: text(R, pr, "/created_at")?,
        merged_at: text(R, pr, "/merged_at")?,
        updated_at: text(R, pr, "/updated_at")?,
        closed_at: text(R, pr, "/closed_at")?,
        state: text(R, pr, "/state")?,
        draft: boolean(R, pr, "/draft")?,
    })
}

/// `isDraft` -> `is_draft`. Leading capitals are not prefixed.
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Projects a GraphQL search node into the aggregate schema.
///
/// The node's field names (snake-cased, plus the injected `org`) must match
/// [`PullRequest::FIELDS`] exactly, so a query edited without updating the
/// record type, or vice versa, fails loudly.
pub fn project_search_pull_request(
    org: &str,
    node: &JsonValue,
) -> Result<PullRequest, ProjectionError> {
    const R: &str = "pull request search node";
    let object = node
        .as_object()
        .ok_or(ProjectionError::NotAnObject { resource: R })?;

    let mut fields: BTreeSet<String> = object.keys().map(|k| to_snake_case(k)).collect();
    fields.insert("org".to_string());
    let expected: BTreeSet<String> = PullRequest::FIELDS.iter().map(|f| f.to_string()).collect();
    if fields != expected {
        return Err(ProjectionError::SchemaDrift {
            resource: R,
            unexpected: fields.difference(&expected).cloned().collect(),
            missing: expected.difference(&fields).cloned().collect(),
        });
    }

    Ok(PullRequest {
        org: org.to_string(),
        repository: text(R, node, "/repository/name")?,
        number: unsigned(R, node, "/number")?,
        author: text(R, node, "/author/login")?,
        created_at: text(R, node, "/createdAt")?,
        updated_at: text(R, node, "/updatedAt")?,
        closed_at: text(R, node, "/closedAt")?,
        merged_at: text(R, node, "/mergedAt")?,
        is_draft: boolean(R, node, "/isDraft")?,
    })
}
