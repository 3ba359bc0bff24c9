//! Job entities
//!
//! A Job is the user-visible unit of work; its status is the single source
//! of truth the rest of the system persists, publishes and filters on.
//! Phases advance monotonically: Preparing -> Starting -> Running -> Done
//! -> Cleanup, with failure jumps straight to Done.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse lifecycle state of a job. The derived ordering is the permitted
/// transition order; a job never regresses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    #[default]
    Unknown,
    /// Workload submitted, containers not yet pulled/scheduled.
    Preparing,
    /// Containers are being pulled or waiting to start.
    Starting,
    Running,
    /// Terminal from the user's perspective; success flag decides outcome.
    Done,
    /// The workload object is being torn down.
    Cleanup,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Unknown => "unknown",
            JobPhase::Preparing => "preparing",
            JobPhase::Starting => "starting",
            JobPhase::Running => "running",
            JobPhase::Done => "done",
            JobPhase::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a job to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTrigger {
    #[default]
    Unknown,
    Manual,
    Push,
    DeletedBranch,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTrigger::Unknown => "unknown",
            JobTrigger::Manual => "manual",
            JobTrigger::Push => "push",
            JobTrigger::DeletedBranch => "deleted-branch",
        }
    }
}

/// Source repository coordinates of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub host: String,
    pub owner: String,
    pub repo: String,
    #[serde(rename = "ref", default)]
    pub ref_: String,
    #[serde(default)]
    pub revision: String,
}

/// A single user annotation. Annotations keep their submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub key: String,
    pub value: String,
}

/// Metadata recorded at job creation. Written once as a workload
/// annotation and never mutated thereafter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub owner: String,
    pub repository: Repository,
    #[serde(default)]
    pub trigger: JobTrigger,
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

impl JobMetadata {
    /// Looks up an annotation by key.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    pub fn has_annotation(&self, key: &str) -> bool {
        self.annotation(key).is_some()
    }
}

/// Success/failure bookkeeping of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConditions {
    pub success: bool,
    /// Max observed container restart count.
    #[serde(default)]
    pub failure_count: i32,
    #[serde(default)]
    pub can_replay: bool,
    /// Human-readable reason the job is not progressing (e.g. an image
    /// pull backoff), empty otherwise.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub waiting_for: String,
}

/// A structured outcome emitted by the workload through the inline log
/// protocol (`[<type>|RESULT] <payload>`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    #[serde(rename = "type")]
    pub type_: String,
    pub payload: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
}

/// The canonical job status. Recomputed from the workload on every
/// orchestrator event; duplicates are possible and must be tolerated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub name: String,
    pub metadata: JobMetadata,
    pub phase: JobPhase,
    pub conditions: JobConditions,
    /// Free-form details, e.g. the failure reason.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<JobResult>,
}
