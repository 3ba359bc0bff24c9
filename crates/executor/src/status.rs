//! Status recomputation
//!
//! A pure function from a pod to the canonical job status. The watcher,
//! the housekeeping loop and `start` all go through here, so every
//! consumer sees the same state machine. Failure takes precedence over
//! success; DONE is final; a deletion timestamp maps to CLEANUP.
//!
//! Phases must never regress. A pod whose aggregate phase is Running
//! stays RUNNING even while its containers sit in a restart gap
//! (CrashLoopBackOff and friends report no running container but the
//! pod phase remains Running).

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

use kiln_domain::{DomainError, DomainResult, JobConditions, JobMetadata, JobPhase, JobStatus};

use crate::{
    ANNOTATION_CAN_REPLAY, ANNOTATION_FAILED, ANNOTATION_FAILURE_LIMIT, ANNOTATION_METADATA,
    ANNOTATION_RESULTS, LABEL_JOB_NAME,
};

/// Image-pull waiting reasons that surface as `waiting_for`.
const PULL_FAILURE_REASONS: [&str; 2] = ["ImagePullBackOff", "ErrImagePull"];

pub fn compute_status(pod: &Pod) -> DomainResult<JobStatus> {
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();

    let name = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_JOB_NAME).cloned())
        .or_else(|| pod.metadata.name.clone())
        .unwrap_or_default();

    let metadata: JobMetadata = annotations
        .get(ANNOTATION_METADATA)
        .ok_or_else(|| {
            DomainError::TransientInfra(format!("workload {name} carries no metadata annotation"))
        })
        .and_then(|raw| {
            serde_json::from_str(raw).map_err(|e| {
                DomainError::TransientInfra(format!("workload {name}: invalid metadata: {e}"))
            })
        })?;

    let results = annotations
        .get(ANNOTATION_RESULTS)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    let failure_limit: i32 = annotations
        .get(ANNOTATION_FAILURE_LIMIT)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let pod_status = pod.status.clone().unwrap_or_default();
    let container_statuses: Vec<ContainerStatus> = pod_status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(pod_status.container_statuses.iter().flatten())
        .cloned()
        .collect();

    let max_restarts = container_statuses
        .iter()
        .map(|cs| cs.restart_count)
        .max()
        .unwrap_or(0);
    let any_terminated_failed = container_statuses.iter().any(|cs| {
        cs.state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
            .is_some_and(|t| t.exit_code != 0)
    });
    let any_running = container_statuses.iter().any(|cs| {
        cs.state
            .as_ref()
            .is_some_and(|s| s.running.is_some())
    });
    let pull_failure = container_statuses.iter().find_map(|cs| {
        cs.state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.clone())
            .filter(|r| PULL_FAILURE_REASONS.contains(&r.as_str()))
    });

    let mut conditions = JobConditions {
        failure_count: max_restarts,
        ..Default::default()
    };
    let mut details = String::new();

    let mut phase = if let Some(msg) = annotations.get(ANNOTATION_FAILED) {
        details = msg.clone();
        JobPhase::Done
    } else if any_terminated_failed || max_restarts > failure_limit {
        JobPhase::Done
    } else if pod_status.phase.as_deref() == Some("Succeeded") {
        conditions.success = true;
        JobPhase::Done
    } else if any_running || pod_status.phase.as_deref() == Some("Running") {
        // containers between restarts report no running state while the
        // pod phase stays Running; the job must not fall back behind
        if let Some(reason) = pull_failure.clone() {
            conditions.waiting_for = reason;
        }
        JobPhase::Running
    } else if let Some(reason) = pull_failure {
        conditions.waiting_for = reason;
        JobPhase::Starting
    } else if pod_status.phase.as_deref() == Some("Pending") {
        JobPhase::Preparing
    } else {
        JobPhase::Unknown
    };

    if phase == JobPhase::Done && annotations.contains_key(ANNOTATION_CAN_REPLAY) {
        conditions.can_replay = true;
    }

    if pod.metadata.deletion_timestamp.is_some() {
        phase = JobPhase::Cleanup;
    }

    Ok(JobStatus {
        name,
        metadata,
        phase,
        conditions,
        details,
        results,
    })
}
