//! Conversions between the wire types and the domain model.

use chrono::{DateTime, TimeZone, Utc};
use tonic::Status;

use kiln_domain as domain;

use crate::pb;

pub fn to_timestamp(ts: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    }
}

pub fn from_timestamp(ts: &prost_types::Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32)
        .single()
        .unwrap_or_default()
}

pub fn phase_to_pb(phase: domain::JobPhase) -> pb::JobPhase {
    match phase {
        domain::JobPhase::Unknown => pb::JobPhase::PhaseUnknown,
        domain::JobPhase::Preparing => pb::JobPhase::PhasePreparing,
        domain::JobPhase::Starting => pb::JobPhase::PhaseStarting,
        domain::JobPhase::Running => pb::JobPhase::PhaseRunning,
        domain::JobPhase::Done => pb::JobPhase::PhaseDone,
        domain::JobPhase::Cleanup => pb::JobPhase::PhaseCleanup,
    }
}

pub fn phase_from_pb(phase: pb::JobPhase) -> domain::JobPhase {
    match phase {
        pb::JobPhase::PhaseUnknown => domain::JobPhase::Unknown,
        pb::JobPhase::PhasePreparing => domain::JobPhase::Preparing,
        pb::JobPhase::PhaseStarting => domain::JobPhase::Starting,
        pb::JobPhase::PhaseRunning => domain::JobPhase::Running,
        pb::JobPhase::PhaseDone => domain::JobPhase::Done,
        pb::JobPhase::PhaseCleanup => domain::JobPhase::Cleanup,
    }
}

pub fn trigger_to_pb(trigger: domain::JobTrigger) -> pb::JobTrigger {
    match trigger {
        domain::JobTrigger::Unknown => pb::JobTrigger::TriggerUnknown,
        domain::JobTrigger::Manual => pb::JobTrigger::TriggerManual,
        domain::JobTrigger::Push => pb::JobTrigger::TriggerPush,
        domain::JobTrigger::DeletedBranch => pb::JobTrigger::TriggerDeleted,
    }
}

pub fn trigger_from_pb(trigger: pb::JobTrigger) -> domain::JobTrigger {
    match trigger {
        pb::JobTrigger::TriggerUnknown => domain::JobTrigger::Unknown,
        pb::JobTrigger::TriggerManual => domain::JobTrigger::Manual,
        pb::JobTrigger::TriggerPush => domain::JobTrigger::Push,
        pb::JobTrigger::TriggerDeleted => domain::JobTrigger::DeletedBranch,
    }
}

pub fn metadata_to_pb(md: &domain::JobMetadata) -> pb::JobMetadata {
    pb::JobMetadata {
        owner: md.owner.clone(),
        repository: Some(pb::Repository {
            host: md.repository.host.clone(),
            owner: md.repository.owner.clone(),
            repo: md.repository.repo.clone(),
            r#ref: md.repository.ref_.clone(),
            revision: md.repository.revision.clone(),
        }),
        trigger: trigger_to_pb(md.trigger) as i32,
        created: md.created.map(to_timestamp),
        finished: md.finished.map(to_timestamp),
        annotations: md
            .annotations
            .iter()
            .map(|a| pb::Annotation {
                key: a.key.clone(),
                value: a.value.clone(),
            })
            .collect(),
    }
}

pub fn metadata_from_pb(md: &pb::JobMetadata) -> domain::JobMetadata {
    let repository = md.repository.as_ref().cloned().unwrap_or_default();
    domain::JobMetadata {
        owner: md.owner.clone(),
        repository: domain::Repository {
            host: repository.host,
            owner: repository.owner,
            repo: repository.repo,
            ref_: repository.r#ref,
            revision: repository.revision,
        },
        trigger: trigger_from_pb(md.trigger()),
        created: md.created.as_ref().map(from_timestamp),
        finished: md.finished.as_ref().map(from_timestamp),
        annotations: md
            .annotations
            .iter()
            .map(|a| domain::Annotation {
                key: a.key.clone(),
                value: a.value.clone(),
            })
            .collect(),
    }
}

pub fn status_to_pb(status: &domain::JobStatus) -> pb::JobStatus {
    pb::JobStatus {
        name: status.name.clone(),
        metadata: Some(metadata_to_pb(&status.metadata)),
        phase: phase_to_pb(status.phase) as i32,
        conditions: Some(pb::JobConditions {
            success: status.conditions.success,
            failure_count: status.conditions.failure_count,
            can_replay: status.conditions.can_replay,
            waiting_for: status.conditions.waiting_for.clone(),
        }),
        details: status.details.clone(),
        results: status
            .results
            .iter()
            .map(|r| pb::JobResult {
                r#type: r.type_.clone(),
                payload: r.payload.clone(),
                description: r.description.clone(),
                channels: r.channels.clone(),
            })
            .collect(),
    }
}

pub fn status_from_pb(status: &pb::JobStatus) -> domain::JobStatus {
    let conditions = status.conditions.clone().unwrap_or_default();
    domain::JobStatus {
        name: status.name.clone(),
        metadata: status
            .metadata
            .as_ref()
            .map(metadata_from_pb)
            .unwrap_or_default(),
        phase: phase_from_pb(status.phase()),
        conditions: domain::JobConditions {
            success: conditions.success,
            failure_count: conditions.failure_count,
            can_replay: conditions.can_replay,
            waiting_for: conditions.waiting_for,
        },
        details: status.details.clone(),
        results: status
            .results
            .iter()
            .map(|r| domain::JobResult {
                type_: r.r#type.clone(),
                payload: r.payload.clone(),
                description: r.description.clone(),
                channels: r.channels.clone(),
            })
            .collect(),
    }
}

pub fn filter_from_pb(filter: &[pb::FilterExpression]) -> Vec<domain::FilterExpression> {
    filter
        .iter()
        .map(|expr| domain::FilterExpression {
            terms: expr
                .terms
                .iter()
                .map(|t| domain::FilterTerm {
                    field: t.field.clone(),
                    value: t.value.clone(),
                    operation: match t.operation() {
                        pb::FilterOp::OpEquals => domain::FilterOp::Equals,
                        pb::FilterOp::OpStartsWith => domain::FilterOp::StartsWith,
                        pb::FilterOp::OpEndsWith => domain::FilterOp::EndsWith,
                        pb::FilterOp::OpContains => domain::FilterOp::Contains,
                        pb::FilterOp::OpExists => domain::FilterOp::Exists,
                    },
                    negate: t.negate,
                })
                .collect(),
        })
        .collect()
}

pub fn order_from_pb(order: &[pb::OrderExpression]) -> Vec<domain::OrderExpression> {
    order
        .iter()
        .map(|o| domain::OrderExpression {
            field: o.field.clone(),
            ascending: o.ascending,
        })
        .collect()
}

/// Maps the domain error taxonomy onto gRPC status codes.
pub fn error_to_status(err: &domain::DomainError) -> Status {
    use domain::DomainError::*;
    match err {
        InvalidSpec(msg) => Status::invalid_argument(msg.clone()),
        NotFound(msg) => Status::not_found(msg.clone()),
        Ambiguous(name) => Status::failed_precondition(format!("job {name} is ambiguous")),
        Unauthenticated => Status::unauthenticated("invalid token"),
        other => Status::internal(other.to_string()),
    }
}
