//! Kubernetes workload executor
//!
//! Owns the mapping job name -> pod: submits workloads, watches them,
//! translates pod state into the canonical job status, enforces timeouts
//! and deletes finished workloads. The embedding service receives every
//! recomputed status through its [`ExecutorSink`].

pub mod logs;
pub mod status;
pub mod watch;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use kube::api::{Api, ListParams, PostParams};
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::debug;

use kiln_domain::{DomainError, DomainResult, JobMetadata, JobResult, JobStatus};
use kiln_ports::{ExecutorSink, LogReader, StartOptions, WorkloadExecutor};

pub use status::compute_status;

/// Label applied to every workload the executor creates. Objects lacking
/// it are invisible to the watcher.
pub const LABEL_MARKER: &str = "kiln.dev/job";

/// Label carrying the job name.
pub const LABEL_JOB_NAME: &str = "kiln.dev/jobName";

/// Annotation holding the JSON-encoded job metadata, written at creation
/// and never mutated.
pub const ANNOTATION_METADATA: &str = "kiln.dev/metadata";

/// Annotation denoting the max times a job may fail.
pub const ANNOTATION_FAILURE_LIMIT: &str = "kiln.dev/failureLimit";

/// Annotation that explicitly fails the job.
pub const ANNOTATION_FAILED: &str = "kiln.dev/failed";

/// Annotation accumulating the job's structured results.
pub const ANNOTATION_RESULTS: &str = "kiln.dev/results";

/// Annotation marking the job replayable.
pub const ANNOTATION_CAN_REPLAY: &str = "kiln.dev/canReplay";

/// Prefix for user annotations stored on the workload.
pub const USERDATA_ANNOTATION_PREFIX: &str = "userdata.kiln.dev/";

const ANNOTATION_CONFLICT_RETRIES: usize = 5;

/// Configures the executor.
#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    /// Max time a job may spend in PREPARING.
    pub prep_timeout: Duration,
    /// Max time a job may spend in any non-terminal phase.
    pub total_timeout: Duration,
    /// Optional JSON trace of every watch event; `-` writes to stdout.
    pub event_trace_log: Option<PathBuf>,
}

/// Starts and watches jobs running in Kubernetes.
pub struct Executor {
    client: kube::Client,
    config: Config,
    sink: RwLock<Option<Arc<dyn ExecutorSink>>>,
}

impl Executor {
    pub fn new(config: Config, client: kube::Client) -> DomainResult<Arc<Self>> {
        if config.total_timeout < config.prep_timeout {
            return Err(DomainError::InvalidSpec(
                "total job timeout must be greater than the preparation timeout".to_string(),
            ));
        }

        Ok(Arc::new(Executor {
            client,
            config,
            sink: RwLock::new(None),
        }))
    }

    /// Installs the update sink. Must be called before [`Executor::run`].
    pub async fn bind(&self, sink: Arc<dyn ExecutorSink>) {
        *self.sink.write().await = Some(sink);
    }

    /// Spawns the watcher and housekeeping loops and returns immediately.
    pub fn run(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(self).monitor());
        tokio::spawn(Arc::clone(self).housekeeping());
    }

    pub(crate) fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) async fn notify_update(&self, pod: &Pod, status: &JobStatus) {
        if let Some(sink) = self.sink.read().await.as_ref() {
            sink.on_update(pod, status).await;
        }
    }

    pub(crate) async fn notify_error(&self, err: DomainError) {
        if let Some(sink) = self.sink.read().await.as_ref() {
            sink.on_error(&err).await;
        }
    }

    /// Finds the unique pod carrying the job-name label.
    pub(crate) async fn find_pod(&self, name: &str) -> DomainResult<Pod> {
        let lp = ListParams::default().labels(&format!("{LABEL_JOB_NAME}={name}"));
        let pods = self
            .pods()
            .list(&lp)
            .await
            .map_err(|e| DomainError::TransientInfra(format!("cannot list workloads: {e}")))?;

        let mut items = pods.items;
        match items.len() {
            0 => Err(DomainError::NotFound(format!("unknown job: {name}"))),
            1 => Ok(items.remove(0)),
            _ => Err(DomainError::Ambiguous(name.to_string())),
        }
    }

    /// Read-modify-write of pod annotations with conflict retry.
    pub(crate) async fn add_annotations(
        &self,
        pod_name: &str,
        annotations: &[(String, String)],
    ) -> DomainResult<()> {
        let api = self.pods();
        let mut backoff = Duration::from_millis(10);

        for _ in 0..ANNOTATION_CONFLICT_RETRIES {
            let mut pod = api.get(pod_name).await.map_err(|e| {
                DomainError::TransientInfra(format!("cannot find workload {pod_name}: {e}"))
            })?;

            let target = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
            for (key, value) in annotations {
                target.insert(key.clone(), value.clone());
            }

            match api.replace(pod_name, &PostParams::default(), &pod).await {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    return Err(DomainError::TransientInfra(format!(
                        "cannot update workload {pod_name}: {e}"
                    )))
                }
            }
        }

        Err(DomainError::TransientInfra(format!(
            "annotation update on {pod_name} kept conflicting"
        )))
    }
}

/// Builds the workload object for a job: marker and name labels, the
/// immutable metadata annotation (created stamped here), run policies.
fn build_pod(
    mut spec: PodSpec,
    mut metadata: JobMetadata,
    opts: &StartOptions,
) -> DomainResult<Pod> {
    if spec.containers.is_empty() {
        return Err(DomainError::InvalidSpec(
            "no container spec present".to_string(),
        ));
    }

    let name = opts.name.clone().unwrap_or_else(generate_name);

    metadata.created = Some(chrono::Utc::now());

    let mut annotations = BTreeMap::new();
    for (key, value) in &opts.annotations {
        annotations.insert(format!("{USERDATA_ANNOTATION_PREFIX}{key}"), value.clone());
    }
    annotations.insert(
        ANNOTATION_METADATA.to_string(),
        serde_json::to_string(&metadata)
            .map_err(|e| DomainError::InvalidSpec(format!("cannot marshal metadata: {e}")))?,
    );
    if let Some(limit) = opts.failure_limit {
        annotations.insert(ANNOTATION_FAILURE_LIMIT.to_string(), limit.to_string());
    }
    if opts.can_replay {
        annotations.insert(ANNOTATION_CAN_REPLAY.to_string(), "true".to_string());
    }

    if !matches!(spec.restart_policy.as_deref(), Some("Never") | Some("OnFailure")) {
        spec.restart_policy = Some("OnFailure".to_string());
    }

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MARKER.to_string(), "true".to_string());
    labels.insert(LABEL_JOB_NAME.to_string(), name.clone());

    Ok(Pod {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

#[async_trait]
impl WorkloadExecutor for Executor {
    async fn start(
        &self,
        spec: PodSpec,
        metadata: JobMetadata,
        opts: StartOptions,
    ) -> DomainResult<JobStatus> {
        let pod = build_pod(spec, metadata, &opts)?;

        debug!(job = ?pod.metadata.name, "scheduling workload");
        let created = self
            .pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| DomainError::SubmissionRejected(e.to_string()))?;

        compute_status(&created)
    }

    async fn stop(&self, name: &str, reason: &str) -> DomainResult<()> {
        let pod = self.find_pod(name).await?;
        let pod_name = pod.metadata.name.as_deref().unwrap_or(name);
        self.add_annotations(
            pod_name,
            &[(ANNOTATION_FAILED.to_string(), reason.to_string())],
        )
        .await
    }

    async fn register_result(&self, name: &str, result: &JobResult) -> DomainResult<()> {
        let pod = self.find_pod(name).await?;
        let pod_name = pod
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| name.to_string());

        let mut results: Vec<JobResult> = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_RESULTS))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        if results
            .iter()
            .any(|r| r.type_ == result.type_ && r.payload == result.payload)
        {
            return Ok(());
        }
        results.push(result.clone());

        let encoded = serde_json::to_string(&results)
            .map_err(|e| DomainError::TransientInfra(format!("cannot marshal results: {e}")))?;
        self.add_annotations(&pod_name, &[(ANNOTATION_RESULTS.to_string(), encoded)])
            .await
    }

    async fn logs(&self, name: &str) -> DomainResult<LogReader> {
        let pod = self.find_pod(name).await?;
        Ok(logs::stream(self.pods(), pod))
    }
}

const NAME_ADJECTIVES: [&str; 16] = [
    "amber", "bold", "calm", "dapper", "eager", "fuzzy", "gentle", "hasty", "ivory", "jolly",
    "keen", "lucid", "mellow", "nimble", "proud", "quiet",
];

const NAME_NOUNS: [&str; 16] = [
    "anvil", "beacon", "cobalt", "drift", "ember", "falcon", "garnet", "harbor", "ingot", "jetty",
    "kelp", "lantern", "meadow", "nutmeg", "otter", "pebble",
];

/// Mints a human-readable job name. Uniqueness is enforced by the
/// orchestrator at submission.
fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = NAME_ADJECTIVES.choose(&mut rng).unwrap_or(&"bold");
    let noun = NAME_NOUNS.choose(&mut rng).unwrap_or(&"anvil");
    format!("kiln-{adjective}-{noun}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Container;
    use pretty_assertions::assert_eq;

    fn spec() -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "build".to_string(),
                image: Some("alpine:latest".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn generated_names_carry_the_prefix() {
        let name = generate_name();
        assert!(name.starts_with("kiln-"));
        assert_eq!(name.split('-').count(), 3);
    }

    #[test]
    fn workloads_carry_marker_labels_and_metadata() {
        let opts = StartOptions::default()
            .with_name("job-1")
            .with_annotation("variant", "nightly")
            .with_failure_limit(2)
            .with_can_replay(true);
        let pod = build_pod(spec(), JobMetadata::default(), &opts).unwrap();

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(LABEL_MARKER).map(String::as_str), Some("true"));
        assert_eq!(labels.get(LABEL_JOB_NAME).map(String::as_str), Some("job-1"));

        let annotations = pod.metadata.annotations.unwrap();
        let metadata: JobMetadata =
            serde_json::from_str(annotations.get(ANNOTATION_METADATA).unwrap()).unwrap();
        assert!(metadata.created.is_some());
        assert_eq!(
            annotations.get("userdata.kiln.dev/variant").map(String::as_str),
            Some("nightly")
        );
        assert_eq!(
            annotations.get(ANNOTATION_FAILURE_LIMIT).map(String::as_str),
            Some("2")
        );
        assert_eq!(
            annotations.get(ANNOTATION_CAN_REPLAY).map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn restart_policy_is_coerced_to_on_failure() {
        let pod = build_pod(spec(), JobMetadata::default(), &StartOptions::default()).unwrap();
        assert_eq!(
            pod.spec.unwrap().restart_policy.as_deref(),
            Some("OnFailure")
        );

        let mut explicit = spec();
        explicit.restart_policy = Some("Never".to_string());
        let pod = build_pod(explicit, JobMetadata::default(), &StartOptions::default()).unwrap();
        assert_eq!(pod.spec.unwrap().restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn an_empty_container_list_is_an_invalid_spec() {
        let err = build_pod(
            PodSpec::default(),
            JobMetadata::default(),
            &StartOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvalidSpec(_)));
    }
}
