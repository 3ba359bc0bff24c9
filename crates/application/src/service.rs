//! Job orchestration service
//!
//! Composes executor, stores, log cutter, status reporter and event bus
//! into a full job run. Per-job multiplexing state lives in a concurrent
//! map with entry-level cancellation; the map lock is never held across
//! I/O.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use kiln_domain::{
    Annotation, DomainError, DomainResult, FilterExpression, JobConditions, JobMetadata, JobPhase,
    JobResult, JobStatus, JobTrigger, OrderExpression,
};
use kiln_logcutter::{html, Cutter, LogSliceEvent, SliceType};
use kiln_ports::{
    ContentProvider, ExecutorSink, JobStore, LogReader, LogStore, StartOptions, StatusReporter,
    WorkloadExecutor,
};

use crate::events::EventBus;
use crate::template::{self, TemplateContext};

/// Metadata annotation marking workloads that clean up after a user job.
/// Their status updates never reach stores, reporters or subscribers.
pub const CLEANUP_ANNOTATION: &str = "cleanupJob";

const WORKSPACE_VOLUME: &str = "kiln-workspace";
const WORKSPACE_MOUNT_PATH: &str = "/workspace";
const CHECKOUT_CONTAINER_NAME: &str = "kiln-checkout";
const CLEANUP_RETRY_BUDGET: u32 = 3;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// URL this installation is reachable on.
    pub base_url: String,
    /// Node location under which per-job workspaces are created.
    pub workspace_node_path_prefix: String,
}

/// Per-job multiplexer state. The log store tracks the open log itself;
/// all we keep here is the listener cancellation handle.
struct JobLog {
    cancel_executor_listener: Option<CancellationToken>,
}

/// The shape of a rendered job spec document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobSourceSpec {
    pod: Option<PodSpec>,
    #[serde(default)]
    failure_limit: Option<u32>,
}

/// What a Listen stream carries.
#[derive(Debug, Clone)]
pub enum ListenEvent {
    Update(JobStatus),
    Slice(LogSliceEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogListenMode {
    Disabled,
    /// Raw bytes, chunked into content slices.
    Unsliced,
    /// Sliced events, payloads verbatim.
    Raw,
    /// Sliced events rendered as HTML fragments.
    Html,
}

/// Ties everything together.
pub struct Service {
    jobs: Arc<dyn JobStore>,
    logs: Arc<dyn LogStore>,
    executor: Arc<dyn WorkloadExecutor>,
    cutter: Cutter,
    reporter: Arc<dyn StatusReporter>,
    events: EventBus,
    config: ServiceConfig,
    log_listener: DashMap<String, JobLog>,
}

/// Adapter handing executor updates to the service.
pub struct ServiceSink(pub Arc<Service>);

#[async_trait]
impl ExecutorSink for ServiceSink {
    async fn on_update(&self, workload: &Pod, status: &JobStatus) {
        self.0.handle_update(workload, status).await;
    }

    async fn on_error(&self, err: &DomainError) {
        error!("executor: {err}");
    }
}

impl Service {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        logs: Arc<dyn LogStore>,
        executor: Arc<dyn WorkloadExecutor>,
        reporter: Arc<dyn StatusReporter>,
        config: ServiceConfig,
    ) -> Arc<Self> {
        Arc::new(Service {
            jobs,
            logs,
            executor,
            cutter: Cutter::default(),
            reporter,
            events: EventBus::new(),
            config,
            log_listener: DashMap::new(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Starts a build job. Once this returns, the job either has a live
    /// workload or a terminal failure status has been durably recorded
    /// and announced.
    pub async fn run_job(
        self: &Arc<Self>,
        name: &str,
        metadata: JobMetadata,
        content: &dyn ContentProvider,
        job_yaml: &[u8],
        can_replay: bool,
    ) -> DomainResult<JobStatus> {
        match self
            .run_job_inner(name, metadata.clone(), content, job_yaml, can_replay)
            .await
        {
            Ok(status) => Ok(status),
            Err(err) => {
                self.fail_job_startup(name, metadata, &err).await;
                Err(err)
            }
        }
    }

    async fn run_job_inner(
        self: &Arc<Self>,
        name: &str,
        metadata: JobMetadata,
        content: &dyn ContentProvider,
        job_yaml: &[u8],
        can_replay: bool,
    ) -> DomainResult<JobStatus> {
        if can_replay {
            if let Err(err) = self.jobs.store_job_spec(name, job_yaml.to_vec()).await {
                warn!(job = name, "cannot store job YAML, job will not be replayable: {err}");
            }
        }

        let mut logs = self.logs.open(name).await?;
        self.log_listener.insert(
            name.to_string(),
            JobLog {
                cancel_executor_listener: None,
            },
        );

        logs.write_all(b"[preparing|PHASE] job preparation\n")
            .await
            .map_err(|e| DomainError::Store(format!("cannot write log for {name}: {e}")))?;

        let job_yaml = std::str::from_utf8(job_yaml)
            .map_err(|e| DomainError::InvalidSpec(format!("job spec is not UTF-8: {e}")))?;
        let rendered = template::render(job_yaml, &TemplateContext::new(name, &metadata))?;

        let source: JobSourceSpec = serde_yaml::from_str(&rendered)
            .map_err(|e| DomainError::InvalidSpec(format!("cannot decode job spec: {e}")))?;
        let mut podspec = source
            .pod
            .ok_or_else(|| DomainError::InvalidSpec("no pod spec present".to_string()))?;

        self.augment_spec(name, &mut podspec, content).await?;

        let dump = redacted_spec_yaml(&podspec)?;
        for line in dump.lines() {
            logs.write_all(format!("[kiln:template] {line}\n").as_bytes())
                .await
                .map_err(|e| DomainError::Store(format!("cannot write log for {name}: {e}")))?;
        }

        let mut opts = StartOptions::default()
            .with_name(name)
            .with_can_replay(can_replay);
        if let Some(limit) = source.failure_limit {
            opts = opts.with_failure_limit(limit);
        }
        let status = self.executor.start(podspec, metadata, opts).await?;

        content.serve(&status.name).await?;

        if let Err(err) = self.jobs.store(&status).await {
            warn!(job = %status.name, "cannot store job status: {err}");
        }

        Ok(status)
    }

    /// Adds the workspace volume and the checkout init step, and mounts
    /// the workspace in every container.
    async fn augment_spec(
        &self,
        name: &str,
        podspec: &mut PodSpec,
        content: &dyn ContentProvider,
    ) -> DomainResult<()> {
        podspec
            .volumes
            .get_or_insert_with(Vec::new)
            .push(workspace_volume(&self.config.workspace_node_path_prefix, name));

        let mut checkout = content.init_container().await?;
        checkout.name = CHECKOUT_CONTAINER_NAME.to_string();
        checkout.image_pull_policy = Some("IfNotPresent".to_string());
        checkout
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(workspace_mount());
        podspec
            .init_containers
            .get_or_insert_with(Vec::new)
            .insert(0, checkout);

        for container in &mut podspec.containers {
            container
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .push(workspace_mount());
        }

        Ok(())
    }

    /// Records and announces a failed job startup. The caller still sees
    /// the original error.
    async fn fail_job_startup(&self, name: &str, metadata: JobMetadata, err: &DomainError) {
        if let Ok(mut logs) = self.logs.append(name).await {
            let _ = logs
                .write_all(format!("\n[kiln] FAILURE {err}\n").as_bytes())
                .await;
        }

        let mut metadata = metadata;
        if metadata.created.is_none() {
            metadata.created = Some(chrono::Utc::now());
        }
        let status = JobStatus {
            name: name.to_string(),
            metadata,
            phase: JobPhase::Done,
            conditions: JobConditions {
                success: false,
                failure_count: 1,
                ..Default::default()
            },
            details: err.to_string(),
            results: Vec::new(),
        };

        if let Err(store_err) = self.jobs.store(&status).await {
            warn!(job = name, "cannot store failed job status: {store_err}");
        }
        self.events.publish(&status);
    }

    /// The executor's update path. Runs for every observed event,
    /// including duplicates.
    pub async fn handle_update(self: &Arc<Self>, workload: &Pod, status: &JobStatus) {
        // cleanup jobs are not user triggered and must not pollute the system
        if status.metadata.has_annotation(CLEANUP_ANNOTATION) {
            return;
        }

        self.ensure_logging(status).await;

        if let Ok(mut out) = self.logs.append(&status.name).await {
            if let Ok(manifest) = serde_yaml::to_string(workload) {
                for line in manifest.lines() {
                    if out
                        .write_all(format!("[kiln:kubernetes] {line}\n").as_bytes())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
            if let Ok(json) = serde_json::to_string(status) {
                let _ = out
                    .write_all(format!("[kiln:status] {json}\n").as_bytes())
                    .await;
            }
        }

        if status.phase == JobPhase::Cleanup {
            if let Some((_, job_log)) = self.log_listener.remove(&status.name) {
                if let Some(cancel) = job_log.cancel_executor_listener {
                    cancel.cancel();
                }
                if let Err(err) = self.logs.close(&status.name).await {
                    warn!(job = %status.name, "cannot close log store: {err}");
                }
                self.cleanup_job_workspace(status).await;
            }
            return;
        }

        if let Err(err) = self.jobs.store(status).await {
            warn!(job = %status.name, "cannot store job: {err}");
        }
        if let Err(err) = self.reporter.report(status).await {
            warn!(job = %status.name, "cannot report job status: {err}");
        }
        self.events.publish(status);
    }

    /// Re-establishes log storage and the executor log listener for jobs
    /// this instance does not know yet (e.g. after a restart).
    async fn ensure_logging(self: &Arc<Self>, status: &JobStatus) {
        if status.phase > JobPhase::Done {
            return;
        }

        if !self.log_listener.contains_key(&status.name) {
            if let Err(err) = self.logs.open(&status.name).await {
                error!(job = %status.name, "cannot (re-)establish logs for this job: {err}");
                return;
            }
            self.log_listener.insert(
                status.name.clone(),
                JobLog {
                    cancel_executor_listener: None,
                },
            );
        }

        // claim the listener slot under the entry lock, attach outside it
        let token = {
            let mut entry = match self.log_listener.get_mut(&status.name) {
                Some(entry) => entry,
                None => return,
            };
            if entry.cancel_executor_listener.is_some() {
                return;
            }
            let token = CancellationToken::new();
            entry.cancel_executor_listener = Some(token.clone());
            token
        };

        match self.executor.logs(&status.name).await {
            Ok(reader) => {
                let this = Arc::clone(self);
                let name = status.name.clone();
                tokio::spawn(async move {
                    if let Err(err) = this.clone().listen_to_logs(&name, reader, token).await {
                        error!(job = %name, "cannot listen to job logs: {err}");
                        if let Some(mut entry) = this.log_listener.get_mut(&name) {
                            entry.cancel_executor_listener = None;
                        }
                    }
                });
            }
            Err(err) => {
                warn!(job = %status.name, "cannot attach to executor logs: {err}");
                if let Some(mut entry) = self.log_listener.get_mut(&status.name) {
                    entry.cancel_executor_listener = None;
                }
            }
        }
    }

    /// Tees executor log bytes into the log store and the cutter; RESULT
    /// slices register on the executor. Log I/O failure stops the job.
    async fn listen_to_logs(
        self: Arc<Self>,
        name: &str,
        mut reader: LogReader,
        cancel: CancellationToken,
    ) -> DomainResult<()> {
        use tokio::io::AsyncReadExt;

        let mut out = self.logs.append(name).await?;

        let (cut_tx, cut_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let (mut events, mut errors) = self
            .cutter
            .slice(StreamReader::new(ReceiverStream::new(cut_rx)));

        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(err) => return self.stop_on_log_failure(name, &err).await,
                    };
                    if let Err(err) = out.write_all(&buf[..n]).await {
                        return self.stop_on_log_failure(name, &err).await;
                    }
                    // same-read tee: slice events cannot reorder against
                    // stored bytes
                    let _ = cut_tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await;
                }
                Some(evt) = events.recv() => self.handle_slice_event(name, evt).await,
                Some(err) = errors.recv() => {
                    warn!(job = name, "listening for build results failed: {err}");
                }
            }
        }

        drop(cut_tx);
        while let Some(evt) = events.recv().await {
            self.handle_slice_event(name, evt).await;
        }
        Ok(())
    }

    async fn stop_on_log_failure(&self, name: &str, err: &std::io::Error) -> DomainResult<()> {
        let reason = format!("log infrastructure failure: {err}");
        if let Err(stop_err) = self.executor.stop(name, &reason).await {
            warn!(job = name, "cannot stop job after log failure: {stop_err}");
        }
        Err(DomainError::Store(reason))
    }

    async fn handle_slice_event(&self, name: &str, evt: LogSliceEvent) {
        if evt.slice_type != SliceType::Result {
            return;
        }
        let result = parse_result(&evt.name, &evt.payload);
        if let Err(err) = self.executor.register_result(name, &result).await {
            warn!(job = name, ?result, "cannot record job result: {err}");
        }
    }

    /// Starts the workspace-removal job for a finished build. Its updates
    /// are invisible to subscribers.
    async fn cleanup_job_workspace(&self, status: &JobStatus) {
        let name = &status.name;
        let metadata = JobMetadata {
            owner: status.metadata.owner.clone(),
            repository: status.metadata.repository.clone(),
            trigger: JobTrigger::Unknown,
            created: None,
            finished: None,
            annotations: vec![Annotation {
                key: CLEANUP_ANNOTATION.to_string(),
                value: "true".to_string(),
            }],
        };

        let podspec = PodSpec {
            volumes: Some(vec![workspace_volume(
                &self.config.workspace_node_path_prefix,
                name,
            )]),
            containers: vec![Container {
                name: "cleanup".to_string(),
                image: Some("alpine:latest".to_string()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "rm -rf *".to_string(),
                ]),
                working_dir: Some(WORKSPACE_MOUNT_PATH.to_string()),
                volume_mounts: Some(vec![workspace_mount()]),
                ..Default::default()
            }],
            restart_policy: Some("OnFailure".to_string()),
            ..Default::default()
        };

        let opts = StartOptions::default()
            .with_name(format!("cleanup-{name}"))
            .with_failure_limit(CLEANUP_RETRY_BUDGET)
            .with_can_replay(false);
        if let Err(err) = self.executor.start(podspec, metadata, opts).await {
            error!(job = %name, "cannot start cleanup job: {err}");
        }
    }

    pub async fn stop_job(&self, name: &str) -> DomainResult<()> {
        self.executor.stop(name, "job was stopped manually").await
    }

    pub async fn get_job(&self, name: &str) -> DomainResult<Option<JobStatus>> {
        self.jobs.get(name).await
    }

    pub async fn get_job_spec(&self, name: &str) -> DomainResult<Option<Vec<u8>>> {
        self.jobs.get_job_spec(name).await
    }

    pub async fn list_jobs(
        &self,
        filter: &[FilterExpression],
        order: &[OrderExpression],
        start: i64,
        limit: i64,
    ) -> DomainResult<(Vec<JobStatus>, i64)> {
        self.jobs.find(filter, order, start, limit).await
    }

    /// Streams status updates for all jobs matching the filter.
    pub fn subscribe(&self, filter: Vec<FilterExpression>) -> mpsc::Receiver<JobStatus> {
        self.events.subscribe(filter)
    }

    /// Streams a single job: optional log replay plus live slices, and
    /// status updates when requested. Ends when the receiver is dropped.
    pub async fn listen(
        self: &Arc<Self>,
        name: &str,
        updates: bool,
        mode: LogListenMode,
    ) -> DomainResult<mpsc::Receiver<ListenEvent>> {
        let (tx, rx) = mpsc::channel(64);

        if updates {
            if let Some(current) = self.jobs.get(name).await? {
                let _ = tx.send(ListenEvent::Update(current)).await;
            }
            let mut bus_rx = self.events.subscribe_job(name);
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(status) = bus_rx.recv().await {
                    if tx.send(ListenEvent::Update(status)).await.is_err() {
                        break;
                    }
                }
            });
        }

        if mode != LogListenMode::Disabled {
            let reader = self.logs.read(name).await?;
            match mode {
                LogListenMode::Unsliced => {
                    tokio::spawn(forward_unsliced(reader, tx));
                }
                _ => {
                    let (mut events, _errors) = self.cutter.slice(reader);
                    tokio::spawn(async move {
                        while let Some(mut evt) = events.recv().await {
                            if mode == LogListenMode::Html {
                                evt.payload = html::render(&evt);
                            }
                            if tx.send(ListenEvent::Slice(evt)).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            }
        }

        debug!(job = name, "listener attached");
        Ok(rx)
    }
}

async fn forward_unsliced(mut reader: LogReader, tx: mpsc::Sender<ListenEvent>) {
    use tokio::io::AsyncReadExt;

    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let evt = LogSliceEvent {
                    slice_type: SliceType::Content,
                    name: String::new(),
                    payload: String::from_utf8_lossy(&buf[..n]).into_owned(),
                };
                if tx.send(ListenEvent::Slice(evt)).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn workspace_volume(prefix: &str, name: &str) -> Volume {
    Volume {
        name: WORKSPACE_VOLUME.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: format!("{}/{}", prefix.trim_end_matches('/'), name),
            type_: Some("DirectoryOrCreate".to_string()),
        }),
        ..Default::default()
    }
}

fn workspace_mount() -> VolumeMount {
    VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: WORKSPACE_MOUNT_PATH.to_string(),
        read_only: Some(false),
        ..Default::default()
    }
}

/// YAML dump of the spec with secret-looking env values blanked.
fn redacted_spec_yaml(podspec: &PodSpec) -> DomainResult<String> {
    let mut redacted = podspec.clone();
    let containers = redacted
        .init_containers
        .iter_mut()
        .flatten()
        .chain(redacted.containers.iter_mut());
    for container in containers {
        for env in container.env.iter_mut().flatten() {
            if env.name.to_lowercase().contains("secret") {
                env.value = Some("[redacted]".to_string());
            }
        }
    }
    serde_yaml::to_string(&Pod {
        spec: Some(redacted),
        ..Default::default()
    })
    .map_err(|e| DomainError::InvalidSpec(format!("cannot serialize job spec: {e}")))
}

/// A RESULT payload is either JSON `{payload, channels, description}` or
/// whitespace-separated `<payload> <description...>`.
fn parse_result(kind: &str, payload: &str) -> JobResult {
    #[derive(Deserialize)]
    struct Body {
        #[serde(default)]
        payload: String,
        #[serde(default)]
        channels: Vec<String>,
        #[serde(default)]
        description: String,
    }

    if let Ok(body) = serde_json::from_str::<Body>(payload) {
        JobResult {
            type_: kind.trim().to_string(),
            payload: body.payload,
            description: body.description,
            channels: body.channels,
        }
    } else {
        let mut segments = payload.split_whitespace();
        let first = segments.next().unwrap_or_default().to_string();
        let description = segments.collect::<Vec<_>>().join(" ");
        JobResult {
            type_: kind.trim().to_string(),
            payload: first,
            description,
            channels: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn result_payloads_parse_both_shapes() {
        let json = parse_result(
            "build",
            r#"{"payload":"image acme/x:v1","channels":["docker"],"description":"img"}"#,
        );
        assert_eq!(json.payload, "image acme/x:v1");
        assert_eq!(json.channels, vec!["docker".to_string()]);
        assert_eq!(json.description, "img");

        let plain = parse_result("build", "image acme/x:v1 built from main");
        assert_eq!(plain.payload, "image");
        assert_eq!(plain.description, "acme/x:v1 built from main");
        assert!(plain.channels.is_empty());
    }

    #[test]
    fn redaction_blanks_secretish_env_values() {
        use k8s_openapi::api::core::v1::EnvVar;

        let spec = PodSpec {
            containers: vec![Container {
                name: "build".to_string(),
                env: Some(vec![
                    EnvVar {
                        name: "GITHUB_SECRET_TOKEN".to_string(),
                        value: Some("hunter2".to_string()),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "PLAIN".to_string(),
                        value: Some("visible".to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            ..Default::default()
        };

        let dump = redacted_spec_yaml(&spec).unwrap();
        assert!(!dump.contains("hunter2"));
        assert!(dump.contains("[redacted]"));
        assert!(dump.contains("visible"));
    }
}
