//! Service pipeline tests against in-memory stores and a recording
//! executor.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use tokio::io::AsyncWrite;

use kiln_application::{LogListenMode, Service, ServiceConfig, CLEANUP_ANNOTATION};
use kiln_domain::{
    Annotation, DomainError, DomainResult, FilterExpression, JobConditions, JobMetadata, JobPhase,
    JobResult, JobStatus, OrderExpression,
};
use kiln_ports::{
    ContentProvider, JobStore, LogReader, LogStore, LogWriter, StartOptions, StatusReporter,
    WorkloadExecutor,
};

#[derive(Default)]
struct MemJobStore {
    jobs: Mutex<HashMap<String, JobStatus>>,
    specs: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl JobStore for MemJobStore {
    async fn store(&self, status: &JobStatus) -> DomainResult<()> {
        self.jobs
            .lock()
            .unwrap()
            .insert(status.name.clone(), status.clone());
        Ok(())
    }

    async fn get(&self, name: &str) -> DomainResult<Option<JobStatus>> {
        Ok(self.jobs.lock().unwrap().get(name).cloned())
    }

    async fn store_job_spec(&self, name: &str, spec: Vec<u8>) -> DomainResult<()> {
        self.specs.lock().unwrap().insert(name.to_string(), spec);
        Ok(())
    }

    async fn get_job_spec(&self, name: &str) -> DomainResult<Option<Vec<u8>>> {
        Ok(self.specs.lock().unwrap().get(name).cloned())
    }

    async fn find(
        &self,
        filter: &[FilterExpression],
        _order: &[OrderExpression],
        _start: i64,
        _limit: i64,
    ) -> DomainResult<(Vec<JobStatus>, i64)> {
        let jobs: Vec<JobStatus> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|s| kiln_domain::filter::matches(filter, s))
            .cloned()
            .collect();
        let total = jobs.len() as i64;
        Ok((jobs, total))
    }
}

#[derive(Clone)]
struct MemLogWriter(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for MemLogWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
struct MemLogStore {
    logs: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
    closed: Mutex<Vec<String>>,
}

impl MemLogStore {
    fn contents(&self, name: &str) -> String {
        self.logs
            .lock()
            .unwrap()
            .get(name)
            .map(|buf| String::from_utf8_lossy(&buf.lock().unwrap()).into_owned())
            .unwrap_or_default()
    }

    fn buffer(&self, name: &str) -> Arc<Mutex<Vec<u8>>> {
        self.logs
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl LogStore for MemLogStore {
    async fn open(&self, name: &str) -> DomainResult<LogWriter> {
        Ok(Box::new(MemLogWriter(self.buffer(name))))
    }

    async fn append(&self, name: &str) -> DomainResult<LogWriter> {
        Ok(Box::new(MemLogWriter(self.buffer(name))))
    }

    async fn read(&self, name: &str) -> DomainResult<LogReader> {
        let snapshot = self.buffer(name).lock().unwrap().clone();
        Ok(Box::new(std::io::Cursor::new(snapshot)))
    }

    async fn close(&self, name: &str) -> DomainResult<()> {
        self.closed.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeExecutor {
    starts: Mutex<Vec<(PodSpec, JobMetadata, StartOptions)>>,
    stops: Mutex<Vec<(String, String)>>,
    results: Mutex<Vec<(String, JobResult)>>,
    /// Bytes `logs()` hands out, simulating workload output.
    log_output: Vec<u8>,
}

impl FakeExecutor {
    fn with_log_output(output: &[u8]) -> Self {
        FakeExecutor {
            log_output: output.to_vec(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl WorkloadExecutor for FakeExecutor {
    async fn start(
        &self,
        spec: PodSpec,
        mut metadata: JobMetadata,
        opts: StartOptions,
    ) -> DomainResult<JobStatus> {
        if spec.containers.is_empty() {
            return Err(DomainError::InvalidSpec(
                "no container spec present".to_string(),
            ));
        }
        metadata.created = Some(chrono::Utc::now());
        let name = opts.name.clone().unwrap_or_else(|| "generated".to_string());
        self.starts
            .lock()
            .unwrap()
            .push((spec, metadata.clone(), opts));
        Ok(JobStatus {
            name,
            metadata,
            phase: JobPhase::Preparing,
            conditions: JobConditions::default(),
            details: String::new(),
            results: Vec::new(),
        })
    }

    async fn stop(&self, name: &str, reason: &str) -> DomainResult<()> {
        self.stops
            .lock()
            .unwrap()
            .push((name.to_string(), reason.to_string()));
        Ok(())
    }

    async fn register_result(&self, name: &str, result: &JobResult) -> DomainResult<()> {
        self.results
            .lock()
            .unwrap()
            .push((name.to_string(), result.clone()));
        Ok(())
    }

    async fn logs(&self, _name: &str) -> DomainResult<LogReader> {
        Ok(Box::new(std::io::Cursor::new(self.log_output.clone())))
    }
}

#[derive(Default)]
struct StaticContent {
    served: Mutex<Vec<String>>,
}

#[async_trait]
impl ContentProvider for StaticContent {
    async fn init_container(&self) -> DomainResult<Container> {
        Ok(Container {
            image: Some("busybox:latest".to_string()),
            command: Some(vec!["sh".to_string(), "-c".to_string(), "true".to_string()]),
            ..Default::default()
        })
    }

    async fn serve(&self, job_name: &str) -> DomainResult<()> {
        self.served.lock().unwrap().push(job_name.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingReporter {
    reported: Mutex<Vec<JobStatus>>,
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report(&self, status: &JobStatus) -> DomainResult<()> {
        self.reported.lock().unwrap().push(status.clone());
        Ok(())
    }
}

struct Harness {
    service: Arc<Service>,
    jobs: Arc<MemJobStore>,
    logs: Arc<MemLogStore>,
    executor: Arc<FakeExecutor>,
    reporter: Arc<RecordingReporter>,
}

fn harness() -> Harness {
    harness_with(Arc::new(FakeExecutor::default()))
}

fn harness_with(executor: Arc<FakeExecutor>) -> Harness {
    let jobs = Arc::new(MemJobStore::default());
    let logs = Arc::new(MemLogStore::default());
    let reporter = Arc::new(RecordingReporter::default());
    let service = Service::new(
        jobs.clone(),
        logs.clone(),
        executor.clone(),
        reporter.clone(),
        ServiceConfig {
            base_url: "http://kiln.test".to_string(),
            workspace_node_path_prefix: "/mnt/kiln".to_string(),
        },
    );
    Harness {
        service,
        jobs,
        logs,
        executor,
        reporter,
    }
}

fn metadata() -> JobMetadata {
    JobMetadata {
        owner: "jane".to_string(),
        ..Default::default()
    }
}

const SIMPLE_JOB: &str = r#"
pod:
  containers:
  - name: build
    image: alpine:latest
    command: ["sh", "-c", "echo hello {{owner}}"]
"#;

#[tokio::test]
async fn run_job_submits_an_augmented_workload() {
    let h = harness();
    let content = StaticContent::default();

    let status = h
        .service
        .run_job("job-1", metadata(), &content, SIMPLE_JOB.as_bytes(), true)
        .await
        .unwrap();
    assert_eq!(status.name, "job-1");
    assert_eq!(status.phase, JobPhase::Preparing);

    let starts = h.executor.starts.lock().unwrap();
    let (spec, _md, opts) = &starts[0];

    // template was rendered over the metadata
    assert_eq!(
        spec.containers[0].command.as_ref().unwrap()[2],
        "echo hello jane"
    );

    // workspace volume on a per-job host path
    let volumes = spec.volumes.as_ref().unwrap();
    assert!(volumes.iter().any(|v| {
        v.name == "kiln-workspace"
            && v.host_path
                .as_ref()
                .is_some_and(|hp| hp.path == "/mnt/kiln/job-1")
    }));

    // checkout init step comes first and mounts the workspace
    let init = &spec.init_containers.as_ref().unwrap()[0];
    assert_eq!(init.name, "kiln-checkout");
    assert!(init
        .volume_mounts
        .as_ref()
        .unwrap()
        .iter()
        .any(|m| m.mount_path == "/workspace"));

    // every container mounts the workspace
    assert!(spec.containers[0]
        .volume_mounts
        .as_ref()
        .unwrap()
        .iter()
        .any(|m| m.mount_path == "/workspace"));

    assert_eq!(opts.name.as_deref(), Some("job-1"));
    assert!(opts.can_replay);

    // content was served, spec stored for replay, status persisted
    assert_eq!(content.served.lock().unwrap().as_slice(), ["job-1"]);
    assert!(h.jobs.get_job_spec("job-1").await.unwrap().is_some());
    assert!(h.jobs.get("job-1").await.unwrap().is_some());

    // the log opens with the synthetic phase marker and the redacted dump
    let log = h.logs.contents("job-1");
    assert!(log.starts_with("[preparing|PHASE] job preparation\n"));
    assert!(log.contains("[kiln:template] "));
}

#[tokio::test]
async fn failed_startup_is_recorded_and_announced() {
    let h = harness();
    let content = StaticContent::default();
    let mut updates = h.service.subscribe(Vec::new());

    let err = h
        .service
        .run_job(
            "job-2",
            metadata(),
            &content,
            b"pod: {{#unclosed}}",
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidSpec(_)));

    let stored = h.jobs.get("job-2").await.unwrap().unwrap();
    assert_eq!(stored.phase, JobPhase::Done);
    assert!(!stored.conditions.success);
    assert_eq!(stored.conditions.failure_count, 1);
    assert!(stored.metadata.created.is_some());

    let announced = updates.recv().await.unwrap();
    assert_eq!(announced.name, "job-2");
    assert_eq!(announced.phase, JobPhase::Done);

    assert!(h.logs.contents("job-2").contains("[kiln] FAILURE"));
}

#[tokio::test]
async fn a_spec_without_pod_is_rejected() {
    let h = harness();
    let err = h
        .service
        .run_job(
            "job-3",
            metadata(),
            &StaticContent::default(),
            b"failureLimit: 2",
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidSpec(_)));
}

#[tokio::test]
async fn updates_persist_report_and_publish() {
    let h = harness();
    let mut updates = h.service.subscribe(Vec::new());

    let status = JobStatus {
        name: "job-4".to_string(),
        metadata: metadata(),
        phase: JobPhase::Running,
        ..Default::default()
    };
    h.service.handle_update(&Pod::default(), &status).await;

    assert_eq!(
        h.jobs.get("job-4").await.unwrap().unwrap().phase,
        JobPhase::Running
    );
    assert_eq!(h.reporter.reported.lock().unwrap().len(), 1);
    assert_eq!(updates.recv().await.unwrap().name, "job-4");
}

#[tokio::test]
async fn cleanup_phase_tears_down_and_spawns_the_cleanup_job() {
    let h = harness();
    let content = StaticContent::default();
    h.service
        .run_job("job-5", metadata(), &content, SIMPLE_JOB.as_bytes(), false)
        .await
        .unwrap();

    let mut updates = h.service.subscribe(Vec::new());
    let status = JobStatus {
        name: "job-5".to_string(),
        metadata: metadata(),
        phase: JobPhase::Cleanup,
        ..Default::default()
    };
    h.service.handle_update(&Pod::default(), &status).await;

    // the log store was closed and the cleanup workload submitted
    assert_eq!(h.logs.closed.lock().unwrap().as_slice(), ["job-5"]);

    let starts = h.executor.starts.lock().unwrap();
    let (spec, md, opts) = starts.last().unwrap();
    assert_eq!(opts.name.as_deref(), Some("cleanup-job-5"));
    assert_eq!(opts.failure_limit, Some(3));
    assert!(md
        .annotations
        .iter()
        .any(|a| a.key == CLEANUP_ANNOTATION && a.value == "true"));
    assert_eq!(
        spec.containers[0].command.as_ref().unwrap().last().unwrap(),
        "rm -rf *"
    );
    assert_eq!(
        spec.containers[0].working_dir.as_deref(),
        Some("/workspace")
    );

    // cleanup is not announced to subscribers
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn cleanup_job_updates_stay_invisible() {
    let h = harness();
    let mut updates = h.service.subscribe(Vec::new());

    let status = JobStatus {
        name: "cleanup-job-6".to_string(),
        metadata: JobMetadata {
            annotations: vec![Annotation {
                key: CLEANUP_ANNOTATION.to_string(),
                value: "true".to_string(),
            }],
            ..Default::default()
        },
        phase: JobPhase::Done,
        ..Default::default()
    };
    h.service.handle_update(&Pod::default(), &status).await;

    assert!(h.jobs.get("cleanup-job-6").await.unwrap().is_none());
    assert!(updates.try_recv().is_err());
    assert!(h.reporter.reported.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stop_job_delegates_with_the_manual_reason() {
    let h = harness();
    h.service.stop_job("job-7").await.unwrap();
    assert_eq!(
        h.executor.stops.lock().unwrap().as_slice(),
        [("job-7".to_string(), "job was stopped manually".to_string())]
    );
}

#[tokio::test]
async fn workload_results_are_extracted_and_registered() {
    let executor = Arc::new(FakeExecutor::with_log_output(
        b"compiling the world\n[build|RESULT] {\"payload\":\"image acme/x:v1\",\"channels\":[\"docker\"]}\n",
    ));
    let h = harness_with(executor.clone());
    h.service
        .run_job(
            "job-9",
            metadata(),
            &StaticContent::default(),
            SIMPLE_JOB.as_bytes(),
            false,
        )
        .await
        .unwrap();

    // the first update attaches the executor log listener
    let status = JobStatus {
        name: "job-9".to_string(),
        metadata: metadata(),
        phase: JobPhase::Running,
        ..Default::default()
    };
    h.service.handle_update(&Pod::default(), &status).await;

    // the listener drains the canned log on its own task
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let results = executor.results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "job-9");
    assert_eq!(results[0].1.type_, "build");
    assert_eq!(results[0].1.payload, "image acme/x:v1");
    assert_eq!(results[0].1.channels, vec!["docker".to_string()]);

    // the same read landed in the log store
    assert!(h.logs.contents("job-9").contains("compiling the world"));
}

#[tokio::test]
async fn listen_replays_the_log_as_slices() {
    let h = harness();
    let content = StaticContent::default();
    h.service
        .run_job("job-8", metadata(), &content, SIMPLE_JOB.as_bytes(), false)
        .await
        .unwrap();

    let mut rx = h
        .service
        .listen("job-8", false, LogListenMode::Raw)
        .await
        .unwrap();

    let first = rx.recv().await.unwrap();
    match first {
        kiln_application::ListenEvent::Slice(evt) => {
            assert_eq!(evt.name, "preparing");
            assert_eq!(evt.payload, "job preparation");
        }
        other => panic!("expected a slice event, got {other:?}"),
    }
}
